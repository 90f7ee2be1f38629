//! In-memory source of truth for one viewing session.
//!
//! The store is a plain data structure: it is mutated only by the session
//! dispatcher, one update at a time, and never suspends.

use std::collections::VecDeque;

use flowscope_protocol::{Event, Incremental, Keyed, Metrics, Snapshot, Trace, Workflow};

pub const DEFAULT_EVENT_FEED_CAP: usize = 100;
pub const DEFAULT_TRACE_CAP: usize = 50;

/// Bounds applied to the incremental collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub event_feed_cap: usize,
    pub trace_cap: usize,
    /// Drop an incoming event whose id is already in the retained feed.
    pub dedupe_events: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            event_feed_cap: DEFAULT_EVENT_FEED_CAP,
            trace_cap: DEFAULT_TRACE_CAP,
            dedupe_events: false,
        }
    }
}

/// What an incremental update did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// New entry prepended (or metrics replaced).
    Inserted,
    /// Existing entry replaced in place.
    Replaced,
    /// Event already present in the feed; nothing changed.
    Duplicate,
    /// Server error surfaced to the session error; entities untouched.
    Flagged,
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationStore {
    metrics: Option<Metrics>,
    workflows: Vec<Workflow>,
    traces: Vec<Trace>,
    events: VecDeque<Event>,
    error: Option<String>,
    retention: RetentionPolicy,
}

impl ReconciliationStore {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            events: VecDeque::with_capacity(retention.event_feed_cap),
            retention,
            ..Self::default()
        }
    }

    /// Wholesale replacement of one resource. A snapshot is authoritative:
    /// entries streamed in before it are discarded.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) {
        match snapshot {
            Snapshot::Metrics(metrics) => self.metrics = metrics,
            Snapshot::Workflows(workflows) => self.workflows = workflows,
            Snapshot::Traces(traces) => self.traces = traces,
        }
    }

    pub fn apply_incremental(&mut self, message: Incremental) -> Merge {
        match message {
            Incremental::Event(event) => self.push_event(event),
            Incremental::Metrics(metrics) => {
                self.metrics = Some(metrics);
                Merge::Inserted
            }
            Incremental::Workflow(workflow) => upsert(&mut self.workflows, workflow),
            Incremental::Trace(trace) => {
                let merge = upsert(&mut self.traces, trace);
                if merge == Merge::Inserted {
                    self.traces.truncate(self.retention.trace_cap);
                }
                merge
            }
            Incremental::Error(message) => {
                self.error = Some(message);
                Merge::Flagged
            }
        }
    }

    fn push_event(&mut self, event: Event) -> Merge {
        if self.retention.dedupe_events && self.events.iter().any(|e| e.id == event.id) {
            return Merge::Duplicate;
        }
        self.events.push_front(event);
        self.events.truncate(self.retention.event_feed_cap);
        Merge::Inserted
    }

    pub fn set_error(&mut self, error: Option<String>) {
        self.error = error;
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    /// Workflows in visible order (new entries first).
    pub fn workflows(&self) -> &[Workflow] {
        &self.workflows
    }

    /// Traces, most recently inserted first.
    pub fn traces(&self) -> &[Trace] {
        &self.traces
    }

    /// Event feed, newest first.
    pub fn events(&self) -> &VecDeque<Event> {
        &self.events
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }
}

/// Replace in place when the id is known, otherwise prepend.
fn upsert<T: Keyed>(items: &mut Vec<T>, item: T) -> Merge {
    match items.iter().position(|existing| existing.key() == item.key()) {
        Some(index) => {
            items[index] = item;
            Merge::Replaced
        }
        None => {
            items.insert(0, item);
            Merge::Inserted
        }
    }
}
