//! Data model shared by the snapshot endpoints and the push channel of the
//! workflow backend.
//!
//! Every entity keeps the fields it does not model in a flattened `extra` map,
//! and those come back verbatim when re-encoded. Modelled fields are
//! normalised on decode: numbers take their declared type, numeric ids become
//! strings, timestamps are written as RFC3339, a missing collection is empty,
//! `null` counters are absent and an unparseable optional timestamp is
//! dropped. Decoding the re-encoded form yields a value equal to the first
//! decode.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod envelope;
mod ident;
pub mod timestamp;

pub use envelope::{DecodeError, Envelope, Incremental, MessageKind};

/// Entities that are unique by an opaque id inside their collection.
pub trait Keyed {
    fn key(&self) -> &str;
}

/// Aggregate backend counters. Replaced wholesale on every update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_workflows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_workflows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_executions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_executions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_executions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_duration_ms: Option<f64>,
    /// Percentage in `0..=100`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Paused,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Running,
    Completed,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    #[serde(deserialize_with = "ident::deserialize")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(deserialize_with = "ident::deserialize")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Graph nodes in display order.
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One execution of a workflow with its own append-only event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    #[serde(deserialize_with = "ident::deserialize")]
    pub id: String,
    #[serde(
        default,
        deserialize_with = "ident::option::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(with = "timestamp")]
    pub start_time: DateTime<Utc>,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: TraceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Immutable backend event as it appears in the debugging feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(deserialize_with = "ident::deserialize")]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(
        default,
        deserialize_with = "ident::option::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub workflow_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "ident::option::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub trace_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "ident::option::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub node_id: Option<String>,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Keyed for Workflow {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Trace {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Event {
    fn key(&self) -> &str {
        &self.id
    }
}

/// The three request/response resources exposed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Metrics,
    Workflows,
    Traces,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Metrics, Resource::Workflows, Resource::Traces];

    /// Path of the snapshot route, relative to the configured base address.
    pub fn path(self) -> &'static str {
        match self {
            Resource::Metrics => "/api/metrics",
            Resource::Workflows => "/api/workflows",
            Resource::Traces => "/api/traces",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Metrics => "metrics",
            Resource::Workflows => "workflows",
            Resource::Traces => "traces",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full, authoritative state of one resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Metrics(Option<Metrics>),
    Workflows(Vec<Workflow>),
    Traces(Vec<Trace>),
}

impl Snapshot {
    pub fn resource(&self) -> Resource {
        match self {
            Snapshot::Metrics(_) => Resource::Metrics,
            Snapshot::Workflows(_) => Resource::Workflows,
            Snapshot::Traces(_) => Resource::Traces,
        }
    }

    /// Decode a snapshot response body.
    ///
    /// A backend answering `null` (or any other non-object/non-array shape)
    /// yields an absent metrics record or an empty collection. Collection
    /// entries that do not decode are skipped one by one; only a metrics
    /// object with mistyped fields is an error.
    pub fn from_value(resource: Resource, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match resource {
            Resource::Metrics => match value {
                Value::Object(_) => Snapshot::Metrics(Some(serde_json::from_value(value)?)),
                _ => Snapshot::Metrics(None),
            },
            Resource::Workflows => Snapshot::Workflows(decode_entries(value)),
            Resource::Traces => Snapshot::Traces(decode_entries(value)),
        })
    }
}

fn decode_entries<T: serde::de::DeserializeOwned>(value: Value) -> Vec<T> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::debug!(error = %err, "skipping malformed snapshot entry");
                    None
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}
