//! Single-consumer update queue in front of the store.
//!
//! Both writers (snapshot fetcher and stream client) hand their results to an
//! [`UpdateSink`]; one dispatcher task drains the queue and applies updates
//! strictly one after another, so store mutations never overlap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flowscope_protocol::{Incremental, Snapshot};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

use crate::store::{Merge, ReconciliationStore};

pub(crate) const UPDATE_QUEUE_DEPTH: usize = 256;

#[derive(Debug)]
pub enum StoreUpdate {
    /// One push message, merged per its type.
    Incremental(Incremental),
    /// A single resource fetched outside of a full refresh.
    Snapshot(Snapshot),
    /// A single-resource fetch failed; prior state stays.
    FetchFailed(String),
    /// A full refresh was issued: raise `loading` and clear the session error.
    RefreshStarted,
    /// All three refresh requests settled.
    RefreshSettled {
        snapshots: Vec<Snapshot>,
        failures: Vec<String>,
    },
}

#[derive(Debug)]
pub(crate) struct Dispatch {
    pub(crate) update: StoreUpdate,
    pub(crate) done: Option<oneshot::Sender<()>>,
}

/// Write side of the update queue.
#[derive(Debug, Clone)]
pub struct UpdateSink {
    tx: mpsc::Sender<Dispatch>,
}

impl UpdateSink {
    pub(crate) fn channel(depth: usize) -> (Self, mpsc::Receiver<Dispatch>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    /// Enqueue without waiting for the update to be applied.
    /// Returns `false` once the session has been torn down.
    pub async fn send(&self, update: StoreUpdate) -> bool {
        self.tx.send(Dispatch { update, done: None }).await.is_ok()
    }

    /// Enqueue and wait until the dispatcher has applied the update.
    /// Returns `false` if the update was discarded.
    pub async fn apply(&self, update: StoreUpdate) -> bool {
        let (done, applied) = oneshot::channel();
        let dispatch = Dispatch {
            update,
            done: Some(done),
        };
        if self.tx.send(dispatch).await.is_err() {
            return false;
        }
        applied.await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Everything the dispatcher owns besides the connection state.
#[derive(Debug, Default)]
pub(crate) struct SyncState {
    pub(crate) store: ReconciliationStore,
    pub(crate) loading: bool,
}

impl SyncState {
    pub(crate) fn new(store: ReconciliationStore) -> Self {
        Self {
            store,
            loading: false,
        }
    }

    fn apply(&mut self, update: StoreUpdate) {
        match update {
            StoreUpdate::Incremental(message) => {
                let kind = message.kind();
                let merge = self.store.apply_incremental(message);
                if merge == Merge::Duplicate {
                    debug!(%kind, "duplicate event dropped");
                } else {
                    trace!(%kind, ?merge, "incremental applied");
                }
            }
            StoreUpdate::Snapshot(snapshot) => {
                trace!(resource = %snapshot.resource(), "snapshot applied");
                self.store.apply_snapshot(snapshot);
            }
            StoreUpdate::FetchFailed(message) => self.store.set_error(Some(message)),
            StoreUpdate::RefreshStarted => {
                self.loading = true;
                self.store.set_error(None);
            }
            StoreUpdate::RefreshSettled {
                snapshots,
                failures,
            } => {
                for snapshot in snapshots {
                    self.store.apply_snapshot(snapshot);
                }
                if !failures.is_empty() {
                    self.store.set_error(Some(failures.join("; ")));
                }
                self.loading = false;
            }
        }
    }
}

/// Drain the queue until every sink is dropped or the session dies.
/// Updates still queued at teardown are discarded unapplied.
pub(crate) async fn run(
    mut rx: mpsc::Receiver<Dispatch>,
    state: Arc<RwLock<SyncState>>,
    alive: Arc<AtomicBool>,
    version: Arc<watch::Sender<u64>>,
) {
    while let Some(Dispatch { update, done }) = rx.recv().await {
        if !alive.load(Ordering::SeqCst) {
            debug!("session torn down; discarding queued updates");
            break;
        }
        state.write().apply(update);
        version.send_modify(|v| *v = v.wrapping_add(1));
        if let Some(done) = done {
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
pub(crate) fn draining_sink() -> UpdateSink {
    let (sink, mut rx) = UpdateSink::channel(UPDATE_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(Dispatch { done, .. }) = rx.recv().await {
            if let Some(done) = done {
                let _ = done.send(());
            }
        }
    });
    sink
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowscope_protocol::Resource;
    use serde_json::json;

    fn spawn_dispatcher() -> (UpdateSink, Arc<RwLock<SyncState>>, Arc<AtomicBool>) {
        let (sink, rx) = UpdateSink::channel(8);
        let state = Arc::new(RwLock::new(SyncState::default()));
        let alive = Arc::new(AtomicBool::new(true));
        let (version, _) = watch::channel(0u64);
        tokio::spawn(run(rx, state.clone(), alive.clone(), Arc::new(version)));
        (sink, state, alive)
    }

    #[tokio::test]
    async fn refresh_lifecycle_toggles_loading_and_error() {
        let (sink, state, _alive) = spawn_dispatcher();
        assert!(sink.apply(StoreUpdate::FetchFailed("stale".into())).await);
        assert!(sink.apply(StoreUpdate::RefreshStarted).await);
        {
            let guard = state.read();
            assert!(guard.loading);
            assert!(guard.store.error().is_none());
        }
        let workflows = Snapshot::from_value(Resource::Workflows, json!([{"id": "w"}])).unwrap();
        assert!(
            sink.apply(StoreUpdate::RefreshSettled {
                snapshots: vec![workflows],
                failures: vec!["failed to fetch metrics: unexpected status 502".into()],
            })
            .await
        );
        let guard = state.read();
        assert!(!guard.loading);
        assert_eq!(guard.store.workflows().len(), 1);
        assert!(guard.store.error().unwrap().contains("metrics"));
    }

    #[tokio::test]
    async fn updates_after_teardown_are_discarded() {
        let (sink, state, alive) = spawn_dispatcher();
        alive.store(false, Ordering::SeqCst);
        let snapshot = Snapshot::from_value(Resource::Workflows, json!([{"id": "w"}])).unwrap();
        assert!(!sink.apply(StoreUpdate::Snapshot(snapshot)).await);
        assert!(state.read().store.workflows().is_empty());
    }
}
