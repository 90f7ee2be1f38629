//! Request/response retrieval of full resource snapshots.
//!
//! No retries happen here; the mode controller's polling cadence is the
//! retry policy.

use std::sync::Arc;

use flowscope_protocol::{Resource, Snapshot};
use tracing::{debug, warn};

use crate::dispatch::{StoreUpdate, UpdateSink};
use crate::transport::{SnapshotTransport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to fetch {resource}: {cause}")]
pub struct FetchError {
    pub resource: Resource,
    #[source]
    pub cause: TransportError,
}

/// Outcome of [`SnapshotFetcher::refresh_all`].
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    pub applied: Vec<Resource>,
    pub failures: Vec<FetchError>,
    /// The session was torn down before the results could be applied.
    pub discarded: bool,
}

impl RefreshReport {
    pub fn is_complete(&self) -> bool {
        !self.discarded && self.failures.is_empty()
    }

    pub fn failed(&self, resource: Resource) -> bool {
        self.failures.iter().any(|f| f.resource == resource)
    }
}

pub struct SnapshotFetcher {
    transport: Arc<dyn SnapshotTransport>,
    sink: UpdateSink,
}

impl SnapshotFetcher {
    pub fn new(transport: Arc<dyn SnapshotTransport>, sink: UpdateSink) -> Self {
        Self { transport, sink }
    }

    async fn retrieve(&self, resource: Resource) -> Result<Snapshot, FetchError> {
        let value = self
            .transport
            .get_json(resource.path())
            .await
            .map_err(|cause| FetchError { resource, cause })?;
        Snapshot::from_value(resource, value).map_err(|err| FetchError {
            resource,
            cause: TransportError::Decode(err.to_string()),
        })
    }

    /// Fetch one resource and push it into the store as a full replacement.
    /// On failure the store keeps its prior value and the session error is set.
    pub async fn fetch_snapshot(&self, resource: Resource) -> Result<Snapshot, FetchError> {
        let result = self.retrieve(resource).await;
        let update = match &result {
            Ok(snapshot) => StoreUpdate::Snapshot(snapshot.clone()),
            Err(err) => {
                warn!(%resource, error = %err.cause, "snapshot fetch failed");
                StoreUpdate::FetchFailed(err.to_string())
            }
        };
        if !self.sink.apply(update).await {
            debug!(%resource, "session gone; snapshot discarded");
        }
        result
    }

    /// Issue all three snapshot requests concurrently and apply whatever
    /// succeeded once every request has settled.
    pub async fn refresh_all(&self) -> RefreshReport {
        self.sink.send(StoreUpdate::RefreshStarted).await;
        let (metrics, workflows, traces) = tokio::join!(
            self.retrieve(Resource::Metrics),
            self.retrieve(Resource::Workflows),
            self.retrieve(Resource::Traces),
        );

        let mut report = RefreshReport::default();
        let mut snapshots = Vec::with_capacity(3);
        for result in [metrics, workflows, traces] {
            match result {
                Ok(snapshot) => {
                    report.applied.push(snapshot.resource());
                    snapshots.push(snapshot);
                }
                Err(err) => {
                    warn!(resource = %err.resource, error = %err.cause, "snapshot fetch failed");
                    report.failures.push(err);
                }
            }
        }

        let failures = report.failures.iter().map(ToString::to_string).collect();
        if !self
            .sink
            .apply(StoreUpdate::RefreshSettled {
                snapshots,
                failures,
            })
            .await
        {
            debug!("session gone; refresh results discarded");
            report.applied.clear();
            report.discarded = true;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::draining_sink;
    use crate::memory::MemorySnapshots;
    use serde_json::json;

    #[tokio::test]
    async fn partial_failure_reports_failed_resource() {
        let transport = Arc::new(
            MemorySnapshots::new()
                .with(Resource::Workflows, json!([{"id": "w1"}]))
                .with(Resource::Traces, json!([])),
        );
        transport.fail(Resource::Metrics, TransportError::Status(503));
        let fetcher = SnapshotFetcher::new(transport.clone(), draining_sink());

        let report = fetcher.refresh_all().await;
        assert!(report.failed(Resource::Metrics));
        assert_eq!(report.applied, vec![Resource::Workflows, Resource::Traces]);
        assert_eq!(
            report.failures[0].to_string(),
            "failed to fetch metrics: unexpected status 503"
        );
        for resource in Resource::ALL {
            assert_eq!(transport.calls(resource), 1);
        }
    }

    #[tokio::test]
    async fn null_payload_is_an_empty_snapshot() {
        let transport = Arc::new(MemorySnapshots::new().with(Resource::Traces, json!(null)));
        let fetcher = SnapshotFetcher::new(transport, draining_sink());
        let snapshot = fetcher.fetch_snapshot(Resource::Traces).await.unwrap();
        assert_eq!(snapshot, Snapshot::Traces(Vec::new()));
    }

    #[tokio::test]
    async fn mistyped_metrics_is_a_decode_failure() {
        let transport = Arc::new(
            MemorySnapshots::new().with(Resource::Metrics, json!({"active_workflows": "lots"})),
        );
        let fetcher = SnapshotFetcher::new(transport, draining_sink());
        let err = fetcher.fetch_snapshot(Resource::Metrics).await.unwrap_err();
        assert_eq!(err.resource, Resource::Metrics);
        assert!(matches!(err.cause, TransportError::Decode(_)));
    }

    #[tokio::test]
    async fn closed_sink_marks_report_discarded() {
        let (sink, rx) = UpdateSink::channel(4);
        drop(rx);
        let fetcher = SnapshotFetcher::new(Arc::new(MemorySnapshots::new()), sink);
        let report = fetcher.refresh_all().await;
        assert!(report.discarded);
        assert!(report.applied.is_empty());
        assert!(!report.is_complete());
    }
}
