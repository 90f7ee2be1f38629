//! One viewing session: store, dispatcher, fetcher, stream client and mode
//! controller wired together behind a small command surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flowscope_protocol::{Event, Metrics, Trace, Workflow};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::dispatch::{self, SyncState, UpdateSink, UPDATE_QUEUE_DEPTH};
use crate::fetcher::{RefreshReport, SnapshotFetcher};
use crate::http::{HttpSnapshotTransport, SseTransport};
use crate::mode::{FreshnessMode, ModeController};
use crate::store::ReconciliationStore;
use crate::stream::{ConnectionState, StreamClient};
use crate::transport::{PushTransport, SnapshotTransport, TransportError};

/// Point-in-time copy of everything a dashboard renders.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub metrics: Option<Metrics>,
    pub workflows: Vec<Workflow>,
    pub traces: Vec<Trace>,
    /// Newest first.
    pub events: Vec<Event>,
    pub connected: bool,
    pub connection_status: String,
    pub connection: ConnectionState,
    pub mode: FreshnessMode,
    pub loading: bool,
    pub error: Option<String>,
}

pub struct Session {
    state: Arc<RwLock<SyncState>>,
    fetcher: Arc<SnapshotFetcher>,
    stream: StreamClient,
    mode: ModeController,
    alive: Arc<AtomicBool>,
    version: Arc<watch::Sender<u64>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Build a session over the given transports. Nothing is fetched or
    /// connected until [`Session::start`]. Must be called within a tokio runtime.
    pub fn create(
        config: SyncConfig,
        snapshots: Arc<dyn SnapshotTransport>,
        push: Arc<dyn PushTransport>,
    ) -> Self {
        let store = ReconciliationStore::new(config.retention_policy());
        let state = Arc::new(RwLock::new(SyncState::new(store)));
        let alive = Arc::new(AtomicBool::new(true));
        let (version, _) = watch::channel(0u64);
        let version = Arc::new(version);

        let (sink, rx) = UpdateSink::channel(UPDATE_QUEUE_DEPTH);
        let dispatcher = tokio::spawn(dispatch::run(
            rx,
            Arc::clone(&state),
            Arc::clone(&alive),
            Arc::clone(&version),
        ));

        let fetcher = Arc::new(SnapshotFetcher::new(snapshots, sink.clone()));
        let stream = StreamClient::new(push, config.reconnect_policy(), sink);
        let mode = ModeController::new(
            Arc::clone(&fetcher),
            stream.subscribe(),
            config.poll_interval(),
        );
        let forwarder = tokio::spawn(forward_changes(
            stream.subscribe(),
            mode.subscribe(),
            Arc::clone(&version),
        ));

        Self {
            state,
            fetcher,
            stream,
            mode,
            alive,
            version,
            tasks: Mutex::new(vec![dispatcher, forwarder]),
        }
    }

    /// Session over the HTTP snapshot routes and the SSE push channel.
    pub fn from_config(config: SyncConfig) -> Result<Self, TransportError> {
        let snapshots = Arc::new(HttpSnapshotTransport::from_config(&config.endpoint)?);
        let push = Arc::new(SseTransport::from_config(&config.endpoint)?);
        info!(
            base = %config.endpoint.base_url,
            stream = %config.endpoint.stream_url(),
            "session configured"
        );
        Ok(Self::create(config, snapshots, push))
    }

    /// Run the initial full refresh, then open the push channel and start the
    /// mode controller. Pushed messages always land on top of the snapshot.
    pub async fn start(&self) -> RefreshReport {
        let report = self.refresh_all().await;
        if self.is_alive() {
            self.stream.connect();
            self.mode.start();
        }
        report
    }

    pub fn view(&self) -> SessionView {
        let connection = self.stream.state();
        let guard = self.state.read();
        SessionView {
            metrics: guard.store.metrics().cloned(),
            workflows: guard.store.workflows().to_vec(),
            traces: guard.store.traces().to_vec(),
            events: guard.store.events().iter().cloned().collect(),
            connected: connection.is_connected(),
            connection_status: connection.to_string(),
            mode: self.mode.mode(),
            loading: guard.loading,
            error: guard.store.error().map(str::to_string),
            connection,
        }
    }

    /// Version counter bumped on every applied update and on every
    /// connection or mode transition.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn connection(&self) -> ConnectionState {
        self.stream.state()
    }

    pub fn mode(&self) -> FreshnessMode {
        self.mode.mode()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub async fn refresh_all(&self) -> RefreshReport {
        if !self.is_alive() {
            return RefreshReport {
                discarded: true,
                ..RefreshReport::default()
            };
        }
        self.fetcher.refresh_all().await
    }

    pub fn connect(&self) {
        if self.is_alive() {
            self.stream.connect();
        }
    }

    pub fn disconnect(&self) {
        self.stream.disconnect();
    }

    /// Stop everything. Results still in flight are discarded; safe to call
    /// more than once.
    pub fn teardown(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        self.mode.stop();
        self.stream.disconnect();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.state.write().loading = false;
        debug!("session torn down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn forward_changes(
    mut connection: watch::Receiver<ConnectionState>,
    mut mode: watch::Receiver<FreshnessMode>,
    version: Arc<watch::Sender<u64>>,
) {
    loop {
        let changed = tokio::select! {
            r = connection.changed() => r,
            r = mode.changed() => r,
        };
        if changed.is_err() {
            return;
        }
        version.send_modify(|v| *v = v.wrapping_add(1));
    }
}
