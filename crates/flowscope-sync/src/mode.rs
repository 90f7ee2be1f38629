//! Live/degraded freshness switching.
//!
//! While the push channel is connected nothing polls. As soon as any other
//! connection state is observed, a full refresh runs on a fixed cadence
//! (first tick one interval after the disconnect), and the schedule is
//! dropped the moment the channel reports `Connected` again.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::fetcher::SnapshotFetcher;
use crate::stream::ConnectionState;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessMode {
    /// Not started (or stopped); nothing keeps the state fresh.
    Idle,
    /// Freshness driven by the push channel.
    Live,
    /// Freshness driven by fallback polling.
    Degraded,
}

impl FreshnessMode {
    fn for_state(state: &ConnectionState) -> Self {
        if state.is_connected() {
            FreshnessMode::Live
        } else {
            FreshnessMode::Degraded
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FreshnessMode::Idle => "idle",
            FreshnessMode::Live => "live",
            FreshnessMode::Degraded => "degraded",
        }
    }
}

pub struct ModeController {
    fetcher: Arc<SnapshotFetcher>,
    connection: watch::Receiver<ConnectionState>,
    interval: Duration,
    mode: Arc<watch::Sender<FreshnessMode>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ModeController {
    pub fn new(
        fetcher: Arc<SnapshotFetcher>,
        connection: watch::Receiver<ConnectionState>,
        interval: Duration,
    ) -> Self {
        let (mode, _) = watch::channel(FreshnessMode::Idle);
        Self {
            fetcher,
            connection,
            interval: interval.max(Duration::from_millis(1)),
            mode: Arc::new(mode),
            task: Mutex::new(None),
        }
    }

    /// Begin observing the connection. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let initial = FreshnessMode::for_state(&self.connection.borrow());
        self.mode.send_replace(initial);
        *task = Some(tokio::spawn(supervise(
            Arc::clone(&self.fetcher),
            self.connection.clone(),
            self.interval,
            Arc::clone(&self.mode),
        )));
    }

    /// Cancel any pending schedule. Terminal for the session.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.mode.send_replace(FreshnessMode::Idle);
    }

    pub fn mode(&self) -> FreshnessMode {
        *self.mode.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<FreshnessMode> {
        self.mode.subscribe()
    }
}

impl Drop for ModeController {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn supervise(
    fetcher: Arc<SnapshotFetcher>,
    mut connection: watch::Receiver<ConnectionState>,
    period: Duration,
    mode: Arc<watch::Sender<FreshnessMode>>,
) {
    loop {
        // live: idle until the channel leaves `Connected`
        loop {
            let connected = connection.borrow_and_update().is_connected();
            if !connected {
                break;
            }
            if connection.changed().await.is_err() {
                return;
            }
        }
        mode.send_replace(FreshnessMode::Degraded);
        info!(
            interval_secs = period.as_secs(),
            "push channel unavailable; polling snapshots"
        );

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = fetcher.refresh_all().await;
                    if !report.failures.is_empty() {
                        warn!(failed = report.failures.len(), "fallback refresh incomplete");
                    }
                }
                changed = connection.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if connection.borrow_and_update().is_connected() {
                        break;
                    }
                }
            }
        }
        mode.send_replace(FreshnessMode::Live);
        info!("push channel restored; polling stopped");
    }
}
