//! Push channel client.
//!
//! Owns the connection lifecycle and the reconnection policy, decodes frames
//! defensively and forwards typed messages to the update queue. The current
//! [`ConnectionState`] is published on a watch channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use flowscope_protocol::Incremental;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{StoreUpdate, UpdateSink};
use crate::transport::{FrameStream, PushTransport, TransportError};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1_000);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("Disconnected"),
            ConnectionState::Connecting => f.write_str("Connecting..."),
            ConnectionState::Connected => f.write_str("Connected"),
            ConnectionState::Error(reason) => write!(f, "Connection error: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub connect_timeout: Duration,
    /// Consecutive failed attempts tolerated before settling into `Error`.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

enum PumpEnd {
    Dropped(TransportError),
    /// The session is gone or this worker was superseded.
    Stopped,
}

struct StreamInner {
    transport: Arc<dyn PushTransport>,
    policy: ReconnectPolicy,
    sink: UpdateSink,
    state: watch::Sender<ConnectionState>,
    /// Bumped by every `connect` and `disconnect`. A worker may only publish
    /// while the epoch it was started with is still current; the check and
    /// the publish happen under this lock.
    epoch: Mutex<u64>,
    resume: Mutex<Option<String>>,
}

impl StreamInner {
    fn begin(&self) -> u64 {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        *epoch
    }

    /// Invalidate the running worker, if any, and settle on `Disconnected`.
    fn retire(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.set_state(ConnectionState::Disconnected);
    }

    fn is_current(&self, epoch: u64) -> bool {
        *self.epoch.lock() == epoch
    }

    /// Returns `false` when the worker owning `epoch` has been superseded.
    fn publish(&self, epoch: u64, next: ConnectionState) -> bool {
        let current = self.epoch.lock();
        if *current != epoch {
            return false;
        }
        self.set_state(next);
        true
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "push channel state");
            *current = next;
            true
        });
    }

    async fn run(self: Arc<Self>, epoch: u64) {
        let timeout_ms = self.policy.connect_timeout.as_millis() as u64;
        let mut failures: u32 = 0;
        loop {
            if !self.publish(epoch, ConnectionState::Connecting) {
                return;
            }
            let resume = self.resume.lock().clone();
            let opened = match tokio::time::timeout(
                self.policy.connect_timeout,
                self.transport.open(resume.as_deref()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout_ms)),
            };

            match opened {
                Ok(frames) => {
                    failures = 0;
                    if !self.publish(epoch, ConnectionState::Connected) {
                        debug!("push channel opened after disconnect; closing");
                        return;
                    }
                    info!(resumed = resume.is_some(), "push channel connected");
                    match self.pump(epoch, frames).await {
                        PumpEnd::Stopped => return,
                        PumpEnd::Dropped(reason) => {
                            info!(%reason, "push channel dropped; reconnecting");
                            if !self.publish(epoch, ConnectionState::Disconnected) {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    failures += 1;
                    warn!(
                        attempt = failures,
                        max_attempts = self.policy.max_attempts,
                        error = %err,
                        "push channel connection failed"
                    );
                    if failures >= self.policy.max_attempts {
                        warn!("reconnection attempts exhausted; waiting for an explicit connect");
                        self.publish(epoch, ConnectionState::Error(err.to_string()));
                        return;
                    }
                }
            }
            tokio::time::sleep(self.policy.delay).await;
        }
    }

    async fn pump(&self, epoch: u64, mut frames: FrameStream) -> PumpEnd {
        while let Some(item) = frames.next().await {
            if !self.is_current(epoch) {
                return PumpEnd::Stopped;
            }
            let frame = match item {
                Ok(frame) => frame,
                Err(err) => return PumpEnd::Dropped(err),
            };
            if let Some(id) = frame.id.as_ref() {
                *self.resume.lock() = Some(id.clone());
            }
            match Incremental::decode(frame.event.as_deref(), &frame.data) {
                Ok(message) => {
                    if !self.sink.send(StoreUpdate::Incremental(message)).await {
                        return PumpEnd::Stopped;
                    }
                }
                Err(err) => debug!(error = %err, "dropping push frame"),
            }
        }
        PumpEnd::Dropped(TransportError::Closed)
    }
}

pub struct StreamClient {
    inner: Arc<StreamInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamClient {
    pub fn new(transport: Arc<dyn PushTransport>, policy: ReconnectPolicy, sink: UpdateSink) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(StreamInner {
                transport,
                policy,
                sink,
                state,
                epoch: Mutex::new(0),
                resume: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the connection worker. A no-op while a worker is connecting or
    /// connected; after `Error` it starts over with a fresh attempt budget.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut worker = self.worker.lock();
        if let Some(handle) = worker.as_ref() {
            let settled = matches!(self.state(), ConnectionState::Error(_));
            if !handle.is_finished() && !settled {
                debug!("push channel already active");
                return;
            }
            handle.abort();
        }
        let epoch = self.inner.begin();
        let inner = Arc::clone(&self.inner);
        *worker = Some(tokio::spawn(inner.run(epoch)));
    }

    /// Tear the connection down immediately, cancelling any pending
    /// reconnection. Safe to call repeatedly and while connecting.
    pub fn disconnect(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
            info!("push channel disconnected");
        }
        self.inner.retire();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}
