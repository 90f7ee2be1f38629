//! In-memory transports.
//!
//! Used by the test suites and by the dashboard's offline replay mode. Both
//! record how often they were called so reconnection and polling schedules
//! can be asserted on.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flowscope_protocol::Resource;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::transport::{FrameStream, PushFrame, PushTransport, SnapshotTransport, TransportError};

/// Canned snapshot responses keyed by route. Unknown routes answer `null`.
#[derive(Default)]
pub struct MemorySnapshots {
    routes: Mutex<HashMap<String, Result<Value, TransportError>>>,
    calls: Mutex<HashMap<String, usize>>,
    latency: Mutex<Option<Duration>>,
}

impl MemorySnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, resource: Resource, value: Value) -> Self {
        self.set(resource, value);
        self
    }

    pub fn set(&self, resource: Resource, value: Value) {
        self.routes
            .lock()
            .insert(resource.path().to_string(), Ok(value));
    }

    pub fn fail(&self, resource: Resource, err: TransportError) {
        self.routes
            .lock()
            .insert(resource.path().to_string(), Err(err));
    }

    /// Delay every response, to keep requests in flight.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn calls(&self, resource: Resource) -> usize {
        self.calls
            .lock()
            .get(resource.path())
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl SnapshotTransport for MemorySnapshots {
    async fn get_json(&self, path: &str) -> Result<Value, TransportError> {
        *self.calls.lock().entry(path.to_string()).or_default() += 1;
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.routes
            .lock()
            .get(path)
            .cloned()
            .unwrap_or(Ok(Value::Null))
    }
}

/// Outcome of one scripted connection attempt.
#[derive(Debug, Clone)]
pub enum Attempt {
    /// The attempt fails immediately.
    Fail(TransportError),
    /// The attempt never completes (exercises the connect timeout).
    Hang,
    /// The connection opens, delivers `frames`, then closes unless `hold_open`
    /// is set; a held connection takes further frames through
    /// [`ScriptedPush::push`].
    Serve {
        frames: Vec<PushFrame>,
        hold_open: bool,
    },
}

/// Push transport that plays back a script of connection attempts.
/// Once the script is exhausted every attempt is refused.
#[derive(Default)]
pub struct ScriptedPush {
    script: Mutex<VecDeque<Attempt>>,
    live: Mutex<Option<mpsc::UnboundedSender<Result<PushFrame, TransportError>>>>,
    resumes: Mutex<Vec<Option<String>>>,
    opens: AtomicUsize,
}

impl ScriptedPush {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, attempt: Attempt) -> Self {
        self.script.lock().push_back(attempt);
        self
    }

    pub fn then_fail(self, reason: &str) -> Self {
        self.then(Attempt::Fail(TransportError::Request(reason.to_string())))
    }

    pub fn then_serve(self, frames: Vec<PushFrame>) -> Self {
        self.then(Attempt::Serve {
            frames,
            hold_open: false,
        })
    }

    pub fn then_hold(self, frames: Vec<PushFrame>) -> Self {
        self.then(Attempt::Serve {
            frames,
            hold_open: true,
        })
    }

    /// Append to the script after construction.
    pub fn enqueue(&self, attempt: Attempt) {
        self.script.lock().push_back(attempt);
    }

    /// Deliver a frame on the held connection. Returns `false` when no
    /// connection is open.
    pub fn push(&self, frame: PushFrame) -> bool {
        match self.live.lock().as_ref() {
            Some(tx) => tx.send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    /// Close the held connection from the server side.
    pub fn close(&self) {
        self.live.lock().take();
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Resume cursor passed to each `open` call, in order.
    pub fn resume_cursors(&self) -> Vec<Option<String>> {
        self.resumes.lock().clone()
    }
}

#[async_trait::async_trait]
impl PushTransport for ScriptedPush {
    async fn open(&self, resume_from: Option<&str>) -> Result<FrameStream, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.resumes.lock().push(resume_from.map(str::to_string));
        let attempt = self.script.lock().pop_front();
        match attempt {
            None => Err(TransportError::Request("connection refused".to_string())),
            Some(Attempt::Fail(err)) => Err(err),
            Some(Attempt::Hang) => futures_util::future::pending().await,
            Some(Attempt::Serve { frames, hold_open }) => {
                let (tx, rx) = mpsc::unbounded_channel();
                for frame in frames {
                    let _ = tx.send(Ok(frame));
                }
                if hold_open {
                    *self.live.lock() = Some(tx);
                }
                Ok(UnboundedReceiverStream::new(rx).boxed())
            }
        }
    }
}
