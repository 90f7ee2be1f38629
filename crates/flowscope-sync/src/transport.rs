//! Transport seams for the two consistency sources.
//!
//! The core never talks to the network directly; it goes through these
//! traits so the HTTP/SSE implementation and the in-memory one are
//! interchangeable.

use futures_util::stream::BoxStream;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("connection closed")]
    Closed,
    #[error("timed out after {0} ms")]
    Timeout(u64),
}

/// One message from the push channel, before envelope decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushFrame {
    /// Channel-level message name (SSE `event:` field), if any.
    pub event: Option<String>,
    pub data: String,
    /// Resume cursor (SSE `id:` field), if any.
    pub id: Option<String>,
}

impl PushFrame {
    pub fn new(event: Option<&str>, data: impl Into<String>) -> Self {
        Self {
            event: event.map(str::to_string),
            data: data.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Frames of one open push connection; the stream ends when the server closes.
pub type FrameStream = BoxStream<'static, Result<PushFrame, TransportError>>;

/// Request/response access to snapshot routes.
#[async_trait::async_trait]
pub trait SnapshotTransport: Send + Sync {
    /// GET `path` (relative to the configured base) and return the JSON body.
    /// Non-success statuses are errors.
    async fn get_json(&self, path: &str) -> Result<Value, TransportError>;
}

/// Long-lived push connection.
#[async_trait::async_trait]
pub trait PushTransport: Send + Sync {
    /// Open a connection. `resume_from` is the last frame id seen on a
    /// previous connection, for backends that can replay from a cursor.
    async fn open(&self, resume_from: Option<&str>) -> Result<FrameStream, TransportError>;
}
