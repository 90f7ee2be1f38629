use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Event, Metrics, Trace, Workflow};

/// Message types carried by the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Event,
    Metrics,
    Workflow,
    Trace,
    Error,
}

impl MessageKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "event" => Some(MessageKind::Event),
            "metrics" => Some(MessageKind::Metrics),
            "workflow" => Some(MessageKind::Workflow),
            "trace" => Some(MessageKind::Trace),
            "error" => Some(MessageKind::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Event => "event",
            MessageKind::Metrics => "metrics",
            MessageKind::Workflow => "workflow",
            MessageKind::Trace => "trace",
            MessageKind::Error => "error",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{ type, payload, timestamp }` as sent by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not a JSON envelope: {0}")]
    Json(#[source] serde_json::Error),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("`{handler}` handler received a `{kind}` envelope")]
    HandlerMismatch { handler: String, kind: MessageKind },
    #[error("`{0}` envelope has no payload")]
    MissingPayload(MessageKind),
    #[error("malformed `{kind}` payload: {source}")]
    Payload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

/// A typed incremental update, ready to be merged into the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Incremental {
    Event(Event),
    Metrics(Metrics),
    Workflow(Workflow),
    Trace(Trace),
    Error(String),
}

impl Incremental {
    pub fn kind(&self) -> MessageKind {
        match self {
            Incremental::Event(_) => MessageKind::Event,
            Incremental::Metrics(_) => MessageKind::Metrics,
            Incremental::Workflow(_) => MessageKind::Workflow,
            Incremental::Trace(_) => MessageKind::Trace,
            Incremental::Error(_) => MessageKind::Error,
        }
    }

    /// Decode one push frame.
    ///
    /// `handler` is the channel-level message name when the transport carries
    /// one (the SSE `event:` field). The SSE default name `message` and an
    /// empty name defer to the envelope's own `type`.
    pub fn decode(handler: Option<&str>, data: &str) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_str(data).map_err(DecodeError::Json)?;
        Self::from_envelope(handler, envelope)
    }

    pub fn from_envelope(handler: Option<&str>, envelope: Envelope) -> Result<Self, DecodeError> {
        let kind = MessageKind::parse(&envelope.kind)
            .ok_or_else(|| DecodeError::UnknownType(envelope.kind.clone()))?;
        if let Some(handler) = handler
            .map(str::trim)
            .filter(|h| !h.is_empty() && *h != "message")
        {
            if handler != kind.as_str() {
                return Err(DecodeError::HandlerMismatch {
                    handler: handler.to_string(),
                    kind,
                });
            }
        }
        let payload = envelope
            .payload
            .ok_or(DecodeError::MissingPayload(kind))?;
        let payload_err = |source| DecodeError::Payload { kind, source };
        Ok(match kind {
            MessageKind::Event => {
                Incremental::Event(serde_json::from_value(payload).map_err(payload_err)?)
            }
            MessageKind::Metrics => {
                Incremental::Metrics(serde_json::from_value(payload).map_err(payload_err)?)
            }
            MessageKind::Workflow => {
                Incremental::Workflow(serde_json::from_value(payload).map_err(payload_err)?)
            }
            MessageKind::Trace => {
                Incremental::Trace(serde_json::from_value(payload).map_err(payload_err)?)
            }
            MessageKind::Error => Incremental::Error(error_text(payload)),
        })
    }
}

fn error_text(payload: Value) -> String {
    match payload {
        Value::String(s) => s,
        Value::Object(ref map) => map
            .get("message")
            .or_else(|| map.get("error"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string()),
        other => other.to_string(),
    }
}
