//! HTTP snapshot routes and the Server-Sent Events push channel.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;

use crate::config::EndpointConfig;
use crate::transport::{FrameStream, PushFrame, PushTransport, SnapshotTransport, TransportError};

fn with_bearer(req: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token.map(str::trim) {
        Some(t) if !t.is_empty() => req.bearer_auth(t),
        _ => req,
    }
}

fn join_url(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("{}{}", base.trim_end_matches('/'), path)
    } else {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }
}

fn request_error(err: reqwest::Error) -> TransportError {
    TransportError::Request(err.to_string())
}

pub struct HttpSnapshotTransport {
    client: Client,
    base: String,
    token: Option<String>,
}

impl HttpSnapshotTransport {
    pub fn new(
        base: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(request_error)?;
        Ok(Self {
            client,
            base: base.into(),
            token,
        })
    }

    pub fn from_config(endpoint: &EndpointConfig) -> Result<Self, TransportError> {
        Self::new(
            endpoint.base_url.clone(),
            endpoint.token.clone(),
            Duration::from_secs(endpoint.request_timeout_secs.max(1)),
        )
    }
}

#[async_trait::async_trait]
impl SnapshotTransport for HttpSnapshotTransport {
    async fn get_json(&self, path: &str) -> Result<Value, TransportError> {
        let req = self
            .client
            .get(join_url(&self.base, path))
            .header(ACCEPT, "application/json");
        let resp = with_bearer(req, self.token.as_deref())
            .send()
            .await
            .map_err(request_error)?;
        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status().as_u16()));
        }
        resp.json()
            .await
            .map_err(|err| TransportError::Decode(err.to_string()))
    }
}

/// Push channel over `text/event-stream`.
pub struct SseTransport {
    client: Client,
    url: String,
    token: Option<String>,
}

impl SseTransport {
    /// The client carries no overall timeout: the response body is the
    /// stream. The connect timeout is enforced by the stream client.
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self, TransportError> {
        let client = Client::builder().build().map_err(request_error)?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }

    pub fn from_config(endpoint: &EndpointConfig) -> Result<Self, TransportError> {
        Self::new(endpoint.stream_url(), endpoint.token.clone())
    }
}

#[async_trait::async_trait]
impl PushTransport for SseTransport {
    async fn open(&self, resume_from: Option<&str>) -> Result<FrameStream, TransportError> {
        let mut req = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream");
        if let Some(since) = resume_from {
            req = req.header("Last-Event-ID", since);
        }
        let resp = with_bearer(req, self.token.as_deref())
            .send()
            .await
            .map_err(request_error)?;
        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status().as_u16()));
        }

        let body = Box::pin(resp.bytes_stream());
        let frames = futures_util::stream::unfold(
            (body, SseReader::new(MAX_BUFFERED_BYTES), VecDeque::new(), false),
            |(mut body, mut reader, mut ready, mut done)| async move {
                loop {
                    if let Some(frame) = ready.pop_front() {
                        return Some((Ok(frame), (body, reader, ready, done)));
                    }
                    if done {
                        return None;
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => match reader.feed(&chunk) {
                            Ok(frames) => ready.extend(frames),
                            Err(err) => return Some((Err(err), (body, reader, ready, true))),
                        },
                        Some(Err(err)) => {
                            return Some((Err(request_error(err)), (body, reader, ready, true)));
                        }
                        None => done = true,
                    }
                }
            },
        );
        Ok(frames.boxed())
    }
}

/// Upper bound on bytes held for an unfinished line plus an undispatched
/// frame. Exceeding it drops the connection.
pub(crate) const MAX_BUFFERED_BYTES: usize = 1 << 20;

/// Fields collected since the last blank line.
#[derive(Default)]
struct PendingFrame {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    bytes: usize,
}

impl PendingFrame {
    fn field(&mut self, name: &[u8], value: String) {
        match name {
            b"event" => self.event = Some(value.trim().to_string()),
            b"data" => {
                self.bytes += value.len();
                self.data.push(value);
            }
            b"id" if !value.is_empty() => self.id = Some(value.trim().to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<PushFrame> {
        let pending = std::mem::take(self);
        if pending.event.is_none() && pending.data.is_empty() && pending.id.is_none() {
            return None;
        }
        Some(PushFrame {
            event: pending.event,
            data: pending.data.join("\n"),
            id: pending.id,
        })
    }
}

/// Push-style `text/event-stream` parser: feed it body chunks, get back the
/// frames they complete.
pub(crate) struct SseReader {
    partial: Vec<u8>,
    frame: PendingFrame,
    limit: usize,
}

impl SseReader {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            partial: Vec::new(),
            frame: PendingFrame::default(),
            limit,
        }
    }

    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Result<Vec<PushFrame>, TransportError> {
        let mut frames = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];
            if self.partial.is_empty() {
                self.line(head, &mut frames);
            } else {
                let mut line = std::mem::take(&mut self.partial);
                line.extend_from_slice(head);
                self.line(&line, &mut frames);
            }
        }
        self.partial.extend_from_slice(rest);
        let buffered = self.partial.len() + self.frame.bytes;
        if buffered > self.limit {
            return Err(TransportError::Decode(format!(
                "event stream buffered {buffered} bytes without a frame boundary (limit {})",
                self.limit
            )));
        }
        Ok(frames)
    }

    fn line(&mut self, raw: &[u8], out: &mut Vec<PushFrame>) {
        let line = raw.strip_suffix(b"\r").unwrap_or(raw);
        match line.first() {
            None => out.extend(self.frame.dispatch()),
            Some(b':') => {}
            Some(_) => {
                let (name, value) = match line.iter().position(|&b| b == b':') {
                    Some(idx) => (&line[..idx], &line[idx + 1..]),
                    None => (line, &b""[..]),
                };
                let value = value.strip_prefix(b" ").unwrap_or(value);
                self.frame
                    .field(name, String::from_utf8_lossy(value).into_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn sse_reader_assembles_frames_across_chunks() {
        let mut reader = SseReader::new(MAX_BUFFERED_BYTES);
        let frames = reader
            .feed(b": keepalive\n\nevent: workflow\r\nid: 7\r\nda")
            .unwrap();
        assert!(frames.is_empty());
        let frames = reader
            .feed(b"ta: {\"type\":\"workflow\",\r\ndata: \"payload\":{}}\r\n\r\n")
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("workflow"));
        assert_eq!(frames[0].id.as_deref(), Some("7"));
        assert_eq!(frames[0].data, "{\"type\":\"workflow\",\n\"payload\":{}}");
    }

    #[test]
    fn sse_reader_yields_every_frame_in_a_chunk() {
        let mut reader = SseReader::new(MAX_BUFFERED_BYTES);
        let frames = reader.feed(b"data:{\"a\":1}\n\ndata: second\n\n").unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[1].data, "second");
        assert!(frames[1].event.is_none());
    }

    #[test]
    fn sse_reader_rejects_unbounded_lines_and_frames() {
        let mut reader = SseReader::new(16);
        assert!(reader.feed(b"data: 0123456").is_ok());
        let err = reader.feed(b"789abcdef").unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));

        let mut reader = SseReader::new(16);
        assert!(reader.feed(b"data: 0123456789\n").is_ok());
        assert!(reader.feed(b"data: 0123456789\n").is_err());
    }

    #[test]
    fn join_url_tolerates_slashes() {
        assert_eq!(
            join_url("http://h:1/", "/api/metrics"),
            "http://h:1/api/metrics"
        );
        assert_eq!(join_url("http://h:1", "events"), "http://h:1/events");
    }

    #[tokio::test]
    async fn snapshot_get_sends_token_and_decodes_json() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/workflows")
                    .header("authorization", "Bearer secret");
                then.status(200).json_body(json!([{"id": "wf-1"}]));
            })
            .await;
        let transport = HttpSnapshotTransport::new(
            server.base_url(),
            Some("secret".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let body = transport.get_json("/api/workflows").await.unwrap();
        assert_eq!(body, json!([{"id": "wf-1"}]));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_a_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/metrics");
                then.status(500).body("boom");
            })
            .await;
        let transport =
            HttpSnapshotTransport::new(server.base_url(), None, Duration::from_secs(5)).unwrap();
        let err = transport.get_json("/api/metrics").await.unwrap_err();
        assert_eq!(err, TransportError::Status(500));
    }

    #[tokio::test]
    async fn sse_open_yields_frames() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/events")
                    .header("accept", "text/event-stream")
                    .header("last-event-id", "9");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body("event: metrics\ndata: {\"type\":\"metrics\",\"payload\":{}}\nid: 10\n\n");
            })
            .await;
        let transport = SseTransport::new(server.url("/events"), None).unwrap();
        let mut frames = transport.open(Some("9")).await.unwrap();
        let frame = frames.next().await.unwrap().unwrap();
        assert_eq!(frame.event.as_deref(), Some("metrics"));
        assert_eq!(frame.id.as_deref(), Some("10"));
        assert!(frames.next().await.is_none());
    }
}
