use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::store::{RetentionPolicy, DEFAULT_EVENT_FEED_CAP, DEFAULT_TRACE_CAP};
use crate::stream::ReconnectPolicy;
use crate::util::{env_bool, env_string, env_u64};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base address the snapshot routes hang off (e.g. <http://127.0.0.1:8080>)
    pub base_url: String,
    /// Push channel address; defaults to `{base_url}/events`
    pub stream_url: Option<String>,
    /// Bearer token sent with every request
    pub token: Option<String>,
    /// Per-request timeout for snapshot reads
    #[schemars(range(min = 1))]
    pub request_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            stream_url: None,
            token: None,
            request_timeout_secs: 10,
        }
    }
}

impl EndpointConfig {
    pub fn stream_url(&self) -> String {
        match self.stream_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => format!("{}/events", self.base_url.trim_end_matches('/')),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct StreamConfig {
    #[schemars(range(min = 1))]
    pub connect_timeout_ms: u64,
    /// Consecutive failed attempts before the channel settles into `error`
    #[schemars(range(min = 1))]
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            connect_timeout_ms: policy.connect_timeout.as_millis() as u64,
            reconnect_attempts: policy.max_attempts,
            reconnect_delay_ms: policy.delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct PollingConfig {
    /// Fallback refresh cadence while the push channel is down
    #[schemars(range(min = 1))]
    pub interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: crate::mode::DEFAULT_POLL_INTERVAL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct RetentionConfig {
    #[schemars(range(min = 1))]
    pub event_feed_cap: usize,
    #[schemars(range(min = 1))]
    pub trace_cap: usize,
    /// Drop pushed events whose id is already in the feed
    pub dedupe_events: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            event_feed_cap: DEFAULT_EVENT_FEED_CAP,
            trace_cap: DEFAULT_TRACE_CAP,
            dedupe_events: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct SyncConfig {
    pub endpoint: EndpointConfig,
    pub stream: StreamConfig,
    pub polling: PollingConfig,
    pub retention: RetentionConfig,
}

impl SyncConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            connect_timeout: Duration::from_millis(self.stream.connect_timeout_ms.max(1)),
            max_attempts: self.stream.reconnect_attempts.max(1),
            delay: Duration::from_millis(self.stream.reconnect_delay_ms),
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            event_feed_cap: self.retention.event_feed_cap.max(1),
            trace_cap: self.retention.trace_cap.max(1),
            dedupe_events: self.retention.dedupe_events,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.polling.interval_secs.max(1))
    }

    /// Layer `FLOWSCOPE_*` environment variables over the loaded values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(base) = env_string("FLOWSCOPE_BASE_URL") {
            self.endpoint.base_url = base;
        }
        if let Some(stream) = env_string("FLOWSCOPE_STREAM_URL") {
            self.endpoint.stream_url = Some(stream);
        }
        if let Some(token) = env_string("FLOWSCOPE_TOKEN") {
            self.endpoint.token = Some(token);
        }
        if let Some(secs) = env_u64("FLOWSCOPE_POLL_SECS") {
            self.polling.interval_secs = secs;
        }
        if let Some(dedupe) = env_bool("FLOWSCOPE_DEDUPE_EVENTS") {
            self.retention.dedupe_events = dedupe;
        }
    }
}

static CONFIG_SCHEMA: Lazy<Option<Validator>> = Lazy::new(|| {
    let schema_value = config_schema_json();
    match validator_for(&schema_value) {
        Ok(validator) => Some(validator),
        Err(err) => {
            tracing::error!(error = %err, "config schema failed to compile");
            None
        }
    }
});

/// JSON schema describing [`SyncConfig`].
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(SyncConfig);
    serde_json::to_value(&schema).unwrap_or_default()
}

pub fn load_config(path: impl AsRef<Path>) -> Result<SyncConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let raw: toml::Value =
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    let json_value = serde_json::to_value(&raw)?;
    if let Some(validator) = CONFIG_SCHEMA.as_ref() {
        let validation_errors: Vec<_> = validator
            .iter_errors(&json_value)
            .map(|e| e.to_string())
            .collect();
        if !validation_errors.is_empty() {
            return Err(anyhow::anyhow!(validation_errors.join(", ")))
                .with_context(|| format!("validating {}", path.display()));
        }
    }
    let cfg: SyncConfig = toml::from_str(&content)?;
    Ok(cfg)
}
