//! Real-time state synchronisation for the flowscope dashboard.
//!
//! A [`Session`] keeps a local [`ReconciliationStore`] consistent with a
//! workflow backend by combining full snapshot reads with an incremental push
//! channel, falling back to periodic polling whenever the channel is down.

pub mod config;
pub mod dispatch;
pub mod fetcher;
pub mod http;
pub mod memory;
pub mod mode;
pub mod session;
pub mod store;
pub mod stream;
pub mod transport;
pub mod util;

#[cfg(test)]
mod test_support;

pub use config::{config_schema_json, load_config, SyncConfig};
pub use fetcher::{FetchError, RefreshReport, SnapshotFetcher};
pub use mode::{FreshnessMode, ModeController};
pub use session::{Session, SessionView};
pub use store::{Merge, ReconciliationStore, RetentionPolicy};
pub use stream::{ConnectionState, ReconnectPolicy, StreamClient};
pub use transport::{FrameStream, PushFrame, PushTransport, SnapshotTransport, TransportError};
