use std::path::PathBuf;

use once_cell::sync::OnceCell;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Where rolled log files go when `FLOWSCOPE_LOG_ROLL=1`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RollSettings {
    dir: PathBuf,
    prefix: String,
    rotation: &'static str,
}

fn rotation_name(raw: &str) -> &'static str {
    match raw.trim().to_ascii_lowercase().as_str() {
        "hourly" => "hourly",
        "minutely" => "minutely",
        _ => "daily",
    }
}

fn roll_settings(service: &str) -> Option<RollSettings> {
    if std::env::var("FLOWSCOPE_LOG_ROLL").ok().as_deref() != Some("1") {
        return None;
    }
    let dir = std::env::var("FLOWSCOPE_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let rotation = std::env::var("FLOWSCOPE_LOG_ROTATION").unwrap_or_default();
    Some(RollSettings {
        dir: PathBuf::from(dir),
        prefix: service.to_string(),
        rotation: rotation_name(&rotation),
    })
}

fn appender(settings: &RollSettings) -> RollingFileAppender {
    let rotation = match settings.rotation {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        _ => Rotation::DAILY,
    };
    RollingFileAppender::new(rotation, &settings.dir, &settings.prefix)
}

pub fn init() {
    init_with_service("flowscope");
}

/// Install the global subscriber: human-readable output on stderr filtered by
/// `RUST_LOG` (default `info`), plus an optional rolling file named after
/// `service`. Repeated calls are ignored.
pub fn init_with_service(service: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);
    let registry = tracing_subscriber::registry().with(console);

    let Some(settings) = roll_settings(service) else {
        let _ = registry.try_init();
        return;
    };
    if std::fs::create_dir_all(&settings.dir).is_err() {
        eprintln!(
            "failed to create log directory {}; file logging disabled",
            settings.dir.display()
        );
        let _ = registry.try_init();
        return;
    }
    let (nb, guard) = tracing_appender::non_blocking(appender(&settings));
    let _ = FILE_GUARD.set(guard);
    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(nb)
        .with_filter(file_filter);
    if registry.with(file_layer).try_init().is_ok() {
        tracing::info!(
            directory = %settings.dir.display(),
            rotation = settings.rotation,
            "file logging enabled"
        );
    }
}
