use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use flowscope_sync::memory::{MemorySnapshots, ScriptedPush};
use flowscope_sync::{load_config, PushFrame, Session, SessionView, SyncConfig};
use serde_json::Value as JsonValue;

#[derive(Debug, Parser)]
#[command(
    name = "flowscope-dashboard",
    version,
    about = "Terminal watcher for workflow metrics, traces and events"
)]
struct Args {
    /// Backend base address (overrides the config file)
    #[arg(long, env = "FLOWSCOPE_BASE_URL")]
    base: Option<String>,
    /// Push channel address; defaults to <base>/events
    #[arg(long, env = "FLOWSCOPE_STREAM_URL")]
    stream_url: Option<String>,
    #[arg(long, env = "FLOWSCOPE_TOKEN")]
    admin_token: Option<String>,
    /// TOML configuration file
    #[arg(long, env = "FLOWSCOPE_CONFIG")]
    config: Option<PathBuf>,
    /// Print the full state as JSON on every change instead of a one-line summary
    #[arg(long, default_value_t = false)]
    json: bool,
    /// Print the state after the initial refresh and exit
    #[arg(long, default_value_t = false)]
    once: bool,
    /// Replay newline-delimited push frames from a file instead of connecting
    #[arg(long)]
    replay: Option<PathBuf>,
    /// Print the configuration JSON schema and exit
    #[arg(long, default_value_t = false)]
    print_schema: bool,
}

fn build_config(args: &Args) -> Result<SyncConfig> {
    let mut config = match args.config.as_deref() {
        Some(path) => load_config(path)?,
        None => SyncConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(base) = args.base.as_deref() {
        config.endpoint.base_url = base.trim_end_matches('/').to_string();
    }
    if let Some(stream) = args.stream_url.as_deref() {
        config.endpoint.stream_url = Some(stream.to_string());
    }
    if let Some(token) = args.admin_token.as_deref() {
        if !token.trim().is_empty() {
            config.endpoint.token = Some(token.trim().to_string());
        }
    }
    Ok(config)
}

/// One replay line: either `{"event": .., "data": .., "id": ..}` or a raw
/// envelope delivered as the frame body.
fn parse_replay_line(line: &str) -> Option<PushFrame> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let value: JsonValue = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(%err, "skipping unreadable replay line");
            return None;
        }
    };
    let Some(data) = value.get("data") else {
        return Some(PushFrame::new(None, trimmed));
    };
    let body = match data {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    let frame = PushFrame::new(value.get("event").and_then(|v| v.as_str()), body);
    Some(match value.get("id").and_then(|v| v.as_str()) {
        Some(id) => frame.with_id(id),
        None => frame,
    })
}

fn read_replay(path: &Path) -> Result<Vec<PushFrame>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading replay file {}", path.display()))?;
    Ok(content.lines().filter_map(parse_replay_line).collect())
}

fn replay_session(config: SyncConfig, path: &Path) -> Result<Session> {
    let frames = read_replay(path)?;
    tracing::info!(frames = frames.len(), file = %path.display(), "replaying push frames");
    let push = Arc::new(ScriptedPush::new().then_hold(frames));
    Ok(Session::create(
        config,
        Arc::new(MemorySnapshots::new()),
        push,
    ))
}

fn summary_line(view: &SessionView, now: &str) -> String {
    let mut line = format!(
        "[{}] {} mode={} workflows={} traces={} events={}",
        now,
        view.connection_status,
        view.mode.as_str(),
        view.workflows.len(),
        view.traces.len(),
        view.events.len()
    );
    if let Some(metrics) = view.metrics.as_ref() {
        if let Some(active) = metrics.active_workflows {
            line.push_str(&format!(" active={active}"));
        }
        if let Some(rate) = metrics.success_rate {
            line.push_str(&format!(" success={rate:.1}%"));
        }
    }
    if let Some(latest) = view.events.first() {
        if !latest.kind.is_empty() {
            line.push_str(&format!(" last={}", latest.kind));
        }
    }
    if view.loading {
        line.push_str(" loading");
    }
    if let Some(err) = view.error.as_deref() {
        line.push_str(&format!(" error={err:?}"));
    }
    line
}

fn render(view: &SessionView, json_out: bool) -> Result<()> {
    if json_out {
        println!(
            "{}",
            serde_json::to_string(view).context("encoding session view")?
        );
    } else {
        let now = Local::now().format("%H:%M:%S").to_string();
        println!("{}", summary_line(view, &now));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    flowscope_otel::init_with_service("flowscope-dashboard");
    let args = Args::parse();
    if args.print_schema {
        let schema = flowscope_sync::config_schema_json();
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let config = build_config(&args)?;
    let session = match args.replay.as_deref() {
        Some(path) => replay_session(config, path)?,
        None => Session::from_config(config).context("building http transports")?,
    };

    let mut changes = session.changes();
    let report = session.start().await;
    if !report.failures.is_empty() {
        tracing::warn!(failed = report.failures.len(), "initial refresh incomplete");
    }
    render(&session.view(), args.json)?;
    if args.once {
        session.teardown();
        return Ok(());
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("interrupted; shutting down");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                render(&session.view(), args.json)?;
            }
        }
    }
    session.teardown();
    Ok(())
}
