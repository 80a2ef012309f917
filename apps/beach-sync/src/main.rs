use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use beach_sync::channel::{ChannelDeps, ChannelEvent, SessionChannel, StaticTokenProvider, TungsteniteConnector};
use beach_sync::config::{ClientConfig, parse_endpoints};
use beach_sync::probe::ReqwestProbeBackend;
use beach_sync::protocol::JsonCodec;
use beach_sync::session::{SessionDriver, SessionUpdate};
use beach_sync::telemetry::logging::{self, LogConfig, LogLevel};
use clap::Parser;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "beach-sync")]
#[command(about = "Connect to a beach app host and follow its session")]
struct Cli {
    /// Comma separated host endpoints, tried in order
    #[arg(long, short = 'e')]
    endpoints: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[arg(long)]
    min_backoff_ms: Option<u64>,

    #[arg(long)]
    max_backoff_ms: Option<u64>,

    /// Give up after this many consecutive failed reconnects
    #[arg(long)]
    max_reconnects: Option<u32>,

    #[arg(long)]
    resume_session: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut ClientConfig) -> Result<()> {
        if let Some(raw) = self.endpoints.as_deref() {
            config.endpoints = parse_endpoints(raw)?;
        }
        if let Some(ms) = self.min_backoff_ms {
            config.min_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_backoff_ms {
            config.max_backoff = Duration::from_millis(ms);
        }
        if let Some(max) = self.max_reconnects {
            config.max_reconnect_attempts = Some(max);
        }
        if let Some(id) = self.resume_session.clone() {
            config.resume_session_id = Some(id);
        }
        config.validate()?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    logging::init(&LogConfig::from_env(cli.log_level, cli.log_file.clone()))?;

    let mut config = ClientConfig::from_env()?;
    cli.apply(&mut config)?;
    info!(
        target = "beach_sync::main",
        endpoints = ?config.endpoints.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "starting session client"
    );

    let deps = ChannelDeps {
        probe_backend: Arc::new(
            ReqwestProbeBackend::new(config.request_timeout).context("building http client")?,
        ),
        connector: Arc::new(TungsteniteConnector),
        tokens: Arc::new(StaticTokenProvider::new(config.auth_token.clone())),
        codec: Arc::new(JsonCodec),
    };
    let (channel, mut events) = SessionChannel::spawn(config.channel_config(), deps);
    let (mut driver, mut updates) = SessionDriver::new(Arc::new(channel.clone()));
    let mut tree = driver.subscribe_tree();

    channel.start();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let ChannelEvent::Retry { attempt, message, delay } = &event {
                    warn!(target = "beach_sync::main", attempt, delay = ?delay, "{message}");
                }
                if let Err(err) = driver.handle_event(event) {
                    error!(target = "beach_sync::main", error = %err, "session diverged from host; disconnecting");
                    channel.disconnect();
                }
            }
            Some(update) = updates.recv() => report(update),
            Ok(()) = tree.changed() => {
                let snapshot = tree.borrow_and_update().clone();
                info!(
                    target = "beach_sync::main",
                    root = %snapshot.active_root(),
                    nodes = snapshot.node_count(),
                    stale = driver.stale_node_ids().len(),
                    "tree updated"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!(target = "beach_sync::main", "interrupted; disconnecting");
                channel.disconnect();
                break;
            }
        }
    }

    Ok(())
}

fn report(update: SessionUpdate) {
    match update {
        SessionUpdate::Connection(state) => {
            info!(target = "beach_sync::main", state = %state, "connection state");
        }
        SessionUpdate::Capabilities(capabilities) => {
            info!(target = "beach_sync::main", capabilities = %capabilities, "host capabilities");
        }
        SessionUpdate::RunStateChanged(state) => {
            info!(target = "beach_sync::main", state = ?state, "script run state");
        }
        SessionUpdate::WidgetsAlive { node_ids, widget_ids } => {
            info!(
                target = "beach_sync::main",
                nodes = node_ids.len(),
                widgets = widget_ids.len(),
                "stale nodes cleared"
            );
        }
        SessionUpdate::ClientError(report) => {
            error!(
                target = "beach_sync::main",
                code = %report.code,
                source_path = %report.source_path,
                "{}",
                report.detail
            );
        }
    }
}
