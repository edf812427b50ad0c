//! relaybridge
//!
//! Supervises one worker process, fans its classified output out to
//! WebSocket observers and mirrors it to an upstream aggregator.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use relaybridge_core::config::{self, Config, WorkerStart};
use relaybridge_core::tracing_init::{default_filter, init_tracing};
use relaybridge_daemon::relay::Bridge;

#[derive(Parser, Debug)]
#[command(name = "relaybridge")]
#[command(version, about = "relaybridge - worker output relay for observers and an upstream aggregator")]
struct Args {
    /// Config file (default: ./config.yaml, then the user config dir)
    #[arg(long, short, env = "RELAYBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Observer listener address, `host:port`
    #[arg(long)]
    listen: Option<String>,

    /// Upstream aggregator WebSocket URL (e.g. "ws://aggregator:3127/ws")
    #[arg(long)]
    upstream_url: Option<String>,

    /// Path to the worker executable
    #[arg(long)]
    worker: Option<PathBuf>,

    /// Argument passed to the worker; repeat for several
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    worker_args: Vec<String>,

    /// When to start the worker
    #[arg(long, value_parser = ["immediate", "on-upstream", "manual"])]
    start: Option<String>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "RELAYBRIDGE_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Command-line flags take precedence over file and environment.
    fn apply(self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(url) = self.upstream_url {
            config.upstream_url = Some(url);
        }
        if let Some(worker) = self.worker {
            config.worker.path = Some(worker);
        }
        if !self.worker_args.is_empty() {
            config.worker.args = self.worker_args;
        }
        match self.start.as_deref() {
            Some("immediate") => config.worker.start = WorkerStart::Immediate,
            Some("on-upstream") => config.worker.start = WorkerStart::OnUpstream,
            Some("manual") => config.worker.start = WorkerStart::Manual,
            _ => {}
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if self.log_json {
            config.log_json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config =
        config::load_config(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    init_tracing(&default_filter(&config.log_level), config.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        upstream = config.upstream_url.as_deref().unwrap_or("none"),
        worker = ?config.worker.path,
        "Starting relaybridge"
    );

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let bridge = Bridge::start(config).await;

    let shutdown_bridge = std::sync::Arc::clone(&bridge);
    let shutdown = async move {
        #[cfg(unix)]
        let sigterm_future = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C shutdown signal");
            }
            _ = sigterm_future => {
                info!("Received SIGTERM shutdown signal");
            }
        }
        shutdown_bridge.shutdown().await;
    };

    relaybridge_daemon::server::serve(listener, bridge, shutdown).await?;

    info!("relaybridge stopped");
    Ok(())
}
