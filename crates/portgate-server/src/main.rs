//! portgate: TCP/UDP port-forwarding engine.
//!
//! Restores the forwarding rules saved by the previous run, starts any rules
//! given on the command line, and keeps rules, traffic counters and abuse
//! state persisted until a shutdown signal arrives.

use clap::Parser;
use portgate_core::RuleSpec;
use portgate_server::config::PortgateConfig;
use portgate_server::{Engine, Reconciler};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// portgate: TCP/UDP port forwarder
#[derive(Parser, Debug)]
#[command(name = "portgate", version, about = "TCP/UDP port forwarder")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.portgate/config.toml")]
    config: String,

    /// Directory holding rules, counters, abuse state and backups
    #[arg(long)]
    data_dir: Option<String>,

    /// Seconds between autosave passes
    #[arg(long)]
    autosave_interval: Option<u64>,

    /// Forwarding rule to start, as PROTO:LOCAL_PORT:HOST:REMOTE_PORT (repeatable)
    #[arg(long = "forward", value_name = "RULE")]
    forwards: Vec<RuleSpec>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting portgate");

    let config_path = PathBuf::from(&cli.config);
    let config = match PortgateConfig::load(
        Some(&config_path),
        cli.data_dir.as_deref(),
        cli.autosave_interval,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to load config");
            std::process::exit(1);
        }
    };

    let engine = match Engine::open(config.engine_config()).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!(error = %e, data_dir = %config.data_dir.display(), "failed to open storage");
            std::process::exit(1);
        }
    };

    let reconciler = Reconciler::new(Arc::clone(&engine));
    reconciler.restore().await;

    if !cli.forwards.is_empty() {
        let report = engine.start_rules(&cli.forwards).await;
        for item in report.items.iter().filter(|i| !i.success) {
            warn!(
                rule = %item.target,
                error = item.error.as_deref().unwrap_or("unknown"),
                "rule from command line not started"
            );
        }
    }

    let stats = engine.stats().await;
    info!(
        active_rules = stats.active_rules,
        total_rules = stats.total_rules,
        autosave_secs = config.autosave_interval.as_secs(),
        "portgate running"
    );

    // Periodic flush until shutdown
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let periodic = Reconciler::new(Arc::clone(&engine));
    let ticker = tokio::spawn(periodic.run(config.autosave_interval, shutdown_rx));

    shutdown_signal().await;
    info!("received shutdown signal");

    let _ = shutdown_tx.send(());
    let _ = ticker.await;
    reconciler.final_flush().await;

    info!("portgate stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
