//! Communication server entry point
//!
//! Thin wrapper over the library: parse arguments, initialise logging,
//! load configuration, start the supervisor, and run until SIGTERM/SIGINT.
//! Exits non-zero when the configuration cannot be loaded.

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use comsrv::publisher::PublisherConfig;
use comsrv::{AppConfig, Supervisor};
use comsrv_rtdb::{RedisRtdb, Rtdb};

/// Command line arguments for the communication server
#[derive(Parser)]
#[command(
    name = "comsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Multi-channel industrial-protocol communication server"
)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/comsrv.yaml", env = "COMSRV_CONFIG")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Override log directory for rolling file output
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Configuration must parse before anything else; a broken file is the
    // one fatal startup error.
    let cfg = match AppConfig::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        },
    };

    let level = args.log_level.as_deref().or(cfg.log.level.as_deref());
    let dir: Option<&Path> = args.log_dir.as_deref().or(cfg.log.dir.as_deref());
    let _log_guard = comsrv::logging::init(level, dir);

    info!(
        config = %args.config.display(),
        channels = cfg.channels.len(),
        "comsrv {} starting",
        env!("CARGO_PKG_VERSION")
    );

    let rtdb: Arc<dyn Rtdb> = Arc::new(
        RedisRtdb::new(&cfg.redis.url)
            .await
            .with_context(|| format!("connecting to realtime store at {}", cfg.redis.url))?,
    );

    let publisher_config = PublisherConfig {
        hash_layout: cfg.redis.hash_layout,
        key_prefix: cfg.redis.key_prefix.clone(),
        ..PublisherConfig::default()
    };
    let mut supervisor = Supervisor::new(rtdb, publisher_config);
    supervisor.load(&cfg).await?;

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    supervisor.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            },
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
