mod bus;
mod config;
mod gate;
mod handler;
mod payload;
mod server;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use bus::ChannelBus;
use config::GatewayConfig;

// ─── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "pettracker-gateway",
    about = "JT/T 808-2013 tracker gateway: TCP ingest, per-device bus fan-out"
)]
struct Args {
    /// Config file path (defaults to ./config.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Listener host override
    #[arg(long)]
    host: Option<String>,
    /// Listener port override
    #[arg(long)]
    port: Option<u16>,
    /// Bus broker host override
    #[arg(long)]
    bus_host: Option<String>,
    /// Bus broker port override
    #[arg(long)]
    bus_port: Option<u16>,
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "pettracker_gateway=debug,jt808_proto=debug"
    } else {
        "pettracker_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let mut cfg = GatewayConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(host) = args.host {
        cfg.jt808_host = host;
    }
    if let Some(port) = args.port {
        cfg.jt808_port = port;
    }
    if let Some(host) = args.bus_host {
        cfg.bus_host = host;
    }
    if let Some(port) = args.bus_port {
        cfg.bus_port = port;
    }
    cfg.validate().context("validating configuration")?;

    info!(
        "🛰  PetTracker gateway v{} starting — bus {}:{} prefix '{}'",
        env!("CARGO_PKG_VERSION"),
        cfg.bus_host,
        cfg.bus_port,
        cfg.bus_topic_prefix
    );

    // The broker transport attaches to the receiving end of the channel;
    // without one, events are logged at debug and discarded.
    let (bus, bus_rx, _connected) = ChannelBus::new(256);
    tokio::spawn(bus::run_log_drain(bus_rx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    server::run(Arc::new(cfg), Arc::new(bus), shutdown_rx).await?;
    info!("shutdown complete");
    Ok(())
}
