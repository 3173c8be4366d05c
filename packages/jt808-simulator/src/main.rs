//! main.rs — JT/T 808 tracker simulator entry point.
//!
//! Runs the terminal side of the protocol against a gateway:
//!   1. Reconnect supervisor: exponential backoff 5 s → 60 s, reset on a
//!      successful connect
//!   2. Handshake: registration (bounded wait for the auth code) then
//!      authentication (bounded wait for the ack)
//!   3. Steady state: a heartbeat tick and a movement tick; the movement
//!      tick feeds the same dual time+distance gate the gateway runs, so a
//!      report only goes on the wire when both thresholds clear
//!
//! Any socket error tears the session down and returns to step 1 with
//! authentication state cleared.

mod client;
mod movement;

use std::time::{Duration, Instant};

use clap::Parser;
use jt808_proto::body::{status_bit, BatchLocation, LocationReport, Registration};
use jt808_proto::motion::{DistanceTimeGate, GateRule, GateThresholds, SpeedThresholds};
use jt808_proto::DeviceId;
use serde::Deserialize;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

use client::DeviceClient;
use movement::MovementModel;

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "jt808-sim", about = "JT/T 808 tracker terminal simulator")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "simulator.toml")]
    config: String,
    /// Gateway host override
    #[arg(long)]
    host: Option<String>,
    /// Gateway port override
    #[arg(long)]
    port: Option<u16>,
    /// Device id override
    #[arg(long)]
    device_id: Option<String>,
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SimConfig {
    server: ServerSection,
    device: DeviceSection,
    simulation: SimulationSection,
    gate: GateSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ServerSection {
    host: String,
    port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8008,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DeviceSection {
    device_id: String,
    start_latitude: f64,
    start_longitude: f64,
    province_id: u16,
    city_id: u16,
    manufacturer_id: String,
    terminal_model: String,
    terminal_id: String,
    plate_color: u8,
    license_plate: String,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            device_id: "123456789012".into(),
            start_latitude: 14.072_275,
            start_longitude: -87.192_136,
            province_id: 11,
            city_id: 101,
            manufacturer_id: "PTRKR".into(),
            terminal_model: "PT-100".into(),
            terminal_id: "PT00001".into(),
            plate_color: 0,
            license_plate: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SimulationSection {
    location_interval: u64,
    heartbeat_interval: u64,
    #[serde(rename = "move")]
    move_enabled: bool,
    /// Metres travelled per tick at base speed.
    move_distance: f64,
    speed_variation: f64,
    batch_enabled: bool,
    batch_size: usize,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            location_interval: 5,
            heartbeat_interval: 60,
            move_enabled: true,
            move_distance: 25.0,
            speed_variation: 0.3,
            batch_enabled: false,
            batch_size: 5,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GateSection {
    fast_interval: u64,
    fast_distance: f64,
    walking_interval: u64,
    walking_distance: f64,
    resting_interval: u64,
    resting_distance: f64,
    speed_threshold_fast: f64,
    speed_threshold_walking: f64,
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            fast_interval: 5,
            fast_distance: 5.0,
            walking_interval: 60,
            walking_distance: 10.0,
            resting_interval: 300,
            resting_distance: 15.0,
            speed_threshold_fast: 20.0,
            speed_threshold_walking: 5.0,
        }
    }
}

impl GateSection {
    fn thresholds(&self) -> GateThresholds {
        GateThresholds {
            fast: GateRule::new(self.fast_interval, self.fast_distance),
            walking: GateRule::new(self.walking_interval, self.walking_distance),
            resting: GateRule::new(self.resting_interval, self.resting_distance),
            speed: SpeedThresholds {
                fast_kmh: self.speed_threshold_fast,
                walking_kmh: self.speed_threshold_walking,
            },
        }
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "jt808_simulator=debug,jt808_proto=debug"
    } else {
        "jt808_simulator=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let config_str = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../simulator.toml").to_string());
    let mut cfg: SimConfig = toml::from_str(&config_str)?;
    if let Some(host) = args.host {
        cfg.server.host = host;
    }
    if let Some(port) = args.port {
        cfg.server.port = port;
    }
    if let Some(id) = args.device_id {
        cfg.device.device_id = id;
    }

    info!(
        "🐾 jt808-sim v{} — device {} → {}:{}, location every {}s",
        env!("CARGO_PKG_VERSION"),
        cfg.device.device_id,
        cfg.server.host,
        cfg.server.port,
        cfg.simulation.location_interval
    );

    tokio::select! {
        _ = supervise(&cfg) => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

/// Reconnect loop: exponential backoff, reset on a successful connect.
async fn supervise(cfg: &SimConfig) {
    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let device_id = DeviceId::from_digits(&cfg.device.device_id);
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match DeviceClient::connect(&addr, device_id.clone()).await {
            Ok(client) => {
                backoff = INITIAL_BACKOFF;
                if let Err(e) = run_session(client, cfg).await {
                    warn!("session ended: {e}");
                }
            }
            Err(e) => warn!("connect to {addr} failed: {e}"),
        }
        info!("reconnecting in {backoff:?}");
        sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// One connected session: handshake, then the heartbeat and movement ticks
/// until the socket dies.
async fn run_session(mut client: DeviceClient, cfg: &SimConfig) -> anyhow::Result<()> {
    client.register(&registration_body(&cfg.device)).await?;
    client.authenticate().await?;

    let (reader, mut sender) = client.split();
    let mut reader_task = tokio::spawn(reader.run());

    let tick_secs = cfg.simulation.location_interval.max(1);
    let base_speed_mps = cfg.simulation.move_distance / tick_secs as f64;
    let mut movement = MovementModel::new(
        cfg.device.start_latitude,
        cfg.device.start_longitude,
        base_speed_mps,
        cfg.simulation.speed_variation,
    );
    let mut gate = DistanceTimeGate::new(cfg.gate.thresholds());
    let mut pending_batch: Vec<LocationReport> = Vec::new();

    let mut heartbeat = interval(Duration::from_secs(cfg.simulation.heartbeat_interval.max(1)));
    let mut location = interval(Duration::from_secs(tick_secs));

    let result: anyhow::Result<()> = async {
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    sender.send_heartbeat().await?;
                    debug!("heartbeat sent");
                }
                _ = location.tick() => {
                    let sample = if cfg.simulation.move_enabled {
                        movement.advance(tick_secs as f64)
                    } else {
                        movement.stationary()
                    };
                    let decision = gate.check(sample.lat, sample.lon, sample.speed_kmh, Instant::now());
                    if !decision.release {
                        debug!(
                            activity = decision.activity.label(),
                            distance_m = decision.distance_m,
                            "emit suppressed by gate"
                        );
                        continue;
                    }

                    let report = LocationReport::from_position(
                        sample.lat,
                        sample.lon,
                        0,
                        sample.speed_kmh,
                        sample.direction_deg,
                        0,
                        status_bit::ACC_ON | status_bit::LOCATION_FIXED,
                        chrono::Utc::now().naive_utc(),
                    );

                    if cfg.simulation.batch_enabled {
                        pending_batch.push(report);
                        if pending_batch.len() >= cfg.simulation.batch_size.max(1) {
                            let batch = BatchLocation {
                                type_id: 1,
                                items: std::mem::take(&mut pending_batch),
                            };
                            sender.send_batch(&batch).await?;
                            info!(count = batch.items.len(), "batch location sent");
                        }
                    } else {
                        sender.send_location(&report).await?;
                        info!(
                            lat = format_args!("{:.6}", sample.lat),
                            lon = format_args!("{:.6}", sample.lon),
                            activity = decision.activity.label(),
                            "location sent"
                        );
                    }
                }
                _ = &mut reader_task => {
                    anyhow::bail!("connection closed by platform");
                }
            }
        }
    }
    .await;

    reader_task.abort();
    result
}

fn registration_body(device: &DeviceSection) -> Registration {
    Registration {
        province_id: device.province_id,
        city_id: device.city_id,
        manufacturer_id: device.manufacturer_id.clone(),
        terminal_model: device.terminal_model.clone(),
        terminal_id: device.terminal_id.clone(),
        plate_color: device.plate_color,
        license_plate: device.license_plate.clone(),
    }
}
