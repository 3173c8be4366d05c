//! config.rs — gateway configuration.
//!
//! Layered the usual way: compiled defaults, then an optional TOML file,
//! then environment variables, then CLI flags (applied in `main`). The
//! resulting value is frozen before the server starts; nothing re-reads
//! configuration at runtime.

use std::path::Path;

use jt808_proto::motion::{GateRule, GateThresholds, SpeedThresholds};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener bind address for tracker terminals.
    pub jt808_host: String,
    pub jt808_port: u16,

    /// Downstream message-bus endpoint, consumed by the attached transport.
    pub bus_host: String,
    pub bus_port: u16,
    pub bus_user: Option<String>,
    pub bus_password: Option<String>,
    pub bus_tls: bool,
    pub bus_topic_prefix: String,
    pub bus_location_topic_template: String,

    /// Auth code handed out in registration responses. An empty value is
    /// replaced with the default before framing.
    pub auth_code: String,

    pub throttle: ThrottleConfig,
    pub gate: GateConfig,
    pub output: OutputConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            jt808_host: "0.0.0.0".into(),
            jt808_port: 8008,
            bus_host: "localhost".into(),
            bus_port: 1883,
            bus_user: None,
            bus_password: None,
            bus_tls: false,
            bus_topic_prefix: "pettracker".into(),
            bus_location_topic_template: "pettracker/{device_id}/location".into(),
            auth_code: DEFAULT_AUTH_CODE.into(),
            throttle: ThrottleConfig::default(),
            gate: GateConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

pub const DEFAULT_AUTH_CODE: &str = "123456";

/// Per-event-kind publish throttles, seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub heartbeat_interval: u64,
    pub status_ttl: u64,
    pub registration_ttl: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 60,
            status_ttl: 300,
            registration_ttl: 3600,
        }
    }
}

/// Location dual-gate thresholds, keyed by activity class.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub fast_interval: u64,
    pub fast_distance: f64,
    pub walking_interval: u64,
    pub walking_distance: f64,
    pub resting_interval: u64,
    pub resting_distance: f64,
    pub speed_threshold_fast: f64,
    pub speed_threshold_walking: f64,
}

impl Default for GateConfig {
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

impl GateConfig {
    pub fn thresholds(&self) -> GateThresholds {
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

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(default)]
pub struct OutputConfig {
    /// Compact payload shapes (short keys, only-true flag maps).
    pub optimize_payload: bool,
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl GatewayConfig {
    /// Load from an explicit file, or `config.toml` when present, then
    /// overlay environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => toml::from_str(&std::fs::read_to_string(p)?)?,
            None if Path::new("config.toml").exists() => {
                toml::from_str(&std::fs::read_to_string("config.toml")?)?
            }
            None => Self::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("JT808_HOST") {
            self.jt808_host = v;
        }
        if let Some(v) = env_parse("JT808_PORT") {
            self.jt808_port = v;
        }
        if let Ok(v) = std::env::var("BUS_HOST") {
            self.bus_host = v;
        }
        if let Some(v) = env_parse("BUS_PORT") {
            self.bus_port = v;
        }
        if let Ok(v) = std::env::var("BUS_USER") {
            self.bus_user = Some(v);
        }
        if let Ok(v) = std::env::var("BUS_PASSWORD") {
            self.bus_password = Some(v);
        }
        if let Some(v) = env_parse("BUS_TLS") {
            self.bus_tls = v;
        }
        if let Ok(v) = std::env::var("BUS_TOPIC_PREFIX") {
            self.bus_topic_prefix = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jt808_port == 0 {
            return Err(ConfigError::Invalid("jt808_port must be non-zero".into()));
        }
        if self.bus_port == 0 {
            return Err(ConfigError::Invalid("bus_port must be non-zero".into()));
        }
        match (&self.bus_user, &self.bus_password) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::Invalid(
                    "bus_user and bus_password must be set together".into(),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// The registration auth code, never empty.
    pub fn registration_auth_code(&self) -> &str {
        let code = self.auth_code.trim();
        if code.is_empty() {
            warn!("empty auth_code configured, using default");
            DEFAULT_AUTH_CODE
        } else {
            code
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.jt808_port, 8008);
        assert_eq!(cfg.bus_topic_prefix, "pettracker");
        assert_eq!(cfg.throttle.heartbeat_interval, 60);
        assert_eq!(cfg.gate.walking_interval, 60);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults_elsewhere() {
        let cfg: GatewayConfig = toml::from_str(
            r#"
            jt808_port = 9001

            [gate]
            walking_distance = 25.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.jt808_port, 9001);
        assert_eq!(cfg.gate.walking_distance, 25.0);
        assert_eq!(cfg.gate.fast_interval, 5);
        assert_eq!(cfg.bus_port, 1883);
    }

    #[test]
    fn lopsided_credentials_rejected() {
        let mut cfg = GatewayConfig::default();
        cfg.bus_user = Some("gw".into());
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
        cfg.bus_password = Some("secret".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_auth_code_falls_back() {
        let mut cfg = GatewayConfig::default();
        cfg.auth_code = "  ".into();
        assert_eq!(cfg.registration_auth_code(), DEFAULT_AUTH_CODE);
    }
}
