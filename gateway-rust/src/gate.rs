//! gate.rs — the per-device publish gate.
//!
//! Decides, per event kind, whether a decoded event actually goes out on
//! the bus. Locations pass through the dual time+distance gate; the other
//! kinds each carry their own debouncer. All state here belongs to one
//! session task — nothing is shared, nothing is locked.

use std::time::{Duration, Instant};

use jt808_proto::motion::{DistanceTimeGate, GateDecision};

use crate::config::GatewayConfig;

/// Connectivity status as published on the `status` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// An `online` arriving this soon after an `offline` is treated as flap.
const FLAP_WINDOW: Duration = Duration::from_secs(5);

pub struct DeviceGate {
    location: DistanceTimeGate,
    heartbeat_interval: Duration,
    status_ttl: Duration,
    registration_ttl: Duration,
    last_heartbeat: Option<Instant>,
    last_registration: Option<Instant>,
    last_auth_code: Option<String>,
    last_status: Option<(DeviceStatus, Instant)>,
}

impl DeviceGate {
    pub fn new(cfg: &GatewayConfig) -> Self {
        Self {
            location: DistanceTimeGate::new(cfg.gate.thresholds()),
            heartbeat_interval: Duration::from_secs(cfg.throttle.heartbeat_interval),
            status_ttl: Duration::from_secs(cfg.throttle.status_ttl),
            registration_ttl: Duration::from_secs(cfg.throttle.registration_ttl),
            last_heartbeat: None,
            last_registration: None,
            last_auth_code: None,
            last_status: None,
        }
    }

    /// Dual-threshold location check; see [`DistanceTimeGate`].
    pub fn check_location(
        &mut self,
        lat: f64,
        lon: f64,
        speed_kmh: f64,
        now: Instant,
    ) -> GateDecision {
        self.location.check(lat, lon, speed_kmh, now)
    }

    /// Trailing-edge debounce: the cached timestamp refreshes on every
    /// heartbeat, so a device beating faster than the interval publishes
    /// only when a gap finally reaches it.
    pub fn allow_heartbeat(&mut self, now: Instant) -> bool {
        let release = self
            .last_heartbeat
            .map_or(true, |t| now.saturating_duration_since(t) >= self.heartbeat_interval);
        self.last_heartbeat = Some(now);
        release
    }

    /// One-shot per session; the TTL re-arms it for devices that re-register
    /// on the same long-lived connection.
    pub fn allow_registration(&mut self, now: Instant) -> bool {
        match self.last_registration {
            Some(t) if now.saturating_duration_since(t) < self.registration_ttl => false,
            _ => {
                self.last_registration = Some(now);
                true
            }
        }
    }

    /// Publishes only when the auth code actually changed.
    pub fn allow_auth(&mut self, code: &str) -> bool {
        if self.last_auth_code.as_deref() == Some(code) {
            false
        } else {
            self.last_auth_code = Some(code.to_string());
            true
        }
    }

    /// `offline` always goes out. `online` is suppressed while it repeats
    /// inside the TTL, and suppressed entirely within the flap window after
    /// an `offline`.
    pub fn allow_status(&mut self, status: DeviceStatus, now: Instant) -> bool {
        match (status, self.last_status) {
            (DeviceStatus::Offline, _) => {
                self.last_status = Some((DeviceStatus::Offline, now));
                true
            }
            (DeviceStatus::Online, Some((DeviceStatus::Offline, at)))
                if now.saturating_duration_since(at) < FLAP_WINDOW =>
            {
                false
            }
            (DeviceStatus::Online, Some((DeviceStatus::Online, at)))
                if now.saturating_duration_since(at) < self.status_ttl =>
            {
                false
            }
            (DeviceStatus::Online, _) => {
                self.last_status = Some((DeviceStatus::Online, now));
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> DeviceGate {
        DeviceGate::new(&GatewayConfig::default())
    }

    const MIN: Duration = Duration::from_secs(60);

    #[test]
    fn heartbeat_trailing_edge_debounce() {
        let mut g = gate();
        let t0 = Instant::now();
        assert!(g.allow_heartbeat(t0));
        // 30 s cadence keeps refreshing the cache, never reaching the gap
        assert!(!g.allow_heartbeat(t0 + Duration::from_secs(30)));
        assert!(!g.allow_heartbeat(t0 + Duration::from_secs(60)));
        // a real 60 s gap releases again
        assert!(g.allow_heartbeat(t0 + Duration::from_secs(120)));
    }

    #[test]
    fn registration_is_one_shot_until_ttl() {
        let mut g = gate();
        let t0 = Instant::now();
        assert!(g.allow_registration(t0));
        assert!(!g.allow_registration(t0 + Duration::from_secs(10)));
        assert!(!g.allow_registration(t0 + Duration::from_secs(3599)));
        assert!(g.allow_registration(t0 + Duration::from_secs(3600)));
    }

    #[test]
    fn auth_publishes_on_code_change_only() {
        let mut g = gate();
        assert!(g.allow_auth("123456"));
        assert!(!g.allow_auth("123456"));
        assert!(g.allow_auth("654321"));
        assert!(!g.allow_auth("654321"));
    }

    #[test]
    fn offline_always_publishes() {
        let mut g = gate();
        let t0 = Instant::now();
        assert!(g.allow_status(DeviceStatus::Offline, t0));
        assert!(g.allow_status(DeviceStatus::Offline, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn online_within_flap_window_is_suppressed() {
        let mut g = gate();
        let t0 = Instant::now();
        assert!(g.allow_status(DeviceStatus::Online, t0));
        assert!(g.allow_status(DeviceStatus::Offline, t0 + MIN));
        // flaps back online 2 s later: suppressed
        assert!(!g.allow_status(DeviceStatus::Online, t0 + MIN + Duration::from_secs(2)));
        // past the window the transition publishes
        assert!(g.allow_status(DeviceStatus::Online, t0 + MIN + Duration::from_secs(6)));
    }

    #[test]
    fn repeated_online_respects_ttl() {
        let mut g = gate();
        let t0 = Instant::now();
        assert!(g.allow_status(DeviceStatus::Online, t0));
        assert!(!g.allow_status(DeviceStatus::Online, t0 + Duration::from_secs(100)));
        assert!(g.allow_status(DeviceStatus::Online, t0 + Duration::from_secs(301)));
    }

    #[test]
    fn location_gate_wired_through() {
        let mut g = gate();
        let t0 = Instant::now();
        assert!(g.check_location(14.0, -87.0, 10.0, t0).release);
        // walking thresholds: 30 s / 50 m sample is suppressed on time
        let d = g.check_location(14.000_449, -87.0, 10.0, t0 + Duration::from_secs(30));
        assert!(!d.release);
    }
}
