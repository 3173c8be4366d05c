//! motion.rs — activity classification and the dual time+distance gate.
//!
//! A position sample is released only when BOTH the elapsed time and the
//! distance travelled since the last *released* sample reach the thresholds
//! for the current activity. The gateway uses this to suppress redundant
//! location publishes; the simulator drives its emit loop through the same
//! type so both ends of the wire agree on cadence.

use std::time::{Duration, Instant};

use crate::geo;

// ── Activity ──────────────────────────────────────────────────────────────────

/// Motion class derived from reported speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    FastMoving,
    Walking,
    Resting,
}

impl Activity {
    pub fn from_speed(speed_kmh: f64, thresholds: &SpeedThresholds) -> Self {
        if speed_kmh > thresholds.fast_kmh {
            Self::FastMoving
        } else if speed_kmh > thresholds.walking_kmh {
            Self::Walking
        } else {
            Self::Resting
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::FastMoving => "fast_moving",
            Self::Walking => "walking",
            Self::Resting => "resting",
        }
    }
}

/// Speed boundaries between the activity classes, km/h.
#[derive(Debug, Clone, Copy)]
pub struct SpeedThresholds {
    pub fast_kmh: f64,
    pub walking_kmh: f64,
}

impl Default for SpeedThresholds {
    fn default() -> Self {
        Self {
            fast_kmh: 20.0,
            walking_kmh: 5.0,
        }
    }
}

// ── Thresholds ────────────────────────────────────────────────────────────────

/// One activity's release rule: minimum elapsed time AND minimum distance.
#[derive(Debug, Clone, Copy)]
pub struct GateRule {
    pub interval: Duration,
    pub distance_m: f64,
}

impl GateRule {
    pub fn new(interval_secs: u64, distance_m: f64) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs),
            distance_m,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GateThresholds {
    pub fast: GateRule,
    pub walking: GateRule,
    pub resting: GateRule,
    pub speed: SpeedThresholds,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            fast: GateRule::new(5, 5.0),
            walking: GateRule::new(60, 10.0),
            resting: GateRule::new(300, 15.0),
            speed: SpeedThresholds::default(),
        }
    }
}

impl GateThresholds {
    pub fn rule(&self, activity: Activity) -> GateRule {
        match activity {
            Activity::FastMoving => self.fast,
            Activity::Walking => self.walking,
            Activity::Resting => self.resting,
        }
    }
}

// ── Gate ──────────────────────────────────────────────────────────────────────

/// Outcome of feeding one sample through the gate.
#[derive(Debug, Clone, Copy)]
pub struct GateDecision {
    pub release: bool,
    pub activity: Activity,
    pub elapsed: Duration,
    pub distance_m: f64,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    lat: f64,
    lon: f64,
    at: Instant,
}

/// Dual-threshold release gate.
///
/// The anchor is the last released position: suppressed samples leave it
/// untouched, so distance accumulates from the last point that actually went
/// out rather than from the last point seen.
#[derive(Debug)]
pub struct DistanceTimeGate {
    thresholds: GateThresholds,
    anchor: Option<Anchor>,
}

impl DistanceTimeGate {
    pub fn new(thresholds: GateThresholds) -> Self {
        Self {
            thresholds,
            anchor: None,
        }
    }

    /// Feed a sample. The first sample always releases.
    pub fn check(&mut self, lat: f64, lon: f64, speed_kmh: f64, now: Instant) -> GateDecision {
        let activity = Activity::from_speed(speed_kmh, &self.thresholds.speed);
        let Some(anchor) = self.anchor else {
            self.anchor = Some(Anchor { lat, lon, at: now });
            return GateDecision {
                release: true,
                activity,
                elapsed: Duration::ZERO,
                distance_m: 0.0,
            };
        };

        let rule = self.thresholds.rule(activity);
        let elapsed = now.saturating_duration_since(anchor.at);
        let distance_m = geo::haversine(anchor.lat, anchor.lon, lat, lon);
        let release = elapsed >= rule.interval && distance_m >= rule.distance_m;
        if release {
            self.anchor = Some(Anchor { lat, lon, at: now });
        }
        GateDecision {
            release,
            activity,
            elapsed,
            distance_m,
        }
    }
}
