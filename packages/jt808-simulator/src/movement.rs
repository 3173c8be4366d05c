//! movement.rs — random-walk movement model.
//!
//! Simulates a tracker wandering from its start position. Each tick the
//! heading drifts a little, the speed jitters around the configured base,
//! and the position advances by speed × interval. The metre → degree
//! conversion is the small-distance approximation (1° of latitude ≈
//! 111 111 m, longitude scaled by cos of the latitude), which is plenty for
//! walk-scale steps.

use rand::Rng;
use rand_distr::{Distribution, Uniform};

const METRES_PER_DEGREE: f64 = 111_111.0;
const HEADING_DRIFT_DEG: f64 = 10.0;

/// One tick's output, ready to be framed as a location report.
#[derive(Debug, Clone, Copy)]
pub struct PositionSample {
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: f64,
    pub direction_deg: u16,
}

pub struct MovementModel {
    lat: f64,
    lon: f64,
    direction_deg: f64,
    base_speed_mps: f64,
    heading_drift: Uniform<f64>,
    /// `None` when `speed_variation` is zero (Uniform rejects an empty range).
    speed_factor: Option<Uniform<f64>>,
}

impl MovementModel {
    pub fn new(start_lat: f64, start_lon: f64, base_speed_mps: f64, speed_variation: f64) -> Self {
        let speed_variation = speed_variation.clamp(0.0, 0.9);
        Self {
            lat: start_lat,
            lon: start_lon,
            direction_deg: rand::thread_rng().gen_range(0.0..360.0),
            base_speed_mps,
            heading_drift: Uniform::new(-HEADING_DRIFT_DEG, HEADING_DRIFT_DEG),
            speed_factor: (speed_variation > 0.0)
                .then(|| Uniform::new(1.0 - speed_variation, 1.0 + speed_variation)),
        }
    }

    /// Advance the walk by `dt_secs`.
    pub fn advance(&mut self, dt_secs: f64) -> PositionSample {
        let mut rng = rand::thread_rng();

        self.direction_deg =
            (self.direction_deg + self.heading_drift.sample(&mut rng)).rem_euclid(360.0);

        let speed_mps = match &self.speed_factor {
            Some(factor) => self.base_speed_mps * factor.sample(&mut rng),
            None => self.base_speed_mps,
        };

        let distance = speed_mps * dt_secs;
        let heading = self.direction_deg.to_radians();
        let lat_change = distance * heading.cos() / METRES_PER_DEGREE;
        let lon_change =
            distance * heading.sin() / (METRES_PER_DEGREE * self.lat.to_radians().cos());

        self.lat = (self.lat + lat_change).clamp(-90.0, 90.0);
        self.lon = (self.lon + lon_change).clamp(-180.0, 180.0);

        PositionSample {
            lat: self.lat,
            lon: self.lon,
            speed_kmh: speed_mps * 3.6,
            direction_deg: self.direction_deg as u16 % 360,
        }
    }

    /// Current position without moving — used when movement is disabled.
    pub fn stationary(&self) -> PositionSample {
        PositionSample {
            lat: self.lat,
            lon: self.lon,
            speed_kmh: 0.0,
            direction_deg: self.direction_deg as u16 % 360,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jt808_proto::geo;

    #[test]
    fn advance_moves_roughly_the_configured_distance() {
        // 5 m/s for 5 s with no jitter ≈ 25 m
        let mut m = MovementModel::new(14.0722, -87.1921, 5.0, 0.0);
        let before = m.stationary();
        let after = m.advance(5.0);
        let d = geo::haversine(before.lat, before.lon, after.lat, after.lon);
        assert!((d - 25.0).abs() < 1.0, "moved {d} m");
        assert!((after.speed_kmh - 18.0).abs() < 1e-9);
    }

    #[test]
    fn heading_stays_in_range() {
        let mut m = MovementModel::new(0.0, 0.0, 5.0, 0.3);
        for _ in 0..500 {
            let s = m.advance(1.0);
            assert!(s.direction_deg < 360);
        }
    }

    #[test]
    fn coordinates_stay_in_bounds() {
        // start at the north pole edge and walk hard
        let mut m = MovementModel::new(89.9999, 0.0, 50.0, 0.0);
        for _ in 0..100 {
            let s = m.advance(60.0);
            assert!(s.lat <= 90.0 && s.lat >= -90.0);
            assert!(s.lon <= 180.0 && s.lon >= -180.0);
        }
    }

    #[test]
    fn stationary_reports_zero_speed() {
        let m = MovementModel::new(14.0, -87.0, 5.0, 0.3);
        let s = m.stationary();
        assert_eq!(s.speed_kmh, 0.0);
        assert_eq!(s.lat, 14.0);
    }
}
