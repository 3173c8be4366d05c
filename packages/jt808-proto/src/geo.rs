//! geo.rs — coordinate math shared by the gateway and the simulator.
//!
//! The protocol packs coordinates as degrees-minutes-seconds in a single
//! integer: `d·10⁶ + m·10⁴ + s·10²`. Sign is carried out-of-band in the
//! status word (south / west bits), so both conversions here work on
//! magnitudes.

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Unpack a DMS-encoded coordinate into decimal degrees (unsigned).
pub fn dms_to_decimal(raw: u32) -> f64 {
    let degrees = (raw / 1_000_000) as f64;
    let minutes = ((raw % 1_000_000) / 10_000) as f64;
    let seconds = ((raw % 10_000) / 100) as f64;
    degrees + minutes / 60.0 + seconds / 3600.0
}

/// Pack decimal degrees into the DMS integer encoding. Operates on |x|;
/// the caller folds the sign into the status word.
pub fn decimal_to_dms(decimal: f64) -> u32 {
    // the epsilon keeps whole-second inputs from truncating to N-1 after
    // the two multiplications
    const EPS: f64 = 1e-7;
    let decimal = decimal.abs();
    let degrees = decimal.trunc() as u32;
    let minutes_f = (decimal - f64::from(degrees)) * 60.0;
    let minutes = (minutes_f + EPS).trunc() as u32;
    let seconds_f = (minutes_f - f64::from(minutes)) * 60.0;
    let seconds = (seconds_f + EPS).trunc().clamp(0.0, 59.0) as u32;
    degrees * 1_000_000 + minutes * 10_000 + seconds * 100
}

/// Great-circle distance between two points, in metres.
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dms_unpacks_components() {
        // 14° 4' 20" → 14 + 4/60 + 20/3600
        let decimal = dms_to_decimal(14_042_000);
        assert!((decimal - (14.0 + 4.0 / 60.0 + 20.0 / 3600.0)).abs() < 1e-9);
    }

    #[test]
    fn dms_round_trip_on_whole_seconds() {
        // values with no sub-second residue survive the round trip exactly
        for raw in [0, 14_042_000, 87_115_900, 179_595_900] {
            let decimal = dms_to_decimal(raw);
            assert_eq!(decimal_to_dms(decimal), raw, "raw={raw}");
        }
    }

    #[test]
    fn decimal_to_dms_ignores_sign() {
        assert_eq!(decimal_to_dms(-14.072_222), decimal_to_dms(14.072_222));
    }

    #[test]
    fn haversine_known_distance() {
        // one degree of latitude on the 6371 km sphere ≈ 111.19 km
        let d = haversine(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_194.9).abs() < 10.0, "got {d}");
    }

    #[test]
    fn haversine_zero_for_same_point() {
        assert_eq!(haversine(14.0722, -87.1921, 14.0722, -87.1921), 0.0);
    }
}
