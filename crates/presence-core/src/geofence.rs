//! Great-circle geofence check against the configured office.

use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the haversine formula, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// The office a check-in is verified against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfficeLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
    pub resolved_address: String,
}

impl OfficeLocation {
    pub fn evaluate(&self, latitude: f64, longitude: f64) -> GeofenceResult {
        evaluate(latitude, longitude, self.latitude, self.longitude, self.radius_m)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeofenceResult {
    /// Full-precision distance from the office, in meters.
    pub distance_m: f64,
    pub verified: bool,
}

/// Haversine distance in meters between two (lat, lon) points in degrees.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Check reported coordinates against an office and radius.
///
/// The boundary is inclusive: `distance == radius_m` is verified.
pub fn evaluate(
    latitude: f64,
    longitude: f64,
    office_latitude: f64,
    office_longitude: f64,
    radius_m: f64,
) -> GeofenceResult {
    let distance_m = haversine_m(latitude, longitude, office_latitude, office_longitude);
    GeofenceResult {
        distance_m,
        verified: distance_m <= radius_m,
    }
}

/// Round to two decimals for display.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_point_is_zero_and_verified() {
        for (lat, lon) in [(0.0, 0.0), (27.7172, 85.3240), (-33.8688, 151.2093), (89.9, -179.9)] {
            for radius in [0.0, 1.0, 100.0] {
                let result = evaluate(lat, lon, lat, lon, radius);
                assert_eq!(result.distance_m, 0.0);
                assert!(result.verified);
            }
        }
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let (lat, lon, olat, olon) = (27.7172, 85.3240, 27.7180, 85.3251);
        let d = haversine_m(lat, lon, olat, olon);
        assert!(evaluate(lat, lon, olat, olon, d).verified);
        assert!(!evaluate(lat, lon, olat, olon, d - 1e-6).verified);
    }

    #[test]
    fn test_one_degree_of_latitude() {
        // 2πR / 360 ≈ 111 194.93 m
        let d = haversine_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_194.93).abs() < 0.01, "d = {d}");
    }

    #[test]
    fn test_known_city_distance() {
        // London → Paris ≈ 343.5 km on a 6371 km sphere
        let d = haversine_m(51.5074, -0.1278, 48.8566, 2.3522);
        assert!((d - 343_556.0).abs() < 500.0, "d = {d}");
    }

    #[test]
    fn test_symmetry() {
        let a = haversine_m(10.0, 20.0, -5.0, 42.0);
        let b = haversine_m(-5.0, 42.0, 10.0, 20.0);
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn test_office_evaluate_out_of_range() {
        let office = OfficeLocation {
            latitude: 27.7172,
            longitude: 85.3240,
            radius_m: 100.0,
            resolved_address: "HQ".into(),
        };
        let result = office.evaluate(27.7272, 85.3240);
        assert!(!result.verified);
        assert!(result.distance_m > 1_000.0);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(12.345_67), 12.35);
        assert_eq!(round2(0.004), 0.0);
    }
}
