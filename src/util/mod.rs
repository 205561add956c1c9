//! Utility module
//!
//! Geodesy helpers shared by the roles.

/// Mean Earth radius used for great-circle distances
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in metres between two points given in degrees
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_degree_of_longitude_at_equator() {
        let d = haversine_distance_m(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111_195.0).abs() < 50.0, "got {}", d);
    }

    #[test]
    fn test_identical_points() {
        assert_eq!(haversine_distance_m(-35.2809, 149.13, -35.2809, 149.13), 0.0);
    }

    #[test]
    fn test_symmetric() {
        let a = haversine_distance_m(-33.8688, 151.2093, -37.8136, 144.9631);
        let b = haversine_distance_m(-37.8136, 144.9631, -33.8688, 151.2093);
        assert!((a - b).abs() < 1e-6);
        // Sydney to Melbourne
        assert!((a - 713_000.0).abs() < 5_000.0);
    }
}
