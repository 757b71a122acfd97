//! Haversine distance over `[longitude, latitude]` coordinate pairs.

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points in kilometers.
pub fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Distance between two GeoJSON-ordered `[lon, lat]` pairs, rounded to 0.1 km
/// as the API reports it.
pub fn distance_between(from: &[f64; 2], to: &[f64; 2]) -> f64 {
    round_km(distance_km(from[1], from[0], to[1], to[0]))
}

pub fn within_radius(from: &[f64; 2], to: &[f64; 2], radius_km: f64) -> bool {
    distance_between(from, to) <= radius_km
}

pub fn round_km(km: f64) -> f64 {
    (km * 10.0).round() / 10.0
}

/// A `[0, 0]` pair means the user never set a location; distance filters are
/// skipped for them.
pub fn is_valid(coordinates: &[f64; 2]) -> bool {
    coordinates[0] != 0.0 || coordinates[1] != 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_distance() {
        assert_eq!(distance_km(12.9716, 77.5946, 12.9716, 77.5946), 0.0);
    }

    #[test]
    fn test_known_distance() {
        // Bangalore -> Chennai is roughly 290 km as the crow flies
        let d = distance_km(12.9716, 77.5946, 13.0827, 80.2707);
        assert!((d - 290.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn test_short_distance_rounding() {
        // ~0.01 degrees of latitude is ~1.1 km
        let d = distance_between(&[77.5946, 12.9716], &[77.5946, 12.9816]);
        assert_eq!(d, 1.1);
    }

    #[test]
    fn test_within_radius() {
        let home = [77.5946, 12.9716];
        let near = [77.6000, 12.9750];

        assert!(within_radius(&home, &near, 2.0));
        assert!(!within_radius(&home, &[80.2707, 13.0827], 5.0));
    }

    #[test]
    fn test_validity() {
        assert!(is_valid(&[77.5946, 12.9716]));
        assert!(!is_valid(&[0.0, 0.0]));
    }
}
