//! Great-circle geometry used for technician eligibility and ranking.

/// Mean Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Average road speed (km/h) assumed when the routing service is unavailable.
const FALLBACK_SPEED_KMH: f64 = 30.0;

/// A WGS-84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Coordinates { lat, lng }
    }

    /// Builds coordinates only when both components are present.
    pub fn from_parts(lat: Option<f64>, lng: Option<f64>) -> Option<Self> {
        match (lat, lng) {
            (Some(lat), Some(lng)) => Some(Coordinates { lat, lng }),
            _ => None,
        }
    }
}

/// Haversine great-circle distance between two coordinates, in kilometers.
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Straight-line ETA estimate used when routing enrichment fails.
pub fn fallback_eta_seconds(distance_km: f64) -> f64 {
    distance_km / FALLBACK_SPEED_KMH * 3600.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_zero_distance() {
        let p = Coordinates::new(11.0, 76.9);
        assert!(haversine_km(p, p) < 1e-9);
    }

    #[test]
    fn test_haversine_known_distance() {
        // Coimbatore -> Chennai is roughly 430 km great-circle.
        let coimbatore = Coordinates::new(11.0168, 76.9558);
        let chennai = Coordinates::new(13.0827, 80.2707);
        let d = haversine_km(coimbatore, chennai);
        assert!((d - 430.0).abs() < 15.0, "got {d}");
    }

    #[test]
    fn test_haversine_nearby_points() {
        // The happy-path seed: customer (11.0, 76.9), technician (11.01, 76.92).
        let customer = Coordinates::new(11.0, 76.9);
        let technician = Coordinates::new(11.01, 76.92);
        let d = haversine_km(customer, technician);
        assert!(d > 2.0 && d < 3.0, "got {d}");
    }

    #[test]
    fn test_fallback_eta() {
        assert!((fallback_eta_seconds(30.0) - 3600.0).abs() < 1e-9);
        assert!(fallback_eta_seconds(0.0).abs() < 1e-9);
    }

    #[test]
    fn test_from_parts() {
        assert!(Coordinates::from_parts(Some(1.0), None).is_none());
        assert!(Coordinates::from_parts(None, Some(1.0)).is_none());
        assert_eq!(
            Coordinates::from_parts(Some(1.0), Some(2.0)),
            Some(Coordinates::new(1.0, 2.0))
        );
    }
}
