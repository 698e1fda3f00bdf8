use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("Coordinate is not a finite number")]
    NotFinite,
    #[error("Latitude {0} out of range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("Longitude {0} out of range [-180, 180]")]
    LongitudeOutOfRange(f64),
}

/// A WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Reject malformed coordinates before they reach any state mutation.
    pub fn validate(&self) -> Result<(), GeoError> {
        if !self.lat.is_finite() || !self.lng.is_finite() {
            return Err(GeoError::NotFinite);
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(GeoError::LatitudeOutOfRange(self.lat));
        }
        if !(-180.0..=180.0).contains(&self.lng) {
            return Err(GeoError::LongitudeOutOfRange(self.lng));
        }
        Ok(())
    }
}

/// Great-circle distance between two points, in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_for_identical_points() {
        let p = GeoPoint::new(40.4093, 49.8671);
        assert_eq!(haversine_km(p, p), 0.0);
    }

    #[test]
    fn known_distance_is_close() {
        // Baku city centre to Heydar Aliyev airport, roughly 20 km.
        let centre = GeoPoint::new(40.4093, 49.8671);
        let airport = GeoPoint::new(40.4675, 50.0467);
        let d = haversine_km(centre, airport);
        assert!(d > 15.0 && d < 20.0, "got {d}");
    }

    #[test]
    fn validate_rejects_out_of_range() {
        assert!(GeoPoint::new(91.0, 0.0).validate().is_err());
        assert!(GeoPoint::new(0.0, -181.0).validate().is_err());
        assert!(GeoPoint::new(f64::NAN, 0.0).validate().is_err());
        assert!(GeoPoint::new(40.4, 49.8).validate().is_ok());
    }
}
