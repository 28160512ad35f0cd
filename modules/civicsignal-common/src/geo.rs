//! Great-circle math on WGS84 coordinates.

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Meters per degree of latitude (and of longitude at the equator).
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Haversine distance between two lat/lng points, in meters.
pub fn haversine_distance_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lng2 - lng1).to_radians();

    let h = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

/// Lat/lng bounding box around a point, used as a cheap prefilter before the
/// exact haversine check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    /// Box that fully contains the circle of `radius_meters` around (lat, lng).
    /// Longitude span widens toward the poles; it is clamped to the whole
    /// globe when the cosine term collapses.
    pub fn around(lat: f64, lng: f64, radius_meters: f64) -> Self {
        let lat_delta = radius_meters / METERS_PER_DEGREE;
        let cos_lat = lat.to_radians().cos();
        let lng_delta = if cos_lat.abs() < 1e-6 {
            180.0
        } else {
            (radius_meters / (METERS_PER_DEGREE * cos_lat.abs())).min(180.0)
        };
        Self {
            min_lat: (lat - lat_delta).max(-90.0),
            max_lat: (lat + lat_delta).min(90.0),
            min_lng: lng - lng_delta,
            max_lng: lng + lng_delta,
        }
    }
}
