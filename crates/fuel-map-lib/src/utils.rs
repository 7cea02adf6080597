//! Utility functions for coordinate conversions and spatial operations
//!
//! The clustering grid works in normalised Web Mercator space: both axes span
//! `[0, 1]`, x grows eastwards and y grows southwards (tile convention).

use geo::Point;

/// Width of the Web Mercator plane in meters (EPSG:3857)
pub const EARTH_SIZE_METERS: f64 = 2.0 * 20037508.34;

/// Maximum latitude that can be represented in Web Mercator
pub const MAX_LATITUDE: f64 = 85.05112878;

/// Project WGS84 (lat, lon) to normalised Web Mercator `[0, 1]²`
///
/// Latitude is clamped to the Web Mercator range, so the poles map onto the
/// top and bottom edges instead of infinity.
#[inline(always)]
pub fn project(lat: f64, lon: f64) -> Point<f64> {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let x = lon / 360.0 + 0.5;

    let sin = lat.to_radians().sin();
    let y = 0.5 - 0.25 * ((1.0 + sin) / (1.0 - sin)).ln() / std::f64::consts::PI;

    Point::new(x.clamp(0.0, 1.0), y.clamp(0.0, 1.0))
}

/// Inverse of [`project`]
///
/// # Returns
/// A tuple of (latitude, longitude) in degrees
#[inline(always)]
pub fn unproject(x: f64, y: f64) -> (f64, f64) {
    let lon = (x - 0.5) * 360.0;
    let y2 = (180.0 - y * 360.0).to_radians();
    let lat = 360.0 * y2.exp().atan() / std::f64::consts::PI - 90.0;
    (lat, lon)
}

/// Check that a latitude/longitude pair is finite and inside the WGS84 ranges
#[inline(always)]
pub fn is_valid_wgs84(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
}

/// Convert a distance in normalised world units to ground meters at a latitude
#[inline]
pub fn world_to_meters(distance: f64, lat: f64) -> f64 {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    distance * EARTH_SIZE_METERS * lat.to_radians().cos()
}
