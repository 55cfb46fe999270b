//! # Geographic Utilities
//!
//! Spherical-earth helpers shared by the geofence, geometry and interpolation
//! modules.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`initial_bearing`] | Initial great-circle bearing from one point to another |
//! | [`destination_point`] | Point reached by travelling a distance along a bearing |
//! | [`normalize_bearing`] | Fold any angle into `[0, 360)` |
//!
//! All inputs are WGS84 degrees; trigonometry happens in radians inside `geo`.
//! Distances use a 6,371,000 m sphere. `geo` works on the IUGG mean radius
//! (6,371,008.8 m), so lengths are rescaled on the way in and out.
//!
//! ```rust
//! use shuttle_tracker::{GpsPoint, geo_utils};
//!
//! let a = GpsPoint::new(-6.3483, 106.8297);
//! let b = geo_utils::destination_point(&a, 90.0, 100.0);
//! assert!((geo_utils::haversine_distance(&a, &b) - 100.0).abs() < 0.5);
//! ```

use geo::{Bearing, Destination, Distance, Haversine, Point};

use crate::GpsPoint;

/// Earth radius used for every distance in the tracker.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Radius baked into `geo`'s Haversine implementation.
const GEO_MEAN_RADIUS_M: f64 = 6_371_008.8;

#[inline]
fn to_point(p: &GpsPoint) -> Point<f64> {
    Point::new(p.longitude, p.latitude)
}

/// Great-circle distance between two GPS points in meters.
///
/// ```rust
/// use shuttle_tracker::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0);
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    Haversine::distance(to_point(p1), to_point(p2)) * (EARTH_RADIUS_M / GEO_MEAN_RADIUS_M)
}

/// Initial bearing from `from` to `to`, degrees clockwise from north in `[0, 360)`.
///
/// Coincident points yield 0.
pub fn initial_bearing(from: &GpsPoint, to: &GpsPoint) -> f64 {
    if from.same_coordinates(to) {
        return 0.0;
    }
    normalize_bearing(Haversine::bearing(to_point(from), to_point(to)))
}

/// Point reached by travelling `distance_m` meters from `origin` along `bearing_deg`.
pub fn destination_point(origin: &GpsPoint, bearing_deg: f64, distance_m: f64) -> GpsPoint {
    if distance_m <= 0.0 {
        return *origin;
    }
    let dest = Haversine::destination(
        to_point(origin),
        normalize_bearing(bearing_deg),
        distance_m * (GEO_MEAN_RADIUS_M / EARTH_RADIUS_M),
    );
    GpsPoint::new(dest.y(), dest.x())
}

/// Fold an angle in degrees into `[0, 360)`.
#[inline]
pub fn normalize_bearing(bearing_deg: f64) -> f64 {
    let b = bearing_deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if b >= 360.0 {
        0.0
    } else {
        b
    }
}

/// Convert km/h to m/s.
#[inline]
pub fn kmh_to_mps(kmh: f64) -> f64 {
    kmh / 3.6
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_haversine_distance_same_point() {
        let p = GpsPoint::new(-6.3483, 106.8297);
        assert_eq!(haversine_distance(&p, &p), 0.0);
    }

    #[test]
    fn test_haversine_distance_known_value() {
        // One thousandth of a degree of latitude is ~111m
        let a = GpsPoint::new(-6.348, 106.83);
        let b = GpsPoint::new(-6.349, 106.83);
        assert!(approx_eq(haversine_distance(&a, &b), 111.2, 0.5));
    }

    #[test]
    fn test_haversine_distance_uses_tracker_radius() {
        // A quarter meridian is exactly R * pi / 2
        let equator = GpsPoint::new(0.0, 0.0);
        let pole = GpsPoint::new(90.0, 0.0);
        let expected = EARTH_RADIUS_M * std::f64::consts::FRAC_PI_2;
        assert!(approx_eq(haversine_distance(&equator, &pole), expected, 1e-3));

        let dest = destination_point(&equator, 0.0, expected);
        assert!(approx_eq(dest.latitude, 90.0, 1e-6));
    }

    #[test]
    fn test_initial_bearing_cardinal_directions() {
        let origin = GpsPoint::new(-6.35, 106.83);
        let north = GpsPoint::new(-6.34, 106.83);
        let east = GpsPoint::new(-6.35, 106.84);
        let south = GpsPoint::new(-6.36, 106.83);
        let west = GpsPoint::new(-6.35, 106.82);

        assert!(approx_eq(initial_bearing(&origin, &north), 0.0, 0.1)
            || approx_eq(initial_bearing(&origin, &north), 360.0, 0.1));
        assert!(approx_eq(initial_bearing(&origin, &east), 90.0, 0.1));
        assert!(approx_eq(initial_bearing(&origin, &south), 180.0, 0.1));
        assert!(approx_eq(initial_bearing(&origin, &west), 270.0, 0.1));
    }

    #[test]
    fn test_initial_bearing_same_point() {
        let p = GpsPoint::new(-6.35, 106.83);
        assert_eq!(initial_bearing(&p, &p), 0.0);
    }

    #[test]
    fn test_destination_point_round_trip() {
        let origin = GpsPoint::new(-6.3605, 106.8272);
        for bearing in [0.0, 45.0, 135.0, 270.0] {
            let dest = destination_point(&origin, bearing, 250.0);
            assert!(approx_eq(haversine_distance(&origin, &dest), 250.0, 0.5));
            let back = initial_bearing(&origin, &dest);
            let diff = (back - bearing).abs();
            assert!(diff < 0.1 || (360.0 - diff) < 0.1, "bearing {} -> {}", bearing, back);
        }
    }

    #[test]
    fn test_destination_zero_distance() {
        let origin = GpsPoint::new(-6.3605, 106.8272);
        assert_eq!(destination_point(&origin, 123.0, 0.0), origin);
    }

    #[test]
    fn test_normalize_bearing() {
        assert_eq!(normalize_bearing(370.0), 10.0);
        assert_eq!(normalize_bearing(-90.0), 270.0);
        assert_eq!(normalize_bearing(0.0), 0.0);
        assert!(normalize_bearing(-1e-20) < 360.0);
    }

    #[test]
    fn test_kmh_to_mps() {
        assert!(approx_eq(kmh_to_mps(36.0), 10.0, 1e-9));
    }
}
