//! Great-circle distance on a spherical earth
//!
//! Haversine is accurate to a few meters at geofence radii of tens to
//! hundreds of meters, which is all the detector needs.

use crate::domain::types::GeoPoint;

/// Mean earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude on the sphere
const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// Haversine distance between two points in meters
#[inline]
pub fn distance_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Axis-aligned lat/lng box used as a cheap prefilter before exact distance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    /// Box that contains every point within `meters` of `center`
    pub fn around(center: GeoPoint, meters: f64) -> Self {
        let dlat = meters / METERS_PER_DEGREE;
        let cos_lat = center.lat.to_radians().cos().abs();
        // Near the poles the longitude span degenerates; take the whole circle
        let dlng = if cos_lat < 1e-6 { 180.0 } else { (dlat / cos_lat).min(180.0) };

        Self {
            min_lat: (center.lat - dlat).max(-90.0),
            max_lat: (center.lat + dlat).min(90.0),
            min_lng: center.lng - dlng,
            max_lng: center.lng + dlng,
        }
    }

    /// Longitude wrap at the antimeridian is handled by shifting the point
    pub fn contains(&self, point: GeoPoint) -> bool {
        if point.lat < self.min_lat || point.lat > self.max_lat {
            return false;
        }
        [point.lng, point.lng - 360.0, point.lng + 360.0]
            .iter()
            .any(|lng| *lng >= self.min_lng && *lng <= self.max_lng)
    }
}

/// Linear interpolation between two points at fraction `t` in [0, 1]
#[inline]
pub fn lerp(a: GeoPoint, b: GeoPoint, t: f64) -> GeoPoint {
    GeoPoint { lat: a.lat + (b.lat - a.lat) * t, lng: a.lng + (b.lng - a.lng) * t }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE: GeoPoint = GeoPoint { lat: 25.650648, lng: -100.373529 };

    #[test]
    fn test_zero_distance() {
        assert_eq!(distance_meters(SITE, SITE), 0.0);
    }

    #[test]
    fn test_one_degree_latitude() {
        let d = distance_meters(GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 0.0));
        assert!((d - 111_194.93).abs() < 1.0, "got {d}");
    }

    #[test]
    fn test_symmetric() {
        let other = GeoPoint::new(25.651, -100.3739);
        let ab = distance_meters(SITE, other);
        let ba = distance_meters(other, SITE);
        assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn test_short_distance_matches_offset() {
        // 10 m north of the site
        let north = GeoPoint::new(SITE.lat + 10.0 / METERS_PER_DEGREE, SITE.lng);
        let d = distance_meters(SITE, north);
        assert!((d - 10.0).abs() < 0.01, "got {d}");
    }

    #[test]
    fn test_bounding_box_contains_circle() {
        let bbox = BoundingBox::around(SITE, 100.0);
        let north = GeoPoint::new(SITE.lat + 99.0 / METERS_PER_DEGREE, SITE.lng);
        let far = GeoPoint::new(SITE.lat + 200.0 / METERS_PER_DEGREE, SITE.lng);
        assert!(bbox.contains(SITE));
        assert!(bbox.contains(north));
        assert!(!bbox.contains(far));
    }

    #[test]
    fn test_bounding_box_antimeridian() {
        let bbox = BoundingBox::around(GeoPoint::new(0.0, 179.9999), 100.0);
        assert!(bbox.contains(GeoPoint::new(0.0, -179.9999)));
    }

    #[test]
    fn test_lerp_midpoint() {
        let mid = lerp(GeoPoint::new(0.0, 0.0), GeoPoint::new(2.0, -4.0), 0.5);
        assert_eq!(mid, GeoPoint::new(1.0, -2.0));
    }
}
