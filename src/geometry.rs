//! # Route Geometry
//!
//! Dense per-color polylines used to keep interpolated positions on the road.
//!
//! Projection treats each segment as planar in (longitude, latitude) and
//! clamps the projection parameter to the segment; distances along a segment
//! are scaled from the segment's great-circle length. At campus scale the
//! planar error is far below GPS noise.
//!
//! Geometry is loaded from a route-tagged text fixture holding
//! `[longitude, latitude]` pairs after a `coordinates:` marker:
//!
//! ```text
//! BLUE_NORMAL_ROUTE = {
//!   coordinates: [
//!     [106.8297, -6.3483], [106.8317, -6.3534],
//!   ],
//!   type: "LineString",
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, TrackerError};
use crate::geo_utils::{haversine_distance, initial_bearing};
use crate::{GpsPoint, RouteColor};

/// Fixture tag for each route variant.
const FIXTURE_TAGS: [(&str, RouteColor); 4] = [
    ("BLUE_NORMAL_ROUTE", RouteColor::Blue),
    ("BLUE_MORNING_ROUTE", RouteColor::ExpressBlue),
    ("RED_NORMAL_ROUTE", RouteColor::Red),
    ("RED_MORNING_ROUTE", RouteColor::ExpressRed),
];

static COORD_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\s*([-\d.]+)\s*,\s*([-\d.]+)\s*\]").expect("coordinate pattern is valid")
});

/// A location on a polyline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutePosition {
    /// Index of the segment `points[i] -> points[i + 1]`
    pub segment_index: usize,
    /// Meters from the segment start
    pub offset_m: f64,
    /// The location itself
    pub point: GpsPoint,
    /// Distance from the queried point to `point` (0 when produced by walking)
    pub distance_from_route_m: f64,
}

/// Ordered coordinates for one route color.
#[derive(Debug, Clone)]
pub struct RoutePolyline {
    pub color: RouteColor,
    points: Vec<GpsPoint>,
    segment_lengths: Vec<f64>,
}

impl RoutePolyline {
    /// Build a polyline. At least two valid points are required.
    pub fn new(color: RouteColor, points: Vec<GpsPoint>) -> Result<Self> {
        if points.len() < 2 {
            return Err(TrackerError::Geometry {
                route: color.to_string(),
                message: format!("need at least 2 points, got {}", points.len()),
            });
        }
        if let Some(bad) = points.iter().position(|p| !p.is_valid()) {
            return Err(TrackerError::Geometry {
                route: color.to_string(),
                message: format!("point {} has invalid coordinates", bad),
            });
        }
        let segment_lengths = points
            .windows(2)
            .map(|w| haversine_distance(&w[0], &w[1]))
            .collect();
        Ok(Self {
            color,
            points,
            segment_lengths,
        })
    }

    pub fn points(&self) -> &[GpsPoint] {
        &self.points
    }

    pub fn segment_count(&self) -> usize {
        self.segment_lengths.len()
    }

    pub fn segment_length(&self, segment: usize) -> f64 {
        self.segment_lengths.get(segment).copied().unwrap_or(0.0)
    }

    pub fn total_length_m(&self) -> f64 {
        self.segment_lengths.iter().sum()
    }

    /// Planar projection parameter of `p` onto segment `i`, clamped to [0, 1].
    fn segment_fraction(&self, i: usize, p: &GpsPoint) -> f64 {
        let a = self.points[i];
        let b = self.points[i + 1];
        let dx = b.longitude - a.longitude;
        let dy = b.latitude - a.latitude;
        let len_sq = dx * dx + dy * dy;
        if len_sq == 0.0 {
            return 0.0;
        }
        let t = ((p.longitude - a.longitude) * dx + (p.latitude - a.latitude) * dy) / len_sq;
        t.clamp(0.0, 1.0)
    }

    fn lerp(&self, i: usize, t: f64) -> GpsPoint {
        let a = self.points[i];
        let b = self.points[i + 1];
        GpsPoint::new(
            a.latitude + t * (b.latitude - a.latitude),
            a.longitude + t * (b.longitude - a.longitude),
        )
    }

    fn position_on_segment(&self, i: usize, p: &GpsPoint) -> RoutePosition {
        let t = self.segment_fraction(i, p);
        let point = self.lerp(i, t);
        RoutePosition {
            segment_index: i,
            offset_m: t * self.segment_lengths[i],
            point,
            distance_from_route_m: haversine_distance(p, &point),
        }
    }

    /// Closest point on the polyline to `p`.
    ///
    /// Returns `None` for a non-finite query.
    pub fn project(&self, p: &GpsPoint) -> Option<RoutePosition> {
        if !p.latitude.is_finite() || !p.longitude.is_finite() {
            return None;
        }

        let mut best: Option<RoutePosition> = None;
        for i in 0..self.segment_count() {
            let pos = self.position_on_segment(i, p);
            if best.map_or(true, |b| pos.distance_from_route_m < b.distance_from_route_m) {
                best = Some(pos);
            }
        }
        best
    }

    /// Initial bearing of segment `i`, degrees in `[0, 360)`.
    pub fn segment_heading(&self, segment: usize) -> Option<f64> {
        (segment < self.segment_count())
            .then(|| initial_bearing(&self.points[segment], &self.points[segment + 1]))
    }

    /// Projection that respects the direction of travel.
    ///
    /// Out-and-back loops run both directions over the same road, so the
    /// nearest segment can point the wrong way. Among segments within
    /// `max_distance_m` this picks the closest one heading within 90 degrees of
    /// `heading_deg`, and falls back to [`Self::project`] when none qualifies or
    /// the heading is unknown.
    pub fn project_heading(
        &self,
        p: &GpsPoint,
        heading_deg: Option<f64>,
        max_distance_m: f64,
    ) -> Option<RoutePosition> {
        let nearest = self.project(p)?;
        let Some(heading) = heading_deg else {
            return Some(nearest);
        };

        let mut best: Option<RoutePosition> = None;
        for i in 0..self.segment_count() {
            let along = self
                .segment_heading(i)
                .map_or(false, |h| angle_between(h, heading) < 90.0);
            if !along || self.segment_lengths[i] <= 0.0 {
                continue;
            }
            let pos = self.position_on_segment(i, p);
            if pos.distance_from_route_m <= max_distance_m
                && best.map_or(true, |b| pos.distance_from_route_m < b.distance_from_route_m)
            {
                best = Some(pos);
            }
        }
        Some(best.unwrap_or(nearest))
    }

    /// Distance in meters from `p` to the nearest point of the polyline.
    pub fn distance_to_route(&self, p: &GpsPoint) -> f64 {
        self.project(p)
            .map(|pos| pos.distance_from_route_m)
            .unwrap_or(f64::INFINITY)
    }

    /// Point `offset_m` meters into `segment`, clamped to the segment.
    pub fn point_at(&self, segment: usize, offset_m: f64) -> GpsPoint {
        let Some(&len) = self.segment_lengths.get(segment) else {
            return self.points[self.points.len() - 1];
        };
        if len <= 0.0 {
            return self.points[segment];
        }
        self.lerp(segment, (offset_m / len).clamp(0.0, 1.0))
    }

    /// Walk `distance_m` forward from (`segment`, `offset_m`).
    ///
    /// Stops at the last point when the walk runs past the end of the line.
    pub fn advance(&self, segment: usize, offset_m: f64, distance_m: f64) -> RoutePosition {
        let last = self.segment_count() - 1;
        let mut index = segment.min(last);
        let mut remaining = offset_m.max(0.0) + distance_m.max(0.0);

        loop {
            let len = self.segment_lengths[index];
            if remaining <= len || index == last {
                let offset = remaining.min(len);
                return RoutePosition {
                    segment_index: index,
                    offset_m: offset,
                    point: self.point_at(index, offset),
                    distance_from_route_m: 0.0,
                };
            }
            remaining -= len;
            index += 1;
        }
    }
}

/// Polylines keyed by route color.
#[derive(Debug, Clone, Default)]
pub struct RouteGeometryStore {
    routes: HashMap<RouteColor, RoutePolyline>,
}

impl RouteGeometryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, polyline: RoutePolyline) {
        self.routes.insert(polyline.color, polyline);
    }

    pub fn get(&self, color: RouteColor) -> Option<&RoutePolyline> {
        self.routes.get(&color)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Polyline for `color`, or the one closest to `point` when the color has
    /// no geometry.
    pub fn best_route(&self, point: &GpsPoint, color: RouteColor) -> Option<&RoutePolyline> {
        if let Some(polyline) = self.get(color) {
            return Some(polyline);
        }
        self.routes
            .values()
            .map(|p| (p, p.distance_to_route(point)))
            .filter(|(_, d)| d.is_finite())
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(p, _)| p)
    }

    /// Parse a route-tagged fixture. Colors without coordinates are skipped.
    pub fn parse_fixture(source: &str) -> Result<Self> {
        let mut collected: HashMap<RouteColor, Vec<GpsPoint>> = HashMap::new();
        let mut section: Option<RouteColor> = None;
        let mut in_coordinates = false;

        for raw in source.lines() {
            let line = raw.trim();

            if let Some((_, color)) = FIXTURE_TAGS.iter().find(|(tag, _)| line.contains(tag)) {
                section = Some(*color);
                in_coordinates = false;
                continue;
            }
            let Some(color) = section else {
                continue;
            };

            if let Some(rest) = line.split_once("coordinates:").map(|(_, r)| r) {
                in_coordinates = true;
                collect_pairs(rest, collected.entry(color).or_default());
                continue;
            }
            if in_coordinates {
                collect_pairs(line, collected.entry(color).or_default());
                if line.contains("type:") {
                    in_coordinates = false;
                }
            }
        }

        let mut store = Self::new();
        for (_, color) in FIXTURE_TAGS {
            match collected.remove(&color) {
                Some(points) if points.len() >= 2 => {
                    let polyline = RoutePolyline::new(color, points)?;
                    debug!(
                        "[Geometry] Route {}: {} points, {:.0} m",
                        color,
                        polyline.points().len(),
                        polyline.total_length_m()
                    );
                    store.insert(polyline);
                }
                _ => warn!("[Geometry] No geometry for route {}", color),
            }
        }
        Ok(store)
    }

    /// Read and parse a fixture file.
    pub fn from_fixture_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let store = Self::parse_fixture(&source)?;
        info!(
            "[Geometry] Loaded {} route polylines from {}",
            store.len(),
            path.display()
        );
        Ok(store)
    }
}

/// Smallest angle between two bearings, degrees in `[0, 180]`.
fn angle_between(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

fn collect_pairs(line: &str, out: &mut Vec<GpsPoint>) {
    for caps in COORD_PAIR.captures_iter(line) {
        let lng = caps[1].parse::<f64>();
        let lat = caps[2].parse::<f64>();
        if let (Ok(lng), Ok(lat)) = (lng, lat) {
            let point = GpsPoint::new(lat, lng);
            if point.is_valid() {
                out.push(point);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    fn straight_line() -> RoutePolyline {
        // Three points heading north along a meridian, ~111m apart
        RoutePolyline::new(
            RouteColor::Blue,
            vec![
                GpsPoint::new(-6.350, 106.83),
                GpsPoint::new(-6.349, 106.83),
                GpsPoint::new(-6.348, 106.83),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_project_then_point_at_round_trip() {
        let line = RoutePolyline::new(
            RouteColor::Red,
            vec![GpsPoint::new(-6.36, 106.82), GpsPoint::new(-6.35, 106.83)],
        )
        .unwrap();
        let query = GpsPoint::new(-6.354, 106.827);
        let pos = line.project(&query).unwrap();
        let back = line.advance(pos.segment_index, pos.offset_m, 0.0).point;
        assert!(approx_eq(back.latitude, pos.point.latitude, 1e-9));
        assert!(approx_eq(back.longitude, pos.point.longitude, 1e-9));
    }

    #[test]
    fn test_project_clamps_to_endpoints() {
        let line = straight_line();
        let before = line.project(&GpsPoint::new(-6.360, 106.83)).unwrap();
        assert_eq!(before.segment_index, 0);
        assert_eq!(before.offset_m, 0.0);
        assert!(approx_eq(before.distance_from_route_m, 1112.0, 5.0));

        let after = line.project(&GpsPoint::new(-6.340, 106.83)).unwrap();
        assert_eq!(after.segment_index, 1);
        assert!(approx_eq(after.offset_m, line.segment_length(1), 1e-9));
    }

    #[test]
    fn test_project_lateral_offset() {
        let line = straight_line();
        // 0.0002 deg of longitude east of the midpoint of segment 0
        let pos = line.project(&GpsPoint::new(-6.3495, 106.8302)).unwrap();
        assert_eq!(pos.segment_index, 0);
        assert!(approx_eq(pos.offset_m, line.segment_length(0) / 2.0, 0.5));
        assert!(approx_eq(pos.distance_from_route_m, 22.1, 0.5));
    }

    #[test]
    fn test_project_heading_picks_matching_direction() {
        // Out along the meridian and back over the same road
        let line = RoutePolyline::new(
            RouteColor::Red,
            vec![
                GpsPoint::new(-6.36, 106.83),
                GpsPoint::new(-6.35, 106.83),
                GpsPoint::new(-6.36, 106.83),
            ],
        )
        .unwrap();
        let p = GpsPoint::new(-6.354, 106.83);

        let south = line.project_heading(&p, Some(180.0), 30.0).unwrap();
        assert_eq!(south.segment_index, 1);
        assert!(south.distance_from_route_m < 1e-6);
        let north = line.project_heading(&p, Some(10.0), 30.0).unwrap();
        assert_eq!(north.segment_index, 0);

        // Heading across the road matches neither direction: nearest wins
        let east = line.project_heading(&p, Some(90.0), 30.0).unwrap();
        assert_eq!(east, line.project(&p).unwrap());

        // Too far from the southbound segment to prefer it
        let off = GpsPoint::new(-6.354, 106.8305);
        let far = line.project_heading(&off, Some(180.0), 30.0).unwrap();
        assert_eq!(far, line.project(&off).unwrap());
    }

    #[test]
    fn test_advance_crosses_segments() {
        let line = straight_line();
        let seg0 = line.segment_length(0);
        let pos = line.advance(0, seg0 - 10.0, 30.0);
        assert_eq!(pos.segment_index, 1);
        assert!(approx_eq(pos.offset_m, 20.0, 1e-6));
        let walked = haversine_distance(&line.points()[0], &pos.point);
        assert!(approx_eq(walked, seg0 + 20.0, 0.5));
    }

    #[test]
    fn test_advance_stops_at_end() {
        let line = straight_line();
        let pos = line.advance(1, 0.0, 10_000.0);
        assert_eq!(pos.segment_index, 1);
        assert!(approx_eq(pos.offset_m, line.segment_length(1), 1e-9));
        assert!(haversine_distance(&pos.point, &line.points()[2]) < 1e-3);
    }

    #[test]
    fn test_too_few_points_rejected() {
        let result = RoutePolyline::new(RouteColor::Blue, vec![GpsPoint::new(0.0, 0.0)]);
        assert!(matches!(result, Err(TrackerError::Geometry { .. })));
    }

    #[test]
    fn test_parse_fixture() {
        let source = r#"
export const BLUE_NORMAL_ROUTE = {
  name: "blue",
  coordinates: [
    [106.8297, -6.3483], [106.8317, -6.3534],
    [106.8317, -6.3610],
  ],
  type: "LineString",
};
export const RED_NORMAL_ROUTE = {
  coordinates: [[106.8317, -6.3610], [106.8322, -6.3649]],
  type: "LineString",
};
export const RED_MORNING_ROUTE = {
  coordinates: [],
};
"#;
        let store = RouteGeometryStore::parse_fixture(source).unwrap();
        assert_eq!(store.len(), 2);

        let blue = store.get(RouteColor::Blue).unwrap();
        assert_eq!(blue.points().len(), 3);
        assert_eq!(blue.points()[0], GpsPoint::new(-6.3483, 106.8297));
        assert_eq!(store.get(RouteColor::Red).unwrap().points().len(), 2);
        assert!(store.get(RouteColor::ExpressRed).is_none());
        assert!(store.get(RouteColor::ExpressBlue).is_none());
    }

    #[test]
    fn test_best_route_falls_back_to_nearest() {
        let mut store = RouteGeometryStore::new();
        store.insert(straight_line());
        store.insert(
            RoutePolyline::new(
                RouteColor::Red,
                vec![GpsPoint::new(-6.350, 106.84), GpsPoint::new(-6.348, 106.84)],
            )
            .unwrap(),
        );

        let near_red = GpsPoint::new(-6.349, 106.8399);
        assert_eq!(
            store.best_route(&near_red, RouteColor::Blue).unwrap().color,
            RouteColor::Blue
        );
        assert_eq!(
            store.best_route(&near_red, RouteColor::Unknown).unwrap().color,
            RouteColor::Red
        );
        assert!(RouteGeometryStore::new()
            .best_route(&near_red, RouteColor::Unknown)
            .is_none());
    }
}
