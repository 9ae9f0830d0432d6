//! Planar geometry for routing: distance, single-step movement and polygon tests.
//!
//! The planner only talks to geometry through [`GeometryProvider`], so a service that
//! owns these primitives can be plugged in without touching the search.

use crate::models::{Position, RestrictedArea};

/// Default distance covered by one move, in degrees.
pub const DEFAULT_STEP_LENGTH: f64 = 0.00015;

/// Cross-product tolerance for "point lies on edge", in squared degrees.
const EDGE_EPS: f64 = 1e-12;

/// Geometry primitives consumed by the planner.
pub trait GeometryProvider: Send + Sync {
    /// Non-negative distance between two positions.
    fn distance(&self, a: Position, b: Position) -> f64;

    /// Position reached by one move from `from` along `heading_deg`
    /// (0 = east, counter-clockwise).
    fn move_step(&self, from: Position, heading_deg: f64) -> Position;

    /// Whether `point` lies inside `polygon` or on its boundary.
    fn point_in_polygon(&self, point: Position, polygon: &[Position]) -> bool;
}

/// Euclidean geometry on (lng, lat) treated as a flat plane.
#[derive(Debug, Clone, Copy)]
pub struct PlanarGeometry {
    step: f64,
}

impl PlanarGeometry {
    pub fn new(step: f64) -> Self {
        Self { step }
    }

    pub fn step(&self) -> f64 {
        self.step
    }
}

impl Default for PlanarGeometry {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_LENGTH)
    }
}

impl GeometryProvider for PlanarGeometry {
    fn distance(&self, a: Position, b: Position) -> f64 {
        a.planar_distance(&b)
    }

    fn move_step(&self, from: Position, heading_deg: f64) -> Position {
        let rad = heading_deg.to_radians();
        Position::new(from.lng + self.step * rad.cos(), from.lat + self.step * rad.sin())
    }

    fn point_in_polygon(&self, point: Position, polygon: &[Position]) -> bool {
        point_in_polygon_inclusive(point, polygon)
    }
}

/// Ray-casting containment where points on an edge or vertex count as inside.
pub fn point_in_polygon_inclusive(point: Position, polygon: &[Position]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let a = polygon[i];
        let b = polygon[j];
        if point_on_segment(point, a, b) {
            return true;
        }
        if ((a.lat > point.lat) != (b.lat > point.lat))
            && (point.lng < (b.lng - a.lng) * (point.lat - a.lat) / (b.lat - a.lat) + a.lng)
        {
            inside = !inside;
        }
        j = i;
    }

    inside
}

fn point_on_segment(p: Position, a: Position, b: Position) -> bool {
    let cross = (b.lng - a.lng) * (p.lat - a.lat) - (b.lat - a.lat) * (p.lng - a.lng);
    cross.abs() <= EDGE_EPS
        && p.lng >= a.lng.min(b.lng) - EDGE_EPS
        && p.lng <= a.lng.max(b.lng) + EDGE_EPS
        && p.lat >= a.lat.min(b.lat) - EDGE_EPS
        && p.lat <= a.lat.max(b.lat) + EDGE_EPS
}

/// Whether segments a1-a2 and b1-b2 touch or cross, collinear overlap included.
pub fn segments_intersect_2d(a1: Position, a2: Position, b1: Position, b2: Position) -> bool {
    fn orient(p: Position, q: Position, r: Position) -> f64 {
        (q.lng - p.lng) * (r.lat - p.lat) - (q.lat - p.lat) * (r.lng - p.lng)
    }

    fn within(a: f64, b: f64, value: f64) -> bool {
        let min = a.min(b) - EDGE_EPS;
        let max = a.max(b) + EDGE_EPS;
        value >= min && value <= max
    }

    fn on_segment(p: Position, q: Position, r: Position) -> bool {
        within(p.lng, q.lng, r.lng) && within(p.lat, q.lat, r.lat)
    }

    let o1 = orient(a1, a2, b1);
    let o2 = orient(a1, a2, b2);
    let o3 = orient(b1, b2, a1);
    let o4 = orient(b1, b2, a2);

    if o1.abs() <= EDGE_EPS && on_segment(a1, a2, b1) {
        return true;
    }
    if o2.abs() <= EDGE_EPS && on_segment(a1, a2, b2) {
        return true;
    }
    if o3.abs() <= EDGE_EPS && on_segment(b1, b2, a1) {
        return true;
    }
    if o4.abs() <= EDGE_EPS && on_segment(b1, b2, a2) {
        return true;
    }

    let a_crosses = (o1 > EDGE_EPS && o2 < -EDGE_EPS) || (o1 < -EDGE_EPS && o2 > EDGE_EPS);
    let b_crosses = (o3 > EDGE_EPS && o4 < -EDGE_EPS) || (o3 < -EDGE_EPS && o4 > EDGE_EPS);
    a_crosses && b_crosses
}

/// Whether the segment from-to touches any edge of the closed ring `polygon`.
pub fn segment_crosses_polygon(from: Position, to: Position, polygon: &[Position]) -> bool {
    let n = polygon.len();
    if n < 2 {
        return false;
    }
    (0..n).any(|i| segments_intersect_2d(from, to, polygon[i], polygon[(i + 1) % n]))
}

/// First area the straight segment from-to enters, touches or starts/ends in.
pub fn find_blocking_area<'a, G: GeometryProvider + ?Sized>(
    geometry: &G,
    from: Position,
    to: Position,
    areas: &'a [RestrictedArea],
) -> Option<&'a RestrictedArea> {
    areas.iter().find(|area| {
        let ring = area.ring();
        segment_crosses_polygon(from, to, ring)
            || geometry.point_in_polygon(from, ring)
            || geometry.point_in_polygon(to, ring)
    })
}

/// First area any hop of `path` runs into.
pub fn find_area_on_path<'a, G: GeometryProvider + ?Sized>(
    geometry: &G,
    path: &[Position],
    areas: &'a [RestrictedArea],
) -> Option<&'a RestrictedArea> {
    path.windows(2)
        .find_map(|hop| find_blocking_area(geometry, hop[0], hop[1], areas))
}
