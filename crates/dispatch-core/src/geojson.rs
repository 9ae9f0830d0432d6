//! GeoJSON export of planned flight paths.
//!
//! Each routed sortie becomes a `LineString` feature and each restricted area a
//! `Polygon` feature, collected into one `FeatureCollection`. Coordinates are
//! `[lng, lat]`.

use serde_json::{json, Value};

use crate::models::{FlightLeg, Position, RestrictedArea};
use crate::routing::RoutedAssignment;

/// All points of a sortie in flight order. Each leg after the first drops its
/// first point, which repeats where the previous leg ended.
pub fn sortie_path(legs: &[FlightLeg]) -> Vec<Position> {
    let mut path: Vec<Position> = Vec::new();
    for leg in legs {
        let skip = usize::from(!path.is_empty());
        path.extend(leg.flight_path.iter().skip(skip).copied());
    }
    path
}

fn coordinates(points: &[Position]) -> Vec<[f64; 2]> {
    points.iter().map(|p| [p.lng, p.lat]).collect()
}

/// `LineString` feature for one drone's path. `None` below two points.
pub fn path_feature(drone_id: &str, path: &[Position]) -> Option<Value> {
    if path.len() < 2 {
        return None;
    }
    Some(json!({
        "type": "Feature",
        "geometry": {
            "type": "LineString",
            "coordinates": coordinates(path),
        },
        "properties": {
            "name": "Drone Delivery Path",
            "droneId": drone_id,
            "type": "drone_path",
        },
    }))
}

/// Closed `Polygon` feature for a restricted area. `None` for a degenerate ring.
pub fn area_feature(area: &RestrictedArea) -> Option<Value> {
    let ring = area.ring();
    if ring.len() < 3 {
        return None;
    }
    let mut closed = coordinates(ring);
    closed.push([ring[0].lng, ring[0].lat]);

    let mut properties = json!({
        "name": area.name,
        "type": "restricted_area",
    });
    if let Some(id) = area.id {
        properties["areaId"] = json!(id);
    }

    Some(json!({
        "type": "Feature",
        "geometry": {
            "type": "Polygon",
            "coordinates": [closed],
        },
        "properties": properties,
    }))
}

/// One feature per routed sortie, then one per restricted area. Sorties and areas
/// too short to draw are skipped; with nothing to draw the collection is empty.
pub fn feature_collection(assignments: &[RoutedAssignment], areas: &[RestrictedArea]) -> Value {
    let paths = assignments
        .iter()
        .filter_map(|routed| path_feature(&routed.drone_id, &sortie_path(&routed.legs)));
    let polygons = areas.iter().filter_map(area_feature);

    json!({
        "type": "FeatureCollection",
        "features": paths.chain(polygons).collect::<Vec<Value>>(),
    })
}
