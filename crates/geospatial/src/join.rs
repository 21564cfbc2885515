//! Point-to-reference-polygon join.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::geometry::{distance_to_rings_m, point_in_polygon};
use crate::reference::ReferenceIndex;

/// Outcome of matching a point against the reference set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinResult {
    pub polygon_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// True when the point lies inside (or on the edge of) the polygon
    pub contained: bool,
    /// Distance to the polygon edge in meters; 0 when contained
    pub distance_m: f64,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// Match a point against the reference index.
///
/// Containing polygons win; among several, the one registered first is
/// chosen. Otherwise the nearest polygon within `buffer_m` is returned,
/// ties again going to the earlier polygon. Only polygons bucketed under the
/// point's coarse cell or its neighbours are examined.
pub fn spatial_join(lat: f64, lon: f64, index: &ReferenceIndex, buffer_m: f64) -> Option<JoinResult> {
    let candidates = index.candidates(lat, lon, buffer_m.max(0.0));

    for &(idx, polygon) in &candidates {
        if !index.bounds_of(idx).contains_point(lat, lon) {
            continue;
        }
        if polygon
            .geometry
            .polygons()
            .into_iter()
            .any(|rings| point_in_polygon(lat, lon, rings))
        {
            return Some(JoinResult {
                polygon_id: polygon.id.clone(),
                name: polygon.name.clone(),
                contained: true,
                distance_m: 0.0,
                attributes: polygon.attributes.clone(),
            });
        }
    }

    if buffer_m <= 0.0 {
        return None;
    }

    let mut best: Option<(f64, usize)> = None;
    for &(idx, polygon) in &candidates {
        let distance = polygon
            .geometry
            .polygons()
            .into_iter()
            .map(|rings| distance_to_rings_m(lat, lon, rings))
            .fold(f64::INFINITY, f64::min);

        if distance <= buffer_m && best.map_or(true, |(d, _)| distance < d) {
            best = Some((distance, idx));
        }
    }

    best.map(|(distance_m, idx)| {
        let polygon = &index.polygons()[idx];
        JoinResult {
            polygon_id: polygon.id.clone(),
            name: polygon.name.clone(),
            contained: false,
            distance_m,
            attributes: polygon.attributes.clone(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferencePolygon;
    use fire_common::Geometry;

    fn square(id: &str, min_lon: f64, min_lat: f64, size: f64) -> ReferencePolygon {
        ReferencePolygon::new(
            id,
            Geometry::Polygon {
                rings: vec![vec![
                    [min_lon, min_lat],
                    [min_lon + size, min_lat],
                    [min_lon + size, min_lat + size],
                    [min_lon, min_lat + size],
                    [min_lon, min_lat],
                ]],
            },
        )
    }

    #[test]
    fn test_containment_prefers_first_registered() {
        let index = ReferenceIndex::build(
            vec![square("a", -120.0, 37.0, 0.5), square("b", -120.0, 37.0, 0.5)],
            5,
        )
        .unwrap();
        let join = spatial_join(37.25, -119.75, &index, 0.0).unwrap();
        assert_eq!(join.polygon_id, "a");
        assert!(join.contained);
        assert_eq!(join.distance_m, 0.0);
    }

    #[test]
    fn test_edge_point_is_contained() {
        let index = ReferenceIndex::build(vec![square("a", -120.0, 37.0, 0.5)], 5).unwrap();
        let join = spatial_join(37.0, -119.75, &index, 0.0).unwrap();
        assert!(join.contained);
    }

    #[test]
    fn test_buffered_match_picks_nearest() {
        let index = ReferenceIndex::build(
            vec![square("far", -120.0, 37.0, 0.1), square("near", -119.85, 37.0, 0.1)],
            5,
        )
        .unwrap();
        // Between the two squares, 0.01 deg from "near" and 0.04 deg from "far"
        let join = spatial_join(37.05, -119.86, &index, 5_000.0).unwrap();
        assert_eq!(join.polygon_id, "near");
        assert!(!join.contained);
        assert!(join.distance_m > 800.0 && join.distance_m < 1_000.0, "got {}", join.distance_m);
    }

    #[test]
    fn test_outside_buffer_is_none() {
        let index = ReferenceIndex::build(vec![square("a", -120.0, 37.0, 0.1)], 5).unwrap();
        assert!(spatial_join(37.05, -119.5, &index, 1_000.0).is_none());
        assert!(spatial_join(37.05, -119.5, &index, 0.0).is_none());
    }
}
