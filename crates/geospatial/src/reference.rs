//! Reference polygon set, bucketed by coarse spatial cell.
//!
//! Each polygon is registered under every coarse cell that its bounding box
//! touches, plus one ring of neighbours. A point then only needs to be tested
//! against the polygons registered under its own coarse cell (for
//! containment) or a small disk around it (for buffered matching).

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use fire_common::{BoundingBox, Geometry};

use crate::cell::{assign_cell, edge_degrees, SpatialCell, MAX_RESOLUTION};
use crate::error::{Result, SpatialError};
use crate::geometry::EARTH_RADIUS_M;

/// Default coarse resolution for bucketing (edge ~0.375 deg, ~33 km).
pub const DEFAULT_COARSE_RESOLUTION: u8 = 5;

const SQRT_3: f64 = 1.732_050_807_568_877_2;

/// A named reference polygon (county, fire perimeter, response unit, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencePolygon {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub geometry: Geometry,
}

impl ReferencePolygon {
    pub fn new(id: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            id: id.into(),
            name: None,
            attributes: Map::new(),
            geometry,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Read-only reference set with a coarse cell bucket index.
#[derive(Debug, Clone)]
pub struct ReferenceIndex {
    coarse_resolution: u8,
    polygons: Vec<ReferencePolygon>,
    bounds: Vec<BoundingBox>,
    buckets: HashMap<SpatialCell, Vec<usize>>,
}

impl ReferenceIndex {
    /// Build the bucket index. Point geometries are rejected.
    pub fn build(polygons: Vec<ReferencePolygon>, coarse_resolution: u8) -> Result<Self> {
        if coarse_resolution > MAX_RESOLUTION {
            return Err(SpatialError::InvalidResolution(coarse_resolution));
        }

        let mut buckets: HashMap<SpatialCell, Vec<usize>> = HashMap::new();
        let mut bounds = Vec::with_capacity(polygons.len());

        for (idx, polygon) in polygons.iter().enumerate() {
            if polygon.geometry.polygons().is_empty() {
                return Err(SpatialError::Reference(format!(
                    "reference '{}' is a {}, expected a polygon",
                    polygon.id,
                    polygon.geometry.type_name()
                )));
            }
            let bbox = polygon
                .geometry
                .bounds()
                .ok_or_else(|| SpatialError::Reference(format!("reference '{}' is empty", polygon.id)))?;

            for cell in covering_cells(&bbox, coarse_resolution)? {
                buckets.entry(cell).or_default().push(idx);
            }
            bounds.push(bbox);
        }

        for members in buckets.values_mut() {
            members.sort_unstable();
            members.dedup();
        }

        info!(
            polygons = polygons.len(),
            buckets = buckets.len(),
            coarse_resolution,
            "Built reference polygon index"
        );

        Ok(Self {
            coarse_resolution,
            polygons,
            bounds,
            buckets,
        })
    }

    /// Parse a GeoJSON FeatureCollection of polygons.
    ///
    /// The polygon id comes from the feature `id`, else an `id`/`objectid`
    /// property, else the feature position.
    pub fn from_geojson_str(content: &str, coarse_resolution: u8) -> Result<Self> {
        let doc: Value = serde_json::from_str(content)?;
        let features = doc
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| SpatialError::Reference("missing 'features' array".to_string()))?;

        let mut polygons = Vec::with_capacity(features.len());
        for (pos, feature) in features.iter().enumerate() {
            let geometry = feature
                .get("geometry")
                .ok_or_else(|| SpatialError::Reference(format!("feature {pos} has no geometry")))?;
            let properties: Map<String, Value> = feature
                .get("properties")
                .and_then(Value::as_object)
                .map(|props| props.iter().map(|(k, v)| (k.to_lowercase(), v.clone())).collect())
                .unwrap_or_default();

            let id = feature
                .get("id")
                .or_else(|| properties.get("id"))
                .or_else(|| properties.get("objectid"))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| pos.to_string());
            let name = properties
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string);

            polygons.push(ReferencePolygon {
                id,
                name,
                attributes: properties,
                geometry: Geometry::from_geojson(geometry)?,
            });
        }

        Self::build(polygons, coarse_resolution)
    }

    /// Load a GeoJSON FeatureCollection from disk.
    pub fn from_path(path: impl AsRef<Path>, coarse_resolution: u8) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_geojson_str(&content, coarse_resolution)
    }

    pub fn coarse_resolution(&self) -> u8 {
        self.coarse_resolution
    }

    pub fn len(&self) -> usize {
        self.polygons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }

    pub fn polygons(&self) -> &[ReferencePolygon] {
        &self.polygons
    }

    /// Polygons that may contain, or lie within `buffer_m` of, the point.
    ///
    /// Returned in index order so callers get deterministic tie-breaking.
    pub fn candidates(&self, lat: f64, lon: f64, buffer_m: f64) -> Vec<(usize, &ReferencePolygon)> {
        let Ok(cell) = assign_cell(lat, lon, self.coarse_resolution) else {
            return Vec::new();
        };

        let steps = rings_for_buffer(lat, buffer_m, self.coarse_resolution);
        let indices: BTreeSet<usize> = cell
            .disk(steps)
            .iter()
            .filter_map(|c| self.buckets.get(c))
            .flatten()
            .copied()
            .collect();

        debug!(lat, lon, candidates = indices.len(), "Reference candidates");
        indices.into_iter().map(|i| (i, &self.polygons[i])).collect()
    }

    pub(crate) fn bounds_of(&self, idx: usize) -> &BoundingBox {
        &self.bounds[idx]
    }
}

/// Extra hexagon rings needed so a disk around the point covers the buffer.
fn rings_for_buffer(lat: f64, buffer_m: f64, resolution: u8) -> u32 {
    if buffer_m <= 0.0 {
        return 0;
    }
    let m_per_deg_lon = EARTH_RADIUS_M.to_radians() * lat.to_radians().cos().max(0.01);
    let buffer_deg = buffer_m / m_per_deg_lon;
    let inradius = edge_degrees(resolution) * SQRT_3 / 2.0;
    (buffer_deg / inradius).ceil() as u32
}

/// Coarse cells touched by a bounding box, grown by one ring.
fn covering_cells(bbox: &BoundingBox, resolution: u8) -> Result<BTreeSet<SpatialCell>> {
    let step = edge_degrees(resolution) / 2.0;
    let mut cells = BTreeSet::new();

    let mut lat = bbox.min_lat;
    loop {
        let mut lon = bbox.min_lon;
        loop {
            cells.insert(assign_cell(lat.clamp(-90.0, 90.0), lon.clamp(-180.0, 180.0), resolution)?);
            if lon >= bbox.max_lon {
                break;
            }
            lon = (lon + step).min(bbox.max_lon);
        }
        if lat >= bbox.max_lat {
            break;
        }
        lat = (lat + step).min(bbox.max_lat);
    }

    let ringed = cells.iter().flat_map(|c| c.disk(1)).collect();
    Ok(ringed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

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
    fn test_candidates_limited_to_nearby_buckets() {
        let index = ReferenceIndex::build(
            vec![square("north", -122.0, 40.0, 0.2), square("south", -117.0, 33.0, 0.2)],
            DEFAULT_COARSE_RESOLUTION,
        )
        .unwrap();

        let near_north: Vec<_> = index
            .candidates(40.1, -121.9, 0.0)
            .into_iter()
            .map(|(_, p)| p.id.clone())
            .collect();
        assert_eq!(near_north, vec!["north".to_string()]);

        assert!(index.candidates(36.0, -119.0, 0.0).is_empty());
    }

    #[test]
    fn test_rejects_point_reference() {
        let err = ReferenceIndex::build(
            vec![ReferencePolygon::new("pt", Geometry::Point { lon: 0.0, lat: 0.0 })],
            4,
        );
        assert!(matches!(err, Err(SpatialError::Reference(_))));
    }

    #[test]
    fn test_from_geojson() {
        let doc = json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {"NAME": "Butte", "OBJECTID": 7},
                "geometry": {"type": "Polygon", "coordinates": [[[-122.0, 39.5], [-121.5, 39.5], [-121.5, 40.0], [-122.0, 39.5]]]}
            }]
        });
        let index = ReferenceIndex::from_geojson_str(&doc.to_string(), 5).unwrap();
        assert_eq!(index.len(), 1);
        let polygon = &index.polygons()[0];
        assert_eq!(polygon.id, "7");
        assert_eq!(polygon.name.as_deref(), Some("Butte"));
    }

    #[test]
    fn test_missing_features_is_error() {
        let err = ReferenceIndex::from_geojson_str(r#"{"type": "Feature"}"#, 5);
        assert!(matches!(err, Err(SpatialError::Reference(_))));
    }

    #[test]
    fn test_buffer_rings_grow_with_distance() {
        assert_eq!(rings_for_buffer(37.0, 0.0, 5), 0);
        assert!(rings_for_buffer(37.0, 100_000.0, 5) > rings_for_buffer(37.0, 1_000.0, 5));
    }
}
