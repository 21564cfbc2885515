//! Minimal GeoJSON-compatible geometry model.
//!
//! Coordinates follow GeoJSON order: `[lon, lat]`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::bbox::BoundingBox;
use crate::error::{CommonError, CommonResult};

/// A linear ring of `[lon, lat]` positions.
pub type Ring = Vec<[f64; 2]>;

/// Geometry attached to an ingested record or a reference polygon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    Point { lon: f64, lat: f64 },
    /// Outer ring first, holes after.
    Polygon { rings: Vec<Ring> },
    MultiPolygon { polygons: Vec<Vec<Ring>> },
}

impl Geometry {
    /// Parse a GeoJSON geometry object.
    pub fn from_geojson(value: &Value) -> CommonResult<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CommonError::InvalidGeometry("missing geometry type".to_string()))?;
        let coords = value
            .get("coordinates")
            .ok_or_else(|| CommonError::InvalidGeometry("missing coordinates".to_string()))?;

        match kind {
            "Point" => {
                let [lon, lat] = parse_position(coords)?;
                Ok(Geometry::Point { lon, lat })
            }
            "Polygon" => Ok(Geometry::Polygon {
                rings: parse_rings(coords)?,
            }),
            "MultiPolygon" => {
                let polys = coords
                    .as_array()
                    .ok_or_else(|| CommonError::InvalidGeometry("MultiPolygon".to_string()))?;
                Ok(Geometry::MultiPolygon {
                    polygons: polys.iter().map(parse_rings).collect::<CommonResult<_>>()?,
                })
            }
            other => Err(CommonError::UnsupportedGeometry(other.to_string())),
        }
    }

    /// Parse an ArcGIS REST geometry (`{x, y}` points or `{rings}` polygons).
    pub fn from_arcgis(value: &Value) -> CommonResult<Self> {
        if let (Some(x), Some(y)) = (
            value.get("x").and_then(Value::as_f64),
            value.get("y").and_then(Value::as_f64),
        ) {
            return Ok(Geometry::Point { lon: x, lat: y });
        }
        if let Some(rings) = value.get("rings") {
            return Ok(Geometry::Polygon {
                rings: parse_rings(rings)?,
            });
        }
        Err(CommonError::InvalidGeometry(
            "ArcGIS geometry has neither x/y nor rings".to_string(),
        ))
    }

    /// Serialize back to a GeoJSON geometry object.
    pub fn to_geojson(&self) -> Value {
        match self {
            Geometry::Point { lon, lat } => json!({ "type": "Point", "coordinates": [lon, lat] }),
            Geometry::Polygon { rings } => json!({ "type": "Polygon", "coordinates": rings }),
            Geometry::MultiPolygon { polygons } => {
                json!({ "type": "MultiPolygon", "coordinates": polygons })
            }
        }
    }

    /// GeoJSON type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point { .. } => "Point",
            Geometry::Polygon { .. } => "Polygon",
            Geometry::MultiPolygon { .. } => "MultiPolygon",
        }
    }

    /// Polygons as lists of rings (a point yields none).
    pub fn polygons(&self) -> Vec<&[Ring]> {
        match self {
            Geometry::Point { .. } => Vec::new(),
            Geometry::Polygon { rings } => vec![rings.as_slice()],
            Geometry::MultiPolygon { polygons } => polygons.iter().map(Vec::as_slice).collect(),
        }
    }

    /// Bounding box over all positions.
    pub fn bounds(&self) -> Option<BoundingBox> {
        let mut positions = self.positions();
        let [lon, lat] = positions.next()?;
        let mut bbox = BoundingBox::from_point(lat, lon);
        for [lon, lat] in positions {
            bbox.extend(lat, lon);
        }
        Some(bbox)
    }

    /// A single representative location as (lat, lon).
    ///
    /// Points return themselves; polygons return the area-weighted centroid
    /// of the largest outer ring, or its bbox center for degenerate rings.
    pub fn representative_point(&self) -> Option<(f64, f64)> {
        match self {
            Geometry::Point { lon, lat } => Some((*lat, *lon)),
            _ => {
                let outer = self
                    .polygons()
                    .into_iter()
                    .filter_map(|rings| rings.first())
                    .max_by(|a, b| ring_area(a).abs().total_cmp(&ring_area(b).abs()))?;
                ring_centroid(outer)
            }
        }
    }

    fn positions(&self) -> Box<dyn Iterator<Item = [f64; 2]> + '_> {
        match self {
            Geometry::Point { lon, lat } => Box::new(std::iter::once([*lon, *lat])),
            Geometry::Polygon { rings } => Box::new(rings.iter().flatten().copied()),
            Geometry::MultiPolygon { polygons } => {
                Box::new(polygons.iter().flatten().flatten().copied())
            }
        }
    }
}

/// Signed shoelace area of a ring in squared degrees.
pub fn ring_area(ring: &[[f64; 2]]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..ring.len() {
        let [x1, y1] = ring[i];
        let [x2, y2] = ring[(i + 1) % ring.len()];
        sum += x1 * y2 - x2 * y1;
    }
    sum / 2.0
}

fn ring_centroid(ring: &[[f64; 2]]) -> Option<(f64, f64)> {
    if ring.is_empty() {
        return None;
    }
    let area = ring_area(ring);
    if area.abs() < 1e-12 {
        let mut bbox = BoundingBox::from_point(ring[0][1], ring[0][0]);
        for [lon, lat] in ring {
            bbox.extend(*lat, *lon);
        }
        return Some(bbox.center());
    }

    let (mut cx, mut cy) = (0.0, 0.0);
    for i in 0..ring.len() {
        let [x1, y1] = ring[i];
        let [x2, y2] = ring[(i + 1) % ring.len()];
        let cross = x1 * y2 - x2 * y1;
        cx += (x1 + x2) * cross;
        cy += (y1 + y2) * cross;
    }
    let factor = 1.0 / (6.0 * area);
    Some((cy * factor, cx * factor))
}

fn parse_position(value: &Value) -> CommonResult<[f64; 2]> {
    let arr = value
        .as_array()
        .filter(|a| a.len() >= 2)
        .ok_or_else(|| CommonError::InvalidGeometry(format!("bad position: {value}")))?;
    match (arr[0].as_f64(), arr[1].as_f64()) {
        (Some(lon), Some(lat)) => Ok([lon, lat]),
        _ => Err(CommonError::InvalidGeometry(format!("bad position: {value}"))),
    }
}

fn parse_rings(value: &Value) -> CommonResult<Vec<Ring>> {
    let rings = value
        .as_array()
        .ok_or_else(|| CommonError::InvalidGeometry("rings must be an array".to_string()))?;
    rings
        .iter()
        .map(|ring| {
            ring.as_array()
                .ok_or_else(|| CommonError::InvalidGeometry("ring must be an array".to_string()))?
                .iter()
                .map(parse_position)
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Value {
        json!({
            "type": "Polygon",
            "coordinates": [[[-121.0, 37.0], [-120.0, 37.0], [-120.0, 38.0], [-121.0, 38.0], [-121.0, 37.0]]]
        })
    }

    #[test]
    fn test_parse_point() {
        let g = Geometry::from_geojson(&json!({"type": "Point", "coordinates": [-122.4, 37.7]})).unwrap();
        assert_eq!(g, Geometry::Point { lon: -122.4, lat: 37.7 });
        assert_eq!(g.representative_point(), Some((37.7, -122.4)));
    }

    #[test]
    fn test_polygon_centroid_and_bounds() {
        let g = Geometry::from_geojson(&square()).unwrap();
        let (lat, lon) = g.representative_point().unwrap();
        assert!((lat - 37.5).abs() < 1e-9);
        assert!((lon + 120.5).abs() < 1e-9);
        assert_eq!(g.bounds(), Some(BoundingBox::new(-121.0, 37.0, -120.0, 38.0)));
    }

    #[test]
    fn test_unsupported_geometry() {
        let err = Geometry::from_geojson(&json!({"type": "LineString", "coordinates": []}));
        assert!(matches!(err, Err(CommonError::UnsupportedGeometry(_))));
    }

    #[test]
    fn test_arcgis_point() {
        let g = Geometry::from_arcgis(&json!({"x": -118.24, "y": 34.05})).unwrap();
        assert_eq!(g.representative_point(), Some((34.05, -118.24)));
    }

    #[test]
    fn test_geojson_roundtrip_shape() {
        let g = Geometry::from_geojson(&square()).unwrap();
        assert_eq!(Geometry::from_geojson(&g.to_geojson()).unwrap(), g);
    }
}
