//! Common fixtures: place names, reference polygons and rule files.

use fire_common::Geometry;
use serde_json::{json, Value};

/// Well-known California locations as (lat, lon).
pub mod places {
    /// Paradise, Butte County (Camp Fire, 2018)
    pub const PARADISE: (f64, f64) = (39.7596, -121.6219);

    /// Santa Rosa, Sonoma County (Tubbs Fire, 2017)
    pub const SANTA_ROSA: (f64, f64) = (38.4404, -122.7141);

    /// Redding, Shasta County (Carr Fire, 2018)
    pub const REDDING: (f64, f64) = (40.5865, -122.3917);

    /// Malibu, Los Angeles County (Woolsey Fire, 2018)
    pub const MALIBU: (f64, f64) = (34.0259, -118.7798);

    /// Reno, Nevada (outside California)
    pub const RENO: (f64, f64) = (39.5296, -119.8138);
}

/// An axis-aligned square polygon geometry.
pub fn square_geometry(min_lon: f64, min_lat: f64, size: f64) -> Geometry {
    Geometry::Polygon {
        rings: vec![vec![
            [min_lon, min_lat],
            [min_lon + size, min_lat],
            [min_lon + size, min_lat + size],
            [min_lon, min_lat + size],
            [min_lon, min_lat],
        ]],
    }
}

/// Simplified county boxes around [`places`], as a GeoJSON FeatureCollection.
///
/// Boxes are half a degree on a side and named after their county.
pub fn county_feature_collection() -> String {
    let counties = [
        ("06007", "Butte", places::PARADISE),
        ("06097", "Sonoma", places::SANTA_ROSA),
        ("06089", "Shasta", places::REDDING),
        ("06037", "Los Angeles", places::MALIBU),
    ];

    let features: Vec<Value> = counties
        .iter()
        .map(|(fips, name, (lat, lon))| {
            json!({
                "type": "Feature",
                "id": fips,
                "properties": {"NAME": name, "STATE": "CA"},
                "geometry": square_geometry(lon - 0.25, lat - 0.25, 0.5).to_geojson(),
            })
        })
        .collect();

    json!({"type": "FeatureCollection", "features": features}).to_string()
}

/// A minimal rule set YAML with one bounding box and one range rule.
pub const SIMPLE_RULESET_YAML: &str = r#"
name: simple
rules:
  - name: california_bounds
    severity: HIGH
    action: QUARANTINE
    check:
      type: bounding_box
      min_lat: 32.5
      max_lat: 42.0
      min_lon: -124.5
      max_lon: -114.0
  - name: acres_non_negative
    severity: MEDIUM
    action: QUARANTINE
    check:
      type: range
      field: acres
      min: 0
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_county_collection_has_four_features() {
        let doc: Value = serde_json::from_str(&county_feature_collection()).unwrap();
        assert_eq!(doc["features"].as_array().unwrap().len(), 4);
        assert_eq!(doc["features"][0]["id"], "06007");
    }

    #[test]
    fn test_square_geometry_bounds() {
        let bbox = square_geometry(-120.0, 37.0, 0.5).bounds().unwrap();
        assert_eq!(bbox.max_lon, -119.5);
        assert_eq!(bbox.max_lat, 37.5);
    }
}
