//! Deterministic generators for wildfire records.
//!
//! Values follow fixed patterns (no randomness) so tests can assert on
//! exact counts and positions.

use chrono::{DateTime, Duration, TimeZone, Utc};
use fire_common::{RawRecord, RecordFields};
use serde_json::{json, Value};

const COUNTIES: [&str; 5] = ["Butte", "Sonoma", "Napa", "Shasta", "Los Angeles"];

/// A latitude used for points that fall outside California.
pub const OUT_OF_BOUNDS_LAT: f64 = 50.0;

/// Reference time for generated timestamps (2024-08-01T00:00:00Z).
pub fn reference_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap()
}

/// The `i`-th point of a fixed lattice covering inland California.
///
/// Points lie within 35.0..39.0 N and 122.0..118.0 W.
pub fn california_point(i: usize) -> (f64, f64) {
    let row = (i / 20) % 40;
    let col = i % 20;
    (35.0 + row as f64 * 0.1, -122.0 + col as f64 * 0.2)
}

/// Attributes of a fire perimeter feature.
///
/// Values are `fire_name = "FIRE-{i}"`, `fire_year = 2000 + i % 25`,
/// `acres = 100 * (i + 1)` and a county cycling through five names.
pub fn perimeter_fields(i: usize, lat: f64, lon: f64) -> RecordFields {
    let value = json!({
        "objectid": i + 1,
        "fire_name": format!("FIRE-{i}"),
        "fire_year": 2000 + (i % 25) as i64,
        "acres": 100.0 * (i + 1) as f64,
        "county": COUNTIES[i % COUNTIES.len()],
        "latitude": lat,
        "longitude": lon,
    });
    match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

/// Builds a batch of `n` perimeter records for `source`.
///
/// Indices listed in `out_of_bounds` get latitude [`OUT_OF_BOUNDS_LAT`].
pub fn perimeter_batch(source: &str, n: usize, out_of_bounds: &[usize]) -> Vec<RawRecord> {
    (0..n)
        .map(|i| {
            let (mut lat, lon) = california_point(i);
            if out_of_bounds.contains(&i) {
                lat = OUT_OF_BOUNDS_LAT;
            }
            RawRecord::new(source, i as u64, perimeter_fields(i, lat, lon))
                .with_id(format!("{}", i + 1))
        })
        .collect()
}

/// GeoJSON FeatureCollection text with the same content as [`perimeter_batch`].
///
/// Coordinates live in point geometries; properties use upper-case names
/// the way ArcGIS exports them.
pub fn perimeter_feature_collection(n: usize, out_of_bounds: &[usize]) -> String {
    let features: Vec<Value> = (0..n)
        .map(|i| {
            let (mut lat, lon) = california_point(i);
            if out_of_bounds.contains(&i) {
                lat = OUT_OF_BOUNDS_LAT;
            }
            let props: serde_json::Map<String, Value> = perimeter_fields(i, lat, lon)
                .into_iter()
                .filter(|(k, _)| k != "latitude" && k != "longitude")
                .map(|(k, v)| (k.to_uppercase(), v))
                .collect();
            json!({
                "type": "Feature",
                "properties": props,
                "geometry": {"type": "Point", "coordinates": [lon, lat]},
            })
        })
        .collect();

    json!({"type": "FeatureCollection", "features": features}).to_string()
}

/// CSV text with a header row and `n` perimeter rows.
pub fn perimeter_csv(n: usize) -> String {
    let mut out = String::from("OBJECTID,FIRE_NAME,FIRE_YEAR,ACRES,COUNTY,LATITUDE,LONGITUDE\n");
    for i in 0..n {
        let (lat, lon) = california_point(i);
        out.push_str(&format!(
            "{},FIRE-{i},{},{},{},{lat},{lon}\n",
            i + 1,
            2000 + i % 25,
            100 * (i + 1),
            COUNTIES[i % COUNTIES.len()],
        ));
    }
    out
}

/// An ArcGIS REST query page covering `objectid` values `start+1..=start+len`.
pub fn arcgis_page(start: usize, len: usize) -> Value {
    let features: Vec<Value> = (start..start + len)
        .map(|i| {
            let (lat, lon) = california_point(i);
            json!({
                "attributes": {
                    "OBJECTID": i + 1,
                    "FIRE_NAME": format!("FIRE-{i}"),
                    "FIRE_YEAR": 2000 + (i % 25),
                    "ACRES": 100 * (i + 1),
                },
                "geometry": {"x": lon, "y": lat},
            })
        })
        .collect();
    json!({ "features": features })
}

/// A streaming fire alert at minute `minute` after [`reference_time`].
pub fn alert_record(source: &str, seq: u64, lat: f64, lon: f64, severity: &str, minute: i64) -> RawRecord {
    let ts = reference_time() + Duration::minutes(minute);
    let value = json!({
        "alert_id": format!("ALERT-{seq:05}"),
        "fire_id": format!("FIRE-{}", seq % 7),
        "alert_type": "new_ignition",
        "severity": severity,
        "latitude": lat,
        "longitude": lon,
        "timestamp": ts.to_rfc3339(),
    });
    let fields = match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    };
    RawRecord::new(source, seq, fields).with_id(format!("ALERT-{seq:05}"))
}
