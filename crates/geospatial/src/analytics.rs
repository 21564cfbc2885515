//! Aggregate statistics over validated records.
//!
//! These back the run summary: per-county / per-year rollups, yearly
//! trends, spatial coverage and damage severity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use fire_common::{BoundingBox, RawRecord};

/// Square kilometres per acre.
pub const KM2_PER_ACRE: f64 = 0.004_046_86;

/// Count/sum/mean/max of a value field within one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAggregate {
    /// Values of the group-by fields, in the order requested
    pub key: Vec<String>,
    pub count: usize,
    pub sum: f64,
    pub mean: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearTrend {
    pub year: i32,
    pub count: usize,
    pub total: f64,
    pub mean: Option<f64>,
}

/// Spatial extent of a record set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    pub points: usize,
    pub bounds: BoundingBox,
    /// Mean position as (lat, lon)
    pub centroid: (f64, f64),
}

#[derive(Default)]
struct Accumulator {
    count: usize,
    values: usize,
    sum: f64,
    max: Option<f64>,
}

impl Accumulator {
    fn push(&mut self, value: Option<f64>) {
        self.count += 1;
        if let Some(v) = value.filter(|v| v.is_finite()) {
            self.values += 1;
            self.sum += v;
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    fn mean(&self) -> Option<f64> {
        (self.values > 0).then(|| self.sum / self.values as f64)
    }
}

/// Group records by `group_by` fields and aggregate `value_field`.
///
/// Missing group values are reported as `"unknown"`. Records without a
/// numeric value still count but do not contribute to sum/mean/max.
pub fn aggregate_by(records: &[RawRecord], group_by: &[&str], value_field: &str) -> Vec<GroupAggregate> {
    let mut groups: BTreeMap<Vec<String>, Accumulator> = BTreeMap::new();

    for record in records {
        let key = group_by
            .iter()
            .map(|f| record.get_str(f).unwrap_or_else(|| "unknown".to_string()))
            .collect();
        groups.entry(key).or_default().push(record.get_f64(value_field));
    }

    groups
        .into_iter()
        .map(|(key, acc)| GroupAggregate {
            key,
            count: acc.count,
            sum: acc.sum,
            mean: acc.mean(),
            max: acc.max,
        })
        .collect()
}

/// Per-year totals of `value_field`, oldest year first.
pub fn yearly_trends(records: &[RawRecord], year_field: &str, value_field: &str) -> Vec<YearTrend> {
    let mut years: BTreeMap<i32, Accumulator> = BTreeMap::new();

    for record in records {
        let Some(year) = record.get_f64(year_field).filter(|y| y.is_finite()) else {
            continue;
        };
        years.entry(year as i32).or_default().push(record.get_f64(value_field));
    }

    years
        .into_iter()
        .map(|(year, acc)| YearTrend {
            year,
            count: acc.count,
            total: acc.sum,
            mean: acc.mean(),
        })
        .collect()
}

/// Bounds and centroid of all records with coordinates.
pub fn spatial_coverage(records: &[RawRecord]) -> Option<Coverage> {
    let mut points = records.iter().filter_map(RawRecord::coordinates);
    let (lat0, lon0) = points.next()?;

    let mut bounds = BoundingBox::from_point(lat0, lon0);
    let (mut lat_sum, mut lon_sum, mut n) = (lat0, lon0, 1usize);
    for (lat, lon) in points {
        bounds.extend(lat, lon);
        lat_sum += lat;
        lon_sum += lon;
        n += 1;
    }

    Some(Coverage {
        points: n,
        bounds,
        centroid: (lat_sum / n as f64, lon_sum / n as f64),
    })
}

/// Numeric weight of a damage level.
pub fn damage_weight(level: &str) -> Option<f64> {
    match level.trim().to_ascii_uppercase().as_str() {
        "MINOR" => Some(1.0),
        "MODERATE" => Some(2.0),
        "MAJOR" => Some(3.0),
        "DESTROYED" => Some(4.0),
        "UNKNOWN" => Some(0.5),
        _ => None,
    }
}

/// Mean damage weight over records whose `field` holds a known level.
pub fn damage_severity_score(records: &[RawRecord], field: &str) -> Option<f64> {
    let weights: Vec<f64> = records
        .iter()
        .filter_map(|r| r.get_str(field))
        .filter_map(|level| damage_weight(&level))
        .collect();
    (!weights.is_empty()).then(|| weights.iter().sum::<f64>() / weights.len() as f64)
}

pub fn estimated_area_km2(acres: f64) -> f64 {
    acres * KM2_PER_ACRE
}
