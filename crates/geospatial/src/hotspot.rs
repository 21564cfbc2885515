//! Windowed density hotspot detection over spatial cells.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cell::SpatialCell;

/// What is compared against the density threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotspotMetric {
    #[default]
    Count,
    SeverityWeighted,
}

/// Hotspot detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotspotConfig {
    /// A cell is a hotspot when its metric is strictly greater than this
    pub density_threshold: f64,
    /// Trailing window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,
    /// Cap on reported hotspots; `None` reports all
    #[serde(default)]
    pub max_hotspots: Option<usize>,
    #[serde(default)]
    pub metric: HotspotMetric,
}

fn default_window_secs() -> i64 {
    3600
}

impl Default for HotspotConfig {
    fn default() -> Self {
        Self {
            density_threshold: 3.0,
            window_secs: default_window_secs(),
            max_hotspots: Some(20),
            metric: HotspotMetric::Count,
        }
    }
}

impl HotspotConfig {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs.max(0))
    }
}

/// One enriched record as seen by the detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HotspotObservation {
    pub cell: SpatialCell,
    pub observed_at: DateTime<Utc>,
    /// Severity weight, used by [`HotspotMetric::SeverityWeighted`]
    pub weight: f64,
}

/// A flagged cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    pub cell: SpatialCell,
    pub count: usize,
    pub weighted_count: f64,
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
    /// Cell center as (lat, lon)
    pub center: (f64, f64),
}

/// Weight for a severity label: LOW 1, MEDIUM 2, HIGH 3, CRITICAL 4.
///
/// Unknown labels weigh 1.
pub fn severity_weight(label: &str) -> f64 {
    match label.to_ascii_uppercase().as_str() {
        "MEDIUM" => 2.0,
        "HIGH" => 3.0,
        "CRITICAL" => 4.0,
        _ => 1.0,
    }
}

/// Flag cells whose density within `[window_end - window, window_end]`
/// strictly exceeds the threshold.
///
/// Results are ordered by earliest observation, then by cell id, and
/// truncated to `max_hotspots`.
pub fn detect_hotspots(
    observations: &[HotspotObservation],
    config: &HotspotConfig,
    window_end: DateTime<Utc>,
) -> Vec<Hotspot> {
    let window_start = window_end - config.window();
    let mut by_cell: BTreeMap<SpatialCell, Hotspot> = BTreeMap::new();

    for obs in observations
        .iter()
        .filter(|o| o.observed_at >= window_start && o.observed_at <= window_end)
    {
        let entry = by_cell.entry(obs.cell).or_insert_with(|| Hotspot {
            cell: obs.cell,
            count: 0,
            weighted_count: 0.0,
            earliest: obs.observed_at,
            latest: obs.observed_at,
            center: obs.cell.center(),
        });
        entry.count += 1;
        entry.weighted_count += obs.weight;
        entry.earliest = entry.earliest.min(obs.observed_at);
        entry.latest = entry.latest.max(obs.observed_at);
    }

    let mut hotspots: Vec<Hotspot> = by_cell
        .into_values()
        .filter(|h| {
            let density = match config.metric {
                HotspotMetric::Count => h.count as f64,
                HotspotMetric::SeverityWeighted => h.weighted_count,
            };
            density > config.density_threshold
        })
        .collect();

    hotspots.sort_by(|a, b| a.earliest.cmp(&b.earliest).then_with(|| a.cell.cmp(&b.cell)));
    if let Some(max) = config.max_hotspots {
        hotspots.truncate(max);
    }

    debug!(
        observations = observations.len(),
        hotspots = hotspots.len(),
        threshold = config.density_threshold,
        "Hotspot detection complete"
    );
    hotspots
}
