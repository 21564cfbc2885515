//! Run and per-source summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use geospatial::{Coverage, GroupAggregate, Hotspot, YearTrend};
use validation::BatchQuality;

use crate::alert::AlertEvent;
use crate::config::SourceKind;
use crate::quarantine::ErrorSummary;

/// How a source ended the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// Every pass ran to the end (or until cancellation)
    Completed,
    /// The source could not be reached or read; other sources kept running
    Degraded,
    /// The configuration was rejected before any connection attempt
    ConfigInvalid,
}

/// Aggregates over the accepted records of a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceAnalytics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<Coverage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupAggregate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub yearly: Vec<YearTrend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damage_severity: Option<f64>,
    pub estimated_area_km2: f64,
    /// Records the aggregates were computed from
    pub sampled: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub name: String,
    pub kind: SourceKind,
    pub status: SourceStatus,
    /// Records pulled from the connector (duplicates excluded)
    pub extracted: u64,
    pub written: u64,
    pub quarantined: u64,
    /// Records whose quarantine write failed after all retries
    #[serde(default)]
    pub quarantine_failed: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub retries: u64,
    pub passes: u64,
    pub timeouts: u64,
    pub quality: BatchQuality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub analytics: SourceAnalytics,
}

impl SourceSummary {
    pub fn new(name: impl Into<String>, kind: SourceKind, status: SourceStatus) -> Self {
        Self {
            name: name.into(),
            kind,
            status,
            extracted: 0,
            written: 0,
            quarantined: 0,
            quarantine_failed: 0,
            duplicates: 0,
            malformed: 0,
            retries: 0,
            passes: 0,
            timeouts: 0,
            quality: validation::summarize(&[]),
            detail: None,
            analytics: SourceAnalytics::default(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Everything a pipeline run produced, in one serializable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    /// In configuration order
    pub sources: Vec<SourceSummary>,
    pub hotspots: Vec<Hotspot>,
    pub errors: ErrorSummary,
    pub alerts: Vec<AlertEvent>,
}

impl RunSummary {
    pub fn source(&self, name: &str) -> Option<&SourceSummary> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn total_written(&self) -> u64 {
        self.sources.iter().map(|s| s.written).sum()
    }

    pub fn total_quarantined(&self) -> u64 {
        self.sources.iter().map(|s| s.quarantined).sum()
    }
}
