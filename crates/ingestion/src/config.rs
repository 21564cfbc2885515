//! Source and pipeline configuration.
//!
//! A [`SourceConfig`] describes one source. It is deserialized once at
//! startup, checked with [`SourceConfig::validate`] and never mutated while
//! the pipeline runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use geospatial::HotspotConfig;

use crate::alert::AlertConfig;
use crate::enrich::EnrichmentConfig;
use crate::error::{IngestionError, Result};
use crate::retry::RetryPolicy;

/// The three source timing models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Batch,
    Api,
    Stream,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Batch => "batch",
            SourceKind::Api => "api",
            SourceKind::Stream => "stream",
        }
    }

    fn default_schedule(&self) -> ScheduleMode {
        match self {
            SourceKind::Batch => ScheduleMode::Once,
            SourceKind::Api => ScheduleMode::Interval,
            SourceKind::Stream => ScheduleMode::Continuous,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How often a source is extracted, as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    Once,
    Interval,
    Continuous,
}

/// Resolved schedule of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Extract a single pass, then finish
    Once,
    /// Extract a pass, wait, repeat until cancelled
    Interval(Duration),
    /// Extract one never-ending pass until the feed closes or is cancelled
    Continuous,
}

/// Input format of batch files and API pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatHint {
    Geojson,
    Csv,
    Ndjson,
    Json,
    Arcgis,
}

/// Key used to recognise records already seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DedupKey {
    /// Value of a record field (lower-case name)
    Field(String),
    /// SHA-256 of the record's canonical field JSON
    ContentHash,
}

impl From<String> for DedupKey {
    fn from(s: String) -> Self {
        let s = s.trim();
        match s {
            "content_hash" => DedupKey::ContentHash,
            _ => DedupKey::Field(s.strip_prefix("field:").unwrap_or(s).to_lowercase()),
        }
    }
}

impl From<DedupKey> for String {
    fn from(key: DedupKey) -> Self {
        match key {
            DedupKey::Field(f) => f,
            DedupKey::ContentHash => "content_hash".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_key")]
    pub key: DedupKey,
    /// Number of recent keys remembered
    #[serde(default = "default_dedup_window")]
    pub window: usize,
}

fn default_dedup_key() -> DedupKey {
    DedupKey::Field("objectid".to_string())
}

fn default_dedup_window() -> usize {
    10_000
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            key: default_dedup_key(),
            window: default_dedup_window(),
        }
    }
}

/// Configuration of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    /// File/directory path, HTTP endpoint, or `tcp://host:port` / `memory://`
    pub location: String,
    /// Defaults to once for batch, interval for api, continuous for stream
    #[serde(default)]
    pub schedule: Option<ScheduleMode>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub format_hint: Option<FormatHint>,
    /// Opaque handle naming where credentials live; never the secret itself
    #[serde(default)]
    pub credentials_ref: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Rule set name; defaults to the source name
    #[serde(default)]
    pub ruleset: Option<String>,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_minutes() -> u64 {
    5
}

fn default_page_size() -> usize {
    1000
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_batch_size() -> usize {
    500
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    /// A config with defaults for everything but name, kind and location.
    pub fn new(name: impl Into<String>, kind: SourceKind, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            location: location.into(),
            schedule: None,
            poll_interval_secs: None,
            format_hint: None,
            credentials_ref: None,
            max_retries: default_max_retries(),
            timeout_minutes: default_timeout_minutes(),
            ruleset: None,
            dedup: DedupConfig::default(),
            page_size: default_page_size(),
            buffer_capacity: default_buffer_capacity(),
            batch_size: default_batch_size(),
            enabled: true,
        }
    }

    /// The explicit schedule, or the kind's default.
    pub fn schedule(&self) -> Schedule {
        match self.schedule.unwrap_or_else(|| self.kind.default_schedule()) {
            ScheduleMode::Once => Schedule::Once,
            ScheduleMode::Continuous => Schedule::Continuous,
            ScheduleMode::Interval => {
                Schedule::Interval(Duration::from_secs(self.poll_interval_secs.unwrap_or(300)))
            }
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }

    pub fn ruleset_name(&self) -> &str {
        self.ruleset.as_deref().unwrap_or(&self.name)
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(IngestionError::FatalConfig(format!("{}: {msg}", self.name)));

        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return fail("name must be non-empty and use only [A-Za-z0-9_-]".to_string());
        }
        if self.location.trim().is_empty() {
            return fail("location is empty".to_string());
        }
        if self.timeout_minutes == 0 {
            return fail("timeout_minutes must be positive".to_string());
        }
        if self.page_size == 0 || self.buffer_capacity == 0 || self.batch_size == 0 {
            return fail("page_size, buffer_capacity and batch_size must be positive".to_string());
        }
        if self.dedup.window == 0 {
            return fail("dedup window must be positive".to_string());
        }
        if let Schedule::Interval(every) = self.schedule() {
            if every.is_zero() {
                return fail("poll_interval_secs must be positive".to_string());
            }
        }

        match self.kind {
            SourceKind::Api => {
                if !(self.location.starts_with("http://") || self.location.starts_with("https://")) {
                    return fail(format!("api location '{}' is not an http(s) URL", self.location));
                }
            }
            SourceKind::Stream => {
                if !(self.location.starts_with("tcp://") || self.location.starts_with("memory://")) {
                    return fail(format!("stream location '{}' must be tcp:// or memory://", self.location));
                }
            }
            SourceKind::Batch => {
                if self.schedule() == Schedule::Continuous {
                    return fail("batch sources cannot run continuously".to_string());
                }
            }
        }
        if self.kind != SourceKind::Stream && self.schedule() == Schedule::Continuous {
            return fail("only stream sources run continuously".to_string());
        }
        Ok(())
    }
}

/// Pipeline-wide settings shared by every source worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub hotspots: HotspotConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

/// Field names used for the per-source analytics in the run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_group_by")]
    pub group_by: Vec<String>,
    #[serde(default = "default_value_field")]
    pub value_field: String,
    #[serde(default = "default_year_field")]
    pub year_field: String,
    #[serde(default = "default_damage_field")]
    pub damage_field: String,
    /// Event time used for hotspot windows; ingestion time when absent
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    /// Severity label used for weighted hotspots
    #[serde(default = "default_severity_field")]
    pub severity_field: String,
    /// Accepted records kept per source for analytics
    #[serde(default = "default_sample_limit")]
    pub sample_limit: usize,
}

fn default_group_by() -> Vec<String> {
    vec!["county".to_string()]
}

fn default_value_field() -> String {
    "acres".to_string()
}

fn default_year_field() -> String {
    "fire_year".to_string()
}

fn default_damage_field() -> String {
    "damage_level".to_string()
}

fn default_timestamp_field() -> String {
    "timestamp".to_string()
}

fn default_severity_field() -> String {
    "severity".to_string()
}

fn default_sample_limit() -> usize {
    50_000
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            group_by: default_group_by(),
            value_field: default_value_field(),
            year_field: default_year_field(),
            damage_field: default_damage_field(),
            timestamp_field: default_timestamp_field(),
            severity_field: default_severity_field(),
            sample_limit: default_sample_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_defaults_follow_kind() {
        assert_eq!(SourceConfig::new("a", SourceKind::Batch, "/data").schedule(), Schedule::Once);
        assert_eq!(
            SourceConfig::new("b", SourceKind::Api, "https://x").schedule(),
            Schedule::Interval(Duration::from_secs(300))
        );
        assert_eq!(
            SourceConfig::new("c", SourceKind::Stream, "memory://c").schedule(),
            Schedule::Continuous
        );
    }

    #[test]
    fn test_explicit_schedule_wins() {
        let mut cfg = SourceConfig::new("api", SourceKind::Api, "https://x");
        cfg.schedule = Some(ScheduleMode::Once);
        assert_eq!(cfg.schedule(), Schedule::Once);
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(SourceConfig::new("ok", SourceKind::Batch, "/data").validate().is_ok());
        assert!(SourceConfig::new("bad name", SourceKind::Batch, "/data").validate().is_err());
        assert!(SourceConfig::new("api", SourceKind::Api, "/not/a/url").validate().is_err());
        assert!(SourceConfig::new("s", SourceKind::Stream, "kafka://x").validate().is_err());

        let mut cfg = SourceConfig::new("b", SourceKind::Batch, "/data");
        cfg.schedule = Some(ScheduleMode::Continuous);
        assert!(matches!(cfg.validate(), Err(IngestionError::FatalConfig(_))));

        let mut cfg = SourceConfig::new("b", SourceKind::Batch, "/data");
        cfg.batch_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_dedup_key_parsing() {
        assert_eq!(DedupKey::from("content_hash".to_string()), DedupKey::ContentHash);
        assert_eq!(DedupKey::from("field:OBJECTID".to_string()), DedupKey::Field("objectid".into()));
        assert_eq!(DedupKey::from("alert_id".to_string()), DedupKey::Field("alert_id".into()));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let yaml = r#"
name: calfire_perimeters
kind: api
location: https://services1.arcgis.com/query
poll_interval_secs: 600
dedup:
  key: content_hash
"#;
        let cfg: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.timeout_minutes, 5);
        assert_eq!(cfg.dedup.key, DedupKey::ContentHash);
        assert_eq!(cfg.dedup.window, 10_000);
        assert_eq!(cfg.schedule(), Schedule::Interval(Duration::from_secs(600)));
        assert_eq!(cfg.ruleset_name(), "calfire_perimeters");
    }
}
