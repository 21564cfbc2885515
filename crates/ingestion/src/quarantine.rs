//! Error records and quarantine entries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fire_common::RawRecord;
use validation::{Severity, ValidationResult};

use crate::error::{ErrorKind, IngestionError};

/// Reason code for records abandoned by a timeout or cancellation.
pub const REASON_CANCELLED: &str = "cancelled";
/// Reason code for records that could not be written to the sink.
pub const REASON_SINK_UNAVAILABLE: &str = "sink_unavailable";
/// Reason code for source operations that failed permanently.
pub const REASON_SOURCE_FAILURE: &str = "source_failure";

/// Pipeline stage where an error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Connect,
    Extract,
    Validate,
    Enrich,
    Sink,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::Extract => "extract",
            Stage::Validate => "validate",
            Stage::Enrich => "enrich",
            Stage::Sink => "sink",
        }
    }
}

/// One failure, as recorded by the error handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error_id: Uuid,
    pub kind: ErrorKind,
    pub stage: Stage,
    pub source: String,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
    pub cause: String,
    pub severity: Severity,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, stage: Stage, source: &str, cause: impl Into<String>) -> Self {
        Self {
            error_id: Uuid::new_v4(),
            kind,
            stage,
            source: source.to_string(),
            retry_count: 0,
            timestamp: Utc::now(),
            cause: cause.into(),
            severity: default_severity(kind),
        }
    }

    /// Build from an ingestion error, unwrapping retry exhaustion.
    pub fn from_error(error: &IngestionError, stage: Stage, source: &str) -> Self {
        let mut record = Self::new(error.kind(), stage, source, error.to_string());
        if let IngestionError::RetriesExhausted { attempts, .. } = error {
            record.retry_count = attempts.saturating_sub(1);
        }
        record
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

fn default_severity(kind: ErrorKind) -> Severity {
    match kind {
        ErrorKind::Schema | ErrorKind::FatalConfig | ErrorKind::NotRestartable => Severity::Critical,
        ErrorKind::Connection | ErrorKind::RetriesExhausted | ErrorKind::Io => Severity::High,
        ErrorKind::ValidationFailure | ErrorKind::Timeout | ErrorKind::Cancelled => Severity::Medium,
        ErrorKind::TransientIo => Severity::Low,
    }
}

/// A record set aside instead of being written to the sink. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub record: RawRecord,
    pub error: ErrorRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    pub reason: String,
    /// Rules that triggered, when the entry comes from validation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<String>,
    pub quarantined_at: DateTime<Utc>,
}

impl QuarantineEntry {
    /// Entry for a record that failed validation.
    pub fn rejected(record: RawRecord, validation: ValidationResult) -> Self {
        let rules: Vec<String> = validation.rule_names().into_iter().map(str::to_string).collect();
        let kind = if record.is_malformed() {
            ErrorKind::Schema
        } else {
            ErrorKind::ValidationFailure
        };
        let severity = validation
            .triggered
            .iter()
            .map(|t| t.severity)
            .max()
            .unwrap_or(Severity::Medium);
        let reason = validation
            .primary_reason()
            .unwrap_or(validation::reason::SCHEMA_MISMATCH)
            .to_string();

        let error = ErrorRecord::new(kind, Stage::Validate, &record.source, format!("rules triggered: {}", rules.join(", ")))
            .with_retry_count(record.retry_count)
            .with_severity(severity);

        Self {
            record,
            error,
            validation: Some(validation),
            reason,
            rules,
            quarantined_at: Utc::now(),
        }
    }

    /// Entry for a record (or placeholder) that hit an operational failure.
    pub fn failed(record: RawRecord, error: ErrorRecord, reason: impl Into<String>) -> Self {
        Self {
            record,
            error,
            validation: None,
            reason: reason.into(),
            rules: Vec::new(),
            quarantined_at: Utc::now(),
        }
    }
}

/// Counts of errors by kind, source and severity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub total: usize,
    pub by_kind: BTreeMap<ErrorKind, usize>,
    pub by_source: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_reason: BTreeMap<String, usize>,
}

impl ErrorSummary {
    /// Summarize entries quarantined at or after `since`.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a QuarantineEntry>, since: DateTime<Utc>) -> Self {
        let mut summary = Self::default();
        for entry in entries.into_iter().filter(|e| e.quarantined_at >= since) {
            summary.add(entry);
        }
        summary
    }

    pub fn add(&mut self, entry: &QuarantineEntry) {
        self.record(&entry.error, &entry.reason);
    }

    /// Count an error that produced no quarantine entry.
    pub fn record(&mut self, error: &ErrorRecord, reason: &str) {
        self.total += 1;
        *self.by_kind.entry(error.kind).or_default() += 1;
        *self.by_source.entry(error.source.clone()).or_default() += 1;
        *self.by_severity.entry(error.severity).or_default() += 1;
        *self.by_reason.entry(reason.to_string()).or_default() += 1;
    }

    pub fn merge(&mut self, other: &ErrorSummary) {
        self.total += other.total;
        for (k, v) in &other.by_kind {
            *self.by_kind.entry(*k).or_default() += v;
        }
        for (k, v) in &other.by_source {
            *self.by_source.entry(k.clone()).or_default() += v;
        }
        for (k, v) in &other.by_severity {
            *self.by_severity.entry(*k).or_default() += v;
        }
        for (k, v) in &other.by_reason {
            *self.by_reason.entry(k.clone()).or_default() += v;
        }
    }
}
