//! Rule definitions.
//!
//! A rule pairs a closed set of checks ([`RuleCheck`]) with a severity and a
//! failure action. Rules are plain configuration data, deserialized from YAML
//! and evaluated through [`RuleCheck::evaluate`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fire_common::{parse_timestamp, RawRecord, COORD_EPSILON};

use crate::error::{Result, ValidationError};

/// Reason codes attached to quarantined records.
pub mod reason {
    pub const COORDINATE_OUT_OF_RANGE: &str = "coordinate_out_of_range";
    pub const VALUE_OUT_OF_RANGE: &str = "value_out_of_range";
    pub const MISSING_REQUIRED_FIELD: &str = "missing_required_field";
    pub const INVALID_CATEGORY: &str = "invalid_category";
    pub const IMPLAUSIBLE_TIMESTAMP: &str = "implausible_timestamp";
    pub const SCHEMA_MISMATCH: &str = "schema_mismatch";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Quality score penalty for one triggered rule of this severity.
    pub fn penalty(&self) -> f64 {
        match self {
            Severity::Low => 2.0,
            Severity::Medium => 5.0,
            Severity::High => 15.0,
            Severity::Critical => 40.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a rule asks for when it triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureAction {
    PassWithWarning,
    Quarantine,
    Reject,
    Alert,
}

/// Final disposition of a record, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordAction {
    Pass,
    PassWithWarning,
    Alert,
    Quarantine,
    Reject,
}

impl RecordAction {
    /// Whether the record continues to enrichment and the sink.
    pub fn is_accepted(&self) -> bool {
        matches!(self, RecordAction::Pass | RecordAction::PassWithWarning | RecordAction::Alert)
    }
}

impl From<FailureAction> for RecordAction {
    fn from(action: FailureAction) -> Self {
        match action {
            FailureAction::PassWithWarning => RecordAction::PassWithWarning,
            FailureAction::Quarantine => RecordAction::Quarantine,
            FailureAction::Reject => RecordAction::Reject,
            FailureAction::Alert => RecordAction::Alert,
        }
    }
}

/// The check a rule performs, selected by the `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCheck {
    /// Record coordinates must fall inside the box (edges inclusive).
    /// Records without coordinates fail.
    BoundingBox {
        min_lat: f64,
        max_lat: f64,
        min_lon: f64,
        max_lon: f64,
    },
    /// A numeric field must lie within `[min, max]`.
    Range {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// Every field must be present and, for strings, non-blank.
    Required { fields: Vec<String> },
    /// A categorical field must take one of `values`.
    Domain {
        field: String,
        values: Vec<String>,
        #[serde(default)]
        case_sensitive: bool,
    },
    /// A timestamp field must parse and fall within `[not_before, not_after]`.
    Temporal {
        field: String,
        #[serde(default)]
        not_before: Option<DateTime<Utc>>,
        #[serde(default)]
        not_after: Option<DateTime<Utc>>,
    },
}

impl RuleCheck {
    /// Default reason code for this kind of check.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RuleCheck::BoundingBox { .. } => reason::COORDINATE_OUT_OF_RANGE,
            RuleCheck::Range { .. } => reason::VALUE_OUT_OF_RANGE,
            RuleCheck::Required { .. } => reason::MISSING_REQUIRED_FIELD,
            RuleCheck::Domain { .. } => reason::INVALID_CATEGORY,
            RuleCheck::Temporal { .. } => reason::IMPLAUSIBLE_TIMESTAMP,
        }
    }

    /// Run the check. Returns a failure description when the rule triggers.
    ///
    /// Only `bounding_box` and `required` fail on absent data; the other
    /// checks skip records that lack their field.
    pub fn evaluate(&self, record: &RawRecord) -> Option<String> {
        match self {
            RuleCheck::BoundingBox {
                min_lat,
                max_lat,
                min_lon,
                max_lon,
            } => {
                let Some((lat, lon)) = record.coordinates() else {
                    return Some("record has no coordinates".to_string());
                };
                let inside = within(lat, Some(*min_lat), Some(*max_lat), COORD_EPSILON)
                    && within(lon, Some(*min_lon), Some(*max_lon), COORD_EPSILON);
                (!inside).then(|| format!("({lat}, {lon}) outside [{min_lat}..{max_lat}, {min_lon}..{max_lon}]"))
            }
            RuleCheck::Range { field, min, max } => {
                let value = record.get(field)?;
                match fire_common::record::value_as_f64(value) {
                    Some(v) if within(v, *min, *max, 0.0) => None,
                    Some(v) => Some(format!("{field}={v} outside {}", describe_range(*min, *max))),
                    None => Some(format!("{field}={value} is not numeric")),
                }
            }
            RuleCheck::Required { fields } => {
                let missing: Vec<&str> = fields
                    .iter()
                    .filter(|f| is_blank(record, f))
                    .map(String::as_str)
                    .collect();
                (!missing.is_empty()).then(|| format!("missing {}", missing.join(", ")))
            }
            RuleCheck::Domain {
                field,
                values,
                case_sensitive,
            } => {
                let actual = record.get_str(field)?;
                let actual = actual.trim();
                let ok = values.iter().any(|v| {
                    if *case_sensitive {
                        v == actual
                    } else {
                        v.eq_ignore_ascii_case(actual)
                    }
                });
                (!ok).then(|| format!("{field}='{actual}' not in {values:?}"))
            }
            RuleCheck::Temporal {
                field,
                not_before,
                not_after,
            } => {
                let value = record.get(field)?;
                match parse_timestamp(value) {
                    Ok(ts) if not_before.map_or(false, |b| ts < b) => {
                        Some(format!("{field}={ts} is before {}", not_before.map(|b| b.to_rfc3339()).unwrap_or_default()))
                    }
                    Ok(ts) if not_after.map_or(false, |a| ts > a) => {
                        Some(format!("{field}={ts} is after {}", not_after.map(|a| a.to_rfc3339()).unwrap_or_default()))
                    }
                    Ok(_) => None,
                    Err(e) => Some(e.to_string()),
                }
            }
        }
    }

    fn check_config(&self) -> std::result::Result<(), String> {
        match self {
            RuleCheck::BoundingBox {
                min_lat,
                max_lat,
                min_lon,
                max_lon,
            } => {
                if min_lat > max_lat || min_lon > max_lon {
                    return Err("bounding box minimum exceeds maximum".to_string());
                }
            }
            RuleCheck::Range { min, max, .. } => match (min, max) {
                (None, None) => return Err("range needs min or max".to_string()),
                (Some(lo), Some(hi)) if lo > hi => return Err(format!("min {lo} exceeds max {hi}")),
                _ => {}
            },
            RuleCheck::Required { fields } if fields.is_empty() => {
                return Err("required check lists no fields".to_string());
            }
            RuleCheck::Domain { values, .. } if values.is_empty() => {
                return Err("domain check lists no values".to_string());
            }
            RuleCheck::Temporal {
                not_before: Some(b),
                not_after: Some(a),
                ..
            } if b > a => {
                return Err("not_before is after not_after".to_string());
            }
            _ => {}
        }
        Ok(())
    }
}

fn within(v: f64, min: Option<f64>, max: Option<f64>, epsilon: f64) -> bool {
    min.map_or(true, |lo| v >= lo - epsilon) && max.map_or(true, |hi| v <= hi + epsilon)
}

fn describe_range(min: Option<f64>, max: Option<f64>) -> String {
    match (min, max) {
        (Some(lo), Some(hi)) => format!("[{lo}, {hi}]"),
        (Some(lo), None) => format!(">= {lo}"),
        (None, Some(hi)) => format!("<= {hi}"),
        (None, None) => "any".to_string(),
    }
}

fn is_blank(record: &RawRecord, field: &str) -> bool {
    match record.get(field) {
        None => true,
        Some(serde_json::Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// A named, configured check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub severity: Severity,
    pub action: FailureAction,
    /// Overrides the check's default reason code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub check: RuleCheck,
}

impl ValidationRule {
    pub fn new(name: impl Into<String>, severity: Severity, action: FailureAction, check: RuleCheck) -> Self {
        Self {
            name: name.into(),
            description: None,
            severity,
            action,
            reason: None,
            check,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn reason_code(&self) -> &str {
        self.reason.as_deref().unwrap_or_else(|| self.check.reason_code())
    }

    /// Reject rule definitions that can never evaluate sensibly.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::InvalidRule {
                rule: self.name.clone(),
                reason: "rule name is empty".to_string(),
            });
        }
        self.check.check_config().map_err(|reason| ValidationError::InvalidRule {
            rule: self.name.clone(),
            reason,
        })
    }
}
