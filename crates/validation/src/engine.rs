//! Per-record and per-batch evaluation.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use fire_common::RawRecord;

use crate::rule::{reason, FailureAction, RecordAction, Severity};
use crate::ruleset::RuleSet;

/// Name of the built-in rule triggered by records that failed to parse.
pub const MALFORMED_RULE: &str = "malformed_record";

const MAX_SCORE: f64 = 100.0;

/// One rule that fired for a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredRule {
    pub rule: String,
    pub severity: Severity,
    pub action: FailureAction,
    pub reason: String,
    pub detail: String,
}

/// Outcome of evaluating one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub triggered: Vec<TriggeredRule>,
    /// 100 minus the severity penalties of triggered rules, floored at 0
    pub quality_score: f64,
    pub action: RecordAction,
}

impl ValidationResult {
    /// A clean result: nothing triggered, score 100.
    pub fn clean() -> Self {
        Self {
            triggered: Vec::new(),
            quality_score: MAX_SCORE,
            action: RecordAction::Pass,
        }
    }

    fn from_triggered(triggered: Vec<TriggeredRule>) -> Self {
        let penalty: f64 = triggered.iter().map(|t| t.severity.penalty()).sum();
        let action = triggered
            .iter()
            .map(|t| {
                if t.severity == Severity::Critical {
                    RecordAction::Reject
                } else {
                    RecordAction::from(t.action)
                }
            })
            .max()
            .unwrap_or(RecordAction::Pass);

        Self {
            quality_score: (MAX_SCORE - penalty).max(0.0),
            action,
            triggered,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.action.is_accepted()
    }

    /// Reason code of the most severe triggered rule.
    pub fn primary_reason(&self) -> Option<&str> {
        let top = self.triggered.iter().map(|t| t.severity).max()?;
        self.triggered
            .iter()
            .find(|t| t.severity == top)
            .map(|t| t.reason.as_str())
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.triggered.iter().map(|t| t.rule.as_str()).collect()
    }
}

/// Quality summary for a batch of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchQuality {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Accepted records that still triggered a warning or alert rule
    pub warnings: usize,
    pub per_rule_failures: BTreeMap<String, usize>,
    /// passed / total * 100; 100 for an empty batch
    pub pass_rate: f64,
    pub mean_score: f64,
}

impl BatchQuality {
    /// Fold another batch into this one.
    pub fn merge(&mut self, other: &BatchQuality) {
        let total = self.total + other.total;
        if total > 0 {
            self.mean_score =
                (self.mean_score * self.total as f64 + other.mean_score * other.total as f64) / total as f64;
            self.pass_rate = (self.passed + other.passed) as f64 / total as f64 * 100.0;
        }
        self.total = total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.warnings += other.warnings;
        for (rule, n) in &other.per_rule_failures {
            *self.per_rule_failures.entry(rule.clone()).or_default() += n;
        }
    }
}

/// Evaluates a rule set against records. Holds no mutable state.
#[derive(Debug, Clone)]
pub struct ValidationEngine {
    rules: Arc<RuleSet>,
}

impl ValidationEngine {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    pub fn ruleset(&self) -> &RuleSet {
        &self.rules
    }

    /// Evaluate all rules against one record, in configured order.
    ///
    /// Malformed records only trigger [`MALFORMED_RULE`].
    pub fn evaluate(&self, record: &RawRecord) -> ValidationResult {
        if let Some(cause) = &record.malformed {
            return ValidationResult::from_triggered(vec![TriggeredRule {
                rule: MALFORMED_RULE.to_string(),
                severity: Severity::Critical,
                action: FailureAction::Reject,
                reason: reason::SCHEMA_MISMATCH.to_string(),
                detail: cause.clone(),
            }]);
        }

        let triggered: Vec<TriggeredRule> = self
            .rules
            .rules
            .iter()
            .filter_map(|rule| {
                rule.check.evaluate(record).map(|detail| TriggeredRule {
                    rule: rule.name.clone(),
                    severity: rule.severity,
                    action: rule.action,
                    reason: rule.reason_code().to_string(),
                    detail,
                })
            })
            .collect();

        if !triggered.is_empty() {
            debug!(
                record = %record.id,
                ruleset = %self.rules.name,
                rules = ?triggered.iter().map(|t| t.rule.as_str()).collect::<Vec<_>>(),
                "Rules triggered"
            );
        }

        ValidationResult::from_triggered(triggered)
    }

    /// Evaluate a batch, returning per-record results and a batch summary.
    pub fn evaluate_batch(&self, records: &[RawRecord]) -> (Vec<ValidationResult>, BatchQuality) {
        let results: Vec<ValidationResult> = records.iter().map(|r| self.evaluate(r)).collect();
        let quality = summarize(&results);
        (results, quality)
    }
}

/// Summarize already-computed results.
pub fn summarize(results: &[ValidationResult]) -> BatchQuality {
    let mut quality = BatchQuality {
        total: results.len(),
        ..Default::default()
    };

    let mut score_sum = 0.0;
    for result in results {
        score_sum += result.quality_score;
        if result.is_accepted() {
            quality.passed += 1;
            if !result.triggered.is_empty() {
                quality.warnings += 1;
            }
        } else {
            quality.failed += 1;
        }
        for t in &result.triggered {
            *quality.per_rule_failures.entry(t.rule.clone()).or_default() += 1;
        }
    }

    if quality.total == 0 {
        quality.pass_rate = MAX_SCORE;
        quality.mean_score = MAX_SCORE;
    } else {
        quality.pass_rate = quality.passed as f64 / quality.total as f64 * 100.0;
        quality.mean_score = score_sum / quality.total as f64;
    }
    quality
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{RuleCheck, ValidationRule};
    use serde_json::{json, Value};

    fn record(value: Value) -> RawRecord {
        RawRecord::new("test", 0, value.as_object().cloned().unwrap())
    }

    fn engine(set: RuleSet) -> ValidationEngine {
        ValidationEngine::new(Arc::new(set))
    }

    #[test]
    fn test_clean_record_scores_100() {
        let result = engine(RuleSet::fire_perimeters()).evaluate(&record(json!({
            "fire_name": "Camp", "fire_year": 2018, "acres": 153336.0,
            "latitude": 39.76, "longitude": -121.62
        })));
        assert_eq!(result, ValidationResult::clean());
    }

    #[test]
    fn test_score_and_action_combine() {
        // Out of bounds (HIGH, 15) + missing name (HIGH, 15) + bad year (MEDIUM, 5)
        let result = engine(RuleSet::fire_perimeters()).evaluate(&record(json!({
            "fire_year": 1900, "acres": 10.0, "latitude": 50.0, "longitude": -121.0
        })));
        assert_eq!(result.triggered.len(), 3);
        assert_eq!(result.quality_score, 65.0);
        assert_eq!(result.action, RecordAction::Quarantine);
        assert_eq!(result.primary_reason(), Some(reason::COORDINATE_OUT_OF_RANGE));
    }

    #[test]
    fn test_rules_reported_in_configured_order() {
        let result = engine(RuleSet::fire_perimeters()).evaluate(&record(json!({
            "fire_year": 1900, "latitude": 50.0, "longitude": -121.0
        })));
        assert_eq!(
            result.rule_names(),
            vec!["valid_coordinates", "valid_fire_year", "required_fire_name"]
        );
    }

    #[test]
    fn test_critical_forces_reject() {
        let set = RuleSet {
            name: "critical".to_string(),
            description: None,
            rules: vec![ValidationRule::new(
                "must_have_id",
                Severity::Critical,
                FailureAction::PassWithWarning,
                RuleCheck::Required { fields: vec!["id".to_string()] },
            )],
        };
        let result = engine(set).evaluate(&record(json!({})));
        assert_eq!(result.action, RecordAction::Reject);
        assert_eq!(result.quality_score, 60.0);
    }

    #[test]
    fn test_malformed_record() {
        let raw = RawRecord::malformed("test", 4, "{oops", "expected value at line 1");
        let result = engine(RuleSet::fire_perimeters()).evaluate(&raw);
        assert_eq!(result.action, RecordAction::Reject);
        assert_eq!(result.rule_names(), vec![MALFORMED_RULE]);
        assert_eq!(result.primary_reason(), Some(reason::SCHEMA_MISMATCH));
    }

    #[test]
    fn test_score_floors_at_zero() {
        let rules = (0..4)
            .map(|i| {
                ValidationRule::new(
                    format!("r{i}"),
                    Severity::Critical,
                    FailureAction::Reject,
                    RuleCheck::Required { fields: vec![format!("f{i}")] },
                )
            })
            .collect();
        let set = RuleSet { name: "harsh".to_string(), description: None, rules };
        assert_eq!(engine(set).evaluate(&record(json!({}))).quality_score, 0.0);
    }

    #[test]
    fn test_batch_quality() {
        let records = vec![
            record(json!({"fire_name": "A", "latitude": 37.0, "longitude": -120.0})),
            record(json!({"fire_name": "B", "latitude": 50.0, "longitude": -120.0})),
            record(json!({"fire_name": "C", "latitude": 36.0, "longitude": -119.0})),
            record(json!({"latitude": 36.0, "longitude": -119.0})),
        ];
        let (results, quality) = engine(RuleSet::fire_perimeters()).evaluate_batch(&records);
        assert_eq!(results.len(), 4);
        assert_eq!(quality.total, 4);
        assert_eq!(quality.passed, 2);
        assert_eq!(quality.failed, 2);
        assert_eq!(quality.pass_rate, 50.0);
        assert_eq!(quality.per_rule_failures["valid_coordinates"], 1);
        assert_eq!(quality.per_rule_failures["required_fire_name"], 1);
        assert_eq!(quality.mean_score, (100.0 + 85.0 + 100.0 + 85.0) / 4.0);
    }

    #[test]
    fn test_merge_matches_single_summary() {
        let records = vec![
            record(json!({"fire_name": "A", "latitude": 37.0, "longitude": -120.0})),
            record(json!({"fire_name": "B", "latitude": 50.0, "longitude": -120.0})),
            record(json!({"latitude": 36.0, "longitude": -119.0})),
        ];
        let engine = engine(RuleSet::fire_perimeters());
        let (results, whole) = engine.evaluate_batch(&records);

        let mut merged = BatchQuality::default();
        merged.merge(&summarize(&results[..1]));
        merged.merge(&summarize(&results[1..]));
        assert_eq!(merged.total, whole.total);
        assert_eq!(merged.passed, whole.passed);
        assert_eq!(merged.per_rule_failures, whole.per_rule_failures);
        assert!((merged.mean_score - whole.mean_score).abs() < 1e-9);
        assert!((merged.pass_rate - whole.pass_rate).abs() < 1e-9);
    }

    #[test]
    fn test_empty_batch() {
        let quality = summarize(&[]);
        assert_eq!(quality.pass_rate, 100.0);
        assert_eq!(quality.total, 0);
    }
}
