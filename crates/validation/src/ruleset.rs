//! Rule sets: named, ordered lists of rules loaded once per run.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, ValidationError};
use crate::rule::{FailureAction, RuleCheck, Severity, ValidationRule};

/// California bounds used by the CalFIRE coordinate checks.
pub const CA_MIN_LAT: f64 = 32.5;
pub const CA_MAX_LAT: f64 = 42.0;
pub const CA_MIN_LON: f64 = -124.5;
pub const CA_MAX_LON: f64 = -114.0;

/// Damage levels recognised by inspection data.
pub const DAMAGE_LEVELS: [&str; 5] = ["MINOR", "MODERATE", "MAJOR", "DESTROYED", "UNKNOWN"];

/// Alert severities emitted by the alert feed.
pub const ALERT_SEVERITIES: [&str; 4] = ["LOW", "MEDIUM", "HIGH", "CRITICAL"];

/// An ordered list of rules. Evaluation follows list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub rules: Vec<ValidationRule>,
}

impl RuleSet {
    /// An empty rule set; every record passes with score 100.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            rules: Vec::new(),
        }
    }

    /// Parse and validate a rule set from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let set: RuleSet = serde_yaml::from_str(content)?;
        set.validate()?;
        Ok(set)
    }

    /// Load a rule set from a YAML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ValidationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Check every rule and reject duplicate names.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !seen.insert(rule.name.as_str()) {
                return Err(ValidationError::DuplicateRule(rule.name.clone()));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// CalFIRE fire perimeter rules.
    pub fn fire_perimeters() -> Self {
        Self {
            name: "fire_perimeters".to_string(),
            description: Some("CalFIRE fire perimeter checks".to_string()),
            rules: vec![
                california_bounds(),
                ValidationRule::new(
                    "valid_fire_year",
                    Severity::Medium,
                    FailureAction::Quarantine,
                    RuleCheck::Range {
                        field: "fire_year".to_string(),
                        min: Some(1950.0),
                        max: Some(2025.0),
                    },
                )
                .with_description("Fire year is between 1950 and 2025"),
                ValidationRule::new(
                    "valid_acres",
                    Severity::Medium,
                    FailureAction::Quarantine,
                    RuleCheck::Range {
                        field: "acres".to_string(),
                        min: Some(0.0),
                        max: None,
                    },
                )
                .with_description("Burned area is non-negative"),
                ValidationRule::new(
                    "required_fire_name",
                    Severity::High,
                    FailureAction::Quarantine,
                    RuleCheck::Required {
                        fields: vec!["fire_name".to_string()],
                    },
                )
                .with_description("Fire name is present and not empty"),
            ],
        }
    }

    /// CalFIRE damage inspection (DINS) rules.
    pub fn damage_inspection() -> Self {
        Self {
            name: "damage_inspection".to_string(),
            description: Some("CalFIRE damage inspection checks".to_string()),
            rules: vec![
                california_bounds(),
                ValidationRule::new(
                    "valid_damage_level",
                    Severity::Low,
                    FailureAction::Quarantine,
                    RuleCheck::Domain {
                        field: "damage_level".to_string(),
                        values: DAMAGE_LEVELS.iter().map(|s| s.to_string()).collect(),
                        case_sensitive: false,
                    },
                )
                .with_description("Damage level is a known category"),
            ],
        }
    }

    /// Real-time fire alert rules.
    pub fn fire_alerts() -> Self {
        Self {
            name: "fire_alerts".to_string(),
            description: Some("Streaming fire alert checks".to_string()),
            rules: vec![
                ValidationRule::new(
                    "required_alert_fields",
                    Severity::High,
                    FailureAction::Quarantine,
                    RuleCheck::Required {
                        fields: vec!["alert_id".to_string(), "timestamp".to_string()],
                    },
                ),
                california_bounds(),
                ValidationRule::new(
                    "valid_alert_severity",
                    Severity::Low,
                    FailureAction::PassWithWarning,
                    RuleCheck::Domain {
                        field: "severity".to_string(),
                        values: ALERT_SEVERITIES.iter().map(|s| s.to_string()).collect(),
                        case_sensitive: false,
                    },
                ),
                ValidationRule::new(
                    "plausible_alert_time",
                    Severity::Medium,
                    FailureAction::Quarantine,
                    RuleCheck::Temporal {
                        field: "timestamp".to_string(),
                        not_before: Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single(),
                        not_after: None,
                    },
                ),
            ],
        }
    }

    /// All built-in rule sets.
    pub fn builtin() -> Vec<Self> {
        vec![Self::fire_perimeters(), Self::damage_inspection(), Self::fire_alerts()]
    }
}

fn california_bounds() -> ValidationRule {
    ValidationRule::new(
        "valid_coordinates",
        Severity::High,
        FailureAction::Quarantine,
        RuleCheck::BoundingBox {
            min_lat: CA_MIN_LAT,
            max_lat: CA_MAX_LAT,
            min_lon: CA_MIN_LON,
            max_lon: CA_MAX_LON,
        },
    )
    .with_description("Coordinates are within California")
}

/// Rule sets by name, shared read-only across source workers.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    sets: BTreeMap<String, Arc<RuleSet>>,
}

impl RuleRegistry {
    /// A registry holding the built-in rule sets.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        for set in RuleSet::builtin() {
            registry.insert(set);
        }
        registry
    }

    /// Add or replace a rule set.
    pub fn insert(&mut self, set: RuleSet) {
        debug!(ruleset = %set.name, rules = set.rules.len(), "Registered rule set");
        self.sets.insert(set.name.clone(), Arc::new(set));
    }

    /// Load every `*.yaml` / `*.yml` file in `dir`, replacing built-ins of the
    /// same name. Files are read in name order.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let entries = std::fs::read_dir(dir).map_err(|source| ValidationError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        for path in &paths {
            let set = RuleSet::from_path(path)?;
            info!(ruleset = %set.name, path = %path.display(), "Loaded rule set");
            self.insert(set);
        }
        Ok(paths.len())
    }

    pub fn get(&self, name: &str) -> Result<Arc<RuleSet>> {
        self.sets
            .get(name)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownRuleSet(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sets.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }
}
