//! Configuration loader for the wildfire ingester
//!
//! Loads and validates the pipeline YAML file:
//! - Sources (batch files, polled APIs, streams)
//! - Retry, alert, enrichment, hotspot and analytics settings
//! - Sink selection and the rule set directory
//!
//! Supports environment variable substitution using ${VAR} syntax.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use ingestion::{PipelineSettings, ScheduleMode, SourceConfig};
use validation::RuleRegistry;

// ============================================================================
// Pipeline Configuration (pipeline.yaml)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(flatten)]
    pub settings: PipelineSettings,
    #[serde(default)]
    pub sink: SinkConfig,
    /// Directory of rule set YAML files; built-in rule sets are used when
    /// absent
    #[serde(default)]
    pub rulesets_dir: Option<PathBuf>,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    JsonLines,
    /// Keep everything in memory; useful for dry runs
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_kind")]
    pub kind: SinkKind,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_sink_kind() -> SinkKind {
    SinkKind::JsonLines
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: default_sink_kind(),
            output_dir: default_output_dir(),
        }
    }
}

// ============================================================================
// Loading Functions
// ============================================================================

/// Load and parse pipeline.yaml with environment variable substitution.
///
/// Relative paths in the file are resolved against the file's directory.
pub fn load_service_config<P: AsRef<Path>>(path: P) -> Result<ServiceConfig> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read pipeline config from {:?}", path.as_ref()))?;

    let mut config = parse_service_config(&content)?;

    let base = path.as_ref().parent().unwrap_or_else(|| Path::new("."));
    config.rulesets_dir = config.rulesets_dir.map(|dir| resolve_path(base, &dir));
    config.settings.enrichment.reference_path = config
        .settings
        .enrichment
        .reference_path
        .map(|p| resolve_path(base, &p));

    Ok(config)
}

/// Parse pipeline YAML text.
pub fn parse_service_config(content: &str) -> Result<ServiceConfig> {
    let expanded = expand_env_vars(content)?;

    let config: ServiceConfig =
        serde_yaml::from_str(&expanded).with_context(|| "Failed to parse pipeline config YAML")?;

    validate_service_config(&config)?;

    Ok(config)
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Built-in rule sets, overridden by any files in `dir`.
pub fn load_rules(dir: Option<&Path>) -> Result<RuleRegistry> {
    let mut registry = RuleRegistry::with_defaults();
    match dir {
        Some(dir) if dir.is_dir() => {
            let loaded = registry
                .load_dir(dir)
                .with_context(|| format!("Failed to load rule sets from {:?}", dir))?;
            info!(dir = %dir.display(), loaded, "Loaded rule set files");
        }
        Some(dir) => warn!(dir = %dir.display(), "Rule set directory not found, using built-in rule sets"),
        None => {}
    }
    Ok(registry)
}

/// Resolve each source's `credentials_ref` from the environment.
///
/// Missing variables are logged; the source then runs without a token.
pub fn resolve_credentials(sources: &[SourceConfig]) -> BTreeMap<String, String> {
    let mut credentials = BTreeMap::new();
    for name in sources.iter().filter_map(|s| s.credentials_ref.as_deref()) {
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => {
                credentials.insert(name.to_string(), value);
            }
            _ => warn!(credentials_ref = name, "Credential variable not set"),
        }
    }
    credentials
}

/// Apply command line overrides: keep only `only` (when given) and force a
/// single pass for `--once`.
pub fn apply_overrides(mut config: ServiceConfig, once: bool, only: Option<&str>) -> Result<ServiceConfig> {
    if let Some(name) = only {
        config.sources.retain(|s| s.name == name);
        anyhow::ensure!(!config.sources.is_empty(), "No source named '{}' in configuration", name);
    }
    if once {
        for source in &mut config.sources {
            if source.schedule() != ingestion::Schedule::Continuous {
                source.schedule = Some(ScheduleMode::Once);
            }
        }
    }
    Ok(config)
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in YAML content
/// Supports ${VAR} and ${VAR:-default} syntax
fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = String::new();
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'

            let mut var_expr = String::new();
            let mut brace_count = 1;

            while brace_count > 0 {
                match chars.next() {
                    Some('{') => {
                        brace_count += 1;
                        var_expr.push('{');
                    }
                    Some('}') => {
                        brace_count -= 1;
                        if brace_count > 0 {
                            var_expr.push('}');
                        }
                    }
                    Some(c) => var_expr.push(c),
                    None => anyhow::bail!("Unclosed variable substitution: ${{{}", var_expr),
                }
            }

            let value = resolve_var_expr(&var_expr)?;
            result.push_str(&value);
        } else {
            result.push(ch);
        }
    }

    Ok(result)
}

/// Resolve variable expression (supports VAR and VAR:-default syntax)
fn resolve_var_expr(expr: &str) -> Result<String> {
    if let Some((var_name, default)) = expr.split_once(":-") {
        match std::env::var(var_name.trim()) {
            Ok(val) if !val.is_empty() => Ok(val),
            _ => Ok(default.to_string()),
        }
    } else {
        std::env::var(expr.trim()).with_context(|| format!("Environment variable {} not set", expr))
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Structural checks only. Per-source problems are reported by the pipeline
/// as `config_invalid` so one bad source does not stop the others.
fn validate_service_config(config: &ServiceConfig) -> Result<()> {
    anyhow::ensure!(!config.sources.is_empty(), "At least one source must be configured");

    let mut seen = HashSet::new();
    for source in &config.sources {
        anyhow::ensure!(seen.insert(source.name.as_str()), "Duplicate source name '{}'", source.name);
    }

    let retry = &config.settings.retry;
    anyhow::ensure!(
        retry.base_delay_ms <= retry.max_delay_ms,
        "retry.base_delay_ms must not exceed retry.max_delay_ms"
    );

    let alerts = &config.settings.alerts;
    anyhow::ensure!(
        (0.0..=1.0).contains(&alerts.error_rate_threshold),
        "alerts.error_rate_threshold must be within 0..=1"
    );

    anyhow::ensure!(
        config.settings.hotspots.density_threshold >= 0.0,
        "hotspots.density_threshold must not be negative"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingestion::{Schedule, SourceKind};

    const PIPELINE_YAML: &str = r#"
retry:
  base_delay_ms: 500
  max_delay_ms: 10000
alerts:
  error_rate_threshold: 0.2
hotspots:
  density_threshold: 5
sink:
  kind: memory
rulesets_dir: rulesets
sources:
  - name: calfire_perimeters
    kind: batch
    location: ${PERIMETER_DIR:-/data/perimeters}
    ruleset: fire_perimeters
  - name: calfire_incidents
    kind: api
    location: https://services.example.test/arcgis/query
    poll_interval_secs: 600
    credentials_ref: CALFIRE_TOKEN
  - name: field_alerts
    kind: stream
    location: memory://field_alerts
"#;

    #[test]
    fn test_expand_env_vars_simple() {
        std::env::set_var("TEST_VAR", "test_value");
        let result = expand_env_vars("prefix_${TEST_VAR}_suffix").unwrap();
        assert_eq!(result, "prefix_test_value_suffix");
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        std::env::remove_var("NONEXISTENT_VAR");
        let result = expand_env_vars("value_${NONEXISTENT_VAR:-default}_end").unwrap();
        assert_eq!(result, "value_default_end");
    }

    #[test]
    fn test_expand_env_vars_missing_required() {
        std::env::remove_var("REQUIRED_VAR");
        let result = expand_env_vars("${REQUIRED_VAR}");
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_var_expr_override_default() {
        std::env::set_var("SET_VAR", "custom");
        let result = resolve_var_expr("SET_VAR:-default").unwrap();
        assert_eq!(result, "custom");
    }

    #[test]
    fn test_parse_pipeline_config() {
        std::env::remove_var("PERIMETER_DIR");
        let config = parse_service_config(PIPELINE_YAML).unwrap();

        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.sources[0].location, "/data/perimeters");
        assert_eq!(config.sources[1].kind, SourceKind::Api);
        assert_eq!(config.sources[1].schedule(), Schedule::Interval(std::time::Duration::from_secs(600)));
        assert_eq!(config.sources[2].schedule(), Schedule::Continuous);
        assert_eq!(config.settings.retry.base_delay_ms, 500);
        assert_eq!(config.settings.alerts.error_rate_threshold, 0.2);
        // Unset sections keep their defaults
        assert_eq!(config.settings.alerts.min_samples, 10);
        assert_eq!(config.sink.kind, SinkKind::Memory);
    }

    #[test]
    fn test_duplicate_source_names_rejected() {
        let yaml = r#"
sources:
  - {name: a, kind: batch, location: /x}
  - {name: a, kind: batch, location: /y}
"#;
        assert!(parse_service_config(yaml).is_err());
    }

    #[test]
    fn test_once_override_keeps_streams_continuous() {
        std::env::remove_var("PERIMETER_DIR");
        let config = parse_service_config(PIPELINE_YAML).unwrap();
        let config = apply_overrides(config, true, None).unwrap();

        assert_eq!(config.sources[1].schedule(), Schedule::Once);
        assert_eq!(config.sources[2].schedule(), Schedule::Continuous);
    }

    #[test]
    fn test_source_filter() {
        std::env::remove_var("PERIMETER_DIR");
        let config = parse_service_config(PIPELINE_YAML).unwrap();
        let filtered = apply_overrides(config.clone(), false, Some("field_alerts")).unwrap();
        assert_eq!(filtered.sources.len(), 1);
        assert!(apply_overrides(config, false, Some("missing")).is_err());
    }

    #[test]
    fn test_credentials_from_env() {
        std::env::set_var("CALFIRE_TOKEN", "secret");
        std::env::remove_var("PERIMETER_DIR");
        let config = parse_service_config(PIPELINE_YAML).unwrap();
        let creds = resolve_credentials(&config.sources);
        assert_eq!(creds.get("CALFIRE_TOKEN").map(String::as_str), Some("secret"));
    }

    #[test]
    fn test_load_shipped_config() {
        let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
        let workspace_root = Path::new(&manifest_dir).parent().unwrap().parent().unwrap();
        let config = load_service_config(workspace_root.join("config/pipeline.yaml")).unwrap();
        assert!(!config.sources.is_empty());
        let reference = config.settings.enrichment.load_reference().unwrap().unwrap();
        assert!(!reference.is_empty());

        let rules = load_rules(config.rulesets_dir.as_deref()).unwrap();
        for source in &config.sources {
            if let Some(name) = &source.ruleset {
                assert!(rules.contains(name), "missing rule set {name}");
            }
        }
    }
}
