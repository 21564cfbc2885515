//! Error-rate alerting with per-source rate limiting.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Sliding window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,
    /// Fraction of failed outcomes in the window that raises an alert
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// Outcomes needed in the window before the rate is trusted
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Minimum gap between two alerts of the same kind for one source
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i64,
}

fn default_window_secs() -> i64 {
    300
}

fn default_error_rate_threshold() -> f64 {
    0.1
}

fn default_min_samples() -> usize {
    10
}

fn default_cooldown_secs() -> i64 {
    300
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            error_rate_threshold: default_error_rate_threshold(),
            min_samples: default_min_samples(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertKind {
    /// Error rate over the window exceeded the threshold
    ErrorRate { rate: f64, failures: usize, samples: usize },
    /// A rule with the ALERT action fired
    RuleTriggered { rule: String, record_id: String },
    /// The source went offline for the rest of the run
    SourceDegraded { cause: String },
}

impl AlertKind {
    fn key(&self) -> String {
        match self {
            AlertKind::ErrorRate { .. } => "error_rate".to_string(),
            AlertKind::RuleTriggered { rule, .. } => format!("rule:{rule}"),
            AlertKind::SourceDegraded { .. } => "degraded".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub source: String,
    pub raised_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AlertKind,
}

#[derive(Debug, Default)]
struct SourceWindow {
    outcomes: VecDeque<(DateTime<Utc>, bool)>,
    failures: usize,
    last_alert: HashMap<String, DateTime<Utc>>,
    suppressed: usize,
}

impl SourceWindow {
    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while let Some(&(at, failed)) = self.outcomes.front() {
            if at >= cutoff {
                break;
            }
            self.outcomes.pop_front();
            if failed {
                self.failures -= 1;
            }
        }
    }

    fn may_raise(&mut self, key: &str, at: DateTime<Utc>, cooldown: Duration) -> bool {
        match self.last_alert.get(key) {
            Some(last) if at - *last < cooldown => {
                self.suppressed += 1;
                false
            }
            _ => {
                self.last_alert.insert(key.to_string(), at);
                true
            }
        }
    }
}

/// Tracks outcomes per source for one pipeline run.
#[derive(Debug)]
pub struct AlertMonitor {
    config: AlertConfig,
    windows: Mutex<HashMap<String, SourceWindow>>,
    raised: Mutex<Vec<AlertEvent>>,
}

impl AlertMonitor {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            raised: Mutex::new(Vec::new()),
        }
    }

    /// Record one outcome. Returns an alert when the failure rate over the
    /// window strictly exceeds the threshold and the source is not cooling
    /// down.
    pub async fn observe(&self, source: &str, failed: bool, at: DateTime<Utc>) -> Option<AlertEvent> {
        let event = {
            let mut windows = self.windows.lock().await;
            let window = windows.entry(source.to_string()).or_default();

            window.outcomes.push_back((at, failed));
            if failed {
                window.failures += 1;
            }
            window.evict_before(at - Duration::seconds(self.config.window_secs));

            let samples = window.outcomes.len();
            if samples < self.config.min_samples {
                return None;
            }
            let rate = window.failures as f64 / samples as f64;
            if rate <= self.config.error_rate_threshold {
                return None;
            }

            let kind = AlertKind::ErrorRate {
                rate,
                failures: window.failures,
                samples,
            };
            if !window.may_raise(&kind.key(), at, Duration::seconds(self.config.cooldown_secs)) {
                return None;
            }
            AlertEvent {
                source: source.to_string(),
                raised_at: at,
                kind,
            }
        };

        self.record(event).await
    }

    /// Raise a non-rate alert, subject to the same per-source cooldown.
    pub async fn raise(&self, source: &str, kind: AlertKind, at: DateTime<Utc>) -> Option<AlertEvent> {
        let allowed = {
            let mut windows = self.windows.lock().await;
            windows
                .entry(source.to_string())
                .or_default()
                .may_raise(&kind.key(), at, Duration::seconds(self.config.cooldown_secs))
        };
        if !allowed {
            return None;
        }
        self.record(AlertEvent {
            source: source.to_string(),
            raised_at: at,
            kind,
        })
        .await
    }

    async fn record(&self, event: AlertEvent) -> Option<AlertEvent> {
        warn!(source = %event.source, alert = ?event.kind, "Alert raised");
        self.raised.lock().await.push(event.clone());
        Some(event)
    }

    /// Alerts raised so far, in order.
    pub async fn raised(&self) -> Vec<AlertEvent> {
        self.raised.lock().await.clone()
    }

    /// Alerts withheld by rate limiting for a source.
    pub async fn suppressed(&self, source: &str) -> usize {
        self.windows
            .lock()
            .await
            .get(source)
            .map_or(0, |w| w.suppressed)
    }
}
