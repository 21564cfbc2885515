//! Per-stage pipeline metrics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};

use crate::quarantine::Stage;

/// Metrics for one stage pass over one chunk of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub source: String,
    pub stage: Stage,
    /// Strictly increasing per source
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
    pub records_in: usize,
    pub records_passed: usize,
    pub records_quarantined: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
}

/// Receives stage metrics as they are produced.
pub trait MetricsEmitter: Send + Sync {
    fn emit(&self, metrics: &StageMetrics);
}

/// Emits through the `metrics` facade; scraped by whatever recorder the
/// binary installs.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusEmitter;

impl MetricsEmitter for PrometheusEmitter {
    fn emit(&self, m: &StageMetrics) {
        let source = m.source.clone();
        let stage = m.stage.as_str();

        counter!("ingest_records_in_total", "source" => source.clone(), "stage" => stage)
            .increment(m.records_in as u64);
        counter!("ingest_records_passed_total", "source" => source.clone(), "stage" => stage)
            .increment(m.records_passed as u64);
        counter!("ingest_records_quarantined_total", "source" => source.clone(), "stage" => stage)
            .increment(m.records_quarantined as u64);
        histogram!("ingest_stage_latency_ms", "source" => source.clone(), "stage" => stage)
            .record(m.latency_ms);
        if let Some(score) = m.quality_score {
            gauge!("ingest_quality_score", "source" => source).set(score);
        }
    }
}

/// Keeps every emitted metric in memory.
#[derive(Debug, Default)]
pub struct MemoryEmitter {
    emitted: Mutex<Vec<StageMetrics>>,
}

impl MemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> Vec<StageMetrics> {
        self.emitted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn for_source(&self, source: &str) -> Vec<StageMetrics> {
        self.emitted()
            .into_iter()
            .filter(|m| m.source == source)
            .collect()
    }
}

impl MetricsEmitter for MemoryEmitter {
    fn emit(&self, metrics: &StageMetrics) {
        self.emitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(metrics.clone());
    }
}

/// Running totals for one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceTotals {
    pub records_in: usize,
    pub records_passed: usize,
    pub records_quarantined: usize,
    pub emitted: u64,
}

/// Stamps stage metrics with per-source sequence numbers and forwards them
/// to an emitter. One instance per pipeline run.
pub struct MetricsAggregator {
    emitter: Arc<dyn MetricsEmitter>,
    sources: Mutex<HashMap<String, SourceTotals>>,
}

impl std::fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsAggregator").finish_non_exhaustive()
    }
}

impl MetricsAggregator {
    pub fn new(emitter: Arc<dyn MetricsEmitter>) -> Self {
        Self {
            emitter,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Record one stage pass and emit it with the next sequence number.
    #[allow(clippy::too_many_arguments)]
    pub fn observe(
        &self,
        source: &str,
        stage: Stage,
        latency_ms: f64,
        records_in: usize,
        records_passed: usize,
        records_quarantined: usize,
        quality_score: Option<f64>,
    ) -> StageMetrics {
        let sequence = {
            let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
            let totals = sources.entry(source.to_string()).or_default();
            totals.records_in += records_in;
            totals.records_passed += records_passed;
            totals.records_quarantined += records_quarantined;
            totals.emitted += 1;
            totals.emitted
        };

        let metrics = StageMetrics {
            source: source.to_string(),
            stage,
            sequence,
            timestamp: Utc::now(),
            latency_ms,
            records_in,
            records_passed,
            records_quarantined,
            quality_score,
        };
        self.emitter.emit(&metrics);
        metrics
    }

    pub fn totals(&self, source: &str) -> SourceTotals {
        self.sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(source)
            .cloned()
            .unwrap_or_default()
    }
}
