//! Per-source worker.
//!
//! One worker owns one connector for the whole run and pushes its records
//! through the stages in order:
//!
//! ```text
//! extract ─▶ chunk (batch_size) ─▶ validate ─┬─ accepted ─▶ enrich ─▶ sink
//!                                            └─ rejected ─▶ quarantine
//! ```
//!
//! Every record ends in exactly one place: the sink, the quarantine, or (for
//! polled duplicates) nowhere, counted by the connector.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use fire_common::{parse_timestamp, RawRecord};
use geospatial::{
    aggregate_by, damage_severity_score, severity_weight, spatial_coverage, yearly_trends, HotspotObservation,
};
use validation::{summarize, FailureAction, RecordAction, ValidationEngine, ValidationResult};

use crate::alert::AlertKind;
use crate::config::{AnalyticsConfig, PipelineSettings, Schedule, SourceConfig};
use crate::connector::{AnyConnector, Connector, ConnectorStats, RecordStream};
use crate::enrich::{EnrichedRecord, Enricher};
use crate::error::{ErrorKind, IngestionError, Result};
use crate::pipeline::RunContext;
use crate::quarantine::{
    ErrorRecord, ErrorSummary, QuarantineEntry, Stage, REASON_CANCELLED, REASON_SINK_UNAVAILABLE,
    REASON_SOURCE_FAILURE,
};
use crate::retry::RetryExecutor;
use crate::sink::RecordSink;
use crate::summary::{SourceAnalytics, SourceStatus, SourceSummary};

/// How long a partly filled chunk waits for more records before flushing.
const CHUNK_LINGER: Duration = Duration::from_millis(100);

/// What a worker hands back when its source is done.
#[derive(Debug, Clone)]
pub struct SourceReport {
    pub summary: SourceSummary,
    pub observations: Vec<HotspotObservation>,
    pub errors: ErrorSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassOutcome {
    Exhausted,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Default)]
struct ChunkCounters {
    results: Vec<ValidationResult>,
    accepted: usize,
    rejected: usize,
    written: usize,
    sink_failed: usize,
}

struct SourceState {
    summary: SourceSummary,
    errors: ErrorSummary,
    observations: Vec<HotspotObservation>,
    sample: Vec<RawRecord>,
    pending: VecDeque<Result<RawRecord>>,
    /// Record between validation and its final write
    in_flight: Option<RawRecord>,
}

impl SourceState {
    fn new(config: &SourceConfig) -> Self {
        Self {
            summary: SourceSummary::new(&config.name, config.kind, SourceStatus::Completed),
            errors: ErrorSummary::default(),
            observations: Vec::new(),
            sample: Vec::new(),
            pending: VecDeque::new(),
            in_flight: None,
        }
    }

    fn push(&mut self, item: Result<RawRecord>) {
        if item.is_ok() {
            self.summary.extracted += 1;
        }
        self.pending.push_back(item);
    }
}

fn connect_once(connector: &mut AnyConnector) -> BoxFuture<'_, Result<()>> {
    connector.connect()
}

/// Drives one source from connect to close.
pub struct SourceWorker {
    config: SourceConfig,
    engine: ValidationEngine,
    enricher: Arc<Enricher>,
    sink: Arc<dyn RecordSink>,
    run: Arc<RunContext>,
    retry: RetryExecutor,
    analytics: AnalyticsConfig,
}

impl SourceWorker {
    pub fn new(
        config: SourceConfig,
        engine: ValidationEngine,
        enricher: Arc<Enricher>,
        sink: Arc<dyn RecordSink>,
        run: Arc<RunContext>,
        settings: &PipelineSettings,
    ) -> Self {
        let retry = RetryExecutor::new(settings.retry.clone(), config.max_retries);
        Self {
            config,
            engine,
            enricher,
            sink,
            run,
            retry,
            analytics: settings.analytics.clone(),
        }
    }

    #[instrument(skip_all, fields(source = %self.config.name, kind = %self.config.kind))]
    pub async fn run(self, mut connector: AnyConnector) -> SourceReport {
        let mut state = SourceState::new(&self.config);
        let cancel = self.run.cancel.clone();

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.retry.run_on("connect", &mut connector, connect_once) => Some(result),
        };

        match connected {
            None => {
                info!("Cancelled before the source connected");
                state.summary.detail = Some("cancelled before connect".to_string());
            }
            Some(Err(e)) => self.degrade(&mut state, e, Stage::Connect).await,
            Some(Ok(connect)) => {
                state.summary.retries += u64::from(connect.retries);
                self.run_schedule(&mut connector, &mut state).await;
            }
        }

        connector.close().await;
        let report = self.finish(state, connector.stats());
        info!(
            status = ?report.summary.status,
            extracted = report.summary.extracted,
            written = report.summary.written,
            quarantined = report.summary.quarantined,
            duplicates = report.summary.duplicates,
            "Source finished"
        );
        report
    }

    async fn run_schedule(&self, connector: &mut AnyConnector, state: &mut SourceState) {
        let cancel = self.run.cancel.clone();
        match self.config.schedule() {
            Schedule::Once | Schedule::Continuous => {
                self.pass(connector, state).await;
            }
            Schedule::Interval(every) => loop {
                if self.pass(connector, state).await == PassOutcome::Cancelled
                    || state.summary.status == SourceStatus::Degraded
                {
                    break;
                }
                debug!(wait_secs = every.as_secs(), "Waiting for next poll");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
            },
        }
    }

    /// One extraction pass, flushed chunk by chunk.
    async fn pass(&self, connector: &mut AnyConnector, state: &mut SourceState) -> PassOutcome {
        state.summary.passes += 1;
        let cancel = self.run.cancel.clone();
        let limit = self.config.operation_timeout();
        let continuous = self.config.schedule() == Schedule::Continuous;

        let mut stream = match connector.extract() {
            Ok(stream) => stream,
            Err(e) => {
                if matches!(e, IngestionError::NotRestartable(_)) {
                    self.degrade(state, e, Stage::Extract).await;
                } else {
                    self.source_failure(state, e, Stage::Extract).await;
                }
                return PassOutcome::Exhausted;
            }
        };

        loop {
            // An idle stream may wait indefinitely for its next record
            let first = if continuous {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return PassOutcome::Cancelled,
                    item = stream.next() => item,
                }
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return PassOutcome::Cancelled,
                    item = tokio::time::timeout(limit, stream.next()) => match item {
                        Ok(item) => item,
                        Err(_) => {
                            self.timed_out(state, "waiting for source data").await;
                            return PassOutcome::TimedOut;
                        }
                    },
                }
            };
            let Some(first) = first else {
                return PassOutcome::Exhausted;
            };
            state.push(first);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Some(PassOutcome::Cancelled),
                flushed = tokio::time::timeout(limit, self.fill_and_flush(&mut stream, state)) => match flushed {
                    Ok(true) => Some(PassOutcome::Exhausted),
                    Ok(false) => None,
                    Err(_) => Some(PassOutcome::TimedOut),
                },
            };

            match outcome {
                None => continue,
                Some(PassOutcome::Exhausted) => return PassOutcome::Exhausted,
                Some(PassOutcome::Cancelled) => {
                    self.abandon(state, ErrorKind::Cancelled, "run cancelled").await;
                    return PassOutcome::Cancelled;
                }
                Some(PassOutcome::TimedOut) => {
                    self.timed_out(state, "chunk did not flush in time").await;
                    return PassOutcome::TimedOut;
                }
            }
        }
    }

    /// Top the chunk up to `batch_size` and push it through the stages.
    /// Returns true when the stream ended.
    async fn fill_and_flush(&self, stream: &mut RecordStream<'_>, state: &mut SourceState) -> bool {
        let fill_started = Instant::now();
        let mut ended = false;
        while state.pending.len() < self.config.batch_size {
            match tokio::time::timeout(CHUNK_LINGER, stream.next()).await {
                Ok(Some(item)) => state.push(item),
                Ok(None) => {
                    ended = true;
                    break;
                }
                Err(_) => break,
            }
        }

        let records_in = state.pending.len();
        self.run.metrics.observe(
            &self.config.name,
            Stage::Extract,
            elapsed_ms(fill_started),
            records_in,
            records_in,
            0,
            None,
        );

        let flush_started = Instant::now();
        let mut chunk = ChunkCounters::default();
        while let Some(item) = state.pending.pop_front() {
            match item {
                Ok(record) => self.process_record(record, state, &mut chunk).await,
                Err(e) => self.source_failure(state, e, Stage::Extract).await,
            }
        }

        let quality = summarize(&chunk.results);
        state.summary.quality.merge(&quality);
        let latency = elapsed_ms(flush_started);
        self.run.metrics.observe(
            &self.config.name,
            Stage::Validate,
            latency,
            chunk.results.len(),
            chunk.accepted,
            chunk.rejected,
            Some(quality.mean_score),
        );
        self.run.metrics.observe(
            &self.config.name,
            Stage::Sink,
            latency,
            chunk.accepted,
            chunk.written,
            chunk.sink_failed,
            None,
        );
        debug!(
            records = records_in,
            written = chunk.written,
            rejected = chunk.rejected,
            sink_failed = chunk.sink_failed,
            "Chunk flushed"
        );
        ended
    }

    async fn process_record(&self, record: RawRecord, state: &mut SourceState, chunk: &mut ChunkCounters) {
        state.in_flight = Some(record.clone());
        let result = self.engine.evaluate(&record);
        chunk.results.push(result.clone());
        let now = Utc::now();

        if !result.is_accepted() {
            chunk.rejected += 1;
            self.quarantine(state, QuarantineEntry::rejected(record, result)).await;
            self.run.alerts.observe(&self.config.name, true, now).await;
            return;
        }
        chunk.accepted += 1;

        if result.action == RecordAction::Alert {
            for t in result.triggered.iter().filter(|t| t.action == FailureAction::Alert) {
                let kind = AlertKind::RuleTriggered {
                    rule: t.rule.clone(),
                    record_id: record.id.clone(),
                };
                self.run.alerts.raise(&self.config.name, kind, now).await;
            }
        }

        let enriched = self.enricher.enrich(record, result);
        let sink = &self.sink;
        let written = self.retry.run("sink_write", |_| sink.write(&enriched)).await;
        match written {
            Ok(w) => {
                state.in_flight = None;
                state.summary.written += 1;
                state.summary.retries += u64::from(w.retries);
                chunk.written += 1;
                self.observe_accepted(state, &enriched);
                self.run.alerts.observe(&self.config.name, false, now).await;
            }
            Err(e) => {
                warn!(record = %enriched.record.id, error = %e, "Sink write failed");
                chunk.sink_failed += 1;
                let error = ErrorRecord::from_error(&e, Stage::Sink, &self.config.name);
                self.quarantine(state, QuarantineEntry::failed(enriched.record, error, REASON_SINK_UNAVAILABLE))
                    .await;
                self.run.alerts.observe(&self.config.name, true, now).await;
            }
        }
    }

    fn observe_accepted(&self, state: &mut SourceState, enriched: &EnrichedRecord) {
        let record = &enriched.record;
        if let Some(cell) = enriched.cell {
            let observed_at = record
                .get(&self.analytics.timestamp_field)
                .and_then(|v| parse_timestamp(v).ok())
                .unwrap_or(record.ingested_at);
            let weight = record
                .get_str(&self.analytics.severity_field)
                .map(|s| severity_weight(&s))
                .unwrap_or(1.0);
            state.observations.push(HotspotObservation {
                cell,
                observed_at,
                weight,
            });
        }
        if let Some(area) = enriched.estimated_area_km2 {
            state.summary.analytics.estimated_area_km2 += area;
        }
        if state.sample.len() < self.analytics.sample_limit {
            state.sample.push(record.clone());
        }
    }

    /// Write a quarantine entry, retrying transient sink failures. A record
    /// whose entry cannot be stored is counted in `quarantine_failed` and the
    /// source is degraded.
    async fn quarantine(&self, state: &mut SourceState, entry: QuarantineEntry) {
        let sink = &self.sink;
        let stored = self
            .retry
            .run("write_quarantine", |_| sink.write_quarantine(&entry))
            .await;
        state.in_flight = None;
        match stored {
            Ok(w) => {
                state.summary.quarantined += 1;
                state.summary.retries += u64::from(w.retries);
                state.errors.add(&entry);
            }
            Err(e) => {
                error!(record = %entry.record.id, error = %e, "Failed to write quarantine entry");
                state.summary.quarantine_failed += 1;
                if state.summary.status != SourceStatus::Degraded {
                    state.summary.status = SourceStatus::Degraded;
                    state.summary.detail = Some(format!("quarantine unavailable: {e}"));
                    let kind = AlertKind::SourceDegraded { cause: e.to_string() };
                    self.run.alerts.raise(&self.config.name, kind, Utc::now()).await;
                }
            }
        }
    }

    /// Stand-in record for failures that are not tied to one source record.
    fn placeholder(&self, operation: &str, detail: &str) -> RawRecord {
        let fields = json!({
            "operation": operation,
            "location": self.config.location,
            "detail": detail,
        });
        let fields = match fields {
            Value::Object(map) => map,
            _ => Default::default(),
        };
        RawRecord::new(self.config.name.as_str(), 0, fields).with_id(format!("{}:{operation}", self.config.name))
    }

    /// A failed source operation: one quarantine entry, the source keeps going.
    async fn source_failure(&self, state: &mut SourceState, e: IngestionError, stage: Stage) {
        warn!(error = %e, stage = stage.as_str(), "Source operation failed");
        let error = ErrorRecord::from_error(&e, stage, &self.config.name);
        let record = self.placeholder(stage.as_str(), &e.to_string()).with_retry_count(error.retry_count);
        self.quarantine(state, QuarantineEntry::failed(record, error, REASON_SOURCE_FAILURE)).await;
        self.run.alerts.observe(&self.config.name, true, Utc::now()).await;
    }

    /// The source is unusable for the rest of the run.
    async fn degrade(&self, state: &mut SourceState, e: IngestionError, stage: Stage) {
        error!(error = %e, "Source degraded");
        state.summary.status = SourceStatus::Degraded;
        state.summary.detail = Some(e.to_string());
        let cause = e.to_string();
        self.source_failure(state, e, stage).await;
        self.run
            .alerts
            .raise(&self.config.name, AlertKind::SourceDegraded { cause }, Utc::now())
            .await;
    }

    async fn timed_out(&self, state: &mut SourceState, detail: &str) {
        warn!(timeout_minutes = self.config.timeout_minutes, detail, "Source operation timed out");
        state.summary.timeouts += 1;
        if state.in_flight.is_none() && state.pending.is_empty() {
            // Nothing to quarantine
            let error = ErrorRecord::new(ErrorKind::Timeout, Stage::Extract, &self.config.name, detail);
            state.errors.record(&error, REASON_CANCELLED);
        } else {
            self.abandon(state, ErrorKind::Timeout, detail).await;
        }
    }

    /// Quarantine everything that was extracted but not yet written.
    async fn abandon(&self, state: &mut SourceState, kind: ErrorKind, detail: &str) {
        let mut abandoned: Vec<(RawRecord, Stage)> = Vec::new();
        if let Some(record) = state.in_flight.take() {
            abandoned.push((record, Stage::Sink));
        }
        let mut failures = Vec::new();
        while let Some(item) = state.pending.pop_front() {
            match item {
                Ok(record) => abandoned.push((record, Stage::Extract)),
                Err(e) => failures.push(e),
            }
        }
        if !abandoned.is_empty() {
            warn!(records = abandoned.len(), detail, "Quarantining unflushed records");
        }

        for (record, stage) in abandoned {
            let error = ErrorRecord::new(kind, stage, &self.config.name, detail).with_retry_count(record.retry_count);
            self.quarantine(state, QuarantineEntry::failed(record, error, REASON_CANCELLED)).await;
        }
        for e in failures {
            self.source_failure(state, e, Stage::Extract).await;
        }
    }

    fn finish(&self, mut state: SourceState, stats: ConnectorStats) -> SourceReport {
        state.summary.duplicates = stats.duplicates;
        state.summary.malformed = stats.malformed;
        state.summary.retries += stats.retries;

        let sample = &state.sample;
        let group_by: Vec<&str> = self.analytics.group_by.iter().map(String::as_str).collect();
        let estimated_area_km2 = state.summary.analytics.estimated_area_km2;
        state.summary.analytics = SourceAnalytics {
            coverage: spatial_coverage(sample),
            groups: if group_by.is_empty() {
                Vec::new()
            } else {
                aggregate_by(sample, &group_by, &self.analytics.value_field)
            },
            yearly: yearly_trends(sample, &self.analytics.year_field, &self.analytics.value_field),
            damage_severity: damage_severity_score(sample, &self.analytics.damage_field),
            estimated_area_km2,
            sampled: sample.len(),
        };

        SourceReport {
            summary: state.summary,
            observations: state.observations,
            errors: state.errors,
        }
    }
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}
