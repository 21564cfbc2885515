//! End-to-end runs of the pipeline against in-memory sinks and fake sources.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use ingestion::{
    AlertKind, ConnectorContext, ErrorKind, IngestionError, IngestionPipeline, MemoryEmitter, MemorySink, PageFetcher,
    PipelineSettings, PollingApiConnector, Result, RetryPolicy, ScheduleMode, SourceConfig, SourceKind,
    SourceStatus, Stage, StreamingConnector,
};
use test_utils::{arcgis_page, perimeter_feature_collection, temp_test_dir_with_prefix, write_fixture};
use validation::RuleRegistry;

fn pipeline(sink: Arc<MemorySink>, emitter: Arc<MemoryEmitter>) -> IngestionPipeline {
    IngestionPipeline::new(PipelineSettings::default(), RuleRegistry::with_defaults(), None, sink, emitter)
}

fn no_jitter(base_ms: u64) -> RetryPolicy {
    RetryPolicy {
        base_delay_ms: base_ms,
        max_delay_ms: 60_000,
        jitter: false,
    }
}

fn api_config(name: &str, schedule: ScheduleMode) -> SourceConfig {
    let mut config = SourceConfig::new(name, SourceKind::Api, "https://example.test/arcgis/query");
    config.schedule = Some(schedule);
    config.poll_interval_secs = Some(1);
    config.max_retries = 3;
    config.ruleset = Some("fire_perimeters".to_string());
    config
}

/// Serves `total` ArcGIS items. Calls listed in `failing_calls` time out.
struct ScriptedApi {
    total: usize,
    failing_calls: Vec<usize>,
    always_fail_after_probe: bool,
    calls: AtomicUsize,
    at: Mutex<Vec<Instant>>,
}

impl ScriptedApi {
    fn new(total: usize, failing_calls: Vec<usize>) -> Arc<Self> {
        Arc::new(Self {
            total,
            failing_calls,
            always_fail_after_probe: false,
            calls: AtomicUsize::new(0),
            at: Mutex::new(Vec::new()),
        })
    }

    fn broken(total: usize) -> Arc<Self> {
        Arc::new(Self {
            total,
            failing_calls: Vec::new(),
            always_fail_after_probe: true,
            calls: AtomicUsize::new(0),
            at: Mutex::new(Vec::new()),
        })
    }

    fn call_times(&self) -> Vec<Instant> {
        self.at.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for ScriptedApi {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.at.lock().unwrap().push(Instant::now());
        if self.failing_calls.contains(&call) || (self.always_fail_after_probe && call > 0) {
            return Err(IngestionError::Timeout(format!("call {call} timed out")));
        }
        let len = self.total.saturating_sub(offset).min(limit);
        Ok(arcgis_page(offset, len))
    }
}

/// Answers the connect probe, then never returns another page.
struct StalledApi {
    calls: AtomicUsize,
}

#[async_trait]
impl PageFetcher for StalledApi {
    async fn fetch_page(&self, _offset: usize, _limit: usize) -> Result<Value> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(arcgis_page(0, 1));
        }
        std::future::pending().await
    }
}

fn out_of_bounds_stream() -> (SourceConfig, StreamingConnector) {
    let mut config = SourceConfig::new("perimeter_feed", SourceKind::Stream, "memory://perimeters");
    config.ruleset = Some("fire_perimeters".to_string());
    config.max_retries = 3;
    let connector = StreamingConnector::new(config.clone());
    (config, connector)
}

async fn push_out_of_bounds(feed: &ingestion::StreamFeed) {
    let fields = json!({
        "objectid": 1,
        "fire_name": "NORTHERN",
        "fire_year": 2021,
        "acres": 120.0,
        "latitude": 50.0,
        "longitude": -121.0,
    });
    feed.push(fields.as_object().cloned().unwrap()).await.unwrap();
}

#[tokio::test]
async fn test_batch_file_with_out_of_bounds_records() {
    let dir = temp_test_dir_with_prefix("scenario_a");
    let oob = [3, 17, 42, 64, 99];
    let path = write_fixture(dir.path(), "perimeters.geojson", &perimeter_feature_collection(100, &oob));

    let mut config = SourceConfig::new("perimeters", SourceKind::Batch, path.to_string_lossy());
    config.ruleset = Some("fire_perimeters".to_string());

    let sink = Arc::new(MemorySink::new());
    let summary = pipeline(sink.clone(), Arc::new(MemoryEmitter::new()))
        .run(vec![config], &ConnectorContext::new(no_jitter(10)), CancellationToken::new())
        .await;

    let source = summary.source("perimeters").unwrap();
    assert_eq!(source.status, SourceStatus::Completed);
    assert_eq!(source.extracted, 100);
    assert_eq!(source.written, 95);
    assert_eq!(source.quarantined, 5);

    let written = sink.records().await;
    assert_eq!(written.len(), 95);
    assert!(written.iter().all(|r| r.cell.is_some()));

    let quarantined = sink.quarantined().await;
    assert_eq!(quarantined.len(), 5);
    for entry in &quarantined {
        assert_eq!(entry.reason, "coordinate_out_of_range");
        assert_eq!(entry.error.stage, Stage::Validate);
    }
    assert_eq!(summary.errors.by_reason.get("coordinate_out_of_range"), Some(&5));
    assert_eq!(source.quality.total, 100);
    assert_eq!(source.quality.failed, 5);
}

#[tokio::test(start_paused = true)]
async fn test_flaky_api_retries_with_growing_backoff() {
    // Call 0 is the connect probe; the first page fails twice
    let api = ScriptedApi::new(5, vec![1, 2]);
    let config = api_config("calfire", ScheduleMode::Once);
    let connector = PollingApiConnector::with_fetcher(config.clone(), api.clone(), no_jitter(100));

    let sink = Arc::new(MemorySink::new());
    let summary = pipeline(sink.clone(), Arc::new(MemoryEmitter::new()))
        .run_connectors(vec![(config, connector.into())], CancellationToken::new())
        .await;

    let times = api.call_times();
    assert_eq!(times.len(), 4);
    let first_gap = times[2] - times[1];
    let second_gap = times[3] - times[2];
    assert!(second_gap > first_gap, "{first_gap:?} then {second_gap:?}");

    let written = sink.records().await;
    assert_eq!(written.len(), 5);
    assert!(written.iter().all(|r| r.provenance.retry_count == 2));
    assert!(sink.quarantined().await.is_empty());
    assert_eq!(summary.source("calfire").unwrap().retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_poll_is_deduplicated() {
    let api = ScriptedApi::new(5, Vec::new());
    let config = api_config("calfire", ScheduleMode::Interval);
    let connector = PollingApiConnector::with_fetcher(config.clone(), api, no_jitter(100));

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        stopper.cancel();
    });

    let sink = Arc::new(MemorySink::new());
    let summary = pipeline(sink.clone(), Arc::new(MemoryEmitter::new()))
        .run_connectors(vec![(config, connector.into())], cancel)
        .await;

    let source = summary.source("calfire").unwrap();
    assert!(summary.cancelled);
    assert_eq!(source.passes, 2);
    assert_eq!(source.written, 5);
    assert_eq!(source.duplicates, 5);
    assert_eq!(sink.records().await.len(), 5);
    assert!(sink.quarantined().await.is_empty());
}

#[tokio::test]
async fn test_slow_sink_applies_backpressure_and_keeps_order() {
    let mut config = SourceConfig::new("alerts", SourceKind::Stream, "memory://alerts");
    config.buffer_capacity = 10;
    config.batch_size = 5;
    config.dedup.key = "alert_id".to_string().into();
    let connector = StreamingConnector::new(config.clone());
    let feed = connector.feed().unwrap();

    let sink = Arc::new(MemorySink::new());
    sink.pause();

    let pushed = Arc::new(AtomicUsize::new(0));
    let producer = {
        let pushed = pushed.clone();
        tokio::spawn(async move {
            for i in 0..100 {
                let fields = json!({"alert_id": format!("A-{i:03}"), "severity": "LOW"});
                feed.push(fields.as_object().cloned().unwrap()).await.unwrap();
                pushed.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    let run = {
        let pipeline = pipeline(sink.clone(), Arc::new(MemoryEmitter::new()));
        tokio::spawn(async move {
            pipeline
                .run_connectors(vec![(config, connector.into())], CancellationToken::new())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    let while_paused = pushed.load(Ordering::SeqCst);
    assert!(while_paused <= 10 + 5, "producer ran ahead: {while_paused}");
    assert!(sink.records().await.is_empty());

    sink.resume();
    producer.await.unwrap();
    let summary = run.await.unwrap();

    let ids: Vec<String> = sink.records().await.into_iter().map(|r| r.record.id).collect();
    let expected: Vec<String> = (0..100).map(|i| format!("A-{i:03}")).collect();
    assert_eq!(ids, expected);
    assert_eq!(summary.source("alerts").unwrap().written, 100);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_page_produces_one_quarantine_entry() {
    let api = ScriptedApi::broken(5);
    let config = api_config("calfire", ScheduleMode::Once);
    let connector = PollingApiConnector::with_fetcher(config.clone(), api, no_jitter(100));

    let sink = Arc::new(MemorySink::new());
    let summary = pipeline(sink.clone(), Arc::new(MemoryEmitter::new()))
        .run_connectors(vec![(config, connector.into())], CancellationToken::new())
        .await;

    let quarantined = sink.quarantined().await;
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].reason, "source_failure");
    assert_eq!(quarantined[0].error.retry_count, 3);
    assert!(sink.records().await.is_empty());
    assert_eq!(summary.source("calfire").unwrap().quarantined, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_source_is_degraded() {
    let mut config = SourceConfig::new("archive", SourceKind::Batch, "/definitely/not/here");
    config.max_retries = 2;

    let sink = Arc::new(MemorySink::new());
    let summary = pipeline(sink.clone(), Arc::new(MemoryEmitter::new()))
        .run(vec![config], &ConnectorContext::new(no_jitter(10)), CancellationToken::new())
        .await;

    let source = summary.source("archive").unwrap();
    assert_eq!(source.status, SourceStatus::Degraded);
    assert_eq!(sink.quarantined().await.len(), 1);
    assert!(summary
        .alerts
        .iter()
        .any(|a| a.source == "archive" && matches!(a.kind, AlertKind::SourceDegraded { .. })));
}

#[tokio::test]
async fn test_invalid_config_does_not_stop_other_sources() {
    let dir = temp_test_dir_with_prefix("isolation");
    let path = write_fixture(dir.path(), "perimeters.geojson", &perimeter_feature_collection(10, &[]));

    let mut good = SourceConfig::new("perimeters", SourceKind::Batch, path.to_string_lossy());
    good.ruleset = Some("fire_perimeters".to_string());
    let bad = SourceConfig::new("broken", SourceKind::Api, "ftp://not-http");

    let sink = Arc::new(MemorySink::new());
    let summary = pipeline(sink.clone(), Arc::new(MemoryEmitter::new()))
        .run(vec![bad, good], &ConnectorContext::new(no_jitter(10)), CancellationToken::new())
        .await;

    assert_eq!(summary.sources[0].name, "broken");
    assert_eq!(summary.sources[0].status, SourceStatus::ConfigInvalid);
    assert_eq!(summary.sources[1].status, SourceStatus::Completed);
    assert_eq!(summary.sources[1].written, 10);
}

#[tokio::test]
async fn test_metric_sequence_strictly_increases() {
    let dir = temp_test_dir_with_prefix("metrics");
    let path = write_fixture(dir.path(), "perimeters.geojson", &perimeter_feature_collection(30, &[2]));

    let mut config = SourceConfig::new("perimeters", SourceKind::Batch, path.to_string_lossy());
    config.batch_size = 7;
    config.ruleset = Some("fire_perimeters".to_string());

    let emitter = Arc::new(MemoryEmitter::new());
    pipeline(Arc::new(MemorySink::new()), emitter.clone())
        .run(vec![config], &ConnectorContext::new(no_jitter(10)), CancellationToken::new())
        .await;

    let emitted = emitter.for_source("perimeters");
    assert!(emitted.len() >= 3);
    assert!(emitted.windows(2).all(|w| w[0].sequence < w[1].sequence));
    let validate: usize = emitted
        .iter()
        .filter(|m| m.stage == Stage::Validate)
        .map(|m| m.records_quarantined)
        .sum();
    assert_eq!(validate, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_quarantines_unflushed_records() {
    let config = {
        let mut c = SourceConfig::new("alerts", SourceKind::Stream, "memory://alerts");
        c.batch_size = 50;
        c.dedup.key = "alert_id".to_string().into();
        c
    };
    let connector = StreamingConnector::new(config.clone());
    let feed = connector.feed().unwrap();
    for i in 0..3 {
        let fields = json!({"alert_id": format!("C-{i}")});
        feed.push(fields.as_object().cloned().unwrap()).await.unwrap();
    }

    let sink = Arc::new(MemorySink::new());
    sink.pause();
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        stopper.cancel();
    });

    let summary = pipeline(sink.clone(), Arc::new(MemoryEmitter::new()))
        .run_connectors(vec![(config, connector.into())], cancel)
        .await;
    drop(feed);

    let source = summary.source("alerts").unwrap();
    assert_eq!(source.written, 0);
    assert_eq!(source.quarantined, 3);
    let quarantined = sink.quarantined().await;
    assert!(quarantined.iter().all(|q| q.reason == "cancelled"));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_sink_times_out_and_quarantines_chunk() {
    let mut config = SourceConfig::new("alerts", SourceKind::Stream, "memory://alerts");
    config.batch_size = 50;
    config.timeout_minutes = 1;
    config.dedup.key = "alert_id".to_string().into();
    let connector = StreamingConnector::new(config.clone());
    let feed = connector.feed().unwrap();
    for i in 0..3 {
        let fields = json!({"alert_id": format!("T-{i}")});
        feed.push(fields.as_object().cloned().unwrap()).await.unwrap();
    }

    let sink = Arc::new(MemorySink::new());
    sink.pause();
    let started = Instant::now();
    let summary = pipeline(sink.clone(), Arc::new(MemoryEmitter::new()))
        .run_connectors(vec![(config, connector.into())], CancellationToken::new())
        .await;
    drop(feed);

    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(!summary.cancelled);
    let source = summary.source("alerts").unwrap();
    assert_eq!(source.timeouts, 1);
    assert_eq!(source.written, 0);
    assert_eq!(source.quarantined, 3);
    assert!(sink.records().await.is_empty());

    let quarantined = sink.quarantined().await;
    let ids: Vec<&str> = quarantined.iter().map(|q| q.record.id.as_str()).collect();
    assert_eq!(ids, ["T-0", "T-1", "T-2"]);
    assert!(quarantined
        .iter()
        .all(|q| q.reason == "cancelled" && q.error.kind == ErrorKind::Timeout));
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_is_counted_without_quarantine() {
    let mut config = api_config("calfire", ScheduleMode::Once);
    config.timeout_minutes = 1;
    let api = Arc::new(StalledApi {
        calls: AtomicUsize::new(0),
    });
    let connector = PollingApiConnector::with_fetcher(config.clone(), api, no_jitter(100));

    let sink = Arc::new(MemorySink::new());
    let summary = pipeline(sink.clone(), Arc::new(MemoryEmitter::new()))
        .run_connectors(vec![(config, connector.into())], CancellationToken::new())
        .await;

    let source = summary.source("calfire").unwrap();
    assert_eq!(source.timeouts, 1);
    assert_eq!(source.quarantined, 0);
    assert!(sink.quarantined().await.is_empty());
    assert_eq!(summary.errors.by_kind.get(&ErrorKind::Timeout), Some(&1));
    assert_eq!(summary.errors.by_reason.get("cancelled"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_quarantine_write_is_retried() {
    let (config, connector) = out_of_bounds_stream();
    let feed = connector.feed().unwrap();
    push_out_of_bounds(&feed).await;
    drop(feed);

    let sink = Arc::new(MemorySink::new());
    sink.fail_next_quarantine_writes(1);
    let summary = pipeline(sink.clone(), Arc::new(MemoryEmitter::new()))
        .run_connectors(vec![(config, connector.into())], CancellationToken::new())
        .await;

    let source = summary.source("perimeter_feed").unwrap();
    let stored = sink.quarantined().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(source.quarantined, stored.len() as u64);
    assert_eq!(source.quarantine_failed, 0);
    assert_eq!(source.retries, 1);
    assert_eq!(source.status, SourceStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_unstorable_quarantine_degrades_source() {
    let (config, connector) = out_of_bounds_stream();
    let feed = connector.feed().unwrap();
    push_out_of_bounds(&feed).await;
    drop(feed);

    let sink = Arc::new(MemorySink::new());
    sink.fail_next_quarantine_writes(10);
    let summary = pipeline(sink.clone(), Arc::new(MemoryEmitter::new()))
        .run_connectors(vec![(config, connector.into())], CancellationToken::new())
        .await;

    let source = summary.source("perimeter_feed").unwrap();
    assert!(sink.quarantined().await.is_empty());
    assert_eq!(source.quarantined, 0);
    assert_eq!(source.quarantine_failed, 1);
    assert_eq!(source.written, 0);
    assert_eq!(source.status, SourceStatus::Degraded);
    assert!(summary
        .alerts
        .iter()
        .any(|a| a.source == "perimeter_feed" && matches!(a.kind, AlertKind::SourceDegraded { .. })));
}
