//! Run orchestration.
//!
//! [`IngestionPipeline::run`] builds one connector per enabled source, spawns
//! one [`SourceWorker`] task per source on a `JoinSet` and folds their
//! reports into a [`RunSummary`]. A source that fails, whether at config
//! time or at runtime, never stops the others.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use geospatial::{detect_hotspots, HotspotObservation, ReferenceIndex};
use validation::{RuleRegistry, RuleSet, ValidationEngine};

use crate::alert::AlertMonitor;
use crate::config::{PipelineSettings, SourceConfig};
use crate::connector::{build_connector, AnyConnector, ConnectorContext};
use crate::enrich::Enricher;
use crate::error::Result;
use crate::metrics::{MetricsAggregator, MetricsEmitter};
use crate::quarantine::ErrorSummary;
use crate::sink::RecordSink;
use crate::summary::{RunSummary, SourceStatus, SourceSummary};
use crate::worker::{SourceReport, SourceWorker};

/// State scoped to one run and shared by its source workers.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub metrics: MetricsAggregator,
    pub alerts: AlertMonitor,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(settings: &PipelineSettings, emitter: Arc<dyn MetricsEmitter>, cancel: CancellationToken) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            metrics: MetricsAggregator::new(emitter),
            alerts: AlertMonitor::new(settings.alerts.clone()),
            cancel,
        }
    }
}

enum Slot {
    Ready(SourceConfig, AnyConnector),
    Done(SourceSummary),
}

pub struct IngestionPipeline {
    settings: PipelineSettings,
    rules: RuleRegistry,
    enricher: Arc<Enricher>,
    sink: Arc<dyn RecordSink>,
    emitter: Arc<dyn MetricsEmitter>,
}

impl IngestionPipeline {
    pub fn new(
        settings: PipelineSettings,
        rules: RuleRegistry,
        reference: Option<Arc<ReferenceIndex>>,
        sink: Arc<dyn RecordSink>,
        emitter: Arc<dyn MetricsEmitter>,
    ) -> Self {
        let enricher = Arc::new(Enricher::new(settings.enrichment.clone(), reference));
        Self {
            settings,
            rules,
            enricher,
            sink,
            emitter,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    /// Run every enabled source to completion (or until `cancel` fires).
    ///
    /// Never fails: configuration and runtime problems are reported per
    /// source in the returned summary.
    pub async fn run(
        &self,
        sources: Vec<SourceConfig>,
        ctx: &ConnectorContext,
        cancel: CancellationToken,
    ) -> RunSummary {
        let slots = sources
            .into_iter()
            .filter(|config| {
                if !config.enabled {
                    info!(source = %config.name, "Source disabled, skipping");
                }
                config.enabled
            })
            .map(|config| match build_connector(&config, ctx) {
                Ok(connector) => Slot::Ready(config, connector),
                Err(e) => Slot::Done(config_invalid(&config, &e.to_string())),
            })
            .collect();
        self.run_slots(slots, cancel).await
    }

    /// Run pre-built connectors. Used when the caller needs to keep a handle
    /// on a connector, such as the feed of a streaming source.
    pub async fn run_connectors(
        &self,
        sources: Vec<(SourceConfig, AnyConnector)>,
        cancel: CancellationToken,
    ) -> RunSummary {
        let slots = sources
            .into_iter()
            .map(|(config, connector)| match config.validate() {
                Ok(()) => Slot::Ready(config, connector),
                Err(e) => Slot::Done(config_invalid(&config, &e.to_string())),
            })
            .collect();
        self.run_slots(slots, cancel).await
    }

    fn engine_for(&self, config: &SourceConfig) -> Result<ValidationEngine> {
        let rules = match &config.ruleset {
            Some(name) => self.rules.get(name)?,
            None => self
                .rules
                .get(&config.name)
                .unwrap_or_else(|_| Arc::new(RuleSet::empty(config.name.as_str()))),
        };
        Ok(ValidationEngine::new(rules))
    }

    #[instrument(skip_all, fields(sources = slots.len()))]
    async fn run_slots(&self, slots: Vec<Slot>, cancel: CancellationToken) -> RunSummary {
        let run = Arc::new(RunContext::new(&self.settings, self.emitter.clone(), cancel));
        info!(run_id = %run.run_id, "Starting ingestion run");

        let mut summaries: Vec<Option<SourceSummary>> = Vec::with_capacity(slots.len());
        let mut tasks = JoinSet::new();
        let mut names = BTreeMap::new();

        for slot in slots {
            let index = summaries.len();
            match slot {
                Slot::Done(summary) => summaries.push(Some(summary)),
                Slot::Ready(config, connector) => {
                    let engine = match self.engine_for(&config) {
                        Ok(engine) => engine,
                        Err(e) => {
                            summaries.push(Some(config_invalid(&config, &e.to_string())));
                            continue;
                        }
                    };
                    names.insert(index, (config.name.clone(), config.kind));
                    let worker = SourceWorker::new(
                        config,
                        engine,
                        self.enricher.clone(),
                        self.sink.clone(),
                        run.clone(),
                        &self.settings,
                    );
                    tasks.spawn(async move { (index, worker.run(connector).await) });
                    summaries.push(None);
                }
            }
        }

        let mut observations: Vec<HotspotObservation> = Vec::new();
        let mut errors = ErrorSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, SourceReport { summary, observations: obs, errors: errs })) => {
                    observations.extend(obs);
                    errors.merge(&errs);
                    summaries[index] = Some(summary);
                }
                Err(e) => error!(error = %e, "Source task failed"),
            }
        }

        if let Err(e) = self.sink.flush().await {
            warn!(error = %e, "Sink flush failed");
        }

        // A panicked worker still shows up, as degraded
        let sources: Vec<SourceSummary> = summaries
            .into_iter()
            .enumerate()
            .filter_map(|(index, summary)| {
                summary.or_else(|| {
                    names.get(&index).map(|(name, kind)| {
                        SourceSummary::new(name.as_str(), *kind, SourceStatus::Degraded)
                            .with_detail("source task aborted")
                    })
                })
            })
            .collect();

        let window_end = observations.iter().map(|o| o.observed_at).max().unwrap_or_else(Utc::now);
        let hotspots = detect_hotspots(&observations, &self.settings.hotspots, window_end);

        let summary = RunSummary {
            run_id: run.run_id,
            started_at: run.started_at,
            finished_at: Utc::now(),
            cancelled: run.cancel.is_cancelled(),
            sources,
            hotspots,
            errors,
            alerts: run.alerts.raised().await,
        };
        info!(
            run_id = %summary.run_id,
            written = summary.total_written(),
            quarantined = summary.total_quarantined(),
            hotspots = summary.hotspots.len(),
            cancelled = summary.cancelled,
            "Ingestion run finished"
        );
        summary
    }
}

fn config_invalid(config: &SourceConfig, detail: &str) -> SourceSummary {
    warn!(source = %config.name, detail, "Source configuration rejected");
    SourceSummary::new(config.name.as_str(), config.kind, SourceStatus::ConfigInvalid).with_detail(detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use crate::connector::StreamingConnector;
    use crate::metrics::MemoryEmitter;
    use crate::retry::RetryPolicy;
    use crate::sink::MemorySink;
    use serde_json::json;

    fn pipeline(sink: Arc<MemorySink>) -> IngestionPipeline {
        IngestionPipeline::new(
            PipelineSettings::default(),
            RuleRegistry::with_defaults(),
            None,
            sink,
            Arc::new(MemoryEmitter::new()),
        )
    }

    #[tokio::test]
    async fn test_disabled_source_is_skipped() {
        let sink = Arc::new(MemorySink::new());
        let mut config = SourceConfig::new("off", SourceKind::Batch, "/nowhere");
        config.enabled = false;

        let summary = pipeline(sink)
            .run(vec![config], &ConnectorContext::new(RetryPolicy::default()), CancellationToken::new())
            .await;
        assert!(summary.sources.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ruleset_is_config_invalid() {
        let sink = Arc::new(MemorySink::new());
        let mut config = SourceConfig::new("feed", SourceKind::Stream, "memory://feed");
        config.ruleset = Some("no_such_rules".to_string());
        let connector = StreamingConnector::new(config.clone());

        let summary = pipeline(sink)
            .run_connectors(vec![(config, connector.into())], CancellationToken::new())
            .await;
        assert_eq!(summary.sources[0].status, SourceStatus::ConfigInvalid);
    }

    #[tokio::test]
    async fn test_zero_rules_pass_through_unchanged() {
        let sink = Arc::new(MemorySink::new());
        let config = SourceConfig::new("plain", SourceKind::Stream, "memory://plain");
        let connector = StreamingConnector::new(config.clone());
        let feed = connector.feed().unwrap();
        let fields = json!({"id": "r1", "note": "anything", "value": 42})
            .as_object()
            .cloned()
            .unwrap();
        feed.push(fields.clone()).await.unwrap();
        drop(feed);

        let summary = pipeline(sink.clone())
            .run_connectors(vec![(config, connector.into())], CancellationToken::new())
            .await;

        let plain = summary.source("plain").unwrap();
        assert_eq!(plain.status, SourceStatus::Completed);
        assert_eq!(plain.written, 1);
        let written = sink.records().await;
        assert_eq!(written[0].record.fields, fields);
        assert_eq!(written[0].validation.quality_score, 100.0);
        assert!(written[0].validation.triggered.is_empty());
    }
}
