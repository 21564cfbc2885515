//! Wildfire data ingestion library.
//!
//! Pulls records from heterogeneous wildfire sources, validates them against
//! rule sets, enriches accepted records with spatial context and writes them
//! to a sink. Rejected or failed records go to a quarantine with a typed
//! error.
//!
//! # Architecture
//!
//! - Connectors for batch files, polled APIs and continuous streams
//! - Bounded exponential-backoff retry with jitter
//! - Quarantine entries, error summaries and rate-based alerts
//! - Spatial enrichment (cell index, reference polygon join)
//! - One worker task per source, folded into a [`RunSummary`]

pub mod alert;
pub mod config;
pub mod connector;
pub mod enrich;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod quarantine;
pub mod retry;
pub mod sink;
pub mod summary;
mod worker;

// Re-exports
pub use alert::{AlertConfig, AlertEvent, AlertKind, AlertMonitor};
pub use config::{
    AnalyticsConfig, DedupConfig, DedupKey, FormatHint, PipelineSettings, Schedule, ScheduleMode, SourceConfig,
    SourceKind,
};
pub use connector::{
    build_connector, content_hash, AnyConnector, BatchFileConnector, Connector, ConnectorContext, ConnectorStats,
    FeedItem, HttpPageFetcher, PageFetcher, PollingApiConnector, RecordStream, StreamFeed, StreamingConnector,
};
pub use enrich::{EnrichedRecord, Enricher, EnrichmentConfig, Provenance};
pub use error::{ErrorKind, IngestionError, Result};
pub use metrics::{MemoryEmitter, MetricsAggregator, MetricsEmitter, PrometheusEmitter, SourceTotals, StageMetrics};
pub use pipeline::{IngestionPipeline, RunContext};
pub use quarantine::{ErrorRecord, ErrorSummary, QuarantineEntry, Stage};
pub use retry::{Retried, RetryExecutor, RetryPolicy};
pub use sink::{JsonLinesSink, MemorySink, RecordSink};
pub use summary::{RunSummary, SourceAnalytics, SourceStatus, SourceSummary};
pub use worker::SourceReport;
