//! Source connectors.
//!
//! Every source is read through the [`Connector`] contract:
//!
//! ```text
//! connect() ──▶ extract() ──▶ stream of RawRecord ──▶ close()
//! ```
//!
//! The three timing models are independent structs ([`BatchFileConnector`],
//! [`PollingApiConnector`], [`StreamingConnector`]) selected by
//! [`AnyConnector`].

mod batch;
mod polling;
mod streaming;

pub use batch::BatchFileConnector;
pub use polling::{HttpPageFetcher, PageFetcher, PollingApiConnector};
pub use streaming::{FeedItem, StreamFeed, StreamingConnector};

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use fire_common::{Geometry, RawRecord, RecordFields};

use crate::config::{DedupKey, SourceConfig, SourceKind};
use crate::error::Result;
use crate::retry::RetryPolicy;

/// Lazy sequence of records produced by one extraction.
pub type RecordStream<'a> = BoxStream<'a, Result<RawRecord>>;

/// Counters reported by a connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorStats {
    pub emitted: u64,
    pub malformed: u64,
    pub duplicates: u64,
    pub pages: u64,
    pub retries: u64,
    pub files: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    emitted: AtomicU64,
    malformed: AtomicU64,
    duplicates: AtomicU64,
    pages: AtomicU64,
    retries: AtomicU64,
    files: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_emitted(&self, record: &RawRecord) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        if record.is_malformed() {
            self.malformed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn add_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_page(&self, retries: u32) {
        self.pages.fetch_add(1, Ordering::Relaxed);
        self.retries.fetch_add(u64::from(retries), Ordering::Relaxed);
    }

    pub(crate) fn add_retries(&self, retries: u32) {
        self.retries.fetch_add(u64::from(retries), Ordering::Relaxed);
    }

    pub(crate) fn add_file(&self) {
        self.files.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ConnectorStats {
        ConnectorStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            pages: self.pages.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            files: self.files.load(Ordering::Relaxed),
        }
    }
}

/// Lifecycle contract shared by all sources.
#[async_trait]
pub trait Connector: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Open the source and check that it looks like what was configured.
    async fn connect(&mut self) -> Result<()>;

    /// Start one extraction pass. The returned stream is lazy.
    fn extract(&mut self) -> Result<RecordStream<'_>>;

    /// Cheap health probe.
    async fn validate_source(&self) -> bool;

    /// Release resources. Safe to call more than once.
    async fn close(&mut self);

    fn stats(&self) -> ConnectorStats;
}

/// The connector variants behind one type.
pub enum AnyConnector {
    Batch(BatchFileConnector),
    Polling(PollingApiConnector),
    Streaming(StreamingConnector),
}

impl std::fmt::Debug for AnyConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(self.kind().as_str()).field(&self.name()).finish()
    }
}

impl From<BatchFileConnector> for AnyConnector {
    fn from(c: BatchFileConnector) -> Self {
        AnyConnector::Batch(c)
    }
}

impl From<PollingApiConnector> for AnyConnector {
    fn from(c: PollingApiConnector) -> Self {
        AnyConnector::Polling(c)
    }
}

impl From<StreamingConnector> for AnyConnector {
    fn from(c: StreamingConnector) -> Self {
        AnyConnector::Streaming(c)
    }
}

#[async_trait]
impl Connector for AnyConnector {
    fn name(&self) -> &str {
        match self {
            AnyConnector::Batch(c) => c.name(),
            AnyConnector::Polling(c) => c.name(),
            AnyConnector::Streaming(c) => c.name(),
        }
    }

    fn kind(&self) -> SourceKind {
        match self {
            AnyConnector::Batch(c) => c.kind(),
            AnyConnector::Polling(c) => c.kind(),
            AnyConnector::Streaming(c) => c.kind(),
        }
    }

    async fn connect(&mut self) -> Result<()> {
        match self {
            AnyConnector::Batch(c) => c.connect().await,
            AnyConnector::Polling(c) => c.connect().await,
            AnyConnector::Streaming(c) => c.connect().await,
        }
    }

    fn extract(&mut self) -> Result<RecordStream<'_>> {
        match self {
            AnyConnector::Batch(c) => c.extract(),
            AnyConnector::Polling(c) => c.extract(),
            AnyConnector::Streaming(c) => c.extract(),
        }
    }

    async fn validate_source(&self) -> bool {
        match self {
            AnyConnector::Batch(c) => c.validate_source().await,
            AnyConnector::Polling(c) => c.validate_source().await,
            AnyConnector::Streaming(c) => c.validate_source().await,
        }
    }

    async fn close(&mut self) {
        match self {
            AnyConnector::Batch(c) => c.close().await,
            AnyConnector::Polling(c) => c.close().await,
            AnyConnector::Streaming(c) => c.close().await,
        }
    }

    fn stats(&self) -> ConnectorStats {
        match self {
            AnyConnector::Batch(c) => c.stats(),
            AnyConnector::Polling(c) => c.stats(),
            AnyConnector::Streaming(c) => c.stats(),
        }
    }
}

/// What connectors need beyond their own [`SourceConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConnectorContext {
    pub retry: RetryPolicy,
    /// Resolved secrets keyed by `credentials_ref`
    pub credentials: BTreeMap<String, String>,
}

impl ConnectorContext {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            credentials: BTreeMap::new(),
        }
    }

    fn credential_for(&self, config: &SourceConfig) -> Option<String> {
        config
            .credentials_ref
            .as_ref()
            .and_then(|r| self.credentials.get(r))
            .cloned()
    }
}

/// Build the connector for a validated source configuration.
pub fn build_connector(config: &SourceConfig, ctx: &ConnectorContext) -> Result<AnyConnector> {
    config.validate()?;
    Ok(match config.kind {
        SourceKind::Batch => BatchFileConnector::new(config.clone()).into(),
        SourceKind::Api => {
            let fetcher = HttpPageFetcher::new(
                config.location.clone(),
                ctx.credential_for(config),
                config.operation_timeout(),
            )?;
            PollingApiConnector::with_fetcher(config.clone(), Arc::new(fetcher), ctx.retry.clone()).into()
        }
        SourceKind::Stream => StreamingConnector::new(config.clone()).into(),
    })
}

/// Bounded set of recently seen dedup keys, evicted oldest first.
#[derive(Debug)]
pub(crate) struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(4096)),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Remember `key`. Returns false when it was already in the window.
    pub(crate) fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

/// SHA-256 of the record's fields, serialized with sorted keys.
pub fn content_hash(fields: &RecordFields) -> String {
    let canonical = serde_json::to_vec(fields).unwrap_or_default();
    format!("{:x}", Sha256::digest(&canonical))
}

/// Dedup key of a record, if it has one.
pub(crate) fn dedup_key(record: &RawRecord, key: &DedupKey) -> Option<String> {
    if record.is_malformed() {
        return None;
    }
    match key {
        DedupKey::Field(field) => record.get_str(field),
        DedupKey::ContentHash => Some(content_hash(&record.fields)),
    }
}

/// Use the dedup field as the record id when it is present.
pub(crate) fn assign_id(record: RawRecord, key: &DedupKey) -> RawRecord {
    match key {
        DedupKey::Field(field) => match record.get_str(field) {
            Some(id) if !record.is_malformed() => record.with_id(id),
            _ => record,
        },
        DedupKey::ContentHash => record,
    }
}

/// Build a record from one JSON item: a GeoJSON feature, an ArcGIS feature
/// (`attributes` + `geometry`), or a flat attribute object.
pub(crate) fn record_from_value(source: &str, sequence: u64, value: Value) -> RawRecord {
    let mut map = match value {
        Value::Object(map) => map,
        other => {
            return RawRecord::malformed(source, sequence, other.to_string(), "item is not a JSON object")
        }
    };

    let (fields, geometry) = if let Some(Value::Object(attributes)) = map.remove("attributes") {
        let geometry = match map.remove("geometry") {
            None | Some(Value::Null) => Ok(None),
            Some(g) => Geometry::from_arcgis(&g).map(Some),
        };
        (attributes, geometry)
    } else if map.contains_key("properties")
        || map.get("type").and_then(Value::as_str) == Some("Feature")
    {
        let mut fields = match map.remove("properties") {
            Some(Value::Object(props)) => props,
            _ => RecordFields::new(),
        };
        let geometry = match map.remove("geometry") {
            None | Some(Value::Null) => Ok(None),
            Some(g) => Geometry::from_geojson(&g).map(Some),
        };
        if let Some(id) = map.remove("id").filter(|v| !v.is_null()) {
            fields.entry("id".to_string()).or_insert(id);
        }
        (fields, geometry)
    } else {
        (map, Ok(None))
    };

    match geometry {
        Ok(geometry) => RawRecord::new(source, sequence, fields).with_geometry(geometry),
        Err(e) => {
            let raw = Value::Object(fields).to_string();
            RawRecord::malformed(source, sequence, raw, e.to_string())
        }
    }
}

/// Hand out sequence numbers that keep increasing across extractions.
pub(crate) fn next_sequence(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed)
}
