//! Paged REST API connector (ArcGIS feature services and GeoJSON APIs).

use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use fire_common::RawRecord;

use super::{
    assign_id, dedup_key, next_sequence, record_from_value, Connector, ConnectorStats, RecentIds, RecordStream,
    StatsCounters,
};
use crate::config::{DedupKey, SourceConfig, SourceKind};
use crate::error::{IngestionError, Result};
use crate::retry::{RetryExecutor, RetryPolicy};

/// Fetches one page of a paged API.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch `limit` items starting at `offset`. The body is returned as JSON.
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Value>;
}

/// [`PageFetcher`] for ArcGIS REST `query` endpoints.
pub struct HttpPageFetcher {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpPageFetcher {
    pub fn new(url: String, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, token })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Value> {
        let mut query: Vec<(&str, String)> = vec![
            ("where", "1=1".to_string()),
            ("outFields", "*".to_string()),
            ("f", "json".to_string()),
            ("resultOffset", offset.to_string()),
            ("resultRecordCount", limit.to_string()),
        ];
        if let Some(token) = &self.token {
            query.push(("token", token.clone()));
        }

        let response = self.client.get(&self.url).query(&query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &self.url));
        }

        let body: Value = response.json().await?;
        // ArcGIS reports failures inside a 200 response
        if let Some(error) = body.get("error") {
            let code = error.get("code").and_then(Value::as_u64).unwrap_or_default();
            let message = error.get("message").and_then(Value::as_str).unwrap_or("unknown error");
            return Err(match code {
                498 | 499 => IngestionError::FatalConfig(format!("{}: token rejected: {message}", self.url)),
                400 => IngestionError::Schema(format!("{}: {message}", self.url)),
                _ => IngestionError::TransientIo(format!("{}: service error {code}: {message}", self.url)),
            });
        }
        debug!(offset, limit, "Fetched page");
        Ok(body)
    }
}

fn classify_status(status: StatusCode, url: &str) -> IngestionError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            IngestionError::FatalConfig(format!("{url}: credentials rejected ({status})"))
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            IngestionError::TransientIo(format!("{url}: {status}"))
        }
        s if s.is_server_error() => IngestionError::TransientIo(format!("{url}: {status}")),
        _ => IngestionError::Schema(format!("{url}: unexpected status {status}")),
    }
}

/// Polls a paged API. Each `extract` is one poll over all pages.
///
/// Records already seen within the dedup window are dropped and counted as
/// duplicates. The window persists across polls.
pub struct PollingApiConnector {
    config: SourceConfig,
    fetcher: Arc<dyn PageFetcher>,
    executor: RetryExecutor,
    recent: Arc<Mutex<RecentIds>>,
    stats: Arc<StatsCounters>,
    sequence: Arc<AtomicU64>,
    connected: bool,
    polls: u64,
}

impl PollingApiConnector {
    pub fn with_fetcher(config: SourceConfig, fetcher: Arc<dyn PageFetcher>, policy: RetryPolicy) -> Self {
        let executor = RetryExecutor::new(policy, config.max_retries);
        let recent = Arc::new(Mutex::new(RecentIds::new(config.dedup.window)));
        Self {
            config,
            fetcher,
            executor,
            recent,
            stats: Arc::new(StatsCounters::default()),
            sequence: Arc::new(AtomicU64::new(0)),
            connected: false,
            polls: 0,
        }
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }
}

#[async_trait]
impl Connector for PollingApiConnector {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    /// Probe the endpoint with a one-item page.
    #[instrument(skip(self), fields(source = %self.config.name))]
    async fn connect(&mut self) -> Result<()> {
        let fetcher = self.fetcher.clone();
        let probe = self
            .executor
            .run("connect", |_| {
                let fetcher = fetcher.clone();
                async move { fetcher.fetch_page(0, 1).await }
            })
            .await?;
        self.stats.add_retries(probe.retries);

        if probe.value.get("features").map_or(true, |f| !f.is_array()) {
            return Err(IngestionError::Schema(format!(
                "{}: response has no `features` array",
                self.config.name
            )));
        }
        info!(url = %self.config.location, "API source connected");
        self.connected = true;
        Ok(())
    }

    fn extract(&mut self) -> Result<RecordStream<'_>> {
        if !self.connected {
            return Err(IngestionError::Connection(format!("{} is not connected", self.config.name)));
        }
        self.polls += 1;

        let state = PollState {
            source: self.config.name.clone(),
            page_size: self.config.page_size,
            key: self.config.dedup.key.clone(),
            fetcher: self.fetcher.clone(),
            executor: self.executor.clone(),
            recent: self.recent.clone(),
            stats: self.stats.clone(),
            sequence: self.sequence.clone(),
            offset: 0,
            pending: VecDeque::new(),
            done: false,
        };

        Ok(stream::unfold(state, PollState::next).boxed())
    }

    async fn validate_source(&self) -> bool {
        self.fetcher.fetch_page(0, 1).await.is_ok()
    }

    async fn close(&mut self) {
        self.connected = false;
    }

    fn stats(&self) -> ConnectorStats {
        self.stats.snapshot()
    }
}

struct PollState {
    source: String,
    page_size: usize,
    key: DedupKey,
    fetcher: Arc<dyn PageFetcher>,
    executor: RetryExecutor,
    recent: Arc<Mutex<RecentIds>>,
    stats: Arc<StatsCounters>,
    sequence: Arc<AtomicU64>,
    offset: usize,
    pending: VecDeque<RawRecord>,
    done: bool,
}

impl PollState {
    async fn next(mut self) -> Option<(Result<RawRecord>, Self)> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some((Ok(record), self));
            }
            if self.done {
                return None;
            }

            let offset = self.offset;
            let limit = self.page_size;
            let fetcher = self.fetcher.clone();
            let page = self
                .executor
                .run("fetch_page", |_| {
                    let fetcher = fetcher.clone();
                    async move { fetcher.fetch_page(offset, limit).await }
                })
                .await;

            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    warn!(source = %self.source, offset, error = %e, "Page fetch failed, ending poll");
                    self.done = true;
                    return Some((Err(e), self));
                }
            };
            self.stats.add_page(page.retries);

            let exceeded = page
                .value
                .get("exceededTransferLimit")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let features = match page.value {
                Value::Object(mut body) => match body.remove("features") {
                    Some(Value::Array(features)) => features,
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            };

            let received = features.len();
            let mut fresh = 0usize;
            {
                let mut recent = self.recent.lock().await;
                for feature in features {
                    let record = record_from_value(&self.source, next_sequence(&self.sequence), feature)
                        .with_retry_count(page.retries);
                    let record = assign_id(record, &self.key);
                    if let Some(key) = dedup_key(&record, &self.key) {
                        if !recent.insert(key) {
                            self.stats.add_duplicate();
                            continue;
                        }
                    }
                    self.stats.record_emitted(&record);
                    self.pending.push_back(record);
                    fresh += 1;
                }
            }
            debug!(source = %self.source, offset, received, fresh, "Page processed");

            self.offset += received;
            if received == 0 || (received < self.page_size && !exceeded) {
                self.done = true;
            }
        }
    }
}
