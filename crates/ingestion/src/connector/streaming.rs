//! Continuous feed connector over a bounded in-memory buffer.
//!
//! Producers push through a [`StreamFeed`]. When the buffer is full a push
//! waits until the pipeline drains it; nothing is dropped. A `tcp://`
//! location spawns a reader that pushes one NDJSON line per record.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use fire_common::{RawRecord, RecordFields};

use super::{assign_id, next_sequence, record_from_value, Connector, ConnectorStats, RecordStream, StatsCounters};
use crate::config::{SourceConfig, SourceKind};
use crate::error::{IngestionError, Result};

/// One item pushed into a stream.
#[derive(Debug, Clone)]
pub enum FeedItem {
    Fields(RecordFields),
    /// A JSON text line, parsed by the connector
    Line(String),
}

/// Producer handle for a [`StreamingConnector`].
#[derive(Debug, Clone)]
pub struct StreamFeed {
    tx: mpsc::Sender<FeedItem>,
}

impl StreamFeed {
    /// Push a record, waiting while the buffer is full.
    pub async fn push(&self, fields: RecordFields) -> Result<()> {
        self.send(FeedItem::Fields(fields)).await
    }

    pub async fn push_line(&self, line: impl Into<String>) -> Result<()> {
        self.send(FeedItem::Line(line.into())).await
    }

    async fn send(&self, item: FeedItem) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| IngestionError::Connection("stream consumer has gone away".to_string()))
    }

    /// Free slots left in the buffer.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// Single-pass connector over a bounded channel. Not restartable.
pub struct StreamingConnector {
    config: SourceConfig,
    tx: Option<mpsc::Sender<FeedItem>>,
    rx: Option<mpsc::Receiver<FeedItem>>,
    reader: Option<JoinHandle<()>>,
    extracted: bool,
    stats: Arc<StatsCounters>,
    sequence: Arc<AtomicU64>,
}

impl StreamingConnector {
    pub fn new(config: SourceConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_capacity.max(1));
        Self {
            config,
            tx: Some(tx),
            rx: Some(rx),
            reader: None,
            extracted: false,
            stats: Arc::new(StatsCounters::default()),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A producer handle. Only available until `extract` is called; the feed
    /// ends once every handle has been dropped.
    pub fn feed(&self) -> Option<StreamFeed> {
        self.tx.as_ref().map(|tx| StreamFeed { tx: tx.clone() })
    }

    fn tcp_address(&self) -> Option<&str> {
        self.config.location.strip_prefix("tcp://")
    }
}

#[async_trait]
impl Connector for StreamingConnector {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Stream
    }

    #[instrument(skip(self), fields(source = %self.config.name))]
    async fn connect(&mut self) -> Result<()> {
        if self.extracted {
            return Err(IngestionError::NotRestartable(self.config.name.clone()));
        }
        let Some(addr) = self.tcp_address().map(str::to_string) else {
            debug!("In-memory stream ready");
            return Ok(());
        };
        if self.reader.is_some() {
            return Ok(());
        }

        let socket = TcpStream::connect(&addr)
            .await
            .map_err(|e| IngestionError::Connection(format!("{addr}: {e}")))?;
        let Some(tx) = self.tx.take() else {
            return Err(IngestionError::NotRestartable(self.config.name.clone()));
        };
        info!(%addr, "Stream socket connected");

        let source = self.config.name.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(socket).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        if tx.send(FeedItem::Line(line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!(%source, "Stream socket closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(%source, error = %e, "Stream socket read failed");
                        break;
                    }
                }
            }
        }));
        Ok(())
    }

    fn extract(&mut self) -> Result<RecordStream<'_>> {
        if self.extracted {
            return Err(IngestionError::NotRestartable(self.config.name.clone()));
        }
        let rx = self
            .rx
            .take()
            .ok_or_else(|| IngestionError::NotRestartable(self.config.name.clone()))?;
        self.extracted = true;
        // From here on only external feeds keep the channel open
        self.tx = None;

        let source = self.config.name.clone();
        let key = self.config.dedup.key.clone();
        let stats = self.stats.clone();
        let sequence = self.sequence.clone();

        let stream = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).map(
            move |item| {
                let seq = next_sequence(&sequence);
                let record = match item {
                    FeedItem::Fields(fields) => RawRecord::new(source.as_str(), seq, fields),
                    FeedItem::Line(line) => match serde_json::from_str::<Value>(&line) {
                        Ok(value) => record_from_value(&source, seq, value),
                        Err(e) => RawRecord::malformed(source.as_str(), seq, line, e.to_string()),
                    },
                };
                let record = assign_id(record, &key);
                stats.record_emitted(&record);
                Ok(record)
            },
        );
        Ok(stream.boxed())
    }

    async fn validate_source(&self) -> bool {
        match &self.reader {
            Some(reader) => !reader.is_finished(),
            None => !self.extracted || self.tx.is_some(),
        }
    }

    async fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.tx = None;
        self.rx = None;
    }

    fn stats(&self) -> ConnectorStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn config(location: &str, capacity: usize) -> SourceConfig {
        let mut config = SourceConfig::new("alerts", SourceKind::Stream, location);
        config.buffer_capacity = capacity;
        config.dedup.key = "alert_id".to_string().into();
        config
    }

    #[tokio::test]
    async fn test_feed_then_extract() {
        let mut c = StreamingConnector::new(config("memory://alerts", 8));
        let feed = c.feed().unwrap();
        c.connect().await.unwrap();

        let mut stream = c.extract().unwrap();
        feed.push(json!({"alert_id": "A-1", "severity": "HIGH"}).as_object().cloned().unwrap())
            .await
            .unwrap();
        feed.push_line("not json").await.unwrap();
        drop(feed);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.id, "A-1");
        let second = stream.next().await.unwrap().unwrap();
        assert!(second.is_malformed());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_not_restartable() {
        let mut c = StreamingConnector::new(config("memory://alerts", 2));
        c.connect().await.unwrap();
        drop(c.extract().unwrap());
        assert!(matches!(c.extract(), Err(IngestionError::NotRestartable(_))));
        assert!(c.feed().is_none());
    }

    #[tokio::test]
    async fn test_push_waits_when_full() {
        let c = StreamingConnector::new(config("memory://alerts", 2));
        let feed = c.feed().unwrap();
        let fields = || json!({"alert_id": "x"}).as_object().cloned().unwrap();
        feed.push(fields()).await.unwrap();
        feed.push(fields()).await.unwrap();
        assert_eq!(feed.available(), 0);

        let blocked = tokio::time::timeout(std::time::Duration::from_millis(50), feed.push(fields())).await;
        assert!(blocked.is_err(), "push should wait for free capacity");
    }

    #[tokio::test]
    async fn test_tcp_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"{\"alert_id\": \"T-1\"}\n\n{\"alert_id\": \"T-2\"}\n")
                .await
                .unwrap();
        });

        let mut c = StreamingConnector::new(config(&format!("tcp://{addr}"), 4));
        c.connect().await.unwrap();
        let ids: Vec<String> = c
            .extract()
            .unwrap()
            .map(|r| r.unwrap().id)
            .collect()
            .await;
        assert_eq!(ids, vec!["T-1", "T-2"]);
        c.close().await;
        c.close().await;
    }
}
