//! Destinations for curated and quarantined records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::enrich::EnrichedRecord;
use crate::error::{IngestionError, Result};
use crate::quarantine::QuarantineEntry;

/// Append-only destination shared by all source workers.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write(&self, record: &EnrichedRecord) -> Result<()>;

    async fn write_quarantine(&self, entry: &QuarantineEntry) -> Result<()>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory sink for tests and dry runs.
///
/// Writes can be paused to simulate a slow consumer, delayed, or made to fail.
#[derive(Debug)]
pub struct MemorySink {
    records: Mutex<Vec<EnrichedRecord>>,
    quarantine: Mutex<Vec<QuarantineEntry>>,
    gate: watch::Sender<bool>,
    write_delay: Option<Duration>,
    failures_left: AtomicU32,
    quarantine_failures_left: AtomicU32,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            records: Mutex::new(Vec::new()),
            quarantine: Mutex::new(Vec::new()),
            gate,
            write_delay: None,
            failures_left: AtomicU32::new(0),
            quarantine_failures_left: AtomicU32::new(0),
        }
    }

    /// Sleep this long before every curated write.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Block curated writes until [`MemorySink::resume`].
    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    /// Fail the next `n` curated writes with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` quarantine writes with a transient error.
    pub fn fail_next_quarantine_writes(&self, n: u32) {
        self.quarantine_failures_left.store(n, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<EnrichedRecord> {
        self.records.lock().await.clone()
    }

    pub async fn quarantined(&self) -> Vec<QuarantineEntry> {
        self.quarantine.lock().await.clone()
    }

    async fn wait_until_open(&self) -> Result<()> {
        let mut rx = self.gate.subscribe();
        rx.wait_for(|open| *open)
            .await
            .map(|_| ())
            .map_err(|_| IngestionError::TransientIo("memory sink gate closed".to_string()))
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write(&self, record: &EnrichedRecord) -> Result<()> {
        self.wait_until_open().await?;
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }

        if take_failure(&self.failures_left) {
            return Err(IngestionError::TransientIo(format!(
                "memory sink rejected write of {}",
                record.record.id
            )));
        }

        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn write_quarantine(&self, entry: &QuarantineEntry) -> Result<()> {
        if take_failure(&self.quarantine_failures_left) {
            return Err(IngestionError::TransientIo(format!(
                "memory sink rejected quarantine of {}",
                entry.record.id
            )));
        }
        self.quarantine.lock().await.push(entry.clone());
        Ok(())
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Appends records as JSON lines under a base directory:
///
/// ```text
/// <base>/curated/<source>.jsonl
/// <base>/quarantine/<source>.jsonl
/// ```
///
/// Each file has its own lock, so workers writing different files never
/// wait on each other.
#[derive(Debug)]
pub struct JsonLinesSink {
    base_dir: PathBuf,
    files: Mutex<HashMap<PathBuf, Arc<Mutex<File>>>>,
}

impl JsonLinesSink {
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(base_dir.join("curated")).await?;
        fs::create_dir_all(base_dir.join("quarantine")).await?;
        info!(path = %base_dir.display(), "Writing JSON lines output");
        Ok(Self {
            base_dir,
            files: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn curated_path(&self, source: &str) -> PathBuf {
        self.base_dir.join("curated").join(format!("{source}.jsonl"))
    }

    pub fn quarantine_path(&self, source: &str) -> PathBuf {
        self.base_dir.join("quarantine").join(format!("{source}.jsonl"))
    }

    /// Open handle for `path`. The map lock is held only for the lookup.
    async fn handle(&self, path: &Path) -> Result<Arc<Mutex<File>>> {
        let mut files = self.files.lock().await;
        if let Some(file) = files.get(path) {
            return Ok(file.clone());
        }
        debug!(path = %path.display(), "Opening output file");
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        let file = Arc::new(Mutex::new(file));
        files.insert(path.to_path_buf(), file.clone());
        Ok(file)
    }

    async fn append<T: Serialize + Sync>(&self, path: PathBuf, value: &T) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');

        let file = self.handle(&path).await?;
        let mut file = file.lock().await;
        file.write_all(&line).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn write(&self, record: &EnrichedRecord) -> Result<()> {
        self.append(self.curated_path(&record.record.source), record).await
    }

    async fn write_quarantine(&self, entry: &QuarantineEntry) -> Result<()> {
        self.append(self.quarantine_path(&entry.record.source), entry).await
    }

    async fn flush(&self) -> Result<()> {
        let handles: Vec<_> = self.files.lock().await.values().cloned().collect();
        for file in handles {
            let mut file = file.lock().await;
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }
}
