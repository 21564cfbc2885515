//! Batch file connector: GeoJSON, CSV, NDJSON and JSON files, optionally
//! gzipped, from a single path or a directory tree.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use fire_common::{RawRecord, RecordFields};

use super::{assign_id, next_sequence, record_from_value, Connector, ConnectorStats, RecordStream, StatsCounters};
use crate::config::{FormatHint, SourceConfig, SourceKind};
use crate::error::{IngestionError, Result};

const SUPPORTED_EXTENSIONS: [&str; 6] = ["geojson", "json", "csv", "ndjson", "jsonl", "gz"];

/// Reads every supported file under `location` in sorted path order.
/// Restartable: each call to `extract` rereads the files.
pub struct BatchFileConnector {
    config: SourceConfig,
    files: Vec<PathBuf>,
    connected: bool,
    stats: Arc<StatsCounters>,
    sequence: Arc<AtomicU64>,
}

impl BatchFileConnector {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            files: Vec::new(),
            connected: false,
            stats: Arc::new(StatsCounters::default()),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Files found by the last `connect`.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    fn discover(&self) -> Result<Vec<PathBuf>> {
        let root = Path::new(&self.config.location);
        if !root.exists() {
            return Err(IngestionError::Connection(format!(
                "{}: path {} does not exist",
                self.config.name,
                root.display()
            )));
        }
        if root.is_file() {
            return Ok(vec![root.to_path_buf()]);
        }

        let mut files: Vec<PathBuf> = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl Connector for BatchFileConnector {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Batch
    }

    #[instrument(skip(self), fields(source = %self.config.name))]
    async fn connect(&mut self) -> Result<()> {
        let files = self.discover()?;
        if files.is_empty() {
            warn!(location = %self.config.location, "No input files found");
        }

        // Probe whole-document formats so a wrong schema fails the source early
        for path in &files {
            let format = detect_format(path, self.config.format_hint);
            if matches!(format, FormatHint::Geojson | FormatHint::Arcgis) {
                let content = read_file(path).await?;
                let doc: Value = serde_json::from_slice(&content).map_err(|e| {
                    IngestionError::Schema(format!("{}: {e}", path.display()))
                })?;
                feature_items(doc, format).map_err(|e| match e {
                    IngestionError::Schema(msg) => IngestionError::Schema(format!("{}: {msg}", path.display())),
                    other => other,
                })?;
            }
        }

        info!(files = files.len(), "Batch source connected");
        self.files = files;
        self.connected = true;
        Ok(())
    }

    fn extract(&mut self) -> Result<RecordStream<'_>> {
        if !self.connected {
            return Err(IngestionError::Connection(format!("{} is not connected", self.config.name)));
        }

        let source = self.config.name.clone();
        let hint = self.config.format_hint;
        let key = self.config.dedup.key.clone();
        let stats = self.stats.clone();
        let sequence = self.sequence.clone();

        let stream = stream::iter(self.files.clone())
            .then(move |path| {
                let source = source.clone();
                let sequence = sequence.clone();
                let stats = stats.clone();
                let key = key.clone();
                async move {
                    let format = detect_format(&path, hint);
                    debug!(path = %path.display(), ?format, "Reading file");
                    let items: Vec<Result<RawRecord>> = match read_file(&path).await {
                        Ok(content) => match parse_content(&source, &content, format, &sequence) {
                            Ok(records) => records
                                .into_iter()
                                .map(|r| {
                                    let r = assign_id(r, &key);
                                    stats.record_emitted(&r);
                                    Ok(r)
                                })
                                .collect(),
                            Err(e) => vec![Err(e)],
                        },
                        Err(e) => vec![Err(e)],
                    };
                    stats.add_file();
                    stream::iter(items)
                }
            })
            .flatten();

        Ok(stream.boxed())
    }

    async fn validate_source(&self) -> bool {
        Path::new(&self.config.location).exists()
    }

    async fn close(&mut self) {
        if self.connected {
            debug!(source = %self.config.name, "Batch source closed");
        }
        self.connected = false;
    }

    fn stats(&self) -> ConnectorStats {
        self.stats.snapshot()
    }
}

fn detect_format(path: &Path, hint: Option<FormatHint>) -> FormatHint {
    if let Some(hint) = hint {
        return hint;
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_lowercase();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    match name.rsplit('.').next() {
        Some("geojson") => FormatHint::Geojson,
        Some("csv") => FormatHint::Csv,
        Some("ndjson") | Some("jsonl") => FormatHint::Ndjson,
        _ => FormatHint::Json,
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    let bytes = tokio::fs::read(path).await?;
    let is_gz = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);
    if !is_gz {
        return Ok(bytes);
    }
    let mut decoded = Vec::new();
    GzDecoder::new(bytes.as_slice())
        .read_to_end(&mut decoded)
        .map_err(|e| IngestionError::Schema(format!("{}: bad gzip data: {e}", path.display())))?;
    Ok(decoded)
}

/// Pull the item list out of a feature document.
fn feature_items(doc: Value, format: FormatHint) -> Result<Vec<Value>> {
    match doc {
        Value::Object(mut map) => match map.remove("features") {
            Some(Value::Array(features)) => Ok(features),
            Some(_) => Err(IngestionError::Schema("`features` is not an array".to_string())),
            None => Err(IngestionError::Schema(format!(
                "{} document has no `features` member",
                if format == FormatHint::Arcgis { "ArcGIS" } else { "GeoJSON" }
            ))),
        },
        Value::Array(items) if format == FormatHint::Json => Ok(items),
        _ => Err(IngestionError::Schema("expected a JSON object".to_string())),
    }
}

fn parse_content(source: &str, content: &[u8], format: FormatHint, sequence: &AtomicU64) -> Result<Vec<RawRecord>> {
    match format {
        FormatHint::Csv => Ok(parse_csv(source, content, sequence)),
        FormatHint::Ndjson => Ok(parse_ndjson(source, content, sequence)),
        FormatHint::Geojson | FormatHint::Arcgis | FormatHint::Json => {
            let doc: Value = serde_json::from_slice(content)
                .map_err(|e| IngestionError::Schema(format!("{source}: {e}")))?;
            let items = match (format, doc) {
                // Plain JSON may be either an array of items or a feature document
                (FormatHint::Json, Value::Array(items)) => items,
                (format, doc) => feature_items(doc, format)?,
            };
            Ok(items
                .into_iter()
                .map(|item| record_from_value(source, next_sequence(sequence), item))
                .collect())
        }
    }
}

fn parse_csv(source: &str, content: &[u8], sequence: &AtomicU64) -> Vec<RawRecord> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(content);

    let headers: Vec<String> = match reader.headers() {
        Ok(h) => h.iter().map(|h| h.to_lowercase()).collect(),
        Err(e) => {
            return vec![RawRecord::malformed(source, next_sequence(sequence), "", format!("unreadable CSV header: {e}"))];
        }
    };

    reader
        .records()
        .map(|row| {
            let seq = next_sequence(sequence);
            match row {
                Ok(row) => {
                    let fields: RecordFields = headers
                        .iter()
                        .zip(row.iter())
                        .map(|(h, v)| {
                            let value = if v.is_empty() { Value::Null } else { Value::String(v.to_string()) };
                            (h.clone(), value)
                        })
                        .collect();
                    RawRecord::new(source, seq, fields)
                }
                Err(e) => {
                    let line = e.position().map(|p| p.line()).unwrap_or_default();
                    RawRecord::malformed(source, seq, format!("line {line}"), e.to_string())
                }
            }
        })
        .collect()
}

fn parse_ndjson(source: &str, content: &[u8], sequence: &AtomicU64) -> Vec<RawRecord> {
    String::from_utf8_lossy(content)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let seq = next_sequence(sequence);
            match serde_json::from_str::<Value>(line) {
                Ok(value) => record_from_value(source, seq, value),
                Err(e) => RawRecord::malformed(source, seq, line, e.to_string()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use test_utils::{perimeter_csv, perimeter_feature_collection, write_fixture, write_gz_fixture};

    fn connector(dir: &Path) -> BatchFileConnector {
        BatchFileConnector::new(SourceConfig::new("perimeters", SourceKind::Batch, dir.display().to_string()))
    }

    async fn collect(c: &mut BatchFileConnector) -> Vec<RawRecord> {
        c.extract().unwrap().try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn test_reads_directory_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), "b.csv", &perimeter_csv(3));
        write_fixture(dir.path(), "a.geojson", &perimeter_feature_collection(2, &[]));
        write_fixture(dir.path(), "notes.txt", "ignored");

        let mut c = connector(dir.path());
        c.connect().await.unwrap();
        assert_eq!(c.files().len(), 2);

        let records = collect(&mut c).await;
        assert_eq!(records.len(), 5);
        // GeoJSON first, then CSV rows
        assert!(records[0].geometry.is_some());
        assert_eq!(records[2].get_str("fire_name").as_deref(), Some("FIRE-0"));
        let seqs: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert_eq!(records[0].id, "1");
        assert_eq!(c.stats().files, 2);
    }

    #[tokio::test]
    async fn test_gzip_and_ndjson_with_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let ndjson = "{\"objectid\": 1, \"latitude\": 37.0, \"longitude\": -120.0}\n{broken\n\n{\"objectid\": 2}\n";
        write_gz_fixture(dir.path(), "alerts.ndjson.gz", ndjson);

        let mut c = connector(dir.path());
        c.connect().await.unwrap();
        let records = collect(&mut c).await;
        assert_eq!(records.len(), 3);
        assert!(records[1].is_malformed());
        assert_eq!(records[1].get_str("raw").as_deref(), Some("{broken"));
        assert_eq!(c.stats().malformed, 1);
    }

    #[tokio::test]
    async fn test_csv_empty_cells_are_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "p.csv", "OBJECTID,FIRE_NAME,ACRES\n1,,12.5\n2,Creek\n");
        let mut c = connector(&path);
        c.connect().await.unwrap();
        let records = collect(&mut c).await;
        assert!(records[0].get("fire_name").is_none());
        assert_eq!(records[0].get_f64("acres"), Some(12.5));
        // Short row
        assert!(records[1].is_malformed());
    }

    #[tokio::test]
    async fn test_schema_error_on_connect() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), "bad.geojson", r#"{"type": "FeatureCollection"}"#);
        let mut c = connector(dir.path());
        assert!(matches!(c.connect().await, Err(IngestionError::Schema(_))));
    }

    #[tokio::test]
    async fn test_missing_path_is_connection_error() {
        let mut c = connector(Path::new("/definitely/not/here"));
        assert!(matches!(c.connect().await, Err(IngestionError::Connection(_))));
        assert!(!c.validate_source().await);
    }

    #[tokio::test]
    async fn test_restartable() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), "a.csv", &perimeter_csv(2));
        let mut c = connector(dir.path());
        c.connect().await.unwrap();
        assert_eq!(collect(&mut c).await.len(), 2);
        let again = collect(&mut c).await;
        assert_eq!(again.len(), 2);
        assert_eq!(again[0].sequence, 2);
        c.close().await;
        c.close().await;
    }
}
