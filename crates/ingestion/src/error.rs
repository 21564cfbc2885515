//! Error types for the ingestion crate.

use thiserror::Error;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    #[error("Schema mismatch: {0}")]
    Schema(String),

    #[error("Validation failed: {}", rules.join(", "))]
    ValidationFailure { rules: Vec<String> },

    #[error("Invalid source configuration: {0}")]
    FatalConfig(String),

    #[error("Source '{0}' cannot be extracted twice")]
    NotRestartable(String),

    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<IngestionError>,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to load reference data: {0}")]
    Reference(#[from] geospatial::SpatialError),

    #[error(transparent)]
    Rules(#[from] validation::ValidationError),
}

/// Error categories recorded in quarantine entries and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    TransientIo,
    Schema,
    ValidationFailure,
    FatalConfig,
    NotRestartable,
    RetriesExhausted,
    Cancelled,
    Io,
}

impl IngestionError {
    /// Whether the retry executor may try the operation again.
    pub fn is_transient(&self) -> bool {
        match self {
            IngestionError::Connection(_)
            | IngestionError::Timeout(_)
            | IngestionError::TransientIo(_) => true,
            IngestionError::Http(e) if e.is_decode() => false,
            IngestionError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map_or(true, |s| s.is_server_error())
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestionError::Connection(_) => ErrorKind::Connection,
            IngestionError::Timeout(_) => ErrorKind::Timeout,
            IngestionError::TransientIo(_) => ErrorKind::TransientIo,
            IngestionError::Schema(_) | IngestionError::Json(_) => ErrorKind::Schema,
            IngestionError::ValidationFailure { .. } => ErrorKind::ValidationFailure,
            IngestionError::FatalConfig(_)
            | IngestionError::Reference(_)
            | IngestionError::Rules(_) => ErrorKind::FatalConfig,
            IngestionError::NotRestartable(_) => ErrorKind::NotRestartable,
            IngestionError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            IngestionError::Cancelled(_) => ErrorKind::Cancelled,
            IngestionError::Http(e) if e.is_decode() => ErrorKind::Schema,
            IngestionError::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            IngestionError::Http(_) => ErrorKind::Connection,
            IngestionError::Io(_) => ErrorKind::Io,
        }
    }
}

/// Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestionError>;
