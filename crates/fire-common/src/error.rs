//! Error types for shared record and geometry handling.

use thiserror::Error;

/// Result type alias using CommonError.
pub type CommonResult<T> = Result<T, CommonError>;

/// Errors raised while interpreting shared data types.
#[derive(Debug, Error)]
pub enum CommonError {
    #[error("Invalid bounding box format: {0}. Expected 'min_lon,min_lat,max_lon,max_lat'")]
    InvalidBboxFormat(String),

    #[error("Invalid number in bounding box: {0}")]
    InvalidNumber(String),

    #[error("Unsupported geometry type: {0}")]
    UnsupportedGeometry(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
