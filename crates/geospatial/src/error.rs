//! Error types for spatial indexing and joins.

use thiserror::Error;

/// Errors that can occur during spatial computation.
#[derive(Error, Debug)]
pub enum SpatialError {
    #[error("Coordinate out of range: lat={lat}, lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error("Resolution {0} is outside 0..=15")]
    InvalidResolution(u8),

    #[error("Invalid cell id: {0}")]
    InvalidCellId(String),

    #[error("Invalid reference data: {0}")]
    Reference(String),

    #[error("Failed to read reference data: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse reference data: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Geometry(#[from] fire_common::CommonError),
}

/// Result type for spatial operations.
pub type Result<T> = std::result::Result<T, SpatialError>;
