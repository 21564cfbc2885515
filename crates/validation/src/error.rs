//! Error types for rule loading.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Failed to read rule set {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse rule set: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("Duplicate rule name '{0}'")]
    DuplicateRule(String),

    #[error("Unknown rule set: {0}")]
    UnknownRuleSet(String),
}

pub type Result<T> = std::result::Result<T, ValidationError>;
