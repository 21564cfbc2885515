//! Rule-based validation and quality scoring.
//!
//! Rules are a closed set of tagged checks (`bounding_box`, `range`,
//! `required`, `domain`, `temporal`) loaded from YAML. Evaluation is pure:
//! it returns a [`ValidationResult`] and leaves quarantine and sink writes to
//! the caller.

pub mod engine;
pub mod error;
pub mod rule;
pub mod ruleset;

// Re-exports
pub use engine::{summarize, BatchQuality, TriggeredRule, ValidationEngine, ValidationResult, MALFORMED_RULE};
pub use error::{Result, ValidationError};
pub use rule::{reason, FailureAction, RecordAction, RuleCheck, Severity, ValidationRule};
pub use ruleset::{RuleRegistry, RuleSet};
