//! Error types for repolore.
//!
//! Library crates use [`RepoloreError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all repolore operations.
#[derive(Debug, thiserror::Error)]
pub enum RepoloreError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The evidence supplier failed to produce raw candidates for a dimension.
    #[error("evidence error in {dimension}: {message}")]
    Evidence { dimension: String, message: String },

    /// A single raw candidate could not be turned into a signal.
    #[error("signal error: {0}")]
    Signal(String),

    /// The production agent returned an error.
    #[error("production error: {0}")]
    Production(String),

    /// The production agent did not settle within its ceiling.
    #[error("production timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Persisting a candidate through the sink failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The aggregation pass failed.
    #[error("aggregation error: {0}")]
    Aggregation(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (malformed scan file, unknown dimension, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RepoloreError>;

impl RepoloreError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an evidence error for a dimension.
    pub fn evidence(dimension: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Evidence {
            dimension: dimension.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error came from the production timeout race.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for RepoloreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = RepoloreError::config("missing agent script");
        assert_eq!(err.to_string(), "config error: missing agent script");

        let err = RepoloreError::evidence("code-standard", "scanner crashed");
        assert_eq!(
            err.to_string(),
            "evidence error in code-standard: scanner crashed"
        );

        let err = RepoloreError::Timeout { secs: 180 };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("180s"));
    }

    #[test]
    fn serde_json_errors_convert() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let err: RepoloreError = parse.unwrap_err().into();
        assert!(matches!(err, RepoloreError::Serialization(_)));
    }
}
