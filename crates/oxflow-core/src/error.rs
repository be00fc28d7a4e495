//! Error types for the core data model.

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the core data model.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Schema derivation or table model error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Filter pattern could not be compiled
    #[error("Filter error: {0}")]
    Filter(String),

    /// Snapshot reader failure (bootstrap metadata load)
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a new schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a new filter error
    pub fn filter(msg: impl Into<String>) -> Self {
        Self::Filter(msg.into())
    }

    /// Create a new snapshot error
    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::Snapshot(msg.into())
    }
}

/// A DDL statement that could not be parsed.
///
/// Parse failures are non-fatal by default: the engine logs them and still
/// records the statement to the DDL history so a later restart replays the
/// same input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot parse DDL statement '{statement}': {message}")]
pub struct DdlParseError {
    /// The offending statement text
    pub statement: String,
    /// What went wrong
    pub message: String,
}

impl DdlParseError {
    pub fn new(statement: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            message: message.into(),
        }
    }
}
