//! Error types for the engine runtime.
//!
//! Classification matters here: the engine keeps running through a
//! [`EngineError::Parse`] (DDL it could not understand), retries
//! [`EngineError::StoreUnavailable`] up to the configured limit, and treats
//! everything else fatal as grounds for transitioning to `Failed` and firing
//! the completion callback.

use oxflow_core::{CoreError, DdlParseError};
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the engine runtime.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Missing or malformed configuration; fatal at start
    #[error("Configuration error: {0}")]
    Config(String),

    /// The offset store cannot be read or written
    #[error("Offset store unavailable: {0}")]
    StoreUnavailable(String),

    /// A DDL history append failed; fatal immediately
    #[error("DDL history write failed: {0}")]
    HistoryWrite(String),

    /// DDL could not be parsed; non-fatal
    #[error(transparent)]
    Parse(#[from] DdlParseError),

    /// Schema registry error
    #[error("Schema error: {0}")]
    Schema(String),

    /// The source task failed
    #[error("Task '{name}' error: {message}")]
    Task {
        name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The record queue was closed while the producer still held records
    #[error("Record queue closed")]
    QueueClosed,

    /// A deadline elapsed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Shutdown was requested; not a failure
    #[error("Shutdown requested")]
    Shutdown,

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Core data-model error
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl EngineError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a store-unavailable error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create a history-write error
    pub fn history(msg: impl Into<String>) -> Self {
        Self::HistoryWrite(msg.into())
    }

    /// Create a schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a task error without a cause
    pub fn task(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Task {
            name: name.into(),
            message: msg.into(),
            source: None,
        }
    }

    /// Create a task error wrapping the original failure
    pub fn task_with_source(
        name: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Task {
            name: name.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// True when the engine must stop rather than continue
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Parse(_) | Self::Timeout(_) | Self::Shutdown)
    }

    /// True when this is a shutdown signal rather than a failure
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}
