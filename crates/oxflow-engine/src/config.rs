//! Engine configuration from a flat properties map.
//!
//! Hosts hand the engine the same kind of string→string map they would give
//! any connector deployment. Recognized keys are listed below; unknown keys
//! are logged and passed through to the connector untouched, so connector
//! options ride in the same map. Missing required keys fail with a
//! `ConfigError` before the engine ever reaches its running state.

use crate::error::{EngineError, Result};
use crate::registry::DdlErrorPolicy;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// `name` - logical engine identifier used in logs. Required.
pub const NAME: &str = "name";
/// `connector.class` - connector name resolved via the host registry. Required.
pub const CONNECTOR_CLASS: &str = "connector.class";
/// `offset.storage.file.filename` - path for the file-backed offset store. Required.
pub const OFFSET_STORAGE_PATH: &str = "offset.storage.file.filename";
/// `offset.flush.interval.ms` - flush period; 0 flushes after every batch.
pub const OFFSET_FLUSH_INTERVAL_MS: &str = "offset.flush.interval.ms";
/// `offset.commit.timeout.ms` - per-flush deadline.
pub const OFFSET_COMMIT_TIMEOUT_MS: &str = "offset.commit.timeout.ms";
/// `offset.commit.policy` - `periodic` (default) or `always`.
pub const OFFSET_COMMIT_POLICY: &str = "offset.commit.policy";
/// `shutdown.timeout.ms` - bound on worker termination at stop.
pub const SHUTDOWN_TIMEOUT_MS: &str = "shutdown.timeout.ms";
/// `max.flush.retries` - consecutive flush failures tolerated before FAILED.
pub const MAX_FLUSH_RETRIES: &str = "max.flush.retries";
/// `max.queue.size` - record queue capacity.
pub const MAX_QUEUE_SIZE: &str = "max.queue.size";
/// `max.batch.size` - most records dispatched per consumer wake-up.
pub const MAX_BATCH_SIZE: &str = "max.batch.size";
/// `poll.interval.ms` - idle backoff between empty polls.
pub const POLL_INTERVAL_MS: &str = "poll.interval.ms";
/// `ddl.on.error` - `fail`, `continue` (default) or `skip`.
pub const DDL_ON_ERROR: &str = "ddl.on.error";

const RECOGNIZED: &[&str] = &[
    NAME,
    CONNECTOR_CLASS,
    OFFSET_STORAGE_PATH,
    OFFSET_FLUSH_INTERVAL_MS,
    OFFSET_COMMIT_TIMEOUT_MS,
    OFFSET_COMMIT_POLICY,
    SHUTDOWN_TIMEOUT_MS,
    MAX_FLUSH_RETRIES,
    MAX_QUEUE_SIZE,
    MAX_BATCH_SIZE,
    POLL_INTERVAL_MS,
    DDL_ON_ERROR,
];

/// When offsets are flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetCommitPolicy {
    /// On the configured interval
    #[default]
    Periodic,
    /// After every dispatched batch
    Always,
}

/// Parsed engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Logical engine identifier
    pub name: String,
    /// Connector name to resolve in the host registry
    pub connector: String,
    /// Offset store path
    pub offset_storage_path: PathBuf,
    /// Flush period; zero means flush after every batch
    pub offset_flush_interval: Duration,
    /// Per-flush deadline
    pub offset_commit_timeout: Duration,
    /// Flush policy
    pub offset_commit_policy: OffsetCommitPolicy,
    /// Bound on worker termination at stop
    pub shutdown_timeout: Duration,
    /// Consecutive flush failures tolerated before the engine fails
    pub max_flush_retries: u32,
    /// Record queue capacity
    pub max_queue_size: usize,
    /// Most records dispatched per consumer wake-up
    pub max_batch_size: usize,
    /// Idle backoff between empty polls
    pub poll_interval: Duration,
    /// DDL parse-error policy
    pub ddl_error_policy: DdlErrorPolicy,
    /// The full properties map, passed through to the connector
    pub connector_config: HashMap<String, String>,
}

impl EngineConfig {
    /// Parse a properties map.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        for key in props.keys() {
            if !RECOGNIZED.contains(&key.as_str()) {
                debug!("Unrecognized engine option '{}', passing through to the connector", key);
            }
        }

        let name = require(props, NAME)?;
        let connector = require(props, CONNECTOR_CLASS)?;
        let offset_storage_path = PathBuf::from(require(props, OFFSET_STORAGE_PATH)?);

        let offset_commit_policy = match props.get(OFFSET_COMMIT_POLICY).map(String::as_str) {
            None | Some("periodic") => OffsetCommitPolicy::Periodic,
            Some("always") => OffsetCommitPolicy::Always,
            Some(other) => {
                return Err(EngineError::config(format!(
                    "'{}' must be 'periodic' or 'always', got '{}'",
                    OFFSET_COMMIT_POLICY, other
                )))
            }
        };

        let ddl_error_policy = match props.get(DDL_ON_ERROR) {
            None => DdlErrorPolicy::default(),
            Some(value) => value.parse().map_err(EngineError::Config)?,
        };

        Ok(Self {
            name,
            connector,
            offset_storage_path,
            offset_flush_interval: millis(props, OFFSET_FLUSH_INTERVAL_MS, 60_000)?,
            offset_commit_timeout: millis(props, OFFSET_COMMIT_TIMEOUT_MS, 5_000)?,
            offset_commit_policy,
            shutdown_timeout: millis(props, SHUTDOWN_TIMEOUT_MS, 10_000)?,
            max_flush_retries: number(props, MAX_FLUSH_RETRIES, 5)?,
            max_queue_size: number(props, MAX_QUEUE_SIZE, 2_048)?,
            max_batch_size: number(props, MAX_BATCH_SIZE, 1_024)?,
            poll_interval: millis(props, POLL_INTERVAL_MS, 500)?,
            ddl_error_policy,
            connector_config: props.clone(),
        })
    }

    /// True when offsets should be flushed after every batch.
    pub fn flush_after_each_batch(&self) -> bool {
        self.offset_commit_policy == OffsetCommitPolicy::Always
            || self.offset_flush_interval.is_zero()
    }
}

fn require(props: &HashMap<String, String>, key: &str) -> Result<String> {
    match props.get(key) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(EngineError::config(format!("missing required option '{}'", key))),
    }
}

fn millis(props: &HashMap<String, String>, key: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_millis(number(props, key, default)?))
}

fn number<N>(props: &HashMap<String, String>, key: &str, default: N) -> Result<N>
where
    N: std::str::FromStr,
    N::Err: std::fmt::Display,
{
    match props.get(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| EngineError::config(format!("invalid value for '{}': {}", key, e))),
    }
}
