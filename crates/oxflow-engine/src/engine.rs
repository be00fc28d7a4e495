//! The embedded engine: a single-connector host.
//!
//! [`Engine::run`] drives everything on the caller's task: it resolves and
//! initializes the connector, spawns the task worker, then consumes the
//! record queue — dispatching each record to the notification handler,
//! staging its offsets, and flushing them on the configured cadence. The
//! completion callback fires exactly once, on clean shutdown or on failure.
//!
//! Offset durability contract: a record's offsets are staged only after the
//! notification handler has returned for it, so a committed flush covers
//! exactly the records the consumer finished processing before the flush
//! began.

use crate::config::EngineConfig;
use crate::connector::{ConnectorRegistry, StoreOffsetReader};
use crate::error::{EngineError, Result};
use crate::offsets::{FileOffsetStore, FlushOutcome, OffsetStore};
use crate::queue::RecordQueue;
use crate::task::{RunState, TaskHandle, TaskRuntime};
use oxflow_core::SourceRecord;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long the consumer waits on the queue per wake-up; bounds how stale
/// the periodic flush clock can get while idle.
const CONSUME_TICK: Duration = Duration::from_millis(100);

/// Invoked exactly once when the engine finishes: `(success, message, error)`.
pub type CompletionCallback = Box<dyn FnOnce(bool, &str, Option<&EngineError>) + Send>;

/// Invoked synchronously for every record after it leaves the queue.
pub type RecordHandler = Box<dyn FnMut(&SourceRecord) + Send>;

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    properties: HashMap<String, String>,
    connectors: Option<Arc<ConnectorRegistry>>,
    offset_store: Option<Arc<dyn OffsetStore>>,
    on_completion: Option<CompletionCallback>,
    on_record: Option<RecordHandler>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole properties map.
    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    /// Set one property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// The connector registry used to resolve `connector.class`.
    pub fn with_connectors(mut self, connectors: Arc<ConnectorRegistry>) -> Self {
        self.connectors = Some(connectors);
        self
    }

    /// Override the offset store (the default is the file store at the
    /// configured path).
    pub fn with_offset_store(mut self, store: Arc<dyn OffsetStore>) -> Self {
        self.offset_store = Some(store);
        self
    }

    /// Completion callback; fires exactly once.
    pub fn on_completion(mut self, callback: CompletionCallback) -> Self {
        self.on_completion = Some(callback);
        self
    }

    /// Record notification handler; invoked synchronously per record.
    pub fn on_record(mut self, handler: RecordHandler) -> Self {
        self.on_record = Some(handler);
        self
    }

    /// Validate the configuration and build the engine.
    pub fn build(self) -> Result<Engine> {
        let config = EngineConfig::from_properties(&self.properties)?;
        let connectors = self
            .connectors
            .ok_or_else(|| EngineError::config("no connector registry supplied"))?;
        let offset_store = self
            .offset_store
            .unwrap_or_else(|| Arc::new(FileOffsetStore::new(&config.offset_storage_path)));

        let (state_tx, state_rx) = watch::channel(RunState::Created);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Engine {
            config,
            connectors,
            offset_store,
            on_completion: self.on_completion,
            on_record: self.on_record,
            state_tx,
            state_rx,
            shutdown: shutdown_tx,
        })
    }
}

/// Cheap cloneable control surface over a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    state: watch::Receiver<RunState>,
    shutdown: broadcast::Sender<()>,
}

impl EngineHandle {
    /// Current engine state.
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Request a stop. Idempotent and non-blocking.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait until the engine reaches a terminal state. Returns false on
    /// timeout.
    pub async fn await_completion(&self, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        let result = match tokio::time::timeout(timeout, state.wait_for(|s| s.is_terminal())).await
        {
            Ok(Ok(_)) => true,
            // the sender is gone only after a terminal state was published
            Ok(Err(_)) => self.state.borrow().is_terminal(),
            Err(_) => false,
        };
        result
    }
}

/// The embedded CDC engine.
pub struct Engine {
    config: EngineConfig,
    connectors: Arc<ConnectorRegistry>,
    offset_store: Arc<dyn OffsetStore>,
    on_completion: Option<CompletionCallback>,
    on_record: Option<RecordHandler>,
    state_tx: watch::Sender<RunState>,
    state_rx: watch::Receiver<RunState>,
    shutdown: broadcast::Sender<()>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The parsed configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The offset store in use.
    pub fn offset_store(&self) -> Arc<dyn OffsetStore> {
        Arc::clone(&self.offset_store)
    }

    /// A control handle usable from other tasks.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            state: self.state_rx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Run the engine to completion. Blocks the calling task until clean
    /// shutdown or failure; the completion callback fires in either case.
    pub async fn run(mut self) -> Result<()> {
        let name = self.config.name.clone();
        let result = self.run_inner().await;

        let callback = self.on_completion.take();
        match &result {
            Ok(()) => {
                let _ = self.state_tx.send(RunState::Stopped);
                info!("Engine '{}' stopped", name);
                if let Some(callback) = callback {
                    callback(true, &format!("Engine '{}' stopped cleanly", name), None);
                }
            }
            Err(e) => {
                let _ = self.state_tx.send(RunState::Failed);
                error!("Engine '{}' failed: {}", name, e);
                if let Some(callback) = callback {
                    callback(false, &format!("Engine '{}' failed: {}", name, e), Some(e));
                }
            }
        }
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        let config = self.config.clone();
        let _ = self.state_tx.send(RunState::Starting);
        info!("Engine '{}' starting connector '{}'", config.name, config.connector);

        let factory = self.connectors.get(&config.connector).ok_or_else(|| {
            EngineError::config(format!(
                "unknown connector '{}'; available: {:?}",
                config.connector,
                self.connectors.names()
            ))
        })?;
        let mut connector = factory.create();

        let task_configs = connector.initialize(&config.connector_config).await?;
        if task_configs.len() > 1 {
            warn!(
                "Engine '{}': connector returned {} task configurations, running only the first",
                config.name,
                task_configs.len()
            );
        }
        let task_config = task_configs
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::config("connector returned no task configurations"))?;

        // an unreadable store is fatal before any record moves
        self.offset_store.load().await?;
        let offset_reader = Arc::new(StoreOffsetReader::new(self.offset_store.clone()));

        let queue: RecordQueue<SourceRecord> = RecordQueue::new(config.max_queue_size);
        let task_handle = TaskRuntime::new(
            format!("{}-task-0", config.name),
            connector.create_task(),
            queue.clone(),
            task_config,
            offset_reader,
            config.poll_interval,
            config.shutdown_timeout,
        )
        .spawn();

        let _ = self.state_tx.send(RunState::Running);
        info!("Engine '{}' running", config.name);

        let consume_result = self.consume_loop(&config, &queue, &task_handle).await;

        // make sure the worker winds down whatever ended the loop
        task_handle.stop();
        queue.close();
        let worker_result = match tokio::time::timeout(config.shutdown_timeout, task_handle.join()).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("Engine '{}': task worker ignored shutdown; abandoning it", config.name);
                Ok(())
            }
        };

        if let Err(e) = connector.stop().await {
            warn!("Engine '{}': connector stop returned error: {}", config.name, e);
        }

        // a fatal consumer-side error (flush escalation) outranks the
        // worker's view; otherwise surface the worker's failure
        consume_result?;
        worker_result
    }

    async fn consume_loop(
        &mut self,
        config: &EngineConfig,
        queue: &RecordQueue<SourceRecord>,
        task_handle: &TaskHandle,
    ) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut stopping = false;
        let mut flush_failures = 0u32;
        let mut next_flush = Instant::now() + config.offset_flush_interval;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv(), if !stopping => {
                    stopping = true;
                    let _ = self.state_tx.send(RunState::Stopping);
                    info!("Engine '{}' stopping", config.name);
                    task_handle.stop();
                    // keep consuming: the worker drains its final records
                    // into the queue and they must reach the handler
                }
                taken = queue.take(CONSUME_TICK) => {
                    let mut dispatched = false;
                    if let Some(record) = taken {
                        self.dispatch(record);
                        for record in queue.drain(config.max_batch_size.saturating_sub(1)) {
                            self.dispatch(record);
                        }
                        dispatched = true;
                    }

                    let retry_pending =
                        flush_failures > 0 && self.offset_store.staged_count() > 0;
                    let flush_due = if config.flush_after_each_batch() {
                        dispatched || retry_pending
                    } else {
                        Instant::now() >= next_flush
                    };

                    if flush_due {
                        next_flush = Instant::now() + config.offset_flush_interval;
                        if self.offset_store.staged_count() > 0 {
                            self.flush_offsets(config, &mut flush_failures).await?;
                        }
                    }

                    if task_handle.state().is_terminal() && queue.is_empty() {
                        // worker gone and everything dispatched; one final flush
                        if self.offset_store.staged_count() > 0 {
                            self.flush_offsets(config, &mut flush_failures).await?;
                        }
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Dispatch one record: notify, then stage its offsets. Staging after
    /// the handler returns is what ties offset durability to processed
    /// records.
    fn dispatch(&mut self, record: SourceRecord) {
        if let Some(handler) = self.on_record.as_mut() {
            handler(&record);
        }
        self.offset_store
            .stage(record.position.partition, record.position.offset);
    }

    async fn flush_offsets(&mut self, config: &EngineConfig, failures: &mut u32) -> Result<()> {
        match self.offset_store.flush(config.offset_commit_timeout).await {
            FlushOutcome::Committed => {
                *failures = 0;
                debug!("Engine '{}' committed offsets", config.name);
                Ok(())
            }
            outcome @ (FlushOutcome::TimedOut | FlushOutcome::Failed(_)) => {
                *failures += 1;
                warn!(
                    "Engine '{}' offset flush attempt {}/{} did not commit: {:?}",
                    config.name, failures, config.max_flush_retries, outcome
                );
                if *failures >= config.max_flush_retries {
                    return Err(EngineError::store(format!(
                        "offset flush failed {} consecutive time(s)",
                        failures
                    )));
                }
                Ok(())
            }
        }
    }
}
