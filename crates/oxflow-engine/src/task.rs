//! Task lifecycle: a dedicated worker driving one source task's poll loop.
//!
//! The worker is a spawned tokio task. It observes the stop signal between
//! poll batches via `tokio::select!` — an in-flight `poll` is cancelled at
//! the next await point, which the task contract treats as clean shutdown,
//! not an error. Backpressure from the record queue propagates naturally:
//! `put` waits, so a slow consumer stalls the poll loop instead of growing
//! memory.

use crate::connector::{ConnectorConfig, OffsetReader, SourceTask};
use crate::error::{EngineError, Result};
use crate::queue::RecordQueue;
use oxflow_core::SourceRecord;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle states for the task worker and the engine that hosts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Built, not started
    Created,
    /// Start requested, task initializing
    Starting,
    /// Poll loop active
    Running,
    /// Stop observed, draining
    Stopping,
    /// Terminal: exited cleanly
    Stopped,
    /// Terminal: exited with an error
    Failed,
}

impl RunState {
    /// True for `Stopped` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Everything needed to run one task on its own worker.
pub struct TaskRuntime {
    name: String,
    task: Box<dyn SourceTask>,
    queue: RecordQueue<SourceRecord>,
    config: ConnectorConfig,
    offsets: Arc<dyn OffsetReader>,
    poll_interval: Duration,
    shutdown_timeout: Duration,
}

impl TaskRuntime {
    pub fn new(
        name: impl Into<String>,
        task: Box<dyn SourceTask>,
        queue: RecordQueue<SourceRecord>,
        config: ConnectorConfig,
        offsets: Arc<dyn OffsetReader>,
        poll_interval: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            task,
            queue,
            config,
            offsets,
            poll_interval,
            shutdown_timeout,
        }
    }

    /// Spawn the worker and return its control handle.
    pub fn spawn(self) -> TaskHandle {
        let (state_tx, state_rx) = watch::channel(RunState::Created);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let name = self.name.clone();
        let join = tokio::spawn(run_worker(self, state_tx, shutdown_rx));

        TaskHandle {
            name,
            state: state_rx,
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Control surface for a spawned task worker.
pub struct TaskHandle {
    name: String,
    state: watch::Receiver<RunState>,
    shutdown: broadcast::Sender<()>,
    join: JoinHandle<Result<()>>,
}

impl TaskHandle {
    /// The task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Request a stop. Idempotent and non-blocking; the worker observes the
    /// signal between poll batches.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait until the worker reaches a terminal state. Returns false on
    /// timeout.
    pub async fn await_stopped(&self, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        tokio::time::timeout(timeout, state.wait_for(|s| s.is_terminal()))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Wait for the worker to exit and take its result.
    pub async fn join(self) -> Result<()> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::task(self.name, format!("worker panicked: {}", e))),
        }
    }
}

async fn run_worker(
    runtime: TaskRuntime,
    state_tx: watch::Sender<RunState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let TaskRuntime {
        name,
        mut task,
        queue,
        config,
        offsets,
        poll_interval,
        shutdown_timeout,
    } = runtime;

    let _ = state_tx.send(RunState::Starting);
    if let Err(e) = task.start(&config, offsets).await {
        warn!("Task '{}' failed to start: {}", name, e);
        let _ = state_tx.send(RunState::Failed);
        queue.close();
        return Err(EngineError::task_with_source(&name, e));
    }

    let _ = state_tx.send(RunState::Running);
    info!("Task '{}' running", name);

    let result = poll_loop(&name, task.as_mut(), &queue, poll_interval, &mut shutdown_rx).await;

    let _ = state_tx.send(RunState::Stopping);
    debug!("Task '{}' stopping", name);

    // stop the task and, on a clean exit, drain any final records — both
    // bounded by the shutdown deadline
    let clean = result.is_ok();
    let final_drain = async {
        if let Err(e) = task.stop().await {
            warn!("Task '{}' stop returned error: {}", name, e);
        }
        if clean {
            if let Ok(records) = task.poll().await {
                for record in records {
                    if queue.put(record).await.is_err() {
                        break;
                    }
                }
            }
        }
    };
    if tokio::time::timeout(shutdown_timeout, final_drain).await.is_err() {
        warn!("Task '{}' ignored the shutdown deadline of {:?}", name, shutdown_timeout);
    }

    queue.close();
    match result {
        Ok(()) => {
            let _ = state_tx.send(RunState::Stopped);
            info!("Task '{}' stopped", name);
            Ok(())
        }
        Err(e) => {
            let _ = state_tx.send(RunState::Failed);
            warn!("Task '{}' failed: {}", name, e);
            Err(EngineError::task_with_source(&name, e))
        }
    }
}

async fn poll_loop(
    name: &str,
    task: &mut dyn SourceTask,
    queue: &RecordQueue<SourceRecord>,
    poll_interval: Duration,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            polled = task.poll() => {
                let records = match polled {
                    Ok(records) => records,
                    Err(e) => return Err(e),
                };

                if records.is_empty() {
                    // idle; back off without missing the stop signal
                    tokio::select! {
                        _ = shutdown_rx.recv() => return Ok(()),
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                    continue;
                }

                debug!("Task '{}' polled {} record(s)", name, records.len());
                for record in records {
                    // backpressure must not deafen the worker to a stop
                    // request; an un-enqueued record is simply re-emitted
                    // after restart
                    tokio::select! {
                        _ = shutdown_rx.recv() => return Ok(()),
                        enqueued = queue.put(record.clone()) => {
                            if enqueued.is_err() {
                                // queue closed under us: the engine is tearing down
                                return Ok(());
                            }
                        }
                    }
                    if let Err(e) = task.commit_record(&record).await {
                        warn!("Task '{}' commit_record failed: {}", name, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::OffsetReader;
    use async_trait::async_trait;
    use oxflow_core::{Offset, Partition, SourcePosition};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullOffsets;

    #[async_trait]
    impl OffsetReader for NullOffsets {
        async fn offsets_for(&self, _: &[Partition]) -> Result<HashMap<Partition, Offset>> {
            Ok(HashMap::new())
        }
    }

    /// Emits `total` records one per poll, then idles.
    struct ScriptedTask {
        emitted: usize,
        total: usize,
        committed: Arc<AtomicUsize>,
        fail_start: bool,
    }

    impl ScriptedTask {
        fn emitting(total: usize) -> (Self, Arc<AtomicUsize>) {
            let committed = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    emitted: 0,
                    total,
                    committed: Arc::clone(&committed),
                    fail_start: false,
                },
                committed,
            )
        }
    }

    #[async_trait]
    impl SourceTask for ScriptedTask {
        async fn start(&mut self, _: &ConnectorConfig, _: Arc<dyn OffsetReader>) -> Result<()> {
            if self.fail_start {
                return Err(EngineError::config("bad url"));
            }
            Ok(())
        }

        async fn poll(&mut self) -> Result<Vec<SourceRecord>> {
            if self.emitted >= self.total {
                return Ok(Vec::new());
            }
            self.emitted += 1;
            let position = SourcePosition::default()
                .with_partition("server", "A")
                .with_offset("pos", self.emitted as u64);
            Ok(vec![SourceRecord::new(
                "t",
                position,
                serde_json::json!({"n": self.emitted}),
                0,
            )])
        }

        async fn commit_record(&mut self, _: &SourceRecord) -> Result<()> {
            self.committed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn runtime(task: Box<dyn SourceTask>, queue: RecordQueue<SourceRecord>) -> TaskRuntime {
        TaskRuntime::new(
            "t0",
            task,
            queue,
            ConnectorConfig::new(),
            Arc::new(NullOffsets),
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_lifecycle_clean_stop() {
        let queue = RecordQueue::new(16);
        let (task, committed) = ScriptedTask::emitting(3);
        let handle = runtime(Box::new(task), queue.clone()).spawn();

        // all three records arrive, with commit_record called per record
        for i in 1..=3u64 {
            let record = queue.take(Duration::from_secs(1)).await.expect("record");
            assert_eq!(record.position.offset.get("pos"), Some(&serde_json::json!(i)));
        }

        handle.stop();
        handle.stop(); // idempotent
        assert!(handle.await_stopped(Duration::from_secs(1)).await);
        assert_eq!(handle.state(), RunState::Stopped);
        assert_eq!(committed.load(Ordering::SeqCst), 3);
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_start_reaches_failed() {
        let queue = RecordQueue::new(16);
        let (mut task, _) = ScriptedTask::emitting(0);
        task.fail_start = true;
        let handle = runtime(Box::new(task), queue.clone()).spawn();

        assert!(handle.await_stopped(Duration::from_secs(1)).await);
        assert_eq!(handle.state(), RunState::Failed);
        assert!(queue.is_closed());

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, EngineError::Task { .. }));
        // the original cause is preserved in the chain
        let source = std::error::Error::source(&err).expect("cause");
        assert!(source.to_string().contains("bad url"));
    }

    #[tokio::test]
    async fn test_backpressure_stalls_producer() {
        let queue = RecordQueue::new(2);
        let (task, _) = ScriptedTask::emitting(10);
        let handle = runtime(Box::new(task), queue.clone()).spawn();

        // with no consumer the worker can enqueue at most capacity + the one
        // record held in poll
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(queue.len() <= 2);
        assert_eq!(handle.state(), RunState::Running);

        // draining lets it make progress again
        let first = queue.take(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.position.offset.get("pos"), Some(&serde_json::json!(1)));

        handle.stop();
        assert!(handle.await_stopped(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_await_stopped_times_out_while_running() {
        let queue = RecordQueue::new(16);
        let (task, _) = ScriptedTask::emitting(0);
        let handle = runtime(Box::new(task), queue.clone()).spawn();

        assert!(!handle.await_stopped(Duration::from_millis(50)).await);
        handle.stop();
        assert!(handle.await_stopped(Duration::from_secs(1)).await);
    }
}
