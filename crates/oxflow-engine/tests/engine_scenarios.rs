//! End-to-end engine scenarios: restart/resume semantics, the duplicate
//! window after a crash, DDL history round-trips, queue backpressure and
//! completion notification.

use async_trait::async_trait;
use oxflow_core::{MySqlDdlParser, Offset, Partition, SourcePosition, SourceRecord, TableId};
use oxflow_engine::{
    comparing_offset_fields, config, ConnectorConfig, ConnectorRegistry, DdlHistory, Engine,
    EngineError, FileDdlHistory, FileOffsetStore, OffsetReader, OffsetStore, RecordQueue,
    Result, RunState, SchemaRegistry, SourceConnector, SourceTask,
};
use oxflow_core::Filters;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

fn partition_a() -> Partition {
    let mut p = Partition::new();
    p.insert("server".into(), "A".into());
    p
}

fn offset_at(pos: u64) -> Offset {
    let mut o = Offset::new();
    o.insert("pos".into(), serde_json::json!(pos));
    o
}

/// Emits records with offsets `resume+1 ..= emit_to` on partition
/// `{server: A}`, a batch per poll, then idles. Resumes from the committed
/// offset handed to it at start.
struct MockTask {
    next: u64,
    emit_to: u64,
    batch: u64,
    resume_seen: Arc<Mutex<Option<Option<u64>>>>,
}

#[async_trait]
impl SourceTask for MockTask {
    async fn start(&mut self, _: &ConnectorConfig, offsets: Arc<dyn OffsetReader>) -> Result<()> {
        let committed = offsets.offset_for(&partition_a()).await?;
        let resume = committed
            .as_ref()
            .and_then(|o| o.get("pos"))
            .and_then(|v| v.as_u64());
        *self.resume_seen.lock().unwrap() = Some(resume);
        self.next = resume.unwrap_or(0) + 1;
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<SourceRecord>> {
        if self.next > self.emit_to {
            return Ok(Vec::new());
        }
        let end = (self.next + self.batch - 1).min(self.emit_to);
        let records = (self.next..=end)
            .map(|i| {
                let position = SourcePosition {
                    partition: partition_a(),
                    offset: offset_at(i),
                };
                SourceRecord::new("mock.events", position, serde_json::json!({ "n": i }), 0)
            })
            .collect();
        self.next = end + 1;
        Ok(records)
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MockConnector {
    emit_to: u64,
    resume_seen: Arc<Mutex<Option<Option<u64>>>>,
}

#[async_trait]
impl SourceConnector for MockConnector {
    fn name(&self) -> &str {
        "mock"
    }

    async fn initialize(&mut self, cfg: &ConnectorConfig) -> Result<Vec<ConnectorConfig>> {
        Ok(vec![cfg.clone()])
    }

    fn create_task(&self) -> Box<dyn SourceTask> {
        Box::new(MockTask {
            next: 1,
            emit_to: self.emit_to,
            batch: 10,
            resume_seen: Arc::clone(&self.resume_seen),
        })
    }
}

/// A connector whose task cannot start.
struct BrokenConnector;

struct BrokenTask;

#[async_trait]
impl SourceTask for BrokenTask {
    async fn start(&mut self, _: &ConnectorConfig, _: Arc<dyn OffsetReader>) -> Result<()> {
        Err(EngineError::config("bad url"))
    }

    async fn poll(&mut self) -> Result<Vec<SourceRecord>> {
        Ok(Vec::new())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SourceConnector for BrokenConnector {
    fn name(&self) -> &str {
        "broken"
    }

    async fn initialize(&mut self, cfg: &ConnectorConfig) -> Result<Vec<ConnectorConfig>> {
        Ok(vec![cfg.clone()])
    }

    fn create_task(&self) -> Box<dyn SourceTask> {
        Box::new(BrokenTask)
    }
}

fn properties(offset_path: &Path) -> HashMap<String, String> {
    HashMap::from([
        (config::NAME.to_string(), "scenario".to_string()),
        (config::CONNECTOR_CLASS.to_string(), "mock".to_string()),
        (
            config::OFFSET_STORAGE_PATH.to_string(),
            offset_path.to_string_lossy().into_owned(),
        ),
        (config::OFFSET_FLUSH_INTERVAL_MS.to_string(), "0".to_string()),
        (config::POLL_INTERVAL_MS.to_string(), "10".to_string()),
    ])
}

struct MockFleet {
    registry: Arc<ConnectorRegistry>,
    resume_seen: Arc<Mutex<Option<Option<u64>>>>,
}

fn mock_fleet(emit_to: u64) -> MockFleet {
    let resume_seen: Arc<Mutex<Option<Option<u64>>>> = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&resume_seen);
    let mut registry = ConnectorRegistry::new();
    registry.register_fn("mock", move || {
        Box::new(MockConnector {
            emit_to,
            resume_seen: Arc::clone(&seen),
        })
    });
    MockFleet {
        registry: Arc::new(registry),
        resume_seen,
    }
}

async fn wait_for(count: &Arc<AtomicUsize>, expected: usize) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while count.load(Ordering::SeqCst) < expected && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(count.load(Ordering::SeqCst), expected);
}

#[tokio::test]
async fn clean_restart_resumes_from_committed_offset() {
    let dir = tempdir().unwrap();
    let offset_path = dir.path().join("offsets.dat");

    // first run: emit 100 records and commit their offsets
    let fleet = mock_fleet(100);
    let dispatched = Arc::new(AtomicUsize::new(0));
    let dispatched_in = Arc::clone(&dispatched);

    let engine = Engine::builder()
        .with_properties(properties(&offset_path))
        .with_connectors(Arc::clone(&fleet.registry))
        .on_record(Box::new(move |_| {
            dispatched_in.fetch_add(1, Ordering::SeqCst);
        }))
        .build()
        .unwrap();
    let handle = engine.handle();
    let run = tokio::spawn(engine.run());

    wait_for(&dispatched, 100).await;
    handle.stop();
    assert!(handle.await_completion(Duration::from_secs(5)).await);
    run.await.unwrap().unwrap();
    assert_eq!(*fleet.resume_seen.lock().unwrap(), Some(None));

    // the committed snapshot is exactly {server:A} -> pos 100
    let store = FileOffsetStore::new(&offset_path);
    let committed = store.load().await.unwrap();
    assert_eq!(committed.get(&partition_a()), Some(&offset_at(100)));

    // second run over the same store: the task resumes at 100 and no record
    // with offset <= 100 re-enters the notification callback
    let fleet2 = mock_fleet(100);
    let replayed = Arc::new(AtomicUsize::new(0));
    let replayed_in = Arc::clone(&replayed);

    let engine = Engine::builder()
        .with_properties(properties(&offset_path))
        .with_connectors(Arc::clone(&fleet2.registry))
        .on_record(Box::new(move |_| {
            replayed_in.fetch_add(1, Ordering::SeqCst);
        }))
        .build()
        .unwrap();
    let handle = engine.handle();
    let run = tokio::spawn(engine.run());

    // give the poll loop time to mis-emit if it were going to
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*fleet2.resume_seen.lock().unwrap(), Some(Some(100)));
    assert_eq!(replayed.load(Ordering::SeqCst), 0);

    handle.stop();
    assert!(handle.await_completion(Duration::from_secs(5)).await);
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn crash_before_flush_replays_the_uncommitted_window() {
    let dir = tempdir().unwrap();
    let offset_path = dir.path().join("offsets.dat");

    // flush at 10, stage 11..20, then "crash" without flushing
    {
        let store = FileOffsetStore::new(&offset_path);
        for i in 1..=10u64 {
            store.stage(partition_a(), offset_at(i));
        }
        assert!(store.flush(Duration::from_secs(5)).await.is_committed());
        for i in 11..=20u64 {
            store.stage(partition_a(), offset_at(i));
        }
        // dropped with staged entries unflushed
    }

    // a fresh process sees offset 10
    let store = FileOffsetStore::new(&offset_path);
    assert_eq!(store.load().await.unwrap().get(&partition_a()), Some(&offset_at(10)));

    // the restarted engine resumes at 10; records 11..20 are re-emitted —
    // duplicates are the contract, gaps are not
    let fleet = mock_fleet(20);
    let replayed: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let replayed_in = Arc::clone(&replayed);
    let count = Arc::new(AtomicUsize::new(0));
    let count_in = Arc::clone(&count);

    let engine = Engine::builder()
        .with_properties(properties(&offset_path))
        .with_connectors(Arc::clone(&fleet.registry))
        .on_record(Box::new(move |r| {
            let n = r.position.offset.get("pos").and_then(|v| v.as_u64()).unwrap();
            replayed_in.lock().unwrap().push(n);
            count_in.fetch_add(1, Ordering::SeqCst);
        }))
        .build()
        .unwrap();
    let handle = engine.handle();
    let run = tokio::spawn(engine.run());

    wait_for(&count, 10).await;
    handle.stop();
    assert!(handle.await_completion(Duration::from_secs(5)).await);
    run.await.unwrap().unwrap();

    assert_eq!(*fleet.resume_seen.lock().unwrap(), Some(Some(10)));
    assert_eq!(*replayed.lock().unwrap(), (11..=20).collect::<Vec<u64>>());
}

#[tokio::test]
async fn ddl_history_round_trip_across_restarts() {
    let dir = tempdir().unwrap();
    let history_path = dir.path().join("history.jsonl");

    let position = |pos: u64| SourcePosition {
        partition: partition_a(),
        offset: offset_at(pos),
    };

    let make_registry = || {
        SchemaRegistry::new(
            "server1",
            Filters::include_all(),
            Box::new(MySqlDdlParser::new()),
            Arc::new(FileDdlHistory::new(&history_path)) as Arc<dyn DdlHistory>,
            comparing_offset_fields(&["pos"]),
        )
    };

    let mut registry = make_registry();
    registry.start().await.unwrap();
    registry
        .apply_ddl(&position(1), Some("db"), "CREATE TABLE t (id INT PRIMARY KEY, v VARCHAR(32))", None)
        .await
        .unwrap();
    registry
        .apply_ddl(&position(2), Some("db"), "ALTER TABLE t ADD c INT", None)
        .await
        .unwrap();
    registry
        .apply_ddl(&position(3), Some("db"), "DROP TABLE t", None)
        .await
        .unwrap();
    registry.stop().await.unwrap();

    let id = TableId::of("db", "t");

    // recover up to P2: table present, 3 columns, PK [id]
    let mut restarted = make_registry();
    restarted.load_history(&position(2)).await.unwrap();
    let def = restarted.table_for(&id).expect("table at P2");
    assert_eq!(def.columns.len(), 3);
    assert_eq!(def.primary_key, vec!["id".to_string()]);
    let schema = restarted.schema_for(&id).expect("schema at P2");
    assert_eq!(schema.name, "server1.db.t");

    // recover up to P3: table absent
    let mut restarted = make_registry();
    restarted.load_history(&position(3)).await.unwrap();
    assert!(restarted.table_for(&id).is_none());
    assert!(restarted.schema_for(&id).is_none());
}

#[tokio::test]
async fn ignored_statements_leave_no_trace() {
    let dir = tempdir().unwrap();
    let history_path = dir.path().join("history.jsonl");

    let mut registry = SchemaRegistry::new(
        "server1",
        Filters::include_all(),
        Box::new(MySqlDdlParser::new()),
        Arc::new(FileDdlHistory::new(&history_path)) as Arc<dyn DdlHistory>,
        comparing_offset_fields(&["pos"]),
    );

    let position = SourcePosition {
        partition: partition_a(),
        offset: offset_at(1),
    };
    let changed = registry.apply_ddl(&position, Some("db"), "BEGIN", None).await.unwrap();

    assert!(!changed);
    assert!(registry.reader().table_ids().is_empty());
    // nothing appended: the history file was never created
    assert!(!history_path.exists());
}

#[tokio::test]
async fn queue_backpressure_blocks_the_fifth_put() {
    let queue = RecordQueue::new(4);
    for i in 0..4 {
        queue.put(i).await.unwrap();
    }

    let q = queue.clone();
    let fifth = tokio::spawn(async move { q.put(4).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!fifth.is_finished(), "5th put must block at capacity 4");

    // a single take unblocks exactly one put; order is preserved
    assert_eq!(queue.take(Duration::from_millis(100)).await, Some(0));
    fifth.await.unwrap().unwrap();
    for expected in 1..=4 {
        assert_eq!(queue.take(Duration::from_millis(100)).await, Some(expected));
    }
}

#[tokio::test]
async fn completion_callback_fires_exactly_once_on_startup_failure() {
    let dir = tempdir().unwrap();

    let mut registry = ConnectorRegistry::new();
    registry.register_fn("broken", || Box::new(BrokenConnector));

    let mut props = properties(&dir.path().join("offsets.dat"));
    props.insert(config::CONNECTOR_CLASS.to_string(), "broken".to_string());

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_in = Arc::clone(&fired);
    let message_seen: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let message_in = Arc::clone(&message_seen);

    let engine = Engine::builder()
        .with_properties(props)
        .with_connectors(Arc::new(registry))
        .on_completion(Box::new(move |success, message, error| {
            assert!(!success);
            assert!(error.is_some());
            *message_in.lock().unwrap() = message.to_string();
            fired_in.fetch_add(1, Ordering::SeqCst);
        }))
        .build()
        .unwrap();

    let handle = engine.handle();
    let err = engine.run().await.unwrap_err();

    // the original ConfigError is preserved in the chain
    let mut chain_has_config = err.to_string().contains("bad url");
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        if cause.to_string().contains("bad url") {
            chain_has_config = true;
        }
        source = std::error::Error::source(cause);
    }
    assert!(chain_has_config);

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(message_seen.lock().unwrap().contains("failed"));
    assert_eq!(handle.state(), RunState::Failed);
    assert!(handle.await_completion(Duration::from_secs(1)).await);
}
