//! # oxflow-engine — embedded CDC engine runtime
//!
//! An in-process host that drives one source connector through its
//! lifecycle, pumps its records through a bounded queue, durably checkpoints
//! consumer offsets, and tracks schema over time by replaying a recoverable
//! DDL history.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   poll()    ┌──────────────┐   take()   ┌─────────────┐
//! │  SourceTask   │ ──────────► │ RecordQueue  │ ─────────► │  Engine     │
//! │ (task worker) │  put() ──►  │ (bounded)    │            │ consumer    │
//! └──────┬────────┘             └──────────────┘            └──────┬──────┘
//!        │ applyDdl                                 notify, stage, │
//!        ▼                                                  flush  ▼
//! ┌───────────────┐  record/recover  ┌────────────┐        ┌─────────────┐
//! │ SchemaRegistry│ ───────────────► │ DdlHistory │        │ OffsetStore │
//! └───────────────┘                  └────────────┘        └─────────────┘
//! ```
//!
//! At-least-once delivery: a record's offsets are staged only after the
//! record-notification handler returns, and staged offsets become durable as
//! an atomic group on flush. After a crash, the connector resumes from the
//! last committed offsets and may re-emit records past them — downstream
//! consumers must tolerate duplicates, never gaps.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use oxflow_engine::{ConnectorRegistry, Engine};
//! use std::sync::Arc;
//!
//! let mut connectors = ConnectorRegistry::new();
//! connectors.register_fn("mysql", || Box::new(MySqlConnector::new()));
//!
//! let engine = Engine::builder()
//!     .with_property("name", "inventory")
//!     .with_property("connector.class", "mysql")
//!     .with_property("offset.storage.file.filename", "/var/lib/oxflow/offsets.dat")
//!     .with_connectors(Arc::new(connectors))
//!     .on_record(Box::new(|record| println!("{}", record.topic)))
//!     .build()?;
//!
//! let handle = engine.handle();
//! tokio::spawn(engine.run());
//! // ... later:
//! handle.stop();
//! ```

mod error;

pub mod config;
pub mod connector;
pub mod engine;
pub mod history;
pub mod offsets;
pub mod queue;
pub mod registry;
pub mod task;

pub use config::{EngineConfig, OffsetCommitPolicy};
pub use connector::{
    ConnectorConfig, ConnectorFactory, ConnectorRegistry, OffsetReader, SourceConnector,
    SourceTask, StoreOffsetReader,
};
pub use engine::{CompletionCallback, Engine, EngineBuilder, EngineHandle, RecordHandler};
pub use error::{EngineError, Result};
pub use history::{
    comparing_offset_fields, DdlHistory, DdlHistoryRecord, FileDdlHistory, MemoryDdlHistory,
    PositionComparator,
};
pub use offsets::{FileOffsetStore, FlushOutcome, MemoryOffsetStore, OffsetStore};
pub use queue::RecordQueue;
pub use registry::{DdlErrorPolicy, SchemaRegistry, SchemaRegistryReader, TableSchemas};
pub use task::{RunState, TaskHandle, TaskRuntime};
