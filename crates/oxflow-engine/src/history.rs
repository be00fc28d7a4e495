//! Append-only DDL history, recoverable in write order.
//!
//! Every accepted DDL apply appends one [`DdlHistoryRecord`]; replaying the
//! records from an empty catalog reproduces the table definitions exactly as
//! they stood at any recorded position. The file store keeps one JSON record
//! per line and fsyncs each append — losing a history record would make
//! historical binlog events undecodable, so a failed append is immediately
//! fatal to the engine.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use oxflow_core::{DdlChanges, DdlParser, SourcePosition, TableDef, Tables};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One recorded schema change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlHistoryRecord {
    /// Where in the replication log the DDL was observed
    pub position: SourcePosition,
    /// The default database the statements were applied under
    pub database_name: String,
    /// The DDL text, verbatim — recorded even when it failed to parse
    pub ddl: String,
    /// Catalog snapshot after the apply; for inspection and tooling, never
    /// trusted for recovery (recovery always replays the DDL)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<TableDef>,
}

/// Connector-supplied "at or before" comparator between positions.
///
/// `cmp(a, b)` returns true when `a` is at or before `b`. The engine never
/// interprets offsets itself.
pub type PositionComparator = Arc<dyn Fn(&SourcePosition, &SourcePosition) -> bool + Send + Sync>;

/// A comparator ordering offsets by the given fields, most significant first.
/// Numbers compare numerically, everything else by its JSON string form.
/// A missing field sorts before a present one.
pub fn comparing_offset_fields(fields: &[&str]) -> PositionComparator {
    let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
    Arc::new(move |a: &SourcePosition, b: &SourcePosition| {
        for field in &fields {
            let left = a.offset.get(field);
            let right = b.offset.get(field);
            let ord = match (left, right) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(l), Some(r)) => match (l.as_f64(), r.as_f64()) {
                    (Some(lf), Some(rf)) => lf.partial_cmp(&rf).unwrap_or(std::cmp::Ordering::Equal),
                    _ => l.to_string().cmp(&r.to_string()),
                },
            };
            if ord != std::cmp::Ordering::Equal {
                return ord == std::cmp::Ordering::Less;
            }
        }
        true
    })
}

/// DDL history backend.
#[async_trait]
pub trait DdlHistory: Send + Sync {
    /// Acquire backing resources.
    async fn start(&self) -> Result<()>;

    /// Release backing resources.
    async fn stop(&self) -> Result<()>;

    /// Append one record atomically. Failure is fatal to the engine.
    async fn record(&self, record: DdlHistoryRecord) -> Result<()>;

    /// Replay, in append order, every record whose position the comparator
    /// puts at-or-before `stop`, feeding each record's DDL to the parser with
    /// its default database so `tables` is rebuilt. Stops at the first record
    /// past `stop`.
    async fn recover(
        &self,
        stop: &SourcePosition,
        comparator: &PositionComparator,
        tables: &mut Tables,
        parser: &mut dyn DdlParser,
    ) -> Result<()>;
}

/// Replay one recovered record through the parser. Records that fail to
/// parse were logged-and-recorded on the original pass, so they are logged
/// and skipped here too.
fn replay_record(record: &DdlHistoryRecord, tables: &mut Tables, parser: &mut dyn DdlParser) {
    let mut changes = DdlChanges::new();
    parser.set_default_database(&record.database_name);
    if let Err(e) = parser.parse(&record.ddl, tables, &mut changes) {
        warn!("Skipping unparseable DDL during history recovery: {}", e);
    }
}

/// File-backed DDL history: one JSON record per line.
pub struct FileDdlHistory {
    path: PathBuf,
    // serializes record() against recover()
    io: Mutex<()>,
}

impl FileDdlHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io: Mutex::new(()),
        }
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_records(&self) -> Result<Vec<DdlHistoryRecord>> {
        let data = match fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EngineError::history(format!("read {}: {}", self.path.display(), e)))
            }
        };

        let mut records = Vec::new();
        for (line_no, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: DdlHistoryRecord = serde_json::from_str(line).map_err(|e| {
                EngineError::history(format!(
                    "corrupt record at {}:{}: {}",
                    self.path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl DdlHistory for FileDdlHistory {
    async fn start(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| EngineError::history(format!("create {}: {}", parent.display(), e)))?;
            }
        }
        info!("DDL history at {}", self.path.display());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn record(&self, record: DdlHistoryRecord) -> Result<()> {
        let _guard = self.io.lock().await;

        let mut line = serde_json::to_vec(&record)
            .map_err(|e| EngineError::history(format!("encode record: {}", e)))?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await
            .map_err(|e| EngineError::history(format!("open {}: {}", self.path.display(), e)))?;

        file.write_all(&line)
            .await
            .map_err(|e| EngineError::history(format!("append: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| EngineError::history(format!("fsync: {}", e)))?;

        debug!("Recorded DDL history entry for db '{}'", record.database_name);
        Ok(())
    }

    async fn recover(
        &self,
        stop: &SourcePosition,
        comparator: &PositionComparator,
        tables: &mut Tables,
        parser: &mut dyn DdlParser,
    ) -> Result<()> {
        let _guard = self.io.lock().await;
        let records = self.read_records().await?;

        let mut replayed = 0usize;
        for record in &records {
            if !comparator(&record.position, stop) {
                break;
            }
            replay_record(record, tables, parser);
            replayed += 1;
        }

        info!(
            "Recovered {} of {} DDL history record(s) from {}",
            replayed,
            records.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// In-memory DDL history for tests.
#[derive(Default)]
pub struct MemoryDdlHistory {
    records: Mutex<Vec<DdlHistoryRecord>>,
}

impl MemoryDdlHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// All appended records, in write order.
    pub async fn records(&self) -> Vec<DdlHistoryRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl DdlHistory for MemoryDdlHistory {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn record(&self, record: DdlHistoryRecord) -> Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn recover(
        &self,
        stop: &SourcePosition,
        comparator: &PositionComparator,
        tables: &mut Tables,
        parser: &mut dyn DdlParser,
    ) -> Result<()> {
        let records = self.records.lock().await;
        for record in records.iter() {
            if !comparator(&record.position, stop) {
                break;
            }
            replay_record(record, tables, parser);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxflow_core::{MySqlDdlParser, TableId};
    use serde_json::json;
    use tempfile::tempdir;

    fn position(pos: u64) -> SourcePosition {
        SourcePosition::default()
            .with_partition("server", "db1")
            .with_offset("pos", pos)
    }

    fn record(pos: u64, ddl: &str) -> DdlHistoryRecord {
        DdlHistoryRecord {
            position: position(pos),
            database_name: "shop".to_string(),
            ddl: ddl.to_string(),
            tables: Vec::new(),
        }
    }

    #[test]
    fn test_offset_field_comparator() {
        let cmp = comparing_offset_fields(&["file", "pos"]);

        let a = SourcePosition::default()
            .with_offset("file", "binlog.000001")
            .with_offset("pos", 100);
        let b = SourcePosition::default()
            .with_offset("file", "binlog.000002")
            .with_offset("pos", 5);

        assert!(cmp(&a, &b)); // earlier file wins regardless of pos
        assert!(!cmp(&b, &a));
        assert!(cmp(&a, &a)); // at-or-before includes equality
    }

    #[tokio::test]
    async fn test_record_and_recover_in_order() {
        let dir = tempdir().unwrap();
        let history = FileDdlHistory::new(dir.path().join("history.jsonl"));
        history.start().await.unwrap();

        history.record(record(1, "CREATE TABLE t (id INT PRIMARY KEY, v VARCHAR(32))")).await.unwrap();
        history.record(record(2, "ALTER TABLE t ADD c INT")).await.unwrap();
        history.record(record(3, "DROP TABLE t")).await.unwrap();

        let cmp = comparing_offset_fields(&["pos"]);
        let mut parser = MySqlDdlParser::new();

        // recover through position 2: table present with 3 columns
        let mut tables = Tables::new();
        history.recover(&position(2), &cmp, &mut tables, &mut parser).await.unwrap();
        let def = tables.get(&TableId::of("shop", "t")).unwrap();
        assert_eq!(def.columns.len(), 3);
        assert_eq!(def.primary_key, vec!["id".to_string()]);

        // recover through position 3: table dropped
        let mut tables = Tables::new();
        history.recover(&position(3), &cmp, &mut tables, &mut parser).await.unwrap();
        assert!(tables.get(&TableId::of("shop", "t")).is_none());
    }

    #[tokio::test]
    async fn test_recover_survives_unparseable_records() {
        let history = MemoryDdlHistory::new();
        history.record(record(1, "CREATE TABLE t (id INT)")).await.unwrap();
        history.record(record(2, "ALTER TABLE missing ADD c INT")).await.unwrap();
        history.record(record(3, "ALTER TABLE t ADD c INT")).await.unwrap();

        let cmp = comparing_offset_fields(&["pos"]);
        let mut parser = MySqlDdlParser::new();
        let mut tables = Tables::new();
        history.recover(&position(10), &cmp, &mut tables, &mut parser).await.unwrap();

        // the bad record is skipped, later ones still apply
        let def = tables.get(&TableId::of("shop", "t")).unwrap();
        assert_eq!(def.columns.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_recovers_empty() {
        let dir = tempdir().unwrap();
        let history = FileDdlHistory::new(dir.path().join("none.jsonl"));

        let cmp = comparing_offset_fields(&["pos"]);
        let mut parser = MySqlDdlParser::new();
        let mut tables = Tables::new();
        history.recover(&position(1), &cmp, &mut tables, &mut parser).await.unwrap();
        assert!(tables.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_line_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        tokio::fs::write(&path, "not json\n").await.unwrap();

        let history = FileDdlHistory::new(&path);
        let cmp = comparing_offset_fields(&["pos"]);
        let mut parser = MySqlDdlParser::new();
        let mut tables = Tables::new();
        let err = history
            .recover(&position(1), &cmp, &mut tables, &mut parser)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::HistoryWrite(_)));
    }

    #[tokio::test]
    async fn test_snapshot_field_roundtrips() {
        let dir = tempdir().unwrap();
        let history = FileDdlHistory::new(dir.path().join("history.jsonl"));

        let mut rec = record(1, "CREATE TABLE t (id INT)");
        rec.tables = vec![TableDef::new(TableId::of("shop", "t"))];
        history.record(rec).await.unwrap();

        let records = history.read_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tables.len(), 1);
        assert_eq!(json!(records[0].database_name), json!("shop"));
    }
}
