//! Durable offset storage with atomic group commit.
//!
//! Offsets are staged in memory as the consumer acknowledges records and
//! flushed as a group: either every staged entry becomes durable or none
//! does. The file store writes a fresh snapshot to a temp file, fsyncs and
//! atomically renames it over the previous one, so a crash mid-flush leaves
//! the prior complete snapshot intact.
//!
//! ## File format
//!
//! ```text
//! "OXOF" | u8 version | u32 count | (u32 key_len, key, u32 val_len, val)*
//! ```
//!
//! Keys are the canonical JSON of the partition map (BTreeMap ordering makes
//! this stable), values the JSON of the offset map.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use oxflow_core::{Offset, Partition};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const MAGIC: &[u8; 4] = b"OXOF";
const VERSION: u8 = 1;

/// Result of a flush attempt.
#[derive(Debug)]
pub enum FlushOutcome {
    /// All staged entries are durable; the staged set was cleared
    Committed,
    /// The deadline elapsed; staged entries are kept for the next attempt
    TimedOut,
    /// The write failed; staged entries are kept for the next attempt
    Failed(EngineError),
}

impl FlushOutcome {
    /// True when the flush committed.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Offset persistence backend.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// All committed partition→offset pairs. A missing or empty store yields
    /// the empty mapping; an unreadable one fails with `StoreUnavailable`.
    async fn load(&self) -> Result<HashMap<Partition, Offset>>;

    /// Record a pending write in memory. Last write wins per partition.
    fn stage(&self, partition: Partition, offset: Offset);

    /// Number of partitions with staged, unflushed writes.
    fn staged_count(&self) -> usize;

    /// Write all staged entries atomically within the deadline.
    async fn flush(&self, timeout: Duration) -> FlushOutcome;
}

#[derive(Default)]
struct StoreState {
    committed: HashMap<Partition, Offset>,
    staged: HashMap<Partition, Offset>,
    loaded: bool,
}

/// File-backed offset store.
pub struct FileOffsetStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileOffsetStore {
    /// Create a store backed by the given file. No I/O happens until
    /// [`OffsetStore::load`] or [`OffsetStore::flush`] is called.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(StoreState::default()),
        }
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_snapshot(&self, encoded: Vec<u8>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| EngineError::store(format!("create {}: {}", parent.display(), e)))?;
            }
        }

        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(|e| EngineError::store(format!("open {}: {}", temp_path.display(), e)))?;

        file.write_all(&encoded)
            .await
            .map_err(|e| EngineError::store(format!("write: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| EngineError::store(format!("fsync: {}", e)))?;
        drop(file);

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| EngineError::store(format!("rename: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn load(&self) -> Result<HashMap<Partition, Offset>> {
        {
            let state = self.state.lock();
            if state.loaded {
                return Ok(state.committed.clone());
            }
        }

        let committed = match fs::read(&self.path).await {
            Ok(data) => decode_offsets(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(EngineError::store(format!(
                    "read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        debug!("Loaded {} offset partition(s) from {}", committed.len(), self.path.display());

        let mut state = self.state.lock();
        state.committed = committed.clone();
        state.loaded = true;
        Ok(committed)
    }

    fn stage(&self, partition: Partition, offset: Offset) {
        self.state.lock().staged.insert(partition, offset);
    }

    fn staged_count(&self) -> usize {
        self.state.lock().staged.len()
    }

    async fn flush(&self, timeout: Duration) -> FlushOutcome {
        let (pending, merged) = {
            let state = self.state.lock();
            if state.staged.is_empty() {
                return FlushOutcome::Committed;
            }
            let pending = state.staged.clone();
            let mut merged = state.committed.clone();
            merged.extend(pending.clone());
            (pending, merged)
        };

        let encoded = match encode_offsets(&merged) {
            Ok(encoded) => encoded,
            Err(e) => return FlushOutcome::Failed(e),
        };
        match tokio::time::timeout(timeout, self.write_snapshot(encoded)).await {
            Ok(Ok(())) => {
                let mut state = self.state.lock();
                // drop only the staged entries this flush covered; anything
                // re-staged with a newer offset during the write stays
                for (partition, offset) in &pending {
                    if state.staged.get(partition) == Some(offset) {
                        state.staged.remove(partition);
                    }
                }
                state.committed = merged;
                state.loaded = true;
                debug!("Flushed {} offset partition(s) to {}", pending.len(), self.path.display());
                FlushOutcome::Committed
            }
            Ok(Err(e)) => {
                warn!("Offset flush to {} failed: {}", self.path.display(), e);
                FlushOutcome::Failed(e)
            }
            Err(_) => {
                warn!("Offset flush to {} timed out after {:?}", self.path.display(), timeout);
                FlushOutcome::TimedOut
            }
        }
    }
}

/// In-memory offset store for tests and ephemeral runs.
///
/// Flush failures can be injected to exercise the engine's retry escalation.
#[derive(Default)]
pub struct MemoryOffsetStore {
    state: Mutex<StoreState>,
    fail_flushes: Mutex<u32>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` flush attempts fail.
    pub fn fail_next_flushes(&self, n: u32) {
        *self.fail_flushes.lock() = n;
    }

    /// Seed the committed set, as if a previous process had flushed it.
    pub fn seed(&self, committed: HashMap<Partition, Offset>) {
        let mut state = self.state.lock();
        state.committed = committed;
        state.loaded = true;
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn load(&self) -> Result<HashMap<Partition, Offset>> {
        Ok(self.state.lock().committed.clone())
    }

    fn stage(&self, partition: Partition, offset: Offset) {
        self.state.lock().staged.insert(partition, offset);
    }

    fn staged_count(&self) -> usize {
        self.state.lock().staged.len()
    }

    async fn flush(&self, _timeout: Duration) -> FlushOutcome {
        {
            let mut failures = self.fail_flushes.lock();
            if *failures > 0 {
                *failures -= 1;
                return FlushOutcome::Failed(EngineError::store("injected flush failure"));
            }
        }
        let mut state = self.state.lock();
        let staged = std::mem::take(&mut state.staged);
        state.committed.extend(staged);
        FlushOutcome::Committed
    }
}

fn encode_offsets(map: &HashMap<Partition, Offset>) -> Result<Vec<u8>> {
    let mut entries: Vec<(&Partition, &Offset)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let mut buf = BytesMut::new();
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u32(entries.len() as u32);
    for (partition, offset) in entries {
        // BTreeMap keys make both encodings canonical
        let key = serde_json::to_vec(partition)?;
        let value = serde_json::to_vec(offset)?;
        buf.put_u32(key.len() as u32);
        buf.put_slice(&key);
        buf.put_u32(value.len() as u32);
        buf.put_slice(&value);
    }
    Ok(buf.to_vec())
}

fn decode_offsets(data: &[u8]) -> Result<HashMap<Partition, Offset>> {
    let mut buf = data;
    if buf.remaining() < MAGIC.len() + 1 + 4 {
        return Err(EngineError::store("offset file truncated"));
    }
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if &magic != MAGIC {
        return Err(EngineError::store("offset file has wrong magic"));
    }
    let version = buf.get_u8();
    if version != VERSION {
        return Err(EngineError::store(format!("unsupported offset file version {}", version)));
    }

    let count = buf.get_u32() as usize;
    let mut map = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = read_chunk(&mut buf)?;
        let value = read_chunk(&mut buf)?;
        let partition: Partition = serde_json::from_slice(&key)
            .map_err(|e| EngineError::store(format!("corrupt partition key: {}", e)))?;
        let offset: Offset = serde_json::from_slice(&value)
            .map_err(|e| EngineError::store(format!("corrupt offset value: {}", e)))?;
        map.insert(partition, offset);
    }
    Ok(map)
}

fn read_chunk(buf: &mut &[u8]) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(EngineError::store("offset file truncated"));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(EngineError::store("offset file truncated"));
    }
    let mut chunk = vec![0u8; len];
    buf.copy_to_slice(&mut chunk);
    Ok(chunk)
}
