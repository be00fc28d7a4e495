//! Change records and replication-log positions.
//!
//! A [`SourceRecord`] is the unit that flows from a source task through the
//! engine to the consumer: a topic name, optional key and value payloads with
//! their derived schemas, and the [`SourcePosition`] in the replication log
//! the record was read from.
//!
//! Positions are opaque to the engine. The `partition` identifies an
//! independent cursor (typically one per database server identity) and the
//! `offset` names a point in that cursor's log. Only the connector knows how
//! to compare two offsets; the engine just stores and returns them.

use crate::schema::TypedSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque partition identity: an ordered string map, e.g. `{"server": "db1"}`.
///
/// `BTreeMap` keeps the serialized form canonical, so the encoded partition
/// is usable as a stable lookup key across restarts.
pub type Partition = BTreeMap<String, String>;

/// Opaque offset within a partition, e.g. `{"file": "binlog.0003", "pos": 4711}`.
pub type Offset = BTreeMap<String, serde_json::Value>;

/// A position in the source's replication log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    /// Identifies the independent cursor this offset belongs to
    pub partition: Partition,
    /// The point in the log, meaningful only to the connector
    pub offset: Offset,
}

impl SourcePosition {
    /// Create a position from a partition and offset.
    pub fn new(partition: Partition, offset: Offset) -> Self {
        Self { partition, offset }
    }

    /// Add a partition entry.
    pub fn with_partition(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.partition.insert(key.into(), value.into());
        self
    }

    /// Add an offset entry.
    pub fn with_offset(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.offset.insert(key.into(), value.into());
        self
    }

    /// True when neither partition nor offset carry any entries.
    pub fn is_empty(&self) -> bool {
        self.partition.is_empty() && self.offset.is_empty()
    }
}

/// A row-level change record emitted by a source task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Destination topic name
    pub topic: String,
    /// Record key (usually the primary-key columns), if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<serde_json::Value>,
    /// Schema the key conforms to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_schema: Option<TypedSchema>,
    /// Record value; `None` marks a tombstone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Schema the value conforms to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_schema: Option<TypedSchema>,
    /// Where in the replication log this record was read
    pub position: SourcePosition,
    /// Event timestamp (Unix epoch millis)
    pub timestamp_ms: i64,
}

impl SourceRecord {
    /// Create a record with a value payload.
    pub fn new(
        topic: impl Into<String>,
        position: SourcePosition,
        value: serde_json::Value,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            key_schema: None,
            value: Some(value),
            value_schema: None,
            position,
            timestamp_ms,
        }
    }

    /// Create a tombstone: a value-less record marking logical deletion of a key.
    pub fn tombstone(
        topic: impl Into<String>,
        position: SourcePosition,
        key: serde_json::Value,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            topic: topic.into(),
            key: Some(key),
            key_schema: None,
            value: None,
            value_schema: None,
            position,
            timestamp_ms,
        }
    }

    /// Attach a key payload.
    pub fn with_key(mut self, key: serde_json::Value) -> Self {
        self.key = Some(key);
        self
    }

    /// Attach the key schema.
    pub fn with_key_schema(mut self, schema: TypedSchema) -> Self {
        self.key_schema = Some(schema);
        self
    }

    /// Attach the value schema.
    pub fn with_value_schema(mut self, schema: TypedSchema) -> Self {
        self.value_schema = Some(schema);
        self
    }

    /// True when this record is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}
