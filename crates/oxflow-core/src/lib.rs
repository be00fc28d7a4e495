//! # oxflow-core — data model for the oxflow CDC engine
//!
//! Database-agnostic building blocks shared by the engine runtime and by
//! source connectors:
//!
//! - [`SourceRecord`] / [`SourcePosition`] - change records and replication-log positions
//! - [`TableId`] / [`TableDef`] / [`Tables`] - the table catalog with change tracking
//! - [`TypedSchema`] - serialization-ready schemas derived from table definitions
//! - [`Filters`] - database/table/column include-exclude predicates
//! - [`DdlParser`] / [`MySqlDdlParser`] - DDL ingestion against the catalog
//!
//! The runtime that drives connectors, queues records and checkpoints offsets
//! lives in `oxflow-engine`.

mod error;

pub mod ddl;
pub mod filter;
pub mod record;
pub mod schema;
pub mod table;

pub use ddl::{render_create_table, render_drop_table, DdlChanges, DdlParser, MySqlDdlParser};
pub use error::{CoreError, DdlParseError, Result};
pub use filter::{canonical_db, FilterConfig, Filters};
pub use record::{Offset, Partition, SourcePosition, SourceRecord};
pub use schema::{field_type_for, jdbc_type_for, Field, FieldType, TypedSchema};
pub use table::{ColumnDef, TableDef, TableId, Tables};
