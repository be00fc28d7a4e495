//! The authoritative table catalog and derived typed schemas.
//!
//! [`SchemaRegistry`] ingests DDL from the replication stream, keeps the
//! [`Tables`] catalog current, derives a [`TypedSchema`] per table with the
//! column filters applied, and persists every accepted DDL apply to the
//! [`DdlHistory`] so a restart can rebuild the catalog by replay.
//!
//! Mutation is single-writer: only the task worker calls the `&mut self`
//! methods. Concurrent readers go through a [`SchemaRegistryReader`], which
//! takes the internal read lock. The catalog lock is never held across an
//! await — parsing and schema derivation happen fully under it, history
//! appends after it is released.

use crate::error::{EngineError, Result};
use crate::history::{DdlHistory, DdlHistoryRecord, PositionComparator};
use oxflow_core::{
    canonical_db, render_create_table, render_drop_table, DdlChanges, DdlParser, Filters,
    SourcePosition, TableDef, TableId, Tables, TypedSchema,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Statements the replication stream interleaves with DDL that never change
/// the schema; they are dropped before parsing with no side effects.
const IGNORED_STATEMENTS: &[&str] = &["BEGIN", "END", "FLUSH PRIVILEGES"];

/// What to do when DDL fails to parse partway through a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DdlErrorPolicy {
    /// Surface a fatal error
    Fail,
    /// Keep whatever the parser applied before failing, log, move on
    #[default]
    Continue,
    /// Roll the catalog back to its pre-batch state, log, move on
    Skip,
}

impl FromStr for DdlErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "continue" => Ok(Self::Continue),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown ddl.on.error value '{}'", other)),
        }
    }
}

/// Per-table derived schemas.
#[derive(Debug, Clone)]
pub struct TableSchemas {
    /// Key schema (primary-key columns); absent for keyless tables
    pub key: Option<TypedSchema>,
    /// Value schema (filtered columns)
    pub value: TypedSchema,
}

#[derive(Default)]
struct Catalog {
    tables: Tables,
    schemas: HashMap<TableId, TableSchemas>,
}

/// Read-only handle onto the registry, safe to hold on other tasks.
#[derive(Clone)]
pub struct SchemaRegistryReader {
    catalog: Arc<RwLock<Catalog>>,
    filters: Arc<Filters>,
}

impl SchemaRegistryReader {
    /// The current definition for a table, if it exists and passes the filters.
    pub fn table_for(&self, id: &TableId) -> Option<TableDef> {
        if !self.filters.table_allowed(id) {
            return None;
        }
        self.catalog.read().tables.get(id).cloned()
    }

    /// The current value schema for a table, if it exists and passes the filters.
    pub fn schema_for(&self, id: &TableId) -> Option<TypedSchema> {
        if !self.filters.table_allowed(id) {
            return None;
        }
        self.catalog.read().schemas.get(id).map(|s| s.value.clone())
    }

    /// The current key schema for a table, if it exists, has a primary key
    /// and passes the filters.
    pub fn key_schema_for(&self, id: &TableId) -> Option<TypedSchema> {
        if !self.filters.table_allowed(id) {
            return None;
        }
        self.catalog.read().schemas.get(id).and_then(|s| s.key.clone())
    }

    /// All table identifiers passing the filters.
    pub fn table_ids(&self) -> Vec<TableId> {
        self.catalog
            .read()
            .tables
            .table_ids()
            .filter(|id| self.filters.table_allowed(id))
            .cloned()
            .collect()
    }
}

/// The schema tracker. See the module docs for the locking discipline.
pub struct SchemaRegistry {
    prefix: String,
    filters: Arc<Filters>,
    parser: Box<dyn DdlParser>,
    history: Arc<dyn DdlHistory>,
    comparator: PositionComparator,
    on_parse_error: DdlErrorPolicy,
    catalog: Arc<RwLock<Catalog>>,
}

impl SchemaRegistry {
    /// Create a registry.
    ///
    /// `prefix` qualifies derived schema names (typically the logical server
    /// name); `comparator` is the connector's "at or before" ordering over
    /// positions, used during history recovery.
    pub fn new(
        prefix: impl Into<String>,
        filters: Filters,
        parser: Box<dyn DdlParser>,
        history: Arc<dyn DdlHistory>,
        comparator: PositionComparator,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            filters: Arc::new(filters),
            parser,
            history,
            comparator,
            on_parse_error: DdlErrorPolicy::default(),
            catalog: Arc::new(RwLock::new(Catalog::default())),
        }
    }

    /// Set the parse-error policy.
    pub fn with_ddl_error_policy(mut self, policy: DdlErrorPolicy) -> Self {
        self.on_parse_error = policy;
        self
    }

    /// Acquire the history's backing resources.
    pub async fn start(&self) -> Result<()> {
        self.history.start().await
    }

    /// Release the history's backing resources.
    pub async fn stop(&self) -> Result<()> {
        self.history.stop().await
    }

    /// A read-only handle for other tasks.
    pub fn reader(&self) -> SchemaRegistryReader {
        SchemaRegistryReader {
            catalog: Arc::clone(&self.catalog),
            filters: Arc::clone(&self.filters),
        }
    }

    /// The filters in effect.
    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    /// The current definition for a table, if it exists and passes the filters.
    pub fn table_for(&self, id: &TableId) -> Option<TableDef> {
        self.reader().table_for(id)
    }

    /// The current value schema for a table, if it exists and passes the filters.
    pub fn schema_for(&self, id: &TableId) -> Option<TypedSchema> {
        self.reader().schema_for(id)
    }

    /// Apply DDL observed at `position` under `database_name` and record it
    /// to the history.
    ///
    /// Returns `false` (with no side effects) for ignored transaction noise,
    /// `true` otherwise — including when parsing failed under the `continue`
    /// or `skip` policies, since the statement was still recorded.
    ///
    /// When a `statement_consumer` is supplied it receives the DDL grouped by
    /// affected database, filtered through the database predicate; if the
    /// parser could not attribute the statements (or they are confined to the
    /// default database), the consumer is invoked once with `database_name`.
    pub async fn apply_ddl(
        &mut self,
        position: &SourcePosition,
        database_name: Option<&str>,
        ddl: &str,
        mut statement_consumer: Option<&mut (dyn FnMut(&str, &str) + Send)>,
    ) -> Result<bool> {
        let trimmed = ddl.trim();
        if IGNORED_STATEMENTS.iter().any(|s| s.eq_ignore_ascii_case(trimmed)) {
            return Ok(false);
        }

        let database = canonical_db(database_name).to_string();
        let mut changes = DdlChanges::new();

        let tables_snapshot = {
            let mut catalog = self.catalog.write();
            let backup = match self.on_parse_error {
                DdlErrorPolicy::Skip => Some(catalog.tables.clone()),
                _ => None,
            };

            self.parser.set_default_database(&database);
            if let Err(e) = self.parser.parse(ddl, &mut catalog.tables, &mut changes) {
                match self.on_parse_error {
                    DdlErrorPolicy::Fail => {
                        error!("Error parsing DDL statement: {}", e);
                        return Err(e.into());
                    }
                    DdlErrorPolicy::Continue => {
                        error!("Error parsing DDL statement, continuing with partial changes: {}", e);
                    }
                    DdlErrorPolicy::Skip => {
                        error!("Error parsing DDL statement, discarding its changes: {}", e);
                        if let Some(backup) = backup {
                            catalog.tables = backup;
                        }
                    }
                }
            }
            catalog.tables.snapshot()
        };

        if let Some(consumer) = statement_consumer.as_mut() {
            if !changes.is_empty() && changes.applies_to_more_than(&database) {
                // statements carried fully-qualified names touching other
                // databases; hand them out per affected database, in order
                for (group_db, statements) in changes.grouped_by_database() {
                    if self.filters.database_allowed(&group_db) {
                        consumer(&group_db, &statements);
                    }
                }
            } else if self.filters.database_allowed(&database) {
                consumer(&database, trimmed);
            }
        }

        // Recorded after the consumer ran, so recovery replay never loses a
        // statement that downstream observers already saw.
        self.history
            .record(DdlHistoryRecord {
                position: position.clone(),
                database_name: database,
                ddl: ddl.to_string(),
                tables: tables_snapshot,
            })
            .await?;

        self.refresh_changed_schemas();
        Ok(true)
    }

    /// Reset the catalog and rebuild it by replaying the history up to
    /// `stop`, then derive all typed schemas.
    pub async fn load_history(&mut self, stop: &SourcePosition) -> Result<()> {
        let mut tables = Tables::new();
        self.history
            .recover(stop, &self.comparator, &mut tables, self.parser.as_mut())
            .await?;
        tables.drain_changes();

        let mut catalog = self.catalog.write();
        catalog.tables = tables;
        catalog.schemas.clear();
        let ids: Vec<TableId> = catalog.tables.table_ids().cloned().collect();
        for id in ids {
            if let Some(def) = catalog.tables.get(&id).cloned() {
                catalog.schemas.insert(id, self.derive_schemas(&def));
            }
        }
        debug!("Loaded {} table definition(s) from history", catalog.tables.len());
        Ok(())
    }

    /// Bootstrap the catalog from a connector-supplied metadata reader (the
    /// stand-in for JDBC metadata during an initial snapshot).
    ///
    /// On reader failure the catalog is rolled back to its pre-call state and
    /// the error propagated. On success, one synthetic DROP+CREATE history
    /// record per changed table is appended at `position`.
    pub async fn load_from_snapshot<F>(&mut self, position: &SourcePosition, reader: F) -> Result<()>
    where
        F: FnOnce(&mut Tables) -> oxflow_core::Result<()>,
    {
        let (ddl, tables_snapshot) = {
            let mut catalog = self.catalog.write();
            catalog.tables.drain_changes();
            let backup = catalog.tables.clone();

            if let Err(e) = reader(&mut catalog.tables) {
                catalog.tables = backup;
                return Err(EngineError::from(e));
            }

            let mut changed: Vec<TableId> = catalog.tables.drain_changes().into_iter().collect();
            changed.sort();

            let mut statements: Vec<String> = Vec::new();
            for id in &changed {
                statements.push(render_drop_table(id));
                match catalog.tables.get(id).cloned() {
                    Some(def) => {
                        statements.push(render_create_table(&def));
                        let schemas = self.derive_schemas(&def);
                        catalog.schemas.insert(id.clone(), schemas);
                    }
                    None => {
                        catalog.schemas.remove(id);
                    }
                }
            }
            (statements.join(";\n"), catalog.tables.snapshot())
        };

        self.history
            .record(DdlHistoryRecord {
                position: position.clone(),
                database_name: String::new(),
                ddl,
                tables: tables_snapshot,
            })
            .await
    }

    /// Drain the catalog's changed-table set and rebuild or evict the
    /// affected schemas.
    fn refresh_changed_schemas(&self) {
        let mut catalog = self.catalog.write();
        let changed = catalog.tables.drain_changes();
        for id in changed {
            match catalog.tables.get(&id).cloned() {
                Some(def) => {
                    let schemas = self.derive_schemas(&def);
                    catalog.schemas.insert(id, schemas);
                }
                None => {
                    catalog.schemas.remove(&id);
                    warn!("Evicted schema for dropped table {}", id);
                }
            }
        }
    }

    fn derive_schemas(&self, def: &TableDef) -> TableSchemas {
        let id = def.id.clone();
        TableSchemas {
            key: TypedSchema::derive_key(&self.prefix, def),
            value: TypedSchema::derive(&self.prefix, def, |col| {
                self.filters.column_allowed(&id, col)
            }),
        }
    }
}
