//! Table identifiers, definitions and the mutable table catalog.
//!
//! [`Tables`] is the authoritative catalog the DDL parser mutates. Every
//! mutation marks the affected [`TableId`] in an internal change set; the
//! schema registry drains that set after each DDL apply to know which typed
//! schemas to rebuild or evict.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Fully-qualified table identifier.
///
/// Any part may be empty; MySQL-family sources use `catalog` for the database
/// name and leave `schema` empty. Equality is structural across the triple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    /// Database / catalog name
    pub catalog: String,
    /// Schema name (empty for MySQL-family sources)
    pub schema: String,
    /// Table name
    pub table: String,
}

impl TableId {
    /// Create an identifier from catalog, schema and table parts.
    pub fn new(catalog: impl Into<String>, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            catalog: catalog.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Create an identifier with only a database and table part.
    pub fn of(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self::new(database, "", table)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in [&self.catalog, &self.schema] {
            if !part.is_empty() {
                write!(f, "{}.", part)?;
            }
        }
        write!(f, "{}", self.table)
    }
}

/// One column of a table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Database-native type name, upper-cased (e.g. "VARCHAR", "BIGINT")
    pub type_name: String,
    /// JDBC-style type code derived from the type name
    pub type_code: i32,
    /// Declared length/precision, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    /// Declared scale, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    /// Column position in write order (1-indexed)
    pub position: u32,
    /// Is nullable
    pub nullable: bool,
    /// Is auto-incremented
    #[serde(default)]
    pub auto_increment: bool,
    /// Is a generated column
    #[serde(default)]
    pub generated: bool,
}

impl ColumnDef {
    /// Create a column definition with defaults (nullable, not generated).
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, position: u32) -> Self {
        let type_name: String = type_name.into();
        let type_code = crate::schema::jdbc_type_for(&type_name);
        Self {
            name: name.into(),
            type_name,
            type_code,
            length: None,
            scale: None,
            position,
            nullable: true,
            auto_increment: false,
            generated: false,
        }
    }

    /// Set length/precision.
    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    /// Set scale.
    pub fn with_scale(mut self, scale: u32) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Set nullable.
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Mark auto-incremented.
    pub fn with_auto_increment(mut self, auto_increment: bool) -> Self {
        self.auto_increment = auto_increment;
        self
    }

    /// Mark generated.
    pub fn with_generated(mut self, generated: bool) -> Self {
        self.generated = generated;
        self
    }
}

/// Structural description of a table at a point in DDL history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Fully-qualified identifier
    pub id: TableId,
    /// Columns in write order
    pub columns: Vec<ColumnDef>,
    /// Primary-key column names, a subset of `columns`
    pub primary_key: Vec<String>,
}

impl TableDef {
    /// Create a definition with no columns.
    pub fn new(id: TableId) -> Self {
        Self {
            id,
            columns: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    /// Replace the column list, renumbering positions in write order.
    pub fn with_columns(mut self, columns: Vec<ColumnDef>) -> Self {
        self.columns = columns;
        self.renumber();
        self
    }

    /// Replace the primary-key column names.
    pub fn with_primary_key(mut self, names: Vec<String>) -> Self {
        self.primary_key = names;
        self
    }

    /// Look up a column by name (case-insensitive, MySQL-style).
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// True when the named column is part of the primary key.
    pub fn is_primary_key(&self, name: &str) -> bool {
        self.primary_key.iter().any(|pk| pk.eq_ignore_ascii_case(name))
    }

    /// Add a column at the end of the write order.
    pub fn add_column(&mut self, mut column: ColumnDef) {
        column.position = self.columns.len() as u32 + 1;
        self.columns.push(column);
    }

    /// Remove a column (and any primary-key reference to it).
    pub fn remove_column(&mut self, name: &str) -> bool {
        let before = self.columns.len();
        self.columns.retain(|c| !c.name.eq_ignore_ascii_case(name));
        if self.columns.len() == before {
            return false;
        }
        self.primary_key.retain(|pk| !pk.eq_ignore_ascii_case(name));
        self.renumber();
        true
    }

    /// Replace a column in place, keeping its position.
    pub fn replace_column(&mut self, name: &str, mut column: ColumnDef) -> bool {
        match self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name)) {
            Some(idx) => {
                column.position = self.columns[idx].position;
                let renamed = !column.name.eq_ignore_ascii_case(name);
                if renamed {
                    let old = self.columns[idx].name.clone();
                    for pk in &mut self.primary_key {
                        if pk.eq_ignore_ascii_case(&old) {
                            *pk = column.name.clone();
                        }
                    }
                }
                self.columns[idx] = column;
                true
            }
            None => false,
        }
    }

    fn renumber(&mut self) {
        for (idx, col) in self.columns.iter_mut().enumerate() {
            col.position = idx as u32 + 1;
        }
    }
}

/// The mutable table catalog, with a change accumulator.
///
/// Not synchronized; the schema registry enforces single-writer access.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    defs: HashMap<TableId, TableDef>,
    changes: HashSet<TableId>,
}

impl Tables {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a table definition, marking it changed.
    pub fn overwrite(&mut self, def: TableDef) {
        self.changes.insert(def.id.clone());
        self.defs.insert(def.id.clone(), def);
    }

    /// Remove a table definition, marking it changed. Returns the old definition.
    pub fn remove(&mut self, id: &TableId) -> Option<TableDef> {
        let removed = self.defs.remove(id);
        if removed.is_some() {
            self.changes.insert(id.clone());
        }
        removed
    }

    /// Rename a table, marking both old and new ids changed.
    pub fn rename(&mut self, from: &TableId, to: TableId) -> bool {
        match self.defs.remove(from) {
            Some(mut def) => {
                self.changes.insert(from.clone());
                self.changes.insert(to.clone());
                def.id = to.clone();
                self.defs.insert(to, def);
                true
            }
            None => false,
        }
    }

    /// Look up a table definition.
    pub fn get(&self, id: &TableId) -> Option<&TableDef> {
        self.defs.get(id)
    }

    /// All known table identifiers.
    pub fn table_ids(&self) -> impl Iterator<Item = &TableId> {
        self.defs.keys()
    }

    /// All current definitions, sorted by identifier for stable snapshots.
    pub fn snapshot(&self) -> Vec<TableDef> {
        let mut defs: Vec<TableDef> = self.defs.values().cloned().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    /// Number of tables in the catalog.
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// True when the catalog holds no tables.
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Take and clear the set of identifiers changed since the last drain.
    pub fn drain_changes(&mut self) -> HashSet<TableId> {
        std::mem::take(&mut self.changes)
    }

    /// A copy of the catalog restricted to identifiers the predicate accepts.
    pub fn subset(&self, mut filter: impl FnMut(&TableId) -> bool) -> Tables {
        Tables {
            defs: self
                .defs
                .iter()
                .filter(|(id, _)| filter(id))
                .map(|(id, def)| (id.clone(), def.clone()))
                .collect(),
            changes: HashSet::new(),
        }
    }
}
