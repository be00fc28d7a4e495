//! Typed record schemas derived from table definitions.
//!
//! A [`TypedSchema`] is a serialization-ready view of a [`TableDef`] at the
//! moment it was derived: column filters applied, database types mapped to
//! logical field types. Schemas are never mutated in place; when the table
//! definition changes, the registry derives a fresh one, so records decoded
//! with an old schema keep the shape that was live when they were written.

use crate::table::{ColumnDef, TableDef};
use serde::{Deserialize, Serialize};

/// Logical field types, aligned with what MySQL-family column types map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal,
    String,
    Bytes,
    Date,
    Time,
    Timestamp,
    Json,
}

/// JDBC-style type codes, kept for wire compatibility with downstream
/// consumers that switch on the numeric code.
pub fn jdbc_type_for(type_name: &str) -> i32 {
    match base_type(type_name).as_str() {
        "BIT" => -7,
        "TINYINT" => -6,
        "SMALLINT" | "YEAR" => 5,
        "MEDIUMINT" | "INT" | "INTEGER" => 4,
        "BIGINT" => -5,
        "FLOAT" => 7,
        "DOUBLE" | "REAL" => 8,
        "DECIMAL" | "NUMERIC" => 3,
        "CHAR" => 1,
        "VARCHAR" | "TINYTEXT" | "TEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM" | "SET" => 12,
        "BINARY" => -2,
        "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => -3,
        "DATE" => 91,
        "TIME" => 92,
        "DATETIME" | "TIMESTAMP" => 93,
        "JSON" => 1111,
        "BOOLEAN" | "BOOL" => 16,
        _ => 1111,
    }
}

/// Map a database-native type name onto a logical field type.
pub fn field_type_for(column: &ColumnDef) -> FieldType {
    match base_type(&column.type_name).as_str() {
        "BOOLEAN" | "BOOL" => FieldType::Boolean,
        // TINYINT(1) is the MySQL idiom for boolean
        "TINYINT" if column.length == Some(1) => FieldType::Boolean,
        "TINYINT" => FieldType::Int8,
        "SMALLINT" | "YEAR" => FieldType::Int16,
        "MEDIUMINT" | "INT" | "INTEGER" => FieldType::Int32,
        "BIGINT" => FieldType::Int64,
        "FLOAT" => FieldType::Float32,
        "DOUBLE" | "REAL" => FieldType::Float64,
        "DECIMAL" | "NUMERIC" => FieldType::Decimal,
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" => {
            FieldType::Bytes
        }
        "DATE" => FieldType::Date,
        "TIME" => FieldType::Time,
        "DATETIME" | "TIMESTAMP" => FieldType::Timestamp,
        "JSON" => FieldType::Json,
        _ => FieldType::String,
    }
}

fn base_type(type_name: &str) -> String {
    type_name
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

/// One field of a typed schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Field name (column name)
    pub name: String,
    /// Position within the schema (0-indexed)
    pub index: u32,
    /// Logical type
    pub field_type: FieldType,
    /// Declared scale, carried for decimal fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    /// Whether the field may be absent or null
    pub optional: bool,
}

/// A serialization-ready schema derived from a table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedSchema {
    /// Qualified schema name, e.g. `"server1.inventory.users"`
    pub name: String,
    /// Ordered fields
    pub fields: Vec<Field>,
}

impl TypedSchema {
    /// Derive the value schema for a table, keeping only columns the filter
    /// accepts. Field order follows column write order.
    pub fn derive(prefix: &str, def: &TableDef, mut column_filter: impl FnMut(&str) -> bool) -> Self {
        let fields = def
            .columns
            .iter()
            .filter(|c| column_filter(&c.name))
            .enumerate()
            .map(|(idx, c)| Field {
                name: c.name.clone(),
                index: idx as u32,
                field_type: field_type_for(c),
                scale: c.scale,
                optional: c.nullable,
            })
            .collect();

        Self {
            name: qualified_name(prefix, def),
            fields,
        }
    }

    /// Derive the key schema for a table: primary-key columns only, all
    /// required. Returns `None` for keyless tables.
    pub fn derive_key(prefix: &str, def: &TableDef) -> Option<Self> {
        if def.primary_key.is_empty() {
            return None;
        }
        let fields = def
            .primary_key
            .iter()
            .filter_map(|pk| def.column(pk))
            .enumerate()
            .map(|(idx, c)| Field {
                name: c.name.clone(),
                index: idx as u32,
                field_type: field_type_for(c),
                scale: c.scale,
                optional: false,
            })
            .collect();

        Some(Self {
            name: format!("{}.Key", qualified_name(prefix, def)),
            fields,
        })
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

fn qualified_name(prefix: &str, def: &TableDef) -> String {
    if prefix.is_empty() {
        def.id.to_string()
    } else {
        format!("{}.{}", prefix.trim_end_matches('.'), def.id)
    }
}
