//! DDL parsing against the table catalog.
//!
//! The engine treats the parser as pluggable: anything implementing
//! [`DdlParser`] can maintain the catalog. The bundled [`MySqlDdlParser`]
//! covers the statement subset a binlog stream actually carries for schema
//! tracking (CREATE/ALTER/DROP/RENAME TABLE, DROP DATABASE, USE) and ignores
//! the rest of the DDL surface (indexes, grants, session settings) without
//! error. A recognized statement that is malformed, or that references an
//! unknown table, yields a [`DdlParseError`]; whether that is fatal is the
//! caller's policy, not the parser's.
//!
//! Every statement that touches a database is also recorded into a
//! [`DdlChanges`] accumulator so callers can distribute the DDL text to
//! per-database consumers in statement order.

use crate::error::DdlParseError;
use crate::filter::canonical_db;
use crate::table::{ColumnDef, TableDef, TableId, Tables};
use std::collections::BTreeSet;

/// Accumulates, in statement order, which databases a parsed DDL batch touched.
#[derive(Debug, Default)]
pub struct DdlChanges {
    entries: Vec<(String, String)>,
}

impl DdlChanges {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything recorded so far.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Record that `statement` applies to `database`.
    pub fn record(&mut self, database: impl Into<String>, statement: impl Into<String>) {
        self.entries.push((database.into(), statement.into()));
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The set of databases touched.
    pub fn databases(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|(db, _)| db.as_str()).collect()
    }

    /// True when at least one statement applies to a database other than `database`.
    pub fn applies_to_more_than(&self, database: &str) -> bool {
        let database = canonical_db(Some(database));
        self.entries
            .iter()
            .any(|(db, _)| canonical_db(Some(db.as_str())) != database)
    }

    /// Statements grouped by database, databases in order of first appearance,
    /// statements within a group in original order.
    pub fn grouped_by_database(&self) -> Vec<(String, String)> {
        let mut order: Vec<String> = Vec::new();
        for (db, _) in &self.entries {
            if !order.contains(db) {
                order.push(db.clone());
            }
        }
        order
            .into_iter()
            .map(|db| {
                let joined = self
                    .entries
                    .iter()
                    .filter(|(d, _)| *d == db)
                    .map(|(_, s)| s.as_str())
                    .collect::<Vec<_>>()
                    .join(";\n");
                (db, joined)
            })
            .collect()
    }
}

/// A parser that applies DDL text to a table catalog.
pub trait DdlParser: Send {
    /// Set the database unqualified table names resolve against.
    fn set_default_database(&mut self, database: &str);

    /// The current default database.
    fn default_database(&self) -> &str;

    /// Parse `ddl` (one or more `;`-separated statements) against `tables`,
    /// recording affected databases into `changes`.
    ///
    /// Statements are applied one at a time; on error, earlier statements in
    /// the batch have already taken effect.
    fn parse(
        &mut self,
        ddl: &str,
        tables: &mut Tables,
        changes: &mut DdlChanges,
    ) -> Result<(), DdlParseError>;
}

/// Reference parser for the MySQL-family DDL subset.
#[derive(Debug, Default)]
pub struct MySqlDdlParser {
    default_db: String,
}

impl MySqlDdlParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(&self, parts: &[String]) -> TableId {
        match parts {
            [table] => TableId::of(self.default_db.clone(), table.clone()),
            [db, table] => TableId::of(db.clone(), table.clone()),
            // MySQL has no real catalog.schema.table nesting; treat extra
            // qualifiers as db.table using the last two parts
            parts => {
                let n = parts.len();
                TableId::of(parts[n - 2].clone(), parts[n - 1].clone())
            }
        }
    }

    fn apply_statement(
        &mut self,
        stmt: &str,
        tables: &mut Tables,
        changes: &mut DdlChanges,
    ) -> Result<(), DdlParseError> {
        if let Some(rest) = strip_keywords(stmt, &["USE"]) {
            let (db, _) = read_identifier(rest);
            if db.is_empty() {
                return Err(DdlParseError::new(stmt, "USE without a database name"));
            }
            self.default_db = db;
            return Ok(());
        }

        if let Some(rest) = strip_keywords(stmt, &["CREATE", "DATABASE"])
            .or_else(|| strip_keywords(stmt, &["CREATE", "SCHEMA"]))
        {
            let rest = strip_keywords(rest, &["IF", "NOT", "EXISTS"]).unwrap_or(rest);
            let (db, _) = read_identifier(rest);
            changes.record(db, stmt);
            return Ok(());
        }

        if let Some(rest) = strip_keywords(stmt, &["DROP", "DATABASE"])
            .or_else(|| strip_keywords(stmt, &["DROP", "SCHEMA"]))
        {
            let rest = strip_keywords(rest, &["IF", "EXISTS"]).unwrap_or(rest);
            let (db, _) = read_identifier(rest);
            let dropped: Vec<TableId> = tables
                .table_ids()
                .filter(|id| id.catalog == db)
                .cloned()
                .collect();
            for id in dropped {
                tables.remove(&id);
            }
            changes.record(db, stmt);
            return Ok(());
        }

        if let Some(rest) = strip_keywords(stmt, &["CREATE", "TABLE"]) {
            return self.apply_create_table(stmt, rest, tables, changes);
        }

        if let Some(rest) = strip_keywords(stmt, &["ALTER", "TABLE"]) {
            return self.apply_alter_table(stmt, rest, tables, changes);
        }

        if let Some(rest) = strip_keywords(stmt, &["DROP", "TABLE"]) {
            let rest = strip_keywords(rest, &["IF", "EXISTS"]).unwrap_or(rest);
            for name in split_top_level(rest, ',') {
                let (parts, _) = read_qualified_name(name.trim());
                if parts.is_empty() {
                    return Err(DdlParseError::new(stmt, "DROP TABLE without a table name"));
                }
                let id = self.resolve(&parts);
                tables.remove(&id);
                changes.record(id.catalog, stmt);
            }
            return Ok(());
        }

        if let Some(rest) = strip_keywords(stmt, &["RENAME", "TABLE"]) {
            for clause in split_top_level(rest, ',') {
                let (from_parts, after) = read_qualified_name(clause.trim());
                let after = strip_keywords(after, &["TO"])
                    .ok_or_else(|| DdlParseError::new(stmt, "RENAME TABLE without TO"))?;
                let (to_parts, _) = read_qualified_name(after);
                if from_parts.is_empty() || to_parts.is_empty() {
                    return Err(DdlParseError::new(stmt, "RENAME TABLE with missing name"));
                }
                let from = self.resolve(&from_parts);
                let to = self.resolve(&to_parts);
                if !tables.rename(&from, to.clone()) {
                    return Err(DdlParseError::new(stmt, format!("unknown table '{}'", from)));
                }
                changes.record(from.catalog, stmt);
            }
            return Ok(());
        }

        if let Some(rest) =
            strip_keywords(stmt, &["TRUNCATE", "TABLE"]).or_else(|| strip_keywords(stmt, &["TRUNCATE"]))
        {
            let (parts, _) = read_qualified_name(rest);
            if !parts.is_empty() {
                changes.record(self.resolve(&parts).catalog, stmt);
            }
            return Ok(());
        }

        // everything else (indexes, views, grants, session settings, ...) is
        // schema-neutral for row decoding and passes through silently
        Ok(())
    }

    fn apply_create_table(
        &mut self,
        stmt: &str,
        rest: &str,
        tables: &mut Tables,
        changes: &mut DdlChanges,
    ) -> Result<(), DdlParseError> {
        let (if_not_exists, rest) = match strip_keywords(rest, &["IF", "NOT", "EXISTS"]) {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        let (parts, after_name) = read_qualified_name(rest);
        if parts.is_empty() {
            return Err(DdlParseError::new(stmt, "CREATE TABLE without a table name"));
        }
        let id = self.resolve(&parts);

        if if_not_exists && tables.get(&id).is_some() {
            changes.record(id.catalog, stmt);
            return Ok(());
        }

        if let Some(like_rest) = strip_keywords(after_name, &["LIKE"]) {
            let (src_parts, _) = read_qualified_name(like_rest);
            let src = self.resolve(&src_parts);
            let mut def = tables
                .get(&src)
                .cloned()
                .ok_or_else(|| DdlParseError::new(stmt, format!("unknown table '{}'", src)))?;
            def.id = id.clone();
            tables.overwrite(def);
            changes.record(id.catalog, stmt);
            return Ok(());
        }

        let body = paren_body(after_name)
            .ok_or_else(|| DdlParseError::new(stmt, "CREATE TABLE without a column list"))?;

        let mut def = TableDef::new(id.clone());
        let mut primary_key: Vec<String> = Vec::new();

        for entry in split_top_level(body, ',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if let Some(pk_rest) = strip_keywords(entry, &["PRIMARY", "KEY"]) {
                if let Some(cols) = paren_body(pk_rest) {
                    primary_key = identifier_list(cols);
                }
                continue;
            }
            if is_constraint_entry(entry) {
                continue;
            }
            let (column, is_pk) = parse_column_entry(entry, stmt)?;
            if is_pk {
                primary_key.push(column.name.clone());
            }
            def.add_column(column);
        }

        def.primary_key = primary_key;
        tables.overwrite(def);
        changes.record(id.catalog, stmt);
        Ok(())
    }

    fn apply_alter_table(
        &mut self,
        stmt: &str,
        rest: &str,
        tables: &mut Tables,
        changes: &mut DdlChanges,
    ) -> Result<(), DdlParseError> {
        let (parts, after_name) = read_qualified_name(rest);
        if parts.is_empty() {
            return Err(DdlParseError::new(stmt, "ALTER TABLE without a table name"));
        }
        let id = self.resolve(&parts);
        let mut def = tables
            .get(&id)
            .cloned()
            .ok_or_else(|| DdlParseError::new(stmt, format!("unknown table '{}'", id)))?;
        let mut renamed_to: Option<TableId> = None;

        for action in split_top_level(after_name, ',') {
            let action = action.trim();
            if action.is_empty() {
                continue;
            }

            if let Some(rest) = strip_keywords(action, &["ADD"]) {
                let rest = strip_keywords(rest, &["COLUMN"]).unwrap_or(rest);
                if let Some(pk_rest) = strip_keywords(rest, &["PRIMARY", "KEY"]) {
                    if let Some(cols) = paren_body(pk_rest) {
                        def.primary_key = identifier_list(cols);
                    }
                    continue;
                }
                if is_constraint_entry(rest) {
                    continue;
                }
                let (column, is_pk) = parse_column_entry(rest, stmt)?;
                if is_pk {
                    def.primary_key = vec![column.name.clone()];
                }
                def.add_column(column);
                continue;
            }

            if let Some(rest) = strip_keywords(action, &["DROP"]) {
                if strip_keywords(rest, &["PRIMARY", "KEY"]).is_some() {
                    def.primary_key.clear();
                    continue;
                }
                if is_constraint_entry(rest) {
                    continue;
                }
                let rest = strip_keywords(rest, &["COLUMN"]).unwrap_or(rest);
                let (name, _) = read_identifier(rest);
                if !def.remove_column(&name) {
                    return Err(DdlParseError::new(stmt, format!("unknown column '{}'", name)));
                }
                continue;
            }

            if let Some(rest) = strip_keywords(action, &["MODIFY"]) {
                let rest = strip_keywords(rest, &["COLUMN"]).unwrap_or(rest);
                let (column, is_pk) = parse_column_entry(rest, stmt)?;
                let name = column.name.clone();
                if !def.replace_column(&name, column) {
                    return Err(DdlParseError::new(stmt, format!("unknown column '{}'", name)));
                }
                if is_pk {
                    def.primary_key = vec![name];
                }
                continue;
            }

            if let Some(rest) = strip_keywords(action, &["CHANGE"]) {
                let rest = strip_keywords(rest, &["COLUMN"]).unwrap_or(rest);
                let (old_name, after_old) = read_identifier(rest);
                let (column, is_pk) = parse_column_entry(after_old, stmt)?;
                let new_name = column.name.clone();
                if !def.replace_column(&old_name, column) {
                    return Err(DdlParseError::new(stmt, format!("unknown column '{}'", old_name)));
                }
                if is_pk {
                    def.primary_key = vec![new_name];
                }
                continue;
            }

            if let Some(rest) = strip_keywords(action, &["RENAME"]) {
                let rest = strip_keywords(rest, &["TO"])
                    .or_else(|| strip_keywords(rest, &["AS"]))
                    .unwrap_or(rest);
                let (to_parts, _) = read_qualified_name(rest);
                if !to_parts.is_empty() {
                    renamed_to = Some(self.resolve(&to_parts));
                }
                continue;
            }

            // table options (ENGINE=..., AUTO_INCREMENT=..., COMMENT ...) and
            // index operations do not affect row shape
        }

        tables.overwrite(def);
        if let Some(to) = renamed_to {
            tables.rename(&id, to);
        }
        changes.record(id.catalog, stmt);
        Ok(())
    }
}

impl DdlParser for MySqlDdlParser {
    fn set_default_database(&mut self, database: &str) {
        self.default_db = canonical_db(Some(database)).to_string();
    }

    fn default_database(&self) -> &str {
        &self.default_db
    }

    fn parse(
        &mut self,
        ddl: &str,
        tables: &mut Tables,
        changes: &mut DdlChanges,
    ) -> Result<(), DdlParseError> {
        for stmt in split_statements(ddl) {
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            self.apply_statement(stmt, tables, changes)?;
        }
        Ok(())
    }
}

// ---- text scanning helpers ----

/// Split on `;`, respecting single quotes, double quotes and backticks.
fn split_statements(ddl: &str) -> Vec<String> {
    split_respecting_quotes(ddl, ';', false)
}

/// Split on `sep` at nesting depth zero, respecting parens and quotes.
fn split_top_level(text: &str, sep: char) -> Vec<String> {
    split_respecting_quotes(text, sep, true)
}

fn split_respecting_quotes(text: &str, sep: char, track_parens: bool) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;

    for c in text.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' if track_parens => {
                    depth += 1;
                    current.push(c);
                }
                ')' if track_parens => {
                    depth = depth.saturating_sub(1);
                    current.push(c);
                }
                _ if c == sep && depth == 0 => {
                    out.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

/// Strip a leading keyword sequence (case-insensitive, whitespace-separated).
/// Returns the remainder with leading whitespace trimmed, or `None` if the
/// text does not start with the sequence.
fn strip_keywords<'a>(text: &'a str, words: &[&str]) -> Option<&'a str> {
    let mut rest = text.trim_start();
    for word in words {
        let head = rest.get(..word.len())?;
        if !head.eq_ignore_ascii_case(word) {
            return None;
        }
        let tail = &rest[word.len()..];
        match tail.chars().next() {
            None => rest = tail,
            Some(c) if !c.is_ascii_alphanumeric() && c != '_' => rest = tail.trim_start(),
            Some(_) => return None,
        }
    }
    Some(rest)
}

/// Read one identifier (possibly back-quoted or double-quoted) off the front.
/// Returns the identifier and the remaining text, trimmed.
fn read_identifier(text: &str) -> (String, &str) {
    let text = text.trim_start();
    let mut chars = text.char_indices();

    match chars.next() {
        Some((_, q @ ('`' | '"'))) => {
            for (idx, c) in chars {
                if c == q {
                    return (text[1..idx].to_string(), text[idx + 1..].trim_start());
                }
            }
            (text[1..].to_string(), "")
        }
        Some(_) => {
            let end = text
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '$'))
                .unwrap_or(text.len());
            (text[..end].to_string(), text[end..].trim_start())
        }
        None => (String::new(), ""),
    }
}

/// Read a possibly-qualified name (`a`, `a.b`, `a.b.c`) off the front.
fn read_qualified_name(text: &str) -> (Vec<String>, &str) {
    let mut parts = Vec::new();
    let (first, mut rest) = read_identifier(text);
    if first.is_empty() {
        return (parts, rest);
    }
    parts.push(first);
    while let Some(stripped) = rest.strip_prefix('.') {
        let (next, after) = read_identifier(stripped);
        if next.is_empty() {
            break;
        }
        parts.push(next);
        rest = after;
    }
    (parts, rest)
}

/// The content of a leading parenthesized group, if present.
fn paren_body(text: &str) -> Option<&str> {
    let text = text.trim_start();
    if !text.starts_with('(') {
        return None;
    }
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (idx, c) in text.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&text[1..idx]);
                    }
                }
                _ => {}
            },
        }
    }
    None
}

/// Identifiers from a comma-separated list, quotes stripped.
fn identifier_list(text: &str) -> Vec<String> {
    split_top_level(text, ',')
        .iter()
        .map(|part| read_identifier(part.trim()).0)
        .filter(|name| !name.is_empty())
        .collect()
}

/// Render a table definition back into a CREATE TABLE statement the
/// [`MySqlDdlParser`] can replay. Used for synthetic history records after a
/// snapshot load, where no original DDL text exists.
pub fn render_create_table(def: &TableDef) -> String {
    let mut parts: Vec<String> = def
        .columns
        .iter()
        .map(|c| {
            let mut out = format!("`{}` {}", c.name, c.type_name);
            match (c.length, c.scale) {
                (Some(len), Some(scale)) => out.push_str(&format!("({},{})", len, scale)),
                (Some(len), None) => out.push_str(&format!("({})", len)),
                _ => {}
            }
            if !c.nullable {
                out.push_str(" NOT NULL");
            }
            if c.auto_increment {
                out.push_str(" AUTO_INCREMENT");
            }
            if c.generated {
                // the expression is not part of the definition; a placeholder
                // keeps the flag replayable
                out.push_str(" GENERATED ALWAYS AS (0)");
            }
            out
        })
        .collect();

    if !def.primary_key.is_empty() {
        let cols: Vec<String> = def.primary_key.iter().map(|c| format!("`{}`", c)).collect();
        parts.push(format!("PRIMARY KEY ({})", cols.join(",")));
    }

    format!("CREATE TABLE {} ({})", quoted_table_name(&def.id), parts.join(", "))
}

/// Render a DROP TABLE statement for a table identifier.
pub fn render_drop_table(id: &TableId) -> String {
    format!("DROP TABLE IF EXISTS {}", quoted_table_name(id))
}

fn quoted_table_name(id: &TableId) -> String {
    let mut out = String::new();
    for part in [&id.catalog, &id.schema] {
        if !part.is_empty() {
            out.push_str(&format!("`{}`.", part));
        }
    }
    out.push_str(&format!("`{}`", id.table));
    out
}

/// True for table-constraint entries that carry no column of their own.
fn is_constraint_entry(entry: &str) -> bool {
    ["KEY", "INDEX", "UNIQUE", "CONSTRAINT", "FOREIGN", "FULLTEXT", "SPATIAL", "CHECK"]
        .iter()
        .any(|kw| strip_keywords(entry, &[*kw]).is_some())
}

/// Parse one column definition entry. Returns the column and whether it was
/// declared an inline PRIMARY KEY.
fn parse_column_entry(entry: &str, stmt: &str) -> Result<(ColumnDef, bool), DdlParseError> {
    let (name, rest) = read_identifier(entry);
    if name.is_empty() {
        return Err(DdlParseError::new(stmt, format!("expected a column name in '{}'", entry)));
    }

    let rest = rest.trim_start();
    let type_end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    let type_name = rest[..type_end].to_ascii_uppercase();
    if type_name.is_empty() {
        return Err(DdlParseError::new(stmt, format!("column '{}' has no type", name)));
    }
    let after_type = &rest[type_end..];

    let mut column = ColumnDef::new(name, type_name, 0);

    let attrs = if let Some(args) = paren_body(after_type) {
        let numbers: Vec<u32> = split_top_level(args, ',')
            .iter()
            .filter_map(|a| a.trim().parse().ok())
            .collect();
        if let Some(&len) = numbers.first() {
            column.length = Some(len);
        }
        if let Some(&scale) = numbers.get(1) {
            column.scale = Some(scale);
        }
        // skip past the argument list
        let consumed = after_type.trim_start().find(')').map(|i| i + 1).unwrap_or(0);
        &after_type.trim_start()[consumed..]
    } else {
        after_type
    };

    let upper = attrs.to_ascii_uppercase();
    if upper.contains("NOT NULL") {
        column.nullable = false;
    }
    if upper.contains("AUTO_INCREMENT") {
        column.auto_increment = true;
    }
    if upper.contains("GENERATED ALWAYS") || upper.contains(" AS (") || upper.starts_with("AS (") {
        column.generated = true;
    }
    let is_pk = upper.contains("PRIMARY KEY");
    if is_pk {
        column.nullable = false;
    }

    Ok((column, is_pk))
}
