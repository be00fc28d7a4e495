//! Database, table and column include/exclude predicates.
//!
//! Patterns use glob syntax (`*` and `?`), compiled to anchored regexes.
//! Excludes are evaluated before includes; an empty include list means
//! include-everything. Database names are canonicalized through
//! [`canonical_db`] before any comparison, so a missing name and an empty
//! string are the same thing everywhere.

use crate::error::{CoreError, Result};
use crate::table::TableId;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Canonical form of a database name: `None` and `""` collapse to `""`.
pub fn canonical_db(name: Option<&str>) -> &str {
    name.unwrap_or("")
}

/// Filter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Databases to include (glob patterns; empty = all)
    #[serde(default)]
    pub database_include: Vec<String>,
    /// Databases to exclude (evaluated before includes)
    #[serde(default)]
    pub database_exclude: Vec<String>,
    /// Tables to include, matched against `db.table` (empty = all)
    #[serde(default)]
    pub table_include: Vec<String>,
    /// Tables to exclude
    #[serde(default)]
    pub table_exclude: Vec<String>,
    /// Columns to exclude, matched against `db.table.column`
    #[serde(default)]
    pub column_exclude: Vec<String>,
}

/// Compiled filters for runtime evaluation.
#[derive(Debug)]
pub struct Filters {
    database_include: Vec<Regex>,
    database_exclude: Vec<Regex>,
    table_include: Vec<Regex>,
    table_exclude: Vec<Regex>,
    column_exclude: Vec<Regex>,
}

impl Filters {
    /// Compile a filter configuration.
    pub fn new(config: &FilterConfig) -> Result<Self> {
        Ok(Self {
            database_include: compile(&config.database_include)?,
            database_exclude: compile(&config.database_exclude)?,
            table_include: compile(&config.table_include)?,
            table_exclude: compile(&config.table_exclude)?,
            column_exclude: compile(&config.column_exclude)?,
        })
    }

    /// Filters that include everything.
    pub fn include_all() -> Self {
        Self {
            database_include: Vec::new(),
            database_exclude: Vec::new(),
            table_include: Vec::new(),
            table_exclude: Vec::new(),
            column_exclude: Vec::new(),
        }
    }

    /// Whether the named database passes the database predicate.
    pub fn database_allowed(&self, database: &str) -> bool {
        let database = canonical_db(Some(database));
        if self.database_exclude.iter().any(|p| p.is_match(database)) {
            return false;
        }
        self.database_include.is_empty() || self.database_include.iter().any(|p| p.is_match(database))
    }

    /// Whether the table passes both the database and table predicates.
    pub fn table_allowed(&self, id: &TableId) -> bool {
        if !self.database_allowed(&id.catalog) {
            return false;
        }
        let qualified = format!("{}.{}", id.catalog, id.table);
        if self
            .table_exclude
            .iter()
            .any(|p| p.is_match(&qualified) || p.is_match(&id.table))
        {
            return false;
        }
        self.table_include.is_empty()
            || self
                .table_include
                .iter()
                .any(|p| p.is_match(&qualified) || p.is_match(&id.table))
    }

    /// Whether the column survives the column excludes for its table.
    pub fn column_allowed(&self, id: &TableId, column: &str) -> bool {
        let qualified = format!("{}.{}.{}", id.catalog, id.table, column);
        !self
            .column_exclude
            .iter()
            .any(|p| p.is_match(&qualified) || p.is_match(column))
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| glob_to_regex(p)).collect()
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern);
    let regex_pattern = escaped.replace(r"\*", ".*").replace(r"\?", ".");
    Regex::new(&format!("^{}$", regex_pattern))
        .map_err(|e| CoreError::filter(format!("invalid pattern '{}': {}", pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters(config: FilterConfig) -> Filters {
        Filters::new(&config).unwrap()
    }

    #[test]
    fn test_canonical_db() {
        assert_eq!(canonical_db(None), "");
        assert_eq!(canonical_db(Some("")), "");
        assert_eq!(canonical_db(Some("shop")), "shop");
    }

    #[test]
    fn test_default_includes_everything() {
        let f = Filters::include_all();
        assert!(f.database_allowed("anything"));
        assert!(f.table_allowed(&TableId::of("db", "t")));
        assert!(f.column_allowed(&TableId::of("db", "t"), "c"));
    }

    #[test]
    fn test_database_include_exclude() {
        let f = filters(FilterConfig {
            database_include: vec!["shop*".to_string()],
            database_exclude: vec!["shop_test".to_string()],
            ..Default::default()
        });

        assert!(f.database_allowed("shop"));
        assert!(f.database_allowed("shop_eu"));
        assert!(!f.database_allowed("shop_test")); // exclude wins
        assert!(!f.database_allowed("billing"));
    }

    #[test]
    fn test_table_filter_requires_database() {
        let f = filters(FilterConfig {
            database_include: vec!["shop".to_string()],
            ..Default::default()
        });

        assert!(f.table_allowed(&TableId::of("shop", "orders")));
        // table in an excluded database never passes
        assert!(!f.table_allowed(&TableId::of("billing", "orders")));
    }

    #[test]
    fn test_table_patterns() {
        let f = filters(FilterConfig {
            table_include: vec!["shop.*".to_string()],
            table_exclude: vec!["*.audit_*".to_string()],
            ..Default::default()
        });

        assert!(f.table_allowed(&TableId::of("shop", "orders")));
        assert!(!f.table_allowed(&TableId::of("shop", "audit_log")));
    }

    #[test]
    fn test_column_excludes() {
        let f = filters(FilterConfig {
            column_exclude: vec!["shop.users.password".to_string(), "ssn".to_string()],
            ..Default::default()
        });

        let users = TableId::of("shop", "users");
        assert!(!f.column_allowed(&users, "password"));
        assert!(!f.column_allowed(&users, "ssn")); // bare column pattern applies everywhere
        assert!(f.column_allowed(&users, "email"));
        assert!(f.column_allowed(&TableId::of("shop", "orders"), "password"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        // glob compilation escapes regex metacharacters, so patterns that
        // would be invalid regexes still compile
        let f = Filters::new(&FilterConfig {
            table_include: vec!["a(b".to_string()],
            ..Default::default()
        });
        assert!(f.is_ok());
    }
}
