//! Row mappings used by sync triggers and row-copy backfills.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Error;
use crate::value::{Cursor, Row, Value};

/// Name under which [`IdentityMapping`] is always registered.
pub const IDENTITY_MAPPING: &str = "identity";

/// Read access to other tables while a mapping runs.
///
/// Inside a data transaction the reads see the transaction's own writes.
pub trait RowLookup {
    /// Fetch a row by primary key.
    fn lookup(&self, table: &str, key: &Cursor) -> Result<Option<Row>, Error>;
}

/// Derives a destination row from a source row.
///
/// Implementations must be deterministic: a data transaction may be retried
/// after a conflict, and the same source row is mapped both by the trigger
/// and by the backfill. `Ok(None)` means the source row has no destination
/// counterpart.
pub trait RowMapping: Send + Sync {
    /// Map one source row.
    fn map(&self, row: &Row, lookup: &dyn RowLookup) -> Result<Option<Row>, Error>;
}

/// Copies the row unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMapping;

impl RowMapping for IdentityMapping {
    fn map(&self, row: &Row, _lookup: &dyn RowLookup) -> Result<Option<Row>, Error> {
        Ok(Some(row.clone()))
    }
}

/// Selects and renames columns, filling absent ones with defaults.
#[derive(Debug, Default, Clone)]
pub struct ColumnMapping {
    columns: Vec<(String, String)>,
    defaults: Vec<(String, Value)>,
}

impl ColumnMapping {
    /// Empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy a column under the same name.
    pub fn keep(self, column: impl Into<String>) -> Self {
        let column = column.into();
        self.rename(column.clone(), column)
    }

    /// Copy a column under a new name.
    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.columns.push((from.into(), to.into()));
        self
    }

    /// Set a destination column that has no source counterpart.
    pub fn with_default(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.defaults.push((column.into(), value.into()));
        self
    }
}

impl RowMapping for ColumnMapping {
    fn map(&self, row: &Row, _lookup: &dyn RowLookup) -> Result<Option<Row>, Error> {
        let mut out = Row::new();
        for (from, to) in &self.columns {
            let value = row
                .get(from)
                .ok_or_else(|| Error::Mapping(format!("source row has no column {}", from)))?;
            out.set(to.clone(), value.clone());
        }
        for (column, value) in &self.defaults {
            if out.get(column).is_none() {
                out.set(column.clone(), value.clone());
            }
        }
        Ok(Some(out))
    }
}

/// Adapts a closure into a [`RowMapping`].
pub struct FnMapping<F>(F);

impl<F> FnMapping<F>
where
    F: Fn(&Row, &dyn RowLookup) -> Result<Option<Row>, Error> + Send + Sync,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> RowMapping for FnMapping<F>
where
    F: Fn(&Row, &dyn RowLookup) -> Result<Option<Row>, Error> + Send + Sync,
{
    fn map(&self, row: &Row, lookup: &dyn RowLookup) -> Result<Option<Row>, Error> {
        (self.0)(row, lookup)
    }
}

/// Process-wide registry of named mappings.
///
/// Trigger definitions are durable but refer to mappings by name, so every
/// process that writes to a synced table must register the same names.
pub struct MappingRegistry {
    mappings: DashMap<String, Arc<dyn RowMapping>>,
}

impl MappingRegistry {
    /// Registry with the identity mapping pre-registered.
    pub fn new() -> Self {
        let registry = Self {
            mappings: DashMap::new(),
        };
        registry.register(IDENTITY_MAPPING, IdentityMapping);
        registry
    }

    /// Register or replace a mapping.
    pub fn register(&self, name: impl Into<String>, mapping: impl RowMapping + 'static) {
        self.mappings.insert(name.into(), Arc::new(mapping));
    }

    /// Register a closure as a mapping.
    pub fn register_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Row, &dyn RowLookup) -> Result<Option<Row>, Error> + Send + Sync + 'static,
    {
        self.register(name, FnMapping::new(f));
    }

    /// Look up a mapping.
    pub fn get(&self, name: &str) -> Option<Arc<dyn RowMapping>> {
        self.mappings.get(name).map(|entry| entry.value().clone())
    }

    /// Look up a mapping, failing when it is not registered.
    pub fn require(&self, name: &str) -> Result<Arc<dyn RowMapping>, Error> {
        self.get(name)
            .ok_or_else(|| Error::MappingNotRegistered(name.to_string()))
    }

    /// Whether a mapping is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.mappings.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mappings.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for MappingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoLookup;

    impl RowLookup for NoLookup {
        fn lookup(&self, _table: &str, _key: &Cursor) -> Result<Option<Row>, Error> {
            Ok(None)
        }
    }

    #[test]
    fn test_column_mapping() {
        let mapping = ColumnMapping::new()
            .keep("id")
            .rename("amount", "amount_cents")
            .with_default("currency", "EUR");
        let row = Row::new().with("id", 1).with("amount", 250).with("note", "x");

        let out = mapping.map(&row, &NoLookup).unwrap().unwrap();
        assert_eq!(out.get("id"), Some(&Value::Int64(1)));
        assert_eq!(out.get("amount_cents"), Some(&Value::Int64(250)));
        assert_eq!(out.get("currency"), Some(&Value::String("EUR".into())));
        assert!(out.get("note").is_none());

        let missing = Row::new().with("id", 1);
        assert!(matches!(
            mapping.map(&missing, &NoLookup),
            Err(Error::Mapping(_))
        ));
    }

    #[test]
    fn test_registry() {
        let registry = MappingRegistry::new();
        assert!(registry.contains(IDENTITY_MAPPING));
        assert!(registry.require("times_ten").is_err());

        registry.register_fn("times_ten", |row, _| {
            let a = row
                .get("a")
                .and_then(Value::as_i64)
                .ok_or_else(|| Error::Mapping("a is not an integer".into()))?;
            Ok(Some(row.clone().with("a", a * 10)))
        });

        let mapping = registry.require("times_ten").unwrap();
        let out = mapping
            .map(&Row::new().with("id", 7).with("a", 2), &NoLookup)
            .unwrap()
            .unwrap();
        assert_eq!(out.get("a"), Some(&Value::Int64(20)));
        assert_eq!(registry.names(), vec!["identity", "times_ten"]);
    }
}
