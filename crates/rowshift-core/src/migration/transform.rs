//! Transformation plugins applied to each sub-batch.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Error;
use crate::storage::DataTxn;
use crate::sync::{MappingRegistry, IDENTITY_MAPPING};
use crate::value::{Cursor, KeyRange, Value};

/// Everything a transformation is told about the sub-batch it processes.
#[derive(Debug, Clone, Copy)]
pub struct BatchContext<'a> {
    /// Table walked by the migration.
    pub table: &'a str,
    /// Batching column.
    pub column: &'a str,
    /// Bounds of the enclosing job.
    pub range: &'a KeyRange,
    /// Sub-batch size of the job.
    pub sub_batch_size: u64,
    /// Migration arguments.
    pub arguments: &'a [Value],
    /// Keys of this sub-batch, in order. Rows may have been deleted since
    /// the keys were read.
    pub keys: &'a [Cursor],
}

/// A bulk transformation.
///
/// `transform` runs inside a data transaction that may be retried, and the
/// same range may be processed again after a crash, so implementations must
/// be idempotent.
pub trait Transformation: Send + Sync {
    /// Check arguments when the migration is enqueued.
    fn validate_arguments(&self, arguments: &[Value]) -> Result<(), String> {
        let _ = arguments;
        Ok(())
    }

    /// Check that this process has everything the transformation needs at
    /// run time. Workers skip migrations that fail this check instead of
    /// claiming their jobs.
    fn check_runnable(&self, arguments: &[Value], mappings: &MappingRegistry) -> Result<(), Error> {
        let _ = (arguments, mappings);
        Ok(())
    }

    /// Process one sub-batch and return the number of rows changed.
    fn transform(&self, txn: &DataTxn<'_>, ctx: &BatchContext<'_>) -> Result<u64, Error>;
}

fn string_arg<'a>(arguments: &'a [Value], idx: usize, name: &str) -> Result<&'a str, String> {
    match arguments.get(idx) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(other) => Err(format!("{} must be a non-empty string, got {}", name, other)),
        None => Err(format!("missing argument {} at position {}", name, idx)),
    }
}

fn arity(arguments: &[Value], min: usize, max: usize) -> Result<(), String> {
    if arguments.len() < min || arguments.len() > max {
        return Err(format!(
            "expected {}..={} arguments, got {}",
            min,
            max,
            arguments.len()
        ));
    }
    Ok(())
}

/// Copies rows into another table through a registered mapping.
///
/// Arguments: `[destination, mapping?]`. The mapping defaults to identity.
/// This is the backfill half of a table move; the sync trigger covers rows
/// written while it runs.
#[derive(Debug, Default)]
pub struct CopyRows;

impl Transformation for CopyRows {
    fn validate_arguments(&self, arguments: &[Value]) -> Result<(), String> {
        arity(arguments, 1, 2)?;
        string_arg(arguments, 0, "destination")?;
        if arguments.len() == 2 {
            string_arg(arguments, 1, "mapping")?;
        }
        Ok(())
    }

    fn check_runnable(&self, arguments: &[Value], mappings: &MappingRegistry) -> Result<(), Error> {
        let name = mapping_arg(arguments)?;
        if !mappings.contains(name) {
            return Err(Error::MappingNotRegistered(name.to_string()));
        }
        Ok(())
    }

    fn transform(&self, txn: &DataTxn<'_>, ctx: &BatchContext<'_>) -> Result<u64, Error> {
        let destination = string_arg(ctx.arguments, 0, "destination").map_err(Error::Constraint)?;
        let mapping = txn.mapping(mapping_arg(ctx.arguments)?)?;

        let mut copied = 0;
        for key in ctx.keys {
            let row = match txn.get(ctx.table, key)? {
                Some(row) => row,
                None => continue,
            };
            if let Some(mapped) = mapping.map(&row, txn)? {
                txn.upsert(destination, mapped)?;
                copied += 1;
            }
        }
        Ok(copied)
    }
}

fn mapping_arg(arguments: &[Value]) -> Result<&str, Error> {
    match arguments.get(1) {
        Some(_) => string_arg(arguments, 1, "mapping").map_err(Error::Constraint),
        None => Ok(IDENTITY_MAPPING),
    }
}

/// Copies one column into another where the target is still null.
///
/// Arguments: `[from, to]`. Used for concurrent column renames and type
/// changes, next to a column sync trigger that fills `to` on new writes.
#[derive(Debug, Default)]
pub struct CopyColumn;

impl Transformation for CopyColumn {
    fn validate_arguments(&self, arguments: &[Value]) -> Result<(), String> {
        arity(arguments, 2, 2)?;
        let from = string_arg(arguments, 0, "from")?;
        let to = string_arg(arguments, 1, "to")?;
        if from == to {
            return Err("from and to must differ".to_string());
        }
        Ok(())
    }

    fn transform(&self, txn: &DataTxn<'_>, ctx: &BatchContext<'_>) -> Result<u64, Error> {
        let from = string_arg(ctx.arguments, 0, "from").map_err(Error::Constraint)?;
        let to = string_arg(ctx.arguments, 1, "to").map_err(Error::Constraint)?;

        let mut updated = 0;
        for key in ctx.keys {
            let mut row = match txn.get(ctx.table, key)? {
                Some(row) => row,
                None => continue,
            };
            if !row.is_null(to) {
                continue;
            }
            let value = match row.get(from) {
                Some(value) if !value.is_null() => value.clone(),
                _ => continue,
            };
            row.set(to, value);
            txn.update(ctx.table, row)?;
            updated += 1;
        }
        Ok(updated)
    }
}

/// Sets a column to a literal where it is null.
///
/// Arguments: `[column, value]`.
#[derive(Debug, Default)]
pub struct FillColumn;

impl Transformation for FillColumn {
    fn validate_arguments(&self, arguments: &[Value]) -> Result<(), String> {
        arity(arguments, 2, 2)?;
        string_arg(arguments, 0, "column")?;
        if arguments[1].is_null() {
            return Err("fill value must not be null".to_string());
        }
        Ok(())
    }

    fn transform(&self, txn: &DataTxn<'_>, ctx: &BatchContext<'_>) -> Result<u64, Error> {
        let column = string_arg(ctx.arguments, 0, "column").map_err(Error::Constraint)?;
        let value = ctx
            .arguments
            .get(1)
            .ok_or_else(|| Error::Constraint("missing fill value".to_string()))?;

        let mut updated = 0;
        for key in ctx.keys {
            let mut row = match txn.get(ctx.table, key)? {
                Some(row) => row,
                None => continue,
            };
            if !row.is_null(column) {
                continue;
            }
            row.set(column, value.clone());
            txn.update(ctx.table, row)?;
            updated += 1;
        }
        Ok(updated)
    }
}

/// Transformations by name.
pub struct TransformationRegistry {
    transformations: DashMap<String, Arc<dyn Transformation>>,
}

impl TransformationRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            transformations: DashMap::new(),
        }
    }

    /// Registry with `copy_rows`, `copy_column` and `fill_column`.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("copy_rows", CopyRows);
        registry.register("copy_column", CopyColumn);
        registry.register("fill_column", FillColumn);
        registry
    }

    /// Register or replace a transformation.
    pub fn register(&self, name: impl Into<String>, transformation: impl Transformation + 'static) {
        self.transformations
            .insert(name.into(), Arc::new(transformation));
    }

    /// Look up a transformation.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Transformation>> {
        self.transformations.get(name).map(|e| e.value().clone())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .transformations
            .iter()
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for TransformationRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageConfig, TableStore};
    use crate::value::Row;

    fn run(
        store: &TableStore,
        t: &dyn Transformation,
        args: &[Value],
        keys: &[Cursor],
    ) -> Result<u64, Error> {
        let range = KeyRange::new(keys[0].clone(), keys[keys.len() - 1].clone());
        let ctx = BatchContext {
            table: "src",
            column: "id",
            range: &range,
            sub_batch_size: keys.len() as u64,
            arguments: args,
            keys,
        };
        store.transact(|txn| t.transform(txn, &ctx))
    }

    fn store() -> TableStore {
        let store = TableStore::open(StorageConfig::temporary()).unwrap();
        store.create_table("src", &["id"]).unwrap();
        store.create_table("dst", &["id"]).unwrap();
        store
    }

    #[test]
    fn test_argument_validation() {
        assert!(CopyRows.validate_arguments(&[Value::from("dst")]).is_ok());
        assert!(CopyRows.validate_arguments(&[]).is_err());
        assert!(CopyRows.validate_arguments(&[Value::Int64(1)]).is_err());
        assert!(CopyColumn
            .validate_arguments(&[Value::from("a"), Value::from("a")])
            .is_err());
        assert!(FillColumn
            .validate_arguments(&[Value::from("a"), Value::Null])
            .is_err());
    }

    #[test]
    fn test_copy_rows_is_idempotent_and_skips_deleted() {
        let store = store();
        for id in 1..=3 {
            store.insert("src", Row::new().with("id", id).with("v", id * 2)).unwrap();
        }
        let keys: Vec<_> = (1..=4).map(Cursor::scalar).collect();
        let args = [Value::from("dst")];

        assert_eq!(run(&store, &CopyRows, &args, &keys).unwrap(), 3);
        assert_eq!(run(&store, &CopyRows, &args, &keys).unwrap(), 3);
        assert_eq!(store.count("dst").unwrap(), 3);
        assert_eq!(
            store.get("dst", &Cursor::scalar(2)).unwrap(),
            store.get("src", &Cursor::scalar(2)).unwrap()
        );
    }

    #[test]
    fn test_copy_column_only_fills_nulls() {
        let store = store();
        store.insert("src", Row::new().with("id", 1).with("a", 5)).unwrap();
        store
            .insert("src", Row::new().with("id", 2).with("a", 6).with("b", 60))
            .unwrap();
        let keys = [Cursor::scalar(1), Cursor::scalar(2)];
        let args = [Value::from("a"), Value::from("b")];

        assert_eq!(run(&store, &CopyColumn, &args, &keys).unwrap(), 1);
        assert_eq!(run(&store, &CopyColumn, &args, &keys).unwrap(), 0);

        let first = store.get("src", &Cursor::scalar(1)).unwrap().unwrap();
        let second = store.get("src", &Cursor::scalar(2)).unwrap().unwrap();
        assert_eq!(first.get("b"), Some(&Value::Int64(5)));
        assert_eq!(second.get("b"), Some(&Value::Int64(60)));
    }

    #[test]
    fn test_fill_column() {
        let store = store();
        store.insert("src", Row::new().with("id", 1)).unwrap();
        let keys = [Cursor::scalar(1)];
        let args = [Value::from("state"), Value::from("new")];

        assert_eq!(run(&store, &FillColumn, &args, &keys).unwrap(), 1);
        let row = store.get("src", &Cursor::scalar(1)).unwrap().unwrap();
        assert_eq!(row.get("state"), Some(&Value::String("new".into())));
    }

    #[test]
    fn test_copy_rows_needs_registered_mapping() {
        let mappings = MappingRegistry::new();
        assert!(CopyRows
            .check_runnable(&[Value::from("dst")], &mappings)
            .is_ok());
        assert!(matches!(
            CopyRows.check_runnable(&[Value::from("dst"), Value::from("by_region")], &mappings),
            Err(Error::MappingNotRegistered(_))
        ));
        assert!(CopyColumn
            .check_runnable(&[Value::from("a"), Value::from("b")], &mappings)
            .is_ok());
    }

    #[test]
    fn test_registry_builtins() {
        let registry = TransformationRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec!["copy_column", "copy_rows", "fill_column"]
        );
        assert!(registry.get("missing").is_none());
    }
}
