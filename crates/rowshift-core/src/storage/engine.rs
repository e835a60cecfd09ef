//! Table store implementation.

use std::ops::Bound;
use std::sync::Arc;

use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, Transactional, Tree};

use super::key::{current_timestamp, decode_row_key, row_key, table_prefix, table_prefix_end};
use super::{DataTxn, StorageConfig, TableDef};
use crate::error::Error;
use crate::sync::{MappingRegistry, RowLookup, TriggerSet};
use crate::value::{Cursor, KeyRange, Row};

/// Tree name for the table catalog.
const TABLES_TREE: &str = "catalog:tables";

/// Tree name for row data of every table.
const ROWS_TREE: &str = "data:rows";

/// Tree name for installed sync triggers, keyed by source table.
const TRIGGERS_TREE: &str = "sync:triggers";

/// Durable tables on top of sled.
///
/// Every row write goes through a [`DataTxn`], which fires the sync
/// triggers of the written table inside the same sled transaction.
pub struct TableStore {
    /// The underlying sled database.
    db: Db,

    /// Table name -> TableDef.
    tables: Tree,

    /// storage_id ++ encoded key -> Row.
    rows: Tree,

    /// Source table name -> TriggerSet.
    triggers: Tree,

    /// Mappings referenced by trigger definitions.
    mappings: Arc<MappingRegistry>,
}

impl TableStore {
    /// Open or create a table store with the given configuration.
    pub fn open(config: StorageConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        Self::from_db(db)
    }

    /// Wrap an already opened sled database.
    pub fn from_db(db: Db) -> Result<Self, Error> {
        let tables = db.open_tree(TABLES_TREE)?;
        let rows = db.open_tree(ROWS_TREE)?;
        let triggers = db.open_tree(TRIGGERS_TREE)?;

        Ok(Self {
            db,
            tables,
            rows,
            triggers,
            mappings: Arc::new(MappingRegistry::new()),
        })
    }

    /// The underlying sled database, shared with the migration trees.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Mapping registry consulted when triggers fire.
    pub fn mappings(&self) -> &Arc<MappingRegistry> {
        &self.mappings
    }

    pub(crate) fn triggers_tree(&self) -> &Tree {
        &self.triggers
    }

    /// Check if the database was recovered from a previous crash.
    pub fn was_recovered(&self) -> bool {
        self.db.was_recovered()
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }

    // ========== Catalog ==========

    /// Create a table with the given primary key columns.
    pub fn create_table(&self, name: &str, key_columns: &[&str]) -> Result<TableDef, Error> {
        if name.is_empty() {
            return Err(Error::InvalidKey("table name must not be empty".to_string()));
        }
        if key_columns.is_empty() {
            return Err(Error::InvalidKey(format!(
                "table {} needs at least one key column",
                name
            )));
        }

        let def = TableDef {
            name: name.to_string(),
            key_columns: key_columns.iter().map(|c| c.to_string()).collect(),
            storage_id: self.db.generate_id()?,
            created_at: current_timestamp(),
        };

        self.tables
            .compare_and_swap(name.as_bytes(), None as Option<&[u8]>, Some(def.to_bytes()?))?
            .map_err(|_| Error::TableExists(name.to_string()))?;

        tracing::info!(table = name, storage_id = def.storage_id, "created table");
        Ok(def)
    }

    /// Drop a table and its rows.
    ///
    /// Refused while any sync trigger reads from or writes to the table, or
    /// a column sync trigger is installed on it.
    pub fn drop_table(&self, name: &str) -> Result<(), Error> {
        let def = self.require_table(name)?;

        for entry in self.triggers.iter() {
            let (_, bytes) = entry?;
            let set = TriggerSet::from_bytes(&bytes)?;
            let in_use = set
                .triggers
                .iter()
                .find(|t| t.involves(name))
                .map(|t| &t.name)
                .or_else(|| set.columns.iter().find(|c| c.table == name).map(|c| &c.name));
            if let Some(trigger) = in_use {
                return Err(Error::TableInUse {
                    table: name.to_string(),
                    trigger: trigger.clone(),
                });
            }
        }

        self.tables.remove(name.as_bytes())?;
        let removed = self.purge_rows(def.storage_id)?;

        tracing::info!(table = name, rows = removed, "dropped table");
        Ok(())
    }

    fn purge_rows(&self, storage_id: u64) -> Result<u64, Error> {
        let mut removed = 0;
        let range = table_prefix(storage_id)..table_prefix_end(storage_id);
        for entry in self.rows.range(range) {
            let (key, _) = entry?;
            self.rows.remove(key)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Get a table definition.
    pub fn table(&self, name: &str) -> Result<Option<TableDef>, Error> {
        match self.tables.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(TableDef::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get a table definition, failing if it does not exist.
    pub fn require_table(&self, name: &str) -> Result<TableDef, Error> {
        self.table(name)?
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// All tables, ordered by name.
    pub fn list_tables(&self) -> Result<Vec<TableDef>, Error> {
        self.tables
            .iter()
            .map(|entry| {
                let (_, bytes) = entry?;
                TableDef::from_bytes(&bytes)
            })
            .collect()
    }

    // ========== Reads ==========

    /// Get a row by primary key.
    pub fn get(&self, table: &str, key: &Cursor) -> Result<Option<Row>, Error> {
        let def = self.require_table(table)?;
        def.check_cursor(key)?;
        match self.rows.get(row_key(def.storage_id, key))? {
            Some(bytes) => Ok(Some(Row::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Raw ordered iterator over a table's rows between two key bounds.
    pub(crate) fn row_range(
        &self,
        def: &TableDef,
        lower: Bound<&Cursor>,
        upper: Bound<&Cursor>,
    ) -> sled::Iter {
        let id = def.storage_id;
        let lower = match lower {
            Bound::Included(c) => Bound::Included(row_key(id, c)),
            Bound::Excluded(c) => Bound::Excluded(row_key(id, c)),
            Bound::Unbounded => Bound::Included(table_prefix(id).to_vec()),
        };
        let upper = match upper {
            Bound::Included(c) => Bound::Included(row_key(id, c)),
            Bound::Excluded(c) => Bound::Excluded(row_key(id, c)),
            Bound::Unbounded => Bound::Excluded(table_prefix_end(id).to_vec()),
        };
        self.rows.range((lower, upper))
    }

    /// Scan rows in key order between two bounds.
    pub fn scan(
        &self,
        table: &str,
        lower: Bound<&Cursor>,
        upper: Bound<&Cursor>,
    ) -> Result<Vec<(Cursor, Row)>, Error> {
        let def = self.require_table(table)?;
        self.row_range(&def, lower, upper)
            .map(|entry| {
                let (key, bytes) = entry?;
                Ok((decode_row_key(&key)?, Row::from_bytes(&bytes)?))
            })
            .collect()
    }

    /// First and last key currently in the table.
    pub fn bounds(&self, table: &str) -> Result<Option<KeyRange>, Error> {
        let def = self.require_table(table)?;
        let mut iter = self.row_range(&def, Bound::Unbounded, Bound::Unbounded);
        let first = match iter.next() {
            Some(entry) => decode_row_key(&entry?.0)?,
            None => return Ok(None),
        };
        let last = match iter.next_back() {
            Some(entry) => decode_row_key(&entry?.0)?,
            None => first.clone(),
        };
        Ok(Some(KeyRange {
            min: first,
            max: last,
        }))
    }

    /// Number of rows in the table.
    pub fn count(&self, table: &str) -> Result<u64, Error> {
        let def = self.require_table(table)?;
        let mut count = 0;
        for entry in self.row_range(&def, Bound::Unbounded, Bound::Unbounded) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    // ========== Writes ==========

    /// Run `f` in a data transaction.
    ///
    /// The closure may run more than once when sled detects a conflict, so it
    /// must not have effects outside the transaction.
    pub fn transact<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: Fn(&DataTxn<'_>) -> Result<T, Error>,
    {
        let result: Result<T, TransactionError<Error>> = (&self.tables, &self.triggers, &self.rows)
            .transaction(|(tables, triggers, rows)| {
                let txn = DataTxn::new(tables, triggers, rows, &self.mappings);
                f(&txn).map_err(|e| match e {
                    Error::Conflict => ConflictableTransactionError::Conflict,
                    Error::Storage(e) => ConflictableTransactionError::Storage(e),
                    other => ConflictableTransactionError::Abort(other),
                })
            });

        match result {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
        }
    }

    /// Run `f` in a transaction over the catalog and trigger trees only.
    ///
    /// Used for trigger installation and table swaps, which must be atomic
    /// with respect to concurrent data transactions reading the same trees.
    pub(crate) fn catalog_transact<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: Fn(&TransactionalTree, &TransactionalTree) -> Result<T, Error>,
    {
        let result: Result<T, TransactionError<Error>> = (&self.tables, &self.triggers)
            .transaction(|(tables, triggers)| {
                f(tables, triggers).map_err(|e| match e {
                    Error::Conflict => ConflictableTransactionError::Conflict,
                    Error::Storage(e) => ConflictableTransactionError::Storage(e),
                    other => ConflictableTransactionError::Abort(other),
                })
            });

        match result {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
        }
    }

    /// Insert a new row.
    pub fn insert(&self, table: &str, row: Row) -> Result<(), Error> {
        self.transact(|tx| tx.insert(table, row.clone()))
    }

    /// Replace an existing row.
    pub fn update(&self, table: &str, row: Row) -> Result<(), Error> {
        self.transact(|tx| tx.update(table, row.clone()))
    }

    /// Insert or replace a row.
    pub fn upsert(&self, table: &str, row: Row) -> Result<(), Error> {
        self.transact(|tx| tx.upsert(table, row.clone()))
    }

    /// Delete a row, returning it if it existed.
    pub fn delete(&self, table: &str, key: &Cursor) -> Result<Option<Row>, Error> {
        self.transact(|tx| tx.delete(table, key))
    }
}

impl RowLookup for TableStore {
    fn lookup(&self, table: &str, key: &Cursor) -> Result<Option<Row>, Error> {
        self.get(table, key)
    }
}
