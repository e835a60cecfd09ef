//! Data transactions with in-transaction trigger propagation.

use sled::transaction::TransactionalTree;

use super::key::row_key;
use super::TableDef;
use crate::error::Error;
use crate::sync::{MappingRegistry, RowLookup, RowMapping, SyncOperation, SyncTriggerDef, TriggerSet};
use crate::value::{Cursor, Row};

/// View over the table trees inside one sled transaction.
///
/// Row writes made through a `DataTxn` fire the sync triggers installed on
/// the written table. The mirrored writes land in the same transaction, so
/// the source write and its mirror commit or abort together.
pub struct DataTxn<'a> {
    tables: &'a TransactionalTree,
    triggers: &'a TransactionalTree,
    rows: &'a TransactionalTree,
    mappings: &'a MappingRegistry,
}

/// A row change handed to triggers.
enum Change<'r> {
    Insert(&'r Row),
    Update { old: &'r Row, new: &'r Row },
    Delete(&'r Row),
}

impl Change<'_> {
    fn operation(&self) -> SyncOperation {
        match self {
            Change::Insert(_) => SyncOperation::Insert,
            Change::Update { .. } => SyncOperation::Update,
            Change::Delete(_) => SyncOperation::Delete,
        }
    }
}

impl<'a> DataTxn<'a> {
    pub(crate) fn new(
        tables: &'a TransactionalTree,
        triggers: &'a TransactionalTree,
        rows: &'a TransactionalTree,
        mappings: &'a MappingRegistry,
    ) -> Self {
        Self {
            tables,
            triggers,
            rows,
            mappings,
        }
    }

    /// Get a table definition.
    pub fn table(&self, name: &str) -> Result<TableDef, Error> {
        match self.tables.get(name.as_bytes())? {
            Some(bytes) => TableDef::from_bytes(&bytes),
            None => Err(Error::TableNotFound(name.to_string())),
        }
    }

    /// Get a row by primary key, seeing this transaction's own writes.
    pub fn get(&self, table: &str, key: &Cursor) -> Result<Option<Row>, Error> {
        let def = self.table(table)?;
        def.check_cursor(key)?;
        self.get_raw(&def, key)
    }

    /// Insert a new row. Fails if the key exists.
    pub fn insert(&self, table: &str, mut row: Row) -> Result<(), Error> {
        let def = self.table(table)?;
        let set = TriggerSet::load_tx(self.triggers, table)?;
        apply_column_syncs(&set, &mut row);
        let key = def.key_of(&row)?;
        if self.get_raw(&def, &key)?.is_some() {
            return Err(Error::DuplicateKey {
                table: table.to_string(),
                key: key.to_string(),
            });
        }
        self.put_raw(&def, &key, &row)?;
        self.fire(&set, Change::Insert(&row))
    }

    /// Replace an existing row. Fails if the key does not exist.
    pub fn update(&self, table: &str, mut row: Row) -> Result<(), Error> {
        let def = self.table(table)?;
        let set = TriggerSet::load_tx(self.triggers, table)?;
        apply_column_syncs(&set, &mut row);
        let key = def.key_of(&row)?;
        let old = self.get_raw(&def, &key)?.ok_or_else(|| Error::RowNotFound {
            table: table.to_string(),
            key: key.to_string(),
        })?;
        self.put_raw(&def, &key, &row)?;
        self.fire(&set, Change::Update { old: &old, new: &row })
    }

    /// Insert or replace a row. Fires as an insert or an update accordingly.
    pub fn upsert(&self, table: &str, mut row: Row) -> Result<(), Error> {
        let def = self.table(table)?;
        let set = TriggerSet::load_tx(self.triggers, table)?;
        apply_column_syncs(&set, &mut row);
        let key = def.key_of(&row)?;
        let old = self.get_raw(&def, &key)?;
        self.put_raw(&def, &key, &row)?;
        match old {
            Some(old) => self.fire(&set, Change::Update { old: &old, new: &row }),
            None => self.fire(&set, Change::Insert(&row)),
        }
    }

    /// Delete a row by key, returning the removed row.
    pub fn delete(&self, table: &str, key: &Cursor) -> Result<Option<Row>, Error> {
        let def = self.table(table)?;
        def.check_cursor(key)?;
        let old = match self.get_raw(&def, key)? {
            Some(old) => old,
            None => return Ok(None),
        };
        self.rows.remove(row_key(def.storage_id, key))?;
        let set = TriggerSet::load_tx(self.triggers, table)?;
        self.fire(&set, Change::Delete(&old))?;
        Ok(Some(old))
    }

    /// Resolve a registered mapping.
    pub fn mapping(&self, name: &str) -> Result<std::sync::Arc<dyn RowMapping>, Error> {
        self.mappings.require(name)
    }

    fn get_raw(&self, def: &TableDef, key: &Cursor) -> Result<Option<Row>, Error> {
        match self.rows.get(row_key(def.storage_id, key))? {
            Some(bytes) => Ok(Some(Row::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_raw(&self, def: &TableDef, key: &Cursor, row: &Row) -> Result<(), Error> {
        self.rows.insert(row_key(def.storage_id, key), row.to_bytes()?)?;
        Ok(())
    }

    fn fire(&self, set: &TriggerSet, change: Change<'_>) -> Result<(), Error> {
        let op = change.operation();
        for trigger in set.triggers.iter().filter(|t| t.mirrors(op)) {
            self.mirror(trigger, &change).map_err(|e| match e {
                e if e.is_transient() => e,
                Error::SyncFailed { .. } | Error::MappingNotRegistered(_) => e,
                other => Error::SyncFailed {
                    trigger: trigger.name.clone(),
                    reason: other.to_string(),
                },
            })?;
        }
        Ok(())
    }

    fn mirror(&self, trigger: &SyncTriggerDef, change: &Change<'_>) -> Result<(), Error> {
        let mapping = self.mappings.require(&trigger.mapping)?;
        let dest = self.table(&trigger.destination)?;

        match change {
            Change::Insert(row) => {
                if let Some(mapped) = mapping.map(row, self)? {
                    let key = dest.key_of(&mapped)?;
                    self.put_raw(&dest, &key, &mapped)?;
                }
            }
            Change::Update { old, new } => {
                let old_key = match mapping.map(old, self)? {
                    Some(mapped) => Some(dest.key_of(&mapped)?),
                    None => None,
                };
                let new_mapped = mapping.map(new, self)?;
                let new_key = match &new_mapped {
                    Some(mapped) => Some(dest.key_of(mapped)?),
                    None => None,
                };
                if let Some(old_key) = old_key {
                    if new_key.as_ref() != Some(&old_key) {
                        self.rows.remove(row_key(dest.storage_id, &old_key))?;
                    }
                }
                if let (Some(mapped), Some(key)) = (new_mapped, new_key) {
                    self.put_raw(&dest, &key, &mapped)?;
                }
            }
            Change::Delete(old) => {
                if let Some(mapped) = mapping.map(old, self)? {
                    let key = dest.key_of(&mapped)?;
                    self.rows.remove(row_key(dest.storage_id, &key))?;
                }
            }
        }
        Ok(())
    }
}

/// Column sync triggers run before the row is stored, so mirrors and the
/// stored row both carry the copied value.
fn apply_column_syncs(set: &TriggerSet, row: &mut Row) {
    for column in &set.columns {
        column.apply(row);
    }
}

impl RowLookup for DataTxn<'_> {
    fn lookup(&self, table: &str, key: &Cursor) -> Result<Option<Row>, Error> {
        self.get(table, key)
    }
}
