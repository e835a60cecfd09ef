//! Sync trigger installation and lookup.

use crate::error::Error;
use crate::storage::key::current_timestamp;
use crate::storage::{TableDef, TableStore};

use super::{ColumnSyncDef, ColumnSyncSpec, SyncTriggerDef, SyncTriggerSpec, TriggerSet};

/// Manages the sync triggers of a [`TableStore`].
///
/// Triggers are stored next to the tables they watch and are read by every
/// data transaction that writes to their source table.
pub struct SyncTriggerEngine<'a> {
    store: &'a TableStore,
}

impl<'a> SyncTriggerEngine<'a> {
    /// Create an engine over a table store.
    pub fn new(store: &'a TableStore) -> Self {
        Self { store }
    }

    /// Install a trigger.
    ///
    /// Installing an identical definition again is a no-op. Installing a
    /// different definition under an existing name replaces it.
    pub fn install(&self, spec: SyncTriggerSpec) -> Result<SyncTriggerDef, Error> {
        if spec.source == spec.destination {
            return Err(Error::InvalidTrigger(format!(
                "source and destination are both {}",
                spec.source
            )));
        }
        if spec.operations.is_empty() {
            return Err(Error::InvalidTrigger(
                "trigger mirrors no operations".to_string(),
            ));
        }
        if !self.store.mappings().contains(&spec.mapping) {
            return Err(Error::MappingNotRegistered(spec.mapping.clone()));
        }

        let def = spec.into_def(current_timestamp());
        let (installed, replaced) = self.store.catalog_transact(|tables, triggers| {
            install_tx(tables, triggers, &def)
        })?;

        if installed.installed_at == def.installed_at {
            tracing::info!(
                trigger = %installed.name,
                source = %installed.source,
                destination = %installed.destination,
                mapping = %installed.mapping,
                replaced,
                "installed sync trigger"
            );
        } else {
            tracing::debug!(trigger = %installed.name, "sync trigger already installed");
        }
        Ok(installed)
    }

    /// Install a trigger that keeps `to` equal to `from` on every insert and
    /// update of one table.
    ///
    /// Idempotent like [`install`](Self::install).
    pub fn install_column_sync(&self, spec: ColumnSyncSpec) -> Result<ColumnSyncDef, Error> {
        if spec.from == spec.to {
            return Err(Error::InvalidTrigger(format!(
                "column {} cannot sync into itself",
                spec.from
            )));
        }
        let table = self.store.require_table(&spec.table)?;
        if table.key_columns.contains(&spec.to) {
            return Err(Error::InvalidTrigger(format!(
                "column {} is part of the key of {}",
                spec.to, spec.table
            )));
        }

        let def = spec.into_def(current_timestamp());
        let installed = self
            .store
            .catalog_transact(|tables, triggers| install_column_tx(tables, triggers, &def))?;

        if installed.installed_at == def.installed_at {
            tracing::info!(
                trigger = %installed.name,
                table = %installed.table,
                from = %installed.from,
                to = %installed.to,
                "installed column sync trigger"
            );
        } else {
            tracing::debug!(trigger = %installed.name, "column sync trigger already installed");
        }
        Ok(installed)
    }

    /// Remove a trigger of either kind by name. Mirrored rows and copied
    /// column values are left in place.
    ///
    /// Returns `false` when no such trigger exists.
    pub fn remove(&self, name: &str) -> Result<bool, Error> {
        let source = match self.get(name)? {
            Some(def) => def.source,
            None => match self.get_column_sync(name)? {
                Some(def) => def.table,
                None => return Ok(false),
            },
        };

        let removed = self
            .store
            .catalog_transact(|_, triggers| remove_tx(triggers, &source, name))?;

        if removed {
            tracing::info!(trigger = name, source = %source, "removed sync trigger");
        }
        Ok(removed)
    }

    /// Get a trigger by name.
    pub fn get(&self, name: &str) -> Result<Option<SyncTriggerDef>, Error> {
        Ok(self.list()?.into_iter().find(|t| t.name == name))
    }

    /// Whether a trigger mirrors `source` into `destination`.
    pub fn is_active(&self, source: &str, destination: &str) -> Result<bool, Error> {
        Ok(self
            .triggers_for(source)?
            .iter()
            .any(|t| t.destination == destination))
    }

    /// Triggers attached to a source table.
    pub fn triggers_for(&self, source: &str) -> Result<Vec<SyncTriggerDef>, Error> {
        Ok(TriggerSet::load(self.store.triggers_tree(), source)?.triggers)
    }

    /// Every installed trigger, grouped by source table.
    pub fn list(&self) -> Result<Vec<SyncTriggerDef>, Error> {
        Ok(self.sets()?.into_iter().flat_map(|set| set.triggers).collect())
    }

    /// Get a column sync trigger by name.
    pub fn get_column_sync(&self, name: &str) -> Result<Option<ColumnSyncDef>, Error> {
        Ok(self.list_column_syncs()?.into_iter().find(|c| c.name == name))
    }

    /// Column sync triggers on a table.
    pub fn column_syncs_for(&self, table: &str) -> Result<Vec<ColumnSyncDef>, Error> {
        Ok(TriggerSet::load(self.store.triggers_tree(), table)?.columns)
    }

    /// Every installed column sync trigger.
    pub fn list_column_syncs(&self) -> Result<Vec<ColumnSyncDef>, Error> {
        Ok(self.sets()?.into_iter().flat_map(|set| set.columns).collect())
    }

    fn sets(&self) -> Result<Vec<TriggerSet>, Error> {
        self.store
            .triggers_tree()
            .iter()
            .map(|entry| {
                let (_, bytes) = entry?;
                TriggerSet::from_bytes(&bytes)
            })
            .collect()
    }
}

/// Install inside a catalog transaction. Returns the effective definition
/// and whether an existing one was replaced.
pub(crate) fn install_tx(
    tables: &sled::transaction::TransactionalTree,
    triggers: &sled::transaction::TransactionalTree,
    def: &SyncTriggerDef,
) -> Result<(SyncTriggerDef, bool), Error> {
    for table in [&def.source, &def.destination] {
        if TableDef::load_tx(tables, table)?.is_none() {
            return Err(Error::TableNotFound(table.clone()));
        }
    }

    let mut set = TriggerSet::load_tx(triggers, &def.source)?;
    let mut replaced = false;
    if let Some(existing) = set.triggers.iter_mut().find(|t| t.name == def.name) {
        if existing.same_as(def) {
            return Ok((existing.clone(), false));
        }
        *existing = def.clone();
        replaced = true;
    } else {
        set.triggers.push(def.clone());
    }
    set.store_tx(triggers, &def.source)?;
    Ok((def.clone(), replaced))
}

fn install_column_tx(
    tables: &sled::transaction::TransactionalTree,
    triggers: &sled::transaction::TransactionalTree,
    def: &ColumnSyncDef,
) -> Result<ColumnSyncDef, Error> {
    if TableDef::load_tx(tables, &def.table)?.is_none() {
        return Err(Error::TableNotFound(def.table.clone()));
    }

    let mut set = TriggerSet::load_tx(triggers, &def.table)?;
    match set.columns.iter_mut().find(|c| c.name == def.name) {
        Some(existing) if existing.same_as(def) => return Ok(existing.clone()),
        Some(existing) => *existing = def.clone(),
        None => set.columns.push(def.clone()),
    }
    set.store_tx(triggers, &def.table)?;
    Ok(def.clone())
}

/// Remove a trigger of either kind inside a catalog transaction.
pub(crate) fn remove_tx(
    triggers: &sled::transaction::TransactionalTree,
    source: &str,
    name: &str,
) -> Result<bool, Error> {
    let mut set = TriggerSet::load_tx(triggers, source)?;
    let before = set.triggers.len() + set.columns.len();
    set.triggers.retain(|t| t.name != name);
    set.columns.retain(|c| c.name != name);
    if set.triggers.len() + set.columns.len() == before {
        return Ok(false);
    }
    set.store_tx(triggers, source)?;
    Ok(true)
}
