//! Table cutover once a backfill has caught up.
//!
//! A cutover swaps a live table for the table that was filled next to it:
//! the source is renamed to an archive name, the destination takes the
//! source's name, and the forward sync trigger is dropped. Rows are stored
//! under each table's storage id, so the swap only rewrites catalog entries
//! and is a single catalog transaction.

use sled::transaction::TransactionalTree;

use crate::error::Error;
use crate::migration::{MigrationError, MigrationRegistry, MigrationStatus};
use crate::storage::key::current_timestamp;
use crate::storage::{TableDef, TableStore};
use crate::sync::{
    install_tx, remove_tx, SyncTriggerDef, SyncTriggerEngine, SyncTriggerSpec, TriggerSet,
};

/// Default suffix of archived tables.
pub const DEFAULT_ARCHIVE_SUFFIX: &str = "_archived";

/// What to swap and how to keep the tables in sync around the swap.
#[derive(Debug, Clone, PartialEq)]
pub struct CutoverPlan {
    /// Migration that backfilled the destination.
    pub definition_id: u64,
    /// Live table.
    pub source: String,
    /// Table replacing it.
    pub destination: String,
    /// Mapping of the forward trigger, reinstalled on rollback.
    pub mapping: String,
    /// Mapping from new rows back to the archive. Keeps the archive current
    /// after the swap so a rollback loses nothing.
    pub reverse_mapping: Option<String>,
    /// Suffix appended to the source name for the archive.
    pub archive_suffix: String,
}

impl CutoverPlan {
    /// A plan with the default archive suffix and no reverse trigger.
    pub fn new(
        definition_id: u64,
        source: impl Into<String>,
        destination: impl Into<String>,
        mapping: impl Into<String>,
    ) -> Self {
        Self {
            definition_id,
            source: source.into(),
            destination: destination.into(),
            mapping: mapping.into(),
            reverse_mapping: None,
            archive_suffix: DEFAULT_ARCHIVE_SUFFIX.to_string(),
        }
    }

    /// Install a reverse trigger with this mapping at cutover.
    pub fn with_reverse_mapping(mut self, mapping: impl Into<String>) -> Self {
        self.reverse_mapping = Some(mapping.into());
        self
    }

    /// Use a different archive suffix.
    pub fn with_archive_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.archive_suffix = suffix.into();
        self
    }

    /// Name the source table is archived under.
    pub fn archive_name(&self) -> String {
        format!("{}{}", self.source, self.archive_suffix)
    }
}

/// The two signals a cutover waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    /// The backfill migration has finished.
    pub backfill_complete: bool,
    /// A trigger mirrors the source into the destination.
    pub sync_active: bool,
}

impl Readiness {
    /// Whether both signals hold.
    pub fn is_ready(&self) -> bool {
        self.backfill_complete && self.sync_active
    }
}

/// Performs cutovers and rollbacks.
pub struct CutoverCoordinator<'a> {
    store: &'a TableStore,
    registry: MigrationRegistry,
}

impl<'a> CutoverCoordinator<'a> {
    /// Create a coordinator over a table store.
    pub fn new(store: &'a TableStore) -> Result<Self, MigrationError> {
        Ok(Self {
            store,
            registry: MigrationRegistry::open(store.db())?,
        })
    }

    /// Report both signals without acting.
    pub fn readiness(&self, plan: &CutoverPlan) -> Result<Readiness, MigrationError> {
        let def = self.registry.require(plan.definition_id)?;
        Ok(Readiness {
            backfill_complete: def.status == MigrationStatus::Finished && def.table == plan.source,
            sync_active: SyncTriggerEngine::new(self.store)
                .is_active(&plan.source, &plan.destination)?,
        })
    }

    /// Swap the destination in for the source.
    pub fn cutover(&self, plan: &CutoverPlan) -> Result<(), MigrationError> {
        let readiness = self.readiness(plan)?;
        if !readiness.backfill_complete {
            return Err(not_ready(
                plan,
                format!("migration {} has not finished", plan.definition_id),
            ));
        }
        if !readiness.sync_active {
            return Err(not_ready(
                plan,
                format!("no sync trigger from {} to {}", plan.source, plan.destination),
            ));
        }
        if let Some(mapping) = &plan.reverse_mapping {
            if !self.store.mappings().contains(mapping) {
                return Err(Error::MappingNotRegistered(mapping.clone()).into());
            }
        }

        let archive = plan.archive_name();
        self.check_unrelated_triggers(plan, &archive)?;
        let reverse = plan.reverse_mapping.as_ref().map(|mapping| {
            SyncTriggerSpec::new(&plan.source, &archive, mapping).into_def(current_timestamp())
        });

        self.store
            .catalog_transact(|tables, triggers| {
                let source = require_tx(tables, &plan.source)?;
                let destination = require_tx(tables, &plan.destination)?;
                if TableDef::load_tx(tables, &archive)?.is_some() {
                    return Err(Error::TableExists(archive.clone()));
                }

                let forward = TriggerSet::load_tx(triggers, &plan.source)?;
                if !forward
                    .triggers
                    .iter()
                    .any(|t| t.destination == plan.destination)
                {
                    return Err(Error::TriggerNotFound(format!(
                        "{} -> {}",
                        plan.source, plan.destination
                    )));
                }
                check_idle(triggers, &plan.destination)?;
                for trigger in &forward.triggers {
                    remove_tx(triggers, &plan.source, &trigger.name)?;
                }

                rename_tx(tables, source, &archive)?;
                rename_tx(tables, destination, &plan.source)?;

                if let Some(reverse) = &reverse {
                    install_tx(tables, triggers, reverse)?;
                }
                Ok(())
            })?;

        tracing::info!(
            table = %plan.source,
            destination = %plan.destination,
            archive = %archive,
            reverse = plan.reverse_mapping.is_some(),
            "cutover complete"
        );
        Ok(())
    }

    /// Undo a cutover: the archive becomes the live table again and the
    /// forward trigger is reinstalled.
    pub fn rollback(&self, plan: &CutoverPlan) -> Result<(), MigrationError> {
        if !self.store.mappings().contains(&plan.mapping) {
            return Err(Error::MappingNotRegistered(plan.mapping.clone()).into());
        }
        let archive = plan.archive_name();
        self.check_unrelated_triggers(plan, &archive)?;
        let forward =
            SyncTriggerSpec::new(&plan.source, &plan.destination, &plan.mapping)
                .into_def(current_timestamp());

        self.store
            .catalog_transact(|tables, triggers| {
                let live = require_tx(tables, &plan.source)?;
                let archived = require_tx(tables, &archive)?;
                if TableDef::load_tx(tables, &plan.destination)?.is_some() {
                    return Err(Error::TableExists(plan.destination.clone()));
                }

                let reverse = TriggerSet::load_tx(triggers, &plan.source)?;
                if let Some(other) = reverse.triggers.iter().find(|t| t.destination != archive) {
                    return Err(Error::TableInUse {
                        table: plan.source.clone(),
                        trigger: other.name.clone(),
                    });
                }
                for trigger in &reverse.triggers {
                    remove_tx(triggers, &plan.source, &trigger.name)?;
                }
                check_idle(triggers, &archive)?;

                rename_tx(tables, live, &plan.destination)?;
                rename_tx(tables, archived, &plan.source)?;
                install_tx(tables, triggers, &forward)?;
                Ok(())
            })?;

        tracing::info!(
            table = %plan.source,
            destination = %plan.destination,
            "cutover rolled back"
        );
        Ok(())
    }

    /// Drop the archive left by a cutover, with any trigger feeding it.
    pub fn drop_archive(&self, plan: &CutoverPlan) -> Result<(), MigrationError> {
        let archive = plan.archive_name();
        let engine = SyncTriggerEngine::new(self.store);
        for trigger in engine.triggers_for(&plan.source)? {
            if trigger.destination == archive {
                engine.remove(&trigger.name)?;
            }
        }
        self.store.drop_table(&archive)?;
        tracing::info!(table = %plan.source, archive = %archive, "dropped archive table");
        Ok(())
    }

    /// Refuse when triggers other than the ones the swap manages touch the
    /// tables involved.
    fn check_unrelated_triggers(
        &self,
        plan: &CutoverPlan,
        archive: &str,
    ) -> Result<(), MigrationError> {
        let managed = |t: &SyncTriggerDef| {
            t.source == plan.source && (t.destination == plan.destination || t.destination == archive)
        };
        let engine = SyncTriggerEngine::new(self.store);
        for trigger in engine.list()? {
            if managed(&trigger) {
                continue;
            }
            for table in [plan.source.as_str(), plan.destination.as_str(), archive] {
                if trigger.involves(table) {
                    return Err(not_ready(
                        plan,
                        format!("table {} is referenced by sync trigger {}", table, trigger.name),
                    ));
                }
            }
        }
        let tables = [plan.source.as_str(), plan.destination.as_str(), archive];
        if let Some(column) = engine
            .list_column_syncs()?
            .into_iter()
            .find(|c| tables.contains(&c.table.as_str()))
        {
            return Err(not_ready(
                plan,
                format!(
                    "table {} has column sync trigger {}",
                    column.table, column.name
                ),
            ));
        }
        Ok(())
    }
}

fn not_ready(plan: &CutoverPlan, reason: String) -> MigrationError {
    MigrationError::CutoverNotReady {
        table: plan.source.clone(),
        reason,
    }
}

fn require_tx(tables: &TransactionalTree, name: &str) -> Result<TableDef, Error> {
    TableDef::load_tx(tables, name)?.ok_or_else(|| Error::TableNotFound(name.to_string()))
}

fn check_idle(triggers: &TransactionalTree, table: &str) -> Result<(), Error> {
    match TriggerSet::load_tx(triggers, table)?.first_name() {
        Some(trigger) => Err(Error::TableInUse {
            table: table.to_string(),
            trigger: trigger.to_string(),
        }),
        None => Ok(()),
    }
}

/// Move a table definition to a new name. Its rows follow via the storage id.
fn rename_tx(tables: &TransactionalTree, mut def: TableDef, to: &str) -> Result<(), Error> {
    tables.remove(def.name.as_bytes())?;
    def.name = to.to_string();
    def.store_tx(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{EngineConfig, EnqueueRequest, Scheduler, TransformationRegistry};
    use crate::storage::StorageConfig;
    use crate::sync::IDENTITY_MAPPING;
    use crate::value::{Cursor, Row, Value};
    use std::sync::Arc;

    fn setup() -> (Arc<TableStore>, Scheduler, u64) {
        let store = Arc::new(TableStore::open(StorageConfig::temporary()).unwrap());
        store.create_table("orders", &["id"]).unwrap();
        store.create_table("orders_p", &["id"]).unwrap();
        for id in 1..=30 {
            store
                .insert("orders", Row::new().with("id", id).with("total", id * 3))
                .unwrap();
        }
        SyncTriggerEngine::new(&store)
            .install(SyncTriggerSpec::new("orders", "orders_p", IDENTITY_MAPPING))
            .unwrap();

        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(TransformationRegistry::with_builtins()),
            EngineConfig::immediate(),
        )
        .unwrap();
        let def = scheduler
            .enqueue(
                EnqueueRequest::new("copy_rows", "orders", "id")
                    .with_arguments(vec![Value::from("orders_p")])
                    .with_batch_sizes(10, 5),
            )
            .unwrap();
        (store, scheduler, def.id)
    }

    #[test]
    fn test_cutover_refuses_before_backfill() {
        let (store, _scheduler, def_id) = setup();
        let coordinator = CutoverCoordinator::new(&store).unwrap();
        let plan = CutoverPlan::new(def_id, "orders", "orders_p", IDENTITY_MAPPING);

        let readiness = coordinator.readiness(&plan).unwrap();
        assert!(!readiness.backfill_complete);
        assert!(readiness.sync_active);
        assert!(matches!(
            coordinator.cutover(&plan),
            Err(MigrationError::CutoverNotReady { .. })
        ));
    }

    #[test]
    fn test_cutover_refuses_without_sync() {
        let (store, scheduler, def_id) = setup();
        scheduler.finalize(def_id).unwrap();
        SyncTriggerEngine::new(&store)
            .remove(&crate::sync::trigger_name("orders", "orders_p"))
            .unwrap();

        let coordinator = CutoverCoordinator::new(&store).unwrap();
        let plan = CutoverPlan::new(def_id, "orders", "orders_p", IDENTITY_MAPPING);
        assert!(matches!(
            coordinator.cutover(&plan),
            Err(MigrationError::CutoverNotReady { .. })
        ));
    }

    #[test]
    fn test_cutover_rollback_and_drop_archive() {
        let (store, scheduler, def_id) = setup();
        scheduler.finalize(def_id).unwrap();
        store
            .insert("orders", Row::new().with("id", 31).with("total", 93))
            .unwrap();

        let coordinator = CutoverCoordinator::new(&store).unwrap();
        let plan = CutoverPlan::new(def_id, "orders", "orders_p", IDENTITY_MAPPING)
            .with_reverse_mapping(IDENTITY_MAPPING);
        coordinator.cutover(&plan).unwrap();

        assert!(store.table("orders_p").unwrap().is_none());
        assert_eq!(store.count("orders").unwrap(), 31);
        assert_eq!(store.count("orders_archived").unwrap(), 31);
        let engine = SyncTriggerEngine::new(&store);
        assert!(engine.is_active("orders", "orders_archived").unwrap());
        assert!(!engine.is_active("orders", "orders_p").unwrap());

        // Writes to the new live table reach the archive.
        store
            .insert("orders", Row::new().with("id", 32).with("total", 96))
            .unwrap();
        assert!(store
            .get("orders_archived", &Cursor::scalar(32))
            .unwrap()
            .is_some());

        coordinator.rollback(&plan).unwrap();
        assert!(store.table("orders_archived").unwrap().is_none());
        assert_eq!(store.count("orders").unwrap(), 32);
        assert!(engine.is_active("orders", "orders_p").unwrap());

        coordinator.cutover(&plan).unwrap();
        coordinator.drop_archive(&plan).unwrap();
        assert!(store.table("orders_archived").unwrap().is_none());
        assert!(engine.list().unwrap().is_empty());
        assert_eq!(store.count("orders").unwrap(), 32);
    }

    #[test]
    fn test_cutover_refuses_unrelated_trigger() {
        let (store, scheduler, def_id) = setup();
        scheduler.finalize(def_id).unwrap();
        store.create_table("audit", &["id"]).unwrap();
        SyncTriggerEngine::new(&store)
            .install(SyncTriggerSpec::new("orders_p", "audit", IDENTITY_MAPPING))
            .unwrap();

        let coordinator = CutoverCoordinator::new(&store).unwrap();
        let plan = CutoverPlan::new(def_id, "orders", "orders_p", IDENTITY_MAPPING);
        assert!(matches!(
            coordinator.cutover(&plan),
            Err(MigrationError::CutoverNotReady { .. })
        ));
        assert!(store.table("orders_archived").unwrap().is_none());
    }

    #[test]
    fn test_cutover_refuses_column_sync_on_swapped_table() {
        let (store, scheduler, def_id) = setup();
        scheduler.finalize(def_id).unwrap();
        SyncTriggerEngine::new(&store)
            .install_column_sync(crate::sync::ColumnSyncSpec::new("orders_p", "total", "total_v2"))
            .unwrap();

        let coordinator = CutoverCoordinator::new(&store).unwrap();
        let plan = CutoverPlan::new(def_id, "orders", "orders_p", IDENTITY_MAPPING);
        assert!(matches!(
            coordinator.cutover(&plan),
            Err(MigrationError::CutoverNotReady { .. })
        ));
        assert!(store.table("orders_p").unwrap().is_some());
    }
}
