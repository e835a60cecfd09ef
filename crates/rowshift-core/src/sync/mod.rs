//! Trigger-based dual-write synchronization.
//!
//! A sync trigger mirrors every insert, update and delete on a source table
//! into a destination table through a named [`RowMapping`], inside the
//! writer's own transaction. A column sync trigger keeps one column of a
//! table equal to another while that column is renamed or retyped.

mod engine;
mod mapping;
mod spec;

pub use engine::SyncTriggerEngine;
pub(crate) use engine::{install_tx, remove_tx};
pub use mapping::{
    ColumnMapping, FnMapping, IdentityMapping, MappingRegistry, RowLookup, RowMapping,
    IDENTITY_MAPPING,
};
pub use spec::{
    column_trigger_name, trigger_name, ColumnSyncDef, ColumnSyncSpec, SyncOperation,
    SyncTriggerDef, SyncTriggerSpec, TriggerSet,
};
