//! rowshift Core - online schema evolution on a durable table store.
//!
//! This crate provides batched background migrations, trigger-based
//! dual-write synchronization and table cutover for rowshift.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod cutover;
pub mod error;
pub mod migration;
pub mod storage;
pub mod sync;
pub mod value;

pub use cutover::{CutoverCoordinator, CutoverPlan, Readiness, DEFAULT_ARCHIVE_SUFFIX};
pub use error::Error;
pub use migration::{
    BatchContext, EngineConfig, EnqueueRequest, JobStatus, JobTracker, MigrationDefinition,
    MigrationError, MigrationJob, MigrationProgress, MigrationRegistry, MigrationStatus,
    RangeCalculator, Scheduler, TickOutcome, Transformation, TransformationRegistry, WorkerPool,
    WorkerPoolConfig,
};
pub use storage::{DataTxn, StorageConfig, TableDef, TableStore};
pub use sync::{
    ColumnMapping, ColumnSyncDef, ColumnSyncSpec, FnMapping, IdentityMapping, MappingRegistry,
    RowLookup, RowMapping, SyncOperation, SyncTriggerDef, SyncTriggerEngine, SyncTriggerSpec,
};
pub use value::{Column, Cursor, KeyRange, Row, Value};
