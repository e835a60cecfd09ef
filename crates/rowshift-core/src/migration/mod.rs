//! Batched background migrations for rowshift.
//!
//! This module rewrites large tables while they stay online:
//! - Range calculation over the live key index
//! - Durable migration definitions and per-batch job tracking
//! - Paced scheduling with bounded retries
//! - A worker pool of cooperating threads
//!
//! # Lifecycle
//!
//! | Status | Meaning | Leaves via |
//! |--------|---------|------------|
//! | **active** | Jobs are scheduled and executed | `pause`, last job succeeds, terminal failure |
//! | **paused** | No new jobs; running ones complete | `resume`, `finalize` |
//! | **finished** | Every range processed | `extend_max_value` |
//! | **failed** | A job failed terminally or a range was inconsistent | `retry_failed` |
//!
//! # Example
//!
//! ```ignore
//! use rowshift_core::migration::{EngineConfig, EnqueueRequest, Scheduler, TransformationRegistry};
//!
//! let scheduler = Scheduler::new(store, Arc::new(TransformationRegistry::with_builtins()), EngineConfig::default())?;
//!
//! let def = scheduler.enqueue(
//!     EnqueueRequest::new("copy_column", "events", "id")
//!         .with_arguments(vec!["amount".into(), "amount_v2".into()]),
//! )?;
//!
//! // Either let a worker pool pick it up, or drive it inline.
//! scheduler.finalize(def.id)?;
//! ```

pub mod config;
pub mod error;
pub mod range;
pub mod registry;
pub mod scheduler;
pub mod tracker;
pub mod transform;
pub mod worker;

pub use config::{EngineConfig, WorkerPoolConfig};
pub use error::MigrationError;
pub use range::{BatchRange, RangeCalculator};
pub use registry::{
    identity_key, MigrationDefinition, MigrationRegistry, MigrationStatus, Registration,
};
pub use scheduler::{EnqueueRequest, MigrationProgress, Scheduler, TickOutcome};
pub use tracker::{
    JobCounts, JobKey, JobOutcome, JobStatus, JobTracker, MigrationJob, Recorded,
};
pub use transform::{
    BatchContext, CopyColumn, CopyRows, FillColumn, Transformation, TransformationRegistry,
};
pub use worker::WorkerPool;
