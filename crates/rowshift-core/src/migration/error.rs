//! Migration-specific error types.

use sled::transaction::{
    ConflictableTransactionError, TransactionError, UnabortableTransactionError,
};
use sled::Transactional;
use thiserror::Error;

use super::registry::MigrationStatus;

/// Errors raised by the migration registry, job tracker, scheduler and
/// cutover coordinator.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Storage, table or trigger error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Migration definition not found.
    #[error("migration not found: {definition_id}")]
    MigrationNotFound {
        /// The missing definition id.
        definition_id: u64,
    },

    /// Job not found.
    #[error("job {job_id} of migration {definition_id} not found")]
    JobNotFound {
        /// Owning definition.
        definition_id: u64,
        /// The missing job id.
        job_id: u64,
    },

    /// No transformation registered under the name.
    #[error("transformation not registered: {0}")]
    TransformationNotRegistered(String),

    /// Transformation rejected its arguments.
    #[error("invalid arguments for {job_class}: {reason}")]
    InvalidArguments {
        /// Transformation name.
        job_class: String,
        /// Why the arguments were rejected.
        reason: String,
    },

    /// Definition parameters violate an invariant.
    #[error("invalid migration definition: {0}")]
    InvalidDefinition(String),

    /// Status transition not allowed from the current state.
    #[error("migration {definition_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Definition id.
        definition_id: u64,
        /// Current status.
        from: MigrationStatus,
        /// Requested status.
        to: MigrationStatus,
    },

    /// Computed ranges are inconsistent with what was already scheduled.
    #[error("range anomaly in migration {definition_id}: {message}")]
    RangeAnomaly {
        /// Definition id.
        definition_id: u64,
        /// Description of the inconsistency.
        message: String,
    },

    /// Another scheduler created the next job first.
    #[error("migration {definition_id} was scheduled concurrently")]
    ScheduleRace {
        /// Definition id.
        definition_id: u64,
    },

    /// A batch exceeded its wall-clock budget.
    #[error("batch exceeded timeout of {timeout_ms} ms")]
    BatchTimeout {
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// The definition ended in `failed`.
    #[error("migration {definition_id} failed: {reason}")]
    MigrationFailed {
        /// Definition id.
        definition_id: u64,
        /// Last recorded error.
        reason: String,
    },

    /// Cutover preconditions are not met.
    #[error("cutover of {table} not ready: {reason}")]
    CutoverNotReady {
        /// Table being cut over.
        table: String,
        /// Which signal is missing.
        reason: String,
    },

    /// The job was reclaimed by another worker; this claim is stale.
    #[error("claim on job {job_id} was superseded")]
    ClaimSuperseded {
        /// Job id.
        job_id: u64,
    },
}

impl MigrationError {
    /// Whether retrying the batch later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MigrationError::Storage(e) => e.is_transient(),
            MigrationError::BatchTimeout { .. } | MigrationError::ScheduleRace { .. } => true,
            _ => false,
        }
    }
}

impl From<sled::Error> for MigrationError {
    fn from(e: sled::Error) -> Self {
        MigrationError::Storage(crate::error::Error::Storage(e))
    }
}

impl From<UnabortableTransactionError> for MigrationError {
    fn from(e: UnabortableTransactionError) -> Self {
        MigrationError::Storage(e.into())
    }
}

/// Run a sled transaction whose closure reports [`MigrationError`].
///
/// Conflicts surfaced from nested reads are handed back to sled for retry.
pub(crate) fn run_tx<T, S, F>(trees: S, f: F) -> Result<T, MigrationError>
where
    S: Transactional<MigrationError>,
    F: Fn(&<S as Transactional<MigrationError>>::View) -> Result<T, MigrationError>,
{
    let result: Result<T, TransactionError<MigrationError>> = trees.transaction(|view| {
        f(view).map_err(|e| match e {
            MigrationError::Storage(crate::error::Error::Conflict) => {
                ConflictableTransactionError::Conflict
            }
            MigrationError::Storage(crate::error::Error::Storage(e)) => {
                ConflictableTransactionError::Storage(e)
            }
            other => ConflictableTransactionError::Abort(other),
        })
    });

    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(e.into()),
    }
}
