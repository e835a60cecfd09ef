//! Core error types.

use sled::transaction::UnabortableTransactionError;
use thiserror::Error;

/// Errors raised by the table store, data transactions and sync triggers.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Key could not be built or decoded.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Table does not exist.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// Table already exists.
    #[error("table already exists: {0}")]
    TableExists(String),

    /// Table is still referenced by a sync trigger.
    #[error("table {table} is referenced by sync trigger {trigger}")]
    TableInUse {
        /// The table being dropped.
        table: String,
        /// The trigger referencing it.
        trigger: String,
    },

    /// Insert hit an existing primary key.
    #[error("duplicate key {key} in table {table}")]
    DuplicateKey {
        /// Table name.
        table: String,
        /// Rendered key.
        key: String,
    },

    /// Update or lookup of a row that does not exist.
    #[error("row {key} not found in table {table}")]
    RowNotFound {
        /// Table name.
        table: String,
        /// Rendered key.
        key: String,
    },

    /// Generic constraint violation raised by a transformation.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A row mapping rejected its input.
    #[error("mapping error: {0}")]
    Mapping(String),

    /// A sync trigger failed while mirroring a write.
    #[error("sync trigger {trigger} failed: {reason}")]
    SyncFailed {
        /// Trigger name.
        trigger: String,
        /// Underlying reason.
        reason: String,
    },

    /// A trigger references a mapping that is not registered in this process.
    #[error("row mapping not registered: {0}")]
    MappingNotRegistered(String),

    /// Trigger does not exist.
    #[error("sync trigger not found: {0}")]
    TriggerNotFound(String),

    /// Trigger definition is not acceptable.
    #[error("invalid sync trigger: {0}")]
    InvalidTrigger(String),

    /// Optimistic transaction conflict. Retried by the transaction runner.
    #[error("transaction conflict")]
    Conflict,

    /// Transient failure reported by a transformation.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Lock could not be acquired in time.
    #[error("lock timeout: {0}")]
    LockTimeout(String),
}

impl Error {
    /// Whether retrying the same work later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Conflict | Error::Transient(_) | Error::LockTimeout(_)
        )
    }
}

impl From<UnabortableTransactionError> for Error {
    fn from(err: UnabortableTransactionError) -> Self {
        match err {
            UnabortableTransactionError::Conflict => Error::Conflict,
            UnabortableTransactionError::Storage(e) => Error::Storage(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Conflict.is_transient());
        assert!(Error::LockTimeout("rows".into()).is_transient());
        assert!(Error::Transient("connection reset".into()).is_transient());
        assert!(!Error::Constraint("not null".into()).is_transient());
        assert!(!Error::Mapping("bad shape".into()).is_transient());
        assert!(!Error::TableNotFound("t".into()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = Error::SyncFailed {
            trigger: "table_sync_trigger_abc".to_string(),
            reason: "missing column".to_string(),
        };
        assert!(err.to_string().contains("table_sync_trigger_abc"));
        assert!(err.to_string().contains("missing column"));
    }
}
