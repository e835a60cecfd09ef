//! Durable registry of migration definitions.

use std::time::Duration;

use rkyv::{Archive, Deserialize, Serialize};
use sled::transaction::TransactionalTree;
use sled::{Db, Tree};

use super::error::{run_tx, MigrationError};
use crate::storage::key::{current_timestamp, encode_cursor};
use crate::value::{Cursor, KeyRange, Value};

/// Lifecycle of a migration definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// Jobs are being scheduled.
    Active,
    /// Scheduling suspended by an operator.
    Paused,
    /// Every range has been processed.
    Finished,
    /// A job failed terminally.
    Failed,
}

impl MigrationStatus {
    /// Whether the state machine allows moving to `to`.
    pub fn can_transition_to(self, to: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, to),
            (Active, Paused)
                | (Active, Finished)
                | (Active, Failed)
                | (Paused, Active)
                | (Paused, Failed)
                | (Failed, Active)
        )
    }

    /// Parse from a lowercase name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MigrationStatus::Active),
            "paused" => Some(MigrationStatus::Paused),
            "finished" => Some(MigrationStatus::Finished),
            "failed" => Some(MigrationStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Active => write!(f, "active"),
            MigrationStatus::Paused => write!(f, "paused"),
            MigrationStatus::Finished => write!(f, "finished"),
            MigrationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A batched background migration.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct MigrationDefinition {
    /// Unique id.
    pub id: u64,
    /// Registered transformation name.
    pub job_class: String,
    /// Table walked by the migration.
    pub table: String,
    /// Batching column (the table's leading key column).
    pub column: String,
    /// Transformation arguments.
    pub arguments: Vec<Value>,
    /// Key columns of the table when the migration was enqueued.
    pub key_columns: Vec<String>,
    /// Key range to cover. `None` when the table was empty.
    pub bounds: Option<KeyRange>,
    /// Keys per job.
    pub batch_size: u64,
    /// Keys per transformation call inside a job.
    pub sub_batch_size: u64,
    /// Minimum time between batch starts, in microseconds.
    pub interval_us: u64,
    /// Lifecycle status.
    pub status: MigrationStatus,
    /// Max key handed to a job so far.
    pub last_scheduled: Option<Cursor>,
    /// Max key of the contiguous prefix of succeeded jobs.
    pub completed_through: Option<Cursor>,
    /// Attempts allowed per job.
    pub max_attempts: u32,
    /// When the last batch started, for pacing.
    pub last_batch_started_at: Option<u64>,
    /// Creation time.
    pub created_at: u64,
    /// When the definition reached `finished` or `failed`.
    pub finished_at: Option<u64>,
    /// Last terminal error.
    pub error: Option<String>,
}

impl MigrationDefinition {
    /// Pacing interval.
    pub fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_us)
    }

    /// Whether the pacing interval has elapsed at `now`.
    pub fn is_due(&self, now: u64) -> bool {
        match self.last_batch_started_at {
            Some(started) => now >= started.saturating_add(self.interval_us),
            None => true,
        }
    }

    /// Identity hash over (job_class, table, column, arguments).
    pub fn identity(&self) -> [u8; 32] {
        identity_key(&self.job_class, &self.table, &self.column, &self.arguments)
    }

    /// Check the definition invariants.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.batch_size == 0 || self.sub_batch_size == 0 {
            return Err(MigrationError::InvalidDefinition(
                "batch sizes must be positive".to_string(),
            ));
        }
        if self.sub_batch_size > self.batch_size {
            return Err(MigrationError::InvalidDefinition(format!(
                "sub_batch_size {} exceeds batch_size {}",
                self.sub_batch_size, self.batch_size
            )));
        }
        if let Some(bounds) = &self.bounds {
            if !bounds.is_valid() {
                return Err(MigrationError::InvalidDefinition(format!(
                    "max_value below min_value in {}",
                    bounds
                )));
            }
        }
        Ok(())
    }

    /// Serialize to bytes using rkyv.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes using rkyv.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }

    pub(crate) fn load_tx(tree: &TransactionalTree, id: u64) -> Result<Self, MigrationError> {
        match tree.get(id.to_be_bytes())? {
            Some(bytes) => Self::from_bytes(&bytes),
            None => Err(MigrationError::MigrationNotFound { definition_id: id }),
        }
    }

    pub(crate) fn store_tx(&self, tree: &TransactionalTree) -> Result<(), MigrationError> {
        tree.insert(self.id.to_be_bytes().to_vec(), self.to_bytes()?)?;
        Ok(())
    }
}

/// Identity hash of a migration.
pub fn identity_key(job_class: &str, table: &str, column: &str, arguments: &[Value]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for part in [job_class, table, column] {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    hasher.update(&encode_cursor(&Cursor::new(arguments.to_vec())));
    *hasher.finalize().as_bytes()
}

/// Result of registering a definition.
#[derive(Debug, Clone)]
pub enum Registration {
    /// A new definition was stored.
    Created(MigrationDefinition),
    /// A definition with the same identity already existed.
    Existing(MigrationDefinition),
}

impl Registration {
    /// The effective definition.
    pub fn into_definition(self) -> MigrationDefinition {
        match self {
            Registration::Created(d) | Registration::Existing(d) => d,
        }
    }
}

/// Durable store of migration definitions.
pub struct MigrationRegistry {
    db: Db,
    definitions: Tree,
    identity: Tree,
}

impl MigrationRegistry {
    /// Tree name for definitions, keyed by big-endian id.
    pub const DEFINITIONS_TREE: &'static str = "migration:definitions";

    /// Tree name for the identity index, identity hash -> id.
    pub const IDENTITY_TREE: &'static str = "migration:identity";

    /// Open or create the registry.
    pub fn open(db: &Db) -> Result<Self, MigrationError> {
        Ok(Self {
            db: db.clone(),
            definitions: db.open_tree(Self::DEFINITIONS_TREE)?,
            identity: db.open_tree(Self::IDENTITY_TREE)?,
        })
    }

    pub(crate) fn definitions_tree(&self) -> &Tree {
        &self.definitions
    }

    /// Store a new definition, assigning its id.
    ///
    /// When a definition with the same identity exists it is returned
    /// unchanged instead.
    pub fn create(&self, mut def: MigrationDefinition) -> Result<Registration, MigrationError> {
        def.validate()?;
        def.id = self.db.generate_id()?;
        def.created_at = current_timestamp();
        let identity = def.identity();

        run_tx((&self.definitions, &self.identity), |(defs, ids)| {
            if let Some(existing) = ids.get(identity)? {
                let id = read_id(&existing)?;
                return Ok(Registration::Existing(MigrationDefinition::load_tx(defs, id)?));
            }
            ids.insert(identity.to_vec(), def.id.to_be_bytes().to_vec())?;
            def.store_tx(defs)?;
            Ok(Registration::Created(def.clone()))
        })
    }

    /// Get a definition by id.
    pub fn get(&self, id: u64) -> Result<Option<MigrationDefinition>, MigrationError> {
        match self.definitions.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(MigrationDefinition::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get a definition, failing if it does not exist.
    pub fn require(&self, id: u64) -> Result<MigrationDefinition, MigrationError> {
        self.get(id)?
            .ok_or(MigrationError::MigrationNotFound { definition_id: id })
    }

    /// Find a definition by identity.
    pub fn find(
        &self,
        job_class: &str,
        table: &str,
        column: &str,
        arguments: &[Value],
    ) -> Result<Option<MigrationDefinition>, MigrationError> {
        let identity = identity_key(job_class, table, column, arguments);
        match self.identity.get(identity)? {
            Some(bytes) => self.get(read_id(&bytes)?),
            None => Ok(None),
        }
    }

    /// All definitions in id order.
    pub fn list(&self) -> Result<Vec<MigrationDefinition>, MigrationError> {
        self.definitions
            .iter()
            .map(|entry| {
                let (_, bytes) = entry?;
                MigrationDefinition::from_bytes(&bytes)
            })
            .collect()
    }

    /// Definitions with the given status.
    pub fn list_by_status(
        &self,
        status: MigrationStatus,
    ) -> Result<Vec<MigrationDefinition>, MigrationError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|d| d.status == status)
            .collect())
    }

    /// Apply `f` to a definition atomically and return the stored result.
    pub fn modify<F>(&self, id: u64, f: F) -> Result<MigrationDefinition, MigrationError>
    where
        F: Fn(&mut MigrationDefinition) -> Result<(), MigrationError>,
    {
        run_tx(&self.definitions, |defs| {
            let mut def = MigrationDefinition::load_tx(defs, id)?;
            f(&mut def)?;
            def.store_tx(defs)?;
            Ok(def)
        })
    }

    /// Move a definition to `to`, enforcing the state machine.
    pub fn transition(
        &self,
        id: u64,
        to: MigrationStatus,
    ) -> Result<MigrationDefinition, MigrationError> {
        let def = self.modify(id, |def| {
            apply_transition(def, to)?;
            if to == MigrationStatus::Active {
                def.error = None;
            }
            Ok(())
        })?;
        tracing::info!(definition_id = id, status = %to, "migration status changed");
        Ok(def)
    }

    /// Stamp the start of a batch if the stamp is still `expected`.
    ///
    /// Returns `false` when another worker stamped first.
    pub fn try_stamp_batch(
        &self,
        id: u64,
        expected: Option<u64>,
        now: u64,
    ) -> Result<bool, MigrationError> {
        run_tx(&self.definitions, |defs| {
            let mut def = MigrationDefinition::load_tx(defs, id)?;
            if def.last_batch_started_at != expected || def.status != MigrationStatus::Active {
                return Ok(false);
            }
            def.last_batch_started_at = Some(now);
            def.store_tx(defs)?;
            Ok(true)
        })
    }

    /// Delete a definition. Active definitions cannot be deleted.
    pub fn delete(&self, id: u64) -> Result<(), MigrationError> {
        run_tx((&self.definitions, &self.identity), |(defs, ids)| {
            let def = MigrationDefinition::load_tx(defs, id)?;
            if def.status == MigrationStatus::Active {
                return Err(MigrationError::InvalidDefinition(format!(
                    "migration {} is active; pause it before deleting",
                    id
                )));
            }
            ids.remove(def.identity().to_vec())?;
            defs.remove(id.to_be_bytes().to_vec())?;
            Ok(())
        })
    }
}

/// Apply a status change in place, stamping `finished_at` on terminal states.
pub(crate) fn apply_transition(
    def: &mut MigrationDefinition,
    to: MigrationStatus,
) -> Result<(), MigrationError> {
    if !def.status.can_transition_to(to) {
        return Err(MigrationError::InvalidTransition {
            definition_id: def.id,
            from: def.status,
            to,
        });
    }
    def.status = to;
    def.finished_at = match to {
        MigrationStatus::Finished | MigrationStatus::Failed => Some(current_timestamp()),
        _ => None,
    };
    Ok(())
}

fn read_id(bytes: &[u8]) -> Result<u64, MigrationError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| MigrationError::Deserialization("identity entry is not a u64".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_definition() -> MigrationDefinition {
        MigrationDefinition {
            id: 0,
            job_class: "copy_column".to_string(),
            table: "events".to_string(),
            column: "id".to_string(),
            arguments: vec![Value::from("amount"), Value::from("amount_v2")],
            key_columns: vec!["id".to_string()],
            bounds: Some(KeyRange::new(1, 250)),
            batch_size: 100,
            sub_batch_size: 50,
            interval_us: 0,
            status: MigrationStatus::Active,
            last_scheduled: None,
            completed_through: None,
            max_attempts: 3,
            last_batch_started_at: None,
            created_at: 0,
            finished_at: None,
            error: None,
        }
    }

    fn open_registry() -> (tempfile::TempDir, MigrationRegistry) {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = sled::open(temp_dir.path()).unwrap();
        let registry = MigrationRegistry::open(&db).unwrap();
        (temp_dir, registry)
    }

    #[test]
    fn test_status_transitions() {
        use MigrationStatus::*;
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Failed.can_transition_to(Active));
        assert!(!Finished.can_transition_to(Active));
        assert!(!Finished.can_transition_to(Paused));
        assert!(!Failed.can_transition_to(Paused));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_create_is_unique_per_identity() {
        let (_dir, registry) = open_registry();

        let first = registry.create(sample_definition()).unwrap();
        let created = match first {
            Registration::Created(d) => d,
            Registration::Existing(_) => panic!("expected a new definition"),
        };

        match registry.create(sample_definition()).unwrap() {
            Registration::Existing(d) => assert_eq!(d.id, created.id),
            Registration::Created(_) => panic!("duplicate identity was stored"),
        }

        let mut other = sample_definition();
        other.arguments = vec![Value::from("amount"), Value::from("amount_v3")];
        assert!(matches!(registry.create(other).unwrap(), Registration::Created(_)));

        assert_eq!(registry.list().unwrap().len(), 2);
        let found = registry
            .find("copy_column", "events", "id", &created.arguments)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);
    }

    #[test]
    fn test_create_rejects_invalid_sizes() {
        let (_dir, registry) = open_registry();
        let mut def = sample_definition();
        def.sub_batch_size = 500;
        assert!(matches!(
            registry.create(def),
            Err(MigrationError::InvalidDefinition(_))
        ));

        let mut def = sample_definition();
        def.bounds = Some(KeyRange::new(10, 1));
        assert!(registry.create(def).is_err());
    }

    #[test]
    fn test_transition_and_delete() {
        let (_dir, registry) = open_registry();
        let def = registry.create(sample_definition()).unwrap().into_definition();

        assert!(registry.delete(def.id).is_err());

        let paused = registry.transition(def.id, MigrationStatus::Paused).unwrap();
        assert_eq!(paused.status, MigrationStatus::Paused);
        assert!(matches!(
            registry.transition(def.id, MigrationStatus::Finished),
            Err(MigrationError::InvalidTransition { .. })
        ));

        registry.delete(def.id).unwrap();
        assert!(registry.get(def.id).unwrap().is_none());
        assert!(registry
            .find("copy_column", "events", "id", &def.arguments)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_try_stamp_batch() {
        let (_dir, registry) = open_registry();
        let def = registry.create(sample_definition()).unwrap().into_definition();

        assert!(registry.try_stamp_batch(def.id, None, 10).unwrap());
        assert!(!registry.try_stamp_batch(def.id, None, 11).unwrap());
        assert!(registry.try_stamp_batch(def.id, Some(10), 12).unwrap());

        let stored = registry.require(def.id).unwrap();
        assert_eq!(stored.last_batch_started_at, Some(12));
        assert!(!stored.is_due(12));
    }
}
