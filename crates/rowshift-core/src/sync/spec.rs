//! Declarative sync trigger definitions.

use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};
use sled::transaction::TransactionalTree;
use sled::Tree;

use crate::error::Error;
use crate::value::{Row, Value};

/// Prefix of generated trigger names.
pub const TRIGGER_NAME_PREFIX: &str = "table_sync_trigger_";

/// Prefix of generated column sync trigger names.
pub const COLUMN_TRIGGER_NAME_PREFIX: &str = "column_sync_trigger_";

/// A row-level operation a trigger can mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum SyncOperation {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

impl SyncOperation {
    /// All operations, in a stable order.
    pub const ALL: [SyncOperation; 3] = [
        SyncOperation::Insert,
        SyncOperation::Update,
        SyncOperation::Delete,
    ];

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Insert => "insert",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }

    /// Parse from a name, case insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Some(SyncOperation::Insert),
            "update" => Some(SyncOperation::Update),
            "delete" => Some(SyncOperation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic trigger name for a table pair.
pub fn trigger_name(source: &str, destination: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_bytes());
    hasher.update(&[0]);
    hasher.update(destination.as_bytes());
    let digest = hex::encode(hasher.finalize().as_bytes());
    format!("{}{}", TRIGGER_NAME_PREFIX, &digest[..12])
}

/// Deterministic trigger name for a column pair of one table.
pub fn column_trigger_name(table: &str, from: &str, to: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in [table, from, to] {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    let digest = hex::encode(hasher.finalize().as_bytes());
    format!("{}{}", COLUMN_TRIGGER_NAME_PREFIX, &digest[..12])
}

/// Request to install a sync trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncTriggerSpec {
    /// Explicit trigger name. Derived from the table pair when unset.
    pub name: Option<String>,
    /// Table whose writes are mirrored.
    pub source: String,
    /// Table receiving mirrored writes.
    pub destination: String,
    /// Registered mapping name.
    pub mapping: String,
    /// Mirrored operations.
    pub operations: Vec<SyncOperation>,
}

impl SyncTriggerSpec {
    /// Mirror every operation from `source` to `destination` through `mapping`.
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        mapping: impl Into<String>,
    ) -> Self {
        Self {
            name: None,
            source: source.into(),
            destination: destination.into(),
            mapping: mapping.into(),
            operations: SyncOperation::ALL.to_vec(),
        }
    }

    /// Set an explicit trigger name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Restrict the mirrored operations.
    pub fn with_operations(mut self, operations: &[SyncOperation]) -> Self {
        let mut ops = Vec::new();
        for op in SyncOperation::ALL {
            if operations.contains(&op) {
                ops.push(op);
            }
        }
        self.operations = ops;
        self
    }

    /// Resolved trigger name.
    pub fn resolved_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| trigger_name(&self.source, &self.destination))
    }

    pub(crate) fn into_def(self, installed_at: u64) -> SyncTriggerDef {
        SyncTriggerDef {
            name: self.resolved_name(),
            source: self.source,
            destination: self.destination,
            mapping: self.mapping,
            operations: self.operations,
            installed_at,
        }
    }
}

/// An installed sync trigger.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct SyncTriggerDef {
    /// Trigger name.
    pub name: String,
    /// Source table.
    pub source: String,
    /// Destination table.
    pub destination: String,
    /// Registered mapping name.
    pub mapping: String,
    /// Mirrored operations.
    pub operations: Vec<SyncOperation>,
    /// Installation time in microseconds.
    pub installed_at: u64,
}

impl SyncTriggerDef {
    /// Whether this trigger mirrors `op`.
    pub fn mirrors(&self, op: SyncOperation) -> bool {
        self.operations.contains(&op)
    }

    /// Same definition ignoring installation time.
    pub fn same_as(&self, other: &SyncTriggerDef) -> bool {
        self.name == other.name
            && self.source == other.source
            && self.destination == other.destination
            && self.mapping == other.mapping
            && self.operations == other.operations
    }

    /// Whether the trigger touches `table` on either side.
    pub fn involves(&self, table: &str) -> bool {
        self.source == table || self.destination == table
    }
}

/// Request to keep one column of a table equal to another on every insert
/// and update of that table.
///
/// Used while a column is renamed or retyped: writers keep using `from`
/// and the trigger fills `to` in the same write.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSyncSpec {
    /// Explicit trigger name. Derived from the table and columns when unset.
    pub name: Option<String>,
    /// Table whose writes are rewritten.
    pub table: String,
    /// Column read.
    pub from: String,
    /// Column written.
    pub to: String,
}

impl ColumnSyncSpec {
    /// Copy `from` into `to` on every write to `table`.
    pub fn new(table: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            name: None,
            table: table.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    /// Set an explicit trigger name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Resolved trigger name.
    pub fn resolved_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| column_trigger_name(&self.table, &self.from, &self.to))
    }

    pub(crate) fn into_def(self, installed_at: u64) -> ColumnSyncDef {
        ColumnSyncDef {
            name: self.resolved_name(),
            table: self.table,
            from: self.from,
            to: self.to,
            installed_at,
        }
    }
}

/// An installed column sync trigger.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ColumnSyncDef {
    /// Trigger name.
    pub name: String,
    /// Table whose writes are rewritten.
    pub table: String,
    /// Column read.
    pub from: String,
    /// Column written.
    pub to: String,
    /// Installation time in microseconds.
    pub installed_at: u64,
}

impl ColumnSyncDef {
    /// Set `to` from `from` on a row about to be written. A missing `from`
    /// writes null.
    pub fn apply(&self, row: &mut Row) {
        let value = row.get(&self.from).cloned().unwrap_or(Value::Null);
        row.set(self.to.clone(), value);
    }

    /// Same definition ignoring installation time.
    pub fn same_as(&self, other: &ColumnSyncDef) -> bool {
        self.name == other.name
            && self.table == other.table
            && self.from == other.from
            && self.to == other.to
    }
}

/// All triggers attached to one source table, stored under the source name.
#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
pub struct TriggerSet {
    /// Triggers in installation order.
    pub triggers: Vec<SyncTriggerDef>,
    /// Column sync triggers, applied before the row is written.
    pub columns: Vec<ColumnSyncDef>,
}

impl TriggerSet {
    /// Whether no trigger of either kind is left.
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty() && self.columns.is_empty()
    }

    /// Name of the first trigger of either kind.
    pub fn first_name(&self) -> Option<&str> {
        self.triggers
            .first()
            .map(|t| t.name.as_str())
            .or_else(|| self.columns.first().map(|c| c.name.as_str()))
    }
}

impl TriggerSet {
    /// Serialize to bytes using rkyv.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes using rkyv.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Load the set for `source` from the trigger tree.
    pub(crate) fn load(tree: &Tree, source: &str) -> Result<Self, Error> {
        match tree.get(source.as_bytes())? {
            Some(bytes) => Self::from_bytes(&bytes),
            None => Ok(Self::default()),
        }
    }

    /// Load the set for `source` inside a transaction.
    pub(crate) fn load_tx(tree: &TransactionalTree, source: &str) -> Result<Self, Error> {
        match tree.get(source.as_bytes())? {
            Some(bytes) => Self::from_bytes(&bytes),
            None => Ok(Self::default()),
        }
    }

    /// Store the set for `source` inside a transaction, removing it when empty.
    pub(crate) fn store_tx(&self, tree: &TransactionalTree, source: &str) -> Result<(), Error> {
        if self.is_empty() {
            tree.remove(source.as_bytes())?;
        } else {
            tree.insert(source.as_bytes(), self.to_bytes()?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_name_is_deterministic() {
        let a = trigger_name("events", "events_part");
        let b = trigger_name("events", "events_part");
        let c = trigger_name("events_part", "events");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(TRIGGER_NAME_PREFIX));
        assert_eq!(a.len(), TRIGGER_NAME_PREFIX.len() + 12);
    }

    #[test]
    fn test_spec_operations_are_normalized() {
        let spec = SyncTriggerSpec::new("a", "b", "identity")
            .with_operations(&[SyncOperation::Delete, SyncOperation::Insert]);
        assert_eq!(
            spec.operations,
            vec![SyncOperation::Insert, SyncOperation::Delete]
        );

        let def = spec.into_def(1);
        assert!(def.mirrors(SyncOperation::Insert));
        assert!(!def.mirrors(SyncOperation::Update));
        assert!(def.involves("b"));
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!(SyncOperation::parse("UPDATE"), Some(SyncOperation::Update));
        assert_eq!(SyncOperation::parse("truncate"), None);
    }

    #[test]
    fn test_trigger_set_bytes() {
        let set = TriggerSet {
            triggers: vec![SyncTriggerSpec::new("a", "b", "identity").into_def(5)],
            columns: vec![ColumnSyncSpec::new("a", "x", "y").into_def(6)],
        };
        assert_eq!(TriggerSet::from_bytes(&set.to_bytes().unwrap()).unwrap(), set);
    }

    #[test]
    fn test_column_sync_apply() {
        let def = ColumnSyncSpec::new("users", "name", "full_name").into_def(1);
        assert!(def.name.starts_with(COLUMN_TRIGGER_NAME_PREFIX));
        assert_ne!(def.name, column_trigger_name("users", "full_name", "name"));

        let mut row = Row::new().with("id", 1).with("name", "ada");
        def.apply(&mut row);
        assert_eq!(row.get("full_name"), Some(&Value::String("ada".into())));

        let mut row = Row::new().with("id", 2).with("full_name", "stale");
        def.apply(&mut row);
        assert!(row.is_null("full_name"));
    }
}
