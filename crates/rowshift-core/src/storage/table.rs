//! Table catalog records.

use rkyv::{Archive, Deserialize, Serialize};
use sled::transaction::TransactionalTree;

use crate::error::Error;
use crate::value::{Cursor, Row};

/// A table definition stored in the catalog tree.
///
/// The storage id is the physical row prefix. Renaming a table rewrites the
/// catalog entry only; rows stay where they are.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Ordered primary key columns.
    pub key_columns: Vec<String>,
    /// Physical row prefix.
    pub storage_id: u64,
    /// Creation time in microseconds.
    pub created_at: u64,
}

impl TableDef {
    /// Leading key column, used as the batching column.
    pub fn leading_key(&self) -> &str {
        // key_columns is validated non-empty on create
        self.key_columns.first().map(String::as_str).unwrap_or("")
    }

    /// Extract the primary key cursor from a row.
    pub fn key_of(&self, row: &Row) -> Result<Cursor, Error> {
        let mut values = Vec::with_capacity(self.key_columns.len());
        for column in &self.key_columns {
            match row.get(column) {
                Some(v) if v.is_key_compatible() => values.push(v.clone()),
                Some(v) => {
                    return Err(Error::InvalidKey(format!(
                        "key column {}.{} cannot hold {}",
                        self.name,
                        column,
                        v.type_name()
                    )))
                }
                None => {
                    return Err(Error::InvalidKey(format!(
                        "row is missing key column {}.{}",
                        self.name, column
                    )))
                }
            }
        }
        Ok(Cursor::new(values))
    }

    /// Check that a cursor addresses a full primary key of this table.
    pub fn check_cursor(&self, cursor: &Cursor) -> Result<(), Error> {
        if cursor.len() != self.key_columns.len() {
            return Err(Error::InvalidKey(format!(
                "table {} has {} key columns, cursor {} has {}",
                self.name,
                self.key_columns.len(),
                cursor,
                cursor.len()
            )));
        }
        if let Some(v) = cursor.values().iter().find(|v| !v.is_key_compatible()) {
            return Err(Error::InvalidKey(format!(
                "cursor {} contains a {} component",
                cursor,
                v.type_name()
            )));
        }
        Ok(())
    }

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

    /// Load a definition inside a catalog transaction.
    pub(crate) fn load_tx(tables: &TransactionalTree, name: &str) -> Result<Option<Self>, Error> {
        match tables.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(Self::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store the definition under its current name inside a catalog transaction.
    pub(crate) fn store_tx(&self, tables: &TransactionalTree) -> Result<(), Error> {
        tables.insert(self.name.as_bytes(), self.to_bytes()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn events() -> TableDef {
        TableDef {
            name: "events".to_string(),
            key_columns: vec!["created_at".to_string(), "id".to_string()],
            storage_id: 3,
            created_at: 0,
        }
    }

    #[test]
    fn test_key_of_composite() {
        let row = Row::new()
            .with("id", 9)
            .with("created_at", Value::Timestamp(100))
            .with("payload", "x");
        let key = events().key_of(&row).unwrap();
        assert_eq!(key, Cursor::new(vec![Value::Timestamp(100), Value::Int64(9)]));
    }

    #[test]
    fn test_key_of_rejects_bad_keys() {
        let table = events();
        let missing = Row::new().with("id", 9);
        assert!(matches!(table.key_of(&missing), Err(Error::InvalidKey(_))));

        let null = Row::new().with("id", 9).with("created_at", Value::Null);
        assert!(matches!(table.key_of(&null), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_check_cursor_length() {
        let table = events();
        assert!(table.check_cursor(&Cursor::scalar(1)).is_err());
        assert!(table
            .check_cursor(&Cursor::new(vec![Value::Timestamp(1), Value::Int64(2)]))
            .is_ok());
        assert_eq!(table.leading_key(), "created_at");
    }

    #[test]
    fn test_bytes() {
        let table = events();
        assert_eq!(TableDef::from_bytes(&table.to_bytes().unwrap()).unwrap(), table);
    }
}
