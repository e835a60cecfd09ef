//! Runtime values, rows and key cursors.

use std::cmp::Ordering;
use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::Error;
use crate::storage::key::encode_cursor;

/// A single column value.
///
/// Key columns may hold any variant except `Null` and `Float64`.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit floating point.
    Float64(f64),
    /// UTF-8 string.
    String(String),
    /// Binary data.
    Bytes(Vec<u8>),
    /// Timestamp as microseconds since Unix epoch.
    Timestamp(i64),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value may appear in a primary key.
    pub fn is_key_compatible(&self) -> bool {
        !matches!(self, Value::Null | Value::Float64(_))
    }

    /// Try to get as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(i) | Value::Timestamp(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to get as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(f) => Some(*f),
            Value::Int64(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get as string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as bytes reference.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int64(_) => "int64",
            Value::Float64(_) => "float64",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
        }
    }

    /// Convert from a JSON value. Arrays and objects are not representable.
    pub fn from_json(json: &serde_json::Value) -> Option<Value> {
        match json {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Int64)
                .or_else(|| n.as_f64().map(Value::Float64)),
            serde_json::Value::String(s) => Some(Value::String(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    /// Convert to a JSON value. Bytes are hex encoded.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int64(i) | Value::Timestamp(i) => serde_json::Value::from(*i),
            Value::Float64(f) => serde_json::Value::from(*f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(hex::encode(b)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int64(i) => write!(f, "{}", i),
            Value::Float64(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "'{}'", s),
            Value::Bytes(b) => write!(f, "x'{}'", hex::encode(b)),
            Value::Timestamp(ts) => write!(f, "ts:{}", ts),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int64(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// A named column value inside a row.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column value.
    pub value: Value,
}

/// A table row: an ordered list of named columns.
#[derive(Debug, Clone, PartialEq, Default, Archive, Serialize, Deserialize)]
pub struct Row {
    columns: Vec<Column>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Get a column value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.value)
    }

    /// Set a column, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.columns.iter_mut().find(|c| c.name == name) {
            Some(column) => column.value = value,
            None => self.columns.push(Column { name, value }),
        }
    }

    /// Remove a column, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.columns.iter().position(|c| c.name == name)?;
        Some(self.columns.remove(idx).value)
    }

    /// Whether the column is absent or null.
    pub fn is_null(&self, name: &str) -> bool {
        self.get(name).map(Value::is_null).unwrap_or(true)
    }

    /// Iterate over columns in insertion order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|c| (c.name.as_str(), &c.value))
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Serialize the row to bytes using rkyv.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a row from bytes using rkyv.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Position in a (possibly composite) primary key.
///
/// Ordering is lexicographic over the tuple and agrees with the byte order
/// of the storage encoding.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct Cursor(pub Vec<Value>);

impl Cursor {
    /// Create a cursor from a tuple of values.
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Single-column cursor.
    pub fn scalar(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    /// The tuple values.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Number of key components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the cursor has no components.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The scalar integer value of a single-column cursor.
    pub fn as_i64(&self) -> Option<i64> {
        match self.0.as_slice() {
            [v] => v.as_i64(),
            _ => None,
        }
    }
}

impl Eq for Cursor {}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        encode_cursor(self).cmp(&encode_cursor(other))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{}", single),
            values => {
                write!(f, "(")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<i64> for Cursor {
    fn from(v: i64) -> Self {
        Cursor::scalar(v)
    }
}

impl From<i32> for Cursor {
    fn from(v: i32) -> Self {
        Cursor::scalar(v)
    }
}

/// Closed key interval `[min, max]`.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub min: Cursor,
    /// Inclusive upper bound.
    pub max: Cursor,
}

impl KeyRange {
    /// Create a range. Callers are expected to pass `min <= max`.
    pub fn new(min: impl Into<Cursor>, max: impl Into<Cursor>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    /// Whether the bounds are ordered.
    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }

    /// Whether a cursor falls inside the range.
    pub fn contains(&self, cursor: &Cursor) -> bool {
        &self.min <= cursor && cursor <= &self.max
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_set_replaces() {
        let mut row = Row::new().with("id", 1).with("name", "Bob");
        row.set("name", "Alice");

        assert_eq!(row.len(), 2);
        assert_eq!(row.get("name"), Some(&Value::String("Alice".into())));
        assert!(row.is_null("missing"));
        assert_eq!(row.remove("name"), Some(Value::String("Alice".into())));
        assert_eq!(row.len(), 1);
    }

    #[test]
    fn test_row_bytes() {
        let row = Row::new()
            .with("id", 7)
            .with("ratio", 0.5)
            .with("blob", vec![0u8, 1, 2])
            .with("note", Value::Null);
        let restored = Row::from_bytes(&row.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, row);
    }

    #[test]
    fn test_cursor_ordering_is_lexicographic() {
        let a = Cursor::new(vec![Value::Timestamp(10), Value::Int64(5)]);
        let b = Cursor::new(vec![Value::Timestamp(10), Value::Int64(6)]);
        let c = Cursor::new(vec![Value::Timestamp(11), Value::Int64(1)]);
        assert!(a < b);
        assert!(b < c);
        assert!(Cursor::scalar(-5) < Cursor::scalar(3));
    }

    #[test]
    fn test_key_range_contains() {
        let range = KeyRange::new(10, 20);
        assert!(range.is_valid());
        assert!(range.contains(&Cursor::scalar(10)));
        assert!(range.contains(&Cursor::scalar(20)));
        assert!(!range.contains(&Cursor::scalar(21)));
        assert_eq!(range.to_string(), "[10, 20]");
        assert!(!KeyRange::new(5, 1).is_valid());
    }

    #[test]
    fn test_json_conversion() {
        let json: serde_json::Value = serde_json::json!(["events_part", 42, null, true]);
        let values: Vec<Value> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|v| Value::from_json(v).unwrap())
            .collect();
        assert_eq!(
            values,
            vec![
                Value::String("events_part".into()),
                Value::Int64(42),
                Value::Null,
                Value::Bool(true)
            ]
        );
        assert!(Value::from_json(&serde_json::json!({"a": 1})).is_none());
        assert_eq!(Value::Int64(3).to_json(), serde_json::json!(3));
    }

    #[test]
    fn test_key_compatibility() {
        assert!(Value::Int64(1).is_key_compatible());
        assert!(Value::String("a".into()).is_key_compatible());
        assert!(!Value::Null.is_key_compatible());
        assert!(!Value::Float64(1.0).is_key_compatible());
    }
}
