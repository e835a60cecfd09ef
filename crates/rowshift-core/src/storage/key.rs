//! Order-preserving key encoding for table rows.
//!
//! Row key format: `[storage_id (8 bytes, big-endian)][encoded cursor]`
//!
//! Each cursor component is written as a one-byte type tag followed by a
//! payload whose byte order matches the value order, so a sled range scan
//! over encoded keys visits rows in primary-key order.

use crate::error::Error;
use crate::value::{Cursor, Value};

/// Size of the table storage id prefix in bytes.
pub const TABLE_PREFIX_SIZE: usize = 8;

const TAG_NULL: u8 = 0x01;
const TAG_FALSE: u8 = 0x02;
const TAG_TRUE: u8 = 0x03;
const TAG_INT: u8 = 0x10;
const TAG_TIMESTAMP: u8 = 0x11;
const TAG_FLOAT: u8 = 0x12;
const TAG_STRING: u8 = 0x20;
const TAG_BYTES: u8 = 0x21;

const SIGN_BIT: u64 = 1 << 63;

/// Encode a cursor into its order-preserving byte form.
pub fn encode_cursor(cursor: &Cursor) -> Vec<u8> {
    let mut buf = Vec::with_capacity(cursor.len() * 9);
    for value in cursor.values() {
        encode_value(value, &mut buf);
    }
    buf
}

fn encode_value(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(false) => buf.push(TAG_FALSE),
        Value::Bool(true) => buf.push(TAG_TRUE),
        Value::Int64(i) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&((*i as u64) ^ SIGN_BIT).to_be_bytes());
        }
        Value::Timestamp(ts) => {
            buf.push(TAG_TIMESTAMP);
            buf.extend_from_slice(&((*ts as u64) ^ SIGN_BIT).to_be_bytes());
        }
        Value::Float64(f) => {
            buf.push(TAG_FLOAT);
            let bits = f.to_bits();
            let ordered = if bits & SIGN_BIT != 0 {
                !bits
            } else {
                bits ^ SIGN_BIT
            };
            buf.extend_from_slice(&ordered.to_be_bytes());
        }
        Value::String(s) => {
            buf.push(TAG_STRING);
            encode_escaped(s.as_bytes(), buf);
        }
        Value::Bytes(b) => {
            buf.push(TAG_BYTES);
            encode_escaped(b, buf);
        }
    }
}

// 0x00 becomes 0x00 0xFF; the terminator 0x00 0x00 sorts before any continuation.
fn encode_escaped(bytes: &[u8], buf: &mut Vec<u8>) {
    for &b in bytes {
        buf.push(b);
        if b == 0x00 {
            buf.push(0xFF);
        }
    }
    buf.push(0x00);
    buf.push(0x00);
}

/// Decode a cursor from its encoded form.
pub fn decode_cursor(mut bytes: &[u8]) -> Result<Cursor, Error> {
    let mut values = Vec::new();
    while !bytes.is_empty() {
        let (value, rest) = decode_value(bytes)?;
        values.push(value);
        bytes = rest;
    }
    Ok(Cursor::new(values))
}

fn decode_value(bytes: &[u8]) -> Result<(Value, &[u8]), Error> {
    let (&tag, rest) = bytes
        .split_first()
        .ok_or_else(|| Error::InvalidKey("empty key component".to_string()))?;

    match tag {
        TAG_NULL => Ok((Value::Null, rest)),
        TAG_FALSE => Ok((Value::Bool(false), rest)),
        TAG_TRUE => Ok((Value::Bool(true), rest)),
        TAG_INT | TAG_TIMESTAMP | TAG_FLOAT => {
            if rest.len() < 8 {
                return Err(Error::InvalidKey("truncated numeric component".to_string()));
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&rest[..8]);
            let ordered = u64::from_be_bytes(raw);
            let value = match tag {
                TAG_INT => Value::Int64((ordered ^ SIGN_BIT) as i64),
                TAG_TIMESTAMP => Value::Timestamp((ordered ^ SIGN_BIT) as i64),
                _ => {
                    let bits = if ordered & SIGN_BIT != 0 {
                        ordered ^ SIGN_BIT
                    } else {
                        !ordered
                    };
                    Value::Float64(f64::from_bits(bits))
                }
            };
            Ok((value, &rest[8..]))
        }
        TAG_STRING | TAG_BYTES => {
            let (raw, rest) = decode_escaped(rest)?;
            let value = if tag == TAG_STRING {
                Value::String(
                    String::from_utf8(raw)
                        .map_err(|e| Error::InvalidKey(format!("invalid utf-8: {}", e)))?,
                )
            } else {
                Value::Bytes(raw)
            };
            Ok((value, rest))
        }
        other => Err(Error::InvalidKey(format!("unknown type tag {:#04x}", other))),
    }
}

fn decode_escaped(bytes: &[u8]) -> Result<(Vec<u8>, &[u8]), Error> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b != 0x00 {
            out.push(b);
            i += 1;
            continue;
        }
        match bytes.get(i + 1) {
            Some(0x00) => return Ok((out, &bytes[i + 2..])),
            Some(0xFF) => {
                out.push(0x00);
                i += 2;
            }
            _ => break,
        }
    }
    Err(Error::InvalidKey("unterminated string component".to_string()))
}

/// Encode the full storage key of a row.
pub fn row_key(storage_id: u64, cursor: &Cursor) -> Vec<u8> {
    let mut key = table_prefix(storage_id).to_vec();
    key.extend_from_slice(&encode_cursor(cursor));
    key
}

/// Split a storage key back into its cursor.
pub fn decode_row_key(key: &[u8]) -> Result<Cursor, Error> {
    if key.len() < TABLE_PREFIX_SIZE {
        return Err(Error::InvalidKey("row key shorter than table prefix".to_string()));
    }
    decode_cursor(&key[TABLE_PREFIX_SIZE..])
}

/// Prefix shared by every row of a table.
pub fn table_prefix(storage_id: u64) -> [u8; TABLE_PREFIX_SIZE] {
    storage_id.to_be_bytes()
}

/// First key past every row of a table.
pub fn table_prefix_end(storage_id: u64) -> [u8; TABLE_PREFIX_SIZE] {
    (storage_id + 1).to_be_bytes()
}

/// Get current timestamp in microseconds since Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(values: Vec<Value>) -> Vec<u8> {
        encode_cursor(&Cursor::new(values))
    }

    #[test]
    fn test_integer_ordering() {
        let keys: Vec<_> = [i64::MIN, -100, -1, 0, 1, 250, i64::MAX]
            .iter()
            .map(|i| enc(vec![Value::Int64(*i)]))
            .collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_float_ordering() {
        let keys: Vec<_> = [f64::NEG_INFINITY, -2.5, -0.0, 0.0, 1.5, f64::INFINITY]
            .iter()
            .map(|f| enc(vec![Value::Float64(*f)]))
            .collect();
        for pair in keys.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        let decoded = decode_cursor(&enc(vec![Value::Float64(-2.5)])).unwrap();
        assert_eq!(decoded, Cursor::new(vec![Value::Float64(-2.5)]));
    }

    #[test]
    fn test_string_prefix_ordering() {
        // "ab" < "ab\0" < "abc" must hold despite the escape bytes.
        let a = enc(vec![Value::from("ab"), Value::Int64(9)]);
        let b = enc(vec![Value::from("ab\0"), Value::Int64(0)]);
        let c = enc(vec![Value::from("abc"), Value::Int64(0)]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_composite_decode() {
        let cursor = Cursor::new(vec![
            Value::Timestamp(1_700_000_000_000_000),
            Value::from("tenant\0x"),
            Value::Bytes(vec![0, 0, 1]),
            Value::Bool(true),
        ]);
        let key = row_key(42, &cursor);
        assert_eq!(&key[..TABLE_PREFIX_SIZE], &table_prefix(42));
        assert_eq!(decode_row_key(&key).unwrap(), cursor);
    }

    #[test]
    fn test_table_prefix_bounds() {
        let key = row_key(7, &Cursor::scalar(i64::MAX));
        assert!(key.as_slice() < table_prefix_end(7).as_slice());
        assert!(key.as_slice() > table_prefix(7).as_slice());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_cursor(&[0x7F]).is_err());
        assert!(decode_cursor(&[TAG_INT, 0, 1]).is_err());
        assert!(decode_cursor(&[TAG_STRING, b'a', b'b']).is_err());
        assert!(decode_row_key(&[1, 2]).is_err());
    }
}
