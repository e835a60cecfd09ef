//! Key range computation over live tables.

use std::ops::Bound;

use crate::error::Error;
use crate::storage::key::decode_row_key;
use crate::storage::{TableDef, TableStore};
use crate::value::{Cursor, KeyRange};

/// A computed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRange {
    /// Closed key interval of the batch.
    pub range: KeyRange,
    /// Keys inside the interval.
    pub count: u64,
    /// Whether keys remain after `range.max` (within the upper bound).
    pub has_more: bool,
}

/// Computes successive batch bounds by walking the ordered row index.
///
/// Only reads; the table may grow or shrink between calls.
pub struct RangeCalculator<'a> {
    store: &'a TableStore,
}

impl<'a> RangeCalculator<'a> {
    /// Create a calculator over a table store.
    pub fn new(store: &'a TableStore) -> Self {
        Self { store }
    }

    /// The smallest closed interval strictly after `after` holding at most
    /// `batch_size` existing keys, limited to keys `<= upper`.
    ///
    /// Returns `None` when no key remains.
    pub fn next_range(
        &self,
        table: &str,
        after: Option<&Cursor>,
        upper: Option<&Cursor>,
        batch_size: u64,
    ) -> Result<Option<BatchRange>, Error> {
        self.range_between(
            table,
            after.map_or(Bound::Unbounded, Bound::Excluded),
            upper.map_or(Bound::Unbounded, Bound::Included),
            batch_size,
        )
    }

    /// Like [`next_range`](Self::next_range) with explicit bounds.
    pub fn range_between(
        &self,
        table: &str,
        lower: Bound<&Cursor>,
        upper: Bound<&Cursor>,
        batch_size: u64,
    ) -> Result<Option<BatchRange>, Error> {
        if batch_size == 0 {
            return Err(Error::InvalidKey("batch size must be positive".to_string()));
        }
        let def = self.store.require_table(table)?;

        let mut keys = self.keys(&def, lower, upper, batch_size + 1)?;
        let has_more = keys.len() as u64 > batch_size;
        if has_more {
            keys.pop();
        }

        let (min, max) = match (keys.first(), keys.last()) {
            (Some(min), Some(max)) => (min.clone(), max.clone()),
            _ => return Ok(None),
        };

        Ok(Some(BatchRange {
            range: KeyRange { min, max },
            count: keys.len() as u64,
            has_more,
        }))
    }

    /// Up to `limit` keys in order between two bounds.
    pub fn next_keys(
        &self,
        table: &str,
        lower: Bound<&Cursor>,
        upper: Bound<&Cursor>,
        limit: u64,
    ) -> Result<Vec<Cursor>, Error> {
        let def = self.store.require_table(table)?;
        self.keys(&def, lower, upper, limit)
    }

    /// Current first and last key of the table.
    pub fn table_bounds(&self, table: &str) -> Result<Option<KeyRange>, Error> {
        self.store.bounds(table)
    }

    /// Number of keys inside `range`.
    pub fn count_in_range(&self, table: &str, range: &KeyRange) -> Result<u64, Error> {
        let def = self.store.require_table(table)?;
        let mut count = 0;
        for entry in self.store.row_range(
            &def,
            Bound::Included(&range.min),
            Bound::Included(&range.max),
        ) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn keys(
        &self,
        def: &TableDef,
        lower: Bound<&Cursor>,
        upper: Bound<&Cursor>,
        limit: u64,
    ) -> Result<Vec<Cursor>, Error> {
        for bound in [lower, upper] {
            if let Bound::Included(c) | Bound::Excluded(c) = bound {
                def.check_cursor(c)?;
            }
        }

        let mut keys = Vec::new();
        for entry in self.store.row_range(def, lower, upper) {
            if keys.len() as u64 >= limit {
                break;
            }
            let (key, _) = entry?;
            keys.push(decode_row_key(&key)?);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use crate::value::{Row, Value};

    fn store_with_keys(keys: impl IntoIterator<Item = i64>) -> TableStore {
        let store = TableStore::open(StorageConfig::temporary()).unwrap();
        store.create_table("t", &["id"]).unwrap();
        for id in keys {
            store.insert("t", Row::new().with("id", id)).unwrap();
        }
        store
    }

    #[test]
    fn test_walk_in_batches() {
        let store = store_with_keys(1..=250);
        let calc = RangeCalculator::new(&store);

        let first = calc.next_range("t", None, None, 100).unwrap().unwrap();
        assert_eq!(first.range, KeyRange::new(1, 100));
        assert_eq!(first.count, 100);
        assert!(first.has_more);

        let second = calc
            .next_range("t", Some(&first.range.max), None, 100)
            .unwrap()
            .unwrap();
        assert_eq!(second.range, KeyRange::new(101, 200));

        let third = calc
            .next_range("t", Some(&second.range.max), None, 100)
            .unwrap()
            .unwrap();
        assert_eq!(third.range, KeyRange::new(201, 250));
        assert_eq!(third.count, 50);
        assert!(!third.has_more);

        assert!(calc
            .next_range("t", Some(&third.range.max), None, 100)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_exact_batch_has_no_more() {
        let store = store_with_keys(1..=100);
        let calc = RangeCalculator::new(&store);
        let only = calc.next_range("t", None, None, 100).unwrap().unwrap();
        assert_eq!(only.range, KeyRange::new(1, 100));
        assert!(!only.has_more);
    }

    #[test]
    fn test_sparse_keys_and_upper_bound() {
        let store = store_with_keys([3, 10, 11, 40, 90, 1000]);
        let calc = RangeCalculator::new(&store);

        let upper = Cursor::scalar(90);
        let batch = calc
            .next_range("t", Some(&Cursor::scalar(10)), Some(&upper), 2)
            .unwrap()
            .unwrap();
        assert_eq!(batch.range, KeyRange::new(11, 40));
        assert!(batch.has_more);

        let last = calc
            .next_range("t", Some(&batch.range.max), Some(&upper), 2)
            .unwrap()
            .unwrap();
        assert_eq!(last.range, KeyRange::new(90, 90));
        assert!(!last.has_more);
    }

    #[test]
    fn test_range_between_includes_lower() {
        let store = store_with_keys(1..=10);
        let calc = RangeCalculator::new(&store);
        let batch = calc
            .range_between(
                "t",
                Bound::Included(&Cursor::scalar(4)),
                Bound::Included(&Cursor::scalar(8)),
                3,
            )
            .unwrap()
            .unwrap();
        assert_eq!(batch.range, KeyRange::new(4, 6));
        assert!(batch.has_more);
    }

    #[test]
    fn test_empty_table() {
        let store = store_with_keys([]);
        let calc = RangeCalculator::new(&store);
        assert!(calc.next_range("t", None, None, 10).unwrap().is_none());
        assert!(calc.table_bounds("t").unwrap().is_none());
    }

    #[test]
    fn test_count_and_keys() {
        let store = store_with_keys(1..=20);
        let calc = RangeCalculator::new(&store);
        assert_eq!(calc.count_in_range("t", &KeyRange::new(5, 9)).unwrap(), 5);

        let keys = calc
            .next_keys(
                "t",
                Bound::Excluded(&Cursor::scalar(5)),
                Bound::Included(&Cursor::scalar(20)),
                3,
            )
            .unwrap();
        assert_eq!(keys, vec![Cursor::scalar(6), Cursor::scalar(7), Cursor::scalar(8)]);
    }

    #[test]
    fn test_rejects_short_cursor_on_composite_key() {
        let store = TableStore::open(StorageConfig::temporary()).unwrap();
        store.create_table("c", &["tenant", "id"]).unwrap();
        store
            .insert("c", Row::new().with("tenant", "a").with("id", 1))
            .unwrap();
        let calc = RangeCalculator::new(&store);

        assert!(calc
            .next_range("c", Some(&Cursor::scalar("a")), None, 10)
            .is_err());

        let after = Cursor::new(vec![Value::from("a"), Value::Int64(0)]);
        let batch = calc.next_range("c", Some(&after), None, 10).unwrap().unwrap();
        assert_eq!(batch.range.min, Cursor::new(vec![Value::from("a"), Value::Int64(1)]));
    }
}
