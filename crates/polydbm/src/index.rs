//! Secondary index
//!
//! An `Index` stores unique (key, value) entries in an ordered DBM. Each
//! entry is one record whose key is the composite encoding of the pair and
//! whose value is empty, so a pair comparator keeps every entry of a key
//! together and sorted by value.

use crate::backend::BackendKind;
use crate::comparator::{deserialize_str_pair, serialize_str_pair, KeyComparator};
use crate::dbm::Dbm;
use crate::iterator::DbmIterator;
use crate::store::StoreDbm;
use polydbm_common::{Params, Result, Status, StatusCode};
use std::cmp::Ordering;

/// Comparator used when the params name none
pub const DEFAULT_INDEX_COMPARATOR: &str = "PairLexicalKeyComparator";

/// Set of (key, value) entries kept in pair order
#[derive(Default)]
pub struct Index {
    dbm: StoreDbm,
    comparator: KeyComparator,
}

impl Index {
    pub fn new() -> Self {
        Self {
            dbm: StoreDbm::new(),
            comparator: KeyComparator::default(),
        }
    }

    /// Open the index. An empty path keeps it in memory (BabyDBM); otherwise
    /// it is a TreeDBM file. The `dbm` param may pick another ordered class
    /// and `key_comparator` another pair comparator.
    pub fn open(&mut self, path: &str, writable: bool, params: &Params) -> Result<()> {
        let mut params = params.clone();
        let class = match params.get("dbm") {
            Some(name) => BackendKind::from_name(name)?,
            None if path.is_empty() => BackendKind::BabyTree,
            None => BackendKind::FileTree,
        };
        if !class.is_ordered() {
            return Err(Status::invalid_argument(format!(
                "{} is not an ordered database",
                class.class_name()
            )));
        }
        let comparator =
            KeyComparator::from_name(params.get_str("key_comparator", DEFAULT_INDEX_COMPARATOR))?;
        if !comparator.is_pair() {
            return Err(Status::invalid_argument(format!(
                "{} is not a pair comparator",
                comparator.name()
            )));
        }
        params.insert("dbm", class.class_name());
        params.insert("key_comparator", comparator.name());
        self.dbm.open(path, writable, &params)?;
        self.comparator = comparator;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.dbm.close()
    }

    /// Add an entry; adding an existing entry is a no-op
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.dbm.set(&serialize_str_pair(key, value), b"", true)
    }

    /// Remove an entry; NOT_FOUND_ERROR if it is absent
    pub fn remove(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.dbm.remove(&serialize_str_pair(key, value))
    }

    /// True if the entry exists
    pub fn check(&self, key: &[u8], value: &[u8]) -> bool {
        self.dbm.get(&serialize_str_pair(key, value)).is_ok()
    }

    /// Values stored under `key` in comparator order, at most `max` of them
    /// unless `max` is 0
    pub fn get_values(&self, key: &[u8], max: usize) -> Result<Vec<Vec<u8>>> {
        let base = self.comparator.base();
        let same_key = |composite: &[u8]| {
            base.compare(deserialize_str_pair(composite).0, key) == Ordering::Equal
        };
        let mut iter = self.dbm.make_iterator()?;

        // Numeric comparators can sort inner values before the empty one,
        // so walk back to the first entry of the key.
        iter.jump_lower(&serialize_str_pair(key, b""), false)?;
        loop {
            match iter.get_key() {
                Ok(composite) if same_key(&composite) => iter.previous()?,
                Ok(_) => {
                    iter.next()?;
                    break;
                }
                Err(status) if status == StatusCode::NotFoundError => {
                    iter.first()?;
                    break;
                }
                Err(status) => return Err(status),
            }
        }

        let mut values = Vec::new();
        while max == 0 || values.len() < max {
            let composite = match iter.get_key() {
                Ok(composite) => composite,
                Err(status) if status == StatusCode::NotFoundError => break,
                Err(status) => return Err(status),
            };
            if !same_key(&composite) {
                break;
            }
            values.push(deserialize_str_pair(&composite).1.to_vec());
            iter.next()?;
        }
        Ok(values)
    }

    pub fn count(&self) -> Result<i64> {
        self.dbm.count()
    }

    pub fn clear(&self) -> Result<()> {
        self.dbm.clear()
    }

    pub fn rebuild(&self) -> Result<()> {
        self.dbm.rebuild(&Params::new())
    }

    pub fn synchronize(&self, hard: bool) -> Result<()> {
        self.dbm.synchronize(hard, &Params::new())
    }

    pub fn file_path(&self) -> Result<String> {
        self.dbm.file_path()
    }

    pub fn is_open(&self) -> bool {
        self.dbm.is_open()
    }

    pub fn is_writable(&self) -> bool {
        self.dbm.is_writable()
    }

    pub fn make_iterator(&self) -> Result<IndexIterator<'_>> {
        Ok(IndexIterator {
            inner: self.dbm.make_iterator()?,
        })
    }
}

/// Cursor over index entries
pub struct IndexIterator<'a> {
    inner: Box<dyn DbmIterator + 'a>,
}

impl IndexIterator<'_> {
    pub fn first(&mut self) -> Result<()> {
        self.inner.first()
    }

    pub fn last(&mut self) -> Result<()> {
        self.inner.last()
    }

    /// Position at the entry, or the first one after it
    pub fn jump(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.jump(&serialize_str_pair(key, value))
    }

    pub fn next(&mut self) -> Result<()> {
        self.inner.next()
    }

    pub fn previous(&mut self) -> Result<()> {
        self.inner.previous()
    }

    /// Key and value of the current entry
    pub fn get(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let composite = self.inner.get_key()?;
        let (key, value) = deserialize_str_pair(&composite);
        Ok((key.to_vec(), value.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polydbm_common::{deserialize_int, serialize_int};

    fn open_memory() -> Index {
        let mut index = Index::new();
        index.open("", true, &Params::new()).unwrap();
        index
    }

    #[test]
    fn test_add_is_idempotent() {
        let index = open_memory();
        index.add(b"k", b"v").unwrap();
        index.add(b"k", b"v").unwrap();
        assert_eq!(index.count().unwrap(), 1);
        assert!(index.check(b"k", b"v"));
        assert!(!index.check(b"k", b"w"));
    }

    #[test]
    fn test_remove_absent() {
        let index = open_memory();
        let status = index.remove(b"k", b"v").unwrap_err();
        assert_eq!(status.code(), StatusCode::NotFoundError);
    }

    #[test]
    fn test_get_values_limits() {
        let index = open_memory();
        for value in ["c", "a", "b"] {
            index.add(b"key", value.as_bytes()).unwrap();
        }
        index.add(b"ke", b"z").unwrap();
        index.add(b"keyz", b"0").unwrap();
        assert_eq!(
            index.get_values(b"key", 0).unwrap(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(index.get_values(b"key", 2).unwrap().len(), 2);
        assert!(index.get_values(b"nothing", 0).unwrap().is_empty());
    }

    #[test]
    fn test_decimal_pairs() {
        let mut index = Index::new();
        index
            .open("", true, &Params::new().with("key_comparator", "PairDecimal"))
            .unwrap();
        for value in ["10", "9", "100"] {
            index.add(b"n", value.as_bytes()).unwrap();
        }
        assert_eq!(
            index.get_values(b"n", 0).unwrap(),
            vec![b"9".to_vec(), b"10".to_vec(), b"100".to_vec()]
        );
    }

    #[test]
    fn test_negative_decimal_values() {
        let mut index = Index::new();
        index
            .open("", true, &Params::new().with("key_comparator", "PairDecimal"))
            .unwrap();
        for value in ["10", "-5", "3", "-20"] {
            index.add(b"n", value.as_bytes()).unwrap();
        }
        index.add(b"7", b"-1").unwrap();
        index.add(b"9", b"1").unwrap();
        assert_eq!(
            index.get_values(b"n", 0).unwrap(),
            vec![b"-20".to_vec(), b"-5".to_vec(), b"3".to_vec(), b"10".to_vec()]
        );
        assert_eq!(index.get_values(b"n", 2).unwrap(), vec![b"-20".to_vec(), b"-5".to_vec()]);
        assert_eq!(index.get_values(b"7", 0).unwrap(), vec![b"-1".to_vec()]);
        assert_eq!(index.get_values(b"9", 0).unwrap(), vec![b"1".to_vec()]);
    }

    #[test]
    fn test_negative_big_endian_values() {
        let mut index = Index::new();
        index
            .open("", true, &Params::new().with("key_comparator", "PairSignedBigEndian"))
            .unwrap();
        let key = serialize_int(4);
        for value in [2, -7, i64::MIN] {
            index.add(&key, &serialize_int(value)).unwrap();
        }
        index.add(&serialize_int(-3), &serialize_int(-1)).unwrap();
        let values: Vec<i64> = index
            .get_values(&key, 0)
            .unwrap()
            .iter()
            .map(|v| deserialize_int(v))
            .collect();
        assert_eq!(values, vec![i64::MIN, -7, 2]);
        assert_eq!(index.get_values(&serialize_int(-3), 0).unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_unordered_or_plain() {
        let mut index = Index::new();
        let status = index.open("", true, &Params::parse("dbm=TinyDBM")).unwrap_err();
        assert_eq!(status.code(), StatusCode::InvalidArgumentError);
        let status = index
            .open("", true, &Params::parse("key_comparator=LexicalKeyComparator"))
            .unwrap_err();
        assert_eq!(status.code(), StatusCode::InvalidArgumentError);
    }

    #[test]
    fn test_iterator_both_directions() {
        let index = open_memory();
        index.add(b"a", b"1").unwrap();
        index.add(b"a", b"2").unwrap();
        index.add(b"b", b"1").unwrap();
        let mut iter = index.make_iterator().unwrap();
        iter.last().unwrap();
        assert_eq!(iter.get().unwrap(), (b"b".to_vec(), b"1".to_vec()));
        iter.previous().unwrap();
        assert_eq!(iter.get().unwrap(), (b"a".to_vec(), b"2".to_vec()));
        iter.jump(b"a", b"").unwrap();
        assert_eq!(iter.get().unwrap(), (b"a".to_vec(), b"1".to_vec()));
    }
}
