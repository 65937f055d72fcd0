//! Ordered back-end
//!
//! Records live in a single `BTreeMap` ordered by the configured key
//! comparator. One RwLock covers the whole map, which makes multi-record
//! operations and full traversals trivially atomic.

use super::{check_writable, owner_id, Backend};
use crate::comparator::KeyComparator;
use crate::iterator::DbmIterator;
use crate::processor::{assert_not_reentrant, invoke, invoke_boundary, Directive, ProcessOp, RecordProcessor};
use parking_lot::RwLock;
use polydbm_common::{Params, Result, Status};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Key wrapper ordered by a comparator instead of raw bytes
#[derive(Debug, Clone)]
struct OrdKey {
    data: Vec<u8>,
    comparator: KeyComparator,
}

impl PartialEq for OrdKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrdKey {}

impl PartialOrd for OrdKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparator.compare(&self.data, &other.data)
    }
}

type Records = BTreeMap<OrdKey, Vec<u8>>;

fn apply(records: &mut Records, key: OrdKey, directive: Directive) {
    match directive {
        Directive::Keep => {}
        Directive::Set(value) => {
            records.insert(key, value);
        }
        Directive::Remove => {
            records.remove(&key);
        }
    }
}

/// Ordered in-memory records
pub struct TreeBackend {
    cmp: KeyComparator,
    records: RwLock<Records>,
}

impl TreeBackend {
    pub fn new(cmp: KeyComparator) -> Self {
        Self {
            cmp,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn comparator(&self) -> KeyComparator {
        self.cmp
    }

    fn probe(&self, key: &[u8]) -> OrdKey {
        OrdKey {
            data: key.to_vec(),
            comparator: self.cmp,
        }
    }

    /// Key found by a range query around `key`
    fn seek(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>, backward: bool) -> Option<Vec<u8>> {
        let lower = lower.map(|k| self.probe(k));
        let upper = upper.map(|k| self.probe(k));
        let records = self.records.read();
        let mut range = records.range((lower, upper));
        let found = if backward { range.next_back() } else { range.next() };
        found.map(|(key, _)| key.data.clone())
    }

    fn process_locked(
        &self,
        records: &mut Records,
        key: &[u8],
        proc: &mut dyn RecordProcessor,
    ) {
        let probe = self.probe(key);
        let directive = invoke(owner_id(self), proc, key, records.get(&probe).map(Vec::as_slice));
        apply(records, probe, directive);
    }
}

impl Backend for TreeBackend {
    fn is_ordered(&self) -> bool {
        true
    }

    fn process(&self, key: &[u8], proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let owner = owner_id(self);
        assert_not_reentrant(owner);
        if writable {
            self.process_locked(&mut self.records.write(), key, proc);
        } else {
            let records = self.records.read();
            let value = records.get(&self.probe(key)).map(Vec::as_slice);
            check_writable(&invoke(owner, proc, key, value), false)?;
        }
        Ok(())
    }

    fn process_multi(&self, ops: &mut [ProcessOp<'_>], writable: bool) -> Result<()> {
        let owner = owner_id(self);
        assert_not_reentrant(owner);
        if writable {
            let mut records = self.records.write();
            for op in ops.iter_mut() {
                self.process_locked(&mut records, op.0, &mut *op.1);
            }
        } else {
            let records = self.records.read();
            for op in ops.iter_mut() {
                let value = records.get(&self.probe(op.0)).map(Vec::as_slice);
                check_writable(&invoke(owner, &mut *op.1, op.0, value), false)?;
            }
        }
        Ok(())
    }

    fn process_first(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let owner = owner_id(self);
        assert_not_reentrant(owner);
        if writable {
            let mut records = self.records.write();
            let Some(key) = records.keys().next().map(|k| k.data.clone()) else {
                return Err(Status::not_found("no records"));
            };
            self.process_locked(&mut records, &key, proc);
        } else {
            let records = self.records.read();
            let Some((key, value)) = records.iter().next() else {
                return Err(Status::not_found("no records"));
            };
            check_writable(&invoke(owner, proc, &key.data, Some(value.as_slice())), false)?;
        }
        Ok(())
    }

    fn process_each(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let owner = owner_id(self);
        assert_not_reentrant(owner);
        if writable {
            let mut records = self.records.write();
            invoke_boundary(owner, proc);
            records.retain(|key, value| match invoke(owner, proc, &key.data, Some(value.as_slice())) {
                Directive::Keep => true,
                Directive::Set(new_value) => {
                    *value = new_value;
                    true
                }
                Directive::Remove => false,
            });
            invoke_boundary(owner, proc);
        } else {
            let records = self.records.read();
            invoke_boundary(owner, proc);
            for (key, value) in records.iter() {
                check_writable(&invoke(owner, proc, &key.data, Some(value.as_slice())), false)?;
            }
            invoke_boundary(owner, proc);
        }
        Ok(())
    }

    fn count(&self) -> usize {
        self.records.read().len()
    }

    fn storage_bytes(&self) -> u64 {
        self.records
            .read()
            .iter()
            .map(|(k, v)| (k.data.len() + v.len()) as u64)
            .sum()
    }

    fn clear(&self) {
        self.records.write().clear();
    }

    fn rebuild(&self, _params: &Params) -> Result<()> {
        Ok(())
    }

    fn should_be_rebuilt(&self) -> bool {
        false
    }

    fn cursor(&self) -> Box<dyn DbmIterator + '_> {
        Box::new(TreeCursor {
            backend: self,
            pos: None,
        })
    }

    fn inspect(&self) -> Vec<(String, String)> {
        vec![
            ("num_records".to_string(), self.count().to_string()),
            ("key_comparator".to_string(), self.cmp.name().to_string()),
        ]
    }
}

/// Cursor remembering the key it stands on
struct TreeCursor<'a> {
    backend: &'a TreeBackend,
    pos: Option<Vec<u8>>,
}

impl TreeCursor<'_> {
    fn current(&self) -> Result<&[u8]> {
        self.pos
            .as_deref()
            .ok_or_else(|| Status::not_found("the cursor is not on a record"))
    }
}

impl DbmIterator for TreeCursor<'_> {
    fn first(&mut self) -> Result<()> {
        self.pos = self.backend.seek(Bound::Unbounded, Bound::Unbounded, false);
        Ok(())
    }

    fn last(&mut self) -> Result<()> {
        self.pos = self.backend.seek(Bound::Unbounded, Bound::Unbounded, true);
        Ok(())
    }

    fn jump(&mut self, key: &[u8]) -> Result<()> {
        self.pos = self.backend.seek(Bound::Included(key), Bound::Unbounded, false);
        Ok(())
    }

    fn jump_lower(&mut self, key: &[u8], inclusive: bool) -> Result<()> {
        let upper = if inclusive { Bound::Included(key) } else { Bound::Excluded(key) };
        self.pos = self.backend.seek(Bound::Unbounded, upper, true);
        Ok(())
    }

    fn jump_upper(&mut self, key: &[u8], inclusive: bool) -> Result<()> {
        let lower = if inclusive { Bound::Included(key) } else { Bound::Excluded(key) };
        self.pos = self.backend.seek(lower, Bound::Unbounded, false);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        let current = self.current()?;
        self.pos = self.backend.seek(Bound::Excluded(current), Bound::Unbounded, false);
        Ok(())
    }

    fn previous(&mut self) -> Result<()> {
        let current = self.current()?;
        self.pos = self.backend.seek(Bound::Unbounded, Bound::Excluded(current), true);
        Ok(())
    }

    fn process(&mut self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let backend = self.backend;
        let owner = owner_id(backend);
        assert_not_reentrant(owner);
        let probe = backend.probe(self.current()?);
        let bounds = (Bound::Included(probe), Bound::Unbounded);
        if writable {
            let mut records = backend.records.write();
            let Some(key) = records.range(bounds).next().map(|(k, _)| k.clone()) else {
                self.pos = None;
                return Err(Status::not_found("the cursor is not on a record"));
            };
            let directive = invoke(owner, proc, &key.data, records.get(&key).map(Vec::as_slice));
            self.pos = Some(key.data.clone());
            apply(&mut records, key, directive);
        } else {
            let records = backend.records.read();
            let Some((key, value)) = records.range(bounds).next() else {
                self.pos = None;
                return Err(Status::not_found("the cursor is not on a record"));
            };
            self.pos = Some(key.data.clone());
            check_writable(&invoke(owner, proc, &key.data, Some(value.as_slice())), false)?;
        }
        Ok(())
    }
}
