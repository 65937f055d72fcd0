//! Striped hash back-end
//!
//! Partitions the keyspace into stripes, each behind its own RwLock, so
//! readers and writers of different stripes never contend. Multi-record
//! operations lock the stripes they touch in ascending index order.

use super::{check_writable, owner_id, Backend};
use crate::config::DEFAULT_NUM_BUCKETS;
use crate::iterator::DbmIterator;
use crate::processor::{assert_not_reentrant, invoke, invoke_boundary, Directive, ProcessOp, RecordProcessor};
use parking_lot::RwLock;
use polydbm_common::{Params, Result, Status};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tracing::debug;

/// Average records per stripe above which a rebuild is advised
const REBUILD_LOAD_FACTOR: usize = 4;

type Records = HashMap<Vec<u8>, Vec<u8>>;

/// A single stripe containing a portion of the keyspace
struct Stripe {
    data: RwLock<Records>,
}

impl Stripe {
    fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

fn new_stripes(num_stripes: usize) -> Vec<Stripe> {
    (0..num_stripes.max(1)).map(|_| Stripe::new()).collect()
}

/// Hash a key to its stripe index
#[inline]
fn stripe_index(key: &[u8], num_stripes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % num_stripes as u64) as usize
}

fn apply(records: &mut Records, key: &[u8], directive: Directive) {
    match directive {
        Directive::Keep => {}
        Directive::Set(value) => {
            records.insert(key.to_vec(), value);
        }
        Directive::Remove => {
            records.remove(key);
        }
    }
}

/// Unordered in-memory records behind striped locks
pub struct HashBackend {
    /// Outer lock is only taken for writing when the stripe count changes
    stripes: RwLock<Vec<Stripe>>,
}

impl HashBackend {
    pub fn new(num_stripes: usize) -> Self {
        Self {
            stripes: RwLock::new(new_stripes(num_stripes)),
        }
    }

    pub fn num_stripes(&self) -> usize {
        self.stripes.read().len()
    }

    /// Sorted keys of one stripe, or None past the last stripe
    fn stripe_keys(&self, index: usize) -> Option<Vec<Vec<u8>>> {
        let stripes = self.stripes.read();
        let stripe = stripes.get(index)?;
        let mut keys: Vec<Vec<u8>> = stripe.data.read().keys().cloned().collect();
        keys.sort_unstable();
        Some(keys)
    }
}

impl Default for HashBackend {
    fn default() -> Self {
        Self::new(DEFAULT_NUM_BUCKETS)
    }
}

impl Backend for HashBackend {
    fn is_ordered(&self) -> bool {
        false
    }

    fn process(&self, key: &[u8], proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let owner = owner_id(self);
        assert_not_reentrant(owner);
        let stripes = self.stripes.read();
        let stripe = &stripes[stripe_index(key, stripes.len())];
        if writable {
            let mut records = stripe.data.write();
            let directive = invoke(owner, proc, key, records.get(key).map(Vec::as_slice));
            apply(&mut records, key, directive);
        } else {
            let records = stripe.data.read();
            let directive = invoke(owner, proc, key, records.get(key).map(Vec::as_slice));
            check_writable(&directive, false)?;
        }
        Ok(())
    }

    fn process_multi(&self, ops: &mut [ProcessOp<'_>], writable: bool) -> Result<()> {
        let owner = owner_id(self);
        assert_not_reentrant(owner);
        let stripes = self.stripes.read();
        let op_stripes: Vec<usize> = ops
            .iter()
            .map(|(key, _)| stripe_index(key, stripes.len()))
            .collect();
        let mut locked = op_stripes.clone();
        locked.sort_unstable();
        locked.dedup();

        if writable {
            let mut guards: Vec<_> = locked.iter().map(|&i| stripes[i].data.write()).collect();
            for (op, stripe) in ops.iter_mut().zip(&op_stripes) {
                let key = op.0;
                let records = &mut guards[locked.partition_point(|&i| i < *stripe)];
                let directive = invoke(owner, &mut *op.1, key, records.get(key).map(Vec::as_slice));
                apply(records, key, directive);
            }
        } else {
            let guards: Vec<_> = locked.iter().map(|&i| stripes[i].data.read()).collect();
            for (op, stripe) in ops.iter_mut().zip(&op_stripes) {
                let key = op.0;
                let records = &guards[locked.partition_point(|&i| i < *stripe)];
                let directive = invoke(owner, &mut *op.1, key, records.get(key).map(Vec::as_slice));
                check_writable(&directive, false)?;
            }
        }
        Ok(())
    }

    fn process_first(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let owner = owner_id(self);
        assert_not_reentrant(owner);
        let stripes = self.stripes.read();
        for stripe in stripes.iter() {
            if writable {
                let mut records = stripe.data.write();
                let Some(key) = records.keys().min().cloned() else {
                    continue;
                };
                let directive = invoke(owner, proc, &key, records.get(&key).map(Vec::as_slice));
                apply(&mut records, &key, directive);
            } else {
                let records = stripe.data.read();
                let Some((key, value)) = records.iter().min_by(|a, b| a.0.cmp(b.0)) else {
                    continue;
                };
                let directive = invoke(owner, proc, key, Some(value.as_slice()));
                check_writable(&directive, false)?;
            }
            return Ok(());
        }
        Err(Status::not_found("no records"))
    }

    fn process_each(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let owner = owner_id(self);
        assert_not_reentrant(owner);
        let stripes = self.stripes.read();
        invoke_boundary(owner, proc);
        for stripe in stripes.iter() {
            if writable {
                stripe.data.write().retain(|key, value| {
                    match invoke(owner, proc, key, Some(value.as_slice())) {
                        Directive::Keep => true,
                        Directive::Set(new_value) => {
                            *value = new_value;
                            true
                        }
                        Directive::Remove => false,
                    }
                });
            } else {
                let records = stripe.data.read();
                for (key, value) in records.iter() {
                    let directive = invoke(owner, proc, key, Some(value.as_slice()));
                    check_writable(&directive, false)?;
                }
            }
        }
        invoke_boundary(owner, proc);
        Ok(())
    }

    fn count(&self) -> usize {
        self.stripes.read().iter().map(|s| s.data.read().len()).sum()
    }

    fn storage_bytes(&self) -> u64 {
        self.stripes
            .read()
            .iter()
            .map(|s| {
                s.data
                    .read()
                    .iter()
                    .map(|(k, v)| (k.len() + v.len()) as u64)
                    .sum::<u64>()
            })
            .sum()
    }

    fn clear(&self) {
        for stripe in self.stripes.read().iter() {
            stripe.data.write().clear();
        }
    }

    fn rebuild(&self, params: &Params) -> Result<()> {
        let mut stripes = self.stripes.write();
        let count: usize = stripes.iter().map(|s| s.data.read().len()).sum();
        let requested = params.get_i64("num_buckets", 0);
        let target = if requested > 0 {
            requested as usize
        } else {
            (count * 2).next_power_of_two().max(stripes.len())
        };
        let rebuilt = new_stripes(target);
        for stripe in stripes.drain(..) {
            for (key, value) in stripe.data.into_inner() {
                let index = stripe_index(&key, rebuilt.len());
                rebuilt[index].data.write().insert(key, value);
            }
        }
        debug!(num_records = count, num_stripes = rebuilt.len(), "Rebuilt hash stripes");
        *stripes = rebuilt;
        Ok(())
    }

    fn should_be_rebuilt(&self) -> bool {
        let stripes = self.stripes.read();
        let count: usize = stripes.iter().map(|s| s.data.read().len()).sum();
        count > stripes.len() * REBUILD_LOAD_FACTOR
    }

    fn cursor(&self) -> Box<dyn DbmIterator + '_> {
        Box::new(HashCursor {
            backend: self,
            stripe: 0,
            keys: Vec::new(),
            index: 0,
        })
    }

    fn inspect(&self) -> Vec<(String, String)> {
        vec![
            ("num_records".to_string(), self.count().to_string()),
            ("num_buckets".to_string(), self.num_stripes().to_string()),
        ]
    }
}

/// Cursor walking one stripe at a time in key order within the stripe
struct HashCursor<'a> {
    backend: &'a HashBackend,
    stripe: usize,
    /// Keys of the current stripe taken when the cursor entered it
    keys: Vec<Vec<u8>>,
    index: usize,
}

impl HashCursor<'_> {
    fn is_valid(&self) -> bool {
        self.index < self.keys.len()
    }

    fn invalidate(&mut self) {
        self.keys.clear();
        self.index = 0;
    }

    /// Move forward to the next stripe holding records if the current one
    /// is exhausted
    fn settle(&mut self) {
        while self.index >= self.keys.len() {
            self.stripe += 1;
            self.index = 0;
            match self.backend.stripe_keys(self.stripe) {
                Some(keys) => self.keys = keys,
                None => {
                    self.invalidate();
                    return;
                }
            }
        }
    }
}

impl DbmIterator for HashCursor<'_> {
    fn first(&mut self) -> Result<()> {
        self.stripe = 0;
        self.index = 0;
        self.keys = self.backend.stripe_keys(0).unwrap_or_default();
        if self.keys.is_empty() {
            self.settle();
        }
        Ok(())
    }

    fn jump(&mut self, key: &[u8]) -> Result<()> {
        self.stripe = stripe_index(key, self.backend.num_stripes());
        self.keys = self.backend.stripe_keys(self.stripe).unwrap_or_default();
        match self.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            Ok(index) => self.index = index,
            Err(_) => self.invalidate(),
        }
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if !self.is_valid() {
            return Err(Status::not_found("the cursor is not on a record"));
        }
        self.index += 1;
        self.settle();
        Ok(())
    }

    fn process(&mut self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let mut wrapper = SkipMissing {
            inner: proc,
            found: false,
        };
        while self.is_valid() {
            let key = self.keys[self.index].clone();
            self.backend.process(&key, &mut wrapper, writable)?;
            if wrapper.found {
                return Ok(());
            }
            self.index += 1;
            self.settle();
        }
        Err(Status::not_found("the cursor is not on a record"))
    }
}

/// Forwards to the inner processor only when the record exists
pub(crate) struct SkipMissing<'a> {
    pub(crate) inner: &'a mut dyn RecordProcessor,
    pub(crate) found: bool,
}

impl RecordProcessor for SkipMissing<'_> {
    fn process(&mut self, key: &[u8], value: Option<&[u8]>) -> Directive {
        match value {
            Some(value) => {
                self.found = true;
                self.inner.process(key, Some(value))
            }
            None => Directive::Keep,
        }
    }
}
