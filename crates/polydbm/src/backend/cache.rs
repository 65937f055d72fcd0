//! LRU cache back-end
//!
//! Bounded by record count and optionally by memory footprint. Each access
//! through `process` refreshes a record's recency; traversals and cursors
//! leave recency alone. Iteration runs from the least to the most recently
//! used record.

use super::{check_writable, owner_id, Backend};
use crate::iterator::DbmIterator;
use crate::processor::{assert_not_reentrant, invoke, invoke_boundary, Directive, ProcessOp, RecordProcessor};
use parking_lot::Mutex;
use polydbm_common::{Params, Result, Status};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use tracing::trace;

struct CacheState {
    /// key -> (value, recency tick)
    records: HashMap<Vec<u8>, (Vec<u8>, u64)>,
    /// recency tick -> key, oldest first
    recency: BTreeMap<u64, Vec<u8>>,
    tick: u64,
    mem_size: usize,
    cap_rec_num: usize,
    /// 0 means unbounded
    cap_mem_size: usize,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn value(&self, key: &[u8]) -> Option<&[u8]> {
        self.records.get(key).map(|(value, _)| value.as_slice())
    }

    fn touch(&mut self, key: &[u8]) {
        let tick = self.next_tick();
        if let Some(entry) = self.records.get_mut(key) {
            let old = std::mem::replace(&mut entry.1, tick);
            if let Some(key) = self.recency.remove(&old) {
                self.recency.insert(tick, key);
            }
        }
    }

    fn remove(&mut self, key: &[u8]) {
        if let Some((value, tick)) = self.records.remove(key) {
            self.recency.remove(&tick);
            self.mem_size -= key.len() + value.len();
        }
    }

    /// Apply a directive; `touch` refreshes recency of kept records
    fn apply(&mut self, key: &[u8], directive: Directive, touch: bool) {
        match directive {
            Directive::Keep => {
                if touch {
                    self.touch(key);
                }
            }
            Directive::Set(value) => {
                self.remove(key);
                let tick = self.next_tick();
                self.mem_size += key.len() + value.len();
                self.records.insert(key.to_vec(), (value, tick));
                self.recency.insert(tick, key.to_vec());
            }
            Directive::Remove => self.remove(key),
        }
    }

    fn over_capacity(&self) -> bool {
        self.records.len() > self.cap_rec_num
            || (self.cap_mem_size > 0 && self.mem_size > self.cap_mem_size)
    }

    fn evict(&mut self) {
        while self.over_capacity() {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            if let Some((value, _)) = self.records.remove(&key) {
                self.mem_size -= key.len() + value.len();
            }
            trace!(key_len = key.len(), "Evicted cache record");
        }
    }

    fn clear(&mut self) {
        self.records.clear();
        self.recency.clear();
        self.mem_size = 0;
    }
}

/// Size-bounded in-memory records with LRU eviction
pub struct CacheBackend {
    state: Mutex<CacheState>,
}

impl CacheBackend {
    pub fn new(cap_rec_num: usize, cap_mem_size: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                records: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
                mem_size: 0,
                cap_rec_num: cap_rec_num.max(1),
                cap_mem_size,
            }),
        }
    }

    /// Bytes of keys and values currently held
    pub fn mem_size(&self) -> usize {
        self.state.lock().mem_size
    }

    /// Key at the first recency tick in range
    fn seek(&self, lower: Bound<u64>) -> Option<u64> {
        let state = self.state.lock();
        let found = state.recency.range((lower, Bound::Unbounded)).next();
        found.map(|(tick, _)| *tick)
    }
}

impl Backend for CacheBackend {
    fn is_ordered(&self) -> bool {
        false
    }

    fn process(&self, key: &[u8], proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let owner = owner_id(self);
        assert_not_reentrant(owner);
        let mut state = self.state.lock();
        let directive = invoke(owner, proc, key, state.value(key));
        check_writable(&directive, writable)?;
        state.apply(key, directive, true);
        state.evict();
        Ok(())
    }

    fn process_multi(&self, ops: &mut [ProcessOp<'_>], writable: bool) -> Result<()> {
        let owner = owner_id(self);
        assert_not_reentrant(owner);
        let mut state = self.state.lock();
        for op in ops.iter_mut() {
            let directive = invoke(owner, &mut *op.1, op.0, state.value(op.0));
            check_writable(&directive, writable)?;
            state.apply(op.0, directive, true);
        }
        state.evict();
        Ok(())
    }

    fn process_first(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let owner = owner_id(self);
        assert_not_reentrant(owner);
        let mut state = self.state.lock();
        let Some(key) = state.recency.values().next().cloned() else {
            return Err(Status::not_found("no records"));
        };
        let directive = invoke(owner, proc, &key, state.value(&key));
        check_writable(&directive, writable)?;
        state.apply(&key, directive, false);
        Ok(())
    }

    fn process_each(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let owner = owner_id(self);
        assert_not_reentrant(owner);
        let mut state = self.state.lock();
        invoke_boundary(owner, proc);
        let keys: Vec<Vec<u8>> = state.recency.values().cloned().collect();
        for key in keys {
            let directive = invoke(owner, proc, &key, state.value(&key));
            check_writable(&directive, writable)?;
            state.apply(&key, directive, false);
        }
        invoke_boundary(owner, proc);
        state.evict();
        Ok(())
    }

    fn count(&self) -> usize {
        self.state.lock().records.len()
    }

    fn storage_bytes(&self) -> u64 {
        self.mem_size() as u64
    }

    fn clear(&self) {
        self.state.lock().clear();
    }

    fn rebuild(&self, params: &Params) -> Result<()> {
        let mut state = self.state.lock();
        let cap_rec_num = params.get_i64("cap_rec_num", 0);
        if cap_rec_num > 0 {
            state.cap_rec_num = cap_rec_num as usize;
        }
        let cap_mem_size = params.get_i64("cap_mem_size", 0);
        if cap_mem_size > 0 {
            state.cap_mem_size = cap_mem_size as usize;
        }
        state.evict();
        Ok(())
    }

    fn should_be_rebuilt(&self) -> bool {
        false
    }

    fn cursor(&self) -> Box<dyn DbmIterator + '_> {
        Box::new(CacheCursor {
            backend: self,
            pos: None,
        })
    }

    fn inspect(&self) -> Vec<(String, String)> {
        let state = self.state.lock();
        vec![
            ("num_records".to_string(), state.records.len().to_string()),
            ("mem_size".to_string(), state.mem_size.to_string()),
            ("cap_rec_num".to_string(), state.cap_rec_num.to_string()),
            ("cap_mem_size".to_string(), state.cap_mem_size.to_string()),
        ]
    }
}

/// Cursor following recency ticks from the oldest record
struct CacheCursor<'a> {
    backend: &'a CacheBackend,
    pos: Option<u64>,
}

impl DbmIterator for CacheCursor<'_> {
    fn first(&mut self) -> Result<()> {
        self.pos = self.backend.seek(Bound::Unbounded);
        Ok(())
    }

    fn jump(&mut self, key: &[u8]) -> Result<()> {
        self.pos = self.backend.state.lock().records.get(key).map(|(_, tick)| *tick);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        let tick = self
            .pos
            .ok_or_else(|| Status::not_found("the cursor is not on a record"))?;
        self.pos = self.backend.seek(Bound::Excluded(tick));
        Ok(())
    }

    fn process(&mut self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let owner = owner_id(self.backend);
        assert_not_reentrant(owner);
        let tick = self
            .pos
            .ok_or_else(|| Status::not_found("the cursor is not on a record"))?;
        let mut state = self.backend.state.lock();
        let found = state
            .recency
            .range(tick..)
            .next()
            .map(|(tick, key)| (*tick, key.clone()));
        let Some((tick, key)) = found else {
            self.pos = None;
            return Err(Status::not_found("the cursor is not on a record"));
        };
        self.pos = Some(tick);
        let directive = invoke(owner, proc, &key, state.value(&key));
        check_writable(&directive, writable)?;
        state.apply(&key, directive, false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::GetProcessor;

    fn set(backend: &CacheBackend, key: &[u8], value: &[u8]) {
        let value = value.to_vec();
        backend
            .process(
                key,
                &mut |_: &[u8], _: Option<&[u8]>| Directive::Set(value.clone()),
                true,
            )
            .unwrap();
    }

    fn contains(backend: &CacheBackend, key: &[u8]) -> bool {
        let mut proc = GetProcessor::default();
        backend.process(key, &mut proc, false).unwrap();
        proc.value.is_some()
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let backend = CacheBackend::new(3, 0);
        set(&backend, b"a", b"1");
        set(&backend, b"b", b"2");
        set(&backend, b"c", b"3");
        assert!(contains(&backend, b"a"));
        set(&backend, b"d", b"4");
        assert_eq!(backend.count(), 3);
        assert!(!contains(&backend, b"b"));
        assert!(contains(&backend, b"a"));
        assert!(contains(&backend, b"d"));
    }

    #[test]
    fn test_memory_cap() {
        let backend = CacheBackend::new(100, 10);
        set(&backend, b"a", b"1234");
        set(&backend, b"b", b"1234");
        assert_eq!(backend.mem_size(), 10);
        set(&backend, b"c", b"1");
        assert_eq!(backend.count(), 2);
        assert!(!contains(&backend, b"a"));
    }

    #[test]
    fn test_cursor_runs_oldest_first() {
        let backend = CacheBackend::new(10, 0);
        set(&backend, b"x", b"1");
        set(&backend, b"y", b"2");
        let mut cursor = backend.cursor();
        cursor.first().unwrap();
        assert_eq!(cursor.step().unwrap().0, b"x");
        assert_eq!(cursor.step().unwrap().0, b"y");
        assert!(cursor.get().is_err());
    }
}
