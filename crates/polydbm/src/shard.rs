//! Sharded DBM
//!
//! `ShardDbm` spreads records over a fixed array of `StoreDbm` shards,
//! chosen by the CRC32 of the key. Shard `i` of `n` lives at
//! `{path}-{i:05}-of-{n:05}`.
//!
//! Single-shard operations take the handle lock shared; operations that
//! span shards take it exclusively, which keeps `process_multi` atomic
//! without a cross-shard lock order.

use crate::backend::{owner_id, BackendKind};
use crate::comparator::KeyComparator;
use crate::config::OpenConfig;
use crate::dbm::Dbm;
use crate::iterator::DbmIterator;
use crate::processor::{
    assert_not_reentrant, invoke_boundary, Directive, ProcessOp, ProcessorGuard, RecordProcessor,
};
use crate::store::StoreDbm;
use parking_lot::RwLock;
use polydbm_common::{Params, Result, Status, StatusCode};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;
use tracing::{info, warn};

/// Name of shard `index` out of `num_shards`
pub fn shard_path(path: &str, index: usize, num_shards: usize) -> String {
    if path.is_empty() {
        return String::new();
    }
    format!("{}-{:05}-of-{:05}", path, index, num_shards)
}

/// Shard count of an existing family at `path`, or 0 if there is none
pub fn detect_num_shards(path: &str) -> usize {
    if path.is_empty() {
        return 0;
    }
    let path = Path::new(path);
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return 0;
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let prefix = format!("{}-00000-of-", name);
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let file_name = entry.file_name();
            let suffix = file_name.to_str()?.strip_prefix(&prefix)?.to_string();
            if suffix.len() != 5 {
                return None;
            }
            suffix.parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

fn shard_index(key: &[u8], num_shards: usize) -> usize {
    crc32fast::hash(key) as usize % num_shards
}

fn not_open() -> Status {
    Status::precondition("the database is not open")
}

/// Hides the traversal boundary from each shard so the caller sees it once
struct NoBoundary<'a> {
    inner: &'a mut dyn RecordProcessor,
}

impl RecordProcessor for NoBoundary<'_> {
    fn process(&mut self, key: &[u8], value: Option<&[u8]>) -> Directive {
        self.inner.process(key, value)
    }
}

/// DBM whose records are split over independent shards
pub struct ShardDbm {
    shards: Vec<StoreDbm>,
    multi_lock: RwLock<()>,
    path: String,
    kind: BackendKind,
    comparator: KeyComparator,
}

impl ShardDbm {
    pub fn new() -> Self {
        Self {
            shards: Vec::new(),
            multi_lock: RwLock::new(()),
            path: String::new(),
            kind: BackendKind::default(),
            comparator: KeyComparator::default(),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn check_open(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(not_open());
        }
        Ok(())
    }

    /// Mark the thread as working for this handle until the guard drops.
    /// Processors run on a shard must not call back into the handle.
    fn enter(&self) -> ProcessorGuard {
        let owner = owner_id(self);
        assert_not_reentrant(owner);
        ProcessorGuard::enter(owner)
    }

    fn shard_for(&self, key: &[u8]) -> Result<&StoreDbm> {
        self.check_open()?;
        Ok(&self.shards[shard_index(key, self.shards.len())])
    }

    /// First key of every nonempty shard
    fn first_keys(&self) -> Result<Vec<(usize, Vec<u8>)>> {
        let mut keys = Vec::new();
        for (index, shard) in self.shards.iter().enumerate() {
            let mut first = None;
            let result = shard.process_first(
                &mut |key: &[u8], _: Option<&[u8]>| {
                    first = Some(key.to_vec());
                    Directive::Keep
                },
                false,
            );
            match result {
                Ok(()) => keys.extend(first.map(|key| (index, key))),
                Err(status) if status == StatusCode::NotFoundError => {}
                Err(status) => return Err(status),
            }
        }
        Ok(keys)
    }
}

impl Default for ShardDbm {
    fn default() -> Self {
        Self::new()
    }
}

impl Dbm for ShardDbm {
    fn open(&mut self, path: &str, writable: bool, params: &Params) -> Result<()> {
        if !self.shards.is_empty() {
            return Err(Status::precondition("the database is already open"));
        }
        let config = OpenConfig::from_params(params);
        let detected = if config.truncate { 0 } else { detect_num_shards(path) };
        let num_shards = match (config.num_shards, detected) {
            (0, 0) => 1,
            (0, detected) => detected,
            (requested, 0) => requested,
            (requested, detected) => {
                if requested != detected {
                    warn!(path, requested, detected, "Shard count differs from existing files, using existing");
                }
                detected
            }
        };
        let kind = match &config.dbm {
            Some(name) => BackendKind::from_name(name)?,
            None => BackendKind::from_path(path),
        };
        let comparator = kind.comparator(&config)?;

        let mut shard_params = params.clone();
        shard_params.remove("num_shards");
        shard_params.insert("dbm", kind.class_name());

        let mut shards = Vec::with_capacity(num_shards);
        for index in 0..num_shards {
            let mut shard = StoreDbm::new();
            let opened = shard.open(&shard_path(path, index, num_shards), writable, &shard_params);
            if let Err(status) = opened {
                for mut shard in shards {
                    if let Err(e) = Dbm::close(&mut shard) {
                        warn!(error = %e, "Failed to close shard while rolling back open");
                    }
                }
                return Err(status);
            }
            shards.push(shard);
        }

        info!(path, num_shards, class = kind.class_name(), "Opened sharded database");
        self.shards = shards;
        self.path = path.to_string();
        self.kind = kind;
        self.comparator = comparator;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.check_open()?;
        let mut status = Status::success();
        for mut shard in std::mem::take(&mut self.shards) {
            if let Err(e) = shard.close() {
                status = status.join(e);
            }
        }
        info!(path = %self.path, "Closed sharded database");
        status.into_result()
    }

    fn process(&self, key: &[u8], proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let shard = self.shard_for(key)?;
        let _guard = self.enter();
        let _shared = self.multi_lock.read();
        shard.process(key, proc, writable)
    }

    fn process_multi(&self, ops: &mut [ProcessOp<'_>], writable: bool) -> Result<()> {
        self.check_open()?;
        let _guard = self.enter();
        let num_shards = self.shards.len();
        let first = ops.first().map(|(key, _)| shard_index(key, num_shards));
        let single = ops
            .iter()
            .all(|(key, _)| Some(shard_index(key, num_shards)) == first);
        if let (true, Some(index)) = (single, first) {
            let _shared = self.multi_lock.read();
            return self.shards[index].process_multi(ops, writable);
        }
        let _exclusive = self.multi_lock.write();
        for (key, proc) in ops.iter_mut() {
            self.shards[shard_index(key, num_shards)].process(key, &mut **proc, writable)?;
        }
        Ok(())
    }

    fn process_first(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        self.check_open()?;
        let _guard = self.enter();
        let _exclusive = self.multi_lock.write();
        if self.kind.is_ordered() {
            let comparator = self.comparator;
            let first = self
                .first_keys()?
                .into_iter()
                .min_by(|a, b| comparator.compare(&a.1, &b.1));
            let Some((index, key)) = first else {
                return Err(Status::not_found("no record"));
            };
            return self.shards[index].process(&key, proc, writable);
        }
        for shard in &self.shards {
            match shard.process_first(proc, writable) {
                Err(status) if status == StatusCode::NotFoundError => continue,
                result => return result,
            }
        }
        Err(Status::not_found("no record"))
    }

    fn process_each(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        self.check_open()?;
        let _guard = self.enter();
        let _shared = self.multi_lock.read();
        let owner = owner_id(self);
        invoke_boundary(owner, proc);
        for shard in &self.shards {
            shard.process_each(&mut NoBoundary { inner: &mut *proc }, writable)?;
        }
        invoke_boundary(owner, proc);
        Ok(())
    }

    fn count(&self) -> Result<i64> {
        self.check_open()?;
        self.shards.iter().map(|s| s.count()).sum()
    }

    fn file_size(&self) -> Result<i64> {
        self.check_open()?;
        self.shards.iter().map(|s| s.file_size()).sum()
    }

    fn file_path(&self) -> Result<String> {
        self.check_open()?;
        Ok(self.path.clone())
    }

    fn timestamp(&self) -> Result<f64> {
        self.check_open()?;
        let mut oldest = f64::INFINITY;
        for shard in &self.shards {
            oldest = oldest.min(shard.timestamp()?);
        }
        Ok(oldest)
    }

    fn clear(&self) -> Result<()> {
        self.check_open()?;
        let _guard = self.enter();
        let _exclusive = self.multi_lock.write();
        for shard in &self.shards {
            shard.clear()?;
        }
        Ok(())
    }

    fn rebuild(&self, params: &Params) -> Result<()> {
        self.check_open()?;
        let mut status = Status::success();
        for shard in &self.shards {
            if let Err(e) = shard.rebuild(params) {
                status = status.join(e);
            }
        }
        status.into_result()
    }

    fn should_be_rebuilt(&self) -> Result<bool> {
        self.check_open()?;
        for shard in &self.shards {
            if shard.should_be_rebuilt()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn synchronize(&self, hard: bool, params: &Params) -> Result<()> {
        self.check_open()?;
        let _guard = self.enter();
        let _exclusive = self.multi_lock.write();
        let mut status = Status::success();
        for shard in &self.shards {
            if let Err(e) = shard.synchronize(hard, params) {
                status = status.join(e);
            }
        }
        status.into_result()
    }

    fn copy_file_data(&self, dest: &str, sync_hard: bool) -> Result<()> {
        self.check_open()?;
        if dest.is_empty() {
            return Err(Status::invalid_argument("empty destination path"));
        }
        let _guard = self.enter();
        let _exclusive = self.multi_lock.write();
        let num_shards = self.shards.len();
        for (index, shard) in self.shards.iter().enumerate() {
            shard.copy_file_data(&shard_path(dest, index, num_shards), sync_hard)?;
        }
        Ok(())
    }

    fn inspect(&self) -> Vec<(String, String)> {
        if self.shards.is_empty() {
            return Vec::new();
        }
        let mut props = vec![
            ("class".to_string(), "ShardDBM".to_string()),
            ("path".to_string(), self.path.clone()),
            ("num_shards".to_string(), self.shards.len().to_string()),
            ("shard_class".to_string(), self.kind.class_name().to_string()),
        ];
        for (index, shard) in self.shards.iter().enumerate() {
            if let Ok(count) = shard.count() {
                props.push((format!("shard_{}_count", index), count.to_string()));
            }
        }
        props
    }

    fn is_open(&self) -> bool {
        !self.shards.is_empty()
    }

    fn is_writable(&self) -> bool {
        self.shards.first().is_some_and(|s| s.is_writable())
    }

    fn is_healthy(&self) -> bool {
        !self.shards.is_empty() && self.shards.iter().all(|s| s.is_healthy())
    }

    fn is_ordered(&self) -> bool {
        !self.shards.is_empty() && self.kind.is_ordered()
    }

    fn make_iterator(&self) -> Result<Box<dyn DbmIterator + '_>> {
        self.check_open()?;
        let mut cursors = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            cursors.push(shard.make_iterator()?);
        }
        if self.kind.is_ordered() {
            Ok(Box::new(MergeIterator {
                owner: self,
                cursors,
                heap: BinaryHeap::new(),
                forward: true,
            }))
        } else {
            Ok(Box::new(ConcatIterator {
                owner: self,
                cursors,
                current: None,
            }))
        }
    }
}

impl Drop for ShardDbm {
    fn drop(&mut self) {
        if !self.shards.is_empty() {
            warn!("ShardDbm dropped without close, closing now");
            if let Err(e) = self.close() {
                warn!(error = %e, "Failed to close sharded database on drop");
            }
        }
    }
}

/// Current position of one shard cursor inside the merge heap
struct HeapItem {
    key: Vec<u8>,
    shard: usize,
    comparator: KeyComparator,
    forward: bool,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    // BinaryHeap pops the greatest item; forward iteration wants the least key
    fn cmp(&self, other: &Self) -> Ordering {
        let order = self
            .comparator
            .compare(&self.key, &other.key)
            .then_with(|| self.shard.cmp(&other.shard));
        if self.forward {
            order.reverse()
        } else {
            order
        }
    }
}

/// K-way merge over ordered shard cursors
struct MergeIterator<'a> {
    owner: &'a ShardDbm,
    cursors: Vec<Box<dyn DbmIterator + 'a>>,
    heap: BinaryHeap<HeapItem>,
    forward: bool,
}

impl MergeIterator<'_> {
    fn push_current(&mut self, shard: usize) -> Result<()> {
        match self.cursors[shard].get_key() {
            Ok(key) => {
                self.heap.push(HeapItem {
                    key,
                    shard,
                    comparator: self.owner.comparator,
                    forward: self.forward,
                });
                Ok(())
            }
            Err(status) if status == StatusCode::NotFoundError => Ok(()),
            Err(status) => Err(status),
        }
    }

    /// Position every cursor with `seek` and rebuild the heap
    fn reset<F>(&mut self, forward: bool, mut seek: F) -> Result<()>
    where
        F: FnMut(&mut dyn DbmIterator) -> Result<()>,
    {
        self.forward = forward;
        self.heap.clear();
        for shard in 0..self.cursors.len() {
            seek(self.cursors[shard].as_mut())?;
            self.push_current(shard)?;
        }
        Ok(())
    }

    fn advance<F>(&mut self, mut step: F) -> Result<()>
    where
        F: FnMut(&mut dyn DbmIterator) -> Result<()>,
    {
        let Some(top) = self.heap.pop() else {
            return Err(Status::not_found("the cursor is not on a record"));
        };
        match step(self.cursors[top.shard].as_mut()) {
            Ok(()) => {}
            Err(status) if status == StatusCode::NotFoundError => return Ok(()),
            Err(status) => return Err(status),
        }
        self.push_current(top.shard)
    }
}

impl DbmIterator for MergeIterator<'_> {
    fn first(&mut self) -> Result<()> {
        self.reset(true, |cursor| cursor.first())
    }

    fn last(&mut self) -> Result<()> {
        self.reset(false, |cursor| cursor.last())
    }

    fn jump(&mut self, key: &[u8]) -> Result<()> {
        self.reset(true, |cursor| cursor.jump(key))
    }

    fn jump_lower(&mut self, key: &[u8], inclusive: bool) -> Result<()> {
        self.reset(false, |cursor| cursor.jump_lower(key, inclusive))
    }

    fn jump_upper(&mut self, key: &[u8], inclusive: bool) -> Result<()> {
        self.reset(true, |cursor| cursor.jump_upper(key, inclusive))
    }

    fn next(&mut self) -> Result<()> {
        if self.forward {
            return self.advance(|cursor| cursor.next());
        }
        let Some(top) = self.heap.peek() else {
            return Err(Status::not_found("the cursor is not on a record"));
        };
        let key = top.key.clone();
        self.reset(true, |cursor| cursor.jump_upper(&key, false))
    }

    fn previous(&mut self) -> Result<()> {
        if !self.forward {
            return self.advance(|cursor| cursor.previous());
        }
        let Some(top) = self.heap.peek() else {
            return Err(Status::not_found("the cursor is not on a record"));
        };
        let key = top.key.clone();
        self.reset(false, |cursor| cursor.jump_lower(&key, false))
    }

    fn process(&mut self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let Some(top) = self.heap.pop() else {
            return Err(Status::not_found("the cursor is not on a record"));
        };
        let result = {
            let _guard = self.owner.enter();
            let _shared = self.owner.multi_lock.read();
            self.cursors[top.shard].process(proc, writable)
        };
        // The shard cursor skips ahead past a removed record; a backward
        // merge must land below the old key instead.
        if !self.forward {
            let cursor = self.cursors[top.shard].as_mut();
            match cursor.get_key() {
                Ok(key) if key == top.key => {}
                Ok(_) => cursor.jump_lower(&top.key, false)?,
                Err(status) if status == StatusCode::NotFoundError => {
                    cursor.jump_lower(&top.key, false)?
                }
                Err(status) => return Err(status),
            }
        }
        self.push_current(top.shard)?;
        result
    }
}

/// Shard-by-shard walk over unordered shard cursors
struct ConcatIterator<'a> {
    owner: &'a ShardDbm,
    cursors: Vec<Box<dyn DbmIterator + 'a>>,
    current: Option<usize>,
}

impl ConcatIterator<'_> {
    fn is_on_record(&mut self, shard: usize) -> Result<bool> {
        match self.cursors[shard].get_key() {
            Ok(_) => Ok(true),
            Err(status) if status == StatusCode::NotFoundError => Ok(false),
            Err(status) => Err(status),
        }
    }

    /// Settle on the first shard from `start` whose cursor holds a record
    fn settle(&mut self, start: usize, restart: bool) -> Result<()> {
        for shard in start..self.cursors.len() {
            if restart || shard != start {
                self.cursors[shard].first()?;
            }
            if self.is_on_record(shard)? {
                self.current = Some(shard);
                return Ok(());
            }
        }
        self.current = None;
        Ok(())
    }
}

impl DbmIterator for ConcatIterator<'_> {
    fn first(&mut self) -> Result<()> {
        self.settle(0, true)
    }

    fn jump(&mut self, key: &[u8]) -> Result<()> {
        let shard = shard_index(key, self.cursors.len());
        self.cursors[shard].jump(key)?;
        self.current = if self.is_on_record(shard)? { Some(shard) } else { None };
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        let Some(shard) = self.current else {
            return Err(Status::not_found("the cursor is not on a record"));
        };
        match self.cursors[shard].next() {
            Ok(()) => {}
            Err(status) if status == StatusCode::NotFoundError => {}
            Err(status) => return Err(status),
        }
        self.settle(shard, false)
    }

    fn process(&mut self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let Some(shard) = self.current else {
            return Err(Status::not_found("the cursor is not on a record"));
        };
        let result = {
            let _guard = self.owner.enter();
            let _shared = self.owner.multi_lock.read();
            self.cursors[shard].process(proc, writable)
        };
        match result {
            Err(status) if status == StatusCode::NotFoundError => {
                self.settle(shard, false)?;
                match self.current {
                    Some(next) => {
                        let _guard = self.owner.enter();
                        let _shared = self.owner.multi_lock.read();
                        self.cursors[next].process(proc, writable)
                    }
                    None => Err(status),
                }
            }
            result => result,
        }
    }
}
