//! Asynchronous adapter over a DBM
//!
//! `AsyncDbm` runs DBM operations on a fixed pool of worker threads fed by
//! a bounded FIFO queue. Every call packages its arguments into a task and
//! returns a [`DbmFuture`] completed by the worker that runs it.
//!
//! Tasks are pulled in enqueue order but run in parallel, so only a
//! single-worker adapter preserves submission order. `destruct` lets every
//! queued task finish before joining the workers.

use crate::dbm::{CasValue, Dbm, OwnedCasValue};
use crate::file::File;
use crate::future::{self, DbmFuture, Payload};
use crate::processor::RecordProcessor;
use crate::search::SearchMode;
use crossbeam_channel::{bounded, Receiver, Sender};
use polydbm_common::{Params, Result, Status};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Default bound of the task queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 65_536;

type Task = Box<dyn FnOnce(&dyn Dbm) + Send>;

/// Message consumed by a worker
enum TaskCommand {
    Run(Task),

    /// Stop after everything queued before it
    Shutdown,
}

fn owned_keys(keys: &[&[u8]]) -> Vec<Vec<u8>> {
    keys.iter().map(|k| k.to_vec()).collect()
}

fn owned_records(records: &[(&[u8], &[u8])]) -> Vec<(Vec<u8>, Vec<u8>)> {
    records.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect()
}

fn owned_states(states: &[(&[u8], CasValue<'_>)]) -> Vec<(Vec<u8>, OwnedCasValue)> {
    states
        .iter()
        .map(|(k, state)| (k.to_vec(), state.to_owned_value()))
        .collect()
}

fn borrowed_keys(keys: &[Vec<u8>]) -> Vec<&[u8]> {
    keys.iter().map(Vec::as_slice).collect()
}

fn borrowed_records(records: &[(Vec<u8>, Vec<u8>)]) -> Vec<(&[u8], &[u8])> {
    records
        .iter()
        .map(|(k, v)| (k.as_slice(), v.as_slice()))
        .collect()
}

fn borrowed_states(states: &[(Vec<u8>, OwnedCasValue)]) -> Vec<(&[u8], CasValue<'_>)> {
    states.iter().map(|(k, state)| (k.as_slice(), state.as_cas())).collect()
}

fn status_only(result: Result<()>) -> Result<Payload> {
    result.map(|()| Payload::None)
}

/// Worker pool running DBM operations in the background
pub struct AsyncDbm {
    sender: Option<Sender<TaskCommand>>,
    workers: Vec<JoinHandle<()>>,
}

impl AsyncDbm {
    /// Start `num_workers` threads over `dbm` with the default queue bound
    pub fn new<D: Dbm + 'static>(dbm: Arc<D>, num_workers: usize) -> Result<Self> {
        Self::with_queue_capacity(dbm, num_workers, DEFAULT_QUEUE_CAPACITY)
    }

    /// Start `num_workers` threads over `dbm`; submitting blocks while
    /// `capacity` tasks are queued
    pub fn with_queue_capacity<D: Dbm + 'static>(
        dbm: Arc<D>,
        num_workers: usize,
        capacity: usize,
    ) -> Result<Self> {
        if num_workers == 0 {
            return Err(Status::invalid_argument("the number of workers must be positive"));
        }
        if capacity == 0 {
            return Err(Status::invalid_argument("the queue capacity must be positive"));
        }
        let dbm: Arc<dyn Dbm> = dbm;
        let (sender, receiver) = bounded::<TaskCommand>(capacity);

        let mut adapter = Self {
            sender: Some(sender),
            workers: Vec::with_capacity(num_workers),
        };
        for index in 0..num_workers {
            let dbm = Arc::clone(&dbm);
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("polydbm-async-{}", index))
                .spawn(move || Self::worker_loop(index, dbm, receiver));
            match spawned {
                Ok(handle) => adapter.workers.push(handle),
                Err(e) => {
                    adapter.destruct();
                    return Err(e.into());
                }
            }
        }
        info!(num_workers, capacity, "Started async DBM workers");
        Ok(adapter)
    }

    fn worker_loop(index: usize, dbm: Arc<dyn Dbm>, receiver: Receiver<TaskCommand>) {
        debug!(worker = index, "Async worker started");
        while let Ok(command) = receiver.recv() {
            match command {
                TaskCommand::Run(task) => {
                    // A panicking task drops its promise, which cancels the future
                    if panic::catch_unwind(AssertUnwindSafe(|| task(dbm.as_ref()))).is_err() {
                        error!(worker = index, "Async task panicked");
                    }
                }
                TaskCommand::Shutdown => break,
            }
        }
        debug!(worker = index, "Async worker stopped");
    }

    /// Queue `op` and return the future of its result
    fn submit<F>(&self, op: F) -> DbmFuture
    where
        F: FnOnce(&dyn Dbm) -> Result<Payload> + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            return DbmFuture::ready(Err(Status::precondition("the adapter is destructed")));
        };
        let (promise, future) = future::channel();
        let task: Task = Box::new(move |dbm| promise.complete(op(dbm)));
        if sender.send(TaskCommand::Run(task)).is_err() {
            error!("Async task queue is disconnected");
        }
        future
    }

    /// Drain the queue, stop the workers and wait for them; idempotent
    pub fn destruct(&mut self) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        for _ in 0..self.workers.len() {
            if sender.send(TaskCommand::Shutdown).is_err() {
                break;
            }
        }
        drop(sender);
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Async worker thread panicked");
            }
        }
        info!("Stopped async DBM workers");
    }

    pub fn is_running(&self) -> bool {
        self.sender.is_some()
    }

    pub fn get(&self, key: &[u8]) -> DbmFuture {
        let key = key.to_vec();
        self.submit(move |dbm| dbm.get(&key).map(Payload::Bytes))
    }

    pub fn get_multi(&self, keys: &[&[u8]]) -> DbmFuture {
        let keys = owned_keys(keys);
        self.submit(move |dbm| dbm.get_multi(&borrowed_keys(&keys)).map(Payload::Map))
    }

    pub fn set(&self, key: &[u8], value: &[u8], overwrite: bool) -> DbmFuture {
        let (key, value) = (key.to_vec(), value.to_vec());
        self.submit(move |dbm| status_only(dbm.set(&key, &value, overwrite)))
    }

    pub fn set_multi(&self, records: &[(&[u8], &[u8])], overwrite: bool) -> DbmFuture {
        let records = owned_records(records);
        self.submit(move |dbm| status_only(dbm.set_multi(&borrowed_records(&records), overwrite)))
    }

    pub fn remove(&self, key: &[u8]) -> DbmFuture {
        let key = key.to_vec();
        self.submit(move |dbm| status_only(dbm.remove(&key)))
    }

    pub fn remove_multi(&self, keys: &[&[u8]]) -> DbmFuture {
        let keys = owned_keys(keys);
        self.submit(move |dbm| status_only(dbm.remove_multi(&borrowed_keys(&keys))))
    }

    pub fn append(&self, key: &[u8], value: &[u8], delim: &[u8]) -> DbmFuture {
        let (key, value, delim) = (key.to_vec(), value.to_vec(), delim.to_vec());
        self.submit(move |dbm| status_only(dbm.append(&key, &value, &delim)))
    }

    pub fn append_multi(&self, records: &[(&[u8], &[u8])], delim: &[u8]) -> DbmFuture {
        let (records, delim) = (owned_records(records), delim.to_vec());
        self.submit(move |dbm| status_only(dbm.append_multi(&borrowed_records(&records), &delim)))
    }

    pub fn compare_exchange(
        &self,
        key: &[u8],
        expected: CasValue<'_>,
        desired: CasValue<'_>,
    ) -> DbmFuture {
        let key = key.to_vec();
        let (expected, desired) = (expected.to_owned_value(), desired.to_owned_value());
        self.submit(move |dbm| {
            status_only(dbm.compare_exchange(&key, expected.as_cas(), desired.as_cas()))
        })
    }

    pub fn increment(&self, key: &[u8], delta: i64, init: i64) -> DbmFuture {
        let key = key.to_vec();
        self.submit(move |dbm| dbm.increment(&key, delta, init).map(Payload::Int))
    }

    pub fn compare_exchange_multi(
        &self,
        expected: &[(&[u8], CasValue<'_>)],
        desired: &[(&[u8], CasValue<'_>)],
    ) -> DbmFuture {
        let (expected, desired) = (owned_states(expected), owned_states(desired));
        self.submit(move |dbm| {
            status_only(
                dbm.compare_exchange_multi(&borrowed_states(&expected), &borrowed_states(&desired)),
            )
        })
    }

    pub fn rekey(&self, old_key: &[u8], new_key: &[u8], overwrite: bool, copying: bool) -> DbmFuture {
        let (old_key, new_key) = (old_key.to_vec(), new_key.to_vec());
        self.submit(move |dbm| status_only(dbm.rekey(&old_key, &new_key, overwrite, copying)))
    }

    pub fn pop_first(&self) -> DbmFuture {
        self.submit(|dbm| dbm.pop_first().map(|(key, value)| Payload::Pair(key, value)))
    }

    /// The future carries the generated key
    pub fn push_last(&self, value: &[u8], wtime: f64) -> DbmFuture {
        let value = value.to_vec();
        self.submit(move |dbm| dbm.push_last(&value, wtime).map(Payload::Bytes))
    }

    /// Run an owned processor on one record
    pub fn process(
        &self,
        key: &[u8],
        mut proc: Box<dyn RecordProcessor + Send>,
        writable: bool,
    ) -> DbmFuture {
        let key = key.to_vec();
        self.submit(move |dbm| status_only(dbm.process(&key, proc.as_mut(), writable)))
    }

    pub fn clear(&self) -> DbmFuture {
        self.submit(|dbm| status_only(dbm.clear()))
    }

    pub fn rebuild(&self, params: &Params) -> DbmFuture {
        let params = params.clone();
        self.submit(move |dbm| status_only(dbm.rebuild(&params)))
    }

    pub fn synchronize(&self, hard: bool, params: &Params) -> DbmFuture {
        let params = params.clone();
        self.submit(move |dbm| status_only(dbm.synchronize(hard, &params)))
    }

    pub fn copy_file_data(&self, dest: &str, sync_hard: bool) -> DbmFuture {
        let dest = dest.to_string();
        self.submit(move |dbm| status_only(dbm.copy_file_data(&dest, sync_hard)))
    }

    pub fn export(&self, dest: Arc<dyn Dbm>) -> DbmFuture {
        self.submit(move |dbm| status_only(dbm.export(dest.as_ref())))
    }

    pub fn export_to_flat_records(&self, dest: Arc<dyn File>) -> DbmFuture {
        self.submit(move |dbm| status_only(dbm.export_to_flat_records(dest.as_ref())))
    }

    pub fn import_from_flat_records(&self, src: Arc<dyn File>) -> DbmFuture {
        self.submit(move |dbm| status_only(dbm.import_from_flat_records(src.as_ref())))
    }

    pub fn search(&self, mode: SearchMode, pattern: &[u8], capacity: usize) -> DbmFuture {
        let pattern = pattern.to_vec();
        self.submit(move |dbm| dbm.search(mode, &pattern, capacity).map(Payload::List))
    }
}

impl Drop for AsyncDbm {
    fn drop(&mut self) {
        if self.sender.is_some() {
            warn!("AsyncDbm dropped without explicit destruct, draining now");
            self.destruct();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreDbm;
    use polydbm_common::StatusCode;
    use std::time::Duration;

    fn memory_dbm() -> Arc<StoreDbm> {
        let mut dbm = StoreDbm::new();
        dbm.open("", true, &Params::new().with("dbm", "StdTreeDBM")).unwrap();
        Arc::new(dbm)
    }

    #[test]
    fn test_rejects_zero_workers() {
        let status = AsyncDbm::new(memory_dbm(), 0).err().unwrap();
        assert_eq!(status.code(), StatusCode::InvalidArgumentError);
    }

    #[test]
    fn test_single_worker_keeps_order() {
        let dbm = memory_dbm();
        let mut adapter = AsyncDbm::new(Arc::clone(&dbm), 1).unwrap();
        let mut futures = Vec::new();
        for i in 0..10 {
            futures.push(adapter.append(b"log", format!("{}", i).as_bytes(), b","));
        }
        let mut last = adapter.get(b"log");
        assert_eq!(last.get_str().unwrap(), "0,1,2,3,4,5,6,7,8,9");
        for mut future in futures {
            future.get().unwrap();
        }
        adapter.destruct();
    }

    #[test]
    fn test_typed_results() {
        let dbm = memory_dbm();
        let mut adapter = AsyncDbm::new(Arc::clone(&dbm), 2).unwrap();
        assert_eq!(adapter.increment(b"n", 5, 100).get_int().unwrap(), 105);
        adapter.set(b"a", b"1", true).get().unwrap();
        let (key, value) = adapter.pop_first().get_pair_str().unwrap();
        assert_eq!((key.as_str(), value.as_str()), ("a", "1"));
        let missing = adapter.get(b"zzz").get_bytes().unwrap_err();
        assert_eq!(missing.code(), StatusCode::NotFoundError);
        let keys = adapter.search(SearchMode::Begin, b"n", 0).get_array_str().unwrap();
        assert_eq!(keys, vec!["n".to_string()]);
        adapter.destruct();
    }

    #[test]
    fn test_destruct_drains_and_stops() {
        let dbm = memory_dbm();
        let mut adapter = AsyncDbm::new(Arc::clone(&dbm), 3).unwrap();
        let futures: Vec<DbmFuture> = (0..50)
            .map(|i| adapter.set(format!("k{}", i).as_bytes(), b"v", true))
            .collect();
        adapter.destruct();
        adapter.destruct();
        for future in &futures {
            assert!(future.wait(Duration::ZERO).unwrap());
        }
        assert_eq!(dbm.count().unwrap(), 50);
        let status = adapter.get(b"k1").get().unwrap_err();
        assert_eq!(status.code(), StatusCode::PreconditionError);
    }

    #[test]
    fn test_boxed_processor() {
        let dbm = memory_dbm();
        let mut adapter = AsyncDbm::new(Arc::clone(&dbm), 1).unwrap();
        let proc = Box::new(|_: &[u8], value: Option<&[u8]>| match value {
            Some(_) => crate::processor::Directive::Keep,
            None => crate::processor::Directive::Set(b"init".to_vec()),
        });
        adapter.process(b"x", proc, true).get().unwrap();
        assert_eq!(dbm.get(b"x").unwrap(), b"init");
        adapter.destruct();
    }
}
