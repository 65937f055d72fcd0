//! One-shot result cells for the async adapter
//!
//! A `DbmFuture` moves through pending, completed and consumed. Any
//! `get*` call blocks until completion, moves the result out and leaves the
//! future consumed; later calls fail with PRECONDITION_ERROR. The producing
//! side is a `Promise`; dropping it unfulfilled completes the future with
//! CANCELED_ERROR.

use parking_lot::{Condvar, Mutex};
use polydbm_common::{Result, Status};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Result value carried by a completed future
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    None,
    Bytes(Vec<u8>),
    Map(HashMap<Vec<u8>, Vec<u8>>),
    List(Vec<Vec<u8>>),
    Int(i64),
    Pair(Vec<u8>, Vec<u8>),
}

impl Payload {
    fn shape(&self) -> &'static str {
        match self {
            Payload::None => "none",
            Payload::Bytes(_) => "bytes",
            Payload::Map(_) => "map",
            Payload::List(_) => "list",
            Payload::Int(_) => "int",
            Payload::Pair(_, _) => "pair",
        }
    }
}

enum Slot {
    Pending,
    Completed(Result<Payload>),
    Consumed,
}

struct Shared {
    slot: Mutex<Slot>,
    ready: Condvar,
}

/// Create a connected promise and future
pub(crate) fn channel() -> (Promise, DbmFuture) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Pending),
        ready: Condvar::new(),
    });
    (
        Promise {
            shared: Some(Arc::clone(&shared)),
        },
        DbmFuture {
            shared: Some(shared),
        },
    )
}

/// Producing half of a future
pub(crate) struct Promise {
    shared: Option<Arc<Shared>>,
}

impl Promise {
    pub(crate) fn complete(mut self, result: Result<Payload>) {
        self.fulfill(result);
    }

    fn fulfill(&mut self, result: Result<Payload>) {
        if let Some(shared) = self.shared.take() {
            *shared.slot.lock() = Slot::Completed(result);
            shared.ready.notify_all();
        }
    }
}

impl Drop for Promise {
    fn drop(&mut self) {
        self.fulfill(Err(Status::with_message(
            polydbm_common::StatusCode::CanceledError,
            "the task was dropped before completion",
        )));
    }
}

fn consumed() -> Status {
    Status::precondition("the future is already consumed")
}

fn mismatch(expected: &str, payload: &Payload) -> Status {
    Status::invalid_argument(format!(
        "the future holds {} but {} was requested",
        payload.shape(),
        expected
    ))
}

fn lossy(data: Vec<u8>) -> String {
    match String::from_utf8(data) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Consuming half, handed to the caller of an async operation
pub struct DbmFuture {
    shared: Option<Arc<Shared>>,
}

impl DbmFuture {
    /// A future that is already completed
    pub(crate) fn ready(result: Result<Payload>) -> Self {
        let (promise, future) = channel();
        promise.complete(result);
        future
    }

    fn shared(&self) -> Result<&Shared> {
        self.shared.as_deref().ok_or_else(consumed)
    }

    /// Wait up to `timeout` for completion; returns whether it completed
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let shared = self.shared()?;
        let deadline = Instant::now().checked_add(timeout);
        let mut slot = shared.slot.lock();
        loop {
            match &*slot {
                Slot::Consumed => return Err(consumed()),
                Slot::Completed(_) => return Ok(true),
                Slot::Pending => {}
            }
            match deadline {
                Some(deadline) => {
                    if shared.ready.wait_until(&mut slot, deadline).timed_out() {
                        return Ok(!matches!(*slot, Slot::Pending));
                    }
                }
                None => shared.ready.wait(&mut slot),
            }
        }
    }

    /// Block until completion and move the result out
    fn take(&mut self) -> Result<Payload> {
        let shared = self.shared()?;
        let mut slot = shared.slot.lock();
        while matches!(*slot, Slot::Pending) {
            shared.ready.wait(&mut slot);
        }
        match std::mem::replace(&mut *slot, Slot::Consumed) {
            Slot::Completed(result) => result,
            _ => Err(consumed()),
        }
    }

    /// Status of the operation, discarding any payload
    pub fn get(&mut self) -> Result<()> {
        self.take().map(|_| ())
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        match self.take()? {
            Payload::Bytes(data) => Ok(data),
            other => Err(mismatch("bytes", &other)),
        }
    }

    pub fn get_str(&mut self) -> Result<String> {
        self.get_bytes().map(lossy)
    }

    pub fn get_map(&mut self) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
        match self.take()? {
            Payload::Map(map) => Ok(map),
            other => Err(mismatch("map", &other)),
        }
    }

    pub fn get_map_str(&mut self) -> Result<HashMap<String, String>> {
        Ok(self
            .get_map()?
            .into_iter()
            .map(|(k, v)| (lossy(k), lossy(v)))
            .collect())
    }

    pub fn get_array(&mut self) -> Result<Vec<Vec<u8>>> {
        match self.take()? {
            Payload::List(list) => Ok(list),
            other => Err(mismatch("list", &other)),
        }
    }

    pub fn get_array_str(&mut self) -> Result<Vec<String>> {
        Ok(self.get_array()?.into_iter().map(lossy).collect())
    }

    pub fn get_int(&mut self) -> Result<i64> {
        match self.take()? {
            Payload::Int(value) => Ok(value),
            other => Err(mismatch("int", &other)),
        }
    }

    pub fn get_pair(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        match self.take()? {
            Payload::Pair(first, second) => Ok((first, second)),
            other => Err(mismatch("pair", &other)),
        }
    }

    pub fn get_pair_str(&mut self) -> Result<(String, String)> {
        let (first, second) = self.get_pair()?;
        Ok((lossy(first), lossy(second)))
    }

    /// Release the future; safe in every state and idempotent
    pub fn destruct(&mut self) {
        if let Some(shared) = self.shared.take() {
            if matches!(*shared.slot.lock(), Slot::Pending) {
                warn!("Future destroyed while its task is pending");
            }
        }
    }
}

impl Drop for DbmFuture {
    fn drop(&mut self) {
        self.destruct();
    }
}
