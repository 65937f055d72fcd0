//! The polymorphic DBM facade
//!
//! Implementors provide open/close, the four processing entry points and a
//! handful of pass-through queries. Everything else (get, set, compare
//! exchange, rekey, queue operations, search, migration) is built here on
//! top of the processors, so every implementation shares one set of
//! semantics.

use crate::file::File;
use crate::flat;
use crate::iterator::DbmIterator;
use crate::processor::{Directive, GetProcessor, ProcessOp, RecordProcessor};
use crate::search::{Matcher, SearchMode};
use polydbm_common::{deserialize_int, serialize_int, Params, Result, Status, StatusCode};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Delta passed to `increment` to read the counter without writing
pub const INCREMENT_PROBE: i64 = i64::MIN;

/// Bits of sub-second resolution in `push_last` keys
const PUSH_LAST_SHIFT: u32 = 20;

/// Expected or desired state of a record in a compare-exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CasValue<'a> {
    /// No record; as a desired state, remove the record
    Nil,
    /// Any existing record; as a desired state, leave the value alone
    Any,
    Bytes(&'a [u8]),
}

impl<'a> CasValue<'a> {
    fn matches(self, current: Option<&[u8]>) -> bool {
        match (self, current) {
            (CasValue::Nil, None) => true,
            (CasValue::Any, Some(_)) => true,
            (CasValue::Bytes(expected), Some(current)) => expected == current,
            _ => false,
        }
    }

    fn directive(self) -> Directive {
        match self {
            CasValue::Nil => Directive::Remove,
            CasValue::Any => Directive::Keep,
            CasValue::Bytes(value) => Directive::Set(value.to_vec()),
        }
    }

    pub fn to_owned_value(self) -> OwnedCasValue {
        match self {
            CasValue::Nil => OwnedCasValue::Nil,
            CasValue::Any => OwnedCasValue::Any,
            CasValue::Bytes(value) => OwnedCasValue::Bytes(value.to_vec()),
        }
    }
}

impl<'a> From<&'a [u8]> for CasValue<'a> {
    fn from(value: &'a [u8]) -> Self {
        CasValue::Bytes(value)
    }
}

impl<'a> From<&'a str> for CasValue<'a> {
    fn from(value: &'a str) -> Self {
        CasValue::Bytes(value.as_bytes())
    }
}

impl<'a> From<&'a Vec<u8>> for CasValue<'a> {
    fn from(value: &'a Vec<u8>) -> Self {
        CasValue::Bytes(value)
    }
}

impl<'a> From<Option<&'a [u8]>> for CasValue<'a> {
    fn from(value: Option<&'a [u8]>) -> Self {
        value.map_or(CasValue::Nil, CasValue::Bytes)
    }
}

/// Owned form of [`CasValue`] for deferred execution
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnedCasValue {
    Nil,
    Any,
    Bytes(Vec<u8>),
}

impl OwnedCasValue {
    pub fn as_cas(&self) -> CasValue<'_> {
        match self {
            OwnedCasValue::Nil => CasValue::Nil,
            OwnedCasValue::Any => CasValue::Any,
            OwnedCasValue::Bytes(value) => CasValue::Bytes(value),
        }
    }
}

impl From<CasValue<'_>> for OwnedCasValue {
    fn from(value: CasValue<'_>) -> Self {
        value.to_owned_value()
    }
}

/// Verifies one expectation of a multi compare-exchange
struct CasCheck<'a> {
    expected: CasValue<'a>,
    ok: &'a Cell<bool>,
}

impl RecordProcessor for CasCheck<'_> {
    fn process(&mut self, _key: &[u8], value: Option<&[u8]>) -> Directive {
        if !self.expected.matches(value) {
            self.ok.set(false);
        }
        Directive::Keep
    }
}

/// Applies one desired state once every check has passed
struct CasApply<'a> {
    desired: CasValue<'a>,
    ok: &'a Cell<bool>,
}

impl RecordProcessor for CasApply<'_> {
    fn process(&mut self, _key: &[u8], _value: Option<&[u8]>) -> Directive {
        if self.ok.get() {
            self.desired.directive()
        } else {
            Directive::Keep
        }
    }
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Database manager interface shared by every back-end
pub trait Dbm: Send + Sync {
    /// Bind the handle to `path`; PRECONDITION_ERROR if already open
    fn open(&mut self, path: &str, writable: bool, params: &Params) -> Result<()>;

    /// Flush and release; PRECONDITION_ERROR if not open
    fn close(&mut self) -> Result<()>;

    /// Run `proc` on the record of `key` under its lock
    fn process(&self, key: &[u8], proc: &mut dyn RecordProcessor, writable: bool) -> Result<()>;

    /// Run every op in order, atomically across all listed keys
    fn process_multi(&self, ops: &mut [ProcessOp<'_>], writable: bool) -> Result<()>;

    /// Run `proc` on the first record in iteration order
    fn process_first(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()>;

    /// Run `proc` on every record, calling its boundary hook before and after
    fn process_each(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()>;

    fn count(&self) -> Result<i64>;

    fn file_size(&self) -> Result<i64>;

    fn file_path(&self) -> Result<String>;

    /// Seconds since the epoch of the last open or synchronize
    fn timestamp(&self) -> Result<f64>;

    fn clear(&self) -> Result<()>;

    fn rebuild(&self, params: &Params) -> Result<()>;

    fn should_be_rebuilt(&self) -> Result<bool>;

    /// Persist the records; `hard` forces them to the device
    fn synchronize(&self, hard: bool, params: &Params) -> Result<()>;

    /// Write a flat-record image of the database to `dest`
    fn copy_file_data(&self, dest: &str, sync_hard: bool) -> Result<()>;

    fn inspect(&self) -> Vec<(String, String)>;

    fn is_open(&self) -> bool;

    fn is_writable(&self) -> bool;

    fn is_healthy(&self) -> bool;

    fn is_ordered(&self) -> bool;

    fn make_iterator(&self) -> Result<Box<dyn DbmIterator + '_>>;

    /// Value of `key`; NOT_FOUND_ERROR if absent
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut collect = GetProcessor::default();
        self.process(key, &mut collect, false)?;
        collect
            .value
            .ok_or_else(|| Status::not_found("no such record"))
    }

    /// Values of the present keys, read atomically
    fn get_multi(&self, keys: &[&[u8]]) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
        let mut collectors: Vec<GetProcessor> = keys.iter().map(|_| GetProcessor::default()).collect();
        let mut ops: Vec<ProcessOp<'_>> = keys
            .iter()
            .zip(collectors.iter_mut())
            .map(|(key, collect)| (*key, collect as &mut dyn RecordProcessor))
            .collect();
        self.process_multi(&mut ops, false)?;
        drop(ops);
        Ok(keys
            .iter()
            .zip(collectors)
            .filter_map(|(key, collect)| collect.value.map(|value| (key.to_vec(), value)))
            .collect())
    }

    /// Store a record; DUPLICATION_ERROR if it exists and `overwrite` is false
    fn set(&self, key: &[u8], value: &[u8], overwrite: bool) -> Result<()> {
        let mut duplicated = false;
        self.process(
            key,
            &mut |_: &[u8], current: Option<&[u8]>| {
                if current.is_some() && !overwrite {
                    duplicated = true;
                    Directive::Keep
                } else {
                    Directive::Set(value.to_vec())
                }
            },
            true,
        )?;
        if duplicated {
            return Err(Status::duplication("the record exists"));
        }
        Ok(())
    }

    /// Store several records in order, stopping at the first failure
    fn set_multi(&self, records: &[(&[u8], &[u8])], overwrite: bool) -> Result<()> {
        for (key, value) in records {
            self.set(key, value, overwrite)?;
        }
        Ok(())
    }

    /// Remove a record; NOT_FOUND_ERROR if absent
    fn remove(&self, key: &[u8]) -> Result<()> {
        let mut found = false;
        self.process(
            key,
            &mut |_: &[u8], current: Option<&[u8]>| {
                found = current.is_some();
                Directive::Remove
            },
            true,
        )?;
        if !found {
            return Err(Status::not_found("no such record"));
        }
        Ok(())
    }

    /// Remove all keys atomically; nothing is removed if any is absent
    fn remove_multi(&self, keys: &[&[u8]]) -> Result<()> {
        let expected: Vec<(&[u8], CasValue<'_>)> = keys.iter().map(|k| (*k, CasValue::Any)).collect();
        let desired: Vec<(&[u8], CasValue<'_>)> = keys.iter().map(|k| (*k, CasValue::Nil)).collect();
        match self.compare_exchange_multi(&expected, &desired) {
            Err(status) if status == StatusCode::InfeasibleError => {
                Err(Status::not_found("some records are missing"))
            }
            result => result,
        }
    }

    /// Append `value` to the existing value with `delim` in between
    fn append(&self, key: &[u8], value: &[u8], delim: &[u8]) -> Result<()> {
        self.process(
            key,
            &mut |_: &[u8], current: Option<&[u8]>| match current {
                Some(current) => {
                    let mut joined = Vec::with_capacity(current.len() + delim.len() + value.len());
                    joined.extend_from_slice(current);
                    joined.extend_from_slice(delim);
                    joined.extend_from_slice(value);
                    Directive::Set(joined)
                }
                None => Directive::Set(value.to_vec()),
            },
            true,
        )
    }

    fn append_multi(&self, records: &[(&[u8], &[u8])], delim: &[u8]) -> Result<()> {
        for (key, value) in records {
            self.append(key, value, delim)?;
        }
        Ok(())
    }

    /// Replace the record with `desired` if it is in the `expected` state;
    /// INFEASIBLE_ERROR otherwise
    fn compare_exchange(&self, key: &[u8], expected: CasValue<'_>, desired: CasValue<'_>) -> Result<()> {
        self.compare_exchange_and_get(key, expected, desired).0
    }

    /// Like `compare_exchange`, also returning the value found before
    fn compare_exchange_and_get(
        &self,
        key: &[u8],
        expected: CasValue<'_>,
        desired: CasValue<'_>,
    ) -> (Result<()>, Option<Vec<u8>>) {
        let mut matched = false;
        let mut actual = None;
        let writable = desired != CasValue::Any;
        let result = self.process(
            key,
            &mut |_: &[u8], current: Option<&[u8]>| {
                actual = current.map(<[u8]>::to_vec);
                matched = expected.matches(current);
                if matched && writable {
                    desired.directive()
                } else {
                    Directive::Keep
                }
            },
            writable,
        );
        match result {
            Ok(()) if !matched => (Err(Status::infeasible("the record is not in the expected state")), actual),
            result => (result, actual),
        }
    }

    /// All-or-nothing compare-exchange over several keys
    fn compare_exchange_multi(
        &self,
        expected: &[(&[u8], CasValue<'_>)],
        desired: &[(&[u8], CasValue<'_>)],
    ) -> Result<()> {
        let ok = Cell::new(true);
        let mut checks: Vec<CasCheck<'_>> = expected
            .iter()
            .map(|(_, state)| CasCheck { expected: *state, ok: &ok })
            .collect();
        let mut applies: Vec<CasApply<'_>> = desired
            .iter()
            .map(|(_, state)| CasApply { desired: *state, ok: &ok })
            .collect();
        let writable = desired.iter().any(|(_, state)| *state != CasValue::Any);

        let mut ops: Vec<ProcessOp<'_>> = Vec::with_capacity(expected.len() + desired.len());
        for ((key, _), check) in expected.iter().zip(checks.iter_mut()) {
            ops.push((*key, check as &mut dyn RecordProcessor));
        }
        for ((key, _), apply) in desired.iter().zip(applies.iter_mut()) {
            ops.push((*key, apply as &mut dyn RecordProcessor));
        }
        self.process_multi(&mut ops, writable)?;
        if !ok.get() {
            return Err(Status::infeasible("some records are not in the expected state"));
        }
        Ok(())
    }

    /// Add `delta` to the 8-byte big-endian counter at `key`, seeding an
    /// absent counter with `init`; returns the new value.
    /// [`INCREMENT_PROBE`] reads without writing.
    fn increment(&self, key: &[u8], delta: i64, init: i64) -> Result<i64> {
        let mut result = init;
        if delta == INCREMENT_PROBE {
            self.process(
                key,
                &mut |_: &[u8], current: Option<&[u8]>| {
                    result = current.map_or(init, deserialize_int);
                    Directive::Keep
                },
                false,
            )?;
        } else {
            self.process(
                key,
                &mut |_: &[u8], current: Option<&[u8]>| {
                    result = current.map_or(init, deserialize_int).wrapping_add(delta);
                    Directive::Set(serialize_int(result).to_vec())
                },
                true,
            )?;
        }
        Ok(result)
    }

    /// Move (or copy) the record of `old_key` to `new_key` atomically
    fn rekey(&self, old_key: &[u8], new_key: &[u8], overwrite: bool, copying: bool) -> Result<()> {
        if old_key == new_key {
            self.get(old_key)?;
            if !overwrite {
                return Err(Status::duplication("the new key exists"));
            }
            return Ok(());
        }
        let state: RefCell<Result<Vec<u8>>> = RefCell::new(Err(Status::not_found("no such record")));
        let mut read_old = |_: &[u8], current: Option<&[u8]>| {
            if let Some(current) = current {
                *state.borrow_mut() = Ok(current.to_vec());
            }
            Directive::Keep
        };
        let mut write_new = |_: &[u8], current: Option<&[u8]>| {
            let mut state = state.borrow_mut();
            let value = match &*state {
                Ok(value) => value.clone(),
                Err(_) => return Directive::Keep,
            };
            if current.is_some() && !overwrite {
                *state = Err(Status::duplication("the new key exists"));
                return Directive::Keep;
            }
            Directive::Set(value)
        };
        let mut remove_old = |_: &[u8], _: Option<&[u8]>| {
            if state.borrow().is_ok() && !copying {
                Directive::Remove
            } else {
                Directive::Keep
            }
        };
        let mut ops: [ProcessOp<'_>; 3] = [
            (old_key, &mut read_old as &mut dyn RecordProcessor),
            (new_key, &mut write_new as &mut dyn RecordProcessor),
            (old_key, &mut remove_old as &mut dyn RecordProcessor),
        ];
        self.process_multi(&mut ops, true)?;
        let outcome = state.into_inner();
        outcome.map(|_| ())
    }

    /// Remove and return the first record; NOT_FOUND_ERROR if empty
    fn pop_first(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut record = None;
        self.process_first(
            &mut |key: &[u8], value: Option<&[u8]>| match value {
                Some(value) => {
                    record = Some((key.to_vec(), value.to_vec()));
                    Directive::Remove
                }
                None => Directive::Keep,
            },
            true,
        )?;
        record.ok_or_else(|| Status::not_found("no records"))
    }

    /// Store `value` under a fresh time-derived key and return the key.
    /// A non-positive `wtime` means now.
    fn push_last(&self, value: &[u8], wtime: f64) -> Result<Vec<u8>> {
        let seconds = if wtime > 0.0 { wtime } else { now_seconds() };
        let mut id = (seconds * f64::from(1u32 << PUSH_LAST_SHIFT)) as u64;
        loop {
            let key = id.to_be_bytes();
            match self.compare_exchange(&key, CasValue::Nil, CasValue::Bytes(value)) {
                Ok(()) => return Ok(key.to_vec()),
                Err(status) if status == StatusCode::InfeasibleError => id = id.wrapping_add(1),
                Err(status) => return Err(status),
            }
        }
    }

    /// Keys matching `pattern`; a `capacity` of 0 means unlimited
    fn search(&self, mode: SearchMode, pattern: &[u8], capacity: usize) -> Result<Vec<Vec<u8>>> {
        let mut matcher = Matcher::new(mode, pattern, capacity)?;
        let mut iter = self.make_iterator()?;
        iter.first()?;
        while !matcher.is_full() {
            match iter.get_key() {
                Ok(key) => matcher.feed(&key),
                Err(status) if status == StatusCode::NotFoundError => break,
                Err(status) => return Err(status),
            }
            iter.next()?;
        }
        Ok(matcher.finish())
    }

    /// Copy every record into `dest`, overwriting existing keys
    fn export(&self, dest: &dyn Dbm) -> Result<()> {
        let mut iter = self.make_iterator()?;
        iter.first()?;
        loop {
            match iter.step() {
                Ok((key, value)) => dest.set(&key, &value, true)?,
                Err(status) if status == StatusCode::NotFoundError => return Ok(()),
                Err(status) => return Err(status),
            }
        }
    }

    fn export_to_flat_records(&self, dest: &dyn File) -> Result<()> {
        flat::export_records(self, dest).map(|_| ())
    }

    fn import_from_flat_records(&self, src: &dyn File) -> Result<()> {
        flat::import_records(self, src).map(|_| ())
    }
}
