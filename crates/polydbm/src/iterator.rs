//! Cursor over the records of a DBM
//!
//! Iterators do not present a snapshot. Each step re-acquires the position
//! from the current key, so records inserted behind the cursor may be
//! skipped and records inserted ahead of it may be observed. A cursor whose
//! record was removed moves on to the following record when it is next
//! used.

use crate::processor::{Directive, RecordProcessor};
use polydbm_common::{Result, Status};

fn ordered_only(op: &str) -> Status {
    Status::not_implemented(format!("{} requires an ordered database", op))
}

/// Cursor operations shared by every back-end
pub trait DbmIterator {
    /// Position at the first record
    fn first(&mut self) -> Result<()>;

    /// Position at the last record
    fn last(&mut self) -> Result<()> {
        Err(ordered_only("last"))
    }

    /// Position at the record of `key`, or for ordered databases at the
    /// first record after it
    fn jump(&mut self, key: &[u8]) -> Result<()>;

    /// Position at the greatest key below `key` (or equal, if inclusive)
    fn jump_lower(&mut self, _key: &[u8], _inclusive: bool) -> Result<()> {
        Err(ordered_only("jump_lower"))
    }

    /// Position at the least key above `key` (or equal, if inclusive)
    fn jump_upper(&mut self, _key: &[u8], _inclusive: bool) -> Result<()> {
        Err(ordered_only("jump_upper"))
    }

    /// Move to the next record; NOT_FOUND_ERROR if the cursor is invalid
    fn next(&mut self) -> Result<()>;

    /// Move to the previous record
    fn previous(&mut self) -> Result<()> {
        Err(ordered_only("previous"))
    }

    /// Run a processor on the current record
    fn process(&mut self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()>;

    /// Key and value of the current record
    fn get(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut record = None;
        self.process(
            &mut |key: &[u8], value: Option<&[u8]>| {
                if let Some(value) = value {
                    record = Some((key.to_vec(), value.to_vec()));
                }
                Directive::Keep
            },
            false,
        )?;
        record.ok_or_else(|| Status::not_found("the cursor is not on a record"))
    }

    fn get_key(&mut self) -> Result<Vec<u8>> {
        self.get().map(|(key, _)| key)
    }

    fn get_value(&mut self) -> Result<Vec<u8>> {
        self.get().map(|(_, value)| value)
    }

    /// Replace the value of the current record
    fn set(&mut self, value: &[u8]) -> Result<()> {
        self.process(
            &mut |_key: &[u8], _value: Option<&[u8]>| Directive::Set(value.to_vec()),
            true,
        )
    }

    /// Remove the current record; the cursor moves on to the next one
    fn remove(&mut self) -> Result<()> {
        self.process(
            &mut |_key: &[u8], _value: Option<&[u8]>| Directive::Remove,
            true,
        )
    }

    /// Read the current record, then move to the next one
    fn step(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let record = self.get()?;
        match self.next() {
            Ok(()) => Ok(record),
            Err(status) if status == polydbm_common::StatusCode::NotFoundError => Ok(record),
            Err(status) => Err(status),
        }
    }
}
