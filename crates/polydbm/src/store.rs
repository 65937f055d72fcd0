//! Single back-end DBM
//!
//! `StoreDbm` binds one back-end to an optional file. Records live in the
//! back-end; the file holds their flat-record image, loaded on open and
//! rewritten on `synchronize` and on closing a writable handle. The file
//! stays open and locked for the life of the handle.

use crate::backend::{Backend, BackendKind};
use crate::config::OpenConfig;
use crate::dbm::Dbm;
use crate::file::{File, FileKind, PositionalFile};
use crate::flat::{FlatRecordReader, FlatRecordWriter};
use crate::iterator::DbmIterator;
use crate::processor::{Directive, ProcessOp, RecordProcessor};
use polydbm_common::{Params, Result, Status};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn not_open() -> Status {
    Status::precondition("the database is not open")
}

fn not_writable() -> Status {
    Status::precondition("the database is not writable")
}

/// Fill an empty back-end from a flat-record image
fn load_records(backend: &dyn Backend, file: &dyn File) -> Result<u64> {
    let mut reader = FlatRecordReader::new(file)?;
    let mut num_records = 0;
    while let Some((key, value)) = reader.read()? {
        let mut value = Some(value);
        backend.process(
            &key,
            &mut |_: &[u8], _: Option<&[u8]>| match value.take() {
                Some(value) => Directive::Set(value),
                None => Directive::Keep,
            },
            true,
        )?;
        num_records += 1;
    }
    Ok(num_records)
}

/// Replace the contents of `file` with the back-end's records
fn save_records(backend: &dyn Backend, file: &dyn File) -> Result<u64> {
    file.truncate(0)?;
    let mut writer = FlatRecordWriter::new(file);
    let mut failure = None;
    backend.process_each(
        &mut |key: &[u8], value: Option<&[u8]>| {
            match value {
                Some(value) if failure.is_none() => {
                    if let Err(e) = writer.write(key, value) {
                        failure = Some(e);
                    }
                }
                _ => {}
            }
            Directive::Keep
        },
        false,
    )?;
    if let Some(e) = failure {
        return Err(e);
    }
    writer.finish()
}

struct OpenState {
    backend: Box<dyn Backend>,
    kind: BackendKind,
    path: String,
    writable: bool,
    file: Option<Box<dyn File>>,
    /// f64 bits of the last open or synchronize time
    timestamp: AtomicU64,
    healthy: AtomicBool,
}

impl OpenState {
    fn check_writable(&self, writable: bool) -> Result<()> {
        if writable && !self.writable {
            return Err(not_writable());
        }
        Ok(())
    }

    fn save(&self, hard: bool) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let result = save_records(self.backend.as_ref(), file.as_ref())
            .and_then(|num_records| {
                debug!(path = %self.path, num_records, "Saved records");
                file.synchronize(hard, 0, 0)
            });
        if result.is_err() {
            self.healthy.store(false, Ordering::SeqCst);
        }
        result
    }
}

/// DBM over one in-process back-end
pub struct StoreDbm {
    state: Option<OpenState>,
}

impl StoreDbm {
    pub fn new() -> Self {
        Self { state: None }
    }

    fn state(&self) -> Result<&OpenState> {
        self.state.as_ref().ok_or_else(not_open)
    }

    /// Back-end class of an open handle
    pub fn kind(&self) -> Option<BackendKind> {
        self.state.as_ref().map(|s| s.kind)
    }
}

impl Default for StoreDbm {
    fn default() -> Self {
        Self::new()
    }
}

impl Dbm for StoreDbm {
    fn open(&mut self, path: &str, writable: bool, params: &Params) -> Result<()> {
        if self.state.is_some() {
            return Err(Status::precondition("the database is already open"));
        }
        let config = OpenConfig::from_params(params);
        let kind = match &config.dbm {
            Some(name) => BackendKind::from_name(name)?,
            None => BackendKind::from_path(path),
        };
        if path.is_empty() && kind.requires_path() {
            return Err(Status::invalid_argument(format!(
                "{} requires a file path",
                kind.class_name()
            )));
        }
        let backend = kind.build(&config)?;

        let file = if path.is_empty() {
            None
        } else {
            let file_kind = match &config.file {
                Some(name) => FileKind::from_name(name)?,
                None => FileKind::default(),
            };
            let mut file = file_kind.create();
            file.open(path, writable, params)?;
            let num_records = load_records(backend.as_ref(), file.as_ref())?;
            debug!(path, num_records, "Loaded records");
            Some(file)
        };

        info!(path, class = kind.class_name(), writable, "Opened database");
        self.state = Some(OpenState {
            backend,
            kind,
            path: path.to_string(),
            writable,
            file,
            timestamp: AtomicU64::new(now_seconds().to_bits()),
            healthy: AtomicBool::new(true),
        });
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let state = self.state.take().ok_or_else(not_open)?;
        let mut status = Status::success();
        if state.writable {
            if let Err(e) = state.save(false) {
                status = status.join(e);
            }
        }
        if let Some(mut file) = state.file {
            if let Err(e) = file.close() {
                status = status.join(e);
            }
        }
        info!(path = %state.path, "Closed database");
        status.into_result()
    }

    fn process(&self, key: &[u8], proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let state = self.state()?;
        state.check_writable(writable)?;
        state.backend.process(key, proc, writable)
    }

    fn process_multi(&self, ops: &mut [ProcessOp<'_>], writable: bool) -> Result<()> {
        let state = self.state()?;
        state.check_writable(writable)?;
        state.backend.process_multi(ops, writable)
    }

    fn process_first(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let state = self.state()?;
        state.check_writable(writable)?;
        state.backend.process_first(proc, writable)
    }

    fn process_each(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        let state = self.state()?;
        state.check_writable(writable)?;
        state.backend.process_each(proc, writable)
    }

    fn count(&self) -> Result<i64> {
        Ok(self.state()?.backend.count() as i64)
    }

    fn file_size(&self) -> Result<i64> {
        let state = self.state()?;
        match &state.file {
            Some(file) => Ok(file.get_size()? as i64),
            None => Ok(state.backend.storage_bytes() as i64),
        }
    }

    fn file_path(&self) -> Result<String> {
        Ok(self.state()?.path.clone())
    }

    fn timestamp(&self) -> Result<f64> {
        Ok(f64::from_bits(self.state()?.timestamp.load(Ordering::SeqCst)))
    }

    fn clear(&self) -> Result<()> {
        let state = self.state()?;
        state.check_writable(true)?;
        state.backend.clear();
        Ok(())
    }

    fn rebuild(&self, params: &Params) -> Result<()> {
        let state = self.state()?;
        state.check_writable(true)?;
        state.backend.rebuild(params)
    }

    fn should_be_rebuilt(&self) -> Result<bool> {
        Ok(self.state()?.backend.should_be_rebuilt())
    }

    fn synchronize(&self, hard: bool, _params: &Params) -> Result<()> {
        let state = self.state()?;
        state.check_writable(true)?;
        state.save(hard)?;
        state
            .timestamp
            .store(now_seconds().to_bits(), Ordering::SeqCst);
        Ok(())
    }

    fn copy_file_data(&self, dest: &str, sync_hard: bool) -> Result<()> {
        let state = self.state()?;
        let mut file = PositionalFile::new();
        file.open(dest, true, &Params::new().with("truncate", true))?;
        let result = save_records(state.backend.as_ref(), &file)
            .and_then(|_| file.synchronize(sync_hard, 0, 0));
        let closed = file.close();
        result.and(closed)
    }

    fn inspect(&self) -> Vec<(String, String)> {
        let Some(state) = &self.state else {
            return Vec::new();
        };
        let mut props = vec![
            ("class".to_string(), state.kind.class_name().to_string()),
            ("path".to_string(), state.path.clone()),
            ("writable".to_string(), state.writable.to_string()),
            ("healthy".to_string(), state.healthy.load(Ordering::SeqCst).to_string()),
        ];
        props.extend(state.backend.inspect());
        props
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn is_writable(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.writable)
    }

    fn is_healthy(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.healthy.load(Ordering::SeqCst))
    }

    fn is_ordered(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.backend.is_ordered())
    }

    fn make_iterator(&self) -> Result<Box<dyn DbmIterator + '_>> {
        let state = self.state()?;
        Ok(Box::new(StoreIterator {
            inner: state.backend.cursor(),
            writable: state.writable,
        }))
    }
}

impl Drop for StoreDbm {
    fn drop(&mut self) {
        if self.state.is_some() {
            warn!("StoreDbm dropped without close, closing now");
            if let Err(e) = self.close() {
                warn!(error = %e, "Failed to close database on drop");
            }
        }
    }
}

/// Back-end cursor that refuses writes through a read-only handle
struct StoreIterator<'a> {
    inner: Box<dyn DbmIterator + 'a>,
    writable: bool,
}

impl DbmIterator for StoreIterator<'_> {
    fn first(&mut self) -> Result<()> {
        self.inner.first()
    }

    fn last(&mut self) -> Result<()> {
        self.inner.last()
    }

    fn jump(&mut self, key: &[u8]) -> Result<()> {
        self.inner.jump(key)
    }

    fn jump_lower(&mut self, key: &[u8], inclusive: bool) -> Result<()> {
        self.inner.jump_lower(key, inclusive)
    }

    fn jump_upper(&mut self, key: &[u8], inclusive: bool) -> Result<()> {
        self.inner.jump_upper(key, inclusive)
    }

    fn next(&mut self) -> Result<()> {
        self.inner.next()
    }

    fn previous(&mut self) -> Result<()> {
        self.inner.previous()
    }

    fn process(&mut self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        if writable && !self.writable {
            return Err(not_writable());
        }
        self.inner.process(proc, writable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polydbm_common::StatusCode;

    fn open_memory(class: &str) -> StoreDbm {
        let mut dbm = StoreDbm::new();
        dbm.open("", true, &Params::new().with("dbm", class)).unwrap();
        dbm
    }

    #[test]
    fn test_unopened_handle() {
        let dbm = StoreDbm::new();
        assert_eq!(dbm.get(b"a").unwrap_err().code(), StatusCode::PreconditionError);
        assert!(!dbm.is_open());
        let mut dbm = dbm;
        assert_eq!(dbm.close().unwrap_err().code(), StatusCode::PreconditionError);
    }

    #[test]
    fn test_double_open() {
        let mut dbm = open_memory("TinyDBM");
        let status = dbm.open("", true, &Params::new().with("dbm", "TinyDBM")).unwrap_err();
        assert_eq!(status.code(), StatusCode::PreconditionError);
        dbm.close().unwrap();
    }

    #[test]
    fn test_file_class_requires_path() {
        let mut dbm = StoreDbm::new();
        let status = dbm.open("", true, &Params::new()).unwrap_err();
        assert_eq!(status.code(), StatusCode::InvalidArgumentError);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("casket.tkt");
        let path = path.to_str().unwrap();

        let mut dbm = StoreDbm::new();
        dbm.open(path, true, &Params::new()).unwrap();
        assert_eq!(dbm.kind(), Some(BackendKind::FileTree));
        dbm.set(b"b", b"2", true).unwrap();
        dbm.set(b"a", b"1", true).unwrap();
        dbm.close().unwrap();

        let mut dbm = StoreDbm::new();
        dbm.open(path, false, &Params::new()).unwrap();
        assert_eq!(dbm.count().unwrap(), 2);
        assert_eq!(dbm.get(b"a").unwrap(), b"1");
        let status = dbm.set(b"c", b"3", true).unwrap_err();
        assert_eq!(status.code(), StatusCode::PreconditionError);
        dbm.close().unwrap();
    }

    #[test]
    fn test_truncate_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("casket.tkh");
        let path = path.to_str().unwrap();

        let mut dbm = StoreDbm::new();
        dbm.open(path, true, &Params::new()).unwrap();
        dbm.set(b"a", b"1", true).unwrap();
        dbm.synchronize(true, &Params::new()).unwrap();
        dbm.close().unwrap();

        let mut dbm = StoreDbm::new();
        dbm.open(path, true, &Params::parse("truncate=true")).unwrap();
        assert_eq!(dbm.count().unwrap(), 0);
        dbm.close().unwrap();
    }

    #[test]
    fn test_copy_file_data() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("copy.tkh");
        let dest = dest.to_str().unwrap();

        let dbm = open_memory("StdHashDBM");
        dbm.set(b"k", b"v", true).unwrap();
        dbm.copy_file_data(dest, false).unwrap();

        let mut copy = StoreDbm::new();
        copy.open(dest, false, &Params::new()).unwrap();
        assert_eq!(copy.get(b"k").unwrap(), b"v");
        copy.close().unwrap();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "re-entered")]
    fn test_processor_reentry_is_caught() {
        let dbm = open_memory("StdTreeDBM");
        dbm.set(b"a", b"1", true).unwrap();
        let _ = dbm.process(
            b"a",
            &mut |_: &[u8], _: Option<&[u8]>| {
                let _ = dbm.get(b"b");
                Directive::Keep
            },
            false,
        );
    }

    #[test]
    fn test_inspect_reports_class() {
        let dbm = open_memory("CacheDBM");
        let props = dbm.inspect();
        assert!(props.contains(&("class".to_string(), "CacheDBM".to_string())));
        assert!(props.iter().any(|(k, _)| k == "cap_rec_num"));
    }
}
