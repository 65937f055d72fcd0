//! Polymorphic DBM
//!
//! `PolyDbm` picks its implementation at open time: a `ShardDbm` when
//! `num_shards` is given or a shard family already exists at the path,
//! otherwise a `StoreDbm` whose back-end comes from the `dbm` param or the
//! path extension.

use crate::config::OpenConfig;
use crate::dbm::Dbm;
use crate::iterator::DbmIterator;
use crate::processor::{ProcessOp, RecordProcessor};
use crate::shard::{detect_num_shards, ShardDbm};
use crate::store::StoreDbm;
use polydbm_common::{Params, Result, Status};

fn not_open() -> Status {
    Status::precondition("the database is not open")
}

/// DBM handle that dispatches to the implementation chosen on open
#[derive(Default)]
pub struct PolyDbm {
    inner: Option<Box<dyn Dbm>>,
}

impl PolyDbm {
    pub fn new() -> Self {
        Self { inner: None }
    }

    fn inner(&self) -> Result<&dyn Dbm> {
        self.inner.as_deref().ok_or_else(not_open)
    }

    /// True if the open database is split over shards
    pub fn is_sharded(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|dbm| dbm.inspect().iter().any(|(k, _)| k == "num_shards"))
    }
}

impl Dbm for PolyDbm {
    fn open(&mut self, path: &str, writable: bool, params: &Params) -> Result<()> {
        if self.inner.is_some() {
            return Err(Status::precondition("the database is already open"));
        }
        let config = OpenConfig::from_params(params);
        let sharded =
            config.num_shards > 0 || (!config.truncate && detect_num_shards(path) > 0);
        let mut dbm: Box<dyn Dbm> = if sharded {
            Box::new(ShardDbm::new())
        } else {
            Box::new(StoreDbm::new())
        };
        dbm.open(path, writable, params)?;
        self.inner = Some(dbm);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut dbm = self.inner.take().ok_or_else(not_open)?;
        dbm.close()
    }

    fn process(&self, key: &[u8], proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        self.inner()?.process(key, proc, writable)
    }

    fn process_multi(&self, ops: &mut [ProcessOp<'_>], writable: bool) -> Result<()> {
        self.inner()?.process_multi(ops, writable)
    }

    fn process_first(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        self.inner()?.process_first(proc, writable)
    }

    fn process_each(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()> {
        self.inner()?.process_each(proc, writable)
    }

    fn count(&self) -> Result<i64> {
        self.inner()?.count()
    }

    fn file_size(&self) -> Result<i64> {
        self.inner()?.file_size()
    }

    fn file_path(&self) -> Result<String> {
        self.inner()?.file_path()
    }

    fn timestamp(&self) -> Result<f64> {
        self.inner()?.timestamp()
    }

    fn clear(&self) -> Result<()> {
        self.inner()?.clear()
    }

    fn rebuild(&self, params: &Params) -> Result<()> {
        self.inner()?.rebuild(params)
    }

    fn should_be_rebuilt(&self) -> Result<bool> {
        self.inner()?.should_be_rebuilt()
    }

    fn synchronize(&self, hard: bool, params: &Params) -> Result<()> {
        self.inner()?.synchronize(hard, params)
    }

    fn copy_file_data(&self, dest: &str, sync_hard: bool) -> Result<()> {
        self.inner()?.copy_file_data(dest, sync_hard)
    }

    fn inspect(&self) -> Vec<(String, String)> {
        self.inner.as_ref().map(|dbm| dbm.inspect()).unwrap_or_default()
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    fn is_writable(&self) -> bool {
        self.inner.as_ref().is_some_and(|dbm| dbm.is_writable())
    }

    fn is_healthy(&self) -> bool {
        self.inner.as_ref().is_some_and(|dbm| dbm.is_healthy())
    }

    fn is_ordered(&self) -> bool {
        self.inner.as_ref().is_some_and(|dbm| dbm.is_ordered())
    }

    fn make_iterator(&self) -> Result<Box<dyn DbmIterator + '_>> {
        self.inner()?.make_iterator()
    }
}
