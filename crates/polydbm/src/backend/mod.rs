//! Storage back-ends
//!
//! A back-end owns the records and the locks that protect them. The DBM
//! layer only ever reaches the records through processors, so every
//! higher-level operation inherits the back-end's per-record atomicity.

pub mod cache;
pub mod hash;
pub mod tree;

pub use cache::CacheBackend;
pub use hash::HashBackend;
pub use tree::TreeBackend;

use crate::comparator::KeyComparator;
use crate::config::{OpenConfig, DEFAULT_CAP_REC_NUM, DEFAULT_NUM_BUCKETS};
use crate::iterator::DbmIterator;
use crate::processor::{Directive, ProcessOp, RecordProcessor};
use polydbm_common::{Params, Result, Status};
use std::path::Path;

/// Record storage driven by processors
pub trait Backend: Send + Sync {
    fn is_ordered(&self) -> bool;

    /// Run `proc` on one record while holding its lock
    fn process(&self, key: &[u8], proc: &mut dyn RecordProcessor, writable: bool) -> Result<()>;

    /// Run every op in order while holding the locks of all listed keys
    fn process_multi(&self, ops: &mut [ProcessOp<'_>], writable: bool) -> Result<()>;

    /// Run `proc` on the first record in iteration order
    fn process_first(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()>;

    /// Run `proc` on every record, with boundary calls before and after
    fn process_each(&self, proc: &mut dyn RecordProcessor, writable: bool) -> Result<()>;

    fn count(&self) -> usize;

    /// Total bytes of keys and values held
    fn storage_bytes(&self) -> u64;

    fn clear(&self);

    fn rebuild(&self, params: &Params) -> Result<()>;

    fn should_be_rebuilt(&self) -> bool;

    fn cursor(&self) -> Box<dyn DbmIterator + '_>;

    /// Back-end specific properties
    fn inspect(&self) -> Vec<(String, String)>;
}

/// Identity of a back-end for the re-entrancy guard
pub(crate) fn owner_id<T: ?Sized>(value: &T) -> usize {
    value as *const T as *const () as usize
}

/// Reject mutations requested by a read-only processing call
pub(crate) fn check_writable(directive: &Directive, writable: bool) -> Result<()> {
    if !writable && directive.is_mutation() {
        return Err(Status::invalid_argument(
            "a read-only processor returned a mutating directive",
        ));
    }
    Ok(())
}

/// Back-end classes selectable by path extension or the `dbm` param
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    #[default]
    FileHash,
    FileTree,
    FileSkip,
    TinyHash,
    BabyTree,
    Cache,
    StdHash,
    StdTree,
}

impl BackendKind {
    const ALL: [BackendKind; 8] = [
        BackendKind::FileHash,
        BackendKind::FileTree,
        BackendKind::FileSkip,
        BackendKind::TinyHash,
        BackendKind::BabyTree,
        BackendKind::Cache,
        BackendKind::StdHash,
        BackendKind::StdTree,
    ];

    pub fn class_name(self) -> &'static str {
        match self {
            BackendKind::FileHash => "HashDBM",
            BackendKind::FileTree => "TreeDBM",
            BackendKind::FileSkip => "SkipDBM",
            BackendKind::TinyHash => "TinyDBM",
            BackendKind::BabyTree => "BabyDBM",
            BackendKind::Cache => "CacheDBM",
            BackendKind::StdHash => "StdHashDBM",
            BackendKind::StdTree => "StdTreeDBM",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            BackendKind::FileHash => "tkh",
            BackendKind::FileTree => "tkt",
            BackendKind::FileSkip => "tks",
            BackendKind::TinyHash => "tkmt",
            BackendKind::BabyTree => "tkmb",
            BackendKind::Cache => "tkmc",
            BackendKind::StdHash => "tksh",
            BackendKind::StdTree => "tkst",
        }
    }

    /// Look up a class by name, e.g. `TreeDBM`, `tree` or `stdhash`
    pub fn from_name(name: &str) -> Result<Self> {
        let wanted = name.trim().to_ascii_lowercase();
        let wanted = wanted.strip_suffix("dbm").unwrap_or(&wanted);
        Self::ALL
            .iter()
            .copied()
            .find(|kind| {
                let class = kind.class_name().to_ascii_lowercase();
                class.strip_suffix("dbm") == Some(wanted)
            })
            .ok_or_else(|| Status::invalid_argument(format!("unknown database class: {}", name)))
    }

    /// Infer the class from the path extension; HashDBM when unknown
    pub fn from_path(path: &str) -> Self {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.extension() == ext)
            .unwrap_or(BackendKind::FileHash)
    }

    /// File classes need a path; in-memory classes may run without one
    pub fn requires_path(self) -> bool {
        matches!(
            self,
            BackendKind::FileHash | BackendKind::FileTree | BackendKind::FileSkip
        )
    }

    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            BackendKind::FileTree
                | BackendKind::FileSkip
                | BackendKind::BabyTree
                | BackendKind::StdTree
        )
    }

    /// Comparator configured for an ordered class
    pub fn comparator(self, config: &OpenConfig) -> Result<KeyComparator> {
        match &config.key_comparator {
            Some(name) if self.is_ordered() => KeyComparator::from_name(name),
            _ => Ok(KeyComparator::Lexical),
        }
    }

    /// Construct an empty back-end of this class
    pub fn build(self, config: &OpenConfig) -> Result<Box<dyn Backend>> {
        let backend: Box<dyn Backend> = match self {
            BackendKind::FileHash | BackendKind::TinyHash | BackendKind::StdHash => Box::new(
                HashBackend::new(config.num_buckets.unwrap_or(DEFAULT_NUM_BUCKETS)),
            ),
            BackendKind::FileTree
            | BackendKind::FileSkip
            | BackendKind::BabyTree
            | BackendKind::StdTree => Box::new(TreeBackend::new(self.comparator(config)?)),
            BackendKind::Cache => Box::new(CacheBackend::new(
                config.cap_rec_num.unwrap_or(DEFAULT_CAP_REC_NUM),
                config.cap_mem_size.unwrap_or(0),
            )),
        };
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_path() {
        assert_eq!(BackendKind::from_path("casket.tkh"), BackendKind::FileHash);
        assert_eq!(BackendKind::from_path("/tmp/a.TKT"), BackendKind::FileTree);
        assert_eq!(BackendKind::from_path("x.tkmc"), BackendKind::Cache);
        assert_eq!(BackendKind::from_path("x.tkst"), BackendKind::StdTree);
        assert_eq!(BackendKind::from_path("noext"), BackendKind::FileHash);
        assert_eq!(BackendKind::from_path(""), BackendKind::FileHash);
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(BackendKind::from_name("TreeDBM").unwrap(), BackendKind::FileTree);
        assert_eq!(BackendKind::from_name("baby").unwrap(), BackendKind::BabyTree);
        assert_eq!(BackendKind::from_name("StdHash").unwrap(), BackendKind::StdHash);
        assert!(BackendKind::from_name("btree").is_err());
    }

    #[test]
    fn test_build_respects_ordering() {
        let config = OpenConfig::default().with_key_comparator("Decimal");
        for kind in BackendKind::ALL {
            let backend = kind.build(&config).unwrap();
            assert_eq!(backend.is_ordered(), kind.is_ordered());
        }
        let bad = OpenConfig::default().with_key_comparator("Nope");
        assert!(BackendKind::BabyTree.build(&bad).is_err());
        assert!(BackendKind::TinyHash.build(&bad).is_ok());
    }
}
