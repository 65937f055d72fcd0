//! Polymorphic embedded key-value store
//!
//! # Features
//! - One `Dbm` facade over hash, tree and LRU cache back-ends
//! - Record processors as the atomic primitive for every mutation
//! - Compare-and-exchange over one or many keys, with Any/Nil sentinels
//! - Sharding with merged iteration for ordered back-ends
//! - Worker-pool async adapter returning one-shot futures
//! - Secondary index over pair-ordered composite keys
//! - Flat-record files for export and import

pub mod asyncdbm;
pub mod backend;
pub mod comparator;
pub mod config;
pub mod dbm;
pub mod file;
pub mod flat;
pub mod future;
pub mod index;
pub mod iterator;
pub mod poly;
pub mod processor;
pub mod search;
pub mod shard;
pub mod store;

pub use polydbm_common::{
    deserialize_float, deserialize_int, serialize_float, serialize_int, Params, Result, ResultExt,
    Status, StatusCode,
};

pub use asyncdbm::AsyncDbm;
pub use backend::{Backend, BackendKind};
pub use comparator::{deserialize_str_pair, serialize_str_pair, KeyComparator};
pub use config::OpenConfig;
pub use dbm::{CasValue, Dbm, OwnedCasValue, INCREMENT_PROBE};
pub use file::{File, FileKind, MemoryFile, PositionalFile};
pub use flat::{FlatRecordReader, FlatRecordWriter};
pub use future::{DbmFuture, Payload};
pub use index::{Index, IndexIterator};
pub use iterator::DbmIterator;
pub use poly::PolyDbm;
pub use processor::{Directive, GetProcessor, ProcessOp, RecordProcessor};
pub use search::SearchMode;
pub use shard::ShardDbm;
pub use store::StoreDbm;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
