//! Byte-addressed file collaborator
//!
//! Used by the persistent back-ends to hold flat-record images and by
//! applications for line-oriented search over plain files.

mod lock;
pub mod memory;
pub mod positional;

pub use memory::MemoryFile;
pub use positional::PositionalFile;

pub(crate) use lock::{io_status, open_locked, release};

use crate::search::{search_lines, SearchMode};
use polydbm_common::{Params, Result, Status};

/// Raw file operations
pub trait File: Send + Sync {
    /// Open with the same locking options as a DBM
    fn open(&mut self, path: &str, writable: bool, params: &Params) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Read `size` bytes at `off`; INFEASIBLE_ERROR past the end
    fn read(&self, off: u64, size: usize) -> Result<Vec<u8>>;

    fn write(&self, off: u64, data: &[u8]) -> Result<()>;

    /// Write at the end and return the offset written at
    fn append(&self, data: &[u8]) -> Result<u64>;

    fn truncate(&self, size: u64) -> Result<()>;

    /// Flush `size` bytes from `off`; `hard` forces them to the device.
    /// A size of 0 covers the rest of the file.
    fn synchronize(&self, hard: bool, off: u64, size: u64) -> Result<()>;

    fn get_size(&self) -> Result<u64>;

    fn get_path(&self) -> Result<String>;

    fn is_open(&self) -> bool;

    fn is_writable(&self) -> bool;

    /// Lines matching the pattern
    fn search(&self, mode: SearchMode, pattern: &[u8], capacity: usize) -> Result<Vec<Vec<u8>>> {
        let size = self.get_size()?;
        let text = self.read(0, size as usize)?;
        search_lines(&text, mode, pattern, capacity)
    }
}

/// File implementations selectable with the `file` param
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileKind {
    #[default]
    Positional,
    Memory,
}

impl FileKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "positionalparallelfile" | "positionalatomicfile" | "positionalfile" | "pos" => {
                Ok(FileKind::Positional)
            }
            "memorymapparallelfile" | "memorymapatomicfile" | "memoryfile" | "mem" => {
                Ok(FileKind::Memory)
            }
            _ => Err(Status::invalid_argument(format!("unknown file class: {}", name))),
        }
    }

    pub fn create(self) -> Box<dyn File> {
        match self {
            FileKind::Positional => Box::new(PositionalFile::new()),
            FileKind::Memory => Box::new(MemoryFile::new()),
        }
    }
}

pub(crate) fn not_open() -> Status {
    Status::precondition("the file is not open")
}

pub(crate) fn check_range(off: u64, size: usize, file_size: u64) -> Result<()> {
    match off.checked_add(size as u64) {
        Some(end) if end <= file_size => Ok(()),
        _ => Err(Status::infeasible(format!(
            "read of {} bytes at {} exceeds the file size {}",
            size, off, file_size
        ))),
    }
}
