//! File buffered entirely in memory
//!
//! Contents are loaded on open and written back on `synchronize` and on
//! `close` when writable. An empty path gives a volatile file.

use super::positional::{read_at, write_at};
use super::{check_range, io_status, not_open, open_locked, release, File};
use crate::config::OpenConfig;
use parking_lot::RwLock;
use polydbm_common::{Params, Result, Status};
use std::fs;
use tracing::debug;

struct Backing {
    handle: fs::File,
    locked: bool,
}

/// In-memory buffer with an optional file behind it
pub struct MemoryFile {
    data: RwLock<Vec<u8>>,
    backing: Option<Backing>,
    path: String,
    open: bool,
    writable: bool,
}

impl MemoryFile {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            backing: None,
            path: String::new(),
            open: false,
            writable: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(not_open())
        }
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if !self.writable {
            return Err(Status::precondition("the file is not writable"));
        }
        Ok(())
    }

    fn write_back(&self, hard: bool) -> Result<()> {
        let Some(backing) = &self.backing else {
            return Ok(());
        };
        let data = self.data.read();
        write_at(&backing.handle, &data, 0).map_err(|e| io_status(&self.path, e))?;
        backing
            .handle
            .set_len(data.len() as u64)
            .map_err(|e| io_status(&self.path, e))?;
        if hard {
            backing
                .handle
                .sync_data()
                .map_err(|e| io_status(&self.path, e))?;
        }
        Ok(())
    }
}

impl Default for MemoryFile {
    fn default() -> Self {
        Self::new()
    }
}

impl File for MemoryFile {
    fn open(&mut self, path: &str, writable: bool, params: &Params) -> Result<()> {
        if self.open {
            return Err(Status::precondition("the file is already open"));
        }
        let mut data = Vec::new();
        if !path.is_empty() {
            let config = OpenConfig::from_params(params);
            let handle = open_locked(path, writable, &config)?;
            let size = handle.metadata().map_err(|e| io_status(path, e))?.len();
            data = vec![0u8; size as usize];
            read_at(&handle, &mut data, 0).map_err(|e| io_status(path, e))?;
            self.backing = Some(Backing {
                handle,
                locked: !config.no_lock,
            });
        }
        debug!(path, writable, size = data.len(), "Opened memory file");
        *self.data.write() = data;
        self.path = path.to_string();
        self.open = true;
        self.writable = writable;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.check_open()?;
        let result = if self.writable {
            self.write_back(false)
        } else {
            Ok(())
        };
        if let Some(backing) = self.backing.take() {
            if backing.locked {
                release(&backing.handle, &self.path);
            }
        }
        self.data.write().clear();
        self.open = false;
        result
    }

    fn read(&self, off: u64, size: usize) -> Result<Vec<u8>> {
        self.check_open()?;
        let data = self.data.read();
        check_range(off, size, data.len() as u64)?;
        let start = off as usize;
        Ok(data[start..start + size].to_vec())
    }

    fn write(&self, off: u64, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut buf = self.data.write();
        let start = off as usize;
        let end = start + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn append(&self, data: &[u8]) -> Result<u64> {
        self.check_writable()?;
        let mut buf = self.data.write();
        let off = buf.len() as u64;
        buf.extend_from_slice(data);
        Ok(off)
    }

    fn truncate(&self, size: u64) -> Result<()> {
        self.check_writable()?;
        self.data.write().resize(size as usize, 0);
        Ok(())
    }

    fn synchronize(&self, hard: bool, _off: u64, _size: u64) -> Result<()> {
        self.check_writable()?;
        self.write_back(hard)
    }

    fn get_size(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.data.read().len() as u64)
    }

    fn get_path(&self) -> Result<String> {
        self.check_open()?;
        Ok(self.path.clone())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn is_writable(&self) -> bool {
        self.open && self.writable
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "Failed to close memory file on drop");
            }
        }
    }
}
