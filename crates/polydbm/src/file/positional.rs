//! On-disk file with positional I/O
//!
//! Reads and writes go straight to the OS at explicit offsets through one
//! shared handle, so concurrent callers never race on a seek position.
//! Appends reserve their range with an atomic add on the logical size.

use super::{check_range, io_status, not_open, open_locked, release, File};
use crate::config::OpenConfig;
use polydbm_common::{Params, Result, Status};
use std::fs;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[cfg(unix)]
pub(crate) fn read_at(file: &fs::File, buf: &mut [u8], off: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, off)
}

#[cfg(unix)]
pub(crate) fn write_at(file: &fs::File, data: &[u8], off: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, data, off)
}

#[cfg(windows)]
pub(crate) fn read_at(file: &fs::File, buf: &mut [u8], off: u64) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = std::os::windows::fs::FileExt::seek_read(file, &mut buf[done..], off + done as u64)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        done += n;
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn write_at(file: &fs::File, data: &[u8], off: u64) -> io::Result<()> {
    let mut done = 0;
    while done < data.len() {
        let n = std::os::windows::fs::FileExt::seek_write(file, &data[done..], off + done as u64)?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        done += n;
    }
    Ok(())
}

struct OpenState {
    handle: fs::File,
    path: String,
    writable: bool,
    locked: bool,
}

/// File accessed with `pread`/`pwrite` style calls
pub struct PositionalFile {
    state: Option<OpenState>,
    size: AtomicU64,
}

impl PositionalFile {
    pub fn new() -> Self {
        Self {
            state: None,
            size: AtomicU64::new(0),
        }
    }

    fn state(&self) -> Result<&OpenState> {
        self.state.as_ref().ok_or_else(not_open)
    }

    fn writable_state(&self) -> Result<&OpenState> {
        let state = self.state()?;
        if !state.writable {
            return Err(Status::precondition("the file is not writable"));
        }
        Ok(state)
    }
}

impl Default for PositionalFile {
    fn default() -> Self {
        Self::new()
    }
}

impl File for PositionalFile {
    fn open(&mut self, path: &str, writable: bool, params: &Params) -> Result<()> {
        if self.state.is_some() {
            return Err(Status::precondition("the file is already open"));
        }
        let config = OpenConfig::from_params(params);
        let handle = open_locked(path, writable, &config)?;
        let size = handle.metadata().map_err(|e| io_status(path, e))?.len();
        self.size.store(size, Ordering::SeqCst);
        self.state = Some(OpenState {
            handle,
            path: path.to_string(),
            writable,
            locked: !config.no_lock,
        });
        debug!(path, writable, size, "Opened positional file");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let state = self.state.take().ok_or_else(not_open)?;
        let mut result = Ok(());
        if state.writable {
            let size = self.size.load(Ordering::SeqCst);
            result = state
                .handle
                .set_len(size)
                .map_err(|e| io_status(&state.path, e));
        }
        if state.locked {
            release(&state.handle, &state.path);
        }
        self.size.store(0, Ordering::SeqCst);
        result
    }

    fn read(&self, off: u64, size: usize) -> Result<Vec<u8>> {
        let state = self.state()?;
        check_range(off, size, self.size.load(Ordering::SeqCst))?;
        let mut buf = vec![0u8; size];
        read_at(&state.handle, &mut buf, off).map_err(|e| io_status(&state.path, e))?;
        Ok(buf)
    }

    fn write(&self, off: u64, data: &[u8]) -> Result<()> {
        let state = self.writable_state()?;
        write_at(&state.handle, data, off).map_err(|e| io_status(&state.path, e))?;
        self.size.fetch_max(off + data.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn append(&self, data: &[u8]) -> Result<u64> {
        let state = self.writable_state()?;
        let off = self.size.fetch_add(data.len() as u64, Ordering::SeqCst);
        write_at(&state.handle, data, off).map_err(|e| io_status(&state.path, e))?;
        Ok(off)
    }

    fn truncate(&self, size: u64) -> Result<()> {
        let state = self.writable_state()?;
        state
            .handle
            .set_len(size)
            .map_err(|e| io_status(&state.path, e))?;
        self.size.store(size, Ordering::SeqCst);
        Ok(())
    }

    fn synchronize(&self, hard: bool, _off: u64, _size: u64) -> Result<()> {
        let state = self.writable_state()?;
        if hard {
            state
                .handle
                .sync_data()
                .map_err(|e| io_status(&state.path, e))?;
        }
        Ok(())
    }

    fn get_size(&self) -> Result<u64> {
        self.state()?;
        Ok(self.size.load(Ordering::SeqCst))
    }

    fn get_path(&self) -> Result<String> {
        Ok(self.state()?.path.clone())
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn is_writable(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.writable)
    }
}

impl Drop for PositionalFile {
    fn drop(&mut self) {
        if self.state.is_some() {
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "Failed to close positional file on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchMode;
    use polydbm_common::StatusCode;

    fn open_temp(dir: &tempfile::TempDir) -> (PositionalFile, String) {
        let path = dir.path().join("data.txt").to_str().unwrap().to_string();
        let mut file = PositionalFile::new();
        file.open(&path, true, &Params::new()).unwrap();
        (file, path)
    }

    #[test]
    fn test_write_read_append() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, path) = open_temp(&dir);
        file.write(0, b"hello").unwrap();
        assert_eq!(file.append(b" world").unwrap(), 5);
        assert_eq!(file.get_size().unwrap(), 11);
        assert_eq!(file.read(6, 5).unwrap(), b"world");
        assert_eq!(file.read(8, 5).unwrap_err().code(), StatusCode::InfeasibleError);
        file.synchronize(true, 0, 0).unwrap();
        file.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn test_truncate_and_reopen_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, path) = open_temp(&dir);
        file.append(b"0123456789").unwrap();
        file.truncate(4).unwrap();
        file.close().unwrap();

        let mut reader = PositionalFile::new();
        reader.open(&path, false, &Params::new()).unwrap();
        assert_eq!(reader.get_size().unwrap(), 4);
        assert_eq!(reader.write(0, b"x").unwrap_err().code(), StatusCode::PreconditionError);
        assert_eq!(reader.get_path().unwrap(), path);
    }

    #[test]
    fn test_search_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (file, _) = open_temp(&dir);
        file.append(b"apple\nbanana\napricot\n").unwrap();
        let lines = file.search(SearchMode::Begin, b"ap", 0).unwrap();
        assert_eq!(lines, vec![b"apple".to_vec(), b"apricot".to_vec()]);
    }
}
