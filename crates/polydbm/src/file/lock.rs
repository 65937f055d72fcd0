//! Opening files under OS advisory locks

use crate::config::OpenConfig;
use polydbm_common::{Result, Status};
use std::fs::{self, OpenOptions};
use std::io;
use tracing::{debug, warn};

/// Attach the path to an I/O failure
pub(crate) fn io_status(path: &str, err: io::Error) -> Status {
    let status = Status::from(err);
    Status::with_message(status.code(), format!("{}: {}", path, status.message()))
}

/// Open `path`, take a shared (reader) or exclusive (writer) lock unless
/// `no_lock` is set, then truncate if requested
pub(crate) fn open_locked(path: &str, writable: bool, config: &OpenConfig) -> Result<fs::File> {
    let mut options = OpenOptions::new();
    options.read(true);
    if writable {
        options.write(true).create(!config.no_create);
    }
    let file = options.open(path).map_err(|e| io_status(path, e))?;

    if !config.no_lock {
        acquire(&file, path, writable, config.no_wait)?;
    }
    if writable && config.truncate {
        file.set_len(0).map_err(|e| io_status(path, e))?;
    }
    Ok(file)
}

fn acquire(file: &fs::File, path: &str, exclusive: bool, no_wait: bool) -> Result<()> {
    let locked = match (exclusive, no_wait) {
        (true, true) => fs2::FileExt::try_lock_exclusive(file),
        (true, false) => fs2::FileExt::lock_exclusive(file),
        (false, true) => fs2::FileExt::try_lock_shared(file),
        (false, false) => fs2::FileExt::lock_shared(file),
    };
    locked.map_err(|e| Status::permission(format!("failed to lock {}: {}", path, e)))?;
    debug!(path, exclusive, "Acquired file lock");
    Ok(())
}

/// Release a lock taken by `open_locked`
pub(crate) fn release(file: &fs::File, path: &str) {
    if let Err(e) = fs2::FileExt::unlock(file) {
        warn!(path, error = %e, "Failed to release file lock");
    }
}
