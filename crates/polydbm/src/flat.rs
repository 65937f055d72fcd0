//! Flat record files
//!
//! A flat record file is a bare sequence of frames with no header:
//!
//! ```text
//! Frame: [KeyLen:4 | ValueLen:4 | Key:K | Value:V | CRC32:4]
//! ```
//!
//! Lengths and the checksum are big-endian. The checksum covers everything
//! in the frame before it. Persistent back-ends keep their records in this
//! format, and `export_to_flat_records`/`import_from_flat_records` use it
//! for migration between databases.

use crate::dbm::Dbm;
use crate::file::File;
use polydbm_common::{Result, Status, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

/// Fixed bytes per frame besides the key and value
pub const FRAME_OVERHEAD: usize = 12;

/// Write buffer and read chunk size
const CHUNK_SIZE: usize = 64 * 1024;

/// Damage found while decoding frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlatRecordError {
    #[error("truncated record at offset {offset}")]
    Truncated { offset: u64 },

    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },
}

impl From<FlatRecordError> for Status {
    fn from(err: FlatRecordError) -> Self {
        Status::broken_data(err.to_string())
    }
}

/// Append one frame to `buf`
pub fn encode_frame(buf: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    let start = buf.len();
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    let crc = crc32fast::hash(&buf[start..]);
    buf.extend_from_slice(&crc.to_be_bytes());
}

/// Buffered frame writer appending to a file
pub struct FlatRecordWriter<'a> {
    file: &'a dyn File,
    buffer: Vec<u8>,
    num_records: u64,
}

impl<'a> FlatRecordWriter<'a> {
    pub fn new(file: &'a dyn File) -> Self {
        Self {
            file,
            buffer: Vec::with_capacity(CHUNK_SIZE),
            num_records: 0,
        }
    }

    pub fn write(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        encode_frame(&mut self.buffer, key, value);
        self.num_records += 1;
        if self.buffer.len() >= CHUNK_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.file.append(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Flush buffered frames and return the number of records written
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;
        Ok(self.num_records)
    }
}

impl Drop for FlatRecordWriter<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "Failed to flush flat records on drop");
        }
    }
}

/// Sequential frame reader over a file
pub struct FlatRecordReader<'a> {
    file: &'a dyn File,
    file_size: u64,
    /// File offset of `buffer[0]`
    buffer_offset: u64,
    buffer: Vec<u8>,
    pos: usize,
}

impl<'a> FlatRecordReader<'a> {
    pub fn new(file: &'a dyn File) -> Result<Self> {
        Ok(Self {
            file,
            file_size: file.get_size()?,
            buffer_offset: 0,
            buffer: Vec::new(),
            pos: 0,
        })
    }

    fn offset(&self) -> u64 {
        self.buffer_offset + self.pos as u64
    }

    /// Make at least `len` unread bytes available; false at a clean end
    fn fill(&mut self, len: usize) -> Result<bool> {
        let available = self.buffer.len() - self.pos;
        if available >= len {
            return Ok(true);
        }
        let file_offset = self.buffer_offset + self.buffer.len() as u64;
        let remaining = self.file_size - file_offset;
        if (available as u64) + remaining < len as u64 {
            return Ok(false);
        }
        self.buffer.drain(..self.pos);
        self.buffer_offset += self.pos as u64;
        self.pos = 0;
        let want = (len - available).max(CHUNK_SIZE) as u64;
        let chunk = self.file.read(file_offset, want.min(remaining) as usize)?;
        self.buffer.extend_from_slice(&chunk);
        Ok(true)
    }

    /// Next record, or None at the end of the file
    pub fn read(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let offset = self.offset();
        if offset >= self.file_size {
            return Ok(None);
        }
        if !self.fill(8)? {
            return Err(FlatRecordError::Truncated { offset }.into());
        }
        let header = &self.buffer[self.pos..self.pos + 8];
        let key_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let value_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let frame_len = FRAME_OVERHEAD + key_len + value_len;
        if !self.fill(frame_len)? {
            return Err(FlatRecordError::Truncated { offset }.into());
        }

        let frame = &self.buffer[self.pos..self.pos + frame_len];
        let body = &frame[..frame_len - 4];
        let tail = &frame[frame_len - 4..];
        let expected = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(FlatRecordError::ChecksumMismatch {
                offset,
                expected,
                actual,
            }
            .into());
        }
        let key = body[8..8 + key_len].to_vec();
        let value = body[8 + key_len..].to_vec();
        self.pos += frame_len;
        Ok(Some((key, value)))
    }
}

/// Write every record of `dbm` to `dest` in iteration order
pub fn export_records<D: Dbm + ?Sized>(dbm: &D, dest: &dyn File) -> Result<u64> {
    let mut writer = FlatRecordWriter::new(dest);
    let mut iter = dbm.make_iterator()?;
    iter.first()?;
    loop {
        match iter.step() {
            Ok((key, value)) => writer.write(&key, &value)?,
            Err(status) if status == StatusCode::NotFoundError => break,
            Err(status) => return Err(status),
        }
    }
    let num_records = writer.finish()?;
    debug!(num_records, "Exported flat records");
    Ok(num_records)
}

/// Store every record of `src` into `dbm`, overwriting existing keys
pub fn import_records<D: Dbm + ?Sized>(dbm: &D, src: &dyn File) -> Result<u64> {
    let mut reader = FlatRecordReader::new(src)?;
    let mut num_records = 0;
    while let Some((key, value)) = reader.read()? {
        dbm.set(&key, &value, true)?;
        num_records += 1;
    }
    debug!(num_records, "Imported flat records");
    Ok(num_records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;
    use polydbm_common::Params;

    fn volatile() -> MemoryFile {
        let mut file = MemoryFile::new();
        file.open("", true, &Params::new()).unwrap();
        file
    }

    #[test]
    fn test_frame_layout() {
        let mut buf = Vec::new();
        encode_frame(&mut buf, b"ab", b"xyz");
        assert_eq!(buf.len(), FRAME_OVERHEAD + 5);
        assert_eq!(&buf[..8], &[0, 0, 0, 2, 0, 0, 0, 3]);
        assert_eq!(&buf[8..13], b"abxyz");
        let crc = crc32fast::hash(&buf[..13]);
        assert_eq!(&buf[13..], &crc.to_be_bytes());
    }

    #[test]
    fn test_reader_handles_many_chunks() {
        let file = volatile();
        let mut writer = FlatRecordWriter::new(&file);
        let value = vec![7u8; 1000];
        for i in 0..200u32 {
            writer.write(&i.to_be_bytes(), &value).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 200);

        let mut reader = FlatRecordReader::new(&file).unwrap();
        let mut count = 0u32;
        while let Some((key, value)) = reader.read().unwrap() {
            assert_eq!(key, count.to_be_bytes());
            assert_eq!(value.len(), 1000);
            count += 1;
        }
        assert_eq!(count, 200);
    }

    #[test]
    fn test_empty_records() {
        let file = volatile();
        let mut writer = FlatRecordWriter::new(&file);
        writer.write(b"", b"").unwrap();
        writer.finish().unwrap();
        let mut reader = FlatRecordReader::new(&file).unwrap();
        assert_eq!(reader.read().unwrap(), Some((Vec::new(), Vec::new())));
        assert_eq!(reader.read().unwrap(), None);
    }

    #[test]
    fn test_detects_corruption() {
        let file = volatile();
        let mut buf = Vec::new();
        encode_frame(&mut buf, b"key", b"value");
        buf[9] ^= 0xff;
        file.append(&buf).unwrap();
        let status = FlatRecordReader::new(&file).unwrap().read().unwrap_err();
        assert_eq!(status.code(), StatusCode::BrokenDataError);
    }

    #[test]
    fn test_detects_truncation() {
        let file = volatile();
        let mut buf = Vec::new();
        encode_frame(&mut buf, b"key", b"value");
        file.append(&buf[..buf.len() - 2]).unwrap();
        let status = FlatRecordReader::new(&file).unwrap().read().unwrap_err();
        assert_eq!(status.code(), StatusCode::BrokenDataError);
        assert!(status.message().contains("truncated"));
    }
}
