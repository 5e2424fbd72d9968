//! VFS file objects
//!
//! A `VfsFile` is one slot of the global handle table: path, backend,
//! cached size, offset, and a lazily loaded content buffer. `open` only
//! asks the backend for the size; the first `read` pulls the full
//! contents.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::FsBackend;
use crate::error::FsError;

/// Longest path a handle can carry.
pub const PATH_MAX: usize = 256;

/// `lseek` whence values, matching the user C library.
pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

/// Stat snapshot the syscall layer serializes for user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: usize,
    pub is_dir: bool,
}

pub struct VfsFile {
    path: String,
    backend: Arc<dyn FsBackend>,
    content: Option<Vec<u8>>,
    size: usize,
    offset: usize,
}

impl VfsFile {
    /// Open `path` on `backend`. Caches the size, not the content.
    pub fn open(backend: Arc<dyn FsBackend>, path: &str) -> Result<Self, FsError> {
        if path.len() >= PATH_MAX {
            return Err(FsError::NotFound);
        }
        let size = backend.file_size(path)?;
        Ok(Self {
            path: String::from(path),
            backend,
            content: None,
            size,
            offset: 0,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the content buffer has been populated (diagnostics/tests).
    pub fn is_loaded(&self) -> bool {
        self.content.is_some()
    }

    /// Pull the full contents from the backend on first use, retrying
    /// transient failures.
    fn ensure_loaded(&mut self) -> Result<(), FsError> {
        if self.content.is_some() {
            return Ok(());
        }
        let mut buf = vec![0u8; self.size];
        let mut last = FsError::IoError;
        for _ in 0..super::READ_RETRIES {
            match self.backend.read_file(&self.path, &mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    self.content = Some(buf);
                    return Ok(());
                }
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Copy from the cached contents at the current offset. Reading at or
    /// past the size is end-of-file: 0 bytes, no error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        if self.offset >= self.size {
            return Ok(0);
        }
        self.ensure_loaded()?;
        let content = self.content.as_ref().expect("loaded above");
        let n = buf.len().min(content.len().saturating_sub(self.offset));
        buf[..n].copy_from_slice(&content[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }

    /// Truncating overwrite through the backend; drops the stale content
    /// cache.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, FsError> {
        let n = self.backend.write_file(&self.path, data)?;
        self.size = data.len();
        self.offset = self.offset.min(self.size);
        self.content = None;
        Ok(n)
    }

    /// Move the cached offset; no I/O. The offset never exceeds the
    /// cached size.
    pub fn lseek(&mut self, offset: i64, whence: u32) -> Result<usize, FsError> {
        let base = match whence {
            SEEK_SET => 0i64,
            SEEK_CUR => self.offset as i64,
            SEEK_END => self.size as i64,
            _ => return Err(FsError::BadHandle),
        };
        let target = base.checked_add(offset).ok_or(FsError::BadHandle)?;
        if target < 0 {
            return Err(FsError::BadHandle);
        }
        self.offset = (target as usize).min(self.size);
        Ok(self.offset)
    }

    pub fn stat(&self) -> FileStat {
        FileStat {
            size: self.size,
            is_dir: self.backend.is_dir(&self.path),
        }
    }
}
