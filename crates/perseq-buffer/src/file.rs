//! Direct (unmapped) file-backed buffer.
//!
//! Every read and write is a positioned syscall via
//! `std::os::unix::fs::FileExt`, so no shared seek position exists and no
//! address-space mapping is held. The kernel page cache already orders
//! same-file writes between sync points, so `barrier(false)` is a no-op
//! and `barrier(true)` maps to `fdatasync`.

use crate::{check_range, PersistentBuffer, ProtectionLevel};
use fs2::FileExt as _;
use perseq_error::{PerseqError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt as _;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::trace;

/// File buffer using positioned read/write syscalls.
///
/// Holds an advisory whole-file lock (shared when read-only, exclusive
/// otherwise) from open until close.
#[derive(Debug)]
pub struct DirectFileBuffer {
    file: File,
    capacity: u64,
    protection_level: ProtectionLevel,
    closed: bool,
    _temp: Option<tempfile::TempPath>,
}

impl DirectFileBuffer {
    /// Opens (creating if absent and writable) the file at `path`.
    pub fn open(path: impl AsRef<Path>, protection_level: ProtectionLevel) -> Result<Self> {
        let read_only = protection_level == ProtectionLevel::ReadOnly;
        let file = if read_only {
            OpenOptions::new().read(true).open(path.as_ref())?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path.as_ref())?
        };
        Self::from_file(file, protection_level, None)
    }

    /// A scratch buffer backed by a temporary file that is deleted when
    /// the buffer is closed or dropped. Protection level is `None`.
    pub fn temporary() -> Result<Self> {
        let (file, path) = NamedTempFile::new()?.into_parts();
        Self::from_file(file, ProtectionLevel::None, Some(path))
    }

    fn from_file(
        file: File,
        protection_level: ProtectionLevel,
        temp: Option<tempfile::TempPath>,
    ) -> Result<Self> {
        if protection_level == ProtectionLevel::ReadOnly {
            file.lock_shared()?;
        } else {
            file.lock_exclusive()?;
        }
        let capacity = file.metadata()?.len();
        Ok(Self {
            file,
            capacity,
            protection_level,
            closed: false,
            _temp: temp,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(PerseqError::Closed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if !self.protection_level.is_writable() {
            return Err(PerseqError::ReadOnly);
        }
        Ok(())
    }
}

impl PersistentBuffer for DirectFileBuffer {
    fn protection_level(&self) -> ProtectionLevel {
        self.protection_level
    }

    fn capacity(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.capacity)
    }

    fn set_capacity(&mut self, new_capacity: u64) -> Result<()> {
        self.check_open()?;
        self.check_writable()?;
        let old_capacity = self.capacity;
        if new_capacity == old_capacity {
            return Ok(());
        }
        self.file.set_len(new_capacity)?;
        self.capacity = new_capacity;
        if new_capacity > old_capacity {
            self.ensure_zeros(old_capacity, new_capacity - old_capacity)?;
        }
        Ok(())
    }

    fn get_some(&self, position: u64, out: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        check_range(position, out.len() as u64, self.capacity)?;
        if out.is_empty() {
            return Ok(0);
        }
        let count = self.file.read_at(out, position)?;
        if count == 0 {
            return Err(PerseqError::StreamUnderflow {
                requested: out.len() as u64,
                remaining: self.capacity.saturating_sub(position),
            });
        }
        Ok(count)
    }

    fn put(&mut self, position: u64, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.check_writable()?;
        check_range(position, data.len() as u64, self.capacity)?;
        self.file.write_all_at(data, position)?;
        Ok(())
    }

    fn barrier(&mut self, force: bool) -> Result<()> {
        self.check_open()?;
        // The page cache preserves ordering between sync points, so only a
        // forced barrier at BARRIER or stronger reaches the media.
        if force && self.protection_level >= ProtectionLevel::Barrier {
            trace!(target: "perseq::buffer", event = "fdatasync");
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.file.unlock()?;
        if let Some(temp) = self._temp.take() {
            temp.close()?;
        }
        Ok(())
    }
}
