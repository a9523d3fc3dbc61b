//! Memory-mapped buffer variants.
//!
//! [`MappedBuffer`] maps the whole file as one region and is limited to
//! 2^31 − 1 bytes. [`SegmentedMappedBuffer`] splits the address space into
//! 2^30-byte segments, each mapped independently, and supports capacities
//! up to `2^30 * (2^31 - 2)` bytes. Integer reads that straddle a segment
//! boundary are reconstructed byte-wise through the generic read path.
//!
//! These are the only modules in the workspace that touch `unsafe`: the
//! mmap calls themselves. All access past that point is bounds-checked
//! slice indexing.

use crate::{check_range, PersistentBuffer, ProtectionLevel};
use fs2::FileExt as _;
use memmap2::{Mmap, MmapMut, MmapOptions};
use perseq_error::{PerseqError, Result};
use std::fs::{File, OpenOptions};
use std::path::Path;
use tempfile::NamedTempFile;

/// Largest capacity a single mapping supports.
pub const MAPPED_MAX_CAPACITY: u64 = i32::MAX as u64;

const SEGMENT_SHIFT: u32 = 30;
const SEGMENT_SIZE: u64 = 1 << SEGMENT_SHIFT;
const SEGMENT_INDEX_MASK: u64 = SEGMENT_SIZE - 1;

/// Largest capacity the segmented variant supports.
pub const SEGMENTED_MAX_CAPACITY: u64 = SEGMENT_SIZE * (i32::MAX as u64 - 1);

#[derive(Debug)]
enum Segment {
    Ro(Mmap),
    Rw(MmapMut),
}

impl Segment {
    #[allow(unsafe_code)]
    fn map(file: &File, offset: u64, len: u64, writable: bool) -> Result<Self> {
        let len = usize::try_from(len).map_err(|_| PerseqError::Format(
            "mapping segment larger than the address space".to_owned(),
        ))?;
        // SAFETY: the advisory file lock taken at open time guarantees no
        // other process mutates the file while the mapping is live, and the
        // mapping never extends past the file length set by the caller.
        let segment = unsafe {
            let mut options = MmapOptions::new();
            options.offset(offset).len(len);
            if writable {
                Self::Rw(options.map_mut(file)?)
            } else {
                Self::Ro(options.map(file)?)
            }
        };
        Ok(segment)
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Ro(map) => &map[..],
            Self::Rw(map) => &map[..],
        }
    }

    fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        match self {
            Self::Ro(_) => Err(PerseqError::ReadOnly),
            Self::Rw(map) => Ok(&mut map[..]),
        }
    }

    fn flush(&self) -> Result<()> {
        if let Self::Rw(map) = self {
            map.flush()?;
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }
}

fn open_locked(path: &Path, protection_level: ProtectionLevel) -> Result<File> {
    let read_only = protection_level == ProtectionLevel::ReadOnly;
    let file = if read_only {
        OpenOptions::new().read(true).open(path)?
    } else {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?
    };
    if read_only {
        file.lock_shared()?;
    } else {
        file.lock_exclusive()?;
    }
    Ok(file)
}

/// Buffer backed by a single contiguous mapping of the whole file.
///
/// Barriers flush the mapping when anything was modified; there is no way
/// to order mapped writes without an msync, so the force flag does not
/// change behavior beyond the protection-level gate.
#[derive(Debug)]
pub struct MappedBuffer {
    file: File,
    map: Option<Segment>,
    capacity: u64,
    protection_level: ProtectionLevel,
    modified: bool,
    closed: bool,
    _temp: Option<tempfile::TempPath>,
}

impl MappedBuffer {
    /// Opens (creating if absent and writable) the file at `path`.
    pub fn open(path: impl AsRef<Path>, protection_level: ProtectionLevel) -> Result<Self> {
        let file = open_locked(path.as_ref(), protection_level)?;
        Self::from_file(file, protection_level, None)
    }

    /// A scratch buffer backed by a temporary file that is deleted when
    /// the buffer is closed or dropped. Protection level is `None`.
    pub fn temporary() -> Result<Self> {
        let (file, path) = NamedTempFile::new()?.into_parts();
        file.lock_exclusive()?;
        Self::from_file(file, ProtectionLevel::None, Some(path))
    }

    fn from_file(
        file: File,
        protection_level: ProtectionLevel,
        temp: Option<tempfile::TempPath>,
    ) -> Result<Self> {
        let capacity = file.metadata()?.len();
        if capacity > MAPPED_MAX_CAPACITY {
            return Err(PerseqError::Format(format!(
                "file of {capacity} bytes exceeds single-mapping limit {MAPPED_MAX_CAPACITY}"
            )));
        }
        let mut buffer = Self {
            file,
            map: None,
            capacity,
            protection_level,
            modified: false,
            closed: false,
            _temp: temp,
        };
        buffer.remap()?;
        Ok(buffer)
    }

    fn remap(&mut self) -> Result<()> {
        self.map = if self.capacity == 0 {
            None
        } else {
            Some(Segment::map(
                &self.file,
                0,
                self.capacity,
                self.protection_level.is_writable(),
            )?)
        };
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(PerseqError::Closed);
        }
        Ok(())
    }

    fn flush_if_modified(&mut self) -> Result<()> {
        if self.modified {
            if self.protection_level >= ProtectionLevel::Barrier {
                if let Some(map) = &self.map {
                    map.flush()?;
                }
            }
            self.modified = false;
        }
        Ok(())
    }
}

impl PersistentBuffer for MappedBuffer {
    fn protection_level(&self) -> ProtectionLevel {
        self.protection_level
    }

    fn capacity(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.capacity)
    }

    fn set_capacity(&mut self, new_capacity: u64) -> Result<()> {
        self.check_open()?;
        if !self.protection_level.is_writable() {
            return Err(PerseqError::ReadOnly);
        }
        if new_capacity > MAPPED_MAX_CAPACITY {
            return Err(PerseqError::Format(format!(
                "capacity {new_capacity} exceeds single-mapping limit {MAPPED_MAX_CAPACITY}"
            )));
        }
        let old_capacity = self.capacity;
        if new_capacity == old_capacity {
            return Ok(());
        }
        // The old mapping must be flushed and dropped before the file
        // shrinks underneath it.
        self.flush_if_modified()?;
        self.map = None;
        self.file.set_len(new_capacity)?;
        self.capacity = new_capacity;
        self.remap()?;
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
        let map = self.map.as_ref().expect("non-zero capacity implies a mapping");
        let start = position as usize;
        out.copy_from_slice(&map.as_slice()[start..start + out.len()]);
        Ok(out.len())
    }

    fn put(&mut self, position: u64, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if !self.protection_level.is_writable() {
            return Err(PerseqError::ReadOnly);
        }
        check_range(position, data.len() as u64, self.capacity)?;
        if data.is_empty() {
            return Ok(());
        }
        let map = self.map.as_mut().expect("non-zero capacity implies a mapping");
        let start = position as usize;
        map.as_mut_slice()?[start..start + data.len()].copy_from_slice(data);
        self.modified = true;
        Ok(())
    }

    fn barrier(&mut self, _force: bool) -> Result<()> {
        self.check_open()?;
        self.flush_if_modified()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_if_modified()?;
        self.map = None;
        self.closed = true;
        self.file.unlock()?;
        if let Some(temp) = self._temp.take() {
            temp.close()?;
        }
        Ok(())
    }
}

/// Buffer backed by independently mapped 2^30-byte segments.
#[derive(Debug)]
pub struct SegmentedMappedBuffer {
    file: File,
    segments: Vec<Segment>,
    capacity: u64,
    protection_level: ProtectionLevel,
    modified: bool,
    closed: bool,
    _temp: Option<tempfile::TempPath>,
}

impl SegmentedMappedBuffer {
    /// Opens (creating if absent and writable) the file at `path`.
    pub fn open(path: impl AsRef<Path>, protection_level: ProtectionLevel) -> Result<Self> {
        let file = open_locked(path.as_ref(), protection_level)?;
        Self::from_file(file, protection_level, None)
    }

    /// A scratch buffer backed by a temporary file that is deleted when
    /// the buffer is closed or dropped. Protection level is `None`.
    pub fn temporary() -> Result<Self> {
        let (file, path) = NamedTempFile::new()?.into_parts();
        file.lock_exclusive()?;
        Self::from_file(file, ProtectionLevel::None, Some(path))
    }

    fn from_file(
        file: File,
        protection_level: ProtectionLevel,
        temp: Option<tempfile::TempPath>,
    ) -> Result<Self> {
        let capacity = file.metadata()?.len();
        if capacity > SEGMENTED_MAX_CAPACITY {
            return Err(PerseqError::Format(format!(
                "file of {capacity} bytes exceeds segmented-mapping limit {SEGMENTED_MAX_CAPACITY}"
            )));
        }
        let mut buffer = Self {
            file,
            segments: Vec::new(),
            capacity,
            protection_level,
            modified: false,
            closed: false,
            _temp: temp,
        };
        buffer.remap()?;
        Ok(buffer)
    }

    fn remap(&mut self) -> Result<()> {
        self.segments.clear();
        let writable = self.protection_level.is_writable();
        let mut start = 0u64;
        while start < self.capacity {
            let len = SEGMENT_SIZE.min(self.capacity - start);
            self.segments
                .push(Segment::map(&self.file, start, len, writable)?);
            start += len;
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(PerseqError::Closed);
        }
        Ok(())
    }

    fn flush_if_modified(&mut self) -> Result<()> {
        if self.modified {
            if self.protection_level >= ProtectionLevel::Barrier {
                for segment in &self.segments {
                    segment.flush()?;
                }
            }
            self.modified = false;
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn locate(position: u64) -> (usize, usize) {
        (
            (position >> SEGMENT_SHIFT) as usize,
            (position & SEGMENT_INDEX_MASK) as usize,
        )
    }
}

impl PersistentBuffer for SegmentedMappedBuffer {
    fn protection_level(&self) -> ProtectionLevel {
        self.protection_level
    }

    fn capacity(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.capacity)
    }

    fn set_capacity(&mut self, new_capacity: u64) -> Result<()> {
        self.check_open()?;
        if !self.protection_level.is_writable() {
            return Err(PerseqError::ReadOnly);
        }
        if new_capacity > SEGMENTED_MAX_CAPACITY {
            return Err(PerseqError::Format(format!(
                "capacity {new_capacity} exceeds segmented-mapping limit {SEGMENTED_MAX_CAPACITY}"
            )));
        }
        let old_capacity = self.capacity;
        if new_capacity == old_capacity {
            return Ok(());
        }
        self.flush_if_modified()?;
        self.segments.clear();
        self.file.set_len(new_capacity)?;
        self.capacity = new_capacity;
        self.remap()?;
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
        let (segment_index, offset) = Self::locate(position);
        let segment = self.segments[segment_index].as_slice();
        let step = out.len().min(segment.len() - offset);
        out[..step].copy_from_slice(&segment[offset..offset + step]);
        Ok(step)
    }

    fn put(&mut self, position: u64, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if !self.protection_level.is_writable() {
            return Err(PerseqError::ReadOnly);
        }
        check_range(position, data.len() as u64, self.capacity)?;
        let mut position = position;
        let mut data = data;
        while !data.is_empty() {
            let (segment_index, offset) = Self::locate(position);
            let segment = self.segments[segment_index].as_mut_slice()?;
            let step = data.len().min(segment.len() - offset);
            segment[offset..offset + step].copy_from_slice(&data[..step]);
            position += step as u64;
            data = &data[step..];
        }
        self.modified = true;
        Ok(())
    }

    fn barrier(&mut self, _force: bool) -> Result<()> {
        self.check_open()?;
        self.flush_if_modified()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_if_modified()?;
        self.segments.clear();
        self.closed = true;
        self.file.unlock()?;
        if let Some(temp) = self._temp.take() {
            temp.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs2::FileExt as _;
    use tempfile::tempdir;

    #[test]
    fn mapped_roundtrip_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mapped.dat");

        let mut buf = MappedBuffer::open(&path, ProtectionLevel::Barrier).unwrap();
        buf.set_capacity(4096).unwrap();
        buf.put_i64(128, -2).unwrap();
        buf.put(512, b"mapped bytes").unwrap();
        buf.barrier(true).unwrap();
        buf.close().unwrap();

        let buf = MappedBuffer::open(&path, ProtectionLevel::ReadOnly).unwrap();
        assert_eq!(buf.get_i64(128).unwrap(), -2);
        let mut out = [0u8; 12];
        buf.get(512, &mut out).unwrap();
        assert_eq!(&out, b"mapped bytes");
    }

    #[test]
    fn mapped_empty_file_has_no_mapping() {
        let mut buf = MappedBuffer::temporary().unwrap();
        assert_eq!(buf.capacity().unwrap(), 0);
        assert!(matches!(
            buf.get_u8(0),
            Err(PerseqError::CapacityExceeded { .. })
        ));
        buf.set_capacity(16).unwrap();
        buf.put_u8(15, 0x7F).unwrap();
        assert_eq!(buf.get_u8(15).unwrap(), 0x7F);
    }

    #[test]
    fn mapped_shrink_then_grow() {
        let mut buf = MappedBuffer::temporary().unwrap();
        buf.set_capacity(8192).unwrap();
        buf.put(0, &[0x55; 8192]).unwrap();
        buf.set_capacity(4096).unwrap();
        buf.set_capacity(8192).unwrap();
        let mut out = [0xAAu8; 4096];
        buf.get(4096, &mut out).unwrap();
        assert!(out.iter().all(|byte| *byte == 0));
        assert_eq!(buf.get_u8(4095).unwrap(), 0x55);
    }

    #[test]
    fn segmented_locate_math() {
        assert_eq!(SegmentedMappedBuffer::locate(0), (0, 0));
        assert_eq!(SegmentedMappedBuffer::locate(SEGMENT_SIZE - 1), (0, (SEGMENT_SIZE - 1) as usize));
        assert_eq!(SegmentedMappedBuffer::locate(SEGMENT_SIZE), (1, 0));
        assert_eq!(SegmentedMappedBuffer::locate(SEGMENT_SIZE * 3 + 17), (3, 17));
    }

    #[test]
    fn segmented_roundtrip() {
        let mut buf = SegmentedMappedBuffer::temporary().unwrap();
        buf.set_capacity(1 << 16).unwrap();
        buf.put(100, b"segmented").unwrap();
        buf.put_i64(1024, i64::MIN).unwrap();
        let mut out = [0u8; 9];
        buf.get(100, &mut out).unwrap();
        assert_eq!(&out, b"segmented");
        assert_eq!(buf.get_i64(1024).unwrap(), i64::MIN);
    }

    #[test]
    fn exclusive_lock_blocks_second_opener() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locked.dat");
        let buf = MappedBuffer::open(&path, ProtectionLevel::Barrier).unwrap();

        let second = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        assert!(second.try_lock_exclusive().is_err());
        drop(buf);
    }
}
