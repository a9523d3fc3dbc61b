#![deny(unsafe_code)]
//! Persistent byte buffers with write-barrier semantics.
//!
//! A [`PersistentBuffer`] is a resizable, byte-addressable region backed by
//! stable storage. Writes are asynchronous with respect to the backing
//! media; the only ordering contract is [`PersistentBuffer::barrier`]:
//! every write issued before a barrier is durably ordered before every
//! write issued after it. How strictly a buffer honors barriers is
//! governed by its [`ProtectionLevel`].
//!
//! Buffers are single-writer. An advisory whole-file lock is held by the
//! file-backed variants for the lifetime of the handle, so a second open
//! of the same path fails rather than corrupting state.
//!
//! Variants:
//!
//! - [`MemoryBuffer`]: heap-backed scratch, no durability.
//! - [`DirectFileBuffer`]: positioned read/write syscalls, no mapping.
//! - [`MappedBuffer`]: one contiguous mapping, capacity up to 2^31 - 1.
//! - [`SegmentedMappedBuffer`]: 2^30-byte mapped segments for larger files.

mod file;
mod mapped;

pub use file::DirectFileBuffer;
pub use mapped::{
    MappedBuffer, SegmentedMappedBuffer, MAPPED_MAX_CAPACITY, SEGMENTED_MAX_CAPACITY,
};

use perseq_error::{PerseqError, Result};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Durability policy honored by a buffer.
///
/// Ordered from weakest to strongest so callers can compare levels
/// (`level >= ProtectionLevel::Barrier`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum ProtectionLevel {
    /// Writes and capacity changes fail.
    ReadOnly,
    /// Barriers are no-ops. For scratch and temporary data.
    None,
    /// Barriers order writes but the force flag may be ignored.
    #[default]
    Barrier,
    /// `barrier(true)` synchronously flushes to physical media.
    Force,
}

impl ProtectionLevel {
    /// Whether writes are permitted at this level.
    #[must_use]
    pub fn is_writable(self) -> bool {
        self != Self::ReadOnly
    }
}

/// Byte-addressable persistent storage with explicit write ordering.
///
/// Multi-byte integers are big-endian on disk regardless of host order.
/// Positions are absolute byte offsets in `[0, capacity)`. Growing via
/// [`set_capacity`](Self::set_capacity) zero-fills the new region.
pub trait PersistentBuffer {
    /// The durability policy this buffer enforces.
    fn protection_level(&self) -> ProtectionLevel;

    /// Current capacity in bytes.
    fn capacity(&self) -> Result<u64>;

    /// Grows or shrinks the buffer. New space reads as zeros.
    fn set_capacity(&mut self, new_capacity: u64) -> Result<()>;

    /// Reads at least one byte into `out`, returning the count read.
    fn get_some(&self, position: u64, out: &mut [u8]) -> Result<usize>;

    /// Writes all of `data` at `position`. Does not expand the buffer.
    fn put(&mut self, position: u64, data: &[u8]) -> Result<()>;

    /// Establishes a write-ordering boundary; see [`ProtectionLevel`] for
    /// how `force` is honored.
    fn barrier(&mut self, force: bool) -> Result<()>;

    /// Whether [`close`](Self::close) has been called.
    fn is_closed(&self) -> bool;

    /// Flushes (depending on the variant) and releases the backing file.
    /// Closing an already-closed buffer is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Fills `out` completely, failing on a short read.
    fn get(&self, position: u64, out: &mut [u8]) -> Result<()> {
        let mut position = position;
        let mut out = out;
        while !out.is_empty() {
            let count = self.get_some(position, out)?;
            position += count as u64;
            out = &mut out[count..];
        }
        Ok(())
    }

    /// Reads one byte.
    fn get_u8(&self, position: u64) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.get(position, &mut byte)?;
        Ok(byte[0])
    }

    /// Reads one byte as a boolean; any non-zero value is `true`.
    fn get_bool(&self, position: u64) -> Result<bool> {
        Ok(self.get_u8(position)? != 0)
    }

    /// Reads a big-endian `i32`.
    fn get_i32(&self, position: u64) -> Result<i32> {
        let mut bytes = [0u8; 4];
        self.get(position, &mut bytes)?;
        Ok(i32::from_be_bytes(bytes))
    }

    /// Reads a big-endian `i64`.
    fn get_i64(&self, position: u64) -> Result<i64> {
        let mut bytes = [0u8; 8];
        self.get(position, &mut bytes)?;
        Ok(i64::from_be_bytes(bytes))
    }

    /// Writes one byte.
    fn put_u8(&mut self, position: u64, value: u8) -> Result<()> {
        self.put(position, &[value])
    }

    /// Writes a big-endian `i32`.
    fn put_i32(&mut self, position: u64, value: i32) -> Result<()> {
        self.put(position, &value.to_be_bytes())
    }

    /// Writes a big-endian `i64`.
    fn put_i64(&mut self, position: u64, value: i64) -> Result<()> {
        self.put(position, &value.to_be_bytes())
    }

    /// Guarantees that `[position, position + len)` reads as zeros on
    /// return. Regions that already hold zeros are left untouched, which
    /// matters for flash wear and sparse files.
    fn ensure_zeros(&mut self, position: u64, len: u64) -> Result<()> {
        const CHUNK: usize = 4096;
        const ZEROS: [u8; CHUNK] = [0u8; CHUNK];
        let mut scratch = [0u8; CHUNK];
        let mut position = position;
        let mut remaining = len;
        while remaining > 0 {
            let step = CHUNK.min(usize::try_from(remaining).unwrap_or(CHUNK));
            self.get(position, &mut scratch[..step])?;
            if scratch[..step].iter().any(|byte| *byte != 0) {
                self.put(position, &ZEROS[..step])?;
            }
            position += step as u64;
            remaining -= step as u64;
        }
        Ok(())
    }

    /// A bounded read cursor over `[position, position + length)`.
    fn reader(&self, position: u64, length: u64) -> Result<BufferReader<'_, Self>>
    where
        Self: Sized,
    {
        check_range(position, length, self.capacity()?)?;
        Ok(BufferReader {
            buffer: self,
            position,
            remaining: length,
        })
    }

    /// A bounded write cursor over `[position, position + length)`.
    fn writer(&mut self, position: u64, length: u64) -> Result<BufferWriter<'_, Self>>
    where
        Self: Sized,
    {
        check_range(position, length, self.capacity()?)?;
        Ok(BufferWriter {
            buffer: self,
            position,
            remaining: length,
        })
    }
}

/// Fails with `CapacityExceeded` when `[position, position + len)` does not
/// fit inside `capacity`.
pub fn check_range(position: u64, len: u64, capacity: u64) -> Result<()> {
    match position.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(PerseqError::CapacityExceeded { position, capacity }),
    }
}

impl PersistentBuffer for Box<dyn PersistentBuffer> {
    fn protection_level(&self) -> ProtectionLevel {
        (**self).protection_level()
    }

    fn capacity(&self) -> Result<u64> {
        (**self).capacity()
    }

    fn set_capacity(&mut self, new_capacity: u64) -> Result<()> {
        (**self).set_capacity(new_capacity)
    }

    fn get_some(&self, position: u64, out: &mut [u8]) -> Result<usize> {
        (**self).get_some(position, out)
    }

    fn put(&mut self, position: u64, data: &[u8]) -> Result<()> {
        (**self).put(position, data)
    }

    fn barrier(&mut self, force: bool) -> Result<()> {
        (**self).barrier(force)
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn get(&self, position: u64, out: &mut [u8]) -> Result<()> {
        (**self).get(position, out)
    }

    fn get_u8(&self, position: u64) -> Result<u8> {
        (**self).get_u8(position)
    }

    fn get_bool(&self, position: u64) -> Result<bool> {
        (**self).get_bool(position)
    }

    fn get_i32(&self, position: u64) -> Result<i32> {
        (**self).get_i32(position)
    }

    fn get_i64(&self, position: u64) -> Result<i64> {
        (**self).get_i64(position)
    }

    fn put_u8(&mut self, position: u64, value: u8) -> Result<()> {
        (**self).put_u8(position, value)
    }

    fn put_i32(&mut self, position: u64, value: i32) -> Result<()> {
        (**self).put_i32(position, value)
    }

    fn put_i64(&mut self, position: u64, value: i64) -> Result<()> {
        (**self).put_i64(position, value)
    }

    fn ensure_zeros(&mut self, position: u64, len: u64) -> Result<()> {
        (**self).ensure_zeros(position, len)
    }
}

fn to_io_error(err: PerseqError) -> io::Error {
    match err {
        PerseqError::Io(io) => io,
        other => io::Error::other(other),
    }
}

/// Bounded read cursor over a buffer range.
///
/// Reading past the end returns `Ok(0)` from [`Read::read`]; `read_exact`
/// therefore reports `UnexpectedEof` deterministically.
#[derive(Debug)]
pub struct BufferReader<'a, B: ?Sized> {
    buffer: &'a B,
    position: u64,
    remaining: u64,
}

impl<B: PersistentBuffer + ?Sized> BufferReader<'_, B> {
    /// Bytes left before the cursor reaches its bound.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<B: PersistentBuffer + ?Sized> Read for BufferReader<'_, B> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() || self.remaining == 0 {
            return Ok(0);
        }
        let step = out
            .len()
            .min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let count = self
            .buffer
            .get_some(self.position, &mut out[..step])
            .map_err(to_io_error)?;
        self.position += count as u64;
        self.remaining -= count as u64;
        Ok(count)
    }
}

/// Bounded write cursor over a buffer range.
///
/// Writing past the bound fails with a `StreamOverflow` wrapped in
/// `io::Error`; partial writes are never issued past the bound.
#[derive(Debug)]
pub struct BufferWriter<'a, B: ?Sized> {
    buffer: &'a mut B,
    position: u64,
    remaining: u64,
}

impl<B: PersistentBuffer + ?Sized> BufferWriter<'_, B> {
    /// Bytes left before the cursor reaches its bound.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<B: PersistentBuffer + ?Sized> Write for BufferWriter<'_, B> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let requested = data.len() as u64;
        if requested > self.remaining {
            return Err(io::Error::other(PerseqError::StreamOverflow {
                requested,
                remaining: self.remaining,
            }));
        }
        self.buffer.put(self.position, data).map_err(to_io_error)?;
        self.position += requested;
        self.remaining -= requested;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Heap-backed buffer with no durability. Barriers are no-ops.
///
/// Used for scratch data and as the substrate under test wrappers.
#[derive(Debug)]
pub struct MemoryBuffer {
    data: Vec<u8>,
    protection_level: ProtectionLevel,
    closed: bool,
}

impl MemoryBuffer {
    /// An empty read-write scratch buffer at `ProtectionLevel::None`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_protection_level(ProtectionLevel::None)
    }

    /// An empty buffer at the given protection level. `Barrier` and
    /// `Force` are accepted but behave as `None` since there is no
    /// backing media.
    #[must_use]
    pub fn with_protection_level(protection_level: ProtectionLevel) -> Self {
        Self {
            data: Vec::new(),
            protection_level,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(PerseqError::Closed);
        }
        Ok(())
    }
}

impl Default for MemoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentBuffer for MemoryBuffer {
    fn protection_level(&self) -> ProtectionLevel {
        self.protection_level
    }

    fn capacity(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.data.len() as u64)
    }

    fn set_capacity(&mut self, new_capacity: u64) -> Result<()> {
        self.check_open()?;
        if !self.protection_level.is_writable() {
            return Err(PerseqError::ReadOnly);
        }
        let new_len = usize::try_from(new_capacity).map_err(|_| PerseqError::CapacityExceeded {
            position: new_capacity,
            capacity: self.data.len() as u64,
        })?;
        self.data.resize(new_len, 0);
        Ok(())
    }

    fn get_some(&self, position: u64, out: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        check_range(position, out.len() as u64, self.data.len() as u64)?;
        let start = position as usize;
        out.copy_from_slice(&self.data[start..start + out.len()]);
        Ok(out.len())
    }

    fn put(&mut self, position: u64, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if !self.protection_level.is_writable() {
            return Err(PerseqError::ReadOnly);
        }
        check_range(position, data.len() as u64, self.data.len() as u64)?;
        let start = position as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn barrier(&mut self, _force: bool) -> Result<()> {
        self.check_open()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protection_level_ordering() {
        assert!(ProtectionLevel::ReadOnly < ProtectionLevel::None);
        assert!(ProtectionLevel::None < ProtectionLevel::Barrier);
        assert!(ProtectionLevel::Barrier < ProtectionLevel::Force);
        assert!(ProtectionLevel::Force >= ProtectionLevel::Barrier);
    }

    #[test]
    fn memory_buffer_roundtrip() {
        let mut buf = MemoryBuffer::new();
        buf.set_capacity(64).unwrap();
        assert_eq!(buf.capacity().unwrap(), 64);

        buf.put(0, b"hello").unwrap();
        buf.put_i64(8, -2).unwrap();
        buf.put_i32(16, 0x0102_0304).unwrap();

        let mut out = [0u8; 5];
        buf.get(0, &mut out).unwrap();
        assert_eq!(&out, b"hello");
        assert_eq!(buf.get_i64(8).unwrap(), -2);
        assert_eq!(buf.get_i32(16).unwrap(), 0x0102_0304);
        // Big-endian layout on disk.
        assert_eq!(buf.get_u8(16).unwrap(), 0x01);
    }

    #[test]
    fn growth_zero_fills() {
        let mut buf = MemoryBuffer::new();
        buf.set_capacity(8).unwrap();
        buf.put(0, &[0xFF; 8]).unwrap();
        buf.set_capacity(4).unwrap();
        buf.set_capacity(16).unwrap();
        let mut out = [0xAAu8; 12];
        buf.get(4, &mut out).unwrap();
        assert_eq!(out, [0u8; 12]);
    }

    #[test]
    fn put_past_capacity_fails() {
        let mut buf = MemoryBuffer::new();
        buf.set_capacity(4).unwrap();
        let err = buf.put(2, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, PerseqError::CapacityExceeded { .. }));
    }

    #[test]
    fn closed_buffer_rejects_access() {
        let mut buf = MemoryBuffer::new();
        buf.set_capacity(4).unwrap();
        buf.close().unwrap();
        assert!(buf.is_closed());
        assert!(matches!(buf.capacity(), Err(PerseqError::Closed)));
        assert!(matches!(buf.put(0, &[1]), Err(PerseqError::Closed)));
    }

    #[test]
    fn ensure_zeros_clears_and_preserves() {
        let mut buf = MemoryBuffer::new();
        buf.set_capacity(8192).unwrap();
        buf.put(100, &[7u8; 50]).unwrap();
        buf.ensure_zeros(0, 8192).unwrap();
        let mut out = vec![0xAAu8; 8192];
        buf.get(0, &mut out).unwrap();
        assert!(out.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn reader_is_bounded() {
        let mut buf = MemoryBuffer::new();
        buf.set_capacity(16).unwrap();
        buf.put(4, &[1, 2, 3, 4]).unwrap();

        let mut reader = buf.reader(4, 4).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4]);

        // Out-of-range construction fails up front.
        assert!(buf.reader(12, 8).is_err());
    }

    #[test]
    fn writer_rejects_overflow() {
        let mut buf = MemoryBuffer::new();
        buf.set_capacity(16).unwrap();
        let mut writer = buf.writer(0, 4).unwrap();
        writer.write_all(&[1, 2, 3, 4]).unwrap();
        let err = writer.write_all(&[5]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn read_only_memory_buffer() {
        let mut buf = MemoryBuffer::with_protection_level(ProtectionLevel::ReadOnly);
        assert!(matches!(buf.set_capacity(8), Err(PerseqError::ReadOnly)));
        assert!(matches!(buf.put(0, &[0]), Err(PerseqError::ReadOnly)));
    }
}
