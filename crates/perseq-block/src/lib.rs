#![forbid(unsafe_code)]
//! Block allocation over persistent buffers.
//!
//! A [`PersistentBlockBuffer`] treats a byte buffer as a set of
//! allocatable blocks addressed by 64-bit ids, where an id is the block's
//! starting byte offset and stays stable for the block's lifetime. Two
//! allocators are provided:
//!
//! - [`FixedBlockBuffer`]: every block has the same size, tracked by a
//!   bitmap free map. O(1) id-to-address arithmetic.
//! - [`DynamicBlockBuffer`]: power-of-two sized blocks with buddy
//!   splitting and merging, tracked by per-size free maps.
//!
//! Allocation and deallocation do not themselves issue barriers (beyond
//! the one the dynamic allocator needs while splitting); callers decide
//! when allocation state must be durable. A block left allocated by a
//! crash before the caller's barrier shows up as an orphan for the next
//! open to resolve.

mod dynamic;
mod fixed;

pub use dynamic::DynamicBlockBuffer;
pub use fixed::FixedBlockBuffer;

use perseq_buffer::{BufferReader, BufferWriter, PersistentBuffer, ProtectionLevel};
use perseq_error::{PerseqError, Result};

/// Detached cursor over allocated block ids.
///
/// The cursor holds no borrow of its block buffer; every call revalidates
/// a modification counter and fails with
/// [`PerseqError::ConcurrentModification`] when the allocation state
/// changed through anything other than the cursor itself. Iteration
/// yields every live block exactly once, the first-allocated block first.
#[derive(Debug, Clone)]
pub struct BlockIdCursor {
    pub(crate) expected_mod_count: u64,
    pub(crate) next_id: u64,
    pub(crate) last_id: Option<u64>,
}

impl BlockIdCursor {
    fn new(expected_mod_count: u64) -> Self {
        Self {
            expected_mod_count,
            next_id: 0,
            last_id: None,
        }
    }
}

/// A persistent set of blocks of arbitrary data over a byte buffer.
///
/// Ids are non-negative and unique among live blocks. An id may be reused
/// after its block is deallocated. Implementations own their underlying
/// buffer exclusively.
pub trait PersistentBlockBuffer {
    /// The underlying byte buffer type.
    type Buffer: PersistentBuffer;

    /// Shared access to the underlying buffer.
    fn buffer(&self) -> &Self::Buffer;

    /// Exclusive access to the underlying buffer.
    fn buffer_mut(&mut self) -> &mut Self::Buffer;

    /// Allocates a block with at least `minimum_size` usable bytes and
    /// returns its id. The allocation is not durable until the caller
    /// issues a barrier; until then a crash may leave the block either
    /// allocated or free, never anything worse.
    fn allocate(&mut self, minimum_size: u64) -> Result<u64>;

    /// Deallocates the block with the given id. Other ids are unaffected;
    /// the space may be reclaimed or merged with neighbors.
    ///
    /// # Panics
    ///
    /// Panics if the block is not allocated: double deallocation is a
    /// programmer error, not a recoverable condition.
    fn deallocate(&mut self, id: u64) -> Result<()>;

    /// Usable payload capacity in bytes of the block with the given id.
    fn block_size(&self, id: u64) -> Result<u64>;

    /// Byte address in the underlying buffer where the block's payload
    /// starts. Only meaningful for allocated blocks.
    fn block_address(&self, id: u64) -> Result<u64>;

    /// Monotonic counter advanced by every allocate/deallocate, used by
    /// [`BlockIdCursor`] to detect concurrent structural changes.
    fn modification_count(&self) -> u64;

    /// Advances `cursor` to the next allocated id, or `None` at the end.
    fn next_block_id(&self, cursor: &mut BlockIdCursor) -> Result<Option<u64>>;

    /// Starts iteration over allocated block ids.
    fn iterate_block_ids(&self) -> BlockIdCursor {
        BlockIdCursor::new(self.modification_count())
    }

    /// Deallocates the id most recently yielded by `cursor` and
    /// revalidates the cursor so iteration can continue.
    ///
    /// # Panics
    ///
    /// Panics if the cursor has not yielded an id since the last removal.
    fn remove_current(&mut self, cursor: &mut BlockIdCursor) -> Result<()>
    where
        Self: Sized,
    {
        if cursor.expected_mod_count != self.modification_count() {
            return Err(PerseqError::ConcurrentModification);
        }
        let id = cursor
            .last_id
            .take()
            .expect("cursor has no current block to remove");
        self.deallocate(id)?;
        cursor.expected_mod_count = self.modification_count();
        Ok(())
    }

    /// The durability policy of the underlying buffer.
    fn protection_level(&self) -> ProtectionLevel {
        self.buffer().protection_level()
    }

    /// Write-ordering boundary, delegated to the underlying buffer.
    fn barrier(&mut self, force: bool) -> Result<()> {
        self.buffer_mut().barrier(force)
    }

    /// Whether the underlying buffer is closed.
    fn is_closed(&self) -> bool {
        self.buffer().is_closed()
    }

    /// Closes the underlying buffer.
    fn close(&mut self) -> Result<()> {
        self.buffer_mut().close()
    }

    /// Reads `out.len()` bytes from the block at `offset` within it.
    fn get(&self, id: u64, offset: u64, out: &mut [u8]) -> Result<()> {
        self.check_bounds(id, offset, out.len() as u64)?;
        let address = self.block_address(id)?;
        self.buffer().get(address + offset, out)
    }

    /// Reads a big-endian `i32` from the block.
    fn get_i32(&self, id: u64, offset: u64) -> Result<i32> {
        self.check_bounds(id, offset, 4)?;
        let address = self.block_address(id)?;
        self.buffer().get_i32(address + offset)
    }

    /// Reads a big-endian `i64` from the block.
    fn get_i64(&self, id: u64, offset: u64) -> Result<i64> {
        self.check_bounds(id, offset, 8)?;
        let address = self.block_address(id)?;
        self.buffer().get_i64(address + offset)
    }

    /// Writes `data` into the block at `offset` within it.
    fn put(&mut self, id: u64, offset: u64, data: &[u8]) -> Result<()> {
        self.check_bounds(id, offset, data.len() as u64)?;
        let address = self.block_address(id)?;
        self.buffer_mut().put(address + offset, data)
    }

    /// Writes a big-endian `i32` into the block.
    fn put_i32(&mut self, id: u64, offset: u64, value: i32) -> Result<()> {
        self.check_bounds(id, offset, 4)?;
        let address = self.block_address(id)?;
        self.buffer_mut().put_i32(address + offset, value)
    }

    /// Writes a big-endian `i64` into the block.
    fn put_i64(&mut self, id: u64, offset: u64, value: i64) -> Result<()> {
        self.check_bounds(id, offset, 8)?;
        let address = self.block_address(id)?;
        self.buffer_mut().put_i64(address + offset, value)
    }

    /// Bounded read cursor over `[offset, offset + length)` of the block.
    fn reader(&self, id: u64, offset: u64, length: u64) -> Result<BufferReader<'_, Self::Buffer>> {
        self.check_bounds(id, offset, length)?;
        let address = self.block_address(id)?;
        self.buffer().reader(address + offset, length)
    }

    /// Bounded write cursor over `[offset, offset + length)` of the block.
    fn writer(
        &mut self,
        id: u64,
        offset: u64,
        length: u64,
    ) -> Result<BufferWriter<'_, Self::Buffer>> {
        self.check_bounds(id, offset, length)?;
        let address = self.block_address(id)?;
        self.buffer_mut().writer(address + offset, length)
    }

    /// Range check against the block. The block-size comparison reads the
    /// block header, so like the rest of the assertion category it only
    /// runs in debug builds.
    fn check_bounds(&self, id: u64, offset: u64, len: u64) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or(PerseqError::NotAllocated { id })?;
        if cfg!(debug_assertions) {
            let size = self.block_size(id)?;
            assert!(
                end <= size,
                "range {offset}+{len} exceeds size {size} of block {id}"
            );
        }
        Ok(())
    }
}

/// Grows `buffer` to at least `needed` bytes: by 25% of the prior
/// capacity when that is more, and always up to a 4 KiB boundary.
pub(crate) fn expand_capacity<B: PersistentBuffer>(
    buffer: &mut B,
    old_capacity: u64,
    needed: u64,
) -> Result<()> {
    let mut new_capacity = needed.max(old_capacity + (old_capacity >> 2));
    if new_capacity & 0xfff != 0 {
        new_capacity = (new_capacity & !0xfff) + 4096;
    }
    buffer.set_capacity(new_capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use perseq_buffer::MemoryBuffer;

    #[test]
    fn expand_capacity_policy() {
        let mut buf = MemoryBuffer::new();
        expand_capacity(&mut buf, 0, 1).unwrap();
        assert_eq!(buf.capacity().unwrap(), 4096);

        // 25% growth dominates a small request.
        expand_capacity(&mut buf, 1 << 20, (1 << 20) + 1).unwrap();
        assert_eq!(buf.capacity().unwrap(), (1 << 20) + (1 << 18));

        // Page alignment always holds.
        assert_eq!(buf.capacity().unwrap() & 0xfff, 0);
    }
}
