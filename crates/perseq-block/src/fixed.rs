//! Fixed-size block allocator with bitmap free maps.
//!
//! The buffer is an array of equally sized slots interleaved with bitmap
//! pages; bit `i` of a bitmap (least-significant bit first within each
//! byte) marks slot `i` allocated. Slot ids start at zero and addresses
//! are pure arithmetic over the geometry, so indexed access is O(1).
//!
//! Two layouts exist depending on the block size `B`:
//!
//! - **Interleaved** (the common case): the file repeats one `B`-byte
//!   bitmap followed by the `8B` slots it covers.
//! - **Single bitmap**, when `B` ≥ 2^30: one bitmap at offset zero sized
//!   to index the entire 2^63 − 1 byte address space, followed only by
//!   slots.

use crate::{expand_capacity, BlockIdCursor, PersistentBlockBuffer};
use perseq_buffer::PersistentBuffer;
use perseq_error::{PerseqError, Result};
use std::collections::BTreeSet;

/// Block buffer in which every block has the same capacity.
#[derive(Debug)]
pub struct FixedBlockBuffer<B> {
    buffer: B,
    block_size: u64,
    single_bitmap: bool,
    /// Bytes per bitmap page.
    bitmap_size: u64,
    /// Scan cursor: no free id below this exists outside `known_free_ids`.
    lowest_free_id: u64,
    /// Ids freed by deallocation, reused lowest-first.
    known_free_ids: BTreeSet<u64>,
    mod_count: u64,
}

impl<B: PersistentBuffer> FixedBlockBuffer<B> {
    /// Creates a fixed allocator over `buffer` with the given block size.
    /// Block sizes that are powers of two align slots with page tables and
    /// are strongly preferred.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    pub fn new(buffer: B, block_size: u64) -> Self {
        assert!(block_size > 0, "block size must be positive");
        let leading_zeros = block_size.leading_zeros();
        let (single_bitmap, bitmap_size) = if leading_zeros <= 3 {
            (true, 1)
        } else {
            let mut zeros = leading_zeros;
            if !block_size.is_power_of_two() {
                zeros -= 1;
            }
            if zeros <= 64 - 1 - 30 {
                // One bitmap prefix indexes the whole address space.
                (true, 1u64 << (zeros - 3))
            } else {
                (false, block_size)
            }
        };
        Self {
            buffer,
            block_size,
            single_bitmap,
            bitmap_size,
            lowest_free_id: 0,
            known_free_ids: BTreeSet::new(),
            mod_count: 0,
        }
    }

    /// Consumes the allocator, returning the underlying buffer.
    pub fn into_buffer(self) -> B {
        self.buffer
    }

    /// Address of the bitmap byte holding the bit for `id`. Pure
    /// arithmetic; may lie beyond the current capacity.
    fn bitmap_byte_address(&self, id: u64) -> u64 {
        if self.single_bitmap {
            id >> 3
        } else {
            let bits_per_bitmap = self.bitmap_size << 3;
            let bitmap_num = id / bits_per_bitmap;
            let bitmap_start = bitmap_num * (self.bitmap_size + self.block_size * bits_per_bitmap);
            bitmap_start + ((id % bits_per_bitmap) >> 3)
        }
    }

    /// Address of the first byte of slot `id`. Pure arithmetic; may lie
    /// beyond the current capacity.
    fn slot_address(&self, id: u64) -> u64 {
        if self.single_bitmap {
            self.bitmap_size + id * self.block_size
        } else {
            let bits_per_bitmap = self.bitmap_size << 3;
            let bitmap_num = id / bits_per_bitmap;
            let bitmap_start = bitmap_num * (self.bitmap_size + self.block_size * bits_per_bitmap);
            bitmap_start + self.bitmap_size + (id % bits_per_bitmap) * self.block_size
        }
    }

    /// Grows the file so the whole slot for `id` is addressable.
    fn cover_slot(&mut self, id: u64) -> Result<()> {
        let end = self.slot_address(id) + self.block_size;
        let capacity = self.buffer.capacity()?;
        if capacity < end {
            expand_capacity(&mut self.buffer, capacity, end)?;
        }
        Ok(())
    }
}

impl<B: PersistentBuffer> PersistentBlockBuffer for FixedBlockBuffer<B> {
    type Buffer = B;

    fn buffer(&self) -> &B {
        &self.buffer
    }

    fn buffer_mut(&mut self) -> &mut B {
        &mut self.buffer
    }

    fn allocate(&mut self, minimum_size: u64) -> Result<u64> {
        if minimum_size > self.block_size {
            return Err(PerseqError::Format(format!(
                "requested {minimum_size} bytes from fixed blocks of {}",
                self.block_size
            )));
        }
        // Reuse the lowest previously deallocated id first.
        if let Some(free_id) = self.known_free_ids.pop_first() {
            let byte_address = self.bitmap_byte_address(free_id);
            let bits = self.buffer.get_u8(byte_address)?;
            let bit = 1u8 << (free_id & 7);
            self.mod_count += 1;
            self.buffer.put_u8(byte_address, bits | bit)?;
            return Ok(free_id);
        }
        // Scan forward from the cursor, byte at a time.
        let capacity = self.buffer.capacity()?;
        let mut byte_address = self.bitmap_byte_address(self.lowest_free_id);
        while byte_address < capacity {
            let bits = self.buffer.get_u8(byte_address)?;
            if bits != 0xFF {
                let mut bit = 1u32 << (self.lowest_free_id & 7);
                while bit != 0x100 {
                    if bits & bit as u8 == 0 {
                        self.mod_count += 1;
                        self.buffer.put_u8(byte_address, bits | bit as u8)?;
                        let id = self.lowest_free_id;
                        self.lowest_free_id += 1;
                        self.cover_slot(id)?;
                        return Ok(id);
                    }
                    self.lowest_free_id += 1;
                    bit <<= 1;
                }
            } else {
                // All allocated; skip to the next bitmap byte.
                self.lowest_free_id = (self.lowest_free_id & !7) + 8;
            }
            byte_address = self.bitmap_byte_address(self.lowest_free_id);
        }
        // Every existing bitmap bit is set; grow to expose a fresh byte.
        debug_assert_eq!(self.lowest_free_id & 7, 0);
        self.mod_count += 1;
        expand_capacity(&mut self.buffer, capacity, byte_address + 1)?;
        self.buffer.put_u8(byte_address, 1)?;
        let id = self.lowest_free_id;
        self.lowest_free_id += 1;
        self.cover_slot(id)?;
        Ok(id)
    }

    fn deallocate(&mut self, id: u64) -> Result<()> {
        let byte_address = self.bitmap_byte_address(id);
        let bits = self.buffer.get_u8(byte_address)?;
        let bit = 1u8 << (id & 7);
        assert!(bits & bit != 0, "block {id} already deallocated");
        self.known_free_ids.insert(id);
        self.mod_count += 1;
        self.buffer.put_u8(byte_address, bits ^ bit)?;
        Ok(())
    }

    fn block_size(&self, _id: u64) -> Result<u64> {
        Ok(self.block_size)
    }

    fn block_address(&self, id: u64) -> Result<u64> {
        Ok(self.slot_address(id))
    }

    fn modification_count(&self) -> u64 {
        self.mod_count
    }

    fn next_block_id(&self, cursor: &mut BlockIdCursor) -> Result<Option<u64>> {
        if cursor.expected_mod_count != self.mod_count {
            return Err(PerseqError::ConcurrentModification);
        }
        let capacity = self.buffer.capacity()?;
        let mut next_id = cursor.next_id;
        let mut byte_address = self.bitmap_byte_address(next_id);
        while byte_address < capacity {
            let bits = self.buffer.get_u8(byte_address)?;
            if bits != 0 {
                let mut bit = 1u32 << (next_id & 7);
                while bit != 0x100 {
                    if bits & bit as u8 != 0 {
                        cursor.last_id = Some(next_id);
                        cursor.next_id = next_id + 1;
                        return Ok(Some(next_id));
                    }
                    next_id += 1;
                    bit <<= 1;
                }
            } else {
                // All free; skip to the next bitmap byte.
                next_id = (next_id & !7) + 8;
            }
            byte_address = self.bitmap_byte_address(next_id);
        }
        cursor.next_id = next_id;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perseq_buffer::MemoryBuffer;

    fn fixed(block_size: u64) -> FixedBlockBuffer<MemoryBuffer> {
        FixedBlockBuffer::new(MemoryBuffer::new(), block_size)
    }

    fn collect_ids<B: PersistentBuffer>(buf: &FixedBlockBuffer<B>) -> Vec<u64> {
        let mut cursor = buf.iterate_block_ids();
        let mut ids = Vec::new();
        while let Some(id) = buf.next_block_id(&mut cursor).unwrap() {
            ids.push(id);
        }
        ids
    }

    #[test]
    fn geometry_interleaved() {
        let buf = fixed(4096);
        assert!(!buf.single_bitmap);
        assert_eq!(buf.bitmap_size, 4096);
        // Bitmap page 0 covers ids 0..32768.
        assert_eq!(buf.bitmap_byte_address(0), 0);
        assert_eq!(buf.bitmap_byte_address(8), 1);
        assert_eq!(buf.slot_address(0), 4096);
        assert_eq!(buf.slot_address(1), 8192);
        // Second bitmap page follows the slots of the first.
        let page = 4096 + 4096 * (4096 * 8) as u64;
        assert_eq!(buf.bitmap_byte_address(4096 * 8), page);
        assert_eq!(buf.slot_address(4096 * 8), page + 4096);
    }

    #[test]
    fn geometry_single_bitmap() {
        let buf = fixed(1 << 30);
        assert!(buf.single_bitmap);
        // lz(2^30) = 33; bitmap of 2^30 bytes indexes 2^33 slots.
        assert_eq!(buf.bitmap_size, 1 << 30);
        assert_eq!(buf.bitmap_byte_address(16), 2);
        assert_eq!(buf.slot_address(0), 1 << 30);
    }

    #[test]
    fn allocate_sequential_ids() {
        let mut buf = fixed(64);
        for expected in 0..100u64 {
            assert_eq!(buf.allocate(64).unwrap(), expected);
        }
        assert_eq!(collect_ids(&buf), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn allocate_rejects_oversized_request() {
        let mut buf = fixed(64);
        assert!(matches!(buf.allocate(65), Err(PerseqError::Format(_))));
    }

    #[test]
    fn deallocate_then_reuse_lowest_first() {
        let mut buf = fixed(64);
        for _ in 0..10 {
            buf.allocate(1).unwrap();
        }
        buf.deallocate(3).unwrap();
        buf.deallocate(7).unwrap();
        buf.deallocate(5).unwrap();
        assert_eq!(buf.allocate(1).unwrap(), 3);
        assert_eq!(buf.allocate(1).unwrap(), 5);
        assert_eq!(buf.allocate(1).unwrap(), 7);
        assert_eq!(buf.allocate(1).unwrap(), 10);
    }

    #[test]
    #[should_panic(expected = "already deallocated")]
    fn double_deallocate_panics() {
        let mut buf = fixed(64);
        buf.allocate(1).unwrap();
        buf.deallocate(0).unwrap();
        let _ = buf.deallocate(0);
    }

    #[test]
    fn block_io_roundtrip() {
        let mut buf = fixed(128);
        let id = buf.allocate(128).unwrap();
        buf.put(id, 0, b"fixed-block").unwrap();
        buf.put_i64(id, 64, -12345).unwrap();
        let mut out = [0u8; 11];
        buf.get(id, 0, &mut out).unwrap();
        assert_eq!(&out, b"fixed-block");
        assert_eq!(buf.get_i64(id, 64).unwrap(), -12345);
    }

    #[test]
    fn iteration_detects_mutation() {
        let mut buf = fixed(64);
        buf.allocate(1).unwrap();
        buf.allocate(1).unwrap();
        let mut cursor = buf.iterate_block_ids();
        assert_eq!(buf.next_block_id(&mut cursor).unwrap(), Some(0));
        buf.allocate(1).unwrap();
        assert!(matches!(
            buf.next_block_id(&mut cursor),
            Err(PerseqError::ConcurrentModification)
        ));
    }

    #[test]
    fn cursor_remove_revalidates() {
        let mut buf = fixed(64);
        for _ in 0..4 {
            buf.allocate(1).unwrap();
        }
        let mut cursor = buf.iterate_block_ids();
        while let Some(id) = buf.next_block_id(&mut cursor).unwrap() {
            if id % 2 == 0 {
                buf.remove_current(&mut cursor).unwrap();
            }
        }
        assert_eq!(collect_ids(&buf), vec![1, 3]);
    }

    #[test]
    fn iteration_skips_sparse_regions() {
        let mut buf = fixed(64);
        for _ in 0..64 {
            buf.allocate(1).unwrap();
        }
        for id in 0..64 {
            if id != 17 && id != 63 {
                buf.deallocate(id).unwrap();
            }
        }
        assert_eq!(collect_ids(&buf), vec![17, 63]);
    }
}
