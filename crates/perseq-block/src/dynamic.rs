//! Variable-size block allocator with buddy splitting and merging.
//!
//! Every block occupies a power-of-two area of the buffer; the first byte
//! is a header carrying the size exponent `k` (bits 0–5, block occupies
//! `2^k` bytes) and the allocated flag (bit 7), leaving `2^k − 1` bytes of
//! payload. Blocks are aligned to their size, so a block's buddy is the
//! equal-sized neighbor within the containing `2^(k+1)` region.
//!
//! Free space maps, one ordered set of start addresses per size class,
//! are rebuilt by a single linear scan at construction, so startup cost is
//! proportional to file size and the maps never need to be persisted.
//! Deallocated buddies merge eagerly; allocation splits the smallest
//! sufficient free block. A barrier during splitting keeps the headers
//! recoverable: the right child's header becomes durable before the
//! parent's header shrinks, so a crash leaves either the parent intact or
//! both children fully described.

use crate::{BlockIdCursor, PersistentBlockBuffer};
use perseq_buffer::PersistentBuffer;
use perseq_error::{PerseqError, Result};
use std::collections::BTreeSet;
use tracing::warn;

const MAX_SIZE_BITS: u32 = 0x3f;
const ALLOCATED_FLAG: u8 = 0x80;

const PAGE_SIZE: u64 = 0x1000;
const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

fn is_allocated(header: u8) -> bool {
    header & ALLOCATED_FLAG != 0
}

fn block_size_bits(header: u8) -> u32 {
    u32::from(header & 0x3f)
}

fn block_size(bits: u32) -> u64 {
    1u64 << bits
}

fn is_block_aligned(id: u64, bits: u32) -> bool {
    id & (block_size(bits) - 1) == 0
}

fn nearest_page(position: u64) -> u64 {
    if position & PAGE_OFFSET_MASK != 0 {
        (position & !PAGE_OFFSET_MASK) + PAGE_SIZE
    } else {
        position
    }
}

/// Block buffer whose blocks are power-of-two sized, split and merged
/// buddy-style.
#[derive(Debug)]
pub struct DynamicBlockBuffer<B> {
    buffer: B,
    /// Free block start addresses indexed by size class.
    free_space_maps: Vec<BTreeSet<u64>>,
    mod_count: u64,
}

impl<B: PersistentBuffer> DynamicBlockBuffer<B> {
    /// Creates a dynamic allocator over `buffer`, building the free space
    /// maps with one linear scan. A file truncated mid-growth is repaired
    /// by extending the capacity to the last block's end.
    pub fn new(buffer: B) -> Result<Self> {
        let mut this = Self {
            buffer,
            free_space_maps: (0..64).map(|_| BTreeSet::new()).collect(),
            mod_count: 0,
        };
        this.build_free_space_maps()?;
        Ok(this)
    }

    /// Consumes the allocator, returning the underlying buffer. The free
    /// maps are rebuilt by scanning when a new allocator is constructed.
    pub fn into_buffer(self) -> B {
        self.buffer
    }

    fn build_free_space_maps(&mut self) -> Result<()> {
        let mut capacity = self.buffer.capacity()?;
        let mut id = 0u64;
        while id < capacity {
            let header = self.buffer.get_u8(id)?;
            let bits = block_size_bits(header);
            if !is_block_aligned(id, bits) {
                return Err(PerseqError::Corruption(format!(
                    "block {id} of size class {bits} is not aligned"
                )));
            }
            let block_end = id + block_size(bits);
            if block_end > capacity {
                // A crash between the capacity grow and the block writes
                // can leave the file ending mid-block. Growing is safer
                // than truncating data.
                warn!(
                    target: "perseq::block",
                    event = "capacity_extended_to_block_end",
                    capacity,
                    block_end
                );
                self.buffer.set_capacity(block_end)?;
                capacity = block_end;
            }
            if !is_allocated(header) {
                self.add_free_space_map(id, bits, capacity, true)?;
            }
            id = block_end;
        }
        debug_assert_eq!(id, capacity);
        Ok(())
    }

    /// Inserts a free block, merging it with free buddies of the same
    /// size first. With `group_prev_only`, only leftward merges happen,
    /// as required while the startup scan or a capacity grow is mid-flight,
    /// when blocks to the right are not yet described.
    fn add_free_space_map(
        &mut self,
        id: u64,
        bits: u32,
        capacity: u64,
        group_prev_only: bool,
    ) -> Result<()> {
        debug_assert_eq!(block_size_bits(self.buffer.get_u8(id)?), bits);
        let mut id = id;
        let mut bits = bits;
        let mut promoted = false;
        while bits < MAX_SIZE_BITS {
            let size = block_size(bits);
            if id & (size - 1) != 0 {
                break;
            }
            let bigger_size = size << 1;
            let bigger_mask = !(bigger_size - 1);
            let id_bigger_base = id & bigger_mask;
            if id >= size && (id - size) & bigger_mask == id_bigger_base {
                // This block is the right half; try merging leftward.
                let prev_id = id - size;
                let prev_header = self.buffer.get_u8(prev_id)?;
                if is_allocated(prev_header) || bits != block_size_bits(prev_header) {
                    break;
                }
                let removed = self.free_space_maps[bits as usize].remove(&prev_id);
                assert!(removed, "free map {bits} missing left buddy {prev_id}");
                id = prev_id;
                bits += 1;
                promoted = true;
            } else {
                if group_prev_only || id + bigger_size > capacity {
                    break;
                }
                // This block is the left half; try merging rightward.
                let next_id = id + size;
                debug_assert_eq!(next_id & bigger_mask, id_bigger_base);
                let next_header = self.buffer.get_u8(next_id)?;
                if is_allocated(next_header) || bits != block_size_bits(next_header) {
                    break;
                }
                let removed = self.free_space_maps[bits as usize].remove(&next_id);
                assert!(removed, "free map {bits} missing right buddy {next_id}");
                bits += 1;
                promoted = true;
            }
        }
        if promoted {
            debug_assert!(is_block_aligned(id, bits));
            self.buffer.put_u8(id, bits as u8)?;
        }
        let inserted = self.free_space_maps[bits as usize].insert(id);
        assert!(inserted, "free map {bits} already contains {id}");
        Ok(())
    }

    /// Pops the lowest free block of class `bits`, splitting a larger one
    /// when none exists. Returns `None` when no block can satisfy the
    /// request without growing the file.
    fn split_allocate(&mut self, bits: u32, capacity: u64) -> Result<Option<u64>> {
        if let Some(id) = self.free_space_maps[bits as usize].pop_first() {
            debug_assert!(is_block_aligned(id, bits));
            return Ok(Some(id));
        }
        if bits == MAX_SIZE_BITS {
            return Ok(None);
        }
        if block_size(bits) > capacity {
            return Ok(None);
        }
        let Some(bigger_id) = self.split_allocate(bits + 1, capacity)? else {
            return Ok(None);
        };
        // Split: the right child's header must be durable before the
        // parent's header shrinks, at every level of a multi-way split,
        // so recovery sees either the whole parent or both halves and
        // never a shrunk parent beside an undescribed right half.
        let right_id = bigger_id + block_size(bits);
        if self.buffer.get_u8(right_id)? != bits as u8 {
            self.buffer.put_u8(right_id, bits as u8)?;
            self.buffer.barrier(false)?;
        }
        self.free_space_maps[bits as usize].insert(right_id);
        self.buffer.put_u8(bigger_id, bits as u8)?;
        Ok(Some(bigger_id))
    }

    /// Populates the free maps for a newly grown region using the largest
    /// aligned power-of-two pieces that fit.
    fn configure_new_allocation(&mut self, start: u64, capacity: u64) -> Result<()> {
        let mut start = start;
        while start < capacity {
            let mut bits = 1u32;
            while bits < MAX_SIZE_BITS {
                if start & (block_size(bits) - 1) != 0 {
                    break;
                }
                match start.checked_add(block_size(bits)) {
                    Some(end) if end <= capacity => bits += 1,
                    _ => break,
                }
            }
            bits -= 1;
            debug_assert!(is_block_aligned(start, bits));
            if bits > 0 {
                self.buffer.put_u8(start, bits as u8)?;
            }
            self.add_free_space_map(start, bits, capacity, true)?;
            start += block_size(bits);
        }
        debug_assert_eq!(start, capacity);
        Ok(())
    }
}

impl<B: PersistentBuffer> PersistentBlockBuffer for DynamicBlockBuffer<B> {
    type Buffer = B;

    fn buffer(&self) -> &B {
        &self.buffer
    }

    fn buffer_mut(&mut self) -> &mut B {
        &mut self.buffer
    }

    fn allocate(&mut self, minimum_size: u64) -> Result<u64> {
        self.mod_count += 1;
        // Smallest class with room for the payload plus the header byte.
        let bits = 64 - minimum_size.leading_zeros();
        if bits >= 64 {
            return Err(PerseqError::Format(format!(
                "allocation of {minimum_size} bytes exceeds the address space"
            )));
        }
        let capacity = self.buffer.capacity()?;
        if let Some(id) = self.split_allocate(bits, capacity)? {
            self.buffer.put_u8(id, ALLOCATED_FLAG | bits as u8)?;
            return Ok(id);
        }
        // Nothing free and nothing mergeable: grow the file.
        let size = block_size(bits);
        let mask = size - 1;
        let mut block_start = capacity;
        if block_start & mask != 0 {
            block_start += size - (block_start & mask);
        }
        let mut new_capacity = block_start + size;
        let percent_capacity = capacity + (capacity >> 2);
        if percent_capacity > new_capacity {
            new_capacity = percent_capacity;
        }
        new_capacity = nearest_page(new_capacity);
        self.buffer.set_capacity(new_capacity)?;
        self.configure_new_allocation(capacity, new_capacity)?;
        let id = self
            .split_allocate(bits, new_capacity)?
            .expect("expansion must expose a satisfying free block");
        self.buffer.put_u8(id, ALLOCATED_FLAG | bits as u8)?;
        Ok(id)
    }

    fn deallocate(&mut self, id: u64) -> Result<()> {
        let header = self.buffer.get_u8(id)?;
        let bits = block_size_bits(header);
        debug_assert!(is_block_aligned(id, bits));
        assert!(is_allocated(header), "block {id} is not allocated");
        self.mod_count += 1;
        self.buffer.put_u8(id, header & !ALLOCATED_FLAG)?;
        let capacity = self.buffer.capacity()?;
        self.add_free_space_map(id, bits, capacity, false)?;
        Ok(())
    }

    /// Payload capacity: the power-of-two block size minus the header.
    fn block_size(&self, id: u64) -> Result<u64> {
        let header = self.buffer.get_u8(id)?;
        assert!(is_allocated(header), "block {id} is not allocated");
        Ok(block_size(block_size_bits(header)) - 1)
    }

    fn block_address(&self, id: u64) -> Result<u64> {
        // Payload starts right after the header byte.
        Ok(id + 1)
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
        while next_id < capacity {
            let header = self.buffer.get_u8(next_id)?;
            let bits = block_size_bits(header);
            debug_assert!(is_block_aligned(next_id, bits));
            let id = next_id;
            next_id += block_size(bits);
            if is_allocated(header) {
                cursor.last_id = Some(id);
                cursor.next_id = next_id;
                return Ok(Some(id));
            }
        }
        cursor.next_id = next_id;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perseq_buffer::MemoryBuffer;
    use rand::seq::SliceRandom;
    use rand::Rng;

    fn dynamic() -> DynamicBlockBuffer<MemoryBuffer> {
        DynamicBlockBuffer::new(MemoryBuffer::new()).unwrap()
    }

    fn collect_ids<B: PersistentBuffer>(buf: &DynamicBlockBuffer<B>) -> Vec<u64> {
        let mut cursor = buf.iterate_block_ids();
        let mut ids = Vec::new();
        while let Some(id) = buf.next_block_id(&mut cursor).unwrap() {
            ids.push(id);
        }
        ids
    }

    /// No two free blocks of the same size may be buddies.
    fn assert_buddy_invariant<B: PersistentBuffer>(buf: &DynamicBlockBuffer<B>) {
        for (bits, map) in buf.free_space_maps.iter().enumerate() {
            let bits = bits as u32;
            for &id in map {
                let size = block_size(bits);
                let buddy = id ^ size;
                assert!(
                    !map.contains(&buddy),
                    "free buddies {id} and {buddy} at size class {bits}"
                );
            }
        }
    }

    #[test]
    fn size_class_selection() {
        let mut buf = dynamic();
        // 2^k must cover payload plus header: 7 bytes needs 2^3.
        let id = buf.allocate(7).unwrap();
        assert_eq!(buf.block_size(id).unwrap(), 7);
        let id = buf.allocate(8).unwrap();
        assert_eq!(buf.block_size(id).unwrap(), 15);
        let id = buf.allocate(0).unwrap();
        assert_eq!(buf.block_size(id).unwrap(), 0);
    }

    #[test]
    fn first_allocation_starts_at_zero() {
        let mut buf = dynamic();
        assert_eq!(buf.allocate(24).unwrap(), 0);
        // File grew to one page, block aligned.
        assert_eq!(buf.buffer().capacity().unwrap(), 4096);
    }

    #[test]
    fn blocks_are_aligned_to_their_size() {
        let mut buf = dynamic();
        for size in [7u64, 17, 260, 1025, 3, 40, 4095] {
            let id = buf.allocate(size).unwrap();
            let bits = 64 - size.leading_zeros();
            assert_eq!(id & (block_size(bits) - 1), 0, "block {id} misaligned");
        }
        assert_buddy_invariant(&buf);
    }

    #[test]
    fn file_stays_page_aligned_and_bounded() {
        let mut buf = dynamic();
        let sizes = [7u64, 17, 260, 1025];
        for size in sizes {
            buf.allocate(size).unwrap();
        }
        let capacity = buf.buffer().capacity().unwrap();
        assert_eq!(capacity & 0xfff, 0);
        let bound: u64 = sizes
            .iter()
            .map(|s| (s + 1).next_power_of_two())
            .sum::<u64>()
            .next_multiple_of(4096);
        assert!(capacity <= bound, "capacity {capacity} above bound {bound}");
    }

    #[test]
    fn deallocate_merges_buddies_back() {
        let mut buf = dynamic();
        let ids: Vec<u64> = (0..8).map(|_| buf.allocate(100).unwrap()).collect();
        let capacity = buf.buffer().capacity().unwrap();
        for &id in &ids {
            buf.deallocate(id).unwrap();
        }
        assert_buddy_invariant(&buf);
        // Everything merged: the free maps describe the whole file again.
        let total_free: u64 = buf
            .free_space_maps
            .iter()
            .enumerate()
            .map(|(bits, map)| map.len() as u64 * block_size(bits as u32))
            .sum();
        assert_eq!(total_free, capacity);
        assert!(collect_ids(&buf).is_empty());
    }

    #[test]
    #[should_panic(expected = "is not allocated")]
    fn double_deallocate_panics() {
        let mut buf = dynamic();
        let id = buf.allocate(16).unwrap();
        buf.deallocate(id).unwrap();
        let _ = buf.deallocate(id);
    }

    #[test]
    fn reopen_rebuilds_free_maps() {
        let mut buf = dynamic();
        let keep = buf.allocate(100).unwrap();
        let drop_id = buf.allocate(300).unwrap();
        buf.put(keep, 0, b"keep me").unwrap();
        buf.deallocate(drop_id).unwrap();
        let DynamicBlockBuffer { buffer, free_space_maps, .. } = buf;

        let reopened = DynamicBlockBuffer::new(buffer).unwrap();
        assert_eq!(reopened.free_space_maps, free_space_maps);
        assert_eq!(collect_ids(&reopened), vec![keep]);
        let mut out = [0u8; 7];
        reopened.get(keep, 0, &mut out).unwrap();
        assert_eq!(&out, b"keep me");
        assert_buddy_invariant(&reopened);
    }

    #[test]
    fn truncated_growth_is_repaired_at_open() {
        let mut buf = dynamic();
        buf.allocate(100).unwrap();
        let mut buffer = buf.buffer;
        let capacity = buffer.capacity().unwrap();
        // Simulate a crash that truncated the file mid-block.
        buffer.set_capacity(capacity - 1).unwrap();

        let reopened = DynamicBlockBuffer::new(buffer).unwrap();
        assert_eq!(reopened.buffer().capacity().unwrap(), capacity);
    }

    #[test]
    fn iteration_detects_mutation() {
        let mut buf = dynamic();
        buf.allocate(10).unwrap();
        buf.allocate(10).unwrap();
        let mut cursor = buf.iterate_block_ids();
        assert!(buf.next_block_id(&mut cursor).unwrap().is_some());
        buf.allocate(10).unwrap();
        assert!(matches!(
            buf.next_block_id(&mut cursor),
            Err(PerseqError::ConcurrentModification)
        ));
    }

    #[test]
    fn random_churn_preserves_invariants() {
        let mut rng = rand::thread_rng();
        let mut buf = dynamic();
        let mut live: Vec<u64> = Vec::new();
        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(0..2000u64);
                let id = buf.allocate(size).unwrap();
                assert!(!live.contains(&id), "id {id} double-allocated");
                live.push(id);
            } else {
                let index = rng.gen_range(0..live.len());
                let id = live.swap_remove(index);
                buf.deallocate(id).unwrap();
            }
        }
        assert_buddy_invariant(&buf);
        let mut expected = live.clone();
        expected.sort_unstable();
        assert_eq!(collect_ids(&buf), expected);
    }
}
