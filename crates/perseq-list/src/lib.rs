#![forbid(unsafe_code)]
//! Doubly-linked persistent deque with per-operation crash consistency.
//!
//! [`PersistentLinkedList`] stores an ordered sequence of elements in a
//! block buffer. The graph is held entirely by 64-bit block ids; there
//! are no in-memory node objects, only cached head/tail/len.
//!
//! The first allocated block is the metadata header:
//!
//! ```text
//! offset  type  description
//!  0- 3   u8    magic "PLL\n"
//!  4- 7   i32   version (currently 3)
//!  8-15   i64   head block id, or END_PTR when empty
//! 16-23   i64   tail block id, or END_PTR when empty
//! ```
//!
//! Every entry block holds, at offsets 0/8/16: `next`, `prev`, and
//! `data_size` (−1 for an absent element), followed by `data_size` bytes
//! of serializer output. The sentinel `END_PTR` (−2) terminates chains.
//!
//! Mutations follow a two-barrier discipline: entry bytes become durable
//! before any pointer references them, and pointer rewires become durable
//! before the operation completes. A crash therefore leaves at most one
//! partially applied rewire and at most one orphaned block, which is
//! exactly the envelope [`check_consistency`] repairs at open time.
//!
//! [`check_consistency`]: PersistentLinkedList::check_consistency

use perseq_block::PersistentBlockBuffer;
use perseq_buffer::ProtectionLevel;
use perseq_error::{PerseqError, Result};
use perseq_serial::Serializer;
use std::collections::HashMap;
use std::marker::PhantomData;
use tracing::info;

const MAGIC: [u8; 4] = *b"PLL\n";
const VERSION: i32 = 3;

const HEAD_OFFSET: u64 = 8;
const TAIL_OFFSET: u64 = 16;
const HEADER_SIZE: u64 = 24;

const NEXT_OFFSET: u64 = 0;
const PREV_OFFSET: u64 = 8;
const DATA_SIZE_OFFSET: u64 = 16;
const DATA_OFFSET: u64 = 24;

/// Sentinel pointer terminating head/tail chains.
pub const END_PTR: i64 = -2;

/// Bytes every entry needs ahead of its payload, which is also the
/// metadata block size. Block-buffer factories size fixed blocks with
/// this added to the serializer's fixed size.
pub const ENTRY_OVERHEAD: u64 = DATA_OFFSET;

const DATA_SIZE_NULL: i64 = -1;

/// Persistent deque of optional elements backed by a block buffer.
///
/// Elements are `Option<E>`: `None` is stored as an entry with
/// `data_size = -1` and no payload, so absent values never reach the
/// serializer. Operations that must distinguish "list is empty" from
/// "stored element is `None`" return nested options.
///
/// Out-of-range indexes are programmer errors and panic, as does
/// misusing a cursor; I/O and corruption surface as [`PerseqError`].
pub struct PersistentLinkedList<E, S, B> {
    serializer: S,
    blocks: B,
    meta_block_id: u64,
    head: i64,
    tail: i64,
    len: u64,
    mod_count: u64,
    _marker: PhantomData<fn() -> E>,
}

impl<E, S, B> PersistentLinkedList<E, S, B>
where
    S: Serializer<E>,
    B: PersistentBlockBuffer,
{
    /// Opens a list over `blocks`, initializing an empty buffer or
    /// recovering from an unclean shutdown. Runs in linear time to cache
    /// the size and verify the pointer graph.
    pub fn open(blocks: B, serializer: S) -> Result<Self> {
        let mut list = Self {
            serializer,
            blocks,
            meta_block_id: 0,
            head: END_PTR,
            tail: END_PTR,
            len: 0,
            mod_count: 0,
            _marker: PhantomData,
        };
        let auto_correct = list.blocks.protection_level() != ProtectionLevel::ReadOnly;
        list.check_consistency_internal(auto_correct, true)?;
        Ok(list)
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the list holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Closes the underlying block buffer.
    pub fn close(&mut self) -> Result<()> {
        if !self.blocks.is_closed() {
            self.blocks.close()?;
        }
        Ok(())
    }

    // ── Pointer management ──────────────────────────────────────────────

    fn is_valid_range(&self, ptr: i64) -> bool {
        ptr >= 0 && ptr as u64 != self.meta_block_id
    }

    fn set_head(&mut self, head: i64) -> Result<()> {
        debug_assert!(head == END_PTR || self.is_valid_range(head));
        self.blocks.put_i64(self.meta_block_id, HEAD_OFFSET, head)?;
        self.head = head;
        Ok(())
    }

    fn set_tail(&mut self, tail: i64) -> Result<()> {
        debug_assert!(tail == END_PTR || self.is_valid_range(tail));
        self.blocks.put_i64(self.meta_block_id, TAIL_OFFSET, tail)?;
        self.tail = tail;
        Ok(())
    }

    fn next_of(&self, ptr: i64) -> Result<i64> {
        debug_assert!(self.is_valid_range(ptr));
        self.blocks.get_i64(ptr as u64, NEXT_OFFSET)
    }

    fn set_next(&mut self, ptr: i64, next: i64) -> Result<()> {
        debug_assert!(self.is_valid_range(ptr));
        debug_assert!(next == END_PTR || self.is_valid_range(next));
        self.blocks.put_i64(ptr as u64, NEXT_OFFSET, next)
    }

    fn prev_of(&self, ptr: i64) -> Result<i64> {
        debug_assert!(self.is_valid_range(ptr));
        self.blocks.get_i64(ptr as u64, PREV_OFFSET)
    }

    fn set_prev(&mut self, ptr: i64, prev: i64) -> Result<()> {
        debug_assert!(self.is_valid_range(ptr));
        debug_assert!(prev == END_PTR || self.is_valid_range(prev));
        self.blocks.put_i64(ptr as u64, PREV_OFFSET, prev)
    }

    fn data_size_of(&self, ptr: i64) -> Result<i64> {
        debug_assert!(self.is_valid_range(ptr));
        self.blocks.get_i64(ptr as u64, DATA_SIZE_OFFSET)
    }

    fn element_at(&self, ptr: i64) -> Result<Option<E>> {
        let data_size = self.data_size_of(ptr)?;
        if data_size == DATA_SIZE_NULL {
            return Ok(None);
        }
        let mut reader = self
            .blocks
            .reader(ptr as u64, DATA_OFFSET, data_size as u64)?;
        Ok(Some(self.serializer.deserialize(&mut reader)?))
    }

    // ── Structure management ────────────────────────────────────────────

    /// Unlinks and deallocates the entry at `ptr`.
    ///
    /// The first barrier makes the rewired pointers durable before the
    /// block is deallocated; the second makes the deallocation durable so
    /// recovery can assume at most one unreferenced block.
    fn remove_entry(&mut self, ptr: i64) -> Result<()> {
        debug_assert!(self.is_valid_range(ptr));
        debug_assert!(self.len > 0);
        let prev = self.prev_of(ptr)?;
        let next = self.next_of(ptr)?;
        if prev == END_PTR {
            debug_assert_eq!(self.head, ptr);
            self.set_head(next)?;
        } else {
            self.set_next(prev, next)?;
        }
        if next == END_PTR {
            debug_assert_eq!(self.tail, ptr);
            self.set_tail(prev)?;
        } else {
            self.set_prev(next, prev)?;
        }
        self.blocks.barrier(false)?;
        self.blocks.deallocate(ptr as u64)?;
        self.blocks.barrier(true)?;
        self.len -= 1;
        Ok(())
    }

    /// Writes a fully formed entry block, then links it between `prev`
    /// and `next` under the two-barrier discipline.
    fn add_entry(&mut self, next: i64, prev: i64, element: Option<&E>) -> Result<i64> {
        debug_assert!(next == END_PTR || self.is_valid_range(next));
        debug_assert!(prev == END_PTR || self.is_valid_range(prev));
        if self.len == u64::MAX {
            return Err(PerseqError::ListFull);
        }
        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..8].copy_from_slice(&next.to_be_bytes());
        header[8..16].copy_from_slice(&prev.to_be_bytes());
        let new_id = match element {
            None => {
                let id = self.blocks.allocate(DATA_OFFSET)?;
                header[16..24].copy_from_slice(&DATA_SIZE_NULL.to_be_bytes());
                self.blocks.put(id, 0, &header)?;
                id
            }
            Some(value) => {
                let data_size = self.serializer.serialized_size(value)?;
                let id = self.blocks.allocate(DATA_OFFSET + data_size)?;
                header[16..24].copy_from_slice(&(data_size as i64).to_be_bytes());
                self.blocks.put(id, 0, &header)?;
                let mut writer = self.blocks.writer(id, DATA_OFFSET, data_size)?;
                self.serializer.serialize(value, &mut writer)?;
                id
            }
        };
        // Entry bytes are durable before any pointer references them.
        self.blocks.barrier(false)?;
        let new_ptr = new_id as i64;
        if prev == END_PTR {
            debug_assert_eq!(self.head, next);
            self.set_head(new_ptr)?;
        } else {
            debug_assert_eq!(self.next_of(prev)?, next);
            self.set_next(prev, new_ptr)?;
        }
        if next == END_PTR {
            debug_assert_eq!(self.tail, prev);
            self.set_tail(new_ptr)?;
        } else {
            debug_assert_eq!(self.prev_of(next)?, prev);
            self.set_prev(next, new_ptr)?;
        }
        // Pointer rewires are durable before the operation completes.
        self.blocks.barrier(true)?;
        self.len += 1;
        Ok(new_ptr)
    }

    fn add_before(&mut self, element: Option<&E>, ptr: i64) -> Result<i64> {
        let prev = self.prev_of(ptr)?;
        self.add_entry(ptr, prev, element)
    }

    fn add_after(&mut self, element: Option<&E>, ptr: i64) -> Result<i64> {
        let next = self.next_of(ptr)?;
        self.add_entry(next, ptr, element)
    }

    /// Pointer for `index`, walking from whichever end is nearer.
    fn pointer_for_index(&self, index: u64) -> Result<i64> {
        debug_assert!(index < self.len);
        if index < self.len >> 1 {
            let mut ptr = self.head;
            for _ in 0..index {
                ptr = self.next_of(ptr)?;
                debug_assert_ne!(ptr, END_PTR);
            }
            Ok(ptr)
        } else {
            let mut ptr = self.tail;
            let mut i = self.len - 1;
            while i > index {
                ptr = self.prev_of(ptr)?;
                debug_assert_ne!(ptr, END_PTR);
                i -= 1;
            }
            Ok(ptr)
        }
    }

    // ── Deque operations ────────────────────────────────────────────────

    /// First element, or `None` when the list is empty.
    pub fn front(&self) -> Result<Option<Option<E>>> {
        if self.head == END_PTR {
            return Ok(None);
        }
        Ok(Some(self.element_at(self.head)?))
    }

    /// Last element, or `None` when the list is empty.
    pub fn back(&self) -> Result<Option<Option<E>>> {
        if self.tail == END_PTR {
            return Ok(None);
        }
        Ok(Some(self.element_at(self.tail)?))
    }

    /// Inserts at the front. Constant time plus allocator cost.
    pub fn push_front(&mut self, element: Option<&E>) -> Result<()> {
        self.mod_count += 1;
        if self.head == END_PTR {
            self.add_entry(END_PTR, END_PTR, element)?;
        } else {
            self.add_before(element, self.head)?;
        }
        Ok(())
    }

    /// Appends at the back. Constant time plus allocator cost.
    pub fn push_back(&mut self, element: Option<&E>) -> Result<()> {
        self.mod_count += 1;
        if self.tail == END_PTR {
            self.add_entry(END_PTR, END_PTR, element)?;
        } else {
            self.add_after(element, self.tail)?;
        }
        Ok(())
    }

    /// Removes and returns the first element, or `None` when empty.
    pub fn pop_front(&mut self) -> Result<Option<Option<E>>> {
        if self.head == END_PTR {
            return Ok(None);
        }
        self.mod_count += 1;
        let element = self.element_at(self.head)?;
        self.remove_entry(self.head)?;
        Ok(Some(element))
    }

    /// Removes and returns the last element, or `None` when empty.
    pub fn pop_back(&mut self) -> Result<Option<Option<E>>> {
        if self.tail == END_PTR {
            return Ok(None);
        }
        self.mod_count += 1;
        let element = self.element_at(self.tail)?;
        self.remove_entry(self.tail)?;
        Ok(Some(element))
    }

    /// Element at `index`. Walks from the nearer end, O(n/2) expected.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn get(&self, index: u64) -> Result<Option<E>> {
        assert!(index < self.len, "index {index} out of bounds for length {}", self.len);
        self.element_at(self.pointer_for_index(index)?)
    }

    /// Inserts before the element at `index`; `index == len()` appends.
    ///
    /// # Panics
    ///
    /// Panics if `index > len()`.
    pub fn insert(&mut self, index: u64, element: Option<&E>) -> Result<()> {
        assert!(index <= self.len, "index {index} out of bounds for length {}", self.len);
        if index == self.len {
            return self.push_back(element);
        }
        self.mod_count += 1;
        let ptr = self.pointer_for_index(index)?;
        self.add_before(element, ptr)?;
        Ok(())
    }

    /// Removes and returns the element at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn remove(&mut self, index: u64) -> Result<Option<E>> {
        assert!(index < self.len, "index {index} out of bounds for length {}", self.len);
        self.mod_count += 1;
        let ptr = self.pointer_for_index(index)?;
        let element = self.element_at(ptr)?;
        self.remove_entry(ptr)?;
        Ok(element)
    }

    /// Replaces the element at `index`, returning the previous value.
    ///
    /// Implemented as remove plus insert, which keeps the on-disk format
    /// unchanged but is not atomic under crashes: an interrupted `set`
    /// recovers as either "removed" or "removed then inserted".
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn set(&mut self, index: u64, element: Option<&E>) -> Result<Option<E>> {
        assert!(index < self.len, "index {index} out of bounds for length {}", self.len);
        self.mod_count += 1;
        let ptr = self.pointer_for_index(index)?;
        let old = self.element_at(ptr)?;
        self.replace_entry(ptr, element)?;
        Ok(old)
    }

    fn replace_entry(&mut self, ptr: i64, element: Option<&E>) -> Result<()> {
        let prev = self.prev_of(ptr)?;
        self.remove_entry(ptr)?;
        if prev == END_PTR {
            if self.head == END_PTR {
                self.add_entry(END_PTR, END_PTR, element)?;
            } else {
                self.add_before(element, self.head)?;
            }
        } else {
            self.add_after(element, prev)?;
        }
        Ok(())
    }

    /// Removes every element, leaving only the metadata block.
    pub fn clear(&mut self) -> Result<()> {
        self.mod_count += 1;
        let mut cursor = self.blocks.iterate_block_ids();
        let first = self
            .blocks
            .next_block_id(&mut cursor)?
            .expect("block buffer has no metadata block");
        assert_eq!(first, self.meta_block_id, "first block is not the metadata block");
        self.set_head(END_PTR)?;
        self.set_tail(END_PTR)?;
        self.len = 0;
        self.blocks.barrier(false)?;
        while self.blocks.next_block_id(&mut cursor)?.is_some() {
            self.blocks.remove_current(&mut cursor)?;
        }
        self.blocks.barrier(true)?;
        Ok(())
    }

    // ── Search ──────────────────────────────────────────────────────────

    /// Index of the first element equal to `element`, if any.
    pub fn index_of(&self, element: Option<&E>) -> Result<Option<u64>>
    where
        E: PartialEq,
    {
        let mut index = 0u64;
        let mut ptr = self.head;
        while ptr != END_PTR {
            if self.element_at(ptr)?.as_ref() == element {
                return Ok(Some(index));
            }
            ptr = self.next_of(ptr)?;
            index += 1;
        }
        Ok(None)
    }

    /// Index of the last element equal to `element`, if any.
    pub fn last_index_of(&self, element: Option<&E>) -> Result<Option<u64>>
    where
        E: PartialEq,
    {
        let mut index = self.len;
        let mut ptr = self.tail;
        while ptr != END_PTR {
            index -= 1;
            if self.element_at(ptr)?.as_ref() == element {
                return Ok(Some(index));
            }
            ptr = self.prev_of(ptr)?;
        }
        Ok(None)
    }

    /// Whether any element equals `element`.
    pub fn contains(&self, element: Option<&E>) -> Result<bool>
    where
        E: PartialEq,
    {
        Ok(self.index_of(element)?.is_some())
    }

    // ── Iteration ───────────────────────────────────────────────────────

    /// Forward iterator over elements.
    pub fn iter(&self) -> Iter<'_, E, S, B> {
        Iter {
            list: self,
            ptr: self.head,
            descending: false,
        }
    }

    /// Back-to-front iterator over elements.
    pub fn iter_descending(&self) -> Iter<'_, E, S, B> {
        Iter {
            list: self,
            ptr: self.tail,
            descending: true,
        }
    }

    /// All elements, front to back.
    pub fn to_vec(&self) -> Result<Vec<Option<E>>> {
        self.iter().collect()
    }

    /// Detached cursor positioned before `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index > len()`.
    pub fn cursor_at(&self, index: u64) -> Result<CursorMut> {
        assert!(index <= self.len, "index {index} out of bounds for length {}", self.len);
        let next_ptr = if index == self.len {
            END_PTR
        } else {
            self.pointer_for_index(index)?
        };
        Ok(CursorMut {
            next_ptr,
            next_index: index,
            last_returned: END_PTR,
            expected_mod_count: self.mod_count,
        })
    }

    // ── Consistency check and recovery ──────────────────────────────────

    /// Verifies the list invariants, optionally repairing the damage an
    /// unclean shutdown can leave behind (one partial pointer rewire and
    /// at most one orphaned block). Repairs are logged; anything outside
    /// that envelope fails with [`PerseqError::Corruption`].
    ///
    /// # Panics
    ///
    /// Panics if `auto_correct` is requested on a read-only buffer.
    pub fn check_consistency(&mut self, auto_correct: bool) -> Result<()> {
        self.check_consistency_internal(auto_correct, false)
    }

    fn check_consistency_internal(&mut self, auto_correct: bool, is_init: bool) -> Result<()> {
        assert!(
            !(auto_correct && self.blocks.protection_level() == ProtectionLevel::ReadOnly),
            "auto-correct on a read-only block buffer"
        );
        let mut ids = self.blocks.iterate_block_ids();
        let Some(first_id) = self.blocks.next_block_id(&mut ids)? else {
            // Empty buffer: write the metadata block.
            if !auto_correct {
                return Err(PerseqError::Corruption(
                    "block buffer is empty - no metadata block found".into(),
                ));
            }
            if !is_init {
                info!(
                    target: "perseq::list",
                    event = "recovery",
                    action = "initialize_metadata"
                );
            }
            self.meta_block_id = self.blocks.allocate(HEADER_SIZE)?;
            self.blocks.put(self.meta_block_id, 0, &MAGIC)?;
            self.blocks.put_i32(self.meta_block_id, 4, VERSION)?;
            self.set_head(END_PTR)?;
            self.set_tail(END_PTR)?;
            self.blocks.barrier(true)?;
            self.len = 0;
            return Ok(());
        };

        // Metadata block identity, magic, and version.
        if self.meta_block_id != first_id {
            if !is_init {
                if !auto_correct {
                    return Err(PerseqError::Corruption(format!(
                        "metadata block id {} does not match first block {first_id}",
                        self.meta_block_id
                    )));
                }
                info!(
                    target: "perseq::list",
                    event = "recovery",
                    action = "adopt_metadata_block",
                    block = first_id
                );
            }
            self.meta_block_id = first_id;
        }
        let mut magic = [0u8; 4];
        self.blocks.get(self.meta_block_id, 0, &mut magic)?;
        if magic != MAGIC {
            return Err(PerseqError::Format(
                "file does not appear to be a persistent linked list (magic mismatch)".into(),
            ));
        }
        let version = self.blocks.get_i32(self.meta_block_id, 4)?;
        if version != VERSION {
            return Err(PerseqError::Format(format!(
                "unsupported file version {version}"
            )));
        }

        // Remaining allocated blocks, unseen until walked.
        let mut allocated: HashMap<u64, bool> = HashMap::new();
        while let Some(id) = self.blocks.next_block_id(&mut ids)? {
            allocated.insert(id, false);
        }

        // Head and tail must be END_PTR or point at allocated blocks.
        let correct_head = self.blocks.get_i64(self.meta_block_id, HEAD_OFFSET)?;
        if self.head != correct_head {
            if !is_init {
                if !auto_correct {
                    return Err(PerseqError::Corruption(format!(
                        "cached head {} does not match stored head {correct_head}",
                        self.head
                    )));
                }
                info!(
                    target: "perseq::list",
                    event = "recovery",
                    action = "reload_head",
                    head = correct_head
                );
            }
            self.head = correct_head;
        }
        if self.head != END_PTR && !allocated.contains_key(&(self.head as u64)) {
            return Err(PerseqError::Corruption(format!(
                "head points to unallocated block {}",
                self.head
            )));
        }
        let correct_tail = self.blocks.get_i64(self.meta_block_id, TAIL_OFFSET)?;
        if self.tail != correct_tail {
            if !is_init {
                if !auto_correct {
                    return Err(PerseqError::Corruption(format!(
                        "cached tail {} does not match stored tail {correct_tail}",
                        self.tail
                    )));
                }
                info!(
                    target: "perseq::list",
                    event = "recovery",
                    action = "reload_tail",
                    tail = correct_tail
                );
            }
            self.tail = correct_tail;
        }
        if self.tail != END_PTR && !allocated.contains_key(&(self.tail as u64)) {
            return Err(PerseqError::Corruption(format!(
                "tail points to unallocated block {}",
                self.tail
            )));
        }

        // One end null, the other not: an interrupted add or remove of a
        // singleton. Recover when the survivor is consistent.
        if self.head == END_PTR && self.tail != END_PTR {
            if !auto_correct {
                return Err(PerseqError::Corruption(format!(
                    "head is END_PTR while tail is {}",
                    self.tail
                )));
            }
            info!(
                target: "perseq::list",
                event = "recovery",
                action = "restore_head_from_tail",
                tail = self.tail
            );
            let prev = self.prev_of(self.tail)?;
            if prev != END_PTR {
                return Err(PerseqError::Corruption(format!(
                    "tail.prev is {prev}, expected END_PTR"
                )));
            }
            let next = self.next_of(self.tail)?;
            if next != END_PTR {
                return Err(PerseqError::Corruption(format!(
                    "tail.next is {next}, expected END_PTR"
                )));
            }
            self.set_head(self.tail)?;
        }
        if self.tail == END_PTR && self.head != END_PTR {
            if !auto_correct {
                return Err(PerseqError::Corruption(format!(
                    "tail is END_PTR while head is {}",
                    self.head
                )));
            }
            info!(
                target: "perseq::list",
                event = "recovery",
                action = "restore_tail_from_head",
                head = self.head
            );
            let prev = self.prev_of(self.head)?;
            if prev != END_PTR {
                return Err(PerseqError::Corruption(format!(
                    "head.prev is {prev}, expected END_PTR"
                )));
            }
            let next = self.next_of(self.head)?;
            if next != END_PTR {
                return Err(PerseqError::Corruption(format!(
                    "head.next is {next}, expected END_PTR"
                )));
            }
            self.set_tail(self.head)?;
        }

        // A block linked in front of head: an interrupted push_front whose
        // entry was fully linked except for the head pointer.
        if self.head != END_PTR {
            let prev = self.prev_of(self.head)?;
            if prev != END_PTR {
                if !auto_correct {
                    return Err(PerseqError::Corruption(format!(
                        "head.prev is {prev}, expected END_PTR"
                    )));
                }
                if !allocated.contains_key(&(prev as u64)) {
                    return Err(PerseqError::Corruption(format!(
                        "head.prev points to unallocated block {prev}"
                    )));
                }
                info!(
                    target: "perseq::list",
                    event = "recovery",
                    action = "extend_head",
                    block = prev
                );
                let prev_prev = self.prev_of(prev)?;
                if prev_prev != END_PTR {
                    return Err(PerseqError::Corruption(format!(
                        "unrecoverable: head.prev.prev is {prev_prev}, expected END_PTR"
                    )));
                }
                let prev_next = self.next_of(prev)?;
                if prev_next != self.head {
                    return Err(PerseqError::Corruption(format!(
                        "unrecoverable: head.prev.next is {prev_next}, expected head {}",
                        self.head
                    )));
                }
                self.set_head(prev)?;
            }
        }
        // Symmetric check at the tail.
        if self.tail != END_PTR {
            let next = self.next_of(self.tail)?;
            if next != END_PTR {
                if !auto_correct {
                    return Err(PerseqError::Corruption(format!(
                        "tail.next is {next}, expected END_PTR"
                    )));
                }
                if !allocated.contains_key(&(next as u64)) {
                    return Err(PerseqError::Corruption(format!(
                        "tail.next points to unallocated block {next}"
                    )));
                }
                info!(
                    target: "perseq::list",
                    event = "recovery",
                    action = "extend_tail",
                    block = next
                );
                let next_next = self.next_of(next)?;
                if next_next != END_PTR {
                    return Err(PerseqError::Corruption(format!(
                        "unrecoverable: tail.next.next is {next_next}, expected END_PTR"
                    )));
                }
                let next_prev = self.prev_of(next)?;
                if next_prev != self.tail {
                    return Err(PerseqError::Corruption(format!(
                        "unrecoverable: tail.next.prev is {next_prev}, expected tail {}",
                        self.tail
                    )));
                }
                self.set_tail(next)?;
            }
        }

        // Walk head to tail verifying the pointer graph.
        let mut count = 0u64;
        let mut ptr = self.head;
        while ptr != END_PTR {
            let Some(seen) = allocated.get_mut(&(ptr as u64)) else {
                return Err(PerseqError::Corruption(format!(
                    "chain pointer {ptr} references an unallocated block"
                )));
            };
            if *seen {
                return Err(PerseqError::Corruption(format!(
                    "block {ptr} seen more than once, loop in list"
                )));
            }
            *seen = true;

            // Walking forward, prev must already be consistent.
            let prev = self.prev_of(ptr)?;
            if prev == END_PTR {
                if self.head != ptr {
                    return Err(PerseqError::Corruption(format!(
                        "block {ptr} has prev END_PTR but head is {}",
                        self.head
                    )));
                }
            } else {
                if !allocated.contains_key(&(prev as u64)) {
                    return Err(PerseqError::Corruption(format!(
                        "block {ptr} prev references unallocated block {prev}"
                    )));
                }
                let prev_next = self.next_of(prev)?;
                if prev_next != ptr {
                    return Err(PerseqError::Corruption(format!(
                        "block {prev} next is {prev_next}, expected {ptr}"
                    )));
                }
            }

            let mut next = self.next_of(ptr)?;
            if next == END_PTR {
                if self.tail != ptr {
                    // An interrupted push_back: the entry is complete but
                    // the old tail's next pointer never flushed.
                    if !auto_correct {
                        return Err(PerseqError::Corruption(format!(
                            "block {ptr} has next END_PTR but tail is {}",
                            self.tail
                        )));
                    }
                    info!(
                        target: "perseq::list",
                        event = "recovery",
                        action = "relink_tail",
                        block = ptr,
                        tail = self.tail
                    );
                    if self.tail == END_PTR {
                        return Err(PerseqError::Corruption(
                            "unrecoverable: tail is END_PTR mid-chain".into(),
                        ));
                    }
                    let tail_prev = self.prev_of(self.tail)?;
                    if tail_prev != ptr {
                        return Err(PerseqError::Corruption(format!(
                            "unrecoverable: tail.prev is {tail_prev}, expected {ptr}"
                        )));
                    }
                    let tail_next = self.next_of(self.tail)?;
                    if tail_next != END_PTR {
                        return Err(PerseqError::Corruption(format!(
                            "unrecoverable: tail.next is {tail_next}, expected END_PTR"
                        )));
                    }
                    next = self.tail;
                    self.set_next(ptr, next)?;
                }
            } else {
                if !allocated.contains_key(&(next as u64)) {
                    return Err(PerseqError::Corruption(format!(
                        "block {ptr} next references unallocated block {next}"
                    )));
                }
                let next_prev = self.prev_of(next)?;
                if next_prev != ptr {
                    // An interrupted insert or remove left the back
                    // pointer one step behind.
                    if !auto_correct {
                        return Err(PerseqError::Corruption(format!(
                            "block {next} prev is {next_prev}, expected {ptr}"
                        )));
                    }
                    if next_prev != prev {
                        return Err(PerseqError::Corruption(format!(
                            "unrecoverable: block {next} prev is {next_prev}, \
                             matching neither {ptr} nor {prev}"
                        )));
                    }
                    info!(
                        target: "perseq::list",
                        event = "recovery",
                        action = "relink_prev",
                        block = next,
                        prev = ptr
                    );
                    self.set_prev(next, ptr)?;
                }
            }

            ptr = next;
            count += 1;
        }

        // At most one orphan may exist under the two-barrier discipline.
        let mut orphans = allocated
            .iter()
            .filter(|(_, seen)| !**seen)
            .map(|(id, _)| *id);
        if let Some(orphan) = orphans.next() {
            let extra = orphans.count();
            if extra > 0 {
                return Err(PerseqError::Corruption(format!(
                    "{} blocks allocated but unreferenced, first {orphan}",
                    extra + 1
                )));
            }
            if !auto_correct {
                return Err(PerseqError::Corruption(format!(
                    "block {orphan} allocated but unreferenced"
                )));
            }
            info!(
                target: "perseq::list",
                event = "recovery",
                action = "deallocate_orphan",
                block = orphan
            );
            self.blocks.deallocate(orphan)?;
        }

        if self.len != count {
            if !is_init {
                if !auto_correct {
                    return Err(PerseqError::Corruption(format!(
                        "cached length {} does not match walked count {count}",
                        self.len
                    )));
                }
                info!(
                    target: "perseq::list",
                    event = "recovery",
                    action = "reset_length",
                    length = count
                );
            }
            self.len = count;
        }
        Ok(())
    }
}

/// Borrowing iterator over list elements in either direction.
pub struct Iter<'a, E, S, B> {
    list: &'a PersistentLinkedList<E, S, B>,
    ptr: i64,
    descending: bool,
}

impl<E, S, B> Iterator for Iter<'_, E, S, B>
where
    S: Serializer<E>,
    B: PersistentBlockBuffer,
{
    type Item = Result<Option<E>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.ptr == END_PTR {
            return None;
        }
        let current = self.ptr;
        let advanced = if self.descending {
            self.list.prev_of(current)
        } else {
            self.list.next_of(current)
        };
        match advanced {
            Ok(next) => self.ptr = next,
            Err(err) => {
                self.ptr = END_PTR;
                return Some(Err(err));
            }
        }
        Some(self.list.element_at(current))
    }
}

/// Detached mutating cursor, the list counterpart of
/// [`perseq_block::BlockIdCursor`].
///
/// The cursor holds no borrow; every operation takes the list and
/// revalidates a modification counter, failing with
/// [`PerseqError::ConcurrentModification`] when the list was changed
/// through anything but this cursor.
#[derive(Debug, Clone)]
pub struct CursorMut {
    next_ptr: i64,
    next_index: u64,
    last_returned: i64,
    expected_mod_count: u64,
}

impl CursorMut {
    fn check<E, S, B>(&self, list: &PersistentLinkedList<E, S, B>) -> Result<()> {
        if self.expected_mod_count != list.mod_count {
            return Err(PerseqError::ConcurrentModification);
        }
        Ok(())
    }

    /// Whether an element follows the cursor.
    #[must_use]
    pub fn has_next<E, S, B>(&self, list: &PersistentLinkedList<E, S, B>) -> bool {
        self.next_index != list.len
    }

    /// Whether an element precedes the cursor.
    #[must_use]
    pub fn has_previous(&self) -> bool {
        self.next_index != 0
    }

    /// Returns the element after the cursor and advances past it.
    pub fn next<E, S, B>(
        &mut self,
        list: &PersistentLinkedList<E, S, B>,
    ) -> Result<Option<Option<E>>>
    where
        S: Serializer<E>,
        B: PersistentBlockBuffer,
    {
        self.check(list)?;
        if self.next_index == list.len {
            return Ok(None);
        }
        self.last_returned = self.next_ptr;
        self.next_ptr = list.next_of(self.next_ptr)?;
        self.next_index += 1;
        Ok(Some(list.element_at(self.last_returned)?))
    }

    /// Returns the element before the cursor and moves back over it.
    pub fn previous<E, S, B>(
        &mut self,
        list: &PersistentLinkedList<E, S, B>,
    ) -> Result<Option<Option<E>>>
    where
        S: Serializer<E>,
        B: PersistentBlockBuffer,
    {
        self.check(list)?;
        if self.next_index == 0 {
            return Ok(None);
        }
        self.next_ptr = if self.next_ptr == END_PTR {
            list.tail
        } else {
            list.prev_of(self.next_ptr)?
        };
        self.last_returned = self.next_ptr;
        self.next_index -= 1;
        Ok(Some(list.element_at(self.last_returned)?))
    }

    /// Index of the element a call to [`next`](Self::next) would return.
    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Removes the element most recently returned.
    ///
    /// # Panics
    ///
    /// Panics if no element has been returned since the last removal.
    pub fn remove<E, S, B>(&mut self, list: &mut PersistentLinkedList<E, S, B>) -> Result<()>
    where
        S: Serializer<E>,
        B: PersistentBlockBuffer,
    {
        self.check(list)?;
        assert!(
            self.last_returned != END_PTR,
            "cursor has no current element to remove"
        );
        let last_next = list.next_of(self.last_returned)?;
        list.mod_count += 1;
        list.remove_entry(self.last_returned)?;
        if self.next_ptr == self.last_returned {
            self.next_ptr = last_next;
        } else {
            self.next_index -= 1;
        }
        self.last_returned = END_PTR;
        self.expected_mod_count = list.mod_count;
        Ok(())
    }

    /// Replaces the element most recently returned. Non-atomic like
    /// [`PersistentLinkedList::set`]; the replacement entry takes the
    /// same position but a fresh block.
    ///
    /// # Panics
    ///
    /// Panics if no element has been returned since the last removal.
    pub fn set<E, S, B>(
        &mut self,
        list: &mut PersistentLinkedList<E, S, B>,
        element: Option<&E>,
    ) -> Result<()>
    where
        S: Serializer<E>,
        B: PersistentBlockBuffer,
    {
        self.check(list)?;
        assert!(
            self.last_returned != END_PTR,
            "cursor has no current element to replace"
        );
        let replacing_next = self.next_ptr == self.last_returned;
        let prev = list.prev_of(self.last_returned)?;
        list.mod_count += 1;
        list.remove_entry(self.last_returned)?;
        let new_ptr = if prev == END_PTR {
            if list.head == END_PTR {
                list.add_entry(END_PTR, END_PTR, element)?
            } else {
                list.add_before(element, list.head)?
            }
        } else {
            list.add_after(element, prev)?
        };
        if replacing_next {
            self.next_ptr = new_ptr;
        }
        self.last_returned = new_ptr;
        self.expected_mod_count = list.mod_count;
        Ok(())
    }

    /// Inserts an element at the cursor position; the cursor ends up
    /// after the inserted element.
    pub fn insert<E, S, B>(
        &mut self,
        list: &mut PersistentLinkedList<E, S, B>,
        element: Option<&E>,
    ) -> Result<()>
    where
        S: Serializer<E>,
        B: PersistentBlockBuffer,
    {
        self.check(list)?;
        list.mod_count += 1;
        if self.next_ptr == END_PTR {
            if list.tail == END_PTR {
                list.add_entry(END_PTR, END_PTR, element)?;
            } else {
                list.add_after(element, list.tail)?;
            }
        } else {
            list.add_before(element, self.next_ptr)?;
        }
        self.last_returned = END_PTR;
        self.next_index += 1;
        self.expected_mod_count = list.mod_count;
        Ok(())
    }
}
