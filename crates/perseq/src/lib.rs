#![forbid(unsafe_code)]
//! Crash-consistent persistent sequence storage.
//!
//! perseq is a stack of three subsystems:
//!
//! 1. **Byte buffers** ([`PersistentBuffer`]) over fixed files, with a
//!    configurable durability policy and an explicit write-ordering
//!    barrier. Variants cover direct I/O, single and segmented memory
//!    mappings, and the crash-safe [`TwoCopyBarrierBuffer`].
//! 2. **Block allocators** ([`PersistentBlockBuffer`]) over a buffer:
//!    fixed-size slots with bitmap free maps, or power-of-two buddy
//!    blocks.
//! 3. **[`PersistentLinkedList`]**: a doubly-linked persistent deque
//!    whose every mutation is crash-consistent and which recovers
//!    automatically at open time.
//!
//! The helpers here pick suitable layers: [`recommended_buffer`] selects
//! a buffer variant by capacity, [`block_buffer_for`] selects an
//! allocator by serializer shape, and [`open_list`] wires a whole stack
//! over the two-copy barrier buffer, the crash-safe default for list
//! files.
//!
//! ```no_run
//! use perseq::{open_list, ProtectionLevel};
//!
//! # fn main() -> perseq::Result<()> {
//! let mut list = open_list::<String>("names.pll", ProtectionLevel::Force)?;
//! list.push_back(Some(&"alice".to_owned()))?;
//! list.push_front(None)?;
//! assert_eq!(list.len(), 2);
//! list.close()?;
//! # Ok(())
//! # }
//! ```

pub use perseq_barrier::{shutdown_all, TwoCopyBarrierBuffer, TwoCopyConfig};
pub use perseq_block::{
    BlockIdCursor, DynamicBlockBuffer, FixedBlockBuffer, PersistentBlockBuffer,
};
pub use perseq_buffer::{
    BufferReader, BufferWriter, DirectFileBuffer, MappedBuffer, MemoryBuffer, PersistentBuffer,
    ProtectionLevel, SegmentedMappedBuffer, MAPPED_MAX_CAPACITY,
};
pub use perseq_error::{PerseqError, Result};
pub use perseq_list::{CursorMut, PersistentLinkedList, END_PTR, ENTRY_OVERHEAD};
pub use perseq_serial::{
    default_serializer, BincodeSerializer, BoolSerializer, ByteArraySerializer, ByteSerializer,
    DefaultSerializer, F32Serializer, F64Serializer, I16Serializer, I32Serializer, I64Serializer,
    Serializer, StringSerializer, U16Serializer,
};

use std::path::Path;

/// Opens the most efficient buffer variant for the expected capacity:
/// a single mapping below 1 GiB, segmented mappings above. An existing
/// file larger than the hint raises the hint to the file's length.
pub fn recommended_buffer(
    path: impl AsRef<Path>,
    protection_level: ProtectionLevel,
    maximum_capacity: u64,
) -> Result<Box<dyn PersistentBuffer>> {
    let path = path.as_ref();
    let mut maximum_capacity = maximum_capacity;
    if let Ok(metadata) = path.metadata() {
        maximum_capacity = maximum_capacity.max(metadata.len());
    }
    if maximum_capacity < (1 << 30) {
        Ok(Box::new(MappedBuffer::open(path, protection_level)?))
    } else {
        Ok(Box::new(SegmentedMappedBuffer::open(path, protection_level)?))
    }
}

/// A temporary-file-backed scratch buffer sized by the same rule as
/// [`recommended_buffer`]. Deleted when dropped.
pub fn scratch_buffer(maximum_capacity: u64) -> Result<Box<dyn PersistentBuffer>> {
    if maximum_capacity < (1 << 30) {
        Ok(Box::new(MappedBuffer::temporary()?))
    } else {
        Ok(Box::new(SegmentedMappedBuffer::temporary()?))
    }
}

/// Block buffer chosen by serializer shape: fixed power-of-two blocks
/// for fixed-size serializers, buddy-allocated dynamic blocks otherwise.
#[derive(Debug)]
pub enum AutoBlockBuffer<B> {
    Fixed(FixedBlockBuffer<B>),
    Dynamic(DynamicBlockBuffer<B>),
}

impl<B: PersistentBuffer> PersistentBlockBuffer for AutoBlockBuffer<B> {
    type Buffer = B;

    fn buffer(&self) -> &B {
        match self {
            Self::Fixed(inner) => inner.buffer(),
            Self::Dynamic(inner) => inner.buffer(),
        }
    }

    fn buffer_mut(&mut self) -> &mut B {
        match self {
            Self::Fixed(inner) => inner.buffer_mut(),
            Self::Dynamic(inner) => inner.buffer_mut(),
        }
    }

    fn allocate(&mut self, minimum_size: u64) -> Result<u64> {
        match self {
            Self::Fixed(inner) => inner.allocate(minimum_size),
            Self::Dynamic(inner) => inner.allocate(minimum_size),
        }
    }

    fn deallocate(&mut self, id: u64) -> Result<()> {
        match self {
            Self::Fixed(inner) => inner.deallocate(id),
            Self::Dynamic(inner) => inner.deallocate(id),
        }
    }

    fn block_size(&self, id: u64) -> Result<u64> {
        match self {
            Self::Fixed(inner) => inner.block_size(id),
            Self::Dynamic(inner) => inner.block_size(id),
        }
    }

    fn block_address(&self, id: u64) -> Result<u64> {
        match self {
            Self::Fixed(inner) => inner.block_address(id),
            Self::Dynamic(inner) => inner.block_address(id),
        }
    }

    fn modification_count(&self) -> u64 {
        match self {
            Self::Fixed(inner) => inner.modification_count(),
            Self::Dynamic(inner) => inner.modification_count(),
        }
    }

    fn next_block_id(&self, cursor: &mut BlockIdCursor) -> Result<Option<u64>> {
        match self {
            Self::Fixed(inner) => inner.next_block_id(cursor),
            Self::Dynamic(inner) => inner.next_block_id(cursor),
        }
    }
}

/// Picks the most efficient block buffer for a serializer. Fixed-size
/// serializers get power-of-two fixed blocks (rounded up to align with
/// page tables); variable-size serializers get dynamic buddy blocks.
///
/// `additional_block_space` is the per-block overhead the container
/// needs beyond the serialized element, such as linked-list pointers.
pub fn block_buffer_for<E, S, B>(
    serializer: &S,
    buffer: B,
    additional_block_space: u64,
) -> Result<AutoBlockBuffer<B>>
where
    S: Serializer<E>,
    B: PersistentBuffer,
{
    if let Some(fixed) = serializer.fixed_size() {
        let minimum = (fixed + additional_block_space).max(1);
        let block_size = if minimum.is_power_of_two() || minimum > 1 << 62 {
            // Above 2^62 there is no next power of two to round up to.
            minimum
        } else {
            minimum.next_power_of_two()
        };
        Ok(AutoBlockBuffer::Fixed(FixedBlockBuffer::new(
            buffer, block_size,
        )))
    } else {
        Ok(AutoBlockBuffer::Dynamic(DynamicBlockBuffer::new(buffer)?))
    }
}

/// A persistent list stack over a [`TwoCopyBarrierBuffer`] file set.
pub type FileBackedList<E> = PersistentLinkedList<
    E,
    <E as DefaultSerializer>::Serializer,
    AutoBlockBuffer<TwoCopyBarrierBuffer>,
>;

/// Opens (creating if needed) a persistent list at `path` using the
/// built-in serializer for `E` and the two-copy barrier buffer.
/// Recovery runs before this returns.
pub fn open_list<E: DefaultSerializer>(
    path: impl AsRef<Path>,
    protection_level: ProtectionLevel,
) -> Result<FileBackedList<E>> {
    let buffer = TwoCopyBarrierBuffer::with_protection_level(path, protection_level)?;
    let serializer = E::serializer();
    let blocks = block_buffer_for(&serializer, buffer, ENTRY_OVERHEAD)?;
    PersistentLinkedList::open(blocks, serializer)
}

/// A temporary list living in a scratch two-copy file set that is
/// deleted on drop.
pub fn temp_list<E: DefaultSerializer>() -> Result<FileBackedList<E>> {
    let buffer = TwoCopyBarrierBuffer::temporary()?;
    let serializer = E::serializer();
    let blocks = block_buffer_for(&serializer, buffer, ENTRY_OVERHEAD)?;
    PersistentLinkedList::open(blocks, serializer)
}
