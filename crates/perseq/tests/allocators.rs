//! Allocator properties over real buffers: id uniqueness, iteration
//! completeness, and file-size bounds.

use perseq::{
    DirectFileBuffer, DynamicBlockBuffer, FixedBlockBuffer, MemoryBuffer, PersistentBlockBuffer,
    PersistentBuffer, ProtectionLevel,
};
use rand::seq::SliceRandom;
use std::collections::BTreeSet;

fn collect_ids<B: PersistentBlockBuffer>(blocks: &B) -> Vec<u64> {
    let mut cursor = blocks.iterate_block_ids();
    let mut ids = Vec::new();
    while let Some(id) = blocks.next_block_id(&mut cursor).unwrap() {
        ids.push(id);
    }
    ids
}

#[test]
fn fixed_allocator_mass_churn() {
    const TOTAL: u64 = 100_000;
    let mut blocks = FixedBlockBuffer::new(MemoryBuffer::new(), 64);

    let mut live: BTreeSet<u64> = BTreeSet::new();
    for _ in 0..TOTAL {
        let id = blocks.allocate(64).unwrap();
        assert!(live.insert(id), "allocate returned live id {id}");
    }
    assert_eq!(live.len() as u64, TOTAL);
    assert_eq!(collect_ids(&blocks), live.iter().copied().collect::<Vec<_>>());

    // Deallocate a random half.
    let mut rng = rand::thread_rng();
    let mut all: Vec<u64> = live.iter().copied().collect();
    all.shuffle(&mut rng);
    let (dropped, _kept) = all.split_at(all.len() / 2);
    for &id in dropped {
        blocks.deallocate(id).unwrap();
        live.remove(&id);
    }

    // Reallocate the same count; ids must come back unique and live.
    for _ in 0..dropped.len() {
        let id = blocks.allocate(64).unwrap();
        assert!(live.insert(id), "allocate returned live id {id}");
    }
    assert_eq!(live.len() as u64, TOTAL);
    assert_eq!(collect_ids(&blocks), live.iter().copied().collect::<Vec<_>>());
}

#[test]
fn fixed_allocator_persists_across_reopen() {
    let mut blocks = FixedBlockBuffer::new(DirectFileBuffer::temporary().unwrap(), 128);
    let a = blocks.allocate(100).unwrap();
    let b = blocks.allocate(100).unwrap();
    let c = blocks.allocate(100).unwrap();
    blocks.put(b, 0, b"middle").unwrap();
    blocks.deallocate(a).unwrap();
    blocks.barrier(true).unwrap();

    // The free map is implicit in the bitmap: a fresh instance over the
    // same bytes sees the same allocation state.
    let buffer = blocks.into_buffer();
    let mut reopened = FixedBlockBuffer::new(buffer, 128);
    assert_eq!(collect_ids(&reopened), vec![b, c]);
    let mut out = [0u8; 6];
    reopened.get(b, 0, &mut out).unwrap();
    assert_eq!(&out, b"middle");
    // The freed slot is rediscovered by the forward scan.
    assert_eq!(reopened.allocate(1).unwrap(), a);
}

#[test]
fn dynamic_allocator_file_size_bound() {
    let mut blocks = DynamicBlockBuffer::new(DirectFileBuffer::temporary().unwrap()).unwrap();
    let sizes = [7u64, 17, 260, 1025];
    let mut ids = Vec::new();
    for size in sizes {
        ids.push(blocks.allocate(size).unwrap());
    }
    let bound: u64 = sizes
        .iter()
        .map(|s| (s + 1).next_power_of_two())
        .sum::<u64>()
        .next_multiple_of(4096);
    let capacity = blocks.buffer().capacity().unwrap();
    assert!(capacity <= bound, "file grew to {capacity}, bound {bound}");
    assert_eq!(capacity % 4096, 0);

    for id in ids {
        blocks.deallocate(id).unwrap();
    }
    assert!(collect_ids(&blocks).is_empty());
}

#[test]
fn dynamic_allocator_block_ids_are_offsets() {
    let mut blocks = DynamicBlockBuffer::new(MemoryBuffer::new()).unwrap();
    let first = blocks.allocate(24).unwrap();
    assert_eq!(first, 0);
    // The payload begins one header byte past the block start.
    assert_eq!(blocks.block_address(first).unwrap(), 1);
    let second = blocks.allocate(24).unwrap();
    assert_eq!(second % 32, 0, "2^5 block must be 32-byte aligned");
}

#[test]
fn first_allocated_block_iterates_first_after_churn() {
    let mut blocks = DynamicBlockBuffer::new(MemoryBuffer::new()).unwrap();
    let anchor = blocks.allocate(24).unwrap();
    let extra: Vec<u64> = (0..20).map(|_| blocks.allocate(50).unwrap()).collect();
    for id in extra.iter().copied().step_by(2) {
        blocks.deallocate(id).unwrap();
    }
    for _ in 0..5 {
        blocks.allocate(200).unwrap();
    }
    let ids = collect_ids(&blocks);
    assert_eq!(ids[0], anchor);
}

#[test]
fn mixed_buffer_variants_share_format() {
    // Allocation state written through one buffer variant reads back
    // identically through another.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.dat");
    let (b, payload) = {
        let buffer = DirectFileBuffer::open(&path, ProtectionLevel::Force).unwrap();
        let mut blocks = DynamicBlockBuffer::new(buffer).unwrap();
        let a = blocks.allocate(40).unwrap();
        let b = blocks.allocate(500).unwrap();
        blocks.put(b, 0, b"cross-variant").unwrap();
        blocks.deallocate(a).unwrap();
        blocks.barrier(true).unwrap();
        blocks.close().unwrap();
        (b, b"cross-variant".to_vec())
    };

    let buffer = perseq::MappedBuffer::open(&path, ProtectionLevel::ReadOnly).unwrap();
    let blocks = DynamicBlockBuffer::new(buffer).unwrap();
    assert_eq!(collect_ids(&blocks), vec![b]);
    let mut out = vec![0u8; payload.len()];
    blocks.get(b, 0, &mut out).unwrap();
    assert_eq!(out, payload);
}
