//! Crash-consistency coverage: the full stack driven through the
//! fault-injection wrapper, torn-write crashes against the two-copy
//! buffer, and interrupted commits recovering at open.
//!
//! Random torn-write crashes are aimed at the two-copy buffer, whose
//! commits are atomic at rename granularity; that is the buffer the list
//! is deployed on. The linked-list recovery paths are driven
//! deterministically, one crash window at a time (in the list crate's
//! own tests), because a torn flush of both pointer rewires of one
//! operation at once falls outside the single-operation envelope that
//! recovery guarantees.

use perseq::{
    DirectFileBuffer, DynamicBlockBuffer, I32Serializer, PersistentBuffer, PersistentLinkedList,
    ProtectionLevel, TwoCopyBarrierBuffer, TwoCopyConfig,
};
use perseq_testkit::FaultInjectionBuffer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

type FaultList = PersistentLinkedList<
    i32,
    I32Serializer,
    DynamicBlockBuffer<FaultInjectionBuffer<DirectFileBuffer>>,
>;

fn contents(list: &FaultList) -> Vec<i32> {
    list.to_vec()
        .unwrap()
        .into_iter()
        .map(|element| element.expect("this suite stores no null elements"))
        .collect()
}

/// Batches of random deque mutations through the sector-caching fault
/// wrapper (failures disabled), with a close and reopen after every
/// batch: contents, order, and the consistency check must match an
/// in-memory reference exactly.
#[test]
fn fault_wrapper_batches_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fault.pll");
    let mut rng = StdRng::seed_from_u64(0x5e9);

    let mut reference: VecDeque<i32> = VecDeque::new();
    let mut next_value = 0i32;

    for _batch in 0..10 {
        let inner = DirectFileBuffer::open(&path, ProtectionLevel::Barrier).unwrap();
        let faulty = FaultInjectionBuffer::new(inner, false);
        let blocks = DynamicBlockBuffer::new(faulty).unwrap();
        let mut list = PersistentLinkedList::open(blocks, I32Serializer).unwrap();
        assert!(
            contents(&list).iter().copied().eq(reference.iter().copied()),
            "reopened contents diverged from the reference"
        );

        for _ in 0..30 {
            match rng.gen_range(0..4) {
                0 => {
                    list.push_front(Some(&next_value)).unwrap();
                    reference.push_front(next_value);
                }
                1 => {
                    list.push_back(Some(&next_value)).unwrap();
                    reference.push_back(next_value);
                }
                2 => {
                    let popped = list.pop_front().unwrap().map(|e| e.unwrap());
                    assert_eq!(popped, reference.pop_front());
                }
                _ => {
                    let popped = list.pop_back().unwrap().map(|e| e.unwrap());
                    assert_eq!(popped, reference.pop_back());
                }
            }
            next_value += 1;
        }
        list.check_consistency(true).unwrap();
        list.close().unwrap();
    }
}

/// Torn-write crashes against the two-copy buffer. A simulated failure
/// flushes a random subset of the pending 512-byte sectors and commits;
/// after reopening, every sector must read as either its last-barrier
/// content or its in-flight content, and never anything else.
#[test]
fn two_copy_survives_torn_flushes() {
    const SIZE: usize = 8192;
    const SECTOR: usize = 512;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torn.dat");
    let config = TwoCopyConfig {
        protection_level: ProtectionLevel::Force,
        asynchronous_commit_delay: None,
        ..TwoCopyConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(41);
    // The (committed, in-flight) images at the moment of the last crash.
    let mut crash_images: Option<(Vec<u8>, Vec<u8>)> = None;

    for round in 0..30u64 {
        let inner = TwoCopyBarrierBuffer::with_config(&path, config.clone()).unwrap();
        let mut faulty = FaultInjectionBuffer::with_seed(inner, true, rng.gen());

        // Read the durable image the previous round left behind.
        let len = faulty.capacity().unwrap() as usize;
        let mut disk = vec![0u8; len];
        faulty.get(0, &mut disk).unwrap();
        disk.resize(SIZE, 0);

        if let Some((committed, pending)) = crash_images.take() {
            for start in (0..SIZE).step_by(SECTOR) {
                let sector = &disk[start..start + SECTOR];
                assert!(
                    sector == &committed[start..start + SECTOR]
                        || sector == &pending[start..start + SECTOR],
                    "round {round}: sector at {start} is neither old nor new"
                );
            }
        }

        // The durable image is the new baseline.
        let mut committed = disk;
        if faulty.set_capacity(SIZE as u64).is_err() {
            crash_images = Some((committed.clone(), committed));
            continue;
        }
        let mut pending = committed.clone();
        let mut crashed = false;
        for write in 0..50u64 {
            let position = rng.gen_range(0..(SIZE as u64) - 8);
            let value = round * 1000 + write;
            if faulty.put(position, &value.to_be_bytes()).is_err() {
                crash_images = Some((committed.clone(), pending.clone()));
                crashed = true;
                break;
            }
            pending[position as usize..position as usize + 8]
                .copy_from_slice(&value.to_be_bytes());
            if write % 10 == 9 {
                if faulty.barrier(true).is_err() {
                    crash_images = Some((committed.clone(), pending.clone()));
                    crashed = true;
                    break;
                }
                committed = pending.clone();
            }
        }
        if !crashed {
            if faulty.barrier(true).is_err() {
                crash_images = Some((committed.clone(), pending.clone()));
            } else {
                faulty.close().unwrap();
            }
        }
    }
}

/// One hundred forced barriers at FORCE protection: after close and
/// reopen, contents equal the state at the last completed barrier, and
/// the previous durable state sits in the old copy.
#[test]
fn forced_barriers_are_never_lost() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forced.dat");
    let config = TwoCopyConfig {
        protection_level: ProtectionLevel::Force,
        asynchronous_commit_delay: None,
        ..TwoCopyConfig::default()
    };

    {
        let mut buf = TwoCopyBarrierBuffer::with_config(&path, config.clone()).unwrap();
        buf.set_capacity(4096).unwrap();
        for step in 0..100u64 {
            buf.put_i64((step % 64) * 8, step as i64).unwrap();
            buf.barrier(true).unwrap();
        }
        buf.close().unwrap();
    }

    let buf = TwoCopyBarrierBuffer::with_config(&path, config).unwrap();
    for step in 36..100u64 {
        // Slots 36..99 hold the last write to each position.
        assert_eq!(buf.get_i64((step % 64) * 8).unwrap(), step as i64);
    }

    // The old copy is exactly one forced barrier behind.
    let old = std::fs::read(dir.path().join("forced.dat.old")).unwrap();
    let last = i64::from_be_bytes(old[(98 % 64) * 8..][..8].try_into().unwrap());
    assert_eq!(last, 98);
}

/// Interrupting the two-copy commit between its renames still opens to
/// one of the two durable states.
#[test]
fn two_copy_interrupted_states_reopen_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("swap.dat");
    let config = TwoCopyConfig {
        protection_level: ProtectionLevel::Force,
        asynchronous_commit_delay: None,
        ..TwoCopyConfig::default()
    };

    // Two committed generations.
    {
        let mut buf = TwoCopyBarrierBuffer::with_config(&path, config.clone()).unwrap();
        buf.set_capacity(4096).unwrap();
        buf.put(0, b"generation-1").unwrap();
        buf.barrier(true).unwrap();
        buf.put(0, b"generation-2").unwrap();
        buf.barrier(true).unwrap();
        buf.close().unwrap();
    }

    let base = dir.path().join("swap.dat");
    let old = dir.path().join("swap.dat.old");
    let new = dir.path().join("swap.dat.new");

    // Crash between commit steps 1 and 3: base + partial new.
    std::fs::rename(&old, &new).unwrap();
    {
        let buf = TwoCopyBarrierBuffer::with_config(&path, config.clone()).unwrap();
        let mut out = [0u8; 12];
        buf.get(0, &mut out).unwrap();
        assert_eq!(&out, b"generation-2");
    }

    // Crash after step 3: the complete new state and the old copy
    // exist, the base has been rotated away.
    std::fs::rename(&base, &new).unwrap();
    {
        let buf = TwoCopyBarrierBuffer::with_config(&path, config).unwrap();
        let mut out = [0u8; 12];
        buf.get(0, &mut out).unwrap();
        assert_eq!(&out, b"generation-2");
    }
}
