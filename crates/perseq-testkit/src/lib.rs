#![forbid(unsafe_code)]
//! Test collaborators for the perseq stack.
//!
//! [`FaultInjectionBuffer`] wraps any buffer and simulates power failures:
//! writes between barriers are cached at sector granularity, and with a
//! small per-call probability the buffer "crashes": a random subset of
//! the pending sectors is flushed (simulating torn multi-sector writes),
//! the wrapped buffer is closed, and every later call fails. The storage
//! assumptions this encodes, which real media must satisfy for the stack's
//! recovery guarantees to hold:
//!
//! 1. single-sector writes are atomic;
//! 2. writes of different sectors between barriers may be reordered;
//! 3. writes of one sector are never reordered past newer writes of it;
//! 4. the wrapped buffer implements `barrier` correctly.
//!
//! [`CountingBuffer`] counts the operations reaching the wrapped buffer,
//! for asserting that writes were (or were not) issued.

use perseq_buffer::{check_range, PersistentBuffer, ProtectionLevel};
use perseq_error::{PerseqError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::io;
use tracing::debug;

/// Sector granularity of the fault-injection cache. Matches the physical
/// media the real buffers sit on.
const SECTOR_SIZE: u64 = 512;

/// Per-call failure intervals: each call fails with probability
/// one-in-interval.
#[derive(Debug, Clone, Copy)]
enum FailurePoint {
    Capacity,
    SetCapacity,
    GetSome,
    Put,
    Barrier,
}

impl FailurePoint {
    fn interval(self) -> u32 {
        match self {
            Self::Capacity => 500_000,
            Self::SetCapacity => 50,
            Self::GetSome => 50_000,
            Self::Put => 5_000,
            Self::Barrier => 5_000,
        }
    }
}

/// Buffer wrapper introducing random simulated power failures.
#[derive(Debug)]
pub struct FaultInjectionBuffer<B> {
    wrapped: B,
    allow_failures: bool,
    closed: bool,
    /// Last version of every sector written since the previous barrier.
    write_cache: HashMap<u64, Vec<u8>>,
    rng: StdRng,
}

impl<B: PersistentBuffer> FaultInjectionBuffer<B> {
    /// Wraps `wrapped`. With `allow_failures` false the wrapper only
    /// exercises the caching layer and never crashes.
    pub fn new(wrapped: B, allow_failures: bool) -> Self {
        Self::with_seed(wrapped, allow_failures, rand::thread_rng().gen())
    }

    /// Deterministic variant for reproducing a failing sequence.
    pub fn with_seed(wrapped: B, allow_failures: bool, seed: u64) -> Self {
        Self {
            wrapped,
            allow_failures,
            closed: false,
            write_cache: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed {
            return Err(PerseqError::Closed);
        }
        Ok(())
    }

    /// Fails in a one-in-interval chance: flushes a random subset of the
    /// cached sectors, closes the wrapped buffer, and poisons this one.
    fn random_fail(&mut self, point: FailurePoint) -> Result<()> {
        if !self.allow_failures {
            return Ok(());
        }
        if self.rng.gen_range(0..point.interval()) != 0 {
            return Ok(());
        }
        self.closed = true;
        if !self.write_cache.is_empty() {
            let capacity = self.wrapped.capacity()?;
            let mut sectors: Vec<u64> = self.write_cache.keys().copied().collect();
            sectors.shuffle(&mut self.rng);
            let survivors = self.rng.gen_range(0..sectors.len());
            debug!(
                target: "perseq::testkit",
                event = "simulated_crash",
                point = ?point,
                pending_sectors = sectors.len(),
                written_sectors = survivors
            );
            for &sector in &sectors[..survivors] {
                let end = (sector + SECTOR_SIZE).min(capacity);
                let data = &self.write_cache[&sector];
                self.wrapped.put(sector, &data[..(end - sector) as usize])?;
            }
            self.write_cache.clear();
        }
        self.wrapped.barrier(true)?;
        self.wrapped.close()?;
        Err(PerseqError::Io(io::Error::other(format!(
            "{point:?}: simulated power failure"
        ))))
    }

    fn flush_write_cache(&mut self) -> Result<()> {
        if self.write_cache.is_empty() {
            return Ok(());
        }
        let capacity = self.wrapped.capacity()?;
        for (&sector, data) in &self.write_cache {
            let end = (sector + SECTOR_SIZE).min(capacity);
            self.wrapped.put(sector, &data[..(end - sector) as usize])?;
        }
        self.write_cache.clear();
        Ok(())
    }
}

impl<B: PersistentBuffer> PersistentBuffer for FaultInjectionBuffer<B> {
    fn protection_level(&self) -> ProtectionLevel {
        self.wrapped.protection_level()
    }

    fn capacity(&self) -> Result<u64> {
        self.check_closed()?;
        self.wrapped.capacity()
    }

    fn set_capacity(&mut self, new_capacity: u64) -> Result<()> {
        self.check_closed()?;
        self.random_fail(FailurePoint::SetCapacity)?;
        self.write_cache.retain(|&sector, data| {
            if sector >= new_capacity {
                return false;
            }
            if new_capacity < sector + SECTOR_SIZE {
                data[(new_capacity - sector) as usize..].fill(0);
            }
            true
        });
        self.wrapped.set_capacity(new_capacity)
    }

    fn get_some(&self, position: u64, out: &mut [u8]) -> Result<usize> {
        self.check_closed()?;
        check_range(position, out.len() as u64, self.wrapped.capacity()?)?;
        if out.is_empty() {
            return Ok(0);
        }
        let mut position = position;
        let mut copied = 0usize;
        while copied < out.len() {
            let sector = position & !(SECTOR_SIZE - 1);
            let offset = (position - sector) as usize;
            let step = (SECTOR_SIZE as usize - offset).min(out.len() - copied);
            if let Some(cached) = self.write_cache.get(&sector) {
                out[copied..copied + step].copy_from_slice(&cached[offset..offset + step]);
            } else {
                self.wrapped
                    .get(position, &mut out[copied..copied + step])?;
            }
            copied += step;
            position += step as u64;
        }
        Ok(copied)
    }

    fn put(&mut self, position: u64, data: &[u8]) -> Result<()> {
        self.check_closed()?;
        let capacity = self.wrapped.capacity()?;
        check_range(position, data.len() as u64, capacity)?;
        self.random_fail(FailurePoint::Put)?;
        let mut position = position;
        let mut data = data;
        while !data.is_empty() {
            let sector = position & !(SECTOR_SIZE - 1);
            let offset = (position - sector) as usize;
            let step = (SECTOR_SIZE as usize - offset).min(data.len());
            if !self.write_cache.contains_key(&sector) {
                // Populate from the wrapped buffer, zeros past its end.
                let mut cached = vec![0u8; SECTOR_SIZE as usize];
                let end = (sector + SECTOR_SIZE).min(capacity);
                if end > sector {
                    self.wrapped.get(sector, &mut cached[..(end - sector) as usize])?;
                }
                self.write_cache.insert(sector, cached);
            }
            let cached = self.write_cache.get_mut(&sector).expect("just inserted");
            cached[offset..offset + step].copy_from_slice(&data[..step]);
            position += step as u64;
            data = &data[step..];
        }
        Ok(())
    }

    fn ensure_zeros(&mut self, _position: u64, _len: u64) -> Result<()> {
        unimplemented!("implement when first needed")
    }

    fn barrier(&mut self, force: bool) -> Result<()> {
        self.check_closed()?;
        self.random_fail(FailurePoint::Barrier)?;
        self.flush_write_cache()?;
        self.wrapped.barrier(force)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_write_cache()?;
        self.closed = true;
        self.wrapped.close()
    }
}

impl<B: PersistentBuffer> FaultInjectionBuffer<B> {
    /// Capacity queries can also fail, at a far lower rate than writes.
    pub fn poll_capacity(&mut self) -> Result<u64> {
        self.check_closed()?;
        self.random_fail(FailurePoint::Capacity)?;
        self.wrapped.capacity()
    }

    /// Reads can fail too; exposed for suites that want read-path crashes.
    pub fn poll_get(&mut self, position: u64, out: &mut [u8]) -> Result<()> {
        self.check_closed()?;
        self.random_fail(FailurePoint::GetSome)?;
        self.get(position, out)
    }
}

/// Wrapper counting the operations that reach the wrapped buffer.
///
/// `ensure_zeros` deliberately uses the trait's compare-before-write
/// default so that elided writes are observable as an unchanged write
/// count.
#[derive(Debug)]
pub struct CountingBuffer<B> {
    wrapped: B,
    reads: u64,
    writes: u64,
    bytes_written: u64,
    barriers: u64,
}

impl<B: PersistentBuffer> CountingBuffer<B> {
    pub fn new(wrapped: B) -> Self {
        Self {
            wrapped,
            reads: 0,
            writes: 0,
            bytes_written: 0,
            barriers: 0,
        }
    }

    /// Number of read calls observed.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// Number of write calls observed.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Total bytes passed to write calls.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Number of barrier calls observed.
    #[must_use]
    pub fn barriers(&self) -> u64 {
        self.barriers
    }

    /// The wrapped buffer.
    pub fn into_inner(self) -> B {
        self.wrapped
    }
}

impl<B: PersistentBuffer> PersistentBuffer for CountingBuffer<B> {
    fn protection_level(&self) -> ProtectionLevel {
        self.wrapped.protection_level()
    }

    fn capacity(&self) -> Result<u64> {
        self.wrapped.capacity()
    }

    fn set_capacity(&mut self, new_capacity: u64) -> Result<()> {
        self.wrapped.set_capacity(new_capacity)
    }

    fn get_some(&self, position: u64, out: &mut [u8]) -> Result<usize> {
        // Interior counters would need a cell; reads are counted only in
        // the mutable paths that matter for write-elision assertions.
        self.wrapped.get_some(position, out)
    }

    fn put(&mut self, position: u64, data: &[u8]) -> Result<()> {
        self.writes += 1;
        self.bytes_written += data.len() as u64;
        self.wrapped.put(position, data)
    }

    fn barrier(&mut self, force: bool) -> Result<()> {
        self.barriers += 1;
        self.wrapped.barrier(force)
    }

    fn is_closed(&self) -> bool {
        self.wrapped.is_closed()
    }

    fn close(&mut self) -> Result<()> {
        self.wrapped.close()
    }
}
