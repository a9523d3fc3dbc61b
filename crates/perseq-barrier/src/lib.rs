#![forbid(unsafe_code)]
//! Crash-safe barrier buffer built on two file copies and atomic rename.
//!
//! [`TwoCopyBarrierBuffer`] provides efficient barrier semantics without an
//! fsync per barrier: writes are cached in memory at sector granularity and
//! committed by rewriting the older of two file copies and rotating it into
//! place with atomic renames. After any crash the file set is in one of a
//! small number of states, each of which recovers to either the last
//! committed contents or the contents one commit older, never a mixture.
//!
//! For a logical path `P` the on-disk set is `P`, `P.new`, and `P.old`. At
//! rest only `P` (latest durable state) and `P.old` (previous durable
//! state) exist. A commit performs:
//!
//! 1. rename `P.old` → `P.new`
//! 2. write every sector that differs into `P.new`, fsync
//! 3. rename `P` → `P.old`
//! 4. rename `P.new` → `P`
//!
//! The cache never rewrites a sector whose bytes are unchanged, trading
//! reads for writes to limit flash wear. Commits are triggered by forced
//! barriers at [`ProtectionLevel::Force`], by unforced barriers once the
//! synchronous commit delay has elapsed, by the shared background timer
//! (see [`timer`]), and by close.

mod timer;

pub use timer::shutdown_all;

use fs2::FileExt as _;
use parking_lot::Mutex;
use perseq_buffer::{check_range, PersistentBuffer, ProtectionLevel};
use perseq_error::{PerseqError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// Default bytes per cached sector. Best results come from matching the
/// filesystem block size.
pub const DEFAULT_SECTOR_SIZE: u64 = 4096;

/// Default delay before the background timer commits cached writes.
pub const DEFAULT_ASYNCHRONOUS_COMMIT_DELAY: Duration = Duration::from_secs(5);

/// Default age a cached write must reach before an unforced barrier
/// commits from the calling thread.
pub const DEFAULT_SYNCHRONOUS_COMMIT_DELAY: Duration = Duration::from_secs(60);

/// Tuning knobs for [`TwoCopyBarrierBuffer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoCopyConfig {
    /// Durability policy; see [`ProtectionLevel`].
    pub protection_level: ProtectionLevel,
    /// Sector granularity of the write cache. Must be a power of two.
    pub sector_size: u64,
    /// Age at which the shared timer commits in the background. `None`
    /// disables the timer entirely.
    pub asynchronous_commit_delay: Option<Duration>,
    /// Age at which an unforced barrier commits from the calling thread.
    pub synchronous_commit_delay: Duration,
}

impl Default for TwoCopyConfig {
    fn default() -> Self {
        Self {
            protection_level: ProtectionLevel::Barrier,
            sector_size: DEFAULT_SECTOR_SIZE,
            asynchronous_commit_delay: Some(DEFAULT_ASYNCHRONOUS_COMMIT_DELAY),
            synchronous_commit_delay: DEFAULT_SYNCHRONOUS_COMMIT_DELAY,
        }
    }
}

impl TwoCopyConfig {
    fn validate(&self) -> Result<()> {
        if self.sector_size == 0 || !self.sector_size.is_power_of_two() {
            return Err(PerseqError::Format(format!(
                "sector size must be a power of two, got {}",
                self.sector_size
            )));
        }
        Ok(())
    }
}

/// One cached sector. `dirty` marks sectors modified since the last commit
/// to the base copy; every entry differs from the old copy.
#[derive(Debug)]
struct SectorEntry {
    data: Vec<u8>,
    dirty: bool,
}

#[derive(Debug)]
pub(crate) struct BufferShared {
    pub(crate) state: Mutex<TwoCopyState>,
}

#[derive(Debug)]
pub(crate) struct TwoCopyState {
    base_path: PathBuf,
    new_path: PathBuf,
    old_path: PathBuf,
    protection_level: ProtectionLevel,
    sector_size: u64,
    async_delay: Option<Duration>,
    sync_delay: Duration,
    /// Sectors that differ from the old copy, keyed by aligned position.
    sectors: BTreeMap<u64, SectorEntry>,
    /// Logical capacity. The backing files are not resized until commit.
    capacity: u64,
    /// Holds the advisory lock on the current base inode.
    _lock_file: File,
    /// Read-only handle serving cache misses. `None` once closing.
    base_read: Option<File>,
    base_len: u64,
    closed: bool,
    first_write: Option<Instant>,
    timer_scheduled: bool,
    registered: bool,
    weak_self: Weak<BufferShared>,
    _temp: Option<tempfile::TempDir>,
}

impl TwoCopyState {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(PerseqError::Closed);
        }
        Ok(())
    }

    fn mark_first_write(&mut self) {
        if self.first_write.is_none() {
            self.first_write = Some(Instant::now());
        }
        if let Some(delay) = self.async_delay {
            if !self.timer_scheduled {
                self.timer_scheduled = true;
                let deadline = self.first_write.expect("just set") + delay;
                timer::schedule(self.weak_self.clone(), deadline);
            }
        }
    }

    fn clear_first_write(&mut self) {
        self.first_write = None;
    }

    fn read_base_sector(&self, sector: u64, out: &mut [u8]) -> Result<()> {
        out.fill(0);
        if sector < self.base_len {
            let available = (self.base_len - sector).min(out.len() as u64) as usize;
            let base = self
                .base_read
                .as_ref()
                .expect("base read handle open while buffer is open");
            base.read_exact_at(&mut out[..available], sector)?;
        }
        Ok(())
    }

    fn get_some(&self, position: u64, out: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        check_range(position, out.len() as u64, self.capacity)?;
        let sector_mask = self.sector_size - 1;
        let mut position = position;
        let mut copied = 0usize;
        while copied < out.len() {
            let sector = position & !sector_mask;
            let offset = (position - sector) as usize;
            let step = ((self.sector_size as usize) - offset).min(out.len() - copied);
            let target = &mut out[copied..copied + step];
            if let Some(entry) = self.sectors.get(&sector) {
                target.copy_from_slice(&entry.data[offset..offset + step]);
            } else if position < self.base_len {
                let available = ((self.base_len - position) as usize).min(step);
                let base = self
                    .base_read
                    .as_ref()
                    .expect("base read handle open while buffer is open");
                base.read_exact_at(&mut target[..available], position)?;
                target[available..].fill(0);
            } else {
                // Extended past the committed file; zeros until commit.
                target.fill(0);
            }
            copied += step;
            position += step as u64;
        }
        Ok(copied)
    }

    fn put(&mut self, position: u64, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if !self.protection_level.is_writable() {
            return Err(PerseqError::ReadOnly);
        }
        check_range(position, data.len() as u64, self.capacity)?;
        let sector_mask = self.sector_size - 1;
        let mut position = position;
        let mut data = data;
        while !data.is_empty() {
            let sector = position & !sector_mask;
            let offset = (position - sector) as usize;
            let step = ((self.sector_size as usize) - offset).min(data.len());
            let chunk = &data[..step];
            let mut became_dirty = false;
            if let Some(entry) = self.sectors.get_mut(&sector) {
                if entry.dirty {
                    // Already scheduled for commit; no comparison needed.
                    entry.data[offset..offset + step].copy_from_slice(chunk);
                } else if entry.data[offset..offset + step] != *chunk {
                    entry.data[offset..offset + step].copy_from_slice(chunk);
                    entry.dirty = true;
                    became_dirty = true;
                }
            } else {
                let mut sector_data = vec![0u8; self.sector_size as usize];
                self.read_base_sector(sector, &mut sector_data)?;
                // Only cache when the bytes actually change (flash wear).
                if sector_data[offset..offset + step] != *chunk {
                    sector_data[offset..offset + step].copy_from_slice(chunk);
                    self.sectors.insert(
                        sector,
                        SectorEntry {
                            data: sector_data,
                            dirty: true,
                        },
                    );
                    became_dirty = true;
                }
            }
            if became_dirty {
                self.mark_first_write();
            }
            position += step as u64;
            data = &data[step..];
        }
        Ok(())
    }

    fn set_capacity(&mut self, new_capacity: u64) -> Result<()> {
        self.check_open()?;
        if !self.protection_level.is_writable() {
            return Err(PerseqError::ReadOnly);
        }
        if new_capacity == self.capacity {
            return Ok(());
        }
        // Drop cached sectors entirely beyond the new end and zero the
        // tail of a sector the new end lands inside.
        let _ = self.sectors.split_off(&new_capacity);
        let sector_mask = self.sector_size - 1;
        if new_capacity & sector_mask != 0 {
            let sector = new_capacity & !sector_mask;
            if let Some(entry) = self.sectors.get_mut(&sector) {
                entry.data[(new_capacity - sector) as usize..].fill(0);
            }
        }
        self.capacity = new_capacity;
        self.mark_first_write();
        Ok(())
    }

    fn barrier(&mut self, force: bool) -> Result<()> {
        self.check_open()?;
        if force && self.protection_level >= ProtectionLevel::Force {
            self.commit(false)
        } else {
            // Downgraded: commit from the caller only once cached writes
            // have aged past the synchronous commit delay.
            match self.first_write {
                Some(first) if first.elapsed() >= self.sync_delay => self.commit(false),
                _ => Ok(()),
            }
        }
    }

    /// Writes modified sectors to the older copy and rotates it into place.
    fn commit(&mut self, is_closing: bool) -> Result<()> {
        if !self.sectors.values().any(|entry| entry.dirty) {
            if is_closing {
                self.base_read = None;
            }
            return Ok(());
        }
        if self.protection_level == ProtectionLevel::ReadOnly {
            return Err(PerseqError::ReadOnly);
        }
        debug!(
            target: "perseq::barrier",
            event = "commit_begin",
            cached_sectors = self.sectors.len(),
            capacity = self.capacity
        );
        fs::rename(&self.old_path, &self.new_path)?;
        let new_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.new_path)?;
        let old_len = new_file.metadata()?.len();
        if self.capacity != old_len {
            new_file.set_len(self.capacity)?;
            if self.capacity > old_len {
                ensure_zeros_file(&new_file, old_len, self.capacity - old_len)?;
            }
        }
        // Every cached sector differs from this copy; write them all.
        for (&sector, entry) in &self.sectors {
            debug_assert!(sector < self.capacity);
            debug_assert_eq!(sector & (self.sector_size - 1), 0);
            let end = (sector + self.sector_size).min(self.capacity);
            new_file.write_all_at(&entry.data[..(end - sector) as usize], sector)?;
        }
        if self.protection_level >= ProtectionLevel::Barrier {
            new_file.sync_data()?;
        }
        // Take the lock on the inode that is about to become the base copy
        // before the current base lock is released.
        new_file.lock_exclusive()?;
        self.base_read = None;
        fs::rename(&self.base_path, &self.old_path)?;
        // The former current-cache is exactly the diff against the file
        // that just became the old copy.
        self.sectors.retain(|_, entry| entry.dirty);
        for entry in self.sectors.values_mut() {
            entry.dirty = false;
        }
        fs::rename(&self.new_path, &self.base_path)?;
        self._lock_file = new_file;
        self.base_len = self.capacity;
        if !is_closing {
            self.base_read = Some(OpenOptions::new().read(true).open(&self.base_path)?);
        }
        self.clear_first_write();
        debug!(
            target: "perseq::barrier",
            event = "commit_complete",
            retained_sectors = self.sectors.len()
        );
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.commit(true)?;
        self.closed = true;
        Ok(())
    }

    pub(crate) fn close_for_shutdown(&mut self) -> Result<()> {
        self.close()
    }
}

pub(crate) fn handle_timer_fire(shared: &Arc<BufferShared>) {
    let mut state = shared.state.lock();
    state.timer_scheduled = false;
    if state.closed {
        return;
    }
    let Some(delay) = state.async_delay else {
        return;
    };
    let Some(first) = state.first_write else {
        return;
    };
    if first.elapsed() >= delay {
        trace!(target: "perseq::barrier", event = "timer_commit");
        if let Err(err) = state.commit(false) {
            error!(
                target: "perseq::barrier",
                event = "timer_commit_failed",
                error = %err
            );
        }
    } else {
        state.timer_scheduled = true;
        timer::schedule(state.weak_self.clone(), first + delay);
    }
}

/// Persistent buffer maintaining two copies of its file, committed by
/// atomic rename. See the crate docs for the on-disk protocol.
#[derive(Debug)]
pub struct TwoCopyBarrierBuffer {
    shared: Arc<BufferShared>,
}

impl TwoCopyBarrierBuffer {
    /// Opens the file set for logical path `path` with defaults
    /// (`Barrier` protection, 4 KiB sectors, 5 s / 60 s commit delays).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(path, TwoCopyConfig::default())
    }

    /// Opens the file set for logical path `path` at a chosen protection
    /// level, other settings default.
    pub fn with_protection_level(
        path: impl AsRef<Path>,
        protection_level: ProtectionLevel,
    ) -> Result<Self> {
        Self::with_config(
            path,
            TwoCopyConfig {
                protection_level,
                ..TwoCopyConfig::default()
            },
        )
    }

    /// Opens the file set for logical path `path`, recovering from any
    /// interrupted commit, then seeds the write cache by comparing the two
    /// copies sector by sector so later commits only write sectors that
    /// actually differ.
    pub fn with_config(path: impl AsRef<Path>, config: TwoCopyConfig) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        Self::build(base_path, config, None, true)
    }

    /// A scratch buffer in a fresh temporary directory, deleted when the
    /// buffer is dropped. Protection level is `None` and the buffer is not
    /// registered for shutdown.
    pub fn temporary() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let base_path = dir.path().join("twocopy");
        let config = TwoCopyConfig {
            protection_level: ProtectionLevel::None,
            ..TwoCopyConfig::default()
        };
        Self::build(base_path, config, Some(dir), false)
    }

    fn build(
        base_path: PathBuf,
        config: TwoCopyConfig,
        temp: Option<tempfile::TempDir>,
        register: bool,
    ) -> Result<Self> {
        config.validate()?;
        let new_path = path_with_suffix(&base_path, ".new");
        let old_path = path_with_suffix(&base_path, ".old");
        recover_file_set(&base_path, &new_path, &old_path)?;

        let read_only = config.protection_level == ProtectionLevel::ReadOnly;
        let lock_file = if read_only {
            let file = OpenOptions::new().read(true).open(&base_path)?;
            file.lock_shared()?;
            file
        } else {
            let file = OpenOptions::new().read(true).write(true).open(&base_path)?;
            file.lock_exclusive()?;
            file
        };
        let base_read = OpenOptions::new().read(true).open(&base_path)?;
        let base_len = base_read.metadata()?.len();

        let sectors = diff_copies(&base_read, &old_path, base_len, config.sector_size)?;
        if !sectors.is_empty() {
            debug!(
                target: "perseq::barrier",
                event = "open_diff_seeded",
                differing_sectors = sectors.len()
            );
        }

        let registered = register && !read_only;
        let shared = Arc::new_cyclic(|weak| BufferShared {
            state: Mutex::new(TwoCopyState {
                base_path,
                new_path,
                old_path,
                protection_level: config.protection_level,
                sector_size: config.sector_size,
                async_delay: config.asynchronous_commit_delay,
                sync_delay: config.synchronous_commit_delay,
                sectors,
                capacity: base_len,
                _lock_file: lock_file,
                base_read: Some(base_read),
                base_len,
                closed: false,
                first_write: None,
                timer_scheduled: false,
                registered,
                weak_self: weak.clone(),
                _temp: temp,
            }),
        });
        if registered {
            timer::register(Arc::downgrade(&shared));
        }
        Ok(Self { shared })
    }
}

impl PersistentBuffer for TwoCopyBarrierBuffer {
    fn protection_level(&self) -> ProtectionLevel {
        self.shared.state.lock().protection_level
    }

    fn capacity(&self) -> Result<u64> {
        let state = self.shared.state.lock();
        state.check_open()?;
        Ok(state.capacity)
    }

    fn set_capacity(&mut self, new_capacity: u64) -> Result<()> {
        self.shared.state.lock().set_capacity(new_capacity)
    }

    fn get_some(&self, position: u64, out: &mut [u8]) -> Result<usize> {
        self.shared.state.lock().get_some(position, out)
    }

    fn put(&mut self, position: u64, data: &[u8]) -> Result<()> {
        self.shared.state.lock().put(position, data)
    }

    fn barrier(&mut self, force: bool) -> Result<()> {
        self.shared.state.lock().barrier(force)
    }

    fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    fn close(&mut self) -> Result<()> {
        let registered = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Ok(());
            }
            state.close()?;
            let registered = state.registered;
            state.registered = false;
            registered
        };
        if registered {
            timer::unregister(&self.shared);
        }
        Ok(())
    }
}

impl Drop for TwoCopyBarrierBuffer {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(err) = self.close() {
                error!(
                    target: "perseq::barrier",
                    event = "drop_close_failed",
                    error = %err
                );
            }
        }
    }
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Restores the file set to the at-rest state (`base` + `base.old`) after
/// any crash, per the commit protocol's reachable states.
fn recover_file_set(base: &Path, new: &Path, old: &Path) -> Result<()> {
    let base_exists = base.exists();
    let new_exists = new.exists();
    let old_exists = old.exists();
    match (base_exists, new_exists, old_exists) {
        // At rest.
        (true, false, true) => Ok(()),
        // Crash between the first and third rename; the partial new state
        // goes back to being the old copy and is reconciled by the diff.
        (true, true, false) => {
            info!(
                target: "perseq::barrier",
                event = "recover_partial_commit",
                path = %base.display()
            );
            fs::rename(new, old)?;
            Ok(())
        }
        // Crash after the base copy was rotated out; the new copy is
        // complete, so finish the final rename.
        (false, true, true) => {
            info!(
                target: "perseq::barrier",
                event = "recover_finish_commit",
                path = %base.display()
            );
            fs::rename(new, base)?;
            Ok(())
        }
        // First open of an existing single file.
        (true, false, false) => {
            File::create(old)?;
            Ok(())
        }
        // Fresh file set.
        (false, false, false) => {
            File::create(base)?;
            File::create(old)?;
            Ok(())
        }
        (true, true, true) => Err(PerseqError::Corruption(format!(
            "{}, {}.new and {}.old all exist",
            base.display(),
            base.display(),
            base.display()
        ))),
        (false, false, true) | (false, true, false) => Err(PerseqError::Corruption(format!(
            "orphaned copy without {}",
            base.display()
        ))),
    }
}

/// Seeds the old-copy cache: every sector of `base` that differs from the
/// old copy, so the first commit writes only real differences.
fn diff_copies(
    base: &File,
    old_path: &Path,
    capacity: u64,
    sector_size: u64,
) -> Result<BTreeMap<u64, SectorEntry>> {
    let old = OpenOptions::new().read(true).open(old_path)?;
    let old_len = old.metadata()?.len();
    let mut sectors = BTreeMap::new();
    let mut base_buf = vec![0u8; sector_size as usize];
    let mut old_buf = vec![0u8; sector_size as usize];
    let mut sector = 0u64;
    while sector < capacity {
        let len = sector_size.min(capacity - sector) as usize;
        base.read_exact_at(&mut base_buf[..len], sector)?;
        let differs = if sector + len as u64 > old_len {
            // Old copy is shorter; only an all-zero tail can be assumed.
            sector < old_len || base_buf[..len].iter().any(|byte| *byte != 0)
        } else {
            old.read_exact_at(&mut old_buf[..len], sector)?;
            base_buf[..len] != old_buf[..len]
        };
        if differs {
            let mut data = vec![0u8; sector_size as usize];
            data[..len].copy_from_slice(&base_buf[..len]);
            sectors.insert(
                sector,
                SectorEntry {
                    data,
                    dirty: false,
                },
            );
        }
        sector += sector_size;
    }
    Ok(sectors)
}

/// Zero-fills `[position, position + len)` of `file`, skipping chunks that
/// already read as zeros.
fn ensure_zeros_file(file: &File, position: u64, len: u64) -> Result<()> {
    const CHUNK: usize = 4096;
    const ZEROS: [u8; CHUNK] = [0u8; CHUNK];
    let mut scratch = [0u8; CHUNK];
    let mut position = position;
    let mut remaining = len;
    while remaining > 0 {
        let step = CHUNK.min(usize::try_from(remaining).unwrap_or(CHUNK));
        file.read_exact_at(&mut scratch[..step], position)?;
        if scratch[..step].iter().any(|byte| *byte != 0) {
            file.write_all_at(&ZEROS[..step], position)?;
        }
        position += step as u64;
        remaining -= step as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn force_config() -> TwoCopyConfig {
        TwoCopyConfig {
            protection_level: ProtectionLevel::Force,
            asynchronous_commit_delay: None,
            ..TwoCopyConfig::default()
        }
    }

    #[test]
    fn fresh_open_creates_file_set() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("data");
        let buf = TwoCopyBarrierBuffer::with_config(&base, force_config()).unwrap();
        assert_eq!(buf.capacity().unwrap(), 0);
        assert!(base.exists());
        assert!(dir.path().join("data.old").exists());
        assert!(!dir.path().join("data.new").exists());
    }

    #[test]
    fn forced_barrier_commits_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("data");
        {
            let mut buf = TwoCopyBarrierBuffer::with_config(&base, force_config()).unwrap();
            buf.set_capacity(8192).unwrap();
            buf.put(0, b"alpha").unwrap();
            buf.put_i64(4096, -42).unwrap();
            buf.barrier(true).unwrap();
            buf.close().unwrap();
        }
        let buf = TwoCopyBarrierBuffer::with_config(&base, force_config()).unwrap();
        assert_eq!(buf.capacity().unwrap(), 8192);
        let mut out = [0u8; 5];
        buf.get(0, &mut out).unwrap();
        assert_eq!(&out, b"alpha");
        assert_eq!(buf.get_i64(4096).unwrap(), -42);
    }

    #[test]
    fn unforced_writes_stay_cached_until_commit() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("data");
        let mut buf = TwoCopyBarrierBuffer::with_config(&base, force_config()).unwrap();
        buf.set_capacity(4096).unwrap();
        buf.put(10, b"cached").unwrap();
        buf.barrier(false).unwrap();
        // Nothing reached disk: the sync delay has not elapsed.
        assert_eq!(fs::metadata(&base).unwrap().len(), 0);
        // Reads still come from the cache.
        let mut out = [0u8; 6];
        buf.get(10, &mut out).unwrap();
        assert_eq!(&out, b"cached");

        buf.barrier(true).unwrap();
        assert_eq!(fs::metadata(&base).unwrap().len(), 4096);
    }

    #[test]
    fn old_copy_holds_previous_durable_state() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("data");
        let mut buf = TwoCopyBarrierBuffer::with_config(&base, force_config()).unwrap();
        buf.set_capacity(4096).unwrap();
        buf.put(0, b"one").unwrap();
        buf.barrier(true).unwrap();
        buf.put(0, b"two").unwrap();
        buf.barrier(true).unwrap();

        let base_bytes = fs::read(&base).unwrap();
        assert_eq!(&base_bytes[..3], b"two");
        let old_bytes = fs::read(dir.path().join("data.old")).unwrap();
        assert_eq!(&old_bytes[..3], b"one");
    }

    #[test]
    fn unchanged_put_is_not_cached() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("data");
        let mut buf = TwoCopyBarrierBuffer::with_config(&base, force_config()).unwrap();
        buf.set_capacity(4096).unwrap();
        buf.put(100, b"same").unwrap();
        buf.barrier(true).unwrap();

        // Rewriting identical bytes must not dirty the cache.
        buf.put(100, b"same").unwrap();
        let state = buf.shared.state.lock();
        assert!(state.first_write.is_none());
        assert!(!state.sectors.values().any(|entry| entry.dirty));
    }

    #[test]
    fn recovery_mid_commit_discards_partial_new() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("data");
        fs::write(&base, b"durable-state").unwrap();
        // Crash between commit steps 1 and 3: base + partial .new remain.
        fs::write(dir.path().join("data.new"), b"partial").unwrap();

        let buf = TwoCopyBarrierBuffer::with_config(&base, force_config()).unwrap();
        assert_eq!(buf.capacity().unwrap(), 13);
        let mut out = [0u8; 13];
        buf.get(0, &mut out).unwrap();
        assert_eq!(&out, b"durable-state");
        assert!(!dir.path().join("data.new").exists());
        assert!(dir.path().join("data.old").exists());
    }

    #[test]
    fn recovery_after_base_rotation_finishes_commit() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("data");
        // Crash after step 3: the complete new state plus the old copy.
        fs::write(dir.path().join("data.new"), b"committed").unwrap();
        fs::write(dir.path().join("data.old"), b"stale....").unwrap();

        let buf = TwoCopyBarrierBuffer::with_config(&base, force_config()).unwrap();
        let mut out = [0u8; 9];
        buf.get(0, &mut out).unwrap();
        assert_eq!(&out, b"committed");
    }

    #[test]
    fn recovery_rejects_impossible_states() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("data");
        fs::write(dir.path().join("data.old"), b"x").unwrap();
        let err = TwoCopyBarrierBuffer::with_config(&base, force_config()).unwrap_err();
        assert!(matches!(err, PerseqError::Corruption(_)));
    }

    #[test]
    fn open_diff_only_tracks_changed_sectors() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("data");
        {
            let mut buf = TwoCopyBarrierBuffer::with_config(&base, force_config()).unwrap();
            buf.set_capacity(3 * 4096).unwrap();
            buf.put(0, &[1u8; 4096]).unwrap();
            buf.barrier(true).unwrap();
            // Second commit: only sector 1 changes between the copies.
            buf.put(4096, &[2u8; 4096]).unwrap();
            buf.barrier(true).unwrap();
            buf.close().unwrap();
        }
        let buf = TwoCopyBarrierBuffer::with_config(&base, force_config()).unwrap();
        let state = buf.shared.state.lock();
        assert_eq!(
            state.sectors.keys().copied().collect::<Vec<_>>(),
            vec![4096]
        );
        assert!(state.sectors.values().all(|entry| !entry.dirty));
    }

    #[test]
    fn shrink_discards_cache_beyond_new_capacity() {
        let mut buf = TwoCopyBarrierBuffer::temporary().unwrap();
        buf.set_capacity(3 * 4096).unwrap();
        buf.put(2 * 4096, &[9u8; 100]).unwrap();
        buf.put(100, &[7u8; 8]).unwrap();
        buf.set_capacity(4096).unwrap();
        let state = buf.shared.state.lock();
        assert!(state.sectors.keys().all(|sector| *sector < 4096));
    }

    #[test]
    fn closed_buffer_rejects_operations() {
        let mut buf = TwoCopyBarrierBuffer::temporary().unwrap();
        buf.set_capacity(16).unwrap();
        buf.close().unwrap();
        assert!(buf.is_closed());
        assert!(matches!(buf.capacity(), Err(PerseqError::Closed)));
        assert!(matches!(buf.put(0, &[1]), Err(PerseqError::Closed)));
        // Double close is fine.
        buf.close().unwrap();
    }

    #[test]
    fn capacity_growth_reads_as_zeros_before_and_after_commit() {
        let mut buf = TwoCopyBarrierBuffer::temporary().unwrap();
        buf.set_capacity(4096).unwrap();
        buf.put(0, &[3u8; 16]).unwrap();
        buf.set_capacity(16384).unwrap();
        let mut out = [0xAAu8; 64];
        buf.get(8192, &mut out).unwrap();
        assert!(out.iter().all(|byte| *byte == 0));

        let mut state = buf.shared.state.lock();
        state.commit(false).unwrap();
        drop(state);
        let mut out = [0xAAu8; 64];
        buf.get(8192, &mut out).unwrap();
        assert!(out.iter().all(|byte| *byte == 0));
    }
}
