//! Shared commit timer and process-wide buffer registry.
//!
//! One background thread serves every open [`TwoCopyBarrierBuffer`]: it
//! sleeps until the earliest scheduled deadline, then commits buffers
//! whose first uncommitted write has aged past their asynchronous commit
//! delay. Scheduling favors a low, single-threaded background load over
//! timely flushes.
//!
//! The registry tracks writable buffers so [`shutdown_all`] can commit and
//! close every one of them before the process exits.
//!
//! [`TwoCopyBarrierBuffer`]: crate::TwoCopyBarrierBuffer

use crate::BufferShared;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

struct TimerEntry {
    shared: Weak<BufferShared>,
    deadline: Instant,
}

#[derive(Default)]
struct TimerQueue {
    entries: Vec<TimerEntry>,
}

struct CommitTimer {
    queue: Mutex<TimerQueue>,
    wakeup: Condvar,
}

static TIMER: OnceLock<Arc<CommitTimer>> = OnceLock::new();

fn timer() -> &'static Arc<CommitTimer> {
    TIMER.get_or_init(|| {
        let timer = Arc::new(CommitTimer {
            queue: Mutex::new(TimerQueue::default()),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&timer);
        thread::Builder::new()
            .name("perseq-commit-timer".to_owned())
            .spawn(move || run_timer(&worker))
            .expect("failed to spawn commit timer thread");
        timer
    })
}

fn run_timer(timer: &CommitTimer) {
    let mut queue = timer.queue.lock();
    loop {
        let now = Instant::now();
        let mut due = Vec::new();
        queue
            .entries
            .retain(|entry| {
                if entry.deadline <= now {
                    due.push(entry.shared.clone());
                    false
                } else {
                    true
                }
            });
        if !due.is_empty() {
            // Buffer locks are only taken with the queue lock released.
            drop(queue);
            for weak in due {
                if let Some(shared) = weak.upgrade() {
                    crate::handle_timer_fire(&shared);
                }
            }
            queue = timer.queue.lock();
            continue;
        }
        match queue.entries.iter().map(|entry| entry.deadline).min() {
            Some(next) => {
                let _ = timer.wakeup.wait_until(&mut queue, next);
            }
            None => timer.wakeup.wait(&mut queue),
        }
    }
}

/// Schedules a commit check for `shared` at `deadline`.
pub(crate) fn schedule(shared: Weak<BufferShared>, deadline: Instant) {
    let timer = timer();
    let mut queue = timer.queue.lock();
    queue.entries.push(TimerEntry { shared, deadline });
    timer.wakeup.notify_one();
}

static REGISTRY: Mutex<Vec<Weak<BufferShared>>> = Mutex::new(Vec::new());

/// Adds a buffer to the shutdown registry.
pub(crate) fn register(shared: Weak<BufferShared>) {
    let mut registry = REGISTRY.lock();
    registry.retain(|weak| weak.strong_count() > 0);
    registry.push(shared);
}

/// Removes a buffer from the shutdown registry.
pub(crate) fn unregister(shared: &Arc<BufferShared>) {
    REGISTRY
        .lock()
        .retain(|weak| !weak.ptr_eq(&Arc::downgrade(shared)) && weak.strong_count() > 0);
}

/// Commits and closes every registered buffer.
///
/// Call once as part of orderly process shutdown. Closes are spread over a
/// small worker pool; each close still serializes on its buffer's own
/// cache lock. Buffers opened afterwards are unaffected.
pub fn shutdown_all() {
    let buffers: Vec<Arc<BufferShared>> = {
        let mut registry = REGISTRY.lock();
        let snapshot = registry
            .iter()
            .filter_map(std::sync::Weak::upgrade)
            .collect();
        registry.clear();
        snapshot
    };
    if buffers.is_empty() {
        return;
    }
    info!(
        target: "perseq::barrier",
        event = "shutdown_begin",
        buffer_count = buffers.len()
    );
    let workers = buffers.len().min(4).max(1);
    let queue = Mutex::new(buffers);
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let shared = { queue.lock().pop() };
                let Some(shared) = shared else { break };
                let mut state = shared.state.lock();
                if let Err(err) = state.close_for_shutdown() {
                    warn!(
                        target: "perseq::barrier",
                        event = "shutdown_close_failed",
                        error = %err
                    );
                }
            });
        }
    });
    debug!(target: "perseq::barrier", event = "shutdown_complete");
}
