//! Flat hashed timer wheel driving receive timeouts and sleeps.
//!
//! The wheel has a power-of-two number of buckets, each a queue of entries
//! in insertion order. Insertion and cancellation are O(1): an entry lands
//! in `(current_slot + ceil(timeout / tick)) % wheel_size`, and cancellation
//! just flips an atomic flag that is honored lazily the next time the bucket
//! is visited. `tick` advances by the elapsed tick count (capped at one full
//! rotation, so a tick after a long stall still reports every due entry),
//! fires everything whose deadline has passed, and re-slots entries the
//! rotation has overtaken.
//!
//! Deadline arithmetic saturates: `now + timeout` clamps at `u64::MAX`
//! instead of wrapping.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::Pid;

/// Default bucket count. Must be a power of two.
pub const DEFAULT_WHEEL_SIZE: usize = 256;

/// Default tick granularity in milliseconds.
pub const DEFAULT_TICK_MS: u64 = 10;

/// Callback invoked when an entry fires. Runs at most once.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// TimerEntry
// ---------------------------------------------------------------------------

/// Handle to a scheduled deadline.
pub struct TimerEntry {
    /// Block this deadline belongs to.
    pub pid: Pid,
    /// Absolute deadline on the scheduler clock, saturating.
    pub deadline_ms: u64,
    cancelled: AtomicBool,
    callback: Mutex<Option<TimerCallback>>,
}

impl TimerEntry {
    /// Mark the entry cancelled. Lock-free; double-cancel is a no-op.
    /// The wheel reclaims the entry lazily on its next visit.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Invoke the callback. Called by the wheel's driver for fired entries;
    /// a cancelled or already-fired entry does nothing.
    pub fn fire(&self) {
        if self.is_cancelled() {
            return;
        }
        let cb = self.callback.lock().take();
        if let Some(cb) = cb {
            cb();
        }
    }
}

impl std::fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEntry")
            .field("pid", &self.pid)
            .field("deadline_ms", &self.deadline_ms)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TimerWheel
// ---------------------------------------------------------------------------

struct WheelInner {
    buckets: Vec<VecDeque<Arc<TimerEntry>>>,
    current_slot: usize,
    /// Wheel-clock position in ms, advanced in whole ticks.
    clock_ms: u64,
    live: usize,
}

/// The hashed timer wheel.
pub struct TimerWheel {
    inner: Mutex<WheelInner>,
    tick_ms: u64,
    size: usize,
}

impl TimerWheel {
    /// Create a wheel with `size` buckets (power of two) and the given tick.
    pub fn new(size: usize, tick_ms: u64) -> Self {
        assert!(size.is_power_of_two(), "wheel size must be a power of two");
        assert!(tick_ms > 0, "tick must be non-zero");
        TimerWheel {
            inner: Mutex::new(WheelInner {
                buckets: (0..size).map(|_| VecDeque::new()).collect(),
                current_slot: 0,
                clock_ms: 0,
                live: 0,
            }),
            tick_ms,
            size,
        }
    }

    /// Schedule a callback `timeout_ms` from `now_ms`. O(1).
    pub fn add(
        &self,
        pid: Pid,
        now_ms: u64,
        timeout_ms: u64,
        callback: TimerCallback,
    ) -> Arc<TimerEntry> {
        let entry = Arc::new(TimerEntry {
            pid,
            deadline_ms: now_ms.saturating_add(timeout_ms),
            cancelled: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        });

        let mut inner = self.inner.lock();
        let slot = self.slot_for(&inner, entry.deadline_ms);
        inner.buckets[slot].push_back(Arc::clone(&entry));
        inner.live += 1;
        entry
    }

    /// Bucket for a deadline relative to the wheel's current position.
    fn slot_for(&self, inner: &WheelInner, deadline_ms: u64) -> usize {
        let remaining = deadline_ms.saturating_sub(inner.clock_ms);
        // Round up: a deadline inside the current tick fires on the next one.
        let ticks = remaining.div_ceil(self.tick_ms).max(1) as usize;
        (inner.current_slot + ticks) & (self.size - 1)
    }

    /// Advance the wheel to `now_ms` and return every entry that fired.
    ///
    /// Fired entries are detached; within a bucket they come back in
    /// insertion order (ordering across buckets is not guaranteed).
    /// Entries the rotation overtook are re-slotted; cancelled entries are
    /// dropped. The caller invokes [`TimerEntry::fire`] on the result.
    pub fn tick(&self, now_ms: u64) -> Vec<Arc<TimerEntry>> {
        let mut fired = Vec::new();
        let mut inner = self.inner.lock();

        if now_ms < inner.clock_ms.saturating_add(self.tick_ms) {
            return fired;
        }
        let elapsed_ticks = ((now_ms - inner.clock_ms) / self.tick_ms) as usize;
        // One full rotation visits every bucket; further laps are redundant.
        let steps = elapsed_ticks.min(self.size);

        for _ in 0..steps {
            inner.current_slot = (inner.current_slot + 1) & (self.size - 1);
            let slot = inner.current_slot;
            let mut bucket = std::mem::take(&mut inner.buckets[slot]);
            while let Some(entry) = bucket.pop_front() {
                inner.live -= 1;
                if entry.is_cancelled() {
                    continue;
                }
                if entry.deadline_ms <= now_ms {
                    fired.push(entry);
                } else {
                    // The wheel rotated past a long deadline; re-slot it.
                    let slot = self.slot_for(&inner, entry.deadline_ms);
                    inner.buckets[slot].push_back(entry);
                    inner.live += 1;
                }
            }
        }

        inner.clock_ms += (elapsed_ticks as u64) * self.tick_ms;
        fired
    }

    /// Like [`tick`], but gives up immediately if another thread is already
    /// driving the wheel. Used by idle workers.
    ///
    /// [`tick`]: TimerWheel::tick
    pub fn try_tick(&self, now_ms: u64) -> Option<Vec<Arc<TimerEntry>>> {
        // A contended wheel means someone else is making the same pass.
        if self.inner.try_lock().is_none() {
            return None;
        }
        Some(self.tick(now_ms))
    }

    /// Earliest non-cancelled deadline, if any. Sizes the idle sleep.
    pub fn next_deadline(&self) -> Option<u64> {
        let inner = self.inner.lock();
        inner
            .buckets
            .iter()
            .flatten()
            .filter(|e| !e.is_cancelled())
            .map(|e| e.deadline_ms)
            .min()
    }

    /// Number of entries currently held (cancelled ones included until
    /// their bucket is next visited).
    pub fn len(&self) -> usize {
        self.inner.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel")
            .field("size", &self.size)
            .field("tick_ms", &self.tick_ms)
            .field("live", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
