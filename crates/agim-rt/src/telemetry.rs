//! Per-block statistics and the ring-buffered tracer.
//!
//! Counters live on every block and are updated by the stepper context and
//! the scheduler with relaxed atomics. The tracer is opt-in per block: a
//! fixed-capacity ring written through an atomic index, with an optional
//! forwarding hook. Readers take a snapshot by copying the most recent
//! `min(count, capacity)` events oldest-first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::Pid;

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Resource counters maintained for every block.
#[derive(Debug, Default)]
pub struct Counters {
    pub reductions: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub gc_cycles: AtomicU64,
    pub bytes_allocated: AtomicU64,
    pub wait_time_ms: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            reductions: self.reductions.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            gc_cycles: self.gc_cycles.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            wait_time_ms: self.wait_time_ms.load(Ordering::Relaxed),
        }
    }

    /// Overwrite every counter. Used by checkpoint restore.
    pub fn restore(&self, snap: &CounterSnapshot) {
        self.reductions.store(snap.reductions, Ordering::Relaxed);
        self.messages_sent.store(snap.messages_sent, Ordering::Relaxed);
        self.messages_received
            .store(snap.messages_received, Ordering::Relaxed);
        self.gc_cycles.store(snap.gc_cycles, Ordering::Relaxed);
        self.bytes_allocated
            .store(snap.bytes_allocated, Ordering::Relaxed);
        self.wait_time_ms.store(snap.wait_time_ms, Ordering::Relaxed);
    }
}

/// Point-in-time copy of a block's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub reductions: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub gc_cycles: u64,
    pub bytes_allocated: u64,
    pub wait_time_ms: u64,
}

// ---------------------------------------------------------------------------
// Trace events
// ---------------------------------------------------------------------------

/// What a trace event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEventKind {
    Send,
    Receive,
    Spawn,
    Exit,
    Link,
    Unlink,
    Gc,
    Call,
    Return,
}

impl TraceEventKind {
    /// Stable lowercase label, used when events are forwarded as messages.
    pub fn name(self) -> &'static str {
        match self {
            TraceEventKind::Send => "send",
            TraceEventKind::Receive => "receive",
            TraceEventKind::Spawn => "spawn",
            TraceEventKind::Exit => "exit",
            TraceEventKind::Link => "link",
            TraceEventKind::Unlink => "unlink",
            TraceEventKind::Gc => "gc",
            TraceEventKind::Call => "call",
            TraceEventKind::Return => "return",
        }
    }
}

/// One recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    pub kind: TraceEventKind,
    /// Block the event happened on.
    pub pid: Pid,
    /// Counterpart block, or [`Pid::INVALID`] when there is none.
    pub other: Pid,
    /// Scheduler-clock timestamp in milliseconds.
    pub at_ms: u64,
}

/// Optional forwarding hook invoked for every recorded event.
pub type TraceSink = Arc<dyn Fn(&TraceEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// Tracer
// ---------------------------------------------------------------------------

/// Ring-buffered per-block event recorder.
///
/// Writers claim a slot with a fetch-add on the write index and store the
/// event into it; no writer ever blocks another on a different slot. Once
/// the ring is full, new events overwrite the oldest.
pub struct Tracer {
    slots: Box<[Mutex<Option<TraceEvent>>]>,
    write_idx: AtomicU64,
    sink: Mutex<Option<TraceSink>>,
}

impl Tracer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "tracer capacity must be non-zero");
        Tracer {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            write_idx: AtomicU64::new(0),
            sink: Mutex::new(None),
        }
    }

    /// Install a forwarding hook for subsequently recorded events.
    pub fn set_sink(&self, sink: TraceSink) {
        *self.sink.lock() = Some(sink);
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Total events recorded, including overwritten ones.
    pub fn recorded(&self) -> u64 {
        self.write_idx.load(Ordering::Acquire)
    }

    /// Record an event.
    pub fn record(&self, event: TraceEvent) {
        let idx = self.write_idx.fetch_add(1, Ordering::AcqRel);
        let slot = (idx % self.slots.len() as u64) as usize;
        *self.slots[slot].lock() = Some(event);

        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink(&event);
        }
    }

    /// Copy the most recent `min(count, capacity)` events oldest-first.
    pub fn snapshot(&self) -> Vec<TraceEvent> {
        let total = self.write_idx.load(Ordering::Acquire);
        let cap = self.slots.len() as u64;
        let n = total.min(cap);
        let start = total - n;

        let mut out = Vec::with_capacity(n as usize);
        for i in start..total {
            let slot = (i % cap) as usize;
            if let Some(event) = *self.slots[slot].lock() {
                out.push(event);
            }
        }
        out
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("capacity", &self.capacity())
            .field("recorded", &self.recorded())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
