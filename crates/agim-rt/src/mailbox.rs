//! Lock-free MPSC mailbox for Agim block message passing.
//!
//! Any number of producers may push concurrently; only the worker currently
//! running the owning block pops. The queue is an intrusive linked list with
//! a permanent stub node: a producer publishes with a single atomic swap on
//! the tail followed by a release-store linking the predecessor, and the
//! consumer follows `next` pointers with acquire loads. The message payload
//! therefore happens-before its visibility to the consumer.
//!
//! The two-step enqueue has one observable consequence: between a producer's
//! swap and its link store, the consumer can see an empty `next` pointer even
//! though the tail has advanced. That window is reported as "empty", which is
//! allowed -- `len` and `bytes_used` are approximate by contract.
//!
//! Bounds are enforced per push against a [`Limits`] snapshot with one of
//! four [`OverflowPolicy`] outcomes. `DropOld` reclamation is deferred to the
//! consumer: producers only record the debt, because only the consumer may
//! pop.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::block::{Limits, Message};

// ---------------------------------------------------------------------------
// OverflowPolicy
// ---------------------------------------------------------------------------

/// What happens when a push would exceed the mailbox bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Discard the incoming message and count it as dropped.
    DropNew,
    /// Enqueue the incoming message; the consumer reclaims one old head
    /// message on its next pop.
    DropOld,
    /// Refuse the push; the sender observes `WouldBlock`.
    BlockSender,
    /// Enqueue the incoming message and terminate the receiver with
    /// reason "mailbox overflow".
    CrashReceiver,
}

/// Result of a [`Mailbox::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The message was linked at the tail.
    Pushed,
    /// `DropNew` fired; the message was discarded.
    Dropped,
    /// `BlockSender` fired; the message was not enqueued.
    WouldBlock,
    /// `CrashReceiver` fired; the message was enqueued and the caller must
    /// transition the receiver to DEAD.
    CrashReceiver,
}

// ---------------------------------------------------------------------------
// Queue node
// ---------------------------------------------------------------------------

struct Node {
    /// Payload slot. `None` only in the stub position. Written by the
    /// producer before the node is published, taken by the sole consumer
    /// after an acquire load of the link that published it.
    msg: UnsafeCell<Option<Message>>,
    next: AtomicPtr<Node>,
}

impl Node {
    fn boxed(msg: Option<Message>) -> *mut Node {
        Box::into_raw(Box::new(Node {
            msg: UnsafeCell::new(msg),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

/// Multi-producer / single-consumer FIFO mailbox.
pub struct Mailbox {
    /// Consumed stub position. Touched only by the consumer.
    head: AtomicPtr<Node>,
    /// Most recently enqueued node. Producers swap this.
    tail: AtomicPtr<Node>,
    /// Approximate live message count.
    count: AtomicUsize,
    /// Approximate live payload bytes.
    bytes: AtomicUsize,
    /// Messages discarded by `DropNew` or reclaimed for `DropOld`.
    dropped: AtomicU64,
    /// Outstanding `DropOld` reclamations owed by the consumer.
    pending_drop: AtomicUsize,
    /// Wakeup channel for `recv_blocking` (tests and single-threaded
    /// callers only -- scheduler workers never park here).
    park_lock: Mutex<()>,
    park_cond: Condvar,
}

// The queue is safe to share: producers touch only `tail` and the node they
// allocated; the single consumer owns `head` and everything reachable from
// it that has been published with release/acquire.
unsafe impl Send for Mailbox {}
unsafe impl Sync for Mailbox {}

impl Mailbox {
    /// Create an empty mailbox with its permanent stub node.
    pub fn new() -> Self {
        let stub = Node::boxed(None);
        Mailbox {
            head: AtomicPtr::new(stub),
            tail: AtomicPtr::new(stub),
            count: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            pending_drop: AtomicUsize::new(0),
            park_lock: Mutex::new(()),
            park_cond: Condvar::new(),
        }
    }

    /// Push a message, applying the overflow policy from `limits`.
    ///
    /// Callable concurrently from any thread. On `Dropped` and `WouldBlock`
    /// the payload is released here (ownership was taken either way).
    pub fn push(&self, msg: Message, limits: &Limits) -> PushOutcome {
        let size = msg.approx_bytes();
        let over = self.count.load(Ordering::Relaxed) >= limits.max_mailbox_msgs
            || self.bytes.load(Ordering::Relaxed).saturating_add(size) > limits.max_mailbox_bytes;

        if over {
            match limits.overflow {
                OverflowPolicy::DropNew => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return PushOutcome::Dropped;
                }
                OverflowPolicy::BlockSender => return PushOutcome::WouldBlock,
                OverflowPolicy::DropOld => {
                    self.pending_drop.fetch_add(1, Ordering::Relaxed);
                    self.enqueue(msg, size);
                    return PushOutcome::Pushed;
                }
                OverflowPolicy::CrashReceiver => {
                    self.enqueue(msg, size);
                    return PushOutcome::CrashReceiver;
                }
            }
        }

        self.enqueue(msg, size);
        PushOutcome::Pushed
    }

    /// Two-step lock-free enqueue: swap the tail, then link the predecessor.
    fn enqueue(&self, msg: Message, size: usize) {
        let node = Node::boxed(Some(msg));
        // AcqRel: acquire the predecessor chain, release our payload write.
        let prev = self.tail.swap(node, Ordering::AcqRel);
        // Publish: after this release-store the consumer's acquire load of
        // `prev.next` sees the fully initialized node.
        unsafe { (*prev).next.store(node, Ordering::Release) };

        self.count.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size, Ordering::Relaxed);
        self.park_cond.notify_one();
    }

    /// Pop the oldest message. Single consumer only.
    ///
    /// Settles any `DropOld` debt first: each owed reclamation removes one
    /// head message and counts it as dropped.
    pub fn pop(&self) -> Option<Message> {
        while self.pending_drop.load(Ordering::Relaxed) > 0 {
            match self.pop_one() {
                Some(_) => {
                    self.pending_drop.fetch_sub(1, Ordering::Relaxed);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                // Transiently empty: leave the debt for the next pop.
                None => break,
            }
        }
        self.pop_one()
    }

    fn pop_one(&self) -> Option<Message> {
        let head = self.head.load(Ordering::Relaxed);
        // Acquire pairs with the producer's release link store.
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }

        // The successor holds the payload; the old head was already consumed
        // and no producer references it (producers only touch the node they
        // captured from the tail swap, and they have linked past this one).
        let msg = unsafe { (*(*next).msg.get()).take() };
        self.head.store(next, Ordering::Relaxed);
        unsafe { drop(Box::from_raw(head)) };

        let msg = msg.expect("published mailbox node carries a message");
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(msg.approx_bytes(), Ordering::Relaxed);
        Some(msg)
    }

    /// Approximate emptiness check; may lag concurrent pushes.
    pub fn is_empty(&self) -> bool {
        self.count.load(Ordering::Relaxed) == 0
    }

    /// Approximate message count.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Approximate payload bytes currently queued.
    pub fn bytes_used(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Messages lost to `DropNew` plus `DropOld` reclamations so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Block the calling thread until a message arrives or the timeout
    /// elapses. Convenience for tests and single-threaded embedders; the
    /// scheduler never parks a worker on a mailbox.
    pub fn recv_blocking(&self, timeout: Duration) -> Option<Message> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(msg) = self.pop() {
                return Some(msg);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let mut guard = self.park_lock.lock();
            // Re-check after taking the lock so a push between `pop` and
            // `lock` cannot strand us.
            if !self.is_empty() {
                continue;
            }
            let _ = self.park_cond.wait_for(&mut guard, deadline - now);
        }
    }

    /// Clone the queued messages oldest-first without consuming them.
    ///
    /// Consumer-side only: callers must guarantee no concurrent `pop`, the
    /// same exclusivity the running worker has. Used by checkpointing, which
    /// only captures blocks that are not RUNNING.
    pub(crate) fn snapshot(&self) -> Vec<Message> {
        let mut out = Vec::new();
        let mut node = self.head.load(Ordering::Relaxed);
        loop {
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            if next.is_null() {
                break;
            }
            if let Some(msg) = unsafe { (*(*next).msg.get()).as_ref() } {
                out.push(msg.clone());
            }
            node = next;
        }
        out
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        // Exclusive access: drain every published node, then the stub.
        while self.pop_one().is_some() {}
        let stub = self.head.load(Ordering::Relaxed);
        unsafe { drop(Box::from_raw(stub)) };
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("len", &self.len())
            .field("bytes", &self.bytes_used())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Pid;
    use crate::value::Value;

    fn make_msg(n: i64) -> Message {
        Message::user(Pid(1), Value::Int(n))
    }

    fn loose_limits() -> Limits {
        Limits::default()
    }

    fn bounded(max_msgs: usize, policy: OverflowPolicy) -> Limits {
        Limits {
            max_mailbox_msgs: max_msgs,
            overflow: policy,
            ..Limits::default()
        }
    }

    #[test]
    fn test_push_pop_fifo() {
        let mb = Mailbox::new();
        for n in 1..=3 {
            assert_eq!(mb.push(make_msg(n), &loose_limits()), PushOutcome::Pushed);
        }
        for n in 1..=3 {
            let msg = mb.pop().unwrap();
            assert_eq!(msg.payload, Value::Int(n));
        }
        assert!(mb.pop().is_none());
    }

    #[test]
    fn test_empty_mailbox() {
        let mb = Mailbox::new();
        assert!(mb.is_empty());
        assert_eq!(mb.len(), 0);
        assert_eq!(mb.bytes_used(), 0);
        assert!(mb.pop().is_none());
    }

    #[test]
    fn test_len_and_bytes_track_pushes() {
        let mb = Mailbox::new();
        mb.push(make_msg(1), &loose_limits());
        mb.push(make_msg(2), &loose_limits());
        assert_eq!(mb.len(), 2);
        assert!(mb.bytes_used() > 0);

        mb.pop();
        assert_eq!(mb.len(), 1);
        mb.pop();
        assert_eq!(mb.len(), 0);
        assert_eq!(mb.bytes_used(), 0);
    }

    #[test]
    fn test_drop_new_discards_incoming() {
        let mb = Mailbox::new();
        let limits = bounded(2, OverflowPolicy::DropNew);
        assert_eq!(mb.push(make_msg(1), &limits), PushOutcome::Pushed);
        assert_eq!(mb.push(make_msg(2), &limits), PushOutcome::Pushed);
        assert_eq!(mb.push(make_msg(3), &limits), PushOutcome::Dropped);

        assert_eq!(mb.len(), 2);
        assert_eq!(mb.dropped_count(), 1);
        assert_eq!(mb.pop().unwrap().payload, Value::Int(1));
        assert_eq!(mb.pop().unwrap().payload, Value::Int(2));
    }

    #[test]
    fn test_drop_old_reclaims_head_on_pop() {
        let mb = Mailbox::new();
        let limits = bounded(2, OverflowPolicy::DropOld);
        mb.push(make_msg(1), &limits);
        mb.push(make_msg(2), &limits);
        assert_eq!(mb.push(make_msg(3), &limits), PushOutcome::Pushed);

        // The oldest message is reclaimed by the consumer, not the producer.
        assert_eq!(mb.pop().unwrap().payload, Value::Int(2));
        assert_eq!(mb.dropped_count(), 1);
        assert_eq!(mb.pop().unwrap().payload, Value::Int(3));
        assert!(mb.pop().is_none());
    }

    #[test]
    fn test_block_sender_rejects() {
        let mb = Mailbox::new();
        let limits = bounded(1, OverflowPolicy::BlockSender);
        assert_eq!(mb.push(make_msg(1), &limits), PushOutcome::Pushed);
        assert_eq!(mb.push(make_msg(2), &limits), PushOutcome::WouldBlock);
        assert_eq!(mb.len(), 1);
    }

    #[test]
    fn test_crash_receiver_still_enqueues() {
        let mb = Mailbox::new();
        let limits = bounded(1, OverflowPolicy::CrashReceiver);
        assert_eq!(mb.push(make_msg(1), &limits), PushOutcome::Pushed);
        assert_eq!(mb.push(make_msg(2), &limits), PushOutcome::CrashReceiver);
        assert_eq!(mb.len(), 2);
    }

    #[test]
    fn test_byte_bound_triggers_policy() {
        let mb = Mailbox::new();
        let limits = Limits {
            max_mailbox_bytes: 64,
            overflow: OverflowPolicy::DropNew,
            ..Limits::default()
        };
        let big = Message::user(Pid(1), Value::str(&"x".repeat(256)));
        assert_eq!(mb.push(big.clone(), &limits), PushOutcome::Dropped);
        assert_eq!(mb.len(), 0);
    }

    #[test]
    fn test_concurrent_producers() {
        use std::sync::Arc;

        let mb = Arc::new(Mailbox::new());
        let num_threads = 8;
        let msgs_per_thread = 200;

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let mb = Arc::clone(&mb);
                std::thread::spawn(move || {
                    for i in 0..msgs_per_thread {
                        let n = (t * msgs_per_thread + i) as i64;
                        mb.push(make_msg(n), &Limits::default());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(mb.len(), num_threads * msgs_per_thread);
        let mut count = 0;
        while mb.pop().is_some() {
            count += 1;
        }
        assert_eq!(count, num_threads * msgs_per_thread);
    }

    #[test]
    fn test_per_producer_fifo_under_concurrency() {
        use std::sync::Arc;

        let mb = Arc::new(Mailbox::new());
        let producers = 4;
        let per = 500i64;

        let handles: Vec<_> = (0..producers)
            .map(|t| {
                let mb = Arc::clone(&mb);
                std::thread::spawn(move || {
                    for i in 0..per {
                        let msg = Message::user(Pid(t as u64 + 1), Value::Int(i));
                        mb.push(msg, &Limits::default());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Per sender, payloads must come out strictly ascending.
        let mut last = vec![-1i64; producers + 2];
        while let Some(msg) = mb.pop() {
            let sender = msg.sender.0 as usize;
            let n = msg.payload.as_int().unwrap();
            assert!(n > last[sender], "per-sender FIFO violated");
            last[sender] = n;
        }
    }

    #[test]
    fn test_recv_blocking_wakes_on_push() {
        use std::sync::Arc;

        let mb = Arc::new(Mailbox::new());
        let producer = {
            let mb = Arc::clone(&mb);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                mb.push(make_msg(42), &Limits::default());
            })
        };
        let msg = mb.recv_blocking(Duration::from_secs(2));
        producer.join().unwrap();
        assert_eq!(msg.unwrap().payload, Value::Int(42));
    }

    #[test]
    fn test_recv_blocking_times_out() {
        let mb = Mailbox::new();
        let start = std::time::Instant::now();
        assert!(mb.recv_blocking(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_snapshot_preserves_queue() {
        let mb = Mailbox::new();
        mb.push(make_msg(1), &loose_limits());
        mb.push(make_msg(2), &loose_limits());

        let snap = mb.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].payload, Value::Int(1));
        assert_eq!(snap[1].payload, Value::Int(2));

        // Snapshot must not consume.
        assert_eq!(mb.len(), 2);
        assert_eq!(mb.pop().unwrap().payload, Value::Int(1));
    }

    #[test]
    fn test_drop_releases_queued_messages() {
        let mb = Mailbox::new();
        for n in 0..100 {
            mb.push(make_msg(n), &loose_limits());
        }
        drop(mb); // must not leak or double-free
    }
}
