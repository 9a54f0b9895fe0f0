//! Bidirectional linking and one-way monitoring between blocks.
//!
//! Links are symmetric bookkeeping: if A links B, each holds the other's
//! PID, and unlink clears both sides. Monitors are one-way: the watcher
//! records the target in `monitors`, the target records the watcher in
//! `monitored_by`, and only the watcher ever receives a notification.
//! All four operations are idempotent set updates.
//!
//! Exit-signal fan-out itself lives in the scheduler's termination protocol;
//! this module owns the set discipline and the rules for what a departing
//! block leaves behind.

use std::sync::Arc;

use crate::block::Block;

/// Create a bidirectional link between two blocks. Idempotent.
///
/// Linking a block to itself is a no-op: a block cannot outlive itself.
pub fn link(a: &Arc<Block>, b: &Arc<Block>) {
    if a.pid() == b.pid() {
        return;
    }
    a.links_mut().insert(b.pid());
    b.links_mut().insert(a.pid());
}

/// Remove a bidirectional link. Idempotent; both sides are cleared.
pub fn unlink(a: &Arc<Block>, b: &Arc<Block>) {
    a.links_mut().remove(&b.pid());
    b.links_mut().remove(&a.pid());
}

/// Start monitoring `target` from `watcher`. Idempotent.
///
/// The delivering side walks `monitored_by`, so both sets must agree.
pub fn monitor(watcher: &Arc<Block>, target: &Arc<Block>) {
    if watcher.pid() == target.pid() {
        return;
    }
    watcher.monitors_mut().insert(target.pid());
    target.monitored_by_mut().insert(watcher.pid());
}

/// Stop monitoring `target`. Idempotent; a second demonitor is a no-op.
pub fn demonitor(watcher: &Arc<Block>, target: &Arc<Block>) {
    watcher.monitors_mut().remove(&target.pid());
    target.monitored_by_mut().remove(&watcher.pid());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
