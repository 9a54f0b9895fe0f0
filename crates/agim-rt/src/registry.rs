//! Sharded PID registry.
//!
//! Maps PIDs to blocks under concurrent spawn and exit. The map is split
//! across a fixed number of shards, each behind its own mutex, so lookups
//! from many workers do not serialize on a single lock. Iteration locks one
//! shard at a time; telemetry aggregation tolerates the resulting
//! point-in-time view.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::block::{Block, Pid};

/// Default shard count.
pub const DEFAULT_SHARDS: usize = 16;

/// PID -> block map, sharded by PID.
pub struct BlockRegistry {
    shards: Vec<Mutex<FxHashMap<u64, Arc<Block>>>>,
}

impl BlockRegistry {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        BlockRegistry {
            shards: (0..shards).map(|_| Mutex::new(FxHashMap::default())).collect(),
        }
    }

    fn shard(&self, pid: Pid) -> &Mutex<FxHashMap<u64, Arc<Block>>> {
        &self.shards[(pid.0 as usize) % self.shards.len()]
    }

    /// Register a block. Replaces nothing: PIDs are never reused, so a
    /// collision would be a runtime bug.
    pub fn insert(&self, block: Arc<Block>) {
        let pid = block.pid();
        debug_assert!(pid.is_valid(), "cannot register the invalid PID");
        self.shard(pid).lock().insert(pid.0, block);
    }

    /// Remove and return a block.
    pub fn remove(&self, pid: Pid) -> Option<Arc<Block>> {
        self.shard(pid).lock().remove(&pid.0)
    }

    /// Look up a live registration.
    pub fn get(&self, pid: Pid) -> Option<Arc<Block>> {
        self.shard(pid).lock().get(&pid.0).cloned()
    }

    /// Number of registered blocks.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every registered block, one shard locked at a time.
    pub fn for_each<F: FnMut(&Arc<Block>)>(&self, mut f: F) {
        for shard in &self.shards {
            for block in shard.lock().values() {
                f(block);
            }
        }
    }

    /// Snapshot of all registered PIDs.
    pub fn pids(&self) -> Vec<Pid> {
        let mut pids = Vec::with_capacity(self.len());
        self.for_each(|b| pids.push(b.pid()));
        pids
    }
}

impl std::fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRegistry")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Limits;

    fn make_block(pid: u64) -> Arc<Block> {
        Arc::new(Block::new(Pid(pid), None, Limits::default()))
    }

    #[test]
    fn test_insert_get_remove() {
        let reg = BlockRegistry::new(DEFAULT_SHARDS);
        reg.insert(make_block(1));
        reg.insert(make_block(2));

        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get(Pid(1)).unwrap().pid(), Pid(1));
        assert!(reg.get(Pid(99)).is_none());

        let removed = reg.remove(Pid(1)).unwrap();
        assert_eq!(removed.pid(), Pid(1));
        assert!(reg.get(Pid(1)).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_for_each_visits_all() {
        let reg = BlockRegistry::new(4);
        for pid in 1..=20 {
            reg.insert(make_block(pid));
        }
        let mut pids = reg.pids();
        pids.sort_unstable();
        assert_eq!(pids.len(), 20);
        assert_eq!(pids[0], Pid(1));
        assert_eq!(pids[19], Pid(20));
    }

    #[test]
    fn test_concurrent_insert_remove() {
        let reg = Arc::new(BlockRegistry::new(DEFAULT_SHARDS));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        let pid = t * 1000 + i + 1;
                        reg.insert(make_block(pid));
                        if i % 2 == 0 {
                            reg.remove(Pid(pid));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 8 * 50);
    }
}
