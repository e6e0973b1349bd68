//! Per-shard chain height tracking.
//!
//! The engine keeps two [`ChainHeights`]: *known* heights, claimed by peers
//! through gossip, and *validated* heights, confirmed by this node. A node
//! may only lead while both agree on every shard; any shard where known is
//! ahead has to be caught up first.

use {
    crate::types::ShardId,
    std::sync::{Mutex, MutexGuard, PoisonError},
};

/// One height per shard behind a mutex.
#[derive(Debug)]
pub struct ChainHeights {
    heights: Mutex<Vec<u64>>,
}

impl ChainHeights {
    /// All shards start at height 0.
    pub fn new(total_shards: usize) -> Self {
        Self {
            heights: Mutex::new(vec![0; total_shards]),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u64>> {
        self.heights.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Height of `shard`, or 0 for an unknown shard.
    pub fn get(&self, shard: ShardId) -> u64 {
        self.lock().get(usize::from(shard)).copied().unwrap_or(0)
    }

    /// Overwrite the height of `shard`. Unknown shards are ignored.
    pub fn set(&self, shard: ShardId, height: u64) {
        if let Some(slot) = self.lock().get_mut(usize::from(shard)) {
            *slot = height;
        }
    }

    /// Raise `shard` to `height` if that is higher than what is stored.
    /// Returns whether the stored height changed.
    pub fn raise(&self, shard: ShardId, height: u64) -> bool {
        match self.lock().get_mut(usize::from(shard)) {
            Some(slot) if *slot < height => {
                *slot = height;
                true
            }
            _ => false,
        }
    }

    /// Copy of every shard height.
    pub fn snapshot(&self) -> Vec<u64> {
        self.lock().clone()
    }

    /// Replace all heights. Extra entries are dropped, missing ones zeroed.
    pub fn reset_to(&self, heights: &[u64]) {
        let mut guard = self.lock();
        for (shard, slot) in guard.iter_mut().enumerate() {
            *slot = heights.get(shard).copied().unwrap_or(0);
        }
    }
}

/// Whether two height vectors agree on every shard.
pub fn same_heights(known: &[u64], validated: &[u64]) -> bool {
    known == validated
}

/// Shards whose known height is ahead of the validated one.
pub fn lagging_shards(known: &[u64], validated: &[u64]) -> Vec<ShardId> {
    known
        .iter()
        .zip(validated)
        .enumerate()
        .filter(|(_, (known, validated))| known > validated)
        .filter_map(|(shard, _)| ShardId::try_from(shard).ok())
        .collect()
}
