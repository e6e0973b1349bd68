//! Leader selection.
//!
//! The default schedule maps committee slot `i` to shard `i`: a validator
//! leads the shard whose index equals its position in the committee. Every
//! node holding the same committee agrees on who leads each shard.

use {
    crate::{capabilities::LeaderSchedule, types::ShardId},
    solana_pubkey::Pubkey,
};

/// Committee slot `i` leads shard `i`.
#[derive(Debug, Clone, Copy)]
pub struct CommitteeOrderSchedule {
    total_shards: usize,
}

impl CommitteeOrderSchedule {
    pub fn new(total_shards: usize) -> Self {
        Self { total_shards }
    }
}

impl LeaderSchedule for CommitteeOrderSchedule {
    fn my_shard(
        &self,
        identity: &Pubkey,
        committee: &[Pubkey],
        _heights: &[u64],
    ) -> Option<ShardId> {
        let position = committee.iter().position(|member| member == identity)?;
        if position >= self.total_shards {
            return None;
        }
        ShardId::try_from(position).ok()
    }
}
