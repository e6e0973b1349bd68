//! Committee membership and validator bookkeeping.
//!
//! Holds the ordered committee of the node's shard together with how many
//! blocks each validator produced and how reliably it signed. Finalization
//! works on copies taken with [`CommitteeState::snapshot`], so updates made
//! here never disturb an attempt that is already collecting signatures.

use {
    crate::config::ReliabilityPolicy,
    log::*,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    std::{
        collections::HashMap,
        sync::{Mutex, MutexGuard, PoisonError},
        time::{SystemTime, UNIX_EPOCH},
    },
};

/// Per-validator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidatorStats {
    /// Finalized blocks produced by the validator.
    pub blocks_produced: u64,
    /// Net reliability score, see [`ReliabilityPolicy`].
    pub reliability: i64,
}

#[derive(Debug, Default)]
struct CommitteeInner {
    /// Ordered committee, one member per shard slot.
    members: Vec<Pubkey>,
    stats: HashMap<Pubkey, ValidatorStats>,
    /// Unix seconds of the last block recorded.
    last_update: i64,
}

/// The active committee and its scores behind one mutex.
#[derive(Debug)]
pub struct CommitteeState {
    inner: Mutex<CommitteeInner>,
    policy: ReliabilityPolicy,
}

impl CommitteeState {
    pub fn new(policy: ReliabilityPolicy) -> Self {
        Self {
            inner: Mutex::new(CommitteeInner::default()),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CommitteeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `members` as the committee and forget all scores.
    pub fn reset(&self, members: Vec<Pubkey>) {
        let mut inner = self.lock();
        info!("committee reset to {} members", members.len());
        inner.members = members;
        inner.stats.clear();
        inner.last_update = 0;
    }

    /// Copy of the ordered committee.
    pub fn snapshot(&self) -> Vec<Pubkey> {
        self.lock().members.clone()
    }

    pub fn contains(&self, validator: &Pubkey) -> bool {
        self.lock().members.contains(validator)
    }

    /// Counters of `validator`, zero if it has never been scored.
    pub fn stats(&self, validator: &Pubkey) -> ValidatorStats {
        self.lock().stats.get(validator).copied().unwrap_or_default()
    }

    pub fn last_update(&self) -> i64 {
        self.lock().last_update
    }

    /// Score a finalized block.
    ///
    /// `committee` and `sigs` are the snapshot and signature slots stored in
    /// the block header, index-aligned. The producer's own slot earns no
    /// reliability points.
    pub fn record_block(
        &self,
        producer: &Pubkey,
        committee: &[Pubkey],
        sigs: &[Option<Signature>],
    ) {
        let policy = self.policy;
        let mut inner = self.lock();

        let entry = inner.stats.entry(*producer).or_default();
        entry.blocks_produced = entry.blocks_produced.saturating_add(1);

        for (member, sig) in committee.iter().zip(sigs) {
            if member == producer {
                continue;
            }
            let entry = inner.stats.entry(*member).or_default();
            entry.reliability = if sig.is_some() {
                entry.reliability.saturating_add(policy.reward)
            } else {
                entry.reliability.saturating_sub(policy.penalty)
            };
        }

        inner.last_update = unix_now();
        debug!(
            "recorded block from {producer}: {} blocks produced",
            inner
                .stats
                .get(producer)
                .map(|s| s.blocks_produced)
                .unwrap_or_default()
        );
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
