//! Collaborators the engine drives but does not own.
//!
//! The chain, fee estimators, mempool, transport, block templates and the
//! candidate list source are each a narrow trait injected through
//! [`EngineConfig`], so nodes wire in their real subsystems and tests wire
//! in the in-memory doubles from `test_utils`.

use {
    crate::{
        error::Result,
        types::{BestState, Block, PeerMessage, SealerKeys, ShardId},
    },
    solana_pubkey::Pubkey,
    std::{net::SocketAddr, sync::Arc},
};

/// The shard chains and their best states.
pub trait BlockChain: Send + Sync {
    /// Height of the best block stored for `shard`.
    fn best_height(&self, shard: ShardId) -> u64;

    /// Stored block at `height` on `shard`, or `BlockNotFound`.
    fn block_by_height(&self, shard: ShardId, height: u64) -> Result<Block>;

    /// Structural checks on a block before it is replayed or connected.
    fn validate_block_sanity(&self, block: &Block) -> Result<()>;

    /// Rebuild the transaction view point of a replayed block.
    fn build_view_point(&self, block: &Block) -> Result<()>;

    /// Append a finalized block to its shard.
    fn connect_block(&self, block: &Block) -> Result<()>;

    fn best_state(&self, shard: ShardId) -> BestState;

    /// Advance the shard's best state to `block` and store the recomputed
    /// candidate list with it.
    fn update_best_state(&self, block: &Block, candidates: Vec<Pubkey>) -> Result<()>;

    /// Persist the shard's best state.
    fn store_best_state(&self, shard: ShardId) -> Result<()>;
}

/// Per-shard fee estimator fed with every validated block.
pub trait FeeEstimator: Send + Sync {
    fn register_block(&self, block: &Block) -> Result<()>;
}

pub trait MemPool: Send + Sync {
    /// Drop a transaction that made it into a block.
    fn remove_transaction(&self, tx: &[u8]);
}

/// The slice of the network server the engine calls back into.
pub trait Server: Send + Sync {
    /// Network addresses a validator is reachable on. Empty if unknown.
    fn resolve_peers(&self, validator: &Pubkey) -> Vec<SocketAddr>;

    fn broadcast_to_all(&self, message: PeerMessage) -> Result<()>;

    fn send_to_peer(&self, message: PeerMessage, addr: SocketAddr) -> Result<()>;

    /// Ask every peer for its chain state.
    fn broadcast_chain_state_request(&self) -> Result<()>;
}

/// Builds block skeletons from the mempool.
pub trait BlockFactory: Send + Sync {
    fn new_block_template(&self, payment_address: &Pubkey, shard: ShardId) -> Result<Block>;
}

/// Computes the candidate validator list after a block.
pub trait CandidateSource: Send + Sync {
    fn candidate_list(&self, block: &Block) -> Vec<Pubkey>;
}

/// Decides which shard, if any, this validator leads right now.
pub trait LeaderSchedule: Send + Sync {
    fn my_shard(&self, identity: &Pubkey, committee: &[Pubkey], heights: &[u64])
        -> Option<ShardId>;
}

/// Collaborators and static inputs the engine is constructed with.
#[derive(Clone)]
pub struct EngineConfig {
    pub block_chain: Arc<dyn BlockChain>,
    pub mem_pool: Arc<dyn MemPool>,
    pub server: Arc<dyn Server>,
    pub block_factory: Arc<dyn BlockFactory>,
    pub candidates: Arc<dyn CandidateSource>,
    pub leader_schedule: Arc<dyn LeaderSchedule>,
    /// One estimator per shard, indexed by shard id.
    pub fee_estimators: Vec<Arc<dyn FeeEstimator>>,
    /// Committee of the genesis block.
    pub genesis_committee: Vec<Pubkey>,
    /// Fee estimators are already warm; skip replaying the local chain.
    pub fast_start: bool,
    /// Keys installed before the sealer is started, if any.
    pub sealer_keys: Option<SealerKeys>,
}

impl EngineConfig {
    pub fn fee_estimator(&self, shard: ShardId) -> Option<&Arc<dyn FeeEstimator>> {
        self.fee_estimators.get(usize::from(shard))
    }
}
