//! Shardnet parallel proof-of-stake consensus engine
//!
//! Every shard (chain) has one leader per slot, chosen from an ordered
//! committee. The leader builds a block, collects signatures from the other
//! committee members until a quorum is reached, and commits the block. A
//! validator only leads while it has validated every shard up to the
//! heights the network reports; otherwise it first requests the blocks it
//! is missing.
//!
//! # Key Properties
//!
//! - **Quorum finality**: a block is committed only with at least
//!   `min_quorum_sigs` valid committee signatures, the producer's included.
//! - **Bounded retry**: finalization gives up after `max_finalize_attempts`
//!   timed-out attempts.
//! - **Prompt cancellation**: stopping the sealer cancels an in-flight
//!   finalization without committing anything.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                    Engine                     │
//! │  ┌──────────────┐  ┌───────────────────────┐  │
//! │  │ ChainHeights │  │ CommitteeState        │  │
//! │  │ known / val. │  │ members, reliability  │  │
//! │  └──────────────┘  └───────────────────────┘  │
//! │  ┌──────────────┐  ┌──────────┐  ┌─────────┐  │
//! │  │ Sealer loop  │─▶│Finalizer │─▶│ commit  │  │
//! │  └──────────────┘  └──────────┘  └─────────┘  │
//! │  chain-state loop        block intake loop    │
//! └───────────────────────────────────────────────┘
//! ```

pub mod capabilities;
pub mod committee;
pub mod config;
pub mod engine;
pub mod error;
pub mod finalizer;
pub mod heights;
pub mod leader;
pub mod sealer;
pub mod types;

#[cfg(any(test, feature = "dev-context-only-utils"))]
pub mod test_utils;

#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use capabilities::{
    BlockChain, BlockFactory, CandidateSource, EngineConfig, FeeEstimator, LeaderSchedule,
    MemPool, Server,
};
pub use committee::{CommitteeState, ValidatorStats};
pub use config::{ConfigError, PposConfig, ReliabilityPolicy};
pub use engine::{BlockDisposition, Engine};
pub use error::{EngineError, Result};
pub use finalizer::{FinalizeOutcome, SigVerdict, SignatureCollector};
pub use heights::ChainHeights;
pub use leader::CommitteeOrderSchedule;
pub use sealer::SealStep;
pub use types::{
    BestState, Block, BlockHeader, BlockSig, ChainInfo, PeerMessage, SealerKeys, ShardId,
};
