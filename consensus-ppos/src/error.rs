//! Error types for the parallel proof-of-stake engine.

use {
    crate::{config::ConfigError, types::ShardId},
    solana_pubkey::Pubkey,
    thiserror::Error,
};

/// Errors surfaced by the engine and by its collaborators.
#[derive(Error, Debug)]
pub enum EngineError {
    /// `start` was called on a running engine.
    #[error("consensus engine is already started")]
    AlreadyStarted,

    /// An operation needs a running engine (or a running sealer).
    #[error("consensus engine isn't running")]
    NotStarted,

    /// Finalization gave up after the configured number of attempts.
    #[error("block finalization exceeded retry limit after {attempts} attempts")]
    ExceededRetryLimit {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// A block failed a structural or signature check.
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// The requested block is not stored.
    #[error("block not found at shard {shard} height {height}")]
    BlockNotFound {
        /// Shard the block was looked up on.
        shard: ShardId,
        /// Height that was requested.
        height: u64,
    },

    /// A different block was already signed at this shard height.
    #[error("already signed another block at shard {shard} height {height}")]
    ConflictingBlock {
        /// Shard of the conflicting block.
        shard: ShardId,
        /// Height both blocks claim.
        height: u64,
    },

    /// The validator is not a member of the committee snapshot.
    #[error("validator {0} is not in the current committee")]
    NotInCommittee(Pubkey),

    /// The chain collaborator rejected an operation.
    #[error("blockchain error: {0}")]
    BlockChain(String),

    /// The block template collaborator failed.
    #[error("block factory error: {0}")]
    BlockFactory(String),

    /// A fee estimator refused a replayed block.
    #[error("fee estimator error: {0}")]
    FeeEstimator(String),

    /// A peer could not be reached or a message could not be sent.
    #[error("transport error: {0}")]
    Transport(String),

    /// Failed to encode a header or candidate list.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// The engine configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A worker thread could not be spawned.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
