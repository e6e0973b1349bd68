//! Parallel proof-of-stake engine configuration.
//!
//! Defines shard layout, quorum size, finalization timing and the
//! reliability scoring tunables used by the sealing engine.

use std::time::Duration;

/// How validator reliability scores move after a finalized block.
///
/// Responders are rewarded, committee members that did not return a
/// signature are penalized. The penalty defaults to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliabilityPolicy {
    /// Points added to every validator whose signature made it into a block.
    pub reward: i64,
    /// Points removed from every committee member whose slot stayed empty.
    pub penalty: i64,
}

impl Default for ReliabilityPolicy {
    fn default() -> Self {
        Self {
            reward: 1,
            penalty: 0,
        }
    }
}

/// Configuration for the parallel proof-of-stake engine.
///
/// All durations are in milliseconds.
#[derive(Debug, Clone)]
pub struct PposConfig {
    /// Number of shards. The committee has one slot per shard.
    /// Default: 4.
    pub total_shards: usize,

    /// Signatures (including the producer's own) needed to finalize a block.
    /// Default: 3.
    pub min_quorum_sigs: usize,

    /// How long a single finalization attempt waits for signatures.
    /// Default: 5000.
    pub block_sig_wait_ms: u64,

    /// Finalization attempts before giving up on a candidate block.
    ///
    /// This counts every attempt, the first one included: with 5 the
    /// finalizer times out at most 5 times. Counting only retries, the
    /// way a `retries == 5` check before the increment does, allows one
    /// more attempt; set 6 here for that behavior.
    /// Default: 5.
    pub max_finalize_attempts: u32,

    /// Period of the chain-state request broadcast.
    /// Default: 10000.
    pub chain_state_interval_ms: u64,

    /// Pause between two sealing-loop iterations.
    /// Default: 100.
    pub seal_idle_ms: u64,

    /// Capacity of the signature and block intake channels.
    /// Default: 1024.
    pub intake_buffer_size: usize,

    /// Reliability scoring applied after every finalized block.
    pub reliability: ReliabilityPolicy,
}

impl Default for PposConfig {
    fn default() -> Self {
        Self {
            total_shards: 4,
            min_quorum_sigs: 3,
            block_sig_wait_ms: 5_000,
            max_finalize_attempts: 5,
            chain_state_interval_ms: 10_000,
            seal_idle_ms: 100,
            intake_buffer_size: 1_024,
            reliability: ReliabilityPolicy::default(),
        }
    }
}

impl PposConfig {
    /// Create a config suitable for local testing with short timeouts.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            block_sig_wait_ms: 40,
            chain_state_interval_ms: 20,
            seal_idle_ms: 5,
            intake_buffer_size: 64,
            ..Self::default()
        }
    }

    /// Signatures the producer must collect from other committee members.
    /// Its own signature counts as the remaining vote.
    pub fn external_sigs_needed(&self) -> usize {
        self.min_quorum_sigs.saturating_sub(1)
    }

    pub fn block_sig_wait(&self) -> Duration {
        Duration::from_millis(self.block_sig_wait_ms)
    }

    pub fn chain_state_interval(&self) -> Duration {
        Duration::from_millis(self.chain_state_interval_ms)
    }

    pub fn seal_idle(&self) -> Duration {
        Duration::from_millis(self.seal_idle_ms)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_shards == 0 || self.total_shards > usize::from(u8::MAX) {
            return Err(ConfigError::InvalidShardCount(self.total_shards));
        }
        if self.min_quorum_sigs == 0 || self.min_quorum_sigs > self.total_shards {
            return Err(ConfigError::InvalidQuorum {
                quorum: self.min_quorum_sigs,
                committee: self.total_shards,
            });
        }
        if self.block_sig_wait_ms == 0 {
            return Err(ConfigError::InvalidSigWait);
        }
        if self.max_finalize_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts);
        }
        if self.chain_state_interval_ms == 0 {
            return Err(ConfigError::InvalidChainStateInterval);
        }
        if self.intake_buffer_size == 0 {
            return Err(ConfigError::InvalidIntakeBuffer);
        }
        Ok(())
    }
}

/// Errors in engine configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("total_shards must be in [1, 255], got {0}")]
    InvalidShardCount(usize),
    #[error("min_quorum_sigs must be in [1, {committee}], got {quorum}")]
    InvalidQuorum { quorum: usize, committee: usize },
    #[error("block_sig_wait_ms must be > 0")]
    InvalidSigWait,
    #[error("max_finalize_attempts must be > 0")]
    InvalidMaxAttempts,
    #[error("chain_state_interval_ms must be > 0")]
    InvalidChainStateInterval,
    #[error("intake_buffer_size must be > 0")]
    InvalidIntakeBuffer,
}
