//! The sealing loop.
//!
//! While the engine runs, each iteration either catches up on shards whose
//! known height is ahead of the validated one, or, once every shard agrees,
//! builds a block for the shard this validator leads and drives it through
//! the [`Finalizer`]. Failures are logged and the loop keeps going; only
//! closing the stop channel ends it.

use {
    crate::{
        engine::Shared,
        error::Result,
        finalizer::{FinalizeOutcome, Finalizer},
        heights::same_heights,
        types::{candidate_list_hash, Block, BlockSig, SealerKeys, ShardId},
    },
    crossbeam_channel::{select, Receiver, TryRecvError},
    log::*,
    std::sync::Arc,
};

/// What one iteration of the sealing loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SealStep {
    /// Heights disagree; blocks were requested for these shards.
    CatchingUp(Vec<ShardId>),
    /// Caught up, but this validator leads no shard.
    NotLeader,
    /// A block was finalized and committed.
    Sealed { shard: ShardId, height: u64 },
    /// The sealer was stopped mid-way. Nothing was committed.
    Cancelled,
}

pub(crate) struct Sealer {
    shared: Arc<Shared>,
    keys: SealerKeys,
    sig_rx: Receiver<BlockSig>,
    exit: Receiver<()>,
}

impl Sealer {
    pub(crate) fn new(
        shared: Arc<Shared>,
        keys: SealerKeys,
        sig_rx: Receiver<BlockSig>,
        exit: Receiver<()>,
    ) -> Self {
        Self {
            shared,
            keys,
            sig_rx,
            exit,
        }
    }

    fn stopped(&self) -> bool {
        matches!(self.exit.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub(crate) fn run(self) {
        info!("sealer started for {}", self.keys.identity());
        let idle = self.shared.params.seal_idle();
        loop {
            if self.stopped() {
                break;
            }
            if self.shared.is_started() {
                match self.step() {
                    Ok(SealStep::Cancelled) => break,
                    Ok(SealStep::Sealed { shard, height }) => {
                        info!("sealed block {height} on shard {shard}");
                    }
                    Ok(step) => trace!("sealer step: {step:?}"),
                    Err(e) => error!("sealing failed: {e}"),
                }
            }
            select! {
                recv(self.exit) -> _ => break,
                default(idle) => {}
            }
        }
        info!("sealer stopped");
    }

    /// One iteration of the loop.
    pub(crate) fn step(&self) -> Result<SealStep> {
        let known = self.shared.known.snapshot();
        let validated = self.shared.validated.snapshot();
        if !same_heights(&known, &validated) {
            let lagging = self.shared.request_missing_blocks(&known, &validated);
            return Ok(SealStep::CatchingUp(lagging));
        }

        let committee = self.shared.committee.snapshot();
        let Some(shard) = self.shared.config.leader_schedule.my_shard(
            &self.keys.identity(),
            &committee,
            &validated,
        ) else {
            return Ok(SealStep::NotLeader);
        };

        let block = self.create_block(shard, validated)?;
        if self.stopped() {
            return Ok(SealStep::Cancelled);
        }

        let finalizer = Finalizer::new(
            &self.shared.params,
            &self.keys,
            &self.shared.committee,
            self.shared.config.server.clone(),
            &self.sig_rx,
            &self.exit,
        );
        match finalizer.finalize(block)? {
            FinalizeOutcome::Cancelled => Ok(SealStep::Cancelled),
            FinalizeOutcome::Finalized(block) => {
                let height = block.height();
                self.shared.commit_block(block, true)?;
                Ok(SealStep::Sealed { shard, height })
            }
        }
    }

    /// Build a candidate block for `shard` on top of `heights`.
    pub(crate) fn create_block(&self, shard: ShardId, heights: Vec<u64>) -> Result<Block> {
        let mut block = self
            .shared
            .config
            .block_factory
            .new_block_template(&self.keys.payment_address, shard)?;
        block.header.chains_height = heights;
        block.header.shard = shard;
        block.producer = self.keys.identity();
        let candidates = self.shared.config.candidates.candidate_list(&block);
        block.header.candidate_hash = candidate_list_hash(&candidates)?;
        debug!(
            "created block {} on shard {shard} with {} transactions",
            block.height(),
            block.transactions.len()
        );
        Ok(block)
    }
}
