//! Engine lifecycle and the commit path.
//!
//! [`Engine`] owns the height trackers, the committee and the background
//! threads:
//!
//! - `pposChainState` periodically asks peers for their chain state;
//! - `pposBlockIntake` processes blocks finalized by other validators;
//! - `pposSealer` runs the sealing loop while a sealer is started.
//!
//! Every thread watches a zero-capacity stop channel whose only sender is
//! held by the engine; dropping that sender stops the thread. `start`,
//! `stop`, `start_sealer` and `stop_sealer` are serialized by the lifecycle
//! mutex, which the signature and block intake paths never take.

use {
    crate::{
        capabilities::EngineConfig,
        committee::{CommitteeState, ValidatorStats},
        config::PposConfig,
        error::{EngineError, Result},
        heights::{lagging_shards, ChainHeights},
        sealer::Sealer,
        types::{
            candidate_list_hash, verify_sig, Block, BlockSig, ChainInfo, PeerMessage, SealerKeys,
            ShardId,
        },
    },
    crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError},
    log::*,
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        },
        thread::{self, Builder, JoinHandle},
    },
};

/// What the block intake did with an external block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDisposition {
    /// At or below the validated height; dropped.
    Stale,
    /// More than one block ahead; only the known height was raised.
    Ahead,
    /// Verified and committed.
    Committed,
}

fn shard_ids(total_shards: usize) -> impl Iterator<Item = ShardId> {
    (0..total_shards).filter_map(|shard| ShardId::try_from(shard).ok())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the engine handle and its threads.
pub(crate) struct Shared {
    pub(crate) params: PposConfig,
    pub(crate) config: EngineConfig,
    started: AtomicBool,
    sealer_started: AtomicBool,
    pub(crate) known: ChainHeights,
    pub(crate) validated: ChainHeights,
    pub(crate) committee: CommitteeState,
    sealer_keys: RwLock<Option<SealerKeys>>,
    /// Height and hash of the last block signed on request, per shard.
    signed: Mutex<HashMap<ShardId, (u64, Hash)>>,
    sig_tx: RwLock<Option<Sender<BlockSig>>>,
    block_tx: RwLock<Option<Sender<Block>>>,
}

impl Shared {
    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Replay every shard of the local chain, one thread per shard.
    fn replay_local_chain(&self) -> Result<()> {
        info!("replaying local chain");
        thread::scope(|scope| -> Result<()> {
            let handles = shard_ids(self.params.total_shards)
                .map(|shard| {
                    Builder::new()
                        .name(format!("pposReplay{shard}"))
                        .spawn_scoped(scope, move || self.replay_shard(shard))
                })
                .collect::<std::io::Result<Vec<_>>>()?;

            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(EngineError::BlockChain("replay thread panicked".to_string()))
                    })
                })
                .collect::<Result<Vec<()>>>()
                .map(|_| ())
        })
    }

    /// Validate heights `2..=known` of `shard` in order.
    fn replay_shard(&self, shard: ShardId) -> Result<()> {
        let chain = &self.config.block_chain;
        let target = self.known.get(shard);
        for height in 2..=target {
            let block = chain.block_by_height(shard, height)?;
            chain.validate_block_sanity(&block)?;
            chain.build_view_point(&block)?;
            match self.config.fee_estimator(shard) {
                Some(estimator) => estimator.register_block(&block).map_err(|e| {
                    EngineError::FeeEstimator(format!("shard {shard} height {height}: {e}"))
                })?,
                None => debug!("no fee estimator for shard {shard}"),
            }
            self.validated.set(shard, height);
        }
        debug!("shard {shard} replayed up to height {target}");
        Ok(())
    }

    /// Broadcast a `GetBlocks` for every shard whose known height is ahead.
    pub(crate) fn request_missing_blocks(
        &self,
        known: &[u64],
        validated: &[u64],
    ) -> Vec<ShardId> {
        let lagging = lagging_shards(known, validated);
        for shard in &lagging {
            let best = self.config.block_chain.best_state(*shard);
            debug!(
                "shard {shard} behind: known {}, validated {}",
                self.known.get(*shard),
                self.validated.get(*shard)
            );
            let message = PeerMessage::GetBlocks {
                shard: *shard,
                last_block_hash: best.best_block_hash,
            };
            let kind = message.kind();
            if let Err(e) = self.config.server.broadcast_to_all(message) {
                warn!("failed to broadcast {kind} for shard {shard}: {e}");
            }
        }
        lagging
    }

    /// Commit a finalized block and update heights and the committee.
    ///
    /// Only a failing `connect_block` aborts; later steps are logged.
    pub(crate) fn commit_block(&self, block: Block, own: bool) -> Result<()> {
        let shard = block.shard();
        let height = block.height();
        let chain = &self.config.block_chain;
        chain.connect_block(&block)?;

        match self.config.fee_estimator(shard) {
            Some(estimator) => {
                if let Err(e) = estimator.register_block(&block) {
                    warn!("fee estimator rejected block {height} on shard {shard}: {e}");
                }
            }
            None => debug!("no fee estimator for shard {shard}"),
        }
        for tx in &block.transactions {
            self.config.mem_pool.remove_transaction(tx);
        }

        let candidates = self.config.candidates.candidate_list(&block);
        if let Err(e) = chain.update_best_state(&block, candidates) {
            error!("failed to update best state of shard {shard}: {e}");
        }
        if let Err(e) = chain.store_best_state(shard) {
            error!("failed to store best state of shard {shard}: {e}");
        }

        let raised = self.known.raise(shard, height);
        self.validated.set(shard, height);
        self.committee.record_block(
            &block.producer,
            &block.header.committee,
            &block.header.committee_sigs,
        );
        info!("block {height} committed on shard {shard}");

        if own || raised {
            let message = PeerMessage::Block(block);
            let kind = message.kind();
            if let Err(e) = self.config.server.broadcast_to_all(message) {
                warn!("failed to broadcast {kind} {height} of shard {shard}: {e}");
            }
        }
        Ok(())
    }

    /// Check that `block` extends the validated tip of its shard, was built
    /// against the local committee and comes from the shard's leader.
    fn check_block_context(&self, block: &Block) -> Result<()> {
        let shard = block.shard();
        let height = block.height();
        let validated = self.validated.snapshot();
        let expected = validated
            .get(usize::from(shard))
            .map(|tip| tip.saturating_add(1))
            .ok_or_else(|| EngineError::InvalidBlock(format!("unknown shard {shard}")))?;
        if height != expected {
            return Err(EngineError::InvalidBlock(format!(
                "block {height} on shard {shard} does not extend validated height {}",
                expected.saturating_sub(1)
            )));
        }

        let committee = self.committee.snapshot();
        if block.header.committee != committee {
            return Err(EngineError::InvalidBlock(format!(
                "block {height} on shard {shard} carries a foreign committee"
            )));
        }
        let leads = self
            .config
            .leader_schedule
            .my_shard(&block.producer, &committee, &validated);
        if leads != Some(shard) {
            return Err(EngineError::InvalidBlock(format!(
                "{} does not lead shard {shard}",
                block.producer
            )));
        }
        Ok(())
    }

    /// Check a block finalized elsewhere before it is committed.
    fn verify_external_block(&self, block: &Block) -> Result<()> {
        self.config.block_chain.validate_block_sanity(block)?;
        self.check_block_context(block)?;

        let header = &block.header;
        if header.committee.len() != header.committee_sigs.len() {
            return Err(EngineError::InvalidBlock(format!(
                "{} signature slots for a committee of {}",
                header.committee_sigs.len(),
                header.committee.len()
            )));
        }
        let hash = block.hash();
        let mut signers: Vec<&Pubkey> = header
            .committee
            .iter()
            .zip(&header.committee_sigs)
            .filter_map(|(member, sig)| sig.as_ref().map(|sig| (member, sig)))
            .filter(|(member, sig)| verify_sig(member, sig, &hash))
            .map(|(member, _)| member)
            .collect();
        signers.sort_unstable();
        signers.dedup();
        if signers.len() < self.params.min_quorum_sigs {
            return Err(EngineError::InvalidBlock(format!(
                "{} valid signatures, {} needed",
                signers.len(),
                self.params.min_quorum_sigs
            )));
        }

        let header_bytes = block.header_bytes()?;
        let producer_ok = block
            .producer_sig
            .as_ref()
            .is_some_and(|sig| sig.verify(block.producer.as_ref(), &header_bytes));
        if !producer_ok {
            return Err(EngineError::InvalidBlock(
                "missing or invalid producer signature".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn process_new_block(&self, block: Block) -> Result<BlockDisposition> {
        let shard = block.shard();
        let height = block.height();
        if usize::from(shard) >= self.params.total_shards {
            return Err(EngineError::InvalidBlock(format!("unknown shard {shard}")));
        }

        let validated = self.validated.get(shard);
        if height <= validated {
            debug!("stale block {height} on shard {shard}, validated {validated}");
            return Ok(BlockDisposition::Stale);
        }
        if height > validated.saturating_add(1) {
            debug!("block {height} on shard {shard} is ahead of validated {validated}");
            self.known.raise(shard, height);
            return Ok(BlockDisposition::Ahead);
        }

        self.verify_external_block(&block)?;
        self.commit_block(block, false)?;
        Ok(BlockDisposition::Committed)
    }

    fn chain_state_loop(&self, exit: &Receiver<()>) {
        let interval = self.params.chain_state_interval();
        loop {
            select! {
                recv(exit) -> _ => break,
                default(interval) => {
                    if let Err(e) = self.config.server.broadcast_chain_state_request() {
                        warn!("failed to broadcast chain state request: {e}");
                    }
                }
            }
        }
        debug!("chain state loop exited");
    }

    fn block_intake_loop(&self, block_rx: &Receiver<Block>, exit: &Receiver<()>) {
        loop {
            select! {
                recv(exit) -> _ => break,
                recv(block_rx) -> msg => {
                    let Ok(block) = msg else {
                        break;
                    };
                    let (shard, height) = (block.shard(), block.height());
                    match self.process_new_block(block) {
                        Ok(disposition) => {
                            trace!("block {height} on shard {shard}: {disposition:?}");
                        }
                        Err(e) => warn!("rejected block {height} on shard {shard}: {e}"),
                    }
                },
            }
        }
        debug!("block intake loop exited");
    }
}

struct SealerHandle {
    exit: Sender<()>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    exit: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
    sealer: Option<SealerHandle>,
}

/// The parallel proof-of-stake consensus engine.
pub struct Engine {
    pub(crate) shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl Engine {
    /// Build an engine. Nothing runs until [`Engine::start`].
    pub fn init(params: PposConfig, config: EngineConfig) -> Result<Self> {
        params.validate()?;
        let total = params.total_shards;
        let sealer_keys = config.sealer_keys.clone();
        let shared = Shared {
            committee: CommitteeState::new(params.reliability),
            known: ChainHeights::new(total),
            validated: ChainHeights::new(total),
            started: AtomicBool::new(false),
            sealer_started: AtomicBool::new(false),
            sealer_keys: RwLock::new(sealer_keys),
            signed: Mutex::new(HashMap::new()),
            sig_tx: RwLock::new(None),
            block_tx: RwLock::new(None),
            params,
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sync heights with the local chain and launch the background threads.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle();
        if self.shared.is_started() {
            return Err(EngineError::AlreadyStarted);
        }
        let shared = &self.shared;

        for shard in shard_ids(shared.params.total_shards) {
            let best = shared.config.block_chain.best_height(shard);
            shared.known.set(shard, best);
            shared.validated.set(shard, best.min(1));
        }
        shared.committee.reset(shared.config.genesis_committee.clone());

        if shared.config.fast_start {
            info!("fast start: trusting local chain heights");
            shared.validated.reset_to(&shared.known.snapshot());
        } else {
            shared.replay_local_chain()?;
        }

        let (exit_tx, exit_rx) = bounded::<()>(0);
        let (block_tx, block_rx) = bounded(shared.params.intake_buffer_size);

        let chain_state = {
            let shared = shared.clone();
            let exit = exit_rx.clone();
            Builder::new()
                .name("pposChainState".to_string())
                .spawn(move || shared.chain_state_loop(&exit))?
        };
        let block_intake = {
            let shared = shared.clone();
            Builder::new()
                .name("pposBlockIntake".to_string())
                .spawn(move || shared.block_intake_loop(&block_rx, &exit_rx))?
        };

        *write(&shared.block_tx) = Some(block_tx);
        lifecycle.exit = Some(exit_tx);
        lifecycle.workers = vec![chain_state, block_intake];
        shared.started.store(true, Ordering::Release);
        info!(
            "consensus engine started: known {:?}, validated {:?}",
            shared.known.snapshot(),
            shared.validated.snapshot()
        );
        Ok(())
    }

    /// Stop the sealer and the background threads.
    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle();
        if !self.shared.is_started() {
            return Err(EngineError::NotStarted);
        }
        self.stop_sealer_locked(&mut lifecycle);

        *write(&self.shared.block_tx) = None;
        drop(lifecycle.exit.take());
        for worker in lifecycle.workers.drain(..) {
            if worker.join().is_err() {
                error!("consensus worker thread panicked");
            }
        }
        self.shared.started.store(false, Ordering::Release);
        info!("consensus engine stopped");
        Ok(())
    }

    /// Install `keys` and spawn the sealing loop. A no-op if one runs.
    pub fn start_sealer(&self, keys: SealerKeys) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.sealer.is_some() {
            info!("sealer already started");
            return Ok(());
        }

        let (sig_tx, sig_rx) = bounded(self.shared.params.intake_buffer_size);
        let (exit_tx, exit_rx) = bounded::<()>(0);
        *write(&self.shared.sealer_keys) = Some(keys.clone());

        let sealer = Sealer::new(self.shared.clone(), keys, sig_rx, exit_rx);
        let thread = Builder::new()
            .name("pposSealer".to_string())
            .spawn(move || sealer.run())?;

        *write(&self.shared.sig_tx) = Some(sig_tx);
        self.shared.sealer_started.store(true, Ordering::Release);
        lifecycle.sealer = Some(SealerHandle {
            exit: exit_tx,
            thread,
        });
        Ok(())
    }

    /// Stop the sealing loop, cancelling any finalization in flight.
    pub fn stop_sealer(&self) {
        let mut lifecycle = self.lock_lifecycle();
        self.stop_sealer_locked(&mut lifecycle);
    }

    fn stop_sealer_locked(&self, lifecycle: &mut Lifecycle) {
        let Some(SealerHandle { exit, thread }) = lifecycle.sealer.take() else {
            debug!("sealer not running");
            return;
        };
        *write(&self.shared.sig_tx) = None;
        drop(exit);
        if thread.join().is_err() {
            error!("sealer thread panicked");
        }
        self.shared.sealer_started.store(false, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.shared.is_started()
    }

    pub fn is_sealer_started(&self) -> bool {
        self.shared.sealer_started.load(Ordering::Acquire)
    }

    /// Hand a committee signature to the running finalizer. Never blocks.
    /// Returns whether the signature was queued.
    pub fn on_block_sig(&self, sig: BlockSig) -> bool {
        let guard = read(&self.shared.sig_tx);
        let Some(sig_tx) = guard.as_ref() else {
            debug!("sealer stopped, dropping signature of {}", sig.validator);
            return false;
        };
        match sig_tx.try_send(sig) {
            Ok(()) => true,
            Err(TrySendError::Full(sig)) => {
                warn!("signature intake full, dropping signature of {}", sig.validator);
                false
            }
            Err(TrySendError::Disconnected(sig)) => {
                debug!("sealer stopped, dropping signature of {}", sig.validator);
                false
            }
        }
    }

    /// Queue a block finalized by another validator. Never blocks.
    /// Returns whether the block was queued.
    pub fn on_new_block(&self, block: Block) -> bool {
        let guard = read(&self.shared.block_tx);
        let Some(block_tx) = guard.as_ref() else {
            debug!("engine stopped, dropping block {}", block.height());
            return false;
        };
        match block_tx.try_send(block) {
            Ok(()) => true,
            Err(e) => {
                warn!("block intake unavailable, dropping block {}", e.into_inner().height());
                false
            }
        }
    }

    /// Raise known heights to what a peer reports.
    pub fn on_chain_state(&self, info: &ChainInfo) {
        let total = self.shared.params.total_shards;
        for (shard, height) in shard_ids(total).zip(&info.chains_height) {
            if self.shared.known.raise(shard, *height) {
                debug!("peer reports shard {shard} at height {height}");
            }
        }
    }

    /// This node's chain state, sent in answer to a peer's request.
    pub fn chain_info(&self) -> Result<ChainInfo> {
        let best = self.shared.config.block_chain.best_state(0);
        Ok(ChainInfo {
            current_committee: self.shared.committee.snapshot(),
            candidate_list_hash: candidate_list_hash(&best.candidates)?,
            chains_height: self.shared.validated.snapshot(),
        })
    }

    /// Sign a candidate block another committee member asked us for.
    ///
    /// Only a block from the shard's leader, on top of the validated tip and
    /// against the local committee is signed, and at most one block per
    /// shard height. Asking again for the same block returns a fresh
    /// signature over the same hash.
    pub fn sign_block_request(&self, block: &Block) -> Result<BlockSig> {
        let keys = read(&self.shared.sealer_keys)
            .clone()
            .ok_or(EngineError::NotStarted)?;
        if !self.shared.committee.contains(&keys.identity()) {
            return Err(EngineError::NotInCommittee(keys.identity()));
        }
        self.shared.config.block_chain.validate_block_sanity(block)?;
        self.shared.check_block_context(block)?;

        let (shard, height, hash) = (block.shard(), block.height(), block.hash());
        {
            let mut signed = self
                .shared
                .signed
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match signed.get(&shard) {
                Some((signed_height, signed_hash))
                    if *signed_height == height && *signed_hash != hash =>
                {
                    return Err(EngineError::ConflictingBlock { shard, height });
                }
                _ => {
                    signed.insert(shard, (height, hash));
                }
            }
        }
        debug!(
            "signing block {} of shard {} for {}",
            block.height(),
            block.shard(),
            block.producer
        );
        Ok(keys.sign_block(block))
    }

    pub fn committee(&self) -> Vec<Pubkey> {
        self.shared.committee.snapshot()
    }

    pub fn validator_stats(&self, validator: &Pubkey) -> ValidatorStats {
        self.shared.committee.stats(validator)
    }

    /// Known and validated heights, in that order.
    pub fn heights(&self) -> (Vec<u64>, Vec<u64>) {
        (
            self.shared.known.snapshot(),
            self.shared.validated.snapshot(),
        )
    }
}
