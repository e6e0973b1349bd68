//! Block finalization: collecting a quorum of committee signatures.
//!
//! A candidate block is finalized through a bounded series of attempts.
//! Each attempt:
//!
//! 1. snapshots the committee into the header, hashes the block and puts
//!    the producer's own signature into its committee slot;
//! 2. asks every other committee member for a signature, one request
//!    thread per member, skipping members whose address cannot be resolved;
//! 3. consumes signatures from the intake channel until the quorum is
//!    reached, the sealer is stopped, or the attempt times out.
//!
//! A timed-out attempt starts over with a fresh committee snapshot until
//! the attempt budget is spent. Closing the sealer's stop or intake channel
//! cancels finalization without an error and without touching the chain.

use {
    crate::{
        capabilities::Server,
        committee::CommitteeState,
        config::PposConfig,
        error::{EngineError, Result},
        types::{verify_sig, Block, BlockSig, PeerMessage, SealerKeys},
    },
    crossbeam_channel::{after, select, Receiver},
    log::*,
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    std::{sync::Arc, thread::Builder},
};

/// How a call to [`Finalizer::finalize`] ended without an error.
#[derive(Debug)]
pub enum FinalizeOutcome {
    /// Quorum reached; the block carries its signatures and the producer
    /// signature and is ready to be connected.
    Finalized(Block),
    /// The sealer was stopped while waiting. Nothing was committed.
    Cancelled,
}

/// What happened to a single incoming signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigVerdict {
    /// Counted towards the quorum.
    Accepted,
    /// Counted, and the quorum is now complete.
    QuorumReached,
    /// Sender is not in the committee snapshot.
    NotInCommittee,
    /// The sender's slot is already filled.
    Duplicate,
    /// The signature does not verify against the block hash.
    Invalid,
}

/// Signature slots of one finalization attempt.
#[derive(Debug)]
pub struct SignatureCollector {
    block_hash: Hash,
    committee: Vec<Pubkey>,
    slots: Vec<Option<Signature>>,
    received: usize,
    needed: usize,
}

impl SignatureCollector {
    /// `slots` must be index-aligned with `committee`; pre-filled slots
    /// (the producer's) do not count towards `needed`.
    pub fn new(
        block_hash: Hash,
        committee: Vec<Pubkey>,
        slots: Vec<Option<Signature>>,
        needed: usize,
    ) -> Self {
        Self {
            block_hash,
            committee,
            slots,
            received: 0,
            needed,
        }
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn has_quorum(&self) -> bool {
        self.received >= self.needed
    }

    /// Apply an incoming signature to its committee slot.
    pub fn accept(&mut self, sig: &BlockSig) -> SigVerdict {
        let Some(idx) = self.committee.iter().position(|m| *m == sig.validator) else {
            return SigVerdict::NotInCommittee;
        };
        let Some(slot) = self.slots.get_mut(idx) else {
            return SigVerdict::NotInCommittee;
        };
        if slot.is_some() {
            return SigVerdict::Duplicate;
        }
        if !verify_sig(&sig.validator, &sig.signature, &self.block_hash) {
            return SigVerdict::Invalid;
        }
        *slot = Some(sig.signature);
        self.received = self.received.saturating_add(1);
        if self.has_quorum() {
            SigVerdict::QuorumReached
        } else {
            SigVerdict::Accepted
        }
    }

    pub fn into_slots(self) -> Vec<Option<Signature>> {
        self.slots
    }
}

/// Result of waiting on one attempt.
enum AttemptEnd {
    Quorum,
    Cancelled,
    TimedOut,
}

/// Drives one candidate block to a quorum of signatures.
pub struct Finalizer<'a> {
    config: &'a PposConfig,
    keys: &'a SealerKeys,
    committee: &'a CommitteeState,
    server: Arc<dyn Server>,
    sig_rx: &'a Receiver<BlockSig>,
    exit: &'a Receiver<()>,
}

impl<'a> Finalizer<'a> {
    pub fn new(
        config: &'a PposConfig,
        keys: &'a SealerKeys,
        committee: &'a CommitteeState,
        server: Arc<dyn Server>,
        sig_rx: &'a Receiver<BlockSig>,
        exit: &'a Receiver<()>,
    ) -> Self {
        Self {
            config,
            keys,
            committee,
            server,
            sig_rx,
            exit,
        }
    }

    /// Collect signatures for `block`, retrying timed-out attempts.
    pub fn finalize(&self, mut block: Block) -> Result<FinalizeOutcome> {
        info!(
            "Start finalizing block {} on shard {}",
            block.height(),
            block.shard()
        );
        let producer = self.keys.identity();
        let mut attempts: u32 = 0;

        let slots = loop {
            attempts = attempts.saturating_add(1);

            let committee = self.committee.snapshot();
            let producer_slot = committee
                .iter()
                .position(|member| *member == producer)
                .ok_or(EngineError::NotInCommittee(producer))?;

            block.header.committee = committee.clone();
            block.header.committee_sigs = vec![None; committee.len()];
            let block_hash = block.hash();
            let mut slots = vec![None; committee.len()];
            if let Some(slot) = slots.get_mut(producer_slot) {
                *slot = Some(self.keys.sign(block_hash.as_ref()));
            }

            let mut collector = SignatureCollector::new(
                block_hash,
                committee,
                slots,
                self.config.external_sigs_needed(),
            );
            if collector.has_quorum() {
                break collector.into_slots();
            }

            block.header.committee_sigs = collector.slots.clone();
            self.request_signatures(&block, producer);

            match self.wait_for_quorum(&mut collector) {
                AttemptEnd::Quorum => break collector.into_slots(),
                AttemptEnd::Cancelled => {
                    info!("finalization of block {} cancelled", block.height());
                    return Ok(FinalizeOutcome::Cancelled);
                }
                AttemptEnd::TimedOut => {
                    warn!(
                        "block signature wait time exceeded (attempt {attempts}, {} of {} \
                         signatures)",
                        collector.received(),
                        self.config.external_sigs_needed()
                    );
                    if attempts >= self.config.max_finalize_attempts {
                        return Err(EngineError::ExceededRetryLimit { attempts });
                    }
                    info!(
                        "Start finalizing block {} again, attempt {}",
                        block.height(),
                        attempts.saturating_add(1)
                    );
                }
            }
        };

        block.header.committee_sigs = slots;
        block.producer_sig = Some(self.keys.sign(&block.header_bytes()?));
        debug!(
            "block {} finalized with {} signatures",
            block.height(),
            block.filled_sigs()
        );
        Ok(FinalizeOutcome::Finalized(block))
    }

    /// Ask every committee member except the producer for a signature.
    ///
    /// Each member gets its own thread. Unresolvable members and failed
    /// sends are logged and skipped for this attempt.
    fn request_signatures(&self, block: &Block, producer: Pubkey) {
        let block = Arc::new(block.clone());
        for validator in block.header.committee.iter().copied() {
            if validator == producer {
                continue;
            }
            let server = self.server.clone();
            let block = block.clone();
            let spawned = Builder::new()
                .name("pposSigRequest".to_string())
                .spawn(move || {
                    let peers = server.resolve_peers(&validator);
                    let Some(addr) = peers.first().copied() else {
                        warn!("peer of validator {validator} not found");
                        return;
                    };
                    debug!("request signature of {validator} from {addr}");
                    let message = PeerMessage::BlockSigRequest(Block::clone(&block));
                    if let Err(e) = server.send_to_peer(message, addr) {
                        warn!("failed to request signature from {validator}: {e}");
                    }
                });
            if let Err(e) = spawned {
                error!("failed to spawn signature request for {validator}: {e}");
            }
        }
    }

    /// Wait for the first of: quorum, stop, attempt timeout.
    fn wait_for_quorum(&self, collector: &mut SignatureCollector) -> AttemptEnd {
        let deadline = after(self.config.block_sig_wait());
        loop {
            select! {
                recv(self.exit) -> _ => return AttemptEnd::Cancelled,
                recv(self.sig_rx) -> msg => {
                    let Ok(sig) = msg else {
                        return AttemptEnd::Cancelled;
                    };
                    match collector.accept(&sig) {
                        SigVerdict::QuorumReached => {
                            info!(
                                "validator signature received from {}, quorum reached",
                                sig.validator
                            );
                            return AttemptEnd::Quorum;
                        }
                        SigVerdict::Accepted => {
                            info!(
                                "validator signature received from {} ({})",
                                sig.validator,
                                collector.received()
                            );
                        }
                        SigVerdict::Duplicate => {
                            warn!("already received block signature of {}", sig.validator);
                        }
                        SigVerdict::NotInCommittee => {
                            warn!("block signature from non-committee validator {}", sig.validator);
                        }
                        SigVerdict::Invalid => {
                            error!("invalid block signature from {}", sig.validator);
                        }
                    }
                },
                recv(deadline) -> _ => return AttemptEnd::TimedOut,
            }
        }
    }
}
