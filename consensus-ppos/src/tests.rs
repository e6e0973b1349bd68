//! Engine scenarios driven against the in-memory collaborators.

use {
    crate::{
        capabilities::{EngineConfig, FeeEstimator},
        config::PposConfig,
        engine::{BlockDisposition, Engine},
        error::EngineError,
        leader::CommitteeOrderSchedule,
        sealer::{SealStep, Sealer},
        test_utils::{
            init_logging, make_template, seal_block, MemoryChain, RecordingFeeEstimator,
            RecordingMemPool, ResponderServer, StaticCandidates, TemplateFactory,
        },
        types::{candidate_list_hash, verify_sig, ChainInfo, PeerMessage, SealerKeys},
        BlockChain,
    },
    assert_matches::assert_matches,
    crossbeam_channel::{bounded, Sender},
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_signer::Signer,
    std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    },
    test_case::test_case,
};

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Node {
    params: PposConfig,
    keypairs: Vec<Arc<Keypair>>,
    keys: SealerKeys,
    chain: Arc<MemoryChain>,
    server: Arc<ResponderServer>,
    factory: Arc<TemplateFactory>,
    mem_pool: Arc<RecordingMemPool>,
    estimators: Vec<Arc<RecordingFeeEstimator>>,
    candidates: Vec<Pubkey>,
    fast_start: bool,
    preset_keys: Option<SealerKeys>,
}

impl Node {
    /// A node leading shard 0 of a committee sized to `heights`.
    fn with_params(params: PposConfig, heights: &[u64]) -> Self {
        init_logging();
        let keypairs: Vec<Arc<Keypair>> = (0..params.total_shards)
            .map(|_| Arc::new(Keypair::new()))
            .collect();
        let keys = SealerKeys::new(keypairs[0].clone(), Keypair::new().pubkey());
        let chain = Arc::new(MemoryChain::with_heights(heights));
        let factory = Arc::new(TemplateFactory::new(chain.clone()));
        let estimators = (0..params.total_shards)
            .map(|_| Arc::new(RecordingFeeEstimator::default()))
            .collect();
        let candidates = vec![Keypair::new().pubkey(), Keypair::new().pubkey()];
        Self {
            params,
            keypairs,
            keys,
            chain,
            server: Arc::new(ResponderServer::default()),
            factory,
            mem_pool: Arc::new(RecordingMemPool::default()),
            estimators,
            candidates,
            fast_start: false,
            preset_keys: None,
        }
    }

    fn new(heights: &[u64]) -> Self {
        Self::with_params(PposConfig::dev_default(), heights)
    }

    fn committee(&self) -> Vec<Pubkey> {
        self.keypairs.iter().map(|kp| kp.pubkey()).collect()
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            block_chain: self.chain.clone(),
            mem_pool: self.mem_pool.clone(),
            server: self.server.clone(),
            block_factory: self.factory.clone(),
            candidates: Arc::new(StaticCandidates(self.candidates.clone())),
            leader_schedule: Arc::new(CommitteeOrderSchedule::new(self.params.total_shards)),
            fee_estimators: self
                .estimators
                .iter()
                .map(|e| e.clone() as Arc<dyn FeeEstimator>)
                .collect(),
            genesis_committee: self.committee(),
            fast_start: self.fast_start,
            sealer_keys: self.preset_keys.clone(),
        }
    }

    fn engine(&self) -> Engine {
        Engine::init(self.params.clone(), self.engine_config()).unwrap()
    }

    fn started_engine(&self) -> Engine {
        let engine = self.engine();
        engine.start().unwrap();
        engine
    }

    /// A sealer that can be stepped by hand. Signatures from responders go
    /// straight into its intake.
    fn sealer(&self, engine: &Engine) -> (Sealer, Sender<()>) {
        let (sig_tx, sig_rx) = bounded(self.params.intake_buffer_size);
        let (exit_tx, exit_rx) = bounded(0);
        self.server.set_sink(move |sig| {
            let _ = sig_tx.send(sig);
        });
        let sealer = Sealer::new(engine.shared.clone(), self.keys.clone(), sig_rx, exit_rx);
        (sealer, exit_tx)
    }

    /// Route responder signatures through `Engine::on_block_sig`.
    fn wire_engine(&self, engine: &Arc<Engine>) {
        let weak = Arc::downgrade(engine);
        self.server.set_sink(move |sig| {
            if let Some(engine) = weak.upgrade() {
                engine.on_block_sig(sig);
            }
        });
    }
}

fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn assert_heights_invariant(engine: &Engine) {
    let (known, validated) = engine.heights();
    for (k, v) in known.iter().zip(&validated) {
        assert!(v <= k, "validated {validated:?} ahead of known {known:?}");
    }
}

// ===========================================================================
// 1. Lifecycle
// ===========================================================================

#[test]
fn start_replays_local_chain() {
    let node = Node::new(&[3, 1, 4, 2]);
    let engine = node.started_engine();

    assert!(engine.is_started());
    let (known, validated) = engine.heights();
    assert_eq!(known, vec![3, 1, 4, 2]);
    assert_eq!(validated, vec![3, 1, 4, 2]);
    assert_eq!(node.chain.view_points().len(), 6);
    assert_eq!(node.estimators[2].registered(), vec![2, 3, 4]);
    assert!(node.estimators[1].registered().is_empty());
    assert_eq!(engine.committee(), node.committee());
    engine.stop().unwrap();
}

#[test]
fn start_on_empty_chain_keeps_invariant() {
    let node = Node::new(&[0, 0, 0, 0]);
    let engine = node.started_engine();
    assert_eq!(engine.heights(), (vec![0; 4], vec![0; 4]));
    assert_heights_invariant(&engine);
    engine.stop().unwrap();
}

#[test]
fn replay_failure_aborts_start() {
    let node = Node::new(&[3, 3, 3, 3]);
    node.chain.break_block(1, 3);
    let engine = node.engine();

    assert_matches!(engine.start(), Err(EngineError::InvalidBlock(_)));
    assert!(!engine.is_started());
    assert_heights_invariant(&engine);
    assert_matches!(engine.stop(), Err(EngineError::NotStarted));
}

#[test]
fn fast_start_trusts_local_heights() {
    let mut node = Node::new(&[3, 5, 2, 4]);
    node.fast_start = true;
    node.chain.break_block(1, 3);
    let engine = node.started_engine();

    let (known, validated) = engine.heights();
    assert_eq!(validated, known);
    assert_eq!(validated, vec![3, 5, 2, 4]);
    assert!(node.chain.view_points().is_empty());
    engine.stop().unwrap();
}

#[test]
fn lifecycle_errors() {
    let node = Node::new(&[1, 1, 1, 1]);
    let engine = node.engine();

    assert_matches!(engine.stop(), Err(EngineError::NotStarted));
    engine.start().unwrap();
    assert_matches!(engine.start(), Err(EngineError::AlreadyStarted));
    engine.stop().unwrap();
    assert!(!engine.is_started());
    assert_matches!(engine.stop(), Err(EngineError::NotStarted));

    // A stopped engine can be started again.
    engine.start().unwrap();
    engine.stop().unwrap();
}

#[test_case(0, 1 ; "no shards")]
#[test_case(4, 0 ; "zero quorum")]
#[test_case(4, 5 ; "quorum above committee")]
fn init_rejects_invalid_config(total_shards: usize, min_quorum_sigs: usize) {
    let node = Node::new(&[1, 1, 1, 1]);
    let params = PposConfig {
        total_shards,
        min_quorum_sigs,
        ..PposConfig::dev_default()
    };
    assert_matches!(
        Engine::init(params, node.engine_config()).err(),
        Some(EngineError::Config(_))
    );
}

#[test]
fn start_sealer_twice_is_a_noop() {
    let node = Node::new(&[1, 1, 1, 1]);
    let engine = node.engine();
    assert!(!engine.is_sealer_started());

    engine.start_sealer(node.keys.clone()).unwrap();
    engine.start_sealer(node.keys.clone()).unwrap();
    assert!(engine.is_sealer_started());

    engine.stop_sealer();
    assert!(!engine.is_sealer_started());
    engine.stop_sealer();
}

// ===========================================================================
// 2. Sealing
// ===========================================================================

#[test]
fn seal_commits_with_quorum() {
    let node = Node::new(&[1, 1, 1, 1]);
    node.server.respond_with(&node.keypairs[1]);
    node.server.respond_with(&node.keypairs[2]);
    let engine = node.started_engine();
    let (sealer, _exit) = node.sealer(&engine);

    assert_eq!(
        sealer.step().unwrap(),
        SealStep::Sealed {
            shard: 0,
            height: 2
        }
    );

    let connected = node.chain.connected();
    assert_eq!(connected.len(), 1);
    let block = &connected[0];
    assert_eq!(block.producer, node.keys.identity());
    assert_eq!(block.header.chains_height, vec![1, 1, 1, 1]);
    assert_eq!(block.header.committee, node.committee());
    assert_eq!(block.filled_sigs(), 3);
    assert!(block.header.committee_sigs[3].is_none());
    assert_eq!(
        block.header.candidate_hash,
        candidate_list_hash(&node.candidates).unwrap()
    );
    let hash = block.hash();
    for (member, sig) in block.header.committee.iter().zip(&block.header.committee_sigs) {
        if let Some(sig) = sig {
            assert!(verify_sig(member, sig, &hash));
        }
    }

    let (known, validated) = engine.heights();
    assert_eq!(known, vec![2, 1, 1, 1]);
    assert_eq!(validated, vec![2, 1, 1, 1]);
    assert_eq!(node.estimators[0].registered(), vec![2]);
    assert_eq!(node.mem_pool.removed(), block.transactions);
    assert_eq!(node.chain.best_state(0).candidates, node.candidates);
    assert_eq!(node.chain.stored_count(), 1);
    assert!(node
        .server
        .broadcasts()
        .iter()
        .any(|msg| *msg == PeerMessage::Block(block.clone())));

    assert_eq!(engine.validator_stats(&node.keypairs[0].pubkey()).blocks_produced, 1);
    assert_eq!(engine.validator_stats(&node.keypairs[1].pubkey()).reliability, 1);
    assert_eq!(engine.validator_stats(&node.keypairs[2].pubkey()).reliability, 1);
    assert_eq!(engine.validator_stats(&node.keypairs[3].pubkey()).reliability, 0);
    engine.stop().unwrap();
}

#[test]
fn seal_without_signatures_exceeds_retry_limit() {
    let node = Node::new(&[1, 1, 1, 1]);
    let engine = node.started_engine();
    let (sealer, _exit) = node.sealer(&engine);
    let before = engine.heights();

    assert_matches!(
        sealer.step(),
        Err(EngineError::ExceededRetryLimit { attempts: 5 })
    );
    assert!(node.chain.connected().is_empty());
    assert_eq!(engine.heights(), before);
    assert_eq!(node.factory.calls(), 1);
    assert_eq!(engine.validator_stats(&node.keys.identity()).blocks_produced, 0);
    engine.stop().unwrap();
}

#[test_case(1 ; "single attempt")]
#[test_case(6 ; "one retry more than default")]
fn retry_limit_counts_every_attempt(max_attempts: u32) {
    let params = PposConfig {
        max_finalize_attempts: max_attempts,
        ..PposConfig::dev_default()
    };
    let node = Node::with_params(params, &[1, 1, 1, 1]);
    let engine = node.started_engine();
    let (sealer, _exit) = node.sealer(&engine);

    assert_matches!(
        sealer.step(),
        Err(EngineError::ExceededRetryLimit { attempts }) if attempts == max_attempts
    );
    assert!(node.chain.connected().is_empty());
    engine.stop().unwrap();
}

#[test]
fn lagging_node_requests_blocks_instead_of_sealing() {
    let params = PposConfig {
        total_shards: 2,
        min_quorum_sigs: 2,
        ..PposConfig::dev_default()
    };
    let node = Node::with_params(params, &[5, 5]);
    let engine = node.started_engine();
    engine.shared.validated.set(1, 3);
    let (sealer, _exit) = node.sealer(&engine);

    assert_eq!(sealer.step().unwrap(), SealStep::CatchingUp(vec![1]));
    assert_eq!(node.factory.calls(), 0);
    let expected = PeerMessage::GetBlocks {
        shard: 1,
        last_block_hash: node.chain.best_state(1).best_block_hash,
    };
    assert_eq!(node.server.broadcasts(), vec![expected]);
    engine.stop().unwrap();
}

#[test]
fn outsider_does_not_lead() {
    let mut node = Node::new(&[1, 1, 1, 1]);
    node.keys = SealerKeys::new(Arc::new(Keypair::new()), Keypair::new().pubkey());
    let engine = node.started_engine();
    let (sealer, _exit) = node.sealer(&engine);

    assert_eq!(sealer.step().unwrap(), SealStep::NotLeader);
    assert_eq!(node.factory.calls(), 0);
    engine.stop().unwrap();
}

#[test]
fn factory_error_surfaces() {
    let node = Node::new(&[1, 1, 1, 1]);
    node.factory.set_failing(true);
    let engine = node.started_engine();
    let (sealer, _exit) = node.sealer(&engine);

    assert_matches!(sealer.step(), Err(EngineError::BlockFactory(_)));
    assert_eq!(node.factory.calls(), 1);
    assert!(node.chain.connected().is_empty());
    engine.stop().unwrap();
}

#[test]
fn sealer_thread_commits_consecutive_blocks() {
    let node = Node::new(&[1, 1, 1, 1]);
    node.server.respond_with(&node.keypairs[1]);
    node.server.respond_with(&node.keypairs[2]);
    let engine = Arc::new(node.engine());
    node.wire_engine(&engine);

    engine.start().unwrap();
    engine.start_sealer(node.keys.clone()).unwrap();
    assert!(wait_for(|| node.chain.connected().len() >= 2));
    engine.stop().unwrap();
    assert!(!engine.is_sealer_started());

    let connected = node.chain.connected();
    assert_eq!(connected[0].height(), 2);
    assert_eq!(connected[1].height(), 3);
    assert!(connected.iter().all(|b| b.shard() == 0 && b.filled_sigs() >= 3));
    assert_heights_invariant(&engine);
}

#[test]
fn stop_sealer_cancels_finalization() {
    let mut node = Node::new(&[1, 1, 1, 1]);
    node.params.block_sig_wait_ms = 60_000;
    let engine = Arc::new(node.engine());
    node.wire_engine(&engine);

    engine.start().unwrap();
    engine.start_sealer(node.keys.clone()).unwrap();
    assert!(wait_for(|| node.factory.calls() >= 1));
    thread::sleep(Duration::from_millis(20));

    let stopping = Instant::now();
    engine.stop_sealer();
    assert!(stopping.elapsed() < Duration::from_secs(5));
    assert!(!engine.is_sealer_started());
    assert!(node.chain.connected().is_empty());
    assert_eq!(engine.heights().1, vec![1; 4]);
    engine.stop().unwrap();
}

// ===========================================================================
// 3. Chain state and external blocks
// ===========================================================================

#[test]
fn chain_state_raises_known_heights() {
    let node = Node::new(&[2, 2, 2, 2]);
    let engine = node.started_engine();

    engine.on_chain_state(&ChainInfo {
        current_committee: vec![],
        candidate_list_hash: candidate_list_hash(&[]).unwrap(),
        chains_height: vec![5, 1, 2, 9, 7],
    });
    let (known, validated) = engine.heights();
    assert_eq!(known, vec![5, 2, 2, 9]);
    assert_eq!(validated, vec![2, 2, 2, 2]);
    engine.stop().unwrap();
}

#[test]
fn chain_info_reports_validated_state() {
    let node = Node::new(&[3, 2, 2, 2]);
    let engine = node.started_engine();
    engine.on_chain_state(&ChainInfo {
        current_committee: vec![],
        candidate_list_hash: candidate_list_hash(&[]).unwrap(),
        chains_height: vec![8, 2, 2, 2],
    });

    let info = engine.chain_info().unwrap();
    assert_eq!(info.chains_height, vec![3, 2, 2, 2]);
    assert_eq!(info.current_committee, node.committee());
    assert_eq!(info.candidate_list_hash, candidate_list_hash(&[]).unwrap());
    engine.stop().unwrap();
}

#[test]
fn chain_state_loop_broadcasts_requests() {
    let node = Node::new(&[1, 1, 1, 1]);
    let engine = node.started_engine();
    assert!(wait_for(|| node.server.chain_state_requests() >= 2));
    engine.stop().unwrap();

    let after_stop = node.server.chain_state_requests();
    thread::sleep(Duration::from_millis(60));
    assert_eq!(node.server.chain_state_requests(), after_stop);
}

#[test]
fn stale_and_future_blocks_are_not_committed() {
    let node = Node::new(&[3, 3, 3, 3]);
    let engine = node.started_engine();

    assert_eq!(
        engine.shared.process_new_block(make_template(1, 2)).unwrap(),
        BlockDisposition::Stale
    );
    assert_eq!(
        engine.shared.process_new_block(make_template(1, 6)).unwrap(),
        BlockDisposition::Ahead
    );
    assert_eq!(engine.heights(), (vec![3, 6, 3, 3], vec![3; 4]));
    assert!(node.chain.connected().is_empty());
    engine.stop().unwrap();
}

#[test]
fn external_block_with_quorum_is_committed() {
    let node = Node::new(&[3, 3, 3, 3]);
    let engine = node.started_engine();
    let block = seal_block(make_template(1, 4), &node.keypairs, 1, &[0, 2]);

    assert_eq!(
        engine.shared.process_new_block(block.clone()).unwrap(),
        BlockDisposition::Committed
    );
    assert_eq!(node.chain.connected(), vec![block.clone()]);
    assert_eq!(engine.heights(), (vec![3, 4, 3, 3], vec![3, 4, 3, 3]));
    assert_eq!(engine.validator_stats(&node.keypairs[1].pubkey()).blocks_produced, 1);
    assert_eq!(engine.validator_stats(&node.keypairs[3].pubkey()).reliability, 0);
    assert!(node.server.broadcasts().contains(&PeerMessage::Block(block)));
    engine.stop().unwrap();
}

#[test]
fn external_block_without_quorum_is_rejected() {
    let node = Node::new(&[3, 3, 3, 3]);
    let engine = node.started_engine();
    let block = seal_block(make_template(1, 4), &node.keypairs, 1, &[0]);

    assert_matches!(
        engine.shared.process_new_block(block),
        Err(EngineError::InvalidBlock(_))
    );
    assert!(node.chain.connected().is_empty());
    assert_eq!(engine.heights().1, vec![3; 4]);
    engine.stop().unwrap();
}

#[test]
fn external_block_needs_producer_signature() {
    let node = Node::new(&[3, 3, 3, 3]);
    let engine = node.started_engine();
    let mut block = seal_block(make_template(2, 4), &node.keypairs, 2, &[0, 1]);
    block.producer_sig = Some(node.keypairs[0].sign_message(&block.header_bytes().unwrap()));

    assert_matches!(
        engine.shared.process_new_block(block),
        Err(EngineError::InvalidBlock(_))
    );
    assert!(node.chain.connected().is_empty());
    engine.stop().unwrap();
}

#[test]
fn forged_committee_block_is_rejected() {
    let node = Node::new(&[3, 3, 3, 3]);
    let engine = node.started_engine();
    let attacker = Arc::new(Keypair::new());
    let forged: Vec<Arc<Keypair>> = vec![attacker; 4];
    let block = seal_block(make_template(1, 4), &forged, 1, &[0, 2, 3]);

    assert_matches!(
        engine.shared.process_new_block(block),
        Err(EngineError::InvalidBlock(_))
    );
    assert!(node.chain.connected().is_empty());
    assert_eq!(engine.heights(), (vec![3; 4], vec![3; 4]));
    engine.stop().unwrap();
}

#[test]
fn external_block_from_non_leader_is_rejected() {
    let node = Node::new(&[3, 3, 3, 3]);
    let engine = node.started_engine();
    // Slot 2 leads shard 2, not shard 1.
    let block = seal_block(make_template(1, 4), &node.keypairs, 2, &[0, 1, 3]);

    assert_matches!(
        engine.shared.process_new_block(block),
        Err(EngineError::InvalidBlock(_))
    );
    assert!(node.chain.connected().is_empty());
    engine.stop().unwrap();
}

#[test]
fn repeated_member_signs_once_towards_quorum() {
    let mut node = Node::new(&[3, 3, 3, 3]);
    node.keypairs[3] = node.keypairs[1].clone();
    let engine = node.started_engine();
    // Slots 1 and 3 belong to the same validator: two distinct signers.
    let block = seal_block(make_template(1, 4), &node.keypairs, 1, &[3]);
    assert_eq!(block.filled_sigs(), 2);
    let with_third = seal_block(make_template(1, 4), &node.keypairs, 1, &[0, 3]);
    assert_eq!(with_third.filled_sigs(), 3);

    assert_matches!(
        engine.shared.process_new_block(with_third),
        Err(EngineError::InvalidBlock(_))
    );
    assert!(node.chain.connected().is_empty());
    engine.stop().unwrap();
}

#[test]
fn block_intake_thread_commits_queued_blocks() {
    let node = Node::new(&[3, 3, 3, 3]);
    let engine = node.started_engine();
    let block = seal_block(make_template(3, 4), &node.keypairs, 3, &[1, 2]);

    assert!(engine.on_new_block(block.clone()));
    assert!(wait_for(|| node.chain.connected().len() == 1));
    assert_eq!(node.chain.connected()[0], block);
    engine.stop().unwrap();

    // Dropped once stopped.
    assert!(!engine.on_new_block(seal_block(make_template(3, 5), &node.keypairs, 3, &[1, 2])));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(node.chain.connected().len(), 1);
}

// ===========================================================================
// 4. Signing on request
// ===========================================================================

#[test]
fn sign_block_request_needs_keys() {
    let node = Node::new(&[1, 1, 1, 1]);
    let engine = node.engine();
    let block = seal_block(make_template(1, 2), &node.keypairs, 1, &[]);
    assert_matches!(
        engine.sign_block_request(&block),
        Err(EngineError::NotStarted)
    );
}

/// A started engine signing on behalf of slot 2.
fn signing_node() -> (Node, Engine) {
    let mut node = Node::new(&[1, 1, 1, 1]);
    node.preset_keys = Some(SealerKeys::new(
        node.keypairs[2].clone(),
        Keypair::new().pubkey(),
    ));
    let engine = node.started_engine();
    (node, engine)
}

#[test]
fn sign_block_request_signs_block_hash() {
    let (node, engine) = signing_node();
    let block = seal_block(make_template(1, 2), &node.keypairs, 1, &[]);

    let sig = engine.sign_block_request(&block).unwrap();
    assert_eq!(sig.validator, node.keypairs[2].pubkey());
    assert!(verify_sig(&sig.validator, &sig.signature, &block.hash()));

    // The same block may be asked for again.
    let again = engine.sign_block_request(&block).unwrap();
    assert!(verify_sig(&again.validator, &again.signature, &block.hash()));
    engine.stop().unwrap();
}

#[test]
fn sign_block_request_rejects_foreign_committee() {
    let (_node, engine) = signing_node();
    let strangers: Vec<Arc<Keypair>> = (0..4).map(|_| Arc::new(Keypair::new())).collect();
    let foreign = seal_block(make_template(1, 2), &strangers, 1, &[]);
    assert_matches!(
        engine.sign_block_request(&foreign),
        Err(EngineError::InvalidBlock(_))
    );
    engine.stop().unwrap();
}

#[test]
fn sign_block_request_rejects_non_leader() {
    let (node, engine) = signing_node();
    let block = seal_block(make_template(1, 2), &node.keypairs, 3, &[]);
    assert_matches!(
        engine.sign_block_request(&block),
        Err(EngineError::InvalidBlock(_))
    );
    engine.stop().unwrap();
}

#[test_case(1 ; "already validated")]
#[test_case(3 ; "skips a height")]
fn sign_block_request_rejects_wrong_height(height: u64) {
    let (node, engine) = signing_node();
    let block = seal_block(make_template(1, height), &node.keypairs, 1, &[]);
    assert_matches!(
        engine.sign_block_request(&block),
        Err(EngineError::InvalidBlock(_))
    );
    engine.stop().unwrap();
}

#[test]
fn sign_block_request_refuses_conflicting_block() {
    let (node, engine) = signing_node();
    let first = seal_block(make_template(1, 2), &node.keypairs, 1, &[]);
    engine.sign_block_request(&first).unwrap();

    let mut other = make_template(1, 2);
    other.transactions = vec![b"double spend".to_vec()];
    let other = seal_block(other, &node.keypairs, 1, &[]);
    assert_ne!(first.hash(), other.hash());
    assert_matches!(
        engine.sign_block_request(&other),
        Err(EngineError::ConflictingBlock {
            shard: 1,
            height: 2
        })
    );
    engine.stop().unwrap();
}

#[test]
fn sign_block_request_needs_committee_seat() {
    let mut node = Node::new(&[1, 1, 1, 1]);
    let outsider = Keypair::new();
    node.preset_keys = Some(SealerKeys::new(
        Arc::new(outsider.insecure_clone()),
        Keypair::new().pubkey(),
    ));
    let engine = node.started_engine();
    let block = seal_block(make_template(1, 2), &node.keypairs, 1, &[]);
    assert_matches!(
        engine.sign_block_request(&block),
        Err(EngineError::NotInCommittee(pk)) if pk == outsider.pubkey()
    );
    engine.stop().unwrap();
}

#[test]
fn block_sig_is_queued_only_while_sealer_runs() {
    let node = Node::new(&[1, 1, 1, 1]);
    let engine = node.engine();
    let block = make_template(0, 2);
    let validator = node.keypairs[1].pubkey();
    let make_sig = || crate::types::BlockSig {
        validator,
        signature: node.keypairs[1].sign_message(block.hash().as_ref()),
    };

    assert!(!engine.on_block_sig(make_sig()));
    engine.start_sealer(node.keys.clone()).unwrap();
    assert!(engine.on_block_sig(make_sig()));
    engine.stop_sealer();
    assert!(!engine.on_block_sig(make_sig()));
}

// ===========================================================================
// 5. Fee estimators
// ===========================================================================

#[test]
fn fee_estimator_failure_aborts_replay() {
    let node = Node::new(&[3, 3, 3, 3]);
    node.estimators[2].set_failing(true);
    let engine = node.engine();

    assert_matches!(engine.start(), Err(EngineError::FeeEstimator(_)));
    assert!(!engine.is_started());
}

#[test]
fn fee_estimator_failure_does_not_undo_commit() {
    let node = Node::new(&[1, 1, 1, 1]);
    node.server.respond_with(&node.keypairs[1]);
    node.server.respond_with(&node.keypairs[2]);
    let engine = node.started_engine();
    node.estimators[0].set_failing(true);
    let (sealer, _exit) = node.sealer(&engine);

    assert_eq!(
        sealer.step().unwrap(),
        SealStep::Sealed {
            shard: 0,
            height: 2
        }
    );
    assert_eq!(node.chain.connected().len(), 1);
    assert!(node.estimators[0].registered().is_empty());
    assert_eq!(engine.heights().1, vec![2, 1, 1, 1]);
    engine.stop().unwrap();
}
