//! In-memory collaborators for exercising the engine without a node.

use {
    crate::{
        capabilities::{BlockChain, BlockFactory, CandidateSource, FeeEstimator, MemPool, Server},
        error::{EngineError, Result},
        types::{BestState, Block, BlockHeader, BlockSig, PeerMessage, ShardId},
    },
    crossbeam_channel::Sender,
    solana_hash::Hash,
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_signer::Signer,
    std::{
        collections::HashMap,
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Mutex,
        },
    },
};

/// Initialize env_logger once for test output.
pub fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

/// An unsigned block skeleton at `height` on `shard`.
pub fn make_template(shard: ShardId, height: u64) -> Block {
    Block {
        header: BlockHeader {
            shard,
            height,
            parent_hash: Hash::default(),
            timestamp: 1_700_000_000,
            committee: vec![],
            committee_sigs: vec![],
            candidate_hash: Hash::default(),
            chains_height: vec![],
        },
        producer: Pubkey::default(),
        producer_sig: None,
        transactions: vec![format!("tx-{shard}-{height}").into_bytes()],
    }
}

/// Fill in committee, the signatures of `signers` and the producer
/// signature, the way a finalized block arrives from another node.
pub fn seal_block(
    mut block: Block,
    committee: &[Arc<Keypair>],
    producer: usize,
    signers: &[usize],
) -> Block {
    block.producer = committee[producer].pubkey();
    block.header.committee = committee.iter().map(|kp| kp.pubkey()).collect();
    block.header.committee_sigs = vec![None; committee.len()];
    let hash = block.hash();
    for idx in signers.iter().copied().chain(std::iter::once(producer)) {
        block.header.committee_sigs[idx] = Some(committee[idx].sign_message(hash.as_ref()));
    }
    let header = block.header_bytes().unwrap();
    block.producer_sig = Some(committee[producer].sign_message(&header));
    block
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// Shard chains kept in memory.
#[derive(Debug, Default)]
pub struct MemoryChain {
    blocks: Mutex<HashMap<(ShardId, u64), Block>>,
    best: Mutex<Vec<BestState>>,
    connected: Mutex<Vec<Block>>,
    view_points: Mutex<Vec<(ShardId, u64)>>,
    insane: Mutex<Option<(ShardId, u64)>>,
    stored: AtomicUsize,
}

impl MemoryChain {
    /// Shard `s` holds blocks `1..=heights[s]`.
    pub fn with_heights(heights: &[u64]) -> Self {
        let chain = Self::default();
        {
            let mut blocks = chain.blocks.lock().unwrap();
            let mut best = chain.best.lock().unwrap();
            for (shard, tip) in heights.iter().enumerate() {
                let shard = shard as ShardId;
                let mut parent = Hash::default();
                for height in 1..=*tip {
                    let mut block = make_template(shard, height);
                    block.header.parent_hash = parent;
                    parent = block.hash();
                    blocks.insert((shard, height), block);
                }
                best.push(BestState {
                    shard,
                    height: *tip,
                    best_block_hash: parent,
                    candidates: vec![],
                });
            }
        }
        chain
    }

    /// Make sanity validation of one stored block fail.
    pub fn break_block(&self, shard: ShardId, height: u64) {
        *self.insane.lock().unwrap() = Some((shard, height));
    }

    pub fn connected(&self) -> Vec<Block> {
        self.connected.lock().unwrap().clone()
    }

    pub fn view_points(&self) -> Vec<(ShardId, u64)> {
        self.view_points.lock().unwrap().clone()
    }

    pub fn stored_count(&self) -> usize {
        self.stored.load(Ordering::Relaxed)
    }
}

impl BlockChain for MemoryChain {
    fn best_height(&self, shard: ShardId) -> u64 {
        self.best_state(shard).height
    }

    fn block_by_height(&self, shard: ShardId, height: u64) -> Result<Block> {
        self.blocks
            .lock()
            .unwrap()
            .get(&(shard, height))
            .cloned()
            .ok_or(EngineError::BlockNotFound { shard, height })
    }

    fn validate_block_sanity(&self, block: &Block) -> Result<()> {
        if *self.insane.lock().unwrap() == Some((block.shard(), block.height())) {
            return Err(EngineError::InvalidBlock(format!(
                "bad block {} on shard {}",
                block.height(),
                block.shard()
            )));
        }
        Ok(())
    }

    fn build_view_point(&self, block: &Block) -> Result<()> {
        self.view_points
            .lock()
            .unwrap()
            .push((block.shard(), block.height()));
        Ok(())
    }

    fn connect_block(&self, block: &Block) -> Result<()> {
        let tip = self.best_height(block.shard());
        if block.height() != tip.saturating_add(1) {
            return Err(EngineError::BlockChain(format!(
                "block {} does not extend tip {tip}",
                block.height()
            )));
        }
        self.blocks
            .lock()
            .unwrap()
            .insert((block.shard(), block.height()), block.clone());
        self.connected.lock().unwrap().push(block.clone());
        Ok(())
    }

    fn best_state(&self, shard: ShardId) -> BestState {
        self.best
            .lock()
            .unwrap()
            .get(usize::from(shard))
            .cloned()
            .unwrap_or_default()
    }

    fn update_best_state(&self, block: &Block, candidates: Vec<Pubkey>) -> Result<()> {
        let mut best = self.best.lock().unwrap();
        let state = best
            .get_mut(usize::from(block.shard()))
            .ok_or_else(|| EngineError::BlockChain("unknown shard".to_string()))?;
        state.height = block.height();
        state.best_block_hash = block.hash();
        state.candidates = candidates;
        Ok(())
    }

    fn store_best_state(&self, _shard: ShardId) -> Result<()> {
        self.stored.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fee estimator, mempool, candidates
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingFeeEstimator {
    registered: Mutex<Vec<u64>>,
    failing: AtomicBool,
}

impl RecordingFeeEstimator {
    pub fn registered(&self) -> Vec<u64> {
        self.registered.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

impl FeeEstimator for RecordingFeeEstimator {
    fn register_block(&self, block: &Block) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(EngineError::InvalidBlock(format!(
                "no fee data for block {}",
                block.height()
            )));
        }
        self.registered.lock().unwrap().push(block.height());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingMemPool {
    removed: Mutex<Vec<Vec<u8>>>,
}

impl RecordingMemPool {
    pub fn removed(&self) -> Vec<Vec<u8>> {
        self.removed.lock().unwrap().clone()
    }
}

impl MemPool for RecordingMemPool {
    fn remove_transaction(&self, tx: &[u8]) {
        self.removed.lock().unwrap().push(tx.to_vec());
    }
}

/// Always returns the same candidate list.
#[derive(Debug, Default)]
pub struct StaticCandidates(pub Vec<Pubkey>);

impl CandidateSource for StaticCandidates {
    fn candidate_list(&self, _block: &Block) -> Vec<Pubkey> {
        self.0.clone()
    }
}

/// Builds templates on top of a [`MemoryChain`] and counts the calls.
#[derive(Debug)]
pub struct TemplateFactory {
    chain: Arc<MemoryChain>,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl TemplateFactory {
    pub fn new(chain: Arc<MemoryChain>) -> Self {
        Self {
            chain,
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

impl BlockFactory for TemplateFactory {
    fn new_block_template(&self, _payment_address: &Pubkey, shard: ShardId) -> Result<Block> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.failing.load(Ordering::Relaxed) {
            return Err(EngineError::BlockFactory("mempool unavailable".to_string()));
        }
        let best = self.chain.best_state(shard);
        let mut block = make_template(shard, best.height.saturating_add(1));
        block.header.parent_hash = best.best_block_hash;
        Ok(block)
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

type SigSink = Box<dyn Fn(BlockSig) + Send + Sync>;

/// Transport double. Committee members registered with
/// [`ResponderServer::respond_with`] answer signature requests at once.
pub struct ResponderServer {
    sink: Mutex<Option<SigSink>>,
    addrs: Mutex<HashMap<Pubkey, SocketAddr>>,
    responders: Mutex<HashMap<SocketAddr, Arc<Keypair>>>,
    broadcasts: Mutex<Vec<PeerMessage>>,
    sig_requests: Mutex<Vec<SocketAddr>>,
    chain_state_requests: AtomicUsize,
}

impl Default for ResponderServer {
    fn default() -> Self {
        Self {
            sink: Mutex::new(None),
            addrs: Mutex::new(HashMap::new()),
            responders: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
            sig_requests: Mutex::new(Vec::new()),
            chain_state_requests: AtomicUsize::new(0),
        }
    }
}

impl ResponderServer {
    /// Responses go straight into `sig_tx`.
    pub fn new(sig_tx: Sender<BlockSig>) -> Self {
        let server = Self::default();
        server.set_sink(move |sig| {
            let _ = sig_tx.send(sig);
        });
        server
    }

    /// Route responses through `sink`, e.g. into `Engine::on_block_sig`.
    pub fn set_sink(&self, sink: impl Fn(BlockSig) + Send + Sync + 'static) {
        *self.sink.lock().unwrap() = Some(Box::new(sink));
    }

    /// Give `keypair` an address and have it sign every request it gets.
    pub fn respond_with(&self, keypair: &Arc<Keypair>) {
        let mut addrs = self.addrs.lock().unwrap();
        let port = 9_000u16.saturating_add(addrs.len() as u16);
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        addrs.insert(keypair.pubkey(), addr);
        self.responders.lock().unwrap().insert(addr, keypair.clone());
    }

    pub fn make_unreachable(&self, validator: &Pubkey) {
        if let Some(addr) = self.addrs.lock().unwrap().remove(validator) {
            self.responders.lock().unwrap().remove(&addr);
        }
    }

    pub fn broadcasts(&self) -> Vec<PeerMessage> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn sig_requests(&self) -> usize {
        self.sig_requests.lock().unwrap().len()
    }

    pub fn chain_state_requests(&self) -> usize {
        self.chain_state_requests.load(Ordering::Relaxed)
    }
}

impl Server for ResponderServer {
    fn resolve_peers(&self, validator: &Pubkey) -> Vec<SocketAddr> {
        self.addrs
            .lock()
            .unwrap()
            .get(validator)
            .copied()
            .into_iter()
            .collect()
    }

    fn broadcast_to_all(&self, message: PeerMessage) -> Result<()> {
        self.broadcasts.lock().unwrap().push(message);
        Ok(())
    }

    fn send_to_peer(&self, message: PeerMessage, addr: SocketAddr) -> Result<()> {
        self.sig_requests.lock().unwrap().push(addr);
        let PeerMessage::BlockSigRequest(block) = message else {
            return Ok(());
        };
        let Some(keypair) = self.responders.lock().unwrap().get(&addr).cloned() else {
            return Err(EngineError::Transport(format!("no route to {addr}")));
        };
        let sig = BlockSig {
            validator: keypair.pubkey(),
            signature: keypair.sign_message(block.hash().as_ref()),
        };
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink(sig);
        }
        Ok(())
    }

    fn broadcast_chain_state_request(&self) -> Result<()> {
        self.chain_state_requests.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
