//! Core types for the parallel proof-of-stake engine.
//!
//! Defines blocks and their headers, the signature messages exchanged while
//! a block is being finalized, the chain-state summary gossiped between
//! nodes, and the outbound peer messages handed to the transport.

use {
    crate::error::Result,
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_sha256_hasher::Hasher,
    solana_signature::Signature,
    solana_signer::Signer,
    std::sync::Arc,
};

/// Index of a shard (chain). Shards are dense: `0..total_shards`.
pub type ShardId = u8;

// ---------------------------------------------------------------------------
// Block types
// ---------------------------------------------------------------------------

/// Header of a shard block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Shard this block extends.
    pub shard: ShardId,
    /// Height within the shard. Genesis is height 1.
    pub height: u64,
    /// Hash of the previous block on the same shard.
    pub parent_hash: Hash,
    /// Unix timestamp in seconds when the template was built.
    pub timestamp: i64,
    /// Committee snapshot the signatures below were collected against.
    pub committee: Vec<Pubkey>,
    /// One signature slot per committee member, `None` while missing.
    pub committee_sigs: Vec<Option<Signature>>,
    /// Hash of the candidate validator list computed for this block.
    pub candidate_hash: Hash,
    /// Validated height of every shard when the block was built.
    pub chains_height: Vec<u64>,
}

/// A shard block together with its producer and transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    /// Identity of the validator that produced the block.
    pub producer: Pubkey,
    /// Producer signature over the finalized header, signatures included.
    pub producer_sig: Option<Signature>,
    /// Opaque serialized transactions. The runtime layer decodes these.
    pub transactions: Vec<Vec<u8>>,
}

impl Block {
    pub fn shard(&self) -> ShardId {
        self.header.shard
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Content hash that committee members sign.
    ///
    /// Covers every header field except the signature slots, so collecting
    /// signatures never changes the value being signed.
    /// Every variable-length field is prefixed with its element count.
    pub fn hash(&self) -> Hash {
        let mut hasher = Hasher::default();
        hasher.hash(&[self.header.shard]);
        hasher.hash(&self.header.height.to_le_bytes());
        hasher.hash(self.header.parent_hash.as_ref());
        hasher.hash(&self.header.timestamp.to_le_bytes());
        hash_len(&mut hasher, self.header.committee.len());
        for member in &self.header.committee {
            hasher.hash(member.as_ref());
        }
        hasher.hash(self.header.candidate_hash.as_ref());
        hash_len(&mut hasher, self.header.chains_height.len());
        for height in &self.header.chains_height {
            hasher.hash(&height.to_le_bytes());
        }
        hasher.hash(self.producer.as_ref());
        hash_len(&mut hasher, self.transactions.len());
        for tx in &self.transactions {
            hasher.hash(solana_sha256_hasher::hash(tx).as_ref());
        }
        hasher.result()
    }

    /// Bytes covered by the producer signature: the full header, including
    /// every collected committee signature.
    pub fn header_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.header)?)
    }

    /// Number of filled committee signature slots.
    pub fn filled_sigs(&self) -> usize {
        self.header
            .committee_sigs
            .iter()
            .filter(|sig| sig.is_some())
            .count()
    }
}

fn hash_len(hasher: &mut Hasher, len: usize) {
    hasher.hash(&u64::try_from(len).unwrap_or(u64::MAX).to_le_bytes());
}

/// Hash of a candidate validator list, embedded into block headers.
pub fn candidate_list_hash(candidates: &[Pubkey]) -> Result<Hash> {
    let bytes = bincode::serialize(candidates)?;
    Ok(solana_sha256_hasher::hash(&bytes))
}

/// Best-chain summary of a single shard as kept by the chain collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BestState {
    pub shard: ShardId,
    pub height: u64,
    pub best_block_hash: Hash,
    /// Candidate validators recomputed after the last connected block.
    pub candidates: Vec<Pubkey>,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A committee member's signature over a candidate block hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSig {
    pub validator: Pubkey,
    pub signature: Signature,
}

/// Chain-state summary exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub current_committee: Vec<Pubkey>,
    pub candidate_list_hash: Hash,
    pub chains_height: Vec<u64>,
}

/// Outbound messages the engine asks the transport to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Ask peers for every block after `last_block_hash` on `shard`.
    GetBlocks {
        shard: ShardId,
        last_block_hash: Hash,
    },
    /// Ask a committee member to sign a candidate block.
    BlockSigRequest(Block),
    /// A finalized block.
    Block(Block),
}

impl PeerMessage {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::GetBlocks { .. } => "GetBlocks",
            PeerMessage::BlockSigRequest(_) => "BlockSigRequest",
            PeerMessage::Block(_) => "Block",
        }
    }
}

// ---------------------------------------------------------------------------
// Sealer identity
// ---------------------------------------------------------------------------

/// Keys a validator seals blocks with.
#[derive(Debug, Clone)]
pub struct SealerKeys {
    keypair: Arc<Keypair>,
    /// Address block rewards are paid to.
    pub payment_address: Pubkey,
}

impl SealerKeys {
    pub fn new(keypair: Arc<Keypair>, payment_address: Pubkey) -> Self {
        Self {
            keypair,
            payment_address,
        }
    }

    /// Validator identity, derived from the signing key.
    pub fn identity(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.keypair.sign_message(message)
    }

    /// Sign a block's content hash on behalf of this validator.
    pub fn sign_block(&self, block: &Block) -> BlockSig {
        BlockSig {
            validator: self.identity(),
            signature: self.sign(block.hash().as_ref()),
        }
    }
}

/// Check a committee signature over `hash`.
pub fn verify_sig(validator: &Pubkey, signature: &Signature, hash: &Hash) -> bool {
    signature.verify(validator.as_ref(), hash.as_ref())
}
