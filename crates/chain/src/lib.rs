//! Block and transaction types plus the [`Chain`] interface the swarm
//! synchronizes against.
//!
//! The swarm treats block and transaction payloads as opaque bytes; all it
//! needs is canonical encoding, content hashes, and the linkage fields
//! (`index`, `previous_hash`).  [`MemoryChain`] is the in-memory
//! implementation driven by the node and the integration tests.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block {got} at index {index} does not extend the current tip")]
    Disconnected { got: BlockHash, index: u64 },
    #[error("unknown block {0}")]
    UnknownBlock(BlockHash),
    #[error("serialization error: {0}")]
    Codec(#[from] io::Error),
}

/// 32-byte block content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash(#[serde(with = "serde_bytes")] pub [u8; 32]);

impl BlockHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({self})")
    }
}

/// 32-byte transaction identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(#[serde(with = "serde_bytes")] pub [u8; 32]);

impl TxId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({self})")
    }
}

/// A transaction: an opaque payload identified by its content hash.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Tx {
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Tx {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Canonical wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        codec::to_vec_cbor(self).expect("transaction encoding is infallible")
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        codec::from_slice_cbor(bytes)
    }

    pub fn id(&self) -> TxId {
        TxId(*blake3::hash(&self.encode()).as_bytes())
    }
}

/// A block in the chain.  The swarm only reads the linkage fields; the
/// payload carries whatever the validation layer put there.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub previous_hash: BlockHash,
    pub timestamp: i64,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Block {
    /// Canonical wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        codec::to_vec_cbor(self).expect("block encoding is infallible")
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        codec::from_slice_cbor(bytes)
    }

    pub fn hash(&self) -> BlockHash {
        BlockHash(*blake3::hash(&self.encode()).as_bytes())
    }
}

/// Compact description of a chain: hashes dense near the tip, then spaced
/// with exponentially growing stride back to genesis.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct BlockLocator(pub Vec<BlockHash>);

impl BlockLocator {
    pub fn hashes(&self) -> &[BlockHash] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The chain interface the swarm consumes.  Implementations are driven
/// behind `Arc<parking_lot::Mutex<dyn Chain + Send>>`.
pub trait Chain: Send {
    /// Hash of the block at `index`; `-1` addresses the tip.
    fn index_block_hash(&self, index: i64) -> Option<BlockHash>;

    fn tip(&self) -> Option<Block>;

    fn block(&self, hash: &BlockHash) -> Option<Block>;

    fn contains_block(&self, hash: &BlockHash) -> bool {
        self.block(hash).is_some()
    }

    /// Look up a transaction in the chain's pool.
    fn transaction(&self, id: &TxId) -> Option<Tx>;

    fn contains_transaction(&self, id: &TxId) -> bool {
        self.transaction(id).is_some()
    }

    /// Walk forward from the highest locator entry present locally.  The
    /// first returned hash is the common ancestor itself; the walk stops
    /// before `stop` and after at most `max` entries.
    fn find_next_hashes(&self, locator: &BlockLocator, stop: &BlockHash, max: usize)
        -> Vec<BlockHash>;

    fn block_locator(&self) -> BlockLocator;

    /// Append a block extending the tip.
    fn append(&mut self, block: Block) -> Result<(), ChainError>;

    /// Truncate the chain above `hash`, which remains the new tip.
    fn delete_after(&mut self, hash: &BlockHash) -> Result<(), ChainError>;

    /// Add transactions to the staged set.
    fn stage_transactions(&mut self, txs: Vec<Tx>);
}

/// In-memory chain used by the node and the tests.
#[derive(Default)]
pub struct MemoryChain {
    blocks: Vec<Block>,
    hashes: Vec<BlockHash>,
    transactions: HashMap<TxId, Tx>,
    staged: Vec<Tx>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bootstrap from an already-linked sequence of blocks.
    pub fn with_blocks(blocks: Vec<Block>) -> Result<Self, ChainError> {
        let mut chain = Self::new();
        for block in blocks {
            chain.append(block)?;
        }
        Ok(chain)
    }

    /// Seed the transaction pool (test helper for serving `GetTxs`).
    pub fn insert_transaction(&mut self, tx: Tx) {
        self.transactions.insert(tx.id(), tx);
    }

    pub fn height(&self) -> usize {
        self.blocks.len()
    }

    pub fn staged(&self) -> &[Tx] {
        &self.staged
    }

    fn position_of(&self, hash: &BlockHash) -> Option<usize> {
        self.hashes.iter().position(|h| h == hash)
    }
}

impl Chain for MemoryChain {
    fn index_block_hash(&self, index: i64) -> Option<BlockHash> {
        if index == -1 {
            return self.hashes.last().copied();
        }
        usize::try_from(index).ok().and_then(|i| self.hashes.get(i).copied())
    }

    fn tip(&self) -> Option<Block> {
        self.blocks.last().cloned()
    }

    fn block(&self, hash: &BlockHash) -> Option<Block> {
        self.position_of(hash).map(|i| self.blocks[i].clone())
    }

    fn transaction(&self, id: &TxId) -> Option<Tx> {
        self.transactions.get(id).cloned()
    }

    fn find_next_hashes(
        &self,
        locator: &BlockLocator,
        stop: &BlockHash,
        max: usize,
    ) -> Vec<BlockHash> {
        let Some(start) = locator
            .hashes()
            .iter()
            .find_map(|hash| self.position_of(hash))
        else {
            return Vec::new();
        };
        self.hashes[start..]
            .iter()
            .take_while(|hash| *hash != stop)
            .take(max)
            .copied()
            .collect()
    }

    fn block_locator(&self) -> BlockLocator {
        let mut hashes = Vec::new();
        if self.blocks.is_empty() {
            return BlockLocator(hashes);
        }
        let mut step = 1usize;
        let mut index = self.blocks.len() as isize - 1;
        while index >= 0 {
            hashes.push(self.hashes[index as usize]);
            if index == 0 {
                break;
            }
            index -= step as isize;
            if hashes.len() >= 10 {
                step *= 2;
            }
        }
        let genesis = self.hashes[0];
        if hashes.last() != Some(&genesis) {
            hashes.push(genesis);
        }
        BlockLocator(hashes)
    }

    fn append(&mut self, block: Block) -> Result<(), ChainError> {
        if let Some(tip) = self.blocks.last() {
            let linked = block.previous_hash == self.hashes[self.hashes.len() - 1]
                && block.index == tip.index + 1;
            if !linked {
                return Err(ChainError::Disconnected {
                    got: block.hash(),
                    index: block.index,
                });
            }
        }
        self.hashes.push(block.hash());
        self.blocks.push(block);
        Ok(())
    }

    fn delete_after(&mut self, hash: &BlockHash) -> Result<(), ChainError> {
        let position = self
            .position_of(hash)
            .ok_or(ChainError::UnknownBlock(*hash))?;
        self.blocks.truncate(position + 1);
        self.hashes.truncate(position + 1);
        Ok(())
    }

    fn stage_transactions(&mut self, txs: Vec<Tx>) {
        for tx in txs {
            let id = tx.id();
            if !self.staged.iter().any(|staged| staged.id() == id) {
                self.staged.push(tx);
            }
        }
    }
}

/// Build a linked chain of test blocks on top of `parent`.
pub fn build_blocks(parent: Option<&Block>, count: usize, salt: u8) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count);
    let (mut index, mut previous_hash) = match parent {
        Some(block) => (block.index + 1, block.hash()),
        None => (0, BlockHash([0u8; 32])),
    };
    for i in 0..count {
        let block = Block {
            index,
            previous_hash,
            timestamp: 1_700_000_000_000 + index as i64,
            payload: vec![salt, i as u8],
        };
        previous_hash = block.hash();
        index += 1;
        blocks.push(block);
    }
    blocks
}
