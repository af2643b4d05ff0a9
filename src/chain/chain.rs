//! In-memory chain of blocks plus the staged-transaction pool
//!
//! This is the collaborator surface the swarm drives during block
//! reconciliation: locator construction, branch-point lookup, ordered
//! appends, forking, and the atomic swap that publishes a finished
//! working chain.

use std::collections::HashMap;

use rand::Rng;
use thiserror::Error;

use crate::chain::block::{Block, BlockError, BlockHash};
use crate::chain::transaction::{Transaction, TxId};

/// Chain-related errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Block {actual} does not extend chain tip {expected:?}")]
    DisconnectedBlock {
        expected: Option<BlockHash>,
        actual: BlockHash,
    },
    #[error("Block index {actual} does not follow chain height {expected}")]
    IndexGap { expected: u64, actual: u64 },
    #[error("Branch point {0} is not in the chain")]
    BranchNotFound(BlockHash),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Block error: {0}")]
    Block(#[from] BlockError),
}

/// An append-only chain of blocks with O(1) hash lookups
///
/// Working copies produced by [`Chain::fork`] and [`Chain::empty_fork`]
/// share the chain id; [`Chain::swap`] publishes a working copy into the
/// live chain in one step.
#[derive(Debug, Clone)]
pub struct Chain {
    /// Identifies the logical chain across forks and swaps
    id: u64,
    blocks: Vec<Block>,
    /// Block hash -> height
    index: HashMap<BlockHash, u64>,
    /// Mined transaction id -> height of the containing block
    tx_index: HashMap<TxId, u64>,
    /// Pending transactions not yet in a block
    staged: HashMap<TxId, Transaction>,
}

impl Chain {
    /// Create a new chain containing only a genesis block
    pub fn new() -> Self {
        let mut chain = Self::bare(rand::thread_rng().gen());
        let genesis = Block::genesis(vec![]);
        chain.index.insert(genesis.hash, 0);
        chain.blocks.push(genesis);
        chain
    }

    fn bare(id: u64) -> Self {
        Self {
            id,
            blocks: Vec::new(),
            index: HashMap::new(),
            tx_index: HashMap::new(),
            staged: HashMap::new(),
        }
    }

    /// The chain id shared by all forks of this chain
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The newest block, if any
    pub fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    /// Number of blocks in the chain
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the chain holds no blocks at all
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// O(1) block membership check
    pub fn has_block(&self, hash: &BlockHash) -> bool {
        self.index.contains_key(hash)
    }

    /// Look up a block by hash
    pub fn get_block(&self, hash: &BlockHash) -> Option<&Block> {
        self.index
            .get(hash)
            .and_then(|height| self.blocks.get(*height as usize))
    }

    /// Whether a transaction is known, mined or staged
    pub fn has_transaction(&self, id: &TxId) -> bool {
        self.staged.contains_key(id) || self.tx_index.contains_key(id)
    }

    /// Look up a transaction by id, staged ones first
    pub fn get_transaction(&self, id: &TxId) -> Option<&Transaction> {
        if let Some(tx) = self.staged.get(id) {
            return Some(tx);
        }
        let height = *self.tx_index.get(id)?;
        self.blocks
            .get(height as usize)?
            .transactions
            .iter()
            .find(|tx| tx.id == *id)
    }

    /// Stage transactions into the pending pool
    pub fn stage_transactions(&mut self, txs: Vec<Transaction>) {
        for tx in txs {
            if !self.tx_index.contains_key(&tx.id) {
                self.staged.insert(tx.id, tx);
            }
        }
    }

    /// Ids of all staged transactions
    pub fn staged_ids(&self) -> Vec<TxId> {
        self.staged.keys().copied().collect()
    }

    /// Append a block to the tip
    ///
    /// The block must carry the next index and link to the current tip
    /// hash (or be a genesis block on an empty chain).
    pub fn append(&mut self, block: Block) -> Result<(), ChainError> {
        if !block.verify_hash() || !block.verify_tx_digest() {
            return Err(ChainError::InvalidBlock(format!(
                "hash or tx digest mismatch for block {}",
                block.index
            )));
        }

        let expected_index = self.blocks.len() as u64;
        if block.index != expected_index {
            return Err(ChainError::IndexGap {
                expected: expected_index,
                actual: block.index,
            });
        }

        let tip_hash = self.tip().map(|b| b.hash);
        if block.previous_hash != tip_hash {
            return Err(ChainError::DisconnectedBlock {
                expected: tip_hash,
                actual: block.hash,
            });
        }

        let height = block.index;
        self.index.insert(block.hash, height);
        for tx in &block.transactions {
            self.tx_index.insert(tx.id, height);
            self.staged.remove(&tx.id);
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Build a block locator: tip backwards with exponentially growing
    /// gaps after the first ten entries, always ending at the first block
    pub fn block_locator(&self) -> Vec<BlockHash> {
        let mut locator = Vec::new();
        if self.blocks.is_empty() {
            return locator;
        }

        let mut height = self.blocks.len() as i64 - 1;
        let mut step = 1i64;
        while height > 0 {
            locator.push(self.blocks[height as usize].hash);
            if locator.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        locator.push(self.blocks[0].hash);
        locator
    }

    /// Answer a locator query: hashes from the deepest common ancestor
    /// forward, the ancestor itself first, up to (and including) `stop`,
    /// capped at `max`
    ///
    /// An empty locator (the peer has no blocks) starts from our first
    /// block.
    pub fn find_next_hashes(
        &self,
        locator: &[BlockHash],
        stop: Option<BlockHash>,
        max: usize,
    ) -> Vec<BlockHash> {
        if self.blocks.is_empty() || max == 0 {
            return Vec::new();
        }

        // The locator runs tip-backwards, so the first hash we recognize
        // is the highest block the caller shares with us.
        let start = locator
            .iter()
            .find_map(|h| self.index.get(h).copied())
            .unwrap_or(0);

        let mut out = Vec::new();
        for block in &self.blocks[start as usize..] {
            out.push(block.hash);
            if out.len() >= max || stop == Some(block.hash) {
                break;
            }
        }
        out
    }

    /// Fork the chain at `branch_point`, producing a working copy that
    /// ends with the branch-point block
    pub fn fork(&self, branch_point: &BlockHash) -> Result<Chain, ChainError> {
        let height = *self
            .index
            .get(branch_point)
            .ok_or(ChainError::BranchNotFound(*branch_point))?;

        let mut forked = Self::bare(self.id);
        for block in &self.blocks[..=height as usize] {
            forked.append(block.clone())?;
        }
        Ok(forked)
    }

    /// A working chain with the same id and no blocks, used when the
    /// announcing peer shares no block with us
    pub fn empty_fork(&self) -> Chain {
        Self::bare(self.id)
    }

    /// Publish `other`'s blocks into this chain in one step
    ///
    /// Staged transactions survive the swap; those mined by the incoming
    /// chain are dropped from the pool.
    pub fn swap(&mut self, other: Chain) {
        self.blocks = other.blocks;
        self.index = other.index;
        self.tx_index = other.tx_index;
        let tx_index = &self.tx_index;
        self.staged.retain(|id, _| !tx_index.contains_key(id));
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grow(chain: &mut Chain, count: usize) {
        for _ in 0..count {
            let next = Block::next(chain.tip().unwrap(), vec![]);
            chain.append(next).unwrap();
        }
    }

    #[test]
    fn test_new_chain_has_genesis() {
        let chain = Chain::new();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.tip().unwrap().index, 0);
    }

    #[test]
    fn test_append_continuity() {
        let mut chain = Chain::new();
        grow(&mut chain, 3);
        assert_eq!(chain.tip().unwrap().index, 3);

        // A block that skips an index is rejected
        let stale = Block::next(chain.get_block(&chain.blocks[1].hash).unwrap(), vec![]);
        assert!(matches!(
            chain.append(stale),
            Err(ChainError::IndexGap { .. }) | Err(ChainError::DisconnectedBlock { .. })
        ));
    }

    #[test]
    fn test_locator_shape() {
        let mut chain = Chain::new();
        grow(&mut chain, 30);

        let locator = chain.block_locator();
        assert_eq!(locator[0], chain.tip().unwrap().hash);
        assert_eq!(*locator.last().unwrap(), chain.blocks[0].hash);
        // Sparser than one hash per block
        assert!(locator.len() < 31);
    }

    #[test]
    fn test_empty_locator_starts_at_genesis() {
        let mut chain = Chain::new();
        grow(&mut chain, 5);

        let hashes = chain.find_next_hashes(&[], None, 500);
        assert_eq!(hashes[0], chain.blocks[0].hash);
        assert_eq!(hashes.len(), 6);
    }

    #[test]
    fn test_find_next_hashes_branch_point_first() {
        let mut chain = Chain::new();
        grow(&mut chain, 10);

        let locator = vec![chain.blocks[4].hash];
        let hashes = chain.find_next_hashes(&locator, None, 500);
        assert_eq!(hashes[0], chain.blocks[4].hash);
        assert_eq!(hashes.len(), 7);
    }

    #[test]
    fn test_find_next_hashes_stop_inclusive() {
        let mut chain = Chain::new();
        grow(&mut chain, 10);

        let stop = chain.blocks[6].hash;
        let hashes = chain.find_next_hashes(&[chain.blocks[2].hash], Some(stop), 500);
        assert_eq!(*hashes.last().unwrap(), stop);
        assert_eq!(hashes.len(), 5);
    }

    #[test]
    fn test_find_next_hashes_stop_at_branch_point() {
        let mut chain = Chain::new();
        grow(&mut chain, 10);

        // stop == locator[0]: the response is just the branch point
        let branch = chain.blocks[4].hash;
        let hashes = chain.find_next_hashes(&[branch], Some(branch), 500);
        assert_eq!(hashes, vec![branch]);
    }

    #[test]
    fn test_find_next_hashes_cap() {
        let mut chain = Chain::new();
        grow(&mut chain, 10);

        let hashes = chain.find_next_hashes(&[], None, 3);
        assert_eq!(hashes.len(), 3);
    }

    #[test]
    fn test_fork_ends_at_branch_point() {
        let mut chain = Chain::new();
        grow(&mut chain, 10);

        let branch = chain.blocks[4].hash;
        let forked = chain.fork(&branch).unwrap();
        assert_eq!(forked.len(), 5);
        assert_eq!(forked.tip().unwrap().hash, branch);
        assert_eq!(forked.id(), chain.id());
    }

    #[test]
    fn test_swap_publishes_working_chain() {
        let mut live = Chain::new();
        grow(&mut live, 2);

        let mut working = live.fork(&live.blocks[1].hash).unwrap();
        grow(&mut working, 5);
        let working_tip = working.tip().unwrap().hash;

        live.swap(working);
        assert_eq!(live.tip().unwrap().hash, working_tip);
        assert_eq!(live.len(), 7);
    }

    #[test]
    fn test_staged_transactions() {
        let keys = crate::crypto::KeyPair::generate();
        let tx = Transaction::new_signed(&keys, "someone", 10, 0).unwrap();
        let id = tx.id;

        let mut chain = Chain::new();
        chain.stage_transactions(vec![tx.clone()]);
        assert!(chain.has_transaction(&id));
        assert!(chain.get_transaction(&id).is_some());

        // Mining the transaction clears it from the pool
        let next = Block::next(chain.tip().unwrap(), vec![tx]);
        chain.append(next).unwrap();
        assert!(chain.staged_ids().is_empty());
        assert!(chain.has_transaction(&id));
    }
}
