//! Block implementation
//!
//! A block carries an index, a link to its predecessor, and a list of
//! transactions. Validation and consensus live outside the networking
//! core; blocks here only know how to hash and serialize themselves.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::chain::transaction::Transaction;
use crate::crypto::{double_sha256, sha256};

/// Errors from decoding or linking blocks
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Invalid block hash")]
    InvalidHash,
    #[error("Block decode failed: {0}")]
    DecodeFailed(#[from] serde_json::Error),
}

/// A 32-byte block hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Raw hash bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a hash from its raw 32-byte wire form
    pub fn from_slice(bytes: &[u8]) -> Result<Self, BlockError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| BlockError::InvalidHash)?;
        Ok(Self(arr))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for BlockHash {
    type Err = BlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| BlockError::InvalidHash)?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A block in the chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// Block index/height
    pub index: u64,
    /// Hash of the previous block; `None` only for the genesis block
    pub previous_hash: Option<BlockHash>,
    /// Block creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Digest over the ordered transaction ids
    pub tx_digest: BlockHash,
    /// Block hash (cached for efficiency)
    pub hash: BlockHash,
    /// List of transactions in the block
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create the genesis block
    pub fn genesis(transactions: Vec<Transaction>) -> Self {
        Self::build(0, None, Utc::now(), transactions)
    }

    /// Create a block extending `previous`
    pub fn next(previous: &Block, transactions: Vec<Transaction>) -> Self {
        Self::build(
            previous.index + 1,
            Some(previous.hash),
            Utc::now(),
            transactions,
        )
    }

    fn build(
        index: u64,
        previous_hash: Option<BlockHash>,
        timestamp: DateTime<Utc>,
        transactions: Vec<Transaction>,
    ) -> Self {
        let tx_digest = Self::digest_transactions(&transactions);
        let hash = Self::compute_hash(index, previous_hash.as_ref(), &timestamp, &tx_digest);
        Self {
            index,
            previous_hash,
            timestamp,
            tx_digest,
            hash,
            transactions,
        }
    }

    /// Digest over the ordered transaction ids
    fn digest_transactions(transactions: &[Transaction]) -> BlockHash {
        let mut data = Vec::with_capacity(transactions.len() * 32);
        for tx in transactions {
            data.extend_from_slice(tx.id.as_bytes());
        }
        BlockHash(sha256(&data))
    }

    fn compute_hash(
        index: u64,
        previous_hash: Option<&BlockHash>,
        timestamp: &DateTime<Utc>,
        tx_digest: &BlockHash,
    ) -> BlockHash {
        let data = format!(
            "{}{}{}{}",
            index,
            previous_hash.map(|h| h.to_string()).unwrap_or_default(),
            timestamp.timestamp_micros(),
            tx_digest,
        );
        BlockHash(double_sha256(data.as_bytes()))
    }

    /// Verify the cached block hash
    pub fn verify_hash(&self) -> bool {
        self.hash
            == Self::compute_hash(
                self.index,
                self.previous_hash.as_ref(),
                &self.timestamp,
                &self.tx_digest,
            )
    }

    /// Verify the transaction digest
    pub fn verify_tx_digest(&self) -> bool {
        self.tx_digest == Self::digest_transactions(&self.transactions)
    }

    /// Serialize the block for wire transport
    pub fn to_bytes(&self) -> Result<Vec<u8>, BlockError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize a block received from the wire
    pub fn from_bytes(data: &[u8]) -> Result<Self, BlockError> {
        let block: Block = serde_json::from_slice(data)?;
        if !block.verify_hash() {
            return Err(BlockError::InvalidHash);
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis(vec![]);
        assert_eq!(genesis.index, 0);
        assert!(genesis.previous_hash.is_none());
        assert!(genesis.verify_hash());
        assert!(genesis.verify_tx_digest());
    }

    #[test]
    fn test_block_linking() {
        let genesis = Block::genesis(vec![]);
        let next = Block::next(&genesis, vec![]);

        assert_eq!(next.index, 1);
        assert_eq!(next.previous_hash, Some(genesis.hash));
        assert!(next.verify_hash());
    }

    #[test]
    fn test_block_wire_round_trip() {
        let genesis = Block::genesis(vec![]);
        let bytes = genesis.to_bytes().unwrap();
        let decoded = Block::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.index, genesis.index);
        assert_eq!(decoded.hash, genesis.hash);
    }

    #[test]
    fn test_tampered_block_rejected() {
        let genesis = Block::genesis(vec![]);
        let mut tampered = genesis.clone();
        tampered.index = 7;

        assert!(!tampered.verify_hash());
        let bytes = serde_json::to_vec(&tampered).unwrap();
        assert!(Block::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_hash_parse_round_trip() {
        let genesis = Block::genesis(vec![]);
        let parsed: BlockHash = genesis.hash.to_string().parse().unwrap();
        assert_eq!(parsed, genesis.hash);
    }
}
