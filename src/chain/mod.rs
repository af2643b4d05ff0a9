//! Chain data model
//!
//! Blocks, transactions, and the in-memory chain the swarm reconciles
//! against its peers.

pub mod block;
#[allow(clippy::module_inception)]
pub mod chain;
pub mod transaction;

pub use block::{Block, BlockError, BlockHash};
pub use chain::{Chain, ChainError};
pub use transaction::{Transaction, TransactionError, TxId};
