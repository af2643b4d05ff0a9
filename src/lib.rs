//! Chainswarm: the peer-to-peer networking core of a blockchain node
//!
//! This crate provides the swarm a node runs to stay in agreement with
//! its neighbors:
//! - peer discovery through signed membership deltas
//! - a reliable request/reply protocol over a router/dealer transport
//! - block reconciliation (locator exchange, branch-point detection,
//!   forking, gap fill, atomic chain swap)
//! - transaction gossip into a staged pool
//! - optional NAT traversal through a relay client
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::sync::RwLock;
//! use chainswarm::chain::Chain;
//! use chainswarm::crypto::KeyPair;
//! use chainswarm::network::{Swarm, SwarmConfig, DEFAULT_DISTRIBUTE_INTERVAL};
//!
//! # async fn run() -> Result<(), chainswarm::network::SwarmError> {
//! let mut config = SwarmConfig::new(KeyPair::generate(), 1);
//! config.host = Some("127.0.0.1".to_string());
//!
//! let swarm = Arc::new(Swarm::new(config, None)?);
//! let chain = Arc::new(RwLock::new(Chain::new()));
//! swarm.start(chain, DEFAULT_DISTRIBUTE_INTERVAL).await
//! # }
//! ```

pub mod chain;
pub mod crypto;
pub mod network;

// Re-export commonly used types
pub use chain::{Block, BlockHash, Chain, Transaction, TxId};
pub use crypto::{Address, KeyPair};
pub use network::{Peer, Swarm, SwarmConfig, SwarmError};
