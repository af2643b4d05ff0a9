//! P2P networking
//!
//! The peer swarm and everything it stands on:
//! - signed multipart wire messages
//! - peer identity and membership bookkeeping
//! - router/dealer TCP transport with reply routing
//! - periodic peer-set delta distribution
//! - block reconciliation and transaction gossip
//! - optional NAT traversal through a relay client

pub mod message;
pub mod peer;
pub mod relay;
pub mod swarm;
pub mod transport;

pub use message::{Message, MessageError, ReceivedMessage, MAX_HASHES_PER_REPLY};
pub use peer::{Peer, PeerParseError, PeerRegistry, PeerSetDelta};
pub use relay::{RelayClient, RelayError, ALLOCATION_LIFETIME, REFRESH_MARGIN};
pub use swarm::{
    Swarm, SwarmConfig, SwarmError, SwarmEvents, DEFAULT_DIAL_TIMEOUT,
    DEFAULT_DISTRIBUTE_INTERVAL,
};
pub use transport::{
    DealerSocket, FrameCodec, ReplyQueue, RouterSocket, TransportError, MAGIC, MAX_MESSAGE_SIZE,
};
