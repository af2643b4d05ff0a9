//! NAT traversal relay interface
//!
//! The relay client itself (TURN or similar) lives outside the swarm;
//! the swarm only drives this narrow surface: detect NAT, allocate a
//! publicly reachable endpoint, keep the allocation alive, and adopt
//! relayed streams into the router.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;

/// Lifetime requested for relay allocations
pub const ALLOCATION_LIFETIME: Duration = Duration::from_secs(777);

/// How long before expiry an allocation is refreshed
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Relay-level errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Relay allocation failed: {0}")]
    Allocation(String),
}

/// Client for a NAT traversal relay server
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Whether the local node sits behind a NAT
    async fn is_behind_nat(&self) -> Result<bool, RelayError>;

    /// Reserve a relayed endpoint for `lifetime`; the returned address
    /// is what the node advertises to peers
    async fn allocate(&self, lifetime: Duration) -> Result<SocketAddr, RelayError>;

    /// Extend the current allocation; returns the granted lifetime
    async fn refresh(&self, lifetime: Duration) -> Result<Duration, RelayError>;

    /// Permit traffic from a peer endpoint through the relay
    async fn create_permission(&self, peer: SocketAddr) -> Result<(), RelayError>;

    /// Wait for the next inbound stream relayed to our allocation
    async fn accept_relayed_stream(&self) -> Result<(TcpStream, SocketAddr), RelayError>;

    /// The server-reflexive address observed by the relay
    async fn mapped_address(&self) -> Result<SocketAddr, RelayError>;
}
