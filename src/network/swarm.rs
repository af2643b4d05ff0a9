//! The peer swarm
//!
//! The long-running networking core of a node: it dials peers with a
//! version handshake, answers liveness probes, distributes peer-set
//! deltas on a timer, serves block and transaction queries, and drives
//! the block reconciliation that keeps the local chain in agreement
//! with its neighbors.
//!
//! Concurrency model: one dispatcher reads the router socket and spawns
//! a fire-and-forget task per message; a single writer drains the reply
//! queue back onto the router. Shared state is guarded by four named
//! async locks, always acquired in the order running -> block-sync ->
//! receive -> distribute.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use secp256k1::PublicKey;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time;
use tokio::time::MissedTickBehavior;

use crate::chain::{
    Block, BlockError, BlockHash, Chain, ChainError, Transaction, TransactionError, TxId,
};
use crate::crypto::{Address, KeyError, KeyPair};
use crate::network::message::{
    self, Message, MessageError, ReceivedMessage, MAX_HASHES_PER_REPLY,
};
use crate::network::peer::{Peer, PeerRegistry, PeerSetDelta};
use crate::network::relay::{RelayClient, RelayError, ALLOCATION_LIFETIME, REFRESH_MARGIN};
use crate::network::transport::{DealerSocket, ReplyQueue, RouterSocket, TransportError};

/// Default dial handshake timeout
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Default period of the delta distributor
pub const DEFAULT_DISTRIBUTE_INTERVAL: Duration = Duration::from_millis(1500);

/// Per-dealer send timeout during broadcasts
const BROADCAST_SEND_TIMEOUT: Duration = Duration::from_millis(300);

/// Poll period of the inbound socket and the reply writer
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Every n-th delta tick is a full re-sync broadcast
const FULL_DISTRIBUTE_EVERY: u64 = 10;

/// Attempts at filling missing ancestors before a reconciliation fails
const FILL_ATTEMPTS: u32 = 3;

/// Swarm-level errors
#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("Swarm already running")]
    AlreadyRunning,
    #[error("Swarm is not running")]
    NotRunning,
    #[error("Either a local host or a relay client must be configured")]
    NoAdvertisableEndpoint,
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] MessageError),
    #[error("Peer {0} is not in the registry")]
    PeerNotFound(Address),
    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    ProtocolVersionMismatch { local: i32, remote: i32 },
    #[error("Unexpected reply, wanted {0}")]
    UnexpectedReply(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Operation timed out")]
    Timeout,
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Block decode failed: {0}")]
    BlockDecode(#[from] BlockError),
    #[error("Transaction decode failed: {0}")]
    TxDecode(#[from] TransactionError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
}

impl From<TransportError> for SwarmError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(e) => SwarmError::Io(e),
            TransportError::Timeout => SwarmError::Timeout,
            TransportError::Closed => SwarmError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by remote",
            )),
        }
    }
}

/// Dial failures that skip the peer instead of aborting the operation
fn is_tolerated_dial_failure(e: &SwarmError) -> bool {
    matches!(
        e,
        SwarmError::Io(_) | SwarmError::Timeout | SwarmError::ProtocolVersionMismatch { .. }
    )
}

/// Swarm construction parameters
#[derive(Clone)]
pub struct SwarmConfig {
    /// Node identity key
    pub keys: KeyPair,
    /// Application protocol version exchanged during the handshake
    pub app_protocol_version: i32,
    /// Host to advertise when no relay is configured
    pub host: Option<String>,
    /// Listen port; `None` or 0 picks any free port
    pub listen_port: Option<u16>,
    /// Dial handshake timeout
    pub dial_timeout: Duration,
}

impl SwarmConfig {
    pub fn new(keys: KeyPair, app_protocol_version: i32) -> Self {
        Self {
            keys,
            app_protocol_version,
            host: None,
            listen_port: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// Auto-reset event signals observable from outside the swarm
///
/// Each signal releases at most one waiter per occurrence; re-arm by
/// waiting again between events.
#[derive(Debug, Default)]
pub struct SwarmEvents {
    delta_received: Notify,
    delta_distributed: Notify,
    tx_received: Notify,
    block_received: Notify,
}

impl SwarmEvents {
    pub async fn delta_received(&self) {
        self.delta_received.notified().await
    }

    pub async fn delta_distributed(&self) {
        self.delta_distributed.notified().await
    }

    pub async fn tx_received(&self) {
        self.tx_received.notified().await
    }

    pub async fn block_received(&self) {
        self.block_received.notified().await
    }
}

/// Per-run state established by `start`
struct SwarmContext {
    chain: Arc<RwLock<Chain>>,
    advertised_host: String,
    advertised_port: u16,
}

/// The local node's view of the peer network plus the machinery to
/// talk to it
pub struct Swarm {
    keys: KeyPair,
    address: Address,
    version: i32,
    host: Option<String>,
    listen_port: Option<u16>,
    dial_timeout: Duration,
    relay: Option<Arc<dyn RelayClient>>,

    registry: PeerRegistry,
    dealers: RwLock<HashMap<Address, Arc<DealerSocket>>>,
    router: RwLock<Option<Arc<RouterSocket>>>,
    replies: ReplyQueue,
    context: RwLock<Option<SwarmContext>>,
    events: SwarmEvents,

    running: AtomicBool,
    running_lock: Mutex<()>,
    block_sync_lock: Mutex<()>,
    receive_lock: Mutex<()>,
    distribute_lock: Mutex<()>,

    last_distributed: RwLock<DateTime<Utc>>,
    last_received: RwLock<DateTime<Utc>>,
}

impl Swarm {
    /// Create a swarm
    ///
    /// Fails unless a local host or a relay client is supplied; without
    /// either there is no endpoint to advertise to peers.
    pub fn new(
        config: SwarmConfig,
        relay: Option<Arc<dyn RelayClient>>,
    ) -> Result<Self, SwarmError> {
        if config.host.is_none() && relay.is_none() {
            return Err(SwarmError::NoAdvertisableEndpoint);
        }

        let address = config.keys.address();
        Ok(Self {
            keys: config.keys,
            address,
            version: config.app_protocol_version,
            host: config.host,
            listen_port: config.listen_port,
            dial_timeout: config.dial_timeout,
            relay,
            registry: PeerRegistry::new(),
            dealers: RwLock::new(HashMap::new()),
            router: RwLock::new(None),
            replies: ReplyQueue::new(),
            context: RwLock::new(None),
            events: SwarmEvents::default(),
            running: AtomicBool::new(false),
            running_lock: Mutex::new(()),
            block_sync_lock: Mutex::new(()),
            receive_lock: Mutex::new(()),
            distribute_lock: Mutex::new(()),
            last_distributed: RwLock::new(DateTime::UNIX_EPOCH),
            last_received: RwLock::new(DateTime::UNIX_EPOCH),
        })
    }

    /// The local node address
    pub fn address(&self) -> Address {
        self.address
    }

    /// The local application protocol version
    pub fn app_protocol_version(&self) -> i32 {
        self.version
    }

    /// Whether the swarm is running
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Observable event signals
    pub fn events(&self) -> &SwarmEvents {
        &self.events
    }

    /// Snapshot of the active peers
    pub async fn peers(&self) -> Vec<Peer> {
        self.registry.peers().await
    }

    /// Number of active peers
    pub async fn peer_count(&self) -> usize {
        self.registry.count().await
    }

    /// The port the router is bound to, once started
    pub async fn listening_port(&self) -> Option<u16> {
        self.router.read().await.as_ref().map(|r| r.local_port())
    }

    /// Timestamp of the last applied inbound delta
    pub async fn last_received(&self) -> DateTime<Utc> {
        *self.last_received.read().await
    }

    /// The peer record the local node advertises, once started
    async fn self_peer(&self) -> Option<Peer> {
        let context = self.context.read().await;
        context.as_ref().map(|c| {
            Peer::new(
                self.keys.public_key,
                c.advertised_host.clone(),
                c.advertised_port,
            )
        })
    }

    async fn chain(&self) -> Option<Arc<RwLock<Chain>>> {
        self.context.read().await.as_ref().map(|c| c.chain.clone())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Run the swarm against `chain` until it fails or is stopped
    ///
    /// Binds the inbound socket, re-dials every already-known peer, and
    /// drives the dispatcher, delta distributor, and reply writer (plus
    /// relay upkeep behind NAT) until the first task errors or `stop`
    /// flips the running flag. Always tears down on the way out.
    pub async fn start(
        self: Arc<Self>,
        chain: Arc<RwLock<Chain>>,
        distribute_interval: Duration,
    ) -> Result<(), SwarmError> {
        let behind_nat;
        {
            let _guard = self.running_lock.lock().await;
            if self.running() {
                return Err(SwarmError::AlreadyRunning);
            }

            // NAT detection and relay allocation
            let mut advertised = None;
            behind_nat = match &self.relay {
                Some(relay) => {
                    let nat = relay.is_behind_nat().await?;
                    let endpoint = relay.allocate(ALLOCATION_LIFETIME).await?;
                    log::info!("Relay allocation obtained: {}", endpoint);
                    match relay.mapped_address().await {
                        Ok(mapped) => log::info!("Relay reports mapped address {}", mapped),
                        Err(e) => log::debug!("Mapped address unavailable: {}", e),
                    }
                    advertised = Some((endpoint.ip().to_string(), endpoint.port()));
                    nat
                }
                None => false,
            };

            let router = Arc::new(RouterSocket::bind(self.listen_port.unwrap_or(0)).await?);
            let local_port = router.local_port();
            let (advertised_host, advertised_port) = match advertised {
                Some(endpoint) => endpoint,
                None => {
                    let host = self
                        .host
                        .clone()
                        .ok_or(SwarmError::NoAdvertisableEndpoint)?;
                    (host, local_port)
                }
            };

            *self.router.write().await = Some(router);
            *self.context.write().await = Some(SwarmContext {
                chain,
                advertised_host: advertised_host.clone(),
                advertised_port,
            });
            self.running.store(true, Ordering::SeqCst);

            // Re-dial peers admitted before this run
            for peer in self.registry.peers().await {
                match self.dial(&peer).await {
                    Ok(dealer) => {
                        self.dealers.write().await.insert(peer.address(), dealer);
                    }
                    Err(e) if is_tolerated_dial_failure(&e) => {
                        log::warn!("Re-dial of {} failed: {}", peer, e);
                    }
                    Err(e) => {
                        self.stop_inner().await;
                        return Err(e);
                    }
                }
            }

            log::info!(
                "Swarm started on port {} advertising {}:{}",
                local_port,
                advertised_host,
                advertised_port
            );
        }

        let result = tokio::select! {
            r = Arc::clone(&self).dispatch_loop() => r,
            r = Arc::clone(&self).distribute_loop(distribute_interval) => r,
            r = Arc::clone(&self).reply_writer_loop() => r,
            r = Arc::clone(&self).relay_refresh_loop(), if behind_nat => r,
            r = Arc::clone(&self).relay_binding_loop(), if behind_nat => r,
        };

        if let Err(e) = &result {
            log::error!("Swarm task failed: {}", e);
        }
        self.stop().await;
        result
    }

    /// Announce departure and tear down all sockets
    ///
    /// Sets the running flag false; the loops observe it on their next
    /// poll rather than being cancelled here.
    pub async fn stop(&self) {
        let _guard = self.running_lock.lock().await;
        self.stop_inner().await;
    }

    async fn stop_inner(&self) {
        if !self.running() {
            return;
        }
        log::info!("Stopping swarm...");

        if let Some(me) = self.self_peer().await {
            self.registry.record_removed(me, Utc::now()).await;
        }
        self.distribute(false).await;

        if let Some(router) = self.router.write().await.take() {
            router.dispose();
        }
        self.dealers.write().await.clear();
        *self.context.write().await = None;
        self.running.store(false, Ordering::SeqCst);
        log::info!("Swarm stopped");
    }

    // =========================================================================
    // Dialing and membership
    // =========================================================================

    /// Dial a peer: connect, ping, and verify the protocol version
    ///
    /// Any failure drops the socket before the error propagates.
    async fn dial(&self, peer: &Peer) -> Result<Arc<DealerSocket>, SwarmError> {
        let identity = Bytes::copy_from_slice(self.address.as_bytes());
        let dealer =
            DealerSocket::connect(&peer.host, peer.port, identity, self.dial_timeout).await?;

        let ping = message::encode(&Message::Ping, &self.keys, None)?;
        let mut replies = dealer.exchange(ping, 1, self.dial_timeout).await?;
        let received = message::parse(&replies.remove(0), true)?;

        match received.message {
            Message::Pong { version } if version == self.version => Ok(Arc::new(dealer)),
            Message::Pong { version } => Err(SwarmError::ProtocolVersionMismatch {
                local: self.version,
                remote: version,
            }),
            _ => Err(SwarmError::UnexpectedReply("Pong")),
        }
    }

    /// Admit peers into the registry, dialing each unknown one
    ///
    /// The local key and already-known peers are skipped. Dial failures
    /// of the tolerated kinds skip that peer with a log line; anything
    /// else aborts. Returns the accepted subset.
    pub async fn add_peers(
        &self,
        peers: Vec<Peer>,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Peer>, SwarmError> {
        let mut accepted = Vec::new();
        for peer in peers {
            if peer.public_key == self.keys.public_key {
                continue;
            }
            if self.registry.contains(&peer).await {
                continue;
            }
            if !self.registry.can_admit(&peer, timestamp).await {
                log::debug!("Rejecting {}: removed with a newer timestamp", peer);
                continue;
            }

            if self.running() {
                match self.dial(&peer).await {
                    Ok(dealer) => {
                        self.dealers.write().await.insert(peer.address(), dealer);
                        self.permit_through_relay(&peer).await;
                    }
                    Err(e) if is_tolerated_dial_failure(&e) => {
                        log::warn!("Skipping peer {}: {}", peer, e);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            if self.registry.insert(peer.clone(), timestamp).await {
                log::info!("Added peer {}", peer);
                accepted.push(peer);
            }
        }
        Ok(accepted)
    }

    /// Ask the relay, if any, to pass the peer's traffic through
    async fn permit_through_relay(&self, peer: &Peer) {
        let Some(relay) = &self.relay else {
            return;
        };
        match peer.endpoint().parse() {
            Ok(endpoint) => {
                if let Err(e) = relay.create_permission(endpoint).await {
                    log::warn!("Relay permission for {} failed: {}", peer, e);
                }
            }
            Err(_) => log::debug!("Peer {} endpoint is not a socket address", peer),
        }
    }

    /// Remove peers and tear down their outbound sockets
    pub async fn remove_peers(&self, peers: &HashSet<Peer>, timestamp: DateTime<Utc>) {
        let _guard = self.distribute_lock.lock().await;
        let dropped = self
            .registry
            .mark_removed(peers, timestamp, &self.keys.public_key)
            .await;

        let mut dealers = self.dealers.write().await;
        for peer in &dropped {
            if dealers.remove(&peer.address()).is_some() {
                log::info!("Removed peer {} and closed its socket", peer);
            } else {
                log::info!("Removed peer {}", peer);
            }
        }
    }

    // =========================================================================
    // Delta distribution
    // =========================================================================

    /// Send the membership changes since the previous broadcast to every
    /// outbound socket; `all` adds the full active set for re-sync
    pub async fn distribute(&self, all: bool) {
        let Some(me) = self.self_peer().await else {
            return;
        };
        let _guard = self.distribute_lock.lock().await;

        let now = Utc::now();
        let last = *self.last_distributed.read().await;
        let added = self.registry.added_between(last, now).await;
        let removed = self.registry.take_removals_until(now).await;
        let existing = if all {
            Some(self.registry.active_except(&added).await)
        } else {
            None
        };

        if added.is_empty() && removed.is_empty() && !all {
            return;
        }

        let delta = PeerSetDelta {
            sender: me,
            timestamp: now,
            added,
            removed,
            existing,
        };
        log::debug!(
            "Distributing delta: {} added, {} removed, full={}",
            delta.added.len(),
            delta.removed.len(),
            all
        );

        let frames = match message::encode(&Message::PeerSetDelta(delta), &self.keys, None) {
            Ok(frames) => frames,
            Err(e) => {
                log::error!("Failed to encode peer delta: {}", e);
                return;
            }
        };
        *self.last_distributed.write().await = now;

        let dealers: Vec<(Address, Arc<DealerSocket>)> = self
            .dealers
            .read()
            .await
            .iter()
            .map(|(addr, dealer)| (*addr, dealer.clone()))
            .collect();
        for (address, dealer) in dealers {
            if let Err(e) = dealer.send(frames.clone(), BROADCAST_SEND_TIMEOUT).await {
                log::warn!("Failed to send delta to {}: {}", address, e);
            }
        }
        self.events.delta_distributed.notify_one();
    }

    /// Apply an inbound membership delta
    ///
    /// An unknown sender announces itself; the first encounter is
    /// reciprocated with a full broadcast so the new peer learns our
    /// whole view.
    async fn process_delta(&self, mut delta: PeerSetDelta) {
        let sender = delta.sender.clone();
        let first_encounter = !self.registry.contains(&sender).await;
        if first_encounter {
            delta.added.insert(sender.clone());
        }

        {
            let _guard = self.receive_lock.lock().await;
            self.remove_peers(&delta.removed, delta.timestamp).await;

            let removed_keys: HashSet<PublicKey> =
                delta.removed.iter().map(|p| p.public_key).collect();
            let to_add: Vec<Peer> = delta
                .added
                .into_iter()
                .chain(delta.existing.unwrap_or_default())
                .filter(|p| !removed_keys.contains(&p.public_key))
                .collect();
            if let Err(e) = self.add_peers(to_add, delta.timestamp).await {
                log::warn!("Applying peer delta from {} failed: {}", sender, e);
            }
        }

        let now = Utc::now();
        *self.last_received.write().await = now;
        self.registry.record_seen(&sender, now).await;
        self.events.delta_received.notify_one();

        if first_encounter {
            self.distribute(true).await;
        }
    }

    // =========================================================================
    // Dispatcher
    // =========================================================================

    async fn dispatch_loop(self: Arc<Self>) -> Result<(), SwarmError> {
        loop {
            if !self.running() {
                return Ok(());
            }
            let router = match self.router.read().await.clone() {
                Some(router) => router,
                None => return Ok(()),
            };
            let Some(frames) = router.recv(POLL_INTERVAL).await else {
                continue;
            };
            let received = match message::parse(&frames, false) {
                Ok(received) => received,
                Err(e) => {
                    log::warn!("Invalid message: {}", e);
                    continue;
                }
            };
            log::debug!("Received {}", received.message.type_name());

            let swarm = Arc::clone(&self);
            tokio::spawn(swarm.handle_message(received));
        }
    }

    /// Handle one parsed message; errors are logged, never fatal to the
    /// dispatcher
    async fn handle_message(self: Arc<Self>, received: ReceivedMessage) {
        let ReceivedMessage {
            message,
            signer,
            identity,
        } = received;

        match message {
            Message::Ping => {
                self.enqueue_reply(
                    &identity,
                    &Message::Pong {
                        version: self.version,
                    },
                );
            }
            Message::PeerSetDelta(delta) => {
                if delta.sender.public_key != signer {
                    log::warn!("Delta sender does not match message signer, dropping");
                    return;
                }
                self.process_delta(delta).await;
            }
            Message::GetBlockHashes { locator, stop } => {
                let Some(chain) = self.chain().await else {
                    return;
                };
                let hashes = chain
                    .read()
                    .await
                    .find_next_hashes(&locator, stop, MAX_HASHES_PER_REPLY);
                self.enqueue_reply(
                    &identity,
                    &Message::BlockHashes {
                        sender: self.address,
                        hashes,
                    },
                );
            }
            Message::GetBlocks { hashes } => {
                let Some(chain) = self.chain().await else {
                    return;
                };
                for hash in hashes {
                    let encoded = chain
                        .read()
                        .await
                        .get_block(&hash)
                        .map(|block| block.to_bytes());
                    match encoded {
                        Some(Ok(bytes)) => self.enqueue_reply(
                            &identity,
                            &Message::Block {
                                payload: Bytes::from(bytes),
                            },
                        ),
                        Some(Err(e)) => log::error!("Failed to encode block {}: {}", hash, e),
                        None => log::debug!("Requested block {} not found", hash),
                    }
                }
            }
            Message::GetTxs { ids } => {
                let Some(chain) = self.chain().await else {
                    return;
                };
                for id in ids {
                    let encoded = chain
                        .read()
                        .await
                        .get_transaction(&id)
                        .map(|tx| tx.to_bytes());
                    match encoded {
                        Some(Ok(bytes)) => self.enqueue_reply(
                            &identity,
                            &Message::Tx {
                                payload: Bytes::from(bytes),
                            },
                        ),
                        Some(Err(e)) => log::error!("Failed to encode tx {}: {}", id, e),
                        None => log::debug!("Requested tx {} not found", id),
                    }
                }
            }
            Message::TxIds { sender, ids } => {
                if let Err(e) = self.process_tx_ids(sender, ids).await {
                    log::warn!("Processing tx announcement from {} failed: {}", sender, e);
                }
            }
            Message::BlockHashes { sender, hashes } => {
                if let Err(e) = self.process_block_hashes(sender, hashes).await {
                    log::warn!(
                        "Processing block announcement from {} failed: {}",
                        sender,
                        e
                    );
                }
            }
            Message::Pong { .. } | Message::Block { .. } | Message::Tx { .. } => {
                // Replies travel dealer-side only; reaching here is a bug
                unreachable!("{} routed to the dispatcher", message.type_name());
            }
        }
    }

    fn enqueue_reply(&self, identity: &Bytes, message: &Message) {
        match message::encode(message, &self.keys, Some(identity)) {
            Ok(frames) => self.replies.enqueue(identity.clone(), frames),
            Err(e) => log::error!("Failed to encode {} reply: {}", message.type_name(), e),
        }
    }

    // =========================================================================
    // Peer queries
    // =========================================================================

    async fn dealer_for(&self, address: &Address) -> Result<Arc<DealerSocket>, SwarmError> {
        self.dealers
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or(SwarmError::PeerNotFound(*address))
    }

    /// Ask a peer for the hashes following our locator
    async fn get_block_hashes(
        &self,
        address: &Address,
        locator: Vec<BlockHash>,
        stop: Option<BlockHash>,
    ) -> Result<Vec<BlockHash>, SwarmError> {
        let dealer = self.dealer_for(address).await?;
        let request = message::encode(
            &Message::GetBlockHashes { locator, stop },
            &self.keys,
            None,
        )?;
        let mut replies = dealer.exchange(request, 1, self.dial_timeout).await?;
        let received = message::parse(&replies.remove(0), true)?;
        match received.message {
            Message::BlockHashes { hashes, .. } => Ok(hashes),
            _ => Err(SwarmError::UnexpectedReply("BlockHashes")),
        }
    }

    /// Fetch blocks from a peer, one streamed reply per requested hash
    async fn get_blocks(
        &self,
        address: &Address,
        hashes: &[BlockHash],
    ) -> Result<Vec<Block>, SwarmError> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let dealer = self.dealer_for(address).await?;
        let request = message::encode(
            &Message::GetBlocks {
                hashes: hashes.to_vec(),
            },
            &self.keys,
            None,
        )?;
        let replies = dealer
            .exchange(request, hashes.len(), self.dial_timeout)
            .await?;

        let mut blocks = Vec::with_capacity(replies.len());
        for frames in replies {
            let received = message::parse(&frames, true)?;
            match received.message {
                Message::Block { payload } => blocks.push(Block::from_bytes(&payload)?),
                _ => return Err(SwarmError::UnexpectedReply("Block")),
            }
        }
        Ok(blocks)
    }

    /// Fetch transactions from a peer, one streamed reply per id
    async fn get_txs(
        &self,
        address: &Address,
        ids: &[TxId],
    ) -> Result<Vec<Transaction>, SwarmError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let dealer = self.dealer_for(address).await?;
        let request =
            message::encode(&Message::GetTxs { ids: ids.to_vec() }, &self.keys, None)?;
        let replies = dealer.exchange(request, ids.len(), self.dial_timeout).await?;

        let mut txs = Vec::with_capacity(replies.len());
        for frames in replies {
            let received = message::parse(&frames, true)?;
            match received.message {
                Message::Tx { payload } => txs.push(Transaction::from_bytes(&payload)?),
                _ => return Err(SwarmError::UnexpectedReply("Tx")),
            }
        }
        Ok(txs)
    }

    // =========================================================================
    // Block reconciliation
    // =========================================================================

    /// Reconcile the local chain with a peer's block announcement
    ///
    /// Fetches the announced blocks, negotiates the branch point via the
    /// locator exchange, chooses a working chain (the live chain, a fork
    /// at the branch point, or a fresh one when nothing is shared), fills
    /// the gap up to the announcement, appends, and swaps the working
    /// chain in. Only one reconciliation runs at a time.
    async fn process_block_hashes(
        &self,
        sender: Address,
        hashes: Vec<BlockHash>,
    ) -> Result<(), SwarmError> {
        if self.registry.find_by_address(&sender).await.is_none() {
            log::debug!("Ignoring block announcement from unknown peer {}", sender);
            return Ok(());
        }
        if hashes.is_empty() {
            return Ok(());
        }
        let Some(chain) = self.chain().await else {
            return Err(SwarmError::NotRunning);
        };

        let _guard = self.block_sync_lock.lock().await;

        let blocks = self.get_blocks(&sender, &hashes).await?;
        let (Some(oldest), Some(latest_index)) =
            (blocks.first().cloned(), blocks.last().map(|b| b.index))
        else {
            return Ok(());
        };

        {
            let guard = chain.read().await;
            if let Some(tip) = guard.tip() {
                if latest_index <= tip.index {
                    log::debug!(
                        "Stale announcement from {}: their {} <= our {}",
                        sender,
                        latest_index,
                        tip.index
                    );
                    return Ok(());
                }
            }
        }

        // Negotiate the branch point
        let locator = chain.read().await.block_locator();
        let branch_point = if locator.is_empty() {
            None
        } else {
            self.get_block_hashes(&sender, locator, Some(oldest.hash))
                .await?
                .into_iter()
                .next()
        };

        // Choose the working chain
        let tip_hash = chain.read().await.tip().map(|b| b.hash);
        let mut working: Option<Chain> = if tip_hash.is_none() || branch_point == tip_hash {
            None // operate on the live chain directly
        } else {
            let guard = chain.read().await;
            match branch_point {
                Some(bp) if guard.has_block(&bp) => Some(guard.fork(&bp)?),
                _ => Some(guard.empty_fork()),
            }
        };

        // Fill missing ancestors between the working tip and the
        // announcement, retrying transient failures
        let mut attempt = 1;
        loop {
            match self
                .fill_ancestors(&sender, &chain, &mut working, &oldest)
                .await
            {
                Ok(()) => break,
                Err(e) if attempt < FILL_ATTEMPTS => {
                    log::warn!(
                        "Ancestor fill attempt {}/{} failed: {}",
                        attempt,
                        FILL_ATTEMPTS,
                        e
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }

        for block in blocks {
            self.append_block(&chain, &mut working, block).await?;
        }

        if let Some(working) = working {
            let height = working.tip().map(|b| b.index);
            chain.write().await.swap(working);
            log::info!("Reconciled chain swapped in at height {:?}", height);
        }
        self.events.block_received.notify_one();
        Ok(())
    }

    /// Fetch and append ancestors until the working tip links to the
    /// oldest announced block
    async fn fill_ancestors(
        &self,
        sender: &Address,
        chain: &Arc<RwLock<Chain>>,
        working: &mut Option<Chain>,
        oldest: &Block,
    ) -> Result<(), SwarmError> {
        loop {
            let (tip_hash, locator) = match working.as_ref() {
                Some(w) => (w.tip().map(|b| b.hash), w.block_locator()),
                None => {
                    let guard = chain.read().await;
                    (guard.tip().map(|b| b.hash), guard.block_locator())
                }
            };
            if tip_hash == oldest.previous_hash {
                return Ok(());
            }

            let mut hashes = self
                .get_block_hashes(sender, locator, oldest.previous_hash)
                .await?;
            if tip_hash.is_some() && !hashes.is_empty() {
                // The first hash is the working tip itself
                hashes.remove(0);
            }
            if hashes.is_empty() {
                return Err(SwarmError::UnexpectedReply("ancestor hashes"));
            }

            let blocks = self.get_blocks(sender, &hashes).await?;
            if blocks.is_empty() {
                return Err(SwarmError::UnexpectedReply("ancestor blocks"));
            }
            for block in blocks {
                self.append_block(chain, working, block).await?;
            }
        }
    }

    async fn append_block(
        &self,
        chain: &Arc<RwLock<Chain>>,
        working: &mut Option<Chain>,
        block: Block,
    ) -> Result<(), SwarmError> {
        match working.as_mut() {
            Some(w) => w.append(block)?,
            None => chain.write().await.append(block)?,
        }
        Ok(())
    }

    // =========================================================================
    // Tx gossip
    // =========================================================================

    /// Fetch and stage the transactions we do not know yet
    async fn process_tx_ids(&self, sender: Address, ids: Vec<TxId>) -> Result<(), SwarmError> {
        let Some(chain) = self.chain().await else {
            return Err(SwarmError::NotRunning);
        };

        let unknown: Vec<TxId> = {
            let guard = chain.read().await;
            ids.into_iter().filter(|id| !guard.has_transaction(id)).collect()
        };
        if unknown.is_empty() {
            return Ok(());
        }

        let txs = self.get_txs(&sender, &unknown).await?;
        let staged = txs.len();
        chain.write().await.stage_transactions(txs);
        log::debug!("Staged {} transactions from {}", staged, sender);
        self.events.tx_received.notify_one();
        Ok(())
    }

    // =========================================================================
    // Broadcasts
    // =========================================================================

    /// Announce blocks to every connected peer
    pub async fn broadcast_blocks(&self, blocks: &[Block]) -> Result<(), SwarmError> {
        if !self.running() {
            return Err(SwarmError::NotRunning);
        }
        self.broadcast(Message::BlockHashes {
            sender: self.address,
            hashes: blocks.iter().map(|b| b.hash).collect(),
        })
        .await
    }

    /// Announce transactions to every connected peer
    pub async fn broadcast_txs(&self, txs: &[Transaction]) -> Result<(), SwarmError> {
        if !self.running() {
            return Err(SwarmError::NotRunning);
        }
        self.broadcast(Message::TxIds {
            sender: self.address,
            ids: txs.iter().map(|tx| tx.id).collect(),
        })
        .await
    }

    async fn broadcast(&self, message: Message) -> Result<(), SwarmError> {
        let frames = message::encode(&message, &self.keys, None)?;
        let dealers: Vec<(Address, Arc<DealerSocket>)> = self
            .dealers
            .read()
            .await
            .iter()
            .map(|(addr, dealer)| (*addr, dealer.clone()))
            .collect();
        for (address, dealer) in dealers {
            if let Err(e) = dealer.send(frames.clone(), BROADCAST_SEND_TIMEOUT).await {
                log::warn!(
                    "Broadcast of {} to {} failed: {}",
                    message.type_name(),
                    address,
                    e
                );
            }
        }
        Ok(())
    }

    // =========================================================================
    // Timer-driven loops
    // =========================================================================

    async fn distribute_loop(self: Arc<Self>, interval: Duration) -> Result<(), SwarmError> {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick: u64 = 0;
        loop {
            ticker.tick().await;
            if !self.running() {
                return Ok(());
            }
            tick += 1;
            self.distribute(tick % FULL_DISTRIBUTE_EVERY == 0).await;
        }
    }

    async fn reply_writer_loop(self: Arc<Self>) -> Result<(), SwarmError> {
        loop {
            if !self.running() {
                return Ok(());
            }
            let Some((identity, frames)) = self.replies.next(POLL_INTERVAL).await else {
                continue;
            };
            let router = match self.router.read().await.clone() {
                Some(router) => router,
                None => return Ok(()),
            };
            if !router.route(&identity, frames).await {
                log::debug!("No route for reply identity, dropping");
            }
        }
    }

    async fn relay_refresh_loop(self: Arc<Self>) -> Result<(), SwarmError> {
        let Some(relay) = self.relay.clone() else {
            return Ok(());
        };
        let mut lifetime = ALLOCATION_LIFETIME;
        loop {
            let wait = lifetime
                .saturating_sub(REFRESH_MARGIN)
                .max(Duration::from_secs(1));
            time::sleep(wait).await;
            if !self.running() {
                return Ok(());
            }
            lifetime = relay.refresh(ALLOCATION_LIFETIME).await?;
            log::debug!("Relay allocation refreshed for {:?}", lifetime);
        }
    }

    async fn relay_binding_loop(self: Arc<Self>) -> Result<(), SwarmError> {
        let Some(relay) = self.relay.clone() else {
            return Ok(());
        };
        loop {
            if !self.running() {
                return Ok(());
            }
            let (stream, remote) = relay.accept_relayed_stream().await?;
            if let Some(router) = self.router.read().await.clone() {
                router.adopt(stream, remote);
                log::debug!("Adopted relayed stream from {}", remote);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;

    fn test_config(version: i32) -> SwarmConfig {
        let mut config = SwarmConfig::new(KeyPair::generate(), version);
        config.host = Some("127.0.0.1".to_string());
        config.listen_port = Some(0);
        config
    }

    /// Spawn a started swarm and wait for its router to bind
    async fn start_swarm(
        version: i32,
        chain: Arc<RwLock<Chain>>,
    ) -> (Arc<Swarm>, Peer) {
        let swarm = Arc::new(Swarm::new(test_config(version), None).unwrap());
        {
            let swarm = swarm.clone();
            tokio::spawn(async move { swarm.start(chain, Duration::from_millis(100)).await });
        }
        let me = loop {
            if let Some(me) = swarm.self_peer().await {
                break me;
            }
            time::sleep(Duration::from_millis(10)).await;
        };
        (swarm, me)
    }

    async fn wait_until<F, Fut>(mut cond: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if cond().await {
                return true;
            }
            time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn grow(chain: &mut Chain, count: usize) -> Vec<Block> {
        let mut grown = Vec::with_capacity(count);
        for _ in 0..count {
            let next = Block::next(chain.tip().unwrap(), vec![]);
            chain.append(next.clone()).unwrap();
            grown.push(next);
        }
        grown
    }

    fn grow_with_txs(chain: &mut Chain, count: usize, keys: &KeyPair) -> Vec<Block> {
        let mut grown = Vec::with_capacity(count);
        for i in 0..count {
            let tx = Transaction::new_signed(keys, "fork", i as u64, i as u64).unwrap();
            let next = Block::next(chain.tip().unwrap(), vec![tx]);
            chain.append(next.clone()).unwrap();
            grown.push(next);
        }
        grown
    }

    #[test]
    fn test_construction_requires_endpoint() {
        let config = SwarmConfig::new(KeyPair::generate(), 1);
        assert!(matches!(
            Swarm::new(config, None),
            Err(SwarmError::NoAdvertisableEndpoint)
        ));
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let chain = Arc::new(RwLock::new(Chain::new()));
        let (swarm, _) = start_swarm(1, chain.clone()).await;

        assert!(matches!(
            swarm.clone().start(chain, Duration::from_millis(100)).await,
            Err(SwarmError::AlreadyRunning)
        ));
        swarm.stop().await;
    }

    #[tokio::test]
    async fn test_two_node_handshake() {
        let chain_a = Arc::new(RwLock::new(Chain::new()));
        let chain_b = Arc::new(RwLock::new(chain_a.read().await.clone()));
        let (a, peer_a) = start_swarm(1, chain_a).await;
        let (b, peer_b) = start_swarm(1, chain_b).await;

        let accepted = b.add_peers(vec![peer_a.clone()], Utc::now()).await.unwrap();
        assert_eq!(accepted, vec![peer_a.clone()]);
        assert!(b.registry.contains(&peer_a).await);
        assert!(b.dealers.read().await.contains_key(&peer_a.address()));

        // B announces A in its next delta, A reciprocates
        time::timeout(Duration::from_secs(5), b.events().delta_distributed())
            .await
            .unwrap();
        assert!(wait_until(|| async { a.registry.contains(&peer_b).await }).await);
        assert!(a.dealers.read().await.contains_key(&peer_b.address()));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_version_mismatch_rejects_peer() {
        let chain_a = Arc::new(RwLock::new(Chain::new()));
        let chain_b = Arc::new(RwLock::new(Chain::new()));
        let (a, peer_a) = start_swarm(1, chain_a).await;
        let (b, _) = start_swarm(2, chain_b).await;

        let accepted = b.add_peers(vec![peer_a.clone()], Utc::now()).await.unwrap();
        assert!(accepted.is_empty());
        assert!(!b.registry.contains(&peer_a).await);
        assert!(!b.dealers.read().await.contains_key(&peer_a.address()));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_block_propagation() {
        let base = Chain::new();
        let mut longer = base.clone();
        let announced = grow(&mut longer, 5);
        let target_tip = longer.tip().unwrap().hash;

        let chain_a = Arc::new(RwLock::new(base));
        let chain_b = Arc::new(RwLock::new(longer));
        let (a, peer_a) = start_swarm(1, chain_a.clone()).await;
        let (b, peer_b) = start_swarm(1, chain_b).await;

        b.add_peers(vec![peer_a], Utc::now()).await.unwrap();
        assert!(wait_until(|| async { a.registry.contains(&peer_b).await }).await);

        b.broadcast_blocks(&announced).await.unwrap();
        time::timeout(Duration::from_secs(10), a.events().block_received())
            .await
            .unwrap();

        let guard = chain_a.read().await;
        assert_eq!(guard.tip().unwrap().hash, target_tip);
        assert_eq!(guard.tip().unwrap().index, 5);
        drop(guard);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_fork_reconciliation() {
        let fork_x = KeyPair::generate();
        let fork_y = KeyPair::generate();

        // Common prefix of 8 blocks (heights 0..=7)
        let mut base = Chain::new();
        grow_with_txs(&mut base, 7, &fork_x);

        // A extends to height 10 on its own fork
        let mut a_side = base.clone();
        grow_with_txs(&mut a_side, 3, &fork_x);

        // B extends to height 12 on a different fork
        let mut b_side = base.clone();
        let announced = grow_with_txs(&mut b_side, 5, &fork_y);
        let target_tip = b_side.tip().unwrap().hash;
        let shared_prefix = base.tip().unwrap().hash;

        let chain_a = Arc::new(RwLock::new(a_side));
        let chain_b = Arc::new(RwLock::new(b_side));
        let (a, peer_a) = start_swarm(1, chain_a.clone()).await;
        let (b, peer_b) = start_swarm(1, chain_b).await;

        b.add_peers(vec![peer_a], Utc::now()).await.unwrap();
        assert!(wait_until(|| async { a.registry.contains(&peer_b).await }).await);

        b.broadcast_blocks(&announced).await.unwrap();
        time::timeout(Duration::from_secs(10), a.events().block_received())
            .await
            .unwrap();

        let guard = chain_a.read().await;
        assert_eq!(guard.tip().unwrap().index, 12);
        assert_eq!(guard.tip().unwrap().hash, target_tip);
        // The shared prefix survived the swap
        assert!(guard.has_block(&shared_prefix));
        drop(guard);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_stale_announcement_leaves_chain_unchanged() {
        let mut base = Chain::new();
        grow(&mut base, 5);
        let tip_before = base.tip().unwrap().hash;

        let shorter = {
            let mut c = Chain::new();
            // Unrelated short chain
            grow(&mut c, 2);
            c
        };
        let announced: Vec<Block> = vec![shorter.tip().unwrap().clone()];

        let chain_a = Arc::new(RwLock::new(base));
        let chain_b = Arc::new(RwLock::new(shorter));
        let (a, peer_a) = start_swarm(1, chain_a.clone()).await;
        let (b, peer_b) = start_swarm(1, chain_b).await;

        b.add_peers(vec![peer_a], Utc::now()).await.unwrap();
        assert!(wait_until(|| async { a.registry.contains(&peer_b).await }).await);

        b.broadcast_blocks(&announced).await.unwrap();
        // Give the announcement time to be dropped
        time::sleep(Duration::from_millis(500)).await;

        assert_eq!(chain_a.read().await.tip().unwrap().hash, tip_before);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_tx_gossip() {
        let chain_a = Arc::new(RwLock::new(Chain::new()));
        let chain_b = Arc::new(RwLock::new(chain_a.read().await.clone()));
        let (a, peer_a) = start_swarm(1, chain_a.clone()).await;
        let (b, peer_b) = start_swarm(1, chain_b.clone()).await;

        b.add_peers(vec![peer_a], Utc::now()).await.unwrap();
        assert!(wait_until(|| async { a.registry.contains(&peer_b).await }).await);

        let keys = KeyPair::generate();
        let tx = Transaction::new_signed(&keys, "someone", 42, 0).unwrap();
        let id = tx.id;
        chain_b.write().await.stage_transactions(vec![tx.clone()]);

        b.broadcast_txs(&[tx]).await.unwrap();
        time::timeout(Duration::from_secs(10), a.events().tx_received())
            .await
            .unwrap();
        assert!(chain_a.read().await.has_transaction(&id));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_removal_announcement() {
        let chain_a = Arc::new(RwLock::new(Chain::new()));
        let chain_b = Arc::new(RwLock::new(Chain::new()));
        let (a, peer_a) = start_swarm(1, chain_a).await;
        let (b, peer_b) = start_swarm(1, chain_b).await;

        b.add_peers(vec![peer_a], Utc::now()).await.unwrap();
        assert!(wait_until(|| async { a.registry.contains(&peer_b).await }).await);

        b.stop().await;

        assert!(wait_until(|| async { !a.registry.contains(&peer_b).await }).await);
        assert!(!a.dealers.read().await.contains_key(&peer_b.address()));

        a.stop().await;
    }
}
