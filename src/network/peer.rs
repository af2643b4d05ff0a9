//! Peer identity and membership bookkeeping
//!
//! A peer is a public key plus a network endpoint. The registry tracks
//! active peers with the timestamp they were admitted, recently removed
//! peers awaiting announcement, and per-peer last-seen times. All
//! mutation happens under the swarm's named locks; the registry itself
//! only enforces the timestamp invariants.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::crypto::Address;

/// Errors from parsing peer descriptors
#[derive(Error, Debug)]
pub enum PeerParseError {
    #[error("Peer descriptor must look like <public-key-hex>@<host>:<port>")]
    BadFormat,
    #[error("Invalid public key in peer descriptor")]
    BadPublicKey,
    #[error("Invalid port in peer descriptor")]
    BadPort,
}

mod pubkey_hex {
    use secp256k1::PublicKey;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &PublicKey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key.serialize()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PublicKey, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        PublicKey::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// A remote node: public key plus endpoint
///
/// Two peers are equal when both the key and the endpoint match;
/// immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    #[serde(with = "pubkey_hex")]
    pub public_key: PublicKey,
    pub host: String,
    pub port: u16,
}

impl Peer {
    pub fn new(public_key: PublicKey, host: impl Into<String>, port: u16) -> Self {
        Self {
            public_key,
            host: host.into(),
            port,
        }
    }

    /// The 20-byte address derived from the peer's public key
    pub fn address(&self) -> Address {
        Address::derive(&self.public_key)
    }

    /// `host:port` dial target
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.address(), self.host, self.port)
    }
}

impl FromStr for Peer {
    type Err = PeerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, endpoint) = s.split_once('@').ok_or(PeerParseError::BadFormat)?;
        let (host, port) = endpoint.rsplit_once(':').ok_or(PeerParseError::BadFormat)?;

        let key_bytes = hex::decode(key).map_err(|_| PeerParseError::BadPublicKey)?;
        let public_key =
            PublicKey::from_slice(&key_bytes).map_err(|_| PeerParseError::BadPublicKey)?;
        let port = port.parse().map_err(|_| PeerParseError::BadPort)?;
        Ok(Self::new(public_key, host, port))
    }
}

/// Membership changes since the sender's previous broadcast
///
/// `existing` is present only on full re-sync broadcasts and carries the
/// sender's active set minus the freshly added peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSetDelta {
    pub sender: Peer,
    pub timestamp: DateTime<Utc>,
    pub added: HashSet<Peer>,
    pub removed: HashSet<Peer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing: Option<HashSet<Peer>>,
}

/// Tracks active and recently removed peers
///
/// Invariants:
/// - the local node never appears in the active map;
/// - a removed peer re-enters only with a strictly newer timestamp;
/// - removals are handed out for announcement exactly once.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    /// Peer -> admission timestamp; drives delta computation
    active: RwLock<HashMap<Peer, DateTime<Utc>>>,
    /// Peer -> removal timestamp, pending announcement
    removed: RwLock<HashMap<Peer, DateTime<Utc>>>,
    /// Peer -> last time we heard from it
    last_seen: RwLock<HashMap<Peer, DateTime<Utc>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, peer: &Peer) -> bool {
        self.active.read().await.contains_key(peer)
    }

    pub async fn count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Snapshot of the active peers
    pub async fn peers(&self) -> Vec<Peer> {
        self.active.read().await.keys().cloned().collect()
    }

    /// Find an active peer by derived address
    pub async fn find_by_address(&self, address: &Address) -> Option<Peer> {
        self.active
            .read()
            .await
            .keys()
            .find(|p| p.address() == *address)
            .cloned()
    }

    /// Whether a peer may (re-)enter the active set at `timestamp`
    ///
    /// A peer in the removed map is only admissible with a timestamp
    /// strictly after its removal.
    pub async fn can_admit(&self, peer: &Peer, timestamp: DateTime<Utc>) -> bool {
        match self.removed.read().await.get(peer) {
            Some(removed_at) => timestamp > *removed_at,
            None => true,
        }
    }

    /// Insert a peer into the active set; returns false when the
    /// removed-timestamp rule rejects it
    pub async fn insert(&self, peer: Peer, timestamp: DateTime<Utc>) -> bool {
        if !self.can_admit(&peer, timestamp).await {
            return false;
        }
        self.removed.write().await.remove(&peer);
        self.last_seen.write().await.insert(peer.clone(), timestamp);
        self.active.write().await.insert(peer, timestamp);
        true
    }

    pub async fn record_seen(&self, peer: &Peer, timestamp: DateTime<Utc>) {
        self.last_seen
            .write()
            .await
            .insert(peer.clone(), timestamp);
    }

    pub async fn last_seen(&self, peer: &Peer) -> Option<DateTime<Utc>> {
        self.last_seen.read().await.get(peer).copied()
    }

    /// Record a peer in the removed map without touching the active set;
    /// used for the local node's own departure announcement
    pub async fn record_removed(&self, peer: Peer, timestamp: DateTime<Utc>) {
        self.removed.write().await.insert(peer, timestamp);
    }

    /// Remove peers from the active set, recording them for announcement
    ///
    /// The local key never leaves the registry on remote instruction.
    /// Key identity dominates endpoint identity: any active peer sharing
    /// a public key with a removed peer is dropped too. Returns every
    /// peer actually removed so the caller can tear down its socket.
    pub async fn mark_removed(
        &self,
        peers: &HashSet<Peer>,
        timestamp: DateTime<Utc>,
        local_key: &PublicKey,
    ) -> Vec<Peer> {
        let removed_keys: HashSet<PublicKey> = peers
            .iter()
            .map(|p| p.public_key)
            .filter(|k| k != local_key)
            .collect();
        if removed_keys.is_empty() {
            return Vec::new();
        }

        let mut active = self.active.write().await;
        let dropped: Vec<Peer> = active
            .keys()
            .filter(|p| removed_keys.contains(&p.public_key))
            .cloned()
            .collect();
        for peer in &dropped {
            active.remove(peer);
        }
        drop(active);

        let mut removed = self.removed.write().await;
        let mut last_seen = self.last_seen.write().await;
        for peer in peers {
            if peer.public_key != *local_key {
                removed.insert(peer.clone(), timestamp);
            }
        }
        for peer in &dropped {
            removed.insert(peer.clone(), timestamp);
            last_seen.remove(peer);
        }
        dropped
    }

    /// Active peers admitted after `after` and no later than `upto`
    pub async fn added_between(
        &self,
        after: DateTime<Utc>,
        upto: DateTime<Utc>,
    ) -> HashSet<Peer> {
        self.active
            .read()
            .await
            .iter()
            .filter(|(_, ts)| **ts > after && **ts <= upto)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Active peers not in `exclude`
    pub async fn active_except(&self, exclude: &HashSet<Peer>) -> HashSet<Peer> {
        self.active
            .read()
            .await
            .keys()
            .filter(|p| !exclude.contains(p))
            .cloned()
            .collect()
    }

    /// Drain removals with timestamps up to `upto`; each removal is
    /// handed out exactly once
    pub async fn take_removals_until(&self, upto: DateTime<Utc>) -> HashSet<Peer> {
        let mut removed = self.removed.write().await;
        let due: HashSet<Peer> = removed
            .iter()
            .filter(|(_, ts)| **ts <= upto)
            .map(|(p, _)| p.clone())
            .collect();
        for peer in &due {
            removed.remove(peer);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use chrono::Duration as ChronoDuration;

    fn peer(port: u16) -> Peer {
        Peer::new(KeyPair::generate().public_key, "127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_insert_and_query() {
        let registry = PeerRegistry::new();
        let p = peer(9001);

        assert!(registry.insert(p.clone(), Utc::now()).await);
        assert!(registry.contains(&p).await);
        assert_eq!(registry.count().await, 1);
        assert_eq!(registry.find_by_address(&p.address()).await, Some(p));
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let registry = PeerRegistry::new();
        let p = peer(9001);
        let ts = Utc::now();

        assert!(registry.insert(p.clone(), ts).await);
        assert!(registry.insert(p.clone(), ts).await);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_removed_peer_needs_newer_timestamp() {
        let local = KeyPair::generate();
        let registry = PeerRegistry::new();
        let p = peer(9001);
        let removed_at = Utc::now();

        registry.insert(p.clone(), removed_at).await;
        let mut set = HashSet::new();
        set.insert(p.clone());
        registry
            .mark_removed(&set, removed_at, &local.public_key)
            .await;

        assert!(!registry.insert(p.clone(), removed_at).await);
        assert!(
            registry
                .insert(p.clone(), removed_at + ChronoDuration::seconds(1))
                .await
        );
        assert!(registry.contains(&p).await);
    }

    #[tokio::test]
    async fn test_key_identity_dominates_endpoint() {
        let local = KeyPair::generate();
        let registry = PeerRegistry::new();
        let keys = KeyPair::generate();
        let old_endpoint = Peer::new(keys.public_key, "127.0.0.1", 9001);
        let new_endpoint = Peer::new(keys.public_key, "127.0.0.1", 9002);

        let now = Utc::now();
        registry.insert(old_endpoint.clone(), now).await;
        registry.insert(new_endpoint.clone(), now).await;

        let mut set = HashSet::new();
        set.insert(old_endpoint.clone());
        let dropped = registry.mark_removed(&set, now, &local.public_key).await;

        assert_eq!(dropped.len(), 2);
        assert!(!registry.contains(&old_endpoint).await);
        assert!(!registry.contains(&new_endpoint).await);
    }

    #[tokio::test]
    async fn test_local_key_never_removed() {
        let local = KeyPair::generate();
        let registry = PeerRegistry::new();
        let me = Peer::new(local.public_key, "127.0.0.1", 9001);

        let mut set = HashSet::new();
        set.insert(me.clone());
        let dropped = registry.mark_removed(&set, Utc::now(), &local.public_key).await;

        assert!(dropped.is_empty());
        assert!(registry.take_removals_until(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_removals_announced_once() {
        let local = KeyPair::generate();
        let registry = PeerRegistry::new();
        let p = peer(9001);
        let now = Utc::now();

        registry.insert(p.clone(), now).await;
        let mut set = HashSet::new();
        set.insert(p.clone());
        registry.mark_removed(&set, now, &local.public_key).await;

        let first = registry.take_removals_until(Utc::now()).await;
        assert_eq!(first.len(), 1);
        let second = registry.take_removals_until(Utc::now()).await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_added_between_window() {
        let registry = PeerRegistry::new();
        let early = peer(9001);
        let late = peer(9002);

        let t0 = Utc::now();
        registry.insert(early, t0).await;
        let t1 = t0 + ChronoDuration::seconds(1);
        registry.insert(late.clone(), t1).await;

        let added = registry.added_between(t0, t1).await;
        assert_eq!(added.len(), 1);
        assert!(added.contains(&late));
    }

    #[test]
    fn test_peer_descriptor_round_trip() {
        let p = peer(9001);
        let descriptor = format!("{}@{}:{}", hex::encode(p.public_key.serialize()), p.host, p.port);
        let parsed: Peer = descriptor.parse().unwrap();
        assert_eq!(parsed, p);
    }

    #[test]
    fn test_delta_json_round_trip() {
        let sender = peer(9001);
        let added = peer(9002);

        let mut added_set = HashSet::new();
        added_set.insert(added.clone());
        let delta = PeerSetDelta {
            sender: sender.clone(),
            timestamp: Utc::now(),
            added: added_set,
            removed: HashSet::new(),
            existing: None,
        };

        let json = serde_json::to_vec(&delta).unwrap();
        let decoded: PeerSetDelta = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded.sender, sender);
        assert!(decoded.added.contains(&added));
        assert!(decoded.existing.is_none());
    }
}
