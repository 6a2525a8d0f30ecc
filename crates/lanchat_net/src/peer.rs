//! Peer registry: Tracking known peers and when they were last heard from.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Map key for a reachable endpoint, formatted `"{address}-{port}"`.
///
/// Shared by the peer registry and the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerKey(String);

impl PeerKey {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self(format!("{address}-{port}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity and reachability record for a remote node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// The remote node's id.
    pub node_id: NodeId,
    /// Display name; may change on re-announce.
    pub name: String,
    /// Address the peer is reachable at.
    pub address: IpAddr,
    /// TCP port the peer accepts sessions on.
    pub port: u16,
    /// Last time a discovery message from this peer was seen.
    pub last_seen: DateTime<Utc>,
}

impl Peer {
    pub fn new(node_id: NodeId, name: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            node_id,
            name: name.into(),
            address,
            port,
            last_seen: Utc::now(),
        }
    }

    /// The `"{address}-{port}"` key this peer is stored under.
    pub fn key(&self) -> PeerKey {
        PeerKey::new(self.address, self.port)
    }

    /// Socket address for opening a TCP session to this peer.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Whether this record is older than `max_age` relative to `now`.
    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => now.signed_duration_since(self.last_seen) > max_age,
            Err(_) => false,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.address, self.port)
    }
}

/// Result of an [`PeerRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// No record existed for the key.
    Added,
    /// An existing record was merged in place.
    Updated,
}

/// Concurrent registry of known peers, keyed by [`PeerKey`].
///
/// Cloning the registry yields another handle to the same map. The lock is
/// only ever held for in-memory work, never across I/O.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<PeerKey, Peer>>>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer, or merge it into the record already stored under the
    /// same key. Merging updates the mutable fields (id, name, address, port,
    /// last-seen) in place; the last writer wins.
    pub fn upsert(&self, peer: Peer) -> Upsert {
        let mut peers = self.peers.write();
        match peers.get_mut(&peer.key()) {
            Some(existing) => {
                existing.node_id = peer.node_id;
                existing.name = peer.name;
                existing.address = peer.address;
                existing.port = peer.port;
                if peer.last_seen > existing.last_seen {
                    existing.last_seen = peer.last_seen;
                }
                Upsert::Updated
            }
            None => {
                peers.insert(peer.key(), peer);
                Upsert::Added
            }
        }
    }

    /// Remove a peer by key.
    pub fn remove(&self, key: &PeerKey) -> Option<Peer> {
        self.peers.write().remove(key)
    }

    /// Get a copy of a peer by key.
    pub fn get(&self, key: &PeerKey) -> Option<Peer> {
        self.peers.read().get(key).cloned()
    }

    /// Point-in-time copy of all peers, ordered by key.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.read().values().cloned().collect();
        peers.sort_by_key(|p| p.key());
        peers
    }

    /// Remove and return every peer last seen more than `max_age` before `now`.
    pub fn sweep(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<Peer> {
        let mut peers = self.peers.write();
        let stale: Vec<PeerKey> = peers
            .iter()
            .filter(|(_, p)| p.is_stale(max_age, now))
            .map(|(k, _)| k.clone())
            .collect();
        stale.iter().filter_map(|k| peers.remove(k)).collect()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.peers.write().clear();
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
