//! Peer Store
//!
//! The single piece of shared mutable state in the daemon. Every
//! discovery layer pushes `PeerInfo` records in; the reconciler reads the
//! active set out. Reads hand back clones so no lock is ever held across
//! downstream I/O, and writers take the lock only for the in-memory merge.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::collision::Collision;
use crate::{PEER_ACTIVE_WINDOW_SECS, PEER_REMOVE_WINDOW_SECS};

/// A discovered mesh peer. The WireGuard public key is the identity key;
/// every other field is mutable and newest-wins on merge.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub wg_pubkey: String,
    pub mesh_ip: String,
    /// Best known endpoint, `host:port`
    pub endpoint: String,
    pub routable_networks: Vec<String>,
    pub last_seen: Instant,
    /// Which layers reported this peer ("lan", "dht", "gossip", ...)
    pub discovered_via: Vec<String>,
    /// Measured round-trip, when known
    pub latency: Option<Duration>,
}

impl PeerInfo {
    pub fn new(
        wg_pubkey: impl Into<String>,
        mesh_ip: impl Into<String>,
        endpoint: impl Into<String>,
        routable_networks: Vec<String>,
    ) -> Self {
        Self {
            wg_pubkey: wg_pubkey.into(),
            mesh_ip: mesh_ip.into(),
            endpoint: endpoint.into(),
            routable_networks,
            last_seen: Instant::now(),
            discovered_via: Vec::new(),
            latency: None,
        }
    }
}

/// Thread-safe set of known peers keyed by WireGuard public key
pub struct PeerStore {
    peers: RwLock<HashMap<String, PeerInfo>>,
    active_window: Duration,
    remove_window: Duration,
}

impl PeerStore {
    pub fn new() -> Arc<Self> {
        Self::with_windows(
            Duration::from_secs(PEER_ACTIVE_WINDOW_SECS),
            Duration::from_secs(PEER_REMOVE_WINDOW_SECS),
        )
    }

    /// Custom aging windows; tests shrink these to milliseconds.
    pub fn with_windows(active_window: Duration, remove_window: Duration) -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            active_window,
            remove_window,
        })
    }

    /// Insert or merge a peer. Non-empty new values replace old ones,
    /// `last_seen` resets to now, and the discovery method joins the
    /// `discovered_via` set.
    pub async fn update(&self, mut info: PeerInfo, discovery_method: &str) {
        let mut peers = self.peers.write().await;

        match peers.get_mut(&info.wg_pubkey) {
            None => {
                info.last_seen = Instant::now();
                info.discovered_via = vec![discovery_method.to_string()];
                peers.insert(info.wg_pubkey.clone(), info);
            }
            Some(existing) => {
                if !info.endpoint.is_empty() {
                    existing.endpoint = info.endpoint;
                }
                if !info.mesh_ip.is_empty() {
                    existing.mesh_ip = info.mesh_ip;
                }
                if !info.routable_networks.is_empty() {
                    existing.routable_networks = info.routable_networks;
                }
                if let Some(latency) = info.latency {
                    existing.latency = Some(latency);
                }
                existing.last_seen = Instant::now();

                if !existing
                    .discovered_via
                    .iter()
                    .any(|m| m == discovery_method)
                {
                    existing.discovered_via.push(discovery_method.to_string());
                }
            }
        }
    }

    /// Look up a single peer; returns a copy.
    pub async fn get(&self, wg_pubkey: &str) -> Option<PeerInfo> {
        self.peers.read().await.get(wg_pubkey).cloned()
    }

    /// All known peers, active or not.
    pub async fn get_all(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Peers seen within the active window; only these are offered to
    /// WireGuard.
    pub async fn get_active(&self) -> Vec<PeerInfo> {
        let now = Instant::now();
        self.peers
            .read()
            .await
            .values()
            .filter(|p| now.duration_since(p.last_seen) < self.active_window)
            .cloned()
            .collect()
    }

    /// Evict peers past the remove window, returning their public keys so
    /// the caller can withdraw them from WireGuard too.
    pub async fn cleanup_stale(&self) -> Vec<String> {
        let now = Instant::now();
        let mut peers = self.peers.write().await;

        let stale: Vec<String> = peers
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen) > self.remove_window)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &stale {
            peers.remove(key);
        }
        stale
    }

    /// Pairs of distinct peers claiming the same mesh IP.
    pub async fn detect_collisions(&self) -> Vec<Collision> {
        let peers = self.peers.read().await;

        let mut by_ip: HashMap<&str, &PeerInfo> = HashMap::new();
        let mut collisions = Vec::new();

        for peer in peers.values() {
            if peer.mesh_ip.is_empty() {
                continue;
            }
            match by_ip.get(peer.mesh_ip.as_str()) {
                Some(existing) if existing.wg_pubkey != peer.wg_pubkey => {
                    collisions.push(Collision {
                        mesh_ip: peer.mesh_ip.clone(),
                        peer_a: (*existing).clone(),
                        peer_b: peer.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    by_ip.insert(peer.mesh_ip.as_str(), peer);
                }
            }
        }

        collisions
    }

    pub async fn remove(&self, wg_pubkey: &str) {
        self.peers.write().await.remove(wg_pubkey);
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }
}
