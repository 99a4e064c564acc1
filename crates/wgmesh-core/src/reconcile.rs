//! Reconciliation loop
//!
//! Converges the live WireGuard interface toward the peer store's active
//! set: pushes every active peer's key, PSK, endpoint and allowed IPs,
//! withdraws evicted peers, and resolves mesh-IP collisions. Runs on a
//! 5-second tick; per-peer failures log and never stop the loop, so the
//! interface self-heals on the next pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use wgmesh_crypto::derive_mesh_ip_with_nonce;

use crate::collision::deterministic_winner;
use crate::node::LocalNode;
use crate::peerstore::{PeerInfo, PeerStore};
use crate::wgctl::WgBackend;

/// Reconcile tick period
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

pub struct Reconciler {
    backend: Arc<dyn WgBackend>,
    store: Arc<PeerStore>,
    local: Arc<RwLock<LocalNode>>,
    interface: String,
    psk: [u8; 32],
    secret: String,
    mesh_subnet: u8,
    /// Next collision-avoidance nonce; grows monotonically so repeated
    /// collisions keep moving us to fresh addresses
    collision_nonce: std::sync::atomic::AtomicU32,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn WgBackend>,
        store: Arc<PeerStore>,
        local: Arc<RwLock<LocalNode>>,
        interface: String,
        psk: [u8; 32],
        secret: String,
        mesh_subnet: u8,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            store,
            local,
            interface,
            psk,
            secret,
            mesh_subnet,
            collision_nonce: std::sync::atomic::AtomicU32::new(0),
        })
    }

    /// Run until the shutdown signal flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("Reconciler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One reconciliation pass. Public so tests and the daemon's shutdown
    /// path can drive it directly.
    pub async fn tick(&self) {
        self.resolve_collisions().await;

        let local_pubkey = self.local.read().await.wg_pubkey.clone();
        let active = self.store.get_active().await;

        for peer in &active {
            if peer.wg_pubkey == local_pubkey {
                continue;
            }
            let allowed_ips = build_allowed_ips(peer);
            if let Err(e) = self
                .backend
                .set_peer(
                    &self.interface,
                    &peer.wg_pubkey,
                    &self.psk,
                    &peer.endpoint,
                    &allowed_ips,
                )
                .await
            {
                warn!(
                    "Failed to configure peer {}: {e}",
                    key_prefix(&peer.wg_pubkey)
                );
            }
        }

        for pubkey in self.store.cleanup_stale().await {
            info!("Peer {} went stale, withdrawing", key_prefix(&pubkey));
            if let Err(e) = self.backend.remove_peer(&self.interface, &pubkey).await {
                warn!("Failed to remove stale peer {}: {e}", key_prefix(&pubkey));
            }
        }
    }

    /// Detect and resolve mesh-IP collisions. Remote pairs resolve
    /// themselves on their own nodes; we only act when the local node is
    /// the loser.
    async fn resolve_collisions(&self) {
        for collision in self.store.detect_collisions().await {
            let (winner, loser) = deterministic_winner(&collision.peer_a, &collision.peer_b);
            warn!(
                "Mesh IP {} claimed by both {} and {}; {} keeps it",
                collision.mesh_ip,
                key_prefix(&winner.wg_pubkey),
                key_prefix(&loser.wg_pubkey),
                key_prefix(&winner.wg_pubkey),
            );
        }

        let (local_pubkey, local_ip) = {
            let local = self.local.read().await;
            (local.wg_pubkey.clone(), local.mesh_ip.clone())
        };

        let rivals: Vec<PeerInfo> = self
            .store
            .get_active()
            .await
            .into_iter()
            .filter(|p| p.mesh_ip == local_ip && p.wg_pubkey != local_pubkey)
            .collect();

        // Lexicographically lower key keeps the address
        let we_lose = rivals.iter().any(|p| p.wg_pubkey < local_pubkey);
        if !we_lose {
            return;
        }

        let taken: std::collections::HashSet<String> = self
            .store
            .get_all()
            .await
            .into_iter()
            .map(|p| p.mesh_ip)
            .collect();

        let mut new_ip = local_ip.clone();
        for _ in 0..16 {
            let nonce = self
                .collision_nonce
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                + 1;
            let candidate =
                derive_mesh_ip_with_nonce(self.mesh_subnet, &local_pubkey, &self.secret, nonce)
                    .to_string();
            if !taken.contains(&candidate) {
                new_ip = candidate;
                break;
            }
        }

        if new_ip == local_ip {
            warn!("Could not find a collision-free mesh IP; keeping {local_ip}");
            return;
        }

        warn!("Lost mesh IP collision, re-deriving: {local_ip} -> {new_ip}");
        if let Err(e) = self
            .backend
            .set_address(&self.interface, &format!("{new_ip}/16"))
            .await
        {
            warn!("Failed to apply re-derived address: {e}");
            return;
        }
        self.local.write().await.mesh_ip = new_ip;
    }
}

/// Allowed IPs for a peer: its mesh address plus any routes it advertises.
fn build_allowed_ips(peer: &PeerInfo) -> String {
    let mut allowed = format!("{}/32", peer.mesh_ip);
    for network in &peer.routable_networks {
        allowed.push(',');
        allowed.push_str(network);
    }
    allowed
}

fn key_prefix(key: &str) -> &str {
    &key[..key.len().min(8)]
}
