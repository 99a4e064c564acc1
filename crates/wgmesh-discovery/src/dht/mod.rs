//! DHT Discovery
//!
//! Rendezvous over the public BitTorrent Mainline DHT. The mesh has no
//! presence of its own there: members simply announce their gossip port
//! under an hourly-rotating infohash derived from the secret, and look
//! the same infohash up to find each other. A passive observer sees only
//! that some address cared about an ephemeral 20-byte label.
//!
//! Everything found here is a *candidate*: contact goes through the
//! encrypted peer exchange, and non-members simply fail to decrypt.

pub mod client;
pub mod krpc;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use wgmesh_core::PeerStore;
use wgmesh_crypto::envelope::unix_now;
use wgmesh_crypto::network_ids_for;

use crate::error::DiscoveryResult;
use crate::exchange::PeerExchange;
use crate::method;

pub use client::{DhtClient, LookupResult};

/// Well-known public bootstrap nodes
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "dht.libtorrent.org:25401",
];

/// How often we re-announce to the DHT
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Query cadence while the mesh is still forming
const QUERY_INTERVAL: Duration = Duration::from_secs(30);

/// Query cadence once the store holds enough peers
const QUERY_INTERVAL_STABLE: Duration = Duration::from_secs(60);

/// Store size at which querying relaxes
const STABLE_PEER_COUNT: usize = 3;

/// Upper bound on waiting for bootstrap contacts
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum spacing between contact attempts to the same address
const CONTACT_DEBOUNCE: Duration = Duration::from_secs(60);

pub struct DhtDiscovery {
    client: Arc<DhtClient>,
    exchange: Arc<PeerExchange>,
    store: Arc<PeerStore>,
    secret: String,
    /// The port we publish; always the gossip port, never the KRPC port
    gossip_port: u16,
    /// When `false` the daemon routes announces through the dandelion
    /// relay instead and only queries run here
    announce_directly: bool,
    contacted: Mutex<HashMap<SocketAddr, Instant>>,
}

impl DhtDiscovery {
    /// Bind the dedicated DHT socket (`gossip_port + 1`, OS fallback).
    pub async fn new(
        secret: String,
        gossip_port: u16,
        exchange: Arc<PeerExchange>,
        store: Arc<PeerStore>,
        announce_directly: bool,
    ) -> DiscoveryResult<Arc<Self>> {
        let client = DhtClient::bind(gossip_port + 1).await?;
        info!(
            "DHT socket on port {} (announcing gossip port {gossip_port})",
            client.local_port()
        );

        Ok(Arc::new(Self {
            client,
            exchange,
            store,
            secret,
            gossip_port,
            announce_directly,
            contacted: Mutex::new(HashMap::new()),
        }))
    }

    /// Bootstrap, then run the announce and query loops until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        self.client.start(shutdown.clone());
        self.bootstrap(shutdown.clone()).await;

        let announcer = self.clone();
        let announcer_shutdown = shutdown.clone();
        tokio::spawn(async move { announcer.announce_loop(announcer_shutdown).await });

        let querier = self.clone();
        tokio::spawn(async move { querier.query_loop(shutdown).await });
    }

    /// Publish the gossip port under the current (and, around rotation,
    /// previous) infohash. Public so the dandelion fluff path can invoke
    /// it on demand.
    pub async fn announce_now(&self) {
        let (current, previous) = network_ids_for(&self.secret, unix_now());

        let accepted = self.client.announce(current, self.gossip_port).await;
        debug!(
            "Announced to infohash {} ({accepted} nodes accepted)",
            hex_prefix(&current)
        );

        if previous != current {
            self.client.announce(previous, self.gossip_port).await;
        }
    }

    async fn bootstrap(&self, mut shutdown: watch::Receiver<bool>) {
        let mut addrs: Vec<SocketAddr> = Vec::new();
        for name in BOOTSTRAP_NODES {
            match tokio::net::lookup_host(*name).await {
                Ok(resolved) => addrs.extend(resolved.filter(|a| a.is_ipv4())),
                Err(e) => warn!("Failed to resolve bootstrap node {name}: {e}"),
            }
        }
        if addrs.is_empty() {
            warn!("No DHT bootstrap nodes resolved; discovery will rely on other layers");
            return;
        }

        let client = self.client.clone();
        let bootstrap = async move {
            client.bootstrap(&addrs).await;
            client
        };

        tokio::select! {
            _ = shutdown.changed() => {}
            client = tokio::time::timeout(BOOTSTRAP_TIMEOUT, bootstrap) => {
                match client {
                    Ok(client) => {
                        info!("DHT bootstrap complete, {} contacts", client.node_count())
                    }
                    Err(_) => warn!(
                        "DHT bootstrap timed out after {BOOTSTRAP_TIMEOUT:?}; continuing with {} contacts",
                        self.client.node_count()
                    ),
                }
            }
        }
    }

    async fn announce_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.announce_directly {
            debug!("Direct DHT announces disabled (privacy mode)");
            return;
        }

        self.announce_now().await;
        let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => self.announce_now().await,
            }
        }
    }

    async fn query_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = QUERY_INTERVAL;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    self.query_round().await;

                    if interval == QUERY_INTERVAL
                        && self.store.count().await >= STABLE_PEER_COUNT
                    {
                        interval = QUERY_INTERVAL_STABLE;
                        ticker = tokio::time::interval(interval);
                        ticker
                            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                        ticker.tick().await;
                        debug!("Mesh looks stable, slowing DHT queries to {interval:?}");
                    }
                }
            }
        }
    }

    async fn query_round(&self) {
        let (current, previous) = network_ids_for(&self.secret, unix_now());
        debug!(
            "Querying infohash {} ({} DHT contacts)",
            hex_prefix(&current),
            self.client.node_count()
        );

        self.query_infohash(current).await;
        if previous != current {
            self.query_infohash(previous).await;
        }
    }

    async fn query_infohash(&self, info_hash: [u8; 20]) {
        let result = self.client.lookup(info_hash).await;
        if result.peers.is_empty() {
            return;
        }
        debug!(
            "Lookup of {} returned {} candidate peers",
            hex_prefix(&info_hash),
            result.peers.len()
        );

        for addr in result.peers {
            if !self.should_contact(addr) {
                continue;
            }
            let exchange = self.exchange.clone();
            let store = self.store.clone();
            tokio::spawn(async move {
                match exchange.exchange_with(addr).await {
                    Ok(peer) => {
                        info!(
                            "DHT candidate {addr} answered as {} ({})",
                            &peer.wg_pubkey[..peer.wg_pubkey.len().min(8)],
                            peer.mesh_ip
                        );
                        store.update(peer, method::DHT).await;
                    }
                    // Expected for torrent clients and foreign meshes
                    Err(e) => debug!("Candidate {addr} did not answer exchange: {e}"),
                }
            });
        }
    }

    /// Per-address debounce: candidates resurface on every query round and
    /// most of them are not mesh members.
    fn should_contact(&self, addr: SocketAddr) -> bool {
        let mut contacted = self.contacted.lock().unwrap();
        let now = Instant::now();
        contacted.retain(|_, at| now.duration_since(*at) < CONTACT_DEBOUNCE);

        match contacted.get(&addr) {
            Some(_) => false,
            None => {
                contacted.insert(addr, now);
                true
            }
        }
    }
}

fn hex_prefix(id: &[u8; 20]) -> String {
    hex::encode(&id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use wgmesh_core::LocalNode;
    use wgmesh_crypto::derive_keys;

    async fn discovery() -> Arc<DhtDiscovery> {
        let secret = "dht-module-test-secret".to_string();
        let keys = derive_keys(&secret).unwrap();
        let store = PeerStore::new();
        let local = Arc::new(RwLock::new(LocalNode {
            wg_pubkey: "local".into(),
            wg_privkey: "priv".into(),
            mesh_ip: "10.1.0.1".into(),
            wg_endpoint: "0.0.0.0:51820".into(),
            routable_networks: Vec::new(),
        }));
        let exchange = PeerExchange::bind(0, keys.gossip_key, keys.membership_key, local, store.clone())
            .await
            .unwrap();

        DhtDiscovery::new(secret, keys.gossip_port, exchange, store, true)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_contact_debounce() {
        let dht = discovery().await;
        let addr: SocketAddr = "192.0.2.1:51821".parse().unwrap();

        assert!(dht.should_contact(addr));
        assert!(!dht.should_contact(addr));
        // A different address is unaffected
        assert!(dht.should_contact("192.0.2.2:51821".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_dht_socket_avoids_exchange_port() {
        let dht = discovery().await;
        assert_ne!(dht.client.local_port(), dht.gossip_port);
    }
}
