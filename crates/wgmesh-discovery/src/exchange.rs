//! Peer Exchange Protocol
//!
//! The encrypted side channel every discovery layer funnels through: a
//! single UDP socket on the derived gossip port speaking HELLO/REPLY/
//! ANNOUNCE envelopes. HELLO asks for a REPLY (correlated by remote
//! address); ANNOUNCE is fire-and-forget; STEM envelopes are handed to
//! the dandelion layer when privacy mode is on.
//!
//! Anything that fails to decrypt is foreign traffic — the DHT shares
//! this address space — and is dropped without ceremony.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, info, trace, warn};

use wgmesh_core::{LocalNode, PeerInfo, PeerStore, DEFAULT_WG_PORT};
use wgmesh_crypto::envelope::{
    open_envelope, parse_announcement, seal_envelope, KnownPeer, MessageType, PeerAnnouncement,
};
use wgmesh_crypto::{membership_token, verify_membership_token};

use crate::dandelion::DandelionAnnounce;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::method;

/// How long a HELLO waits for its REPLY
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Gossip push period
const GOSSIP_INTERVAL: Duration = Duration::from_secs(60);

/// Peers to push each gossip round
const GOSSIP_FANOUT: usize = 3;

/// Cap on transitive peers per message; keeps announcements inside one MTU
/// even in large meshes
const MAX_KNOWN_PEERS: usize = 64;

const MAX_DATAGRAM: usize = 65536;

/// The peer-exchange endpoint: socket, pending-reply correlation and the
/// local node's announcement state
pub struct PeerExchange {
    socket: Arc<UdpSocket>,
    port: u16,
    gossip_key: [u8; 32],
    membership_key: [u8; 32],
    local: Arc<RwLock<LocalNode>>,
    store: Arc<PeerStore>,
    /// Outstanding HELLOs keyed by remote address; the requestor inserts
    /// and removes, the listener only fulfills
    pending: Mutex<HashMap<SocketAddr, oneshot::Sender<PeerInfo>>>,
    /// Where incoming STEM payloads go when privacy mode is on
    stem_sink: Mutex<Option<mpsc::Sender<DandelionAnnounce>>>,
}

impl PeerExchange {
    /// Bind the exchange socket. Port 0 requests an ephemeral port
    /// (tests, `test-peer`); a bind failure at the derived gossip port is
    /// fatal for the daemon.
    pub async fn bind(
        port: u16,
        gossip_key: [u8; 32],
        membership_key: [u8; 32],
        local: Arc<RwLock<LocalNode>>,
        store: Arc<PeerStore>,
    ) -> DiscoveryResult<Arc<Self>> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(DiscoveryError::Bind)?;
        let port = socket.local_addr().map_err(DiscoveryError::Bind)?.port();

        info!("Peer exchange listening on UDP port {port}");

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            port,
            gossip_key,
            membership_key,
            local,
            store,
            pending: Mutex::new(HashMap::new()),
            stem_sink: Mutex::new(None),
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Route incoming STEM payloads to the dandelion task.
    pub fn set_stem_sink(&self, sink: mpsc::Sender<DandelionAnnounce>) {
        *self.stem_sink.lock().unwrap() = Some(sink);
    }

    /// Spawn the listener and the gossip push loop.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let listener = self.clone();
        let mut listener_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = listener_shutdown.changed() => {
                        debug!("Peer exchange listener stopping");
                        return;
                    }
                    result = listener.socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, from)) => listener.handle_packet(&buf[..len], from).await,
                            Err(e) => warn!("Exchange socket read error: {e}"),
                        }
                    }
                }
            }
        });

        let gossiper = self.clone();
        let mut gossip_shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GOSSIP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the immediate first tick; there is nothing to gossip yet
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = gossip_shutdown.changed() => return,
                    _ = ticker.tick() => gossiper.gossip_round().await,
                }
            }
        });
    }

    /// One HELLO/REPLY round trip with a remote address.
    pub async fn exchange_with(&self, addr: SocketAddr) -> DiscoveryResult<PeerInfo> {
        self.exchange_with_timeout(addr, EXCHANGE_TIMEOUT).await
    }

    /// As [`exchange_with`](Self::exchange_with) with an explicit reply
    /// deadline.
    pub async fn exchange_with_timeout(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> DiscoveryResult<PeerInfo> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(addr, tx);

        let result = self.exchange_inner(addr, rx, timeout).await;
        // The requestor owns the entry, success or not
        self.pending.lock().unwrap().remove(&addr);
        result
    }

    async fn exchange_inner(
        &self,
        addr: SocketAddr,
        rx: oneshot::Receiver<PeerInfo>,
        timeout: Duration,
    ) -> DiscoveryResult<PeerInfo> {
        let announcement = self.build_announcement().await;
        let data = seal_envelope(MessageType::Hello, &announcement, &self.gossip_key)?;

        trace!("Sending HELLO to {addr} from port {}", self.port);
        self.socket.send_to(&data, addr).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(peer)) => Ok(peer),
            Ok(Err(_)) => Err(DiscoveryError::Timeout),
            Err(_) => Err(DiscoveryError::Timeout),
        }
    }

    /// Fire-and-forget ANNOUNCE with our known peers (gossip push).
    pub async fn send_announce_to(&self, addr: SocketAddr) -> DiscoveryResult<()> {
        let announcement = self.build_announcement().await;
        let data = seal_envelope(MessageType::Announce, &announcement, &self.gossip_key)?;
        self.socket.send_to(&data, addr).await?;
        Ok(())
    }

    /// Forward a dandelion stem hop to the next relay.
    pub async fn send_stem(
        &self,
        announce: &DandelionAnnounce,
        endpoint: &str,
    ) -> DiscoveryResult<()> {
        let addr: SocketAddr = endpoint
            .parse()
            .map_err(|_| DiscoveryError::Query(format!("bad relay endpoint {endpoint}")))?;
        let data = seal_envelope(MessageType::Stem, announce, &self.gossip_key)?;
        self.socket.send_to(&data, addr).await?;
        Ok(())
    }

    /// Our announcement: local node fields, membership token, and up to
    /// [`MAX_KNOWN_PEERS`] transitive peers, freshest first.
    async fn build_announcement(&self) -> PeerAnnouncement {
        let local = self.local.read().await;
        let announcement = PeerAnnouncement::new(
            local.wg_pubkey.clone(),
            local.mesh_ip.clone(),
            local.wg_endpoint.clone(),
            local.routable_networks.clone(),
            self.known_peers().await,
        );
        let token = membership_token(&self.membership_key, &local.wg_pubkey);
        announcement.with_membership(token)
    }

    async fn known_peers(&self) -> Vec<KnownPeer> {
        let mut active = self.store.get_active().await;
        active.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        active.truncate(MAX_KNOWN_PEERS);
        active
            .into_iter()
            .filter(|p| !p.endpoint.is_empty())
            .map(|p| KnownPeer {
                wg_pubkey: p.wg_pubkey,
                mesh_ip: p.mesh_ip,
                wg_endpoint: p.endpoint,
            })
            .collect()
    }

    async fn gossip_round(&self) {
        let active = self.store.get_active().await;
        let targets: Vec<SocketAddr> = {
            let mut rng = rand::thread_rng();
            active
                .choose_multiple(&mut rng, GOSSIP_FANOUT)
                .filter_map(|p| p.endpoint.parse().ok())
                .collect()
        };

        for addr in targets {
            if let Err(e) = self.send_announce_to(addr).await {
                debug!("Gossip push to {addr} failed: {e}");
            }
        }
    }

    async fn handle_packet(&self, data: &[u8], from: SocketAddr) {
        // Foreign traffic on a shared port is normal; drop quietly
        let Ok((envelope, plaintext)) = open_envelope(data, &self.gossip_key) else {
            trace!("Undecryptable packet from {from} ({} bytes)", data.len());
            return;
        };

        match envelope.message_type {
            MessageType::Hello => self.handle_hello(&plaintext, from).await,
            MessageType::Reply => self.handle_reply(&plaintext, from).await,
            MessageType::Announce => self.handle_announce(&plaintext, from).await,
            MessageType::Stem => self.handle_stem(&plaintext, from).await,
        }
    }

    async fn handle_hello(&self, plaintext: &[u8], from: SocketAddr) {
        let Some(announcement) = self.accept_announcement(plaintext, from).await else {
            return;
        };
        debug!(
            "HELLO from {} at {from}",
            key_prefix(&announcement.wg_pubkey)
        );

        let peer = peer_from_announcement(&announcement, from);
        self.store.update(peer, method::DHT).await;
        self.merge_transitive(&announcement.known_peers, method::DHT)
            .await;

        if let Err(e) = self.send_reply(from).await {
            warn!("Failed to send REPLY to {from}: {e}");
        }
    }

    async fn handle_reply(&self, plaintext: &[u8], from: SocketAddr) {
        let Some(announcement) = self.accept_announcement(plaintext, from).await else {
            return;
        };

        let peer = peer_from_announcement(&announcement, from);
        self.merge_transitive(&announcement.known_peers, method::DHT)
            .await;

        let sender = self.pending.lock().unwrap().remove(&from);
        match sender {
            Some(tx) => {
                self.store.update(peer.clone(), method::DHT).await;
                let _ = tx.send(peer);
            }
            None => {
                debug!("Unsolicited REPLY from {from}; merging anyway");
                self.store.update(peer, method::DHT).await;
            }
        }
    }

    async fn handle_announce(&self, plaintext: &[u8], from: SocketAddr) {
        let Some(announcement) = self.accept_announcement(plaintext, from).await else {
            return;
        };

        let peer = peer_from_announcement(&announcement, from);
        self.store.update(peer, method::GOSSIP).await;
        self.merge_transitive(&announcement.known_peers, method::GOSSIP)
            .await;
    }

    async fn handle_stem(&self, plaintext: &[u8], from: SocketAddr) {
        let Ok(announce) = serde_json::from_slice::<DandelionAnnounce>(plaintext) else {
            trace!("Bad stem payload from {from}");
            return;
        };
        if !announce.is_fresh() {
            return;
        }

        let sink = self.stem_sink.lock().unwrap().clone();
        match sink {
            Some(sink) => {
                if sink.try_send(announce).is_err() {
                    debug!("Stem queue full, dropping hop from {from}");
                }
            }
            // Privacy mode off: we are not a relay
            None => trace!("Dropping stem from {from}, privacy mode off"),
        }
    }

    /// Validate, filter self-echo, and verify membership when present.
    async fn accept_announcement(
        &self,
        plaintext: &[u8],
        from: SocketAddr,
    ) -> Option<PeerAnnouncement> {
        let announcement = parse_announcement(plaintext).ok()?;

        if announcement.wg_pubkey == self.local.read().await.wg_pubkey {
            return None;
        }

        if let Some(token) = &announcement.membership {
            if !verify_membership_token(&self.membership_key, &announcement.wg_pubkey, token) {
                debug!(
                    "Dropping announcement from {from} with bad membership token"
                );
                return None;
            }
        }

        Some(announcement)
    }

    async fn merge_transitive(&self, known_peers: &[KnownPeer], base_method: &str) {
        if known_peers.is_empty() {
            return;
        }
        let own_pubkey = self.local.read().await.wg_pubkey.clone();
        let tag = method::transitive(base_method);

        for kp in known_peers {
            if kp.wg_pubkey == own_pubkey {
                continue;
            }
            let endpoint = normalize_known_endpoint(&kp.wg_endpoint);
            let peer = PeerInfo::new(
                kp.wg_pubkey.clone(),
                kp.mesh_ip.clone(),
                endpoint,
                Vec::new(),
            );
            self.store.update(peer, &tag).await;
        }
    }

    async fn send_reply(&self, to: SocketAddr) -> DiscoveryResult<()> {
        let announcement = self.build_announcement().await;
        let data = seal_envelope(MessageType::Reply, &announcement, &self.gossip_key)?;
        self.socket.send_to(&data, to).await?;
        Ok(())
    }
}

/// Build a `PeerInfo` from an accepted announcement, reflecting wildcard
/// endpoint hosts to the observed source address.
fn peer_from_announcement(announcement: &PeerAnnouncement, from: SocketAddr) -> PeerInfo {
    PeerInfo::new(
        announcement.wg_pubkey.clone(),
        announcement.mesh_ip.clone(),
        resolve_endpoint(&announcement.wg_endpoint, from),
        announcement.routable_networks.clone(),
    )
}

/// NAT reflection: a sender usually cannot know its public address and
/// advertises `0.0.0.0:<port>`; substitute the source IP we observed.
pub fn resolve_endpoint(advertised: &str, from: SocketAddr) -> String {
    if let Some((host, port)) = advertised.rsplit_once(':') {
        if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
            if host.is_empty() || host == "0.0.0.0" || host == "::" {
                return format!("{}:{}", from.ip(), port);
            }
            return advertised.to_string();
        }
    }
    // Unparsable endpoint: assume the default WireGuard port at the source
    format!("{}:{}", from.ip(), DEFAULT_WG_PORT)
}

/// Transitive endpoints were resolved by someone else; keep them only when
/// they look like `host:port`.
fn normalize_known_endpoint(endpoint: &str) -> String {
    match endpoint.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty() && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            endpoint.to_string()
        }
        _ => String::new(),
    }
}

fn key_prefix(key: &str) -> &str {
    &key[..key.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgmesh_crypto::derive_keys;

    fn local(pubkey: &str, mesh_ip: &str, port: u16) -> Arc<RwLock<LocalNode>> {
        Arc::new(RwLock::new(LocalNode {
            wg_pubkey: pubkey.to_string(),
            wg_privkey: "priv".to_string(),
            mesh_ip: mesh_ip.to_string(),
            wg_endpoint: format!("0.0.0.0:{port}"),
            routable_networks: Vec::new(),
        }))
    }

    async fn spawn_node(
        secret: &str,
        pubkey: &str,
        mesh_ip: &str,
    ) -> (Arc<PeerExchange>, Arc<PeerStore>, watch::Sender<bool>) {
        let keys = derive_keys(secret).unwrap();
        let store = PeerStore::new();
        let exchange = PeerExchange::bind(
            0,
            keys.gossip_key,
            keys.membership_key,
            local(pubkey, mesh_ip, 51820),
            store.clone(),
        )
        .await
        .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        exchange.start(shutdown_rx);
        (exchange, store, shutdown_tx)
    }

    const SECRET: &str = "an-integration-test-secret";

    #[tokio::test]
    async fn test_hello_reply_roundtrip() {
        let (a, store_a, _ga) = spawn_node(SECRET, "node-a", "10.1.0.1").await;
        let (b, store_b, _gb) = spawn_node(SECRET, "node-b", "10.1.0.2").await;

        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.port()).parse().unwrap();
        let peer = a.exchange_with(b_addr).await.unwrap();

        assert_eq!(peer.wg_pubkey, "node-b");
        assert_eq!(peer.mesh_ip, "10.1.0.2");
        // The wildcard endpoint was reflected to the observed source
        assert!(peer.endpoint.starts_with("127.0.0.1:"));

        // Both stores converged
        assert_eq!(store_a.get("node-b").await.unwrap().mesh_ip, "10.1.0.2");
        let b_view = store_b.get("node-a").await.unwrap();
        assert_eq!(b_view.mesh_ip, "10.1.0.1");
        assert_eq!(b_view.discovered_via, vec!["dht"]);
    }

    #[tokio::test]
    async fn test_cross_secret_isolation() {
        let (a, store_a, _ga) = spawn_node(SECRET, "node-a", "10.1.0.1").await;
        let (b, store_b, _gb) =
            spawn_node("an-integration-test-secreU", "node-b", "10.1.0.2").await;

        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.port()).parse().unwrap();

        assert!(matches!(
            a.exchange_with_timeout(b_addr, Duration::from_millis(300)).await,
            Err(DiscoveryError::Timeout)
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Neither side learned anything
        assert_eq!(store_a.count().await, 0);
        assert_eq!(store_b.count().await, 0);
    }

    #[tokio::test]
    async fn test_tampered_hello_gets_no_reply_and_no_merge() {
        let keys = derive_keys(SECRET).unwrap();
        let (_b, store_b, _gb) = spawn_node(SECRET, "node-b", "10.1.0.2").await;
        let b_addr: SocketAddr = format!("127.0.0.1:{}", _b.port()).parse().unwrap();

        let announcement =
            PeerAnnouncement::new("node-a", "10.1.0.1", "0.0.0.0:51820", vec![], vec![]);
        let mut data = seal_envelope(MessageType::Hello, &announcement, &keys.gossip_key).unwrap();
        // Corrupt one ciphertext byte inside the JSON envelope
        let idx = data.len() / 2;
        data[idx] ^= 0x01;

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        probe.send_to(&data, b_addr).await.unwrap();

        let mut buf = [0u8; 2048];
        let reply = tokio::time::timeout(Duration::from_millis(300), probe.recv_from(&mut buf)).await;
        assert!(reply.is_err(), "tampered HELLO must not be answered");
        assert_eq!(store_b.count().await, 0);
    }

    #[tokio::test]
    async fn test_transitive_peers_are_merged_with_tag() {
        let keys = derive_keys(SECRET).unwrap();
        let (b, store_b, _gb) = spawn_node(SECRET, "node-b", "10.1.0.2").await;
        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.port()).parse().unwrap();

        let announcement = PeerAnnouncement::new(
            "node-a",
            "10.1.0.1",
            "0.0.0.0:51820",
            vec![],
            vec![
                KnownPeer {
                    wg_pubkey: "node-c".into(),
                    mesh_ip: "10.1.0.3".into(),
                    wg_endpoint: "198.51.100.3:51820".into(),
                },
                // Junk endpoint gets normalized away but the peer still lands
                KnownPeer {
                    wg_pubkey: "node-d".into(),
                    mesh_ip: "10.1.0.4".into(),
                    wg_endpoint: "not-an-endpoint".into(),
                },
            ],
        );
        let data = seal_envelope(MessageType::Announce, &announcement, &keys.gossip_key).unwrap();

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        probe.send_to(&data, b_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let direct = store_b.get("node-a").await.unwrap();
        assert_eq!(direct.discovered_via, vec!["gossip"]);

        let transitive = store_b.get("node-c").await.unwrap();
        assert_eq!(transitive.endpoint, "198.51.100.3:51820");
        assert_eq!(transitive.discovered_via, vec!["gossip-transitive"]);

        assert_eq!(store_b.get("node-d").await.unwrap().endpoint, "");
    }

    #[tokio::test]
    async fn test_bad_membership_token_is_dropped() {
        let keys = derive_keys(SECRET).unwrap();
        let (b, store_b, _gb) = spawn_node(SECRET, "node-b", "10.1.0.2").await;
        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.port()).parse().unwrap();

        let announcement =
            PeerAnnouncement::new("node-a", "10.1.0.1", "0.0.0.0:51820", vec![], vec![])
                .with_membership("deadbeef".into());
        let data = seal_envelope(MessageType::Announce, &announcement, &keys.gossip_key).unwrap();

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        probe.send_to(&data, b_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store_b.count().await, 0);
    }

    #[test]
    fn test_resolve_endpoint_reflection() {
        let from: SocketAddr = "203.0.113.9:40000".parse().unwrap();

        assert_eq!(resolve_endpoint("0.0.0.0:51820", from), "203.0.113.9:51820");
        assert_eq!(resolve_endpoint(":51820", from), "203.0.113.9:51820");
        assert_eq!(
            resolve_endpoint("198.51.100.1:51820", from),
            "198.51.100.1:51820"
        );
        // Unparsable endpoints fall back to source + default port
        assert_eq!(resolve_endpoint("", from), "203.0.113.9:51820");
        assert_eq!(resolve_endpoint("garbage", from), "203.0.113.9:51820");
    }

    #[test]
    fn test_normalize_known_endpoint() {
        assert_eq!(
            normalize_known_endpoint("198.51.100.1:51820"),
            "198.51.100.1:51820"
        );
        assert_eq!(normalize_known_endpoint(""), "");
        assert_eq!(normalize_known_endpoint("no-port"), "");
        assert_eq!(normalize_known_endpoint("host:notdigits"), "");
    }
}
