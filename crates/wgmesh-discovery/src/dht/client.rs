//! KRPC client
//!
//! One socket, one receive loop, a transaction map of pending queries and
//! a bounded pool of known-good node contacts. Also answers inbound
//! queries minimally (ping, find_node, get_peers) so we are a tolerable
//! DHT citizen rather than a pure leech.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use serde_bytes::ByteBuf;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::dht::krpc::{
    parse_compact_nodes, parse_compact_peers, serialize_compact_nodes, KrpcMessage, KrpcResponse,
    NodeContact,
};
use crate::error::{DiscoveryError, DiscoveryResult};

/// Per-query timeout
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Lookup parallelism (Kademlia alpha)
const ALPHA: usize = 3;

/// Total nodes queried per lookup before giving up
const LOOKUP_BUDGET: usize = 24;

/// Responders we announce to after a lookup
const ANNOUNCE_WIDTH: usize = 8;

/// Node pool cap
const MAX_POOL: usize = 512;

const MAX_DATAGRAM: usize = 65536;

/// Outcome of a get_peers lookup over one infohash
#[derive(Debug, Default)]
pub struct LookupResult {
    /// Peer addresses other members announced
    pub peers: Vec<SocketAddr>,
    /// Nodes that answered, with the announce tokens they issued
    pub responders: Vec<(NodeContact, Option<ByteBuf>)>,
}

pub struct DhtClient {
    socket: Arc<UdpSocket>,
    node_id: [u8; 20],
    local_port: u16,
    pending: Mutex<HashMap<u16, oneshot::Sender<DiscoveryResult<KrpcResponse>>>>,
    next_tid: AtomicU16,
    pool: Mutex<Vec<NodeContact>>,
    /// Token handed out by our minimal get_peers responder
    our_token: Vec<u8>,
}

impl DhtClient {
    /// Bind the DHT socket, preferring `preferred_port` and falling back
    /// to an OS-assigned port when it is taken. The DHT and the peer
    /// exchange deliberately never share a socket: the exchange must not
    /// be starved by DHT read pressure.
    pub async fn bind(preferred_port: u16) -> DiscoveryResult<Arc<Self>> {
        let socket = match UdpSocket::bind(("0.0.0.0", preferred_port)).await {
            Ok(socket) => socket,
            Err(e) => {
                // The announced port is always the gossip port, so an
                // OS-assigned KRPC port changes nothing for observers.
                debug!("DHT port {preferred_port} unavailable ({e}), letting the OS pick");
                UdpSocket::bind(("0.0.0.0", 0))
                    .await
                    .map_err(DiscoveryError::Bind)?
            }
        };
        let local_port = socket.local_addr().map_err(DiscoveryError::Bind)?.port();

        let mut node_id = [0u8; 20];
        rand::rngs::OsRng.fill_bytes(&mut node_id);
        let mut our_token = vec![0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut our_token);

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            node_id,
            local_port,
            pending: Mutex::new(HashMap::new()),
            next_tid: AtomicU16::new(rand::random()),
            pool: Mutex::new(Vec::new()),
            our_token,
        }))
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn node_count(&self) -> usize {
        self.pool.lock().unwrap().len()
    }

    /// Spawn the receive loop.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let client = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        debug!("DHT client stopping");
                        return;
                    }
                    result = client.socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, from)) => client.handle_packet(&buf[..len], from).await,
                            Err(e) => warn!("DHT socket read error: {e}"),
                        }
                    }
                }
            }
        });
    }

    async fn handle_packet(&self, data: &[u8], from: SocketAddr) {
        let Ok(msg) = KrpcMessage::from_bytes(data) else {
            trace!("Unparsable KRPC packet from {from}");
            return;
        };

        match msg.y.as_str() {
            "r" => {
                let Some(tid) = msg.tid() else { return };
                if let Some(response) = msg.r {
                    self.remember_contact(NodeContact {
                        id: bytebuf_to_id(&response.id).unwrap_or([0u8; 20]),
                        addr: from,
                    });
                    if let Some(tx) = self.pending.lock().unwrap().remove(&tid) {
                        let _ = tx.send(Ok(response));
                    }
                }
            }
            "e" => {
                let Some(tid) = msg.tid() else { return };
                let detail = msg
                    .e
                    .map(|e| format!("{} {}", e.0, e.1))
                    .unwrap_or_else(|| "unknown".into());
                if let Some(tx) = self.pending.lock().unwrap().remove(&tid) {
                    let _ = tx.send(Err(DiscoveryError::Query(detail)));
                }
            }
            "q" => self.answer_query(msg, from).await,
            _ => {}
        }
    }

    /// Minimal responder: enough of BEP 5 to be useful to neighbors.
    async fn answer_query(&self, msg: KrpcMessage, from: SocketAddr) {
        let Some(query) = msg.q.as_deref() else { return };
        let t = msg.t.clone();

        let reply = match query {
            "ping" | "announce_peer" => KrpcMessage::response(
                t,
                KrpcResponse {
                    id: ByteBuf::from(self.node_id.to_vec()),
                    ..Default::default()
                },
            ),
            "find_node" | "get_peers" => {
                let target = msg
                    .a
                    .as_ref()
                    .and_then(|a| a.target.as_ref().or(a.info_hash.as_ref()))
                    .and_then(bytebuf_to_id)
                    .unwrap_or([0u8; 20]);
                let closest = self.closest(&target, 8);
                KrpcMessage::response(
                    t,
                    KrpcResponse {
                        id: ByteBuf::from(self.node_id.to_vec()),
                        nodes: Some(ByteBuf::from(serialize_compact_nodes(&closest))),
                        token: (query == "get_peers")
                            .then(|| ByteBuf::from(self.our_token.clone())),
                        ..Default::default()
                    },
                )
            }
            _ => KrpcMessage::error(t, 204, "Method Unknown"),
        };

        if let Ok(bytes) = reply.to_bytes() {
            if let Err(e) = self.socket.send_to(&bytes, from).await {
                trace!("Failed to answer {query} from {from}: {e}");
            }
        }
    }

    /// Send one query and await its matching response.
    async fn query(
        &self,
        addr: SocketAddr,
        build: impl FnOnce(u16) -> KrpcMessage,
    ) -> DiscoveryResult<KrpcResponse> {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let msg = build(tid);
        let data = msg.to_bytes()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(tid, tx);

        let result = async {
            self.socket.send_to(&data, addr).await?;
            match tokio::time::timeout(RPC_TIMEOUT, rx).await {
                Ok(Ok(response)) => response,
                Ok(Err(_)) | Err(_) => Err(DiscoveryError::Timeout),
            }
        }
        .await;

        self.pending.lock().unwrap().remove(&tid);
        result
    }

    pub async fn ping(&self, addr: SocketAddr) -> DiscoveryResult<KrpcResponse> {
        let id = self.node_id;
        self.query(addr, |tid| KrpcMessage::ping(tid, id)).await
    }

    pub async fn find_node(
        &self,
        addr: SocketAddr,
        target: [u8; 20],
    ) -> DiscoveryResult<KrpcResponse> {
        let id = self.node_id;
        self.query(addr, |tid| KrpcMessage::find_node(tid, id, target))
            .await
    }

    pub async fn get_peers(
        &self,
        addr: SocketAddr,
        info_hash: [u8; 20],
    ) -> DiscoveryResult<KrpcResponse> {
        let id = self.node_id;
        self.query(addr, |tid| KrpcMessage::get_peers(tid, id, info_hash))
            .await
    }

    pub async fn announce_peer(
        &self,
        addr: SocketAddr,
        info_hash: [u8; 20],
        port: u16,
        token: ByteBuf,
    ) -> DiscoveryResult<KrpcResponse> {
        let id = self.node_id;
        self.query(addr, move |tid| {
            KrpcMessage::announce_peer(tid, id, info_hash, port, token)
        })
        .await
    }

    /// Seed the pool from bootstrap nodes via a self-lookup.
    pub async fn bootstrap(self: &Arc<Self>, bootstrap_addrs: &[SocketAddr]) {
        let mut set = JoinSet::new();
        for &addr in bootstrap_addrs {
            let client = self.clone();
            set.spawn(async move { client.find_node(addr, client.node_id).await });
        }
        while let Some(result) = set.join_next().await {
            if let Ok(Ok(response)) = result {
                self.absorb_nodes(&response);
            }
        }

        // Widen the view with one iterative pass toward ourselves
        let _ = self.lookup(self.node_id).await;
    }

    /// Iterative get_peers lookup: repeatedly query the closest unqueried
    /// contacts, absorbing closer nodes as they appear.
    pub async fn lookup(self: &Arc<Self>, info_hash: [u8; 20]) -> LookupResult {
        let mut result = LookupResult::default();
        let mut queried: HashSet<SocketAddr> = HashSet::new();
        let mut peers_seen: HashSet<SocketAddr> = HashSet::new();

        while queried.len() < LOOKUP_BUDGET {
            let batch: Vec<NodeContact> = self
                .closest(&info_hash, LOOKUP_BUDGET)
                .into_iter()
                .filter(|n| !queried.contains(&n.addr))
                .take(ALPHA)
                .collect();
            if batch.is_empty() {
                break;
            }

            let mut set = JoinSet::new();
            for node in batch {
                queried.insert(node.addr);
                let client = self.clone();
                set.spawn(async move {
                    let response = client.get_peers(node.addr, info_hash).await;
                    (node, response)
                });
            }

            while let Some(joined) = set.join_next().await {
                let Ok((node, response)) = joined else { continue };
                let Ok(response) = response else { continue };

                self.absorb_nodes(&response);
                if let Some(values) = &response.values {
                    for peer in parse_compact_peers(values) {
                        if peers_seen.insert(peer) {
                            result.peers.push(peer);
                        }
                    }
                }
                result.responders.push((node, response.token.clone()));
            }
        }

        // Announce targets are the responders closest to the infohash
        result
            .responders
            .sort_by_key(|(node, _)| node.distance(&info_hash));
        result
    }

    /// Lookup plus announce_peer to the closest token-bearing responders.
    /// Returns how many nodes accepted the announce.
    pub async fn announce(self: &Arc<Self>, info_hash: [u8; 20], port: u16) -> usize {
        let lookup = self.lookup(info_hash).await;
        let mut accepted = 0;

        for (node, token) in lookup.responders.into_iter().take(ANNOUNCE_WIDTH) {
            let Some(token) = token else { continue };
            match self.announce_peer(node.addr, info_hash, port, token).await {
                Ok(_) => accepted += 1,
                Err(e) => trace!("announce_peer to {} failed: {e}", node.addr),
            }
        }
        accepted
    }

    fn absorb_nodes(&self, response: &KrpcResponse) {
        if let Some(nodes) = &response.nodes {
            for contact in parse_compact_nodes(nodes) {
                self.remember_contact(contact);
            }
        }
    }

    fn remember_contact(&self, contact: NodeContact) {
        if contact.id == [0u8; 20] || contact.id == self.node_id {
            return;
        }
        let mut pool = self.pool.lock().unwrap();
        if pool.len() >= MAX_POOL {
            return;
        }
        if !pool.iter().any(|n| n.addr == contact.addr) {
            pool.push(contact);
        }
    }

    fn closest(&self, target: &[u8; 20], count: usize) -> Vec<NodeContact> {
        let mut pool = self.pool.lock().unwrap().clone();
        pool.sort_by_key(|n| n.distance(target));
        pool.truncate(count);
        pool
    }

    /// Directly seed the contact pool (tests).
    #[cfg(test)]
    pub(crate) fn seed_contact(&self, contact: NodeContact) {
        self.remember_contact(contact);
    }
}

fn bytebuf_to_id(buf: &ByteBuf) -> Option<[u8; 20]> {
    let bytes: &[u8] = buf;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn started_client() -> (Arc<DhtClient>, watch::Sender<bool>) {
        let client = DhtClient::bind(0).await.unwrap();
        let (tx, rx) = watch::channel(false);
        client.start(rx);
        (client, tx)
    }

    #[tokio::test]
    async fn test_ping_pong_between_clients() {
        let (a, _ga) = started_client().await;
        let (b, _gb) = started_client().await;

        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.local_port()).parse().unwrap();
        let response = a.ping(b_addr).await.unwrap();

        assert_eq!(response.id.as_ref(), &b.node_id);
        // The responder is now a known contact
        assert_eq!(a.node_count(), 1);
    }

    #[tokio::test]
    async fn test_find_node_returns_known_contacts() {
        let (a, _ga) = started_client().await;
        let (b, _gb) = started_client().await;

        b.seed_contact(NodeContact {
            id: [0x42; 20],
            addr: "192.0.2.10:6881".parse().unwrap(),
        });

        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.local_port()).parse().unwrap();
        let response = a.find_node(b_addr, [0x42; 20]).await.unwrap();

        let nodes = parse_compact_nodes(response.nodes.as_ref().unwrap());
        assert!(nodes.iter().any(|n| n.id == [0x42; 20]));
    }

    #[tokio::test]
    async fn test_get_peers_issues_token() {
        let (a, _ga) = started_client().await;
        let (b, _gb) = started_client().await;

        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.local_port()).parse().unwrap();
        let response = a.get_peers(b_addr, [0x99; 20]).await.unwrap();
        assert!(response.token.is_some());
    }

    #[tokio::test]
    async fn test_query_timeout_on_silent_peer() {
        let (a, _ga) = started_client().await;
        // A socket nobody reads from
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(7), a.ping(addr)).await;
        match result {
            Ok(Err(DiscoveryError::Timeout)) => {}
            other => panic!("expected RPC timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= RPC_TIMEOUT);
        // The transaction entry was reclaimed
        assert!(a.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_collects_peers_from_responders() {
        let (a, _ga) = started_client().await;

        // A fake DHT node that answers get_peers with one compact peer
        let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let fake_addr = fake.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let Ok((len, from)) = fake.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(msg) = KrpcMessage::from_bytes(&buf[..len]) else {
                    continue;
                };
                let reply = KrpcMessage::response(
                    msg.t.clone(),
                    KrpcResponse {
                        id: ByteBuf::from(vec![0x77; 20]),
                        token: Some(ByteBuf::from(b"tok".to_vec())),
                        values: Some(vec![ByteBuf::from(vec![198, 51, 100, 7, 0xca, 0x7d])]),
                        ..Default::default()
                    },
                );
                let _ = fake.send_to(&reply.to_bytes().unwrap(), from).await;
            }
        });

        a.seed_contact(NodeContact {
            id: [0x77; 20],
            addr: fake_addr,
        });

        let result = a.lookup([0x55; 20]).await;
        assert_eq!(result.peers, vec!["198.51.100.7:51837".parse().unwrap()]);
        assert_eq!(result.responders.len(), 1);
        assert_eq!(
            result.responders[0].1.as_ref().unwrap().as_ref(),
            b"tok"
        );

        // And the same fixture accepts our announce
        assert_eq!(a.announce([0x55; 20], 51821).await, 1);
    }
}
