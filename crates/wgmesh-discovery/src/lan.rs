//! LAN Multicast Discovery
//!
//! Same-wire neighbors find each other without any infrastructure: every
//! 5 seconds each node multicasts a sealed ANNOUNCE to the derived group
//! `239.192.<m0>.<m1>` on the fixed port 51830 (fixed for interop; only
//! the group address is secret-derived). TTL 1 keeps it on the segment.
//!
//! Announcements stay small: no `known_peers`, just the node itself. The
//! wider mesh view travels through gossip and the DHT.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, trace, warn};

use wgmesh_core::{LocalNode, PeerInfo, PeerStore};
use wgmesh_crypto::envelope::{
    open_announcement, seal_envelope, MessageType, PeerAnnouncement,
};
use wgmesh_crypto::{membership_token, verify_membership_token};

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::exchange::resolve_endpoint;
use crate::method;

/// Fixed multicast port; not derived, so mixed-secret LANs share it and
/// rely on the envelope to separate meshes
pub const LAN_PORT: u16 = 51830;

/// Announce period
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);

const MAX_DATAGRAM: usize = 4096;

pub struct LanDiscovery {
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
    gossip_key: [u8; 32],
    membership_key: [u8; 32],
    local: Arc<RwLock<LocalNode>>,
    store: Arc<PeerStore>,
}

impl LanDiscovery {
    /// Join the derived multicast group on the fixed LAN port.
    pub async fn new(
        multicast_id: [u8; 2],
        gossip_key: [u8; 32],
        membership_key: [u8; 32],
        local: Arc<RwLock<LocalNode>>,
        store: Arc<PeerStore>,
    ) -> DiscoveryResult<Arc<Self>> {
        Self::bind_on(LAN_PORT, multicast_id, gossip_key, membership_key, local, store).await
    }

    /// As [`new`](Self::new) with an explicit port (tests).
    pub async fn bind_on(
        port: u16,
        multicast_id: [u8; 2],
        gossip_key: [u8; 32],
        membership_key: [u8; 32],
        local: Arc<RwLock<LocalNode>>,
        store: Arc<PeerStore>,
    ) -> DiscoveryResult<Arc<Self>> {
        let group_ip = Ipv4Addr::new(239, 192, multicast_id[0], multicast_id[1]);

        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(DiscoveryError::Bind)?;
        socket
            .join_multicast_v4(group_ip, Ipv4Addr::UNSPECIFIED)
            .map_err(DiscoveryError::Bind)?;
        socket.set_multicast_ttl_v4(1)?;
        // Our own frames come back; the pubkey filter drops them
        socket.set_multicast_loop_v4(true)?;

        let port = socket.local_addr().map_err(DiscoveryError::Bind)?.port();
        let group = SocketAddrV4::new(group_ip, port);
        info!("LAN discovery joined multicast group {group}");

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            group,
            gossip_key,
            membership_key,
            local,
            store,
        }))
    }

    /// Spawn the announce and listen loops.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let announcer = self.clone();
        let mut announce_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = announce_shutdown.changed() => {
                        debug!("LAN announcer stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = announcer.announce().await {
                            warn!("LAN announce failed: {e}");
                        }
                    }
                }
            }
        });

        let listener = self.clone();
        let mut listen_shutdown = shutdown;
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = listen_shutdown.changed() => {
                        debug!("LAN listener stopping");
                        return;
                    }
                    result = listener.socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, from)) => listener.handle_packet(&buf[..len], from).await,
                            Err(e) => warn!("LAN socket read error: {e}"),
                        }
                    }
                }
            }
        });
    }

    async fn announce(&self) -> DiscoveryResult<()> {
        let announcement = {
            let local = self.local.read().await;
            PeerAnnouncement::new(
                local.wg_pubkey.clone(),
                local.mesh_ip.clone(),
                local.wg_endpoint.clone(),
                local.routable_networks.clone(),
                Vec::new(),
            )
            .with_membership(membership_token(&self.membership_key, &local.wg_pubkey))
        };

        let data = seal_envelope(MessageType::Announce, &announcement, &self.gossip_key)?;
        self.socket.send_to(&data, SocketAddr::V4(self.group)).await?;
        Ok(())
    }

    async fn handle_packet(&self, data: &[u8], from: SocketAddr) {
        // Not a wgmesh packet, stale, or a different mesh's secret
        let Ok((_, announcement)) = open_announcement(data, &self.gossip_key) else {
            trace!("Undecryptable LAN packet from {from}");
            return;
        };

        if announcement.wg_pubkey == self.local.read().await.wg_pubkey {
            return;
        }
        if let Some(token) = &announcement.membership {
            if !verify_membership_token(&self.membership_key, &announcement.wg_pubkey, token) {
                debug!("Dropping LAN announcement from {from} with bad membership token");
                return;
            }
        }

        let endpoint = resolve_endpoint(&announcement.wg_endpoint, from);
        debug!(
            "LAN neighbor {} ({}) at {endpoint}",
            &announcement.wg_pubkey[..announcement.wg_pubkey.len().min(8)],
            announcement.mesh_ip
        );

        let peer = PeerInfo::new(
            announcement.wg_pubkey,
            announcement.mesh_ip,
            endpoint,
            announcement.routable_networks,
        );
        self.store.update(peer, method::LAN).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgmesh_crypto::derive_keys;

    const SECRET: &str = "a-lan-discovery-test-secret";

    fn local(pubkey: &str) -> Arc<RwLock<LocalNode>> {
        Arc::new(RwLock::new(LocalNode {
            wg_pubkey: pubkey.to_string(),
            wg_privkey: "priv".to_string(),
            mesh_ip: "10.7.0.1".to_string(),
            wg_endpoint: "0.0.0.0:51820".to_string(),
            routable_networks: Vec::new(),
        }))
    }

    #[tokio::test]
    async fn test_group_address_is_derived() {
        let keys = derive_keys(SECRET).unwrap();
        let lan = LanDiscovery::bind_on(
            0,
            keys.multicast_id,
            keys.gossip_key,
            keys.membership_key,
            local("node-a"),
            PeerStore::new(),
        )
        .await
        .unwrap();

        let octets = lan.group.ip().octets();
        assert_eq!(octets[0], 239);
        assert_eq!(octets[1], 192);
        assert_eq!([octets[2], octets[3]], keys.multicast_id);
    }

    #[tokio::test]
    async fn test_announcement_is_merged_with_lan_tag() {
        let keys = derive_keys(SECRET).unwrap();
        let store = PeerStore::new();
        let lan = LanDiscovery::bind_on(
            0,
            keys.multicast_id,
            keys.gossip_key,
            keys.membership_key,
            local("node-a"),
            store.clone(),
        )
        .await
        .unwrap();
        let (_tx, rx) = watch::channel(false);
        lan.start(rx);

        let port = lan.socket.local_addr().unwrap().port();
        let announcement = PeerAnnouncement::new(
            "node-b",
            "10.7.0.2",
            "0.0.0.0:51820",
            vec!["172.16.0.0/24".into()],
            vec![],
        );
        let data = seal_envelope(MessageType::Announce, &announcement, &keys.gossip_key).unwrap();

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        probe
            .send_to(&data, format!("127.0.0.1:{port}"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let peer = store.get("node-b").await.unwrap();
        assert_eq!(peer.discovered_via, vec!["lan"]);
        assert_eq!(peer.endpoint, "127.0.0.1:51820");
        assert_eq!(peer.routable_networks, vec!["172.16.0.0/24"]);
    }

    #[tokio::test]
    async fn test_own_and_foreign_packets_ignored() {
        let keys = derive_keys(SECRET).unwrap();
        let store = PeerStore::new();
        let lan = LanDiscovery::bind_on(
            0,
            keys.multicast_id,
            keys.gossip_key,
            keys.membership_key,
            local("node-a"),
            store.clone(),
        )
        .await
        .unwrap();
        let (_tx, rx) = watch::channel(false);
        lan.start(rx);
        let port = lan.socket.local_addr().unwrap().port();

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Our own announcement echoes back
        let own =
            PeerAnnouncement::new("node-a", "10.7.0.1", "0.0.0.0:51820", vec![], vec![]);
        let data = seal_envelope(MessageType::Announce, &own, &keys.gossip_key).unwrap();
        probe
            .send_to(&data, format!("127.0.0.1:{port}"))
            .await
            .unwrap();

        // A different mesh's announcement
        let other_keys = derive_keys("a-lan-discovery-test-secreu").unwrap();
        let foreign =
            PeerAnnouncement::new("node-x", "10.9.0.9", "0.0.0.0:51820", vec![], vec![]);
        let data = seal_envelope(MessageType::Announce, &foreign, &other_keys.gossip_key).unwrap();
        probe
            .send_to(&data, format!("127.0.0.1:{port}"))
            .await
            .unwrap();

        // Plain junk
        probe
            .send_to(b"mdns? ssdp? who knows", format!("127.0.0.1:{port}"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.count().await, 0);
    }
}
