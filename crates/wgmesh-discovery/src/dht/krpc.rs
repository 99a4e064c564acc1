//! KRPC wire format (BEP 5)
//!
//! Bencoded dictionaries over UDP. Queries carry `t` (transaction id),
//! `y = "q"`, a method name `q` and arguments `a`; responses carry
//! `y = "r"` and a response dict `r`; errors carry `y = "e"` and a
//! `[code, message]` list. Struct fields are declared in bencode key
//! order so serialization is canonical.
//!
//! Node contacts travel in "compact" form: 20-byte node ID followed by
//! 4-byte IPv4 and 2-byte big-endian port. Peer values are the 6-byte
//! tail alone.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::{DiscoveryError, DiscoveryResult};

/// Bytes per compact node entry
const COMPACT_NODE_LEN: usize = 26;

/// Bytes per compact peer entry
const COMPACT_PEER_LEN: usize = 6;

/// A KRPC message of any kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KrpcMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub a: Option<KrpcArgs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<KrpcError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r: Option<KrpcResponse>,
    pub t: ByteBuf,
    pub y: String,
}

/// Query arguments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KrpcArgs {
    pub id: ByteBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implied_port: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
}

/// Response dictionary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KrpcResponse {
    pub id: ByteBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ByteBuf>>,
}

/// KRPC error payload: `[code, message]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KrpcError(pub i64, pub String);

impl KrpcMessage {
    pub fn to_bytes(&self) -> DiscoveryResult<Vec<u8>> {
        serde_bencode::to_bytes(self).map_err(|e| DiscoveryError::Krpc(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> DiscoveryResult<Self> {
        serde_bencode::from_bytes(bytes).map_err(|e| DiscoveryError::Krpc(e.to_string()))
    }

    fn query(tid: u16, name: &str, args: KrpcArgs) -> Self {
        Self {
            a: Some(args),
            e: None,
            q: Some(name.to_string()),
            r: None,
            t: ByteBuf::from(tid.to_be_bytes().to_vec()),
            y: "q".to_string(),
        }
    }

    pub fn ping(tid: u16, id: [u8; 20]) -> Self {
        Self::query(
            tid,
            "ping",
            KrpcArgs {
                id: ByteBuf::from(id.to_vec()),
                ..Default::default()
            },
        )
    }

    pub fn find_node(tid: u16, id: [u8; 20], target: [u8; 20]) -> Self {
        Self::query(
            tid,
            "find_node",
            KrpcArgs {
                id: ByteBuf::from(id.to_vec()),
                target: Some(ByteBuf::from(target.to_vec())),
                ..Default::default()
            },
        )
    }

    pub fn get_peers(tid: u16, id: [u8; 20], info_hash: [u8; 20]) -> Self {
        Self::query(
            tid,
            "get_peers",
            KrpcArgs {
                id: ByteBuf::from(id.to_vec()),
                info_hash: Some(ByteBuf::from(info_hash.to_vec())),
                ..Default::default()
            },
        )
    }

    pub fn announce_peer(
        tid: u16,
        id: [u8; 20],
        info_hash: [u8; 20],
        port: u16,
        token: ByteBuf,
    ) -> Self {
        Self::query(
            tid,
            "announce_peer",
            KrpcArgs {
                id: ByteBuf::from(id.to_vec()),
                info_hash: Some(ByteBuf::from(info_hash.to_vec())),
                // We always announce the explicit gossip port, never the
                // KRPC source port
                implied_port: Some(0),
                port: Some(port),
                ..Default::default()
            },
        )
    }

    /// A response echoing the querier's transaction id.
    pub fn response(t: ByteBuf, r: KrpcResponse) -> Self {
        Self {
            a: None,
            e: None,
            q: None,
            r: Some(r),
            t,
            y: "r".to_string(),
        }
    }

    pub fn error(t: ByteBuf, code: i64, message: &str) -> Self {
        Self {
            a: None,
            e: Some(KrpcError(code, message.to_string())),
            q: None,
            r: None,
            t,
            y: "e".to_string(),
        }
    }

    /// Transaction id as u16 when it has our 2-byte shape.
    pub fn tid(&self) -> Option<u16> {
        let bytes: &[u8] = &self.t;
        Some(u16::from_be_bytes(bytes.try_into().ok()?))
    }
}

/// A DHT node contact: ID plus address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContact {
    pub id: [u8; 20],
    pub addr: SocketAddr,
}

impl NodeContact {
    /// XOR distance to a target, comparable as a big-endian integer.
    pub fn distance(&self, target: &[u8; 20]) -> [u8; 20] {
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.id[i] ^ target[i];
        }
        out
    }
}

/// Parse a compact node list (26 bytes per entry). Trailing partial
/// entries and non-IPv4 content are ignored.
pub fn parse_compact_nodes(data: &[u8]) -> Vec<NodeContact> {
    data.chunks_exact(COMPACT_NODE_LEN)
        .map(|chunk| {
            let mut id = [0u8; 20];
            id.copy_from_slice(&chunk[..20]);
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            NodeContact {
                id,
                addr: SocketAddr::new(IpAddr::V4(ip), port),
            }
        })
        .filter(|n| n.addr.port() != 0)
        .collect()
}

/// Serialize contacts to the compact node format (IPv4 only).
pub fn serialize_compact_nodes(nodes: &[NodeContact]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for node in nodes {
        let IpAddr::V4(ip) = node.addr.ip() else {
            continue;
        };
        out.extend_from_slice(&node.id);
        out.extend_from_slice(&ip.octets());
        out.extend_from_slice(&node.addr.port().to_be_bytes());
    }
    out
}

/// Parse compact peer values (6 bytes each) from a get_peers response.
pub fn parse_compact_peers(values: &[ByteBuf]) -> Vec<SocketAddr> {
    values
        .iter()
        .filter(|v| v.len() == COMPACT_PEER_LEN)
        .map(|v| {
            let ip = Ipv4Addr::new(v[0], v[1], v[2], v[3]);
            let port = u16::from_be_bytes([v[4], v[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .filter(|a| a.port() != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_encodes_canonically() {
        let msg = KrpcMessage::ping(0x5858, *b"abcdefghij0123456789");
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(
            bytes,
            b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:XX1:y1:qe"
        );
    }

    #[test]
    fn test_get_peers_roundtrip() {
        let msg = KrpcMessage::get_peers(7, [1u8; 20], [2u8; 20]);
        let decoded = KrpcMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.y, "q");
        assert_eq!(decoded.q.as_deref(), Some("get_peers"));
        assert_eq!(decoded.tid(), Some(7));
        let args = decoded.a.unwrap();
        assert_eq!(args.id.as_ref(), &[1u8; 20]);
        assert_eq!(args.info_hash.unwrap().as_ref(), &[2u8; 20]);
    }

    #[test]
    fn test_announce_peer_carries_port_and_token() {
        let msg = KrpcMessage::announce_peer(
            9,
            [1u8; 20],
            [2u8; 20],
            51832,
            ByteBuf::from(b"tok".to_vec()),
        );
        let decoded = KrpcMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();

        let args = decoded.a.unwrap();
        assert_eq!(args.port, Some(51832));
        assert_eq!(args.implied_port, Some(0));
        assert_eq!(args.token.unwrap().as_ref(), b"tok");
    }

    #[test]
    fn test_foreign_response_with_extra_keys_parses() {
        // Real DHT nodes add fields like "ip"; unknown keys must not break us
        let raw = b"d2:ip6:\x01\x02\x03\x04\x05\x061:rd2:id20:mnopqrstuvwxyz1234565:token4:abcde1:t2:\x00\x071:y1:re";
        let decoded = KrpcMessage::from_bytes(raw).unwrap();

        assert_eq!(decoded.y, "r");
        assert_eq!(decoded.tid(), Some(7));
        let r = decoded.r.unwrap();
        assert_eq!(r.token.unwrap().as_ref(), b"abcd");
    }

    #[test]
    fn test_error_roundtrip() {
        let raw = b"d1:eli201e23:A Generic Error Ocurrede1:t2:XX1:y1:ee";
        let decoded = KrpcMessage::from_bytes(raw).unwrap();
        assert_eq!(decoded.y, "e");
        let err = decoded.e.unwrap();
        assert_eq!(err.0, 201);
        assert_eq!(err.1, "A Generic Error Ocurred");
    }

    #[test]
    fn test_compact_nodes_roundtrip() {
        let nodes = vec![
            NodeContact {
                id: [0xaa; 20],
                addr: "1.2.3.4:6881".parse().unwrap(),
            },
            NodeContact {
                id: [0xbb; 20],
                addr: "5.6.7.8:25401".parse().unwrap(),
            },
        ];

        let compact = serialize_compact_nodes(&nodes);
        assert_eq!(compact.len(), 52);
        assert_eq!(parse_compact_nodes(&compact), nodes);

        // Truncated tail is dropped, not an error
        assert_eq!(parse_compact_nodes(&compact[..60]).len(), 2);
    }

    #[test]
    fn test_compact_peers_parse() {
        let values = vec![
            ByteBuf::from(vec![192, 0, 2, 1, 0xca, 0x6c]),
            ByteBuf::from(vec![1, 2, 3]),              // wrong length
            ByteBuf::from(vec![192, 0, 2, 2, 0, 0]),   // port 0
        ];

        let peers = parse_compact_peers(&values);
        assert_eq!(peers, vec!["192.0.2.1:51820".parse().unwrap()]);
    }

    #[test]
    fn test_xor_distance_orders_contacts() {
        let target = [0u8; 20];
        let near = NodeContact {
            id: {
                let mut id = [0u8; 20];
                id[19] = 1;
                id
            },
            addr: "1.1.1.1:1".parse().unwrap(),
        };
        let far = NodeContact {
            id: [0xff; 20],
            addr: "2.2.2.2:2".parse().unwrap(),
        };

        assert!(near.distance(&target) < far.distance(&target));
    }
}
