//! Mesh-IP collision resolution
//!
//! Two public keys can hash to the same 16-bit IP suffix. Resolution is
//! deterministic and needs no coordination: the lexicographically lower
//! public key keeps the address, the other side re-derives with an
//! increasing nonce until it lands on a free one.

use crate::peerstore::PeerInfo;

/// Two distinct peers claiming the same mesh IP
#[derive(Debug, Clone)]
pub struct Collision {
    pub mesh_ip: String,
    pub peer_a: PeerInfo,
    pub peer_b: PeerInfo,
}

/// Order a colliding pair into (winner, loser). The winner keeps the IP.
pub fn deterministic_winner<'a>(
    peer_a: &'a PeerInfo,
    peer_b: &'a PeerInfo,
) -> (&'a PeerInfo, &'a PeerInfo) {
    if peer_a.wg_pubkey < peer_b.wg_pubkey {
        (peer_a, peer_b)
    } else {
        (peer_b, peer_a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(pubkey: &str) -> PeerInfo {
        PeerInfo::new(pubkey, "10.1.7.7", "", Vec::new())
    }

    #[test]
    fn test_lower_pubkey_wins() {
        let a = peer("AAAA");
        let b = peer("BBBB");

        let (winner, loser) = deterministic_winner(&a, &b);
        assert_eq!(winner.wg_pubkey, "AAAA");
        assert_eq!(loser.wg_pubkey, "BBBB");

        // Argument order is irrelevant
        let (winner, loser) = deterministic_winner(&b, &a);
        assert_eq!(winner.wg_pubkey, "AAAA");
        assert_eq!(loser.wg_pubkey, "BBBB");
    }
}
