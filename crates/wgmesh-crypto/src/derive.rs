//! Key Derivation
//!
//! Every identifier the mesh uses is a pure function of the shared secret:
//! the DHT network ID, the gossip encryption key, the overlay subnet, the
//! multicast group, the WireGuard PSK, the gossip port, the membership key
//! and the dandelion epoch seed. Two nodes holding the same secret derive
//! bitwise-identical values with no coordination.
//!
//! The salt strings below are part of the wire protocol. Changing any of
//! them splits the mesh.

use std::net::Ipv4Addr;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{GOSSIP_PORT_BASE, GOSSIP_PORT_SPAN, MIN_SECRET_LENGTH, NETWORK_ID_SIZE};
use crate::error::{CryptoError, CryptoResult};

type HmacSha256 = Hmac<Sha256>;

const SALT_GOSSIP: &str = "wgmesh-gossip-v1";
const SALT_SUBNET: &str = "wgmesh-subnet-v1";
const SALT_MCAST: &str = "wgmesh-mcast-v1";
const SALT_PSK: &str = "wgmesh-wg-psk-v1";
const SALT_GOSSIP_PORT: &str = "wgmesh-gossip-port-v1";
const SALT_MEMBERSHIP: &str = "wgmesh-membership-v1";
const SALT_EPOCH: &str = "wgmesh-epoch-v1";
const SALT_RENDEZVOUS: &str = "wgmesh-rendezvous-v1";

/// Seconds per network-ID rotation window
const ROTATION_PERIOD_SECS: i64 = 3600;

/// All keys and parameters derived from a shared secret
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    /// DHT infohash (20 bytes for BEP 5); hourly-rotated variants come
    /// from [`network_id_at`]
    pub network_id: [u8; NETWORK_ID_SIZE],
    /// Symmetric key sealing all discovery envelopes
    pub gossip_key: [u8; 32],
    /// Second octet of the 10.x.0.0/16 overlay block
    pub mesh_subnet: u8,
    /// Last two octets of the 239.192.x.y multicast group
    pub multicast_id: [u8; 2],
    /// WireGuard preshared key applied to every mesh link
    pub psk: [u8; 32],
    /// UDP port of the peer-exchange protocol, in [51821, 52820]
    pub gossip_port: u16,
    /// HMAC key for membership tokens
    pub membership_key: [u8; 32],
    /// Seed for deterministic dandelion relay selection
    pub epoch_seed: [u8; 32],
    /// Search term discriminator for the rendezvous registry
    pub rendezvous_id: [u8; 8],
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material; the network ID is already public on the DHT.
        f.debug_struct("DerivedKeys")
            .field("network_id", &hex::encode(self.network_id))
            .field("mesh_subnet", &self.mesh_subnet)
            .field("gossip_port", &self.gossip_port)
            .finish_non_exhaustive()
    }
}

/// Derive all keys and parameters from a shared secret.
///
/// The secret is consumed as its raw string bytes (never base64-decoded),
/// so the URI form and the bare form of the same string agree.
pub fn derive_keys(secret: &str) -> CryptoResult<DerivedKeys> {
    if secret.len() < MIN_SECRET_LENGTH {
        return Err(CryptoError::InvalidSecret);
    }

    let mut network_id = [0u8; NETWORK_ID_SIZE];
    let digest = Sha256::digest(secret.as_bytes());
    network_id.copy_from_slice(&digest[..NETWORK_ID_SIZE]);

    let mut gossip_key = [0u8; 32];
    hkdf_expand(secret, SALT_GOSSIP, &mut gossip_key);

    let mut subnet = [0u8; 1];
    hkdf_expand(secret, SALT_SUBNET, &mut subnet);

    let mut multicast_id = [0u8; 2];
    hkdf_expand(secret, SALT_MCAST, &mut multicast_id);

    let mut psk = [0u8; 32];
    hkdf_expand(secret, SALT_PSK, &mut psk);

    let mut port_bytes = [0u8; 2];
    hkdf_expand(secret, SALT_GOSSIP_PORT, &mut port_bytes);
    let gossip_port = GOSSIP_PORT_BASE + (u16::from_be_bytes(port_bytes) % GOSSIP_PORT_SPAN);

    let mut membership_key = [0u8; 32];
    hkdf_expand(secret, SALT_MEMBERSHIP, &mut membership_key);

    let mut epoch_seed = [0u8; 32];
    hkdf_expand(secret, SALT_EPOCH, &mut epoch_seed);

    let mut rendezvous_id = [0u8; 8];
    hkdf_expand(secret, SALT_RENDEZVOUS, &mut rendezvous_id);

    Ok(DerivedKeys {
        network_id,
        gossip_key,
        mesh_subnet: subnet[0],
        multicast_id,
        psk,
        gossip_port,
        membership_key,
        epoch_seed,
        rendezvous_id,
    })
}

/// Time-rotated network ID for a given Unix timestamp.
///
/// Rotates hourly so a passive DHT observer cannot link the same mesh
/// across days. The `||` separator is literal wire behavior.
pub fn network_id_at(secret: &str, unix_secs: i64) -> [u8; NETWORK_ID_SIZE] {
    let hour_epoch = unix_secs.div_euclid(ROTATION_PERIOD_SECS);
    let input = format!("{}||{}", secret, hour_epoch);

    let digest = Sha256::digest(input.as_bytes());
    let mut id = [0u8; NETWORK_ID_SIZE];
    id.copy_from_slice(&digest[..NETWORK_ID_SIZE]);
    id
}

/// Current- and previous-hour network IDs.
///
/// Both are honored around the rotation boundary so peers with skewed
/// clocks still find each other.
pub fn network_ids_for(
    secret: &str,
    unix_secs: i64,
) -> ([u8; NETWORK_ID_SIZE], [u8; NETWORK_ID_SIZE]) {
    (
        network_id_at(secret, unix_secs),
        network_id_at(secret, unix_secs - ROTATION_PERIOD_SECS),
    )
}

/// Deterministic mesh IP for a node: `10.<subnet>.<hi>.<lo>` where
/// `hi:lo = u16(SHA-256(pubkey || secret)[0..2])`, clamped away from the
/// all-zero and all-ones suffixes.
pub fn derive_mesh_ip(mesh_subnet: u8, wg_pubkey: &str, secret: &str) -> Ipv4Addr {
    let mut hasher = Sha256::new();
    hasher.update(wg_pubkey.as_bytes());
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();

    suffix_to_ip(mesh_subnet, u16::from_be_bytes([digest[0], digest[1]]))
}

/// Mesh IP re-derivation with a collision-avoidance nonce. Nonce 0 is never
/// used; the first re-derivation after losing a collision passes 1.
pub fn derive_mesh_ip_with_nonce(
    mesh_subnet: u8,
    wg_pubkey: &str,
    secret: &str,
    nonce: u32,
) -> Ipv4Addr {
    let input = format!("{}{}|nonce={}", wg_pubkey, secret, nonce);
    let digest = Sha256::digest(input.as_bytes());

    suffix_to_ip(mesh_subnet, u16::from_be_bytes([digest[0], digest[1]]))
}

fn suffix_to_ip(mesh_subnet: u8, suffix: u16) -> Ipv4Addr {
    let suffix = match suffix {
        0 => 1,
        u16::MAX => u16::MAX - 1,
        s => s,
    };
    Ipv4Addr::new(10, mesh_subnet, (suffix >> 8) as u8, (suffix & 0xff) as u8)
}

/// Membership token: hex HMAC of the node's public key under the derived
/// membership key. Proves knowledge of the secret independently of the
/// gossip key; carried as an optional announcement field.
pub fn membership_token(membership_key: &[u8; 32], wg_pubkey: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(membership_key).expect("HMAC accepts any key length");
    mac.update(wg_pubkey.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a membership token in constant time.
pub fn verify_membership_token(membership_key: &[u8; 32], wg_pubkey: &str, token: &str) -> bool {
    let Ok(token_bytes) = hex::decode(token) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(membership_key).expect("HMAC accepts any key length");
    mac.update(wg_pubkey.as_bytes());
    mac.verify_slice(&token_bytes).is_ok()
}

fn hkdf_expand(secret: &str, salt: &str, output: &mut [u8]) {
    let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), secret.as_bytes());
    hk.expand(&[], output)
        .expect("HKDF output lengths are all far below the 255*32 limit");
}
