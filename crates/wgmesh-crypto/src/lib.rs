//! wgmesh Cryptographic Primitives
//!
//! Everything that turns the shared mesh secret into usable material:
//! - Key derivation (HKDF-SHA256): gossip key, subnet, ports, PSK, seeds
//! - Authenticated discovery envelopes (AES-256-GCM)
//! - WireGuard keypair generation (X25519)
//! - Deterministic mesh-IP assignment and collision re-derivation

pub mod derive;
pub mod envelope;
pub mod error;
pub mod keys;

pub use derive::{
    derive_keys, derive_mesh_ip, derive_mesh_ip_with_nonce, membership_token, network_id_at,
    network_ids_for, verify_membership_token, DerivedKeys,
};
pub use envelope::{
    open_announcement, open_envelope, parse_announcement, seal_envelope, Envelope, KnownPeer,
    MessageType, PeerAnnouncement,
};
pub use error::{CryptoError, CryptoResult};
pub use keys::{generate_keypair, public_key_from_private, WgKeyPair};

/// Protocol constants shared by every layer
pub mod constants {
    /// Minimum acceptable secret length in bytes
    pub const MIN_SECRET_LENGTH: usize = 16;

    /// AES-256-GCM key size
    pub const GOSSIP_KEY_SIZE: usize = 32;

    /// GCM nonce size
    pub const NONCE_SIZE: usize = 12;

    /// DHT infohash size (BEP 5)
    pub const NETWORK_ID_SIZE: usize = 20;

    /// Wire protocol tag carried inside every announcement
    pub const PROTOCOL_VERSION: &str = "wgmesh-v1";

    /// Maximum accepted clock skew for announcements, seconds
    pub const MAX_MESSAGE_AGE_SECS: i64 = 600;

    /// First port of the derived gossip-port range
    pub const GOSSIP_PORT_BASE: u16 = 51821;

    /// Width of the derived gossip-port range
    pub const GOSSIP_PORT_SPAN: u16 = 1000;
}
