//! wgmesh Peer Discovery
//!
//! Five independent layers, each feeding the shared peer store:
//! - Peer exchange: the encrypted HELLO/REPLY/ANNOUNCE protocol every
//!   other layer speaks through
//! - DHT: anonymous rendezvous on the public BitTorrent Mainline DHT
//!   under an hourly-rotating infohash
//! - LAN: IPv4 multicast announcements for same-wire neighbors
//! - Registry: best-effort bootstrap through a public issue tracker
//! - Dandelion: opt-in stem/fluff relay that decouples a node's announce
//!   from its IP address
//!
//! Layers share nothing but the peer store and never gate each other;
//! a failing layer logs and keeps the rest of the mesh converging.

pub mod dandelion;
pub mod dht;
pub mod error;
pub mod exchange;
pub mod lan;
pub mod registry;

pub use dandelion::{DandelionAnnounce, DandelionRouter, RelayDecision};
pub use dht::DhtDiscovery;
pub use error::{DiscoveryError, DiscoveryResult};
pub use exchange::PeerExchange;
pub use lan::LanDiscovery;
pub use registry::RendezvousRegistry;

/// Discovery method tags recorded in `PeerInfo::discovered_via`
pub mod method {
    pub const LAN: &str = "lan";
    pub const DHT: &str = "dht";
    pub const GOSSIP: &str = "gossip";
    pub const REGISTRY: &str = "registry";
    pub const DANDELION: &str = "dandelion";

    /// Tag for peers learned second-hand from another peer's known list
    pub fn transitive(base: &str) -> String {
        format!("{base}-transitive")
    }
}
