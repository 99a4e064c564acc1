//! wgmesh Core
//!
//! The state-bearing half of the daemon: configuration and secret
//! handling, the thread-safe peer store the discovery layers feed,
//! persisted local-node identity, the WireGuard control surface and the
//! reconciliation loop that converges the kernel interface toward the
//! active peer set.

pub mod collision;
pub mod config;
pub mod error;
pub mod node;
pub mod peerstore;
pub mod reconcile;
pub mod wgctl;

pub use collision::{deterministic_winner, Collision};
pub use config::{format_secret_uri, generate_secret, parse_secret, DaemonConfig, DaemonOpts};
pub use error::{CoreError, CoreResult};
pub use node::LocalNode;
pub use peerstore::{PeerInfo, PeerStore};
pub use reconcile::Reconciler;
pub use wgctl::{WgBackend, WgCli};

/// Default WireGuard listen port
pub const DEFAULT_WG_PORT: u16 = 51820;

/// Default WireGuard interface name
pub const DEFAULT_INTERFACE: &str = "wg0";

/// Peers unseen for this long are no longer offered to WireGuard
pub const PEER_ACTIVE_WINDOW_SECS: u64 = 300;

/// Peers unseen for this long are evicted entirely
pub const PEER_REMOVE_WINDOW_SECS: u64 = 600;

/// Persistent keepalive applied to every mesh peer, seconds
pub const PERSISTENT_KEEPALIVE_SECS: u16 = 25;
