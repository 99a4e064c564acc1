//! Discovery error types

use thiserror::Error;

/// Errors from the discovery layers. None of these escalate past their
/// own layer: transient failures are logged and retried, foreign packets
/// are dropped, and only startup socket binds are fatal to the daemon.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Socket bind failed at startup; fatal for the owning layer
    #[error("failed to bind socket: {0}")]
    Bind(std::io::Error),

    /// Transient socket I/O
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer did not answer within the exchange timeout
    #[error("exchange timed out")]
    Timeout,

    /// KRPC encoding or decoding failed
    #[error("krpc error: {0}")]
    Krpc(String),

    /// The DHT query got an error or unusable response
    #[error("dht query failed: {0}")]
    Query(String),

    /// Registry HTTP failure
    #[error("registry error: {0}")]
    Registry(String),

    /// Envelope failures; callers treat these as foreign traffic
    #[error(transparent)]
    Crypto(#[from] wgmesh_crypto::CryptoError),
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
