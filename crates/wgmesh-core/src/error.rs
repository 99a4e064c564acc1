//! Core error types

use thiserror::Error;

/// Errors from configuration, state and WireGuard control
#[derive(Debug, Error)]
pub enum CoreError {
    /// Secret failed validation
    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    /// The WireGuard driver or routing tooling rejected an operation.
    /// The reconciler logs these per-peer and carries on.
    #[error("wireguard driver error: {0}")]
    WgDriver(String),

    /// No free listen port could be found near the requested one
    #[error("port {0} is in use and no nearby port is free")]
    NoFreePort(u16),

    /// State file I/O
    #[error("state file error: {0}")]
    State(#[from] std::io::Error),

    /// State file contents are unusable
    #[error("corrupt state file: {0}")]
    CorruptState(String),

    /// Key derivation failed
    #[error(transparent)]
    Crypto(#[from] wgmesh_crypto::CryptoError),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
