//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Secret is too short or otherwise unusable
    #[error("invalid secret: must be at least {min} bytes", min = crate::constants::MIN_SECRET_LENGTH)]
    InvalidSecret,

    /// A packet failed decryption, parsing, version or freshness checks.
    /// Shared ports attract unrelated traffic; callers drop these silently.
    #[error("malformed or foreign packet")]
    MalformedPacket,

    /// Encryption failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Invalid key material length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Serialization error while sealing
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
