//! WireGuard Keypairs (X25519)
//!
//! WireGuard keys are Curve25519 keys in base64; generating them in
//! process avoids shelling out to `wg genkey` and works on hosts where
//! the tooling is not yet installed.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};

/// A WireGuard keypair in the base64 form the `wg` tool speaks
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WgKeyPair {
    pub private_key: String,
    #[zeroize(skip)]
    pub public_key: String,
}

impl std::fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgKeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Generate a fresh WireGuard keypair.
pub fn generate_keypair() -> WgKeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    WgKeyPair {
        private_key: STANDARD.encode(secret.to_bytes()),
        public_key: STANDARD.encode(public.to_bytes()),
    }
}

/// Recompute the public key for a base64 private key.
///
/// Used to validate persisted state: a key file that fails this check is
/// corrupt and gets regenerated.
pub fn public_key_from_private(private_key: &str) -> CryptoResult<String> {
    let bytes = STANDARD
        .decode(private_key.trim())
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: 0,
        })?;

    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;

    let secret = StaticSecret::from(array);
    Ok(STANDARD.encode(PublicKey::from(&secret).to_bytes()))
}
