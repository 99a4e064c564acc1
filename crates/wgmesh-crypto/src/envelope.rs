//! Discovery Envelopes (AES-256-GCM)
//!
//! Every discovery message crosses the wire as a JSON envelope
//! `{type, nonce, ciphertext}` with base64 byte fields, sealed under the
//! derived gossip key. Decryption doubles as authentication: only holders
//! of the same secret can produce a ciphertext that opens, so discovery
//! layers need no further identity check.
//!
//! Opening is all-or-nothing. GCM tag, nonce length, protocol tag and
//! freshness all collapse into [`CryptoError::MalformedPacket`]; a shared
//! UDP port sees plenty of unrelated traffic and callers drop these
//! without logging noise.

use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_MESSAGE_AGE_SECS, NONCE_SIZE, PROTOCOL_VERSION};
use crate::error::{CryptoError, CryptoResult};

/// The three peer-exchange message types, plus the dandelion stem carrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    /// Advertise ourselves and request a REPLY
    Hello,
    /// Unicast answer to an outstanding HELLO
    Reply,
    /// One-shot push, no response expected
    Announce,
    /// Dandelion stem hop; plaintext is a `DandelionAnnounce`, not a
    /// `PeerAnnouncement`
    Stem,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Hello => write!(f, "HELLO"),
            MessageType::Reply => write!(f, "REPLY"),
            MessageType::Announce => write!(f, "ANNOUNCE"),
            MessageType::Stem => write!(f, "STEM"),
        }
    }
}

/// A peer this node knows about, shared for transitive discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPeer {
    pub wg_pubkey: String,
    pub mesh_ip: String,
    pub wg_endpoint: String,
}

/// Plaintext of HELLO/REPLY/ANNOUNCE envelopes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    /// Must equal [`PROTOCOL_VERSION`]
    pub protocol: String,
    pub wg_pubkey: String,
    pub mesh_ip: String,
    pub wg_endpoint: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routable_networks: Vec<String>,
    /// Unix seconds at send time; receivers enforce ±10 minutes
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub known_peers: Vec<KnownPeer>,
    /// Optional membership-token HMAC; verified when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership: Option<String>,
}

impl PeerAnnouncement {
    /// Build a fresh announcement stamped with the current time.
    pub fn new(
        wg_pubkey: impl Into<String>,
        mesh_ip: impl Into<String>,
        wg_endpoint: impl Into<String>,
        routable_networks: Vec<String>,
        known_peers: Vec<KnownPeer>,
    ) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            wg_pubkey: wg_pubkey.into(),
            mesh_ip: mesh_ip.into(),
            wg_endpoint: wg_endpoint.into(),
            routable_networks,
            timestamp: unix_now(),
            known_peers,
            membership: None,
        }
    }

    pub fn with_membership(mut self, token: String) -> Self {
        self.membership = Some(token);
        self
    }
}

/// Outer wire container; text-safe JSON with base64 byte fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

/// Seal a payload into an envelope with a fresh random nonce.
pub fn seal_envelope<T: Serialize>(
    message_type: MessageType,
    payload: &T,
    gossip_key: &[u8; 32],
) -> CryptoResult<Vec<u8>> {
    let plaintext =
        serde_json::to_vec(payload).map_err(|e| CryptoError::Serialization(e.to_string()))?;

    let cipher = Aes256Gcm::new_from_slice(gossip_key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut nonce = vec![0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| CryptoError::EncryptionFailed("AES-256-GCM seal failed".into()))?;

    let envelope = Envelope {
        message_type,
        nonce,
        ciphertext,
    };

    serde_json::to_vec(&envelope).map_err(|e| CryptoError::Serialization(e.to_string()))
}

/// Decrypt an envelope, returning its type and raw plaintext.
///
/// Verifies the GCM tag and nonce length only; payload-level checks live
/// in [`parse_announcement`] so the dandelion layer can carry its own
/// payload type.
pub fn open_envelope(data: &[u8], gossip_key: &[u8; 32]) -> CryptoResult<(Envelope, Vec<u8>)> {
    let envelope: Envelope =
        serde_json::from_slice(data).map_err(|_| CryptoError::MalformedPacket)?;

    if envelope.nonce.len() != NONCE_SIZE {
        return Err(CryptoError::MalformedPacket);
    }

    let cipher =
        Aes256Gcm::new_from_slice(gossip_key).map_err(|_| CryptoError::MalformedPacket)?;

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&envelope.nonce),
            envelope.ciphertext.as_slice(),
        )
        .map_err(|_| CryptoError::MalformedPacket)?;

    Ok((envelope, plaintext))
}

/// Parse and validate an announcement plaintext: protocol tag equality and
/// timestamp within ±10 minutes of now.
pub fn parse_announcement(plaintext: &[u8]) -> CryptoResult<PeerAnnouncement> {
    let announcement: PeerAnnouncement =
        serde_json::from_slice(plaintext).map_err(|_| CryptoError::MalformedPacket)?;

    if announcement.protocol != PROTOCOL_VERSION {
        return Err(CryptoError::MalformedPacket);
    }

    if (unix_now() - announcement.timestamp).abs() > MAX_MESSAGE_AGE_SECS {
        return Err(CryptoError::MalformedPacket);
    }

    Ok(announcement)
}

/// Open an envelope expected to carry a [`PeerAnnouncement`].
pub fn open_announcement(
    data: &[u8],
    gossip_key: &[u8; 32],
) -> CryptoResult<(Envelope, PeerAnnouncement)> {
    let (envelope, plaintext) = open_envelope(data, gossip_key)?;
    let announcement = parse_announcement(&plaintext)?;
    Ok((envelope, announcement))
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Base64 (standard alphabet) serde adapter for byte fields, matching the
/// JSON encoding the rest of the mesh speaks.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::derive_keys;

    fn test_key() -> [u8; 32] {
        derive_keys("a-perfectly-fine-test-secret")
            .unwrap()
            .gossip_key
    }

    fn test_announcement() -> PeerAnnouncement {
        PeerAnnouncement::new(
            "pubkey-a",
            "10.42.1.2",
            "203.0.113.5:51820",
            vec!["192.168.10.0/24".into()],
            vec![KnownPeer {
                wg_pubkey: "pubkey-b".into(),
                mesh_ip: "10.42.3.4".into(),
                wg_endpoint: "198.51.100.7:51820".into(),
            }],
        )
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = test_key();
        let sealed = seal_envelope(MessageType::Hello, &test_announcement(), &key).unwrap();

        let (envelope, announcement) = open_announcement(&sealed, &key).unwrap();
        assert_eq!(envelope.message_type, MessageType::Hello);
        assert_eq!(announcement.wg_pubkey, "pubkey-a");
        assert_eq!(announcement.known_peers.len(), 1);
        assert_eq!(announcement.routable_networks, vec!["192.168.10.0/24"]);
    }

    #[test]
    fn test_envelope_is_text_safe() {
        let key = test_key();
        let sealed = seal_envelope(MessageType::Announce, &test_announcement(), &key).unwrap();
        // The whole envelope must survive text-only transports (registry bodies)
        let as_text = std::str::from_utf8(&sealed).unwrap();
        assert!(as_text.contains("\"type\":\"ANNOUNCE\""));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = seal_envelope(MessageType::Hello, &test_announcement(), &test_key()).unwrap();
        let other = derive_keys("a-different-secret-entirely")
            .unwrap()
            .gossip_key;

        assert!(matches!(
            open_announcement(&sealed, &other),
            Err(CryptoError::MalformedPacket)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let key = test_key();
        let sealed = seal_envelope(MessageType::Hello, &test_announcement(), &key).unwrap();

        let mut envelope: Envelope = serde_json::from_slice(&sealed).unwrap();
        for i in 0..envelope.ciphertext.len() {
            let mut tampered = envelope.ciphertext.clone();
            tampered[i] ^= 0x01;
            std::mem::swap(&mut envelope.ciphertext, &mut tampered);
            let data = serde_json::to_vec(&envelope).unwrap();
            assert!(
                open_announcement(&data, &key).is_err(),
                "bit flip at byte {i} was accepted"
            );
            std::mem::swap(&mut envelope.ciphertext, &mut tampered);
        }
    }

    #[test]
    fn test_bad_nonce_length_rejected() {
        let key = test_key();
        let sealed = seal_envelope(MessageType::Hello, &test_announcement(), &key).unwrap();

        let mut envelope: Envelope = serde_json::from_slice(&sealed).unwrap();
        envelope.nonce.truncate(8);
        let data = serde_json::to_vec(&envelope).unwrap();

        assert!(matches!(
            open_announcement(&data, &key),
            Err(CryptoError::MalformedPacket)
        ));
    }

    #[test]
    fn test_stale_and_future_timestamps_rejected() {
        let key = test_key();

        let mut old = test_announcement();
        old.timestamp = unix_now() - 601;
        let sealed = seal_envelope(MessageType::Announce, &old, &key).unwrap();
        assert!(open_announcement(&sealed, &key).is_err());

        let mut future = test_announcement();
        future.timestamp = unix_now() + 601;
        let sealed = seal_envelope(MessageType::Announce, &future, &key).unwrap();
        assert!(open_announcement(&sealed, &key).is_err());

        // Just inside the window is fine
        let mut fresh = test_announcement();
        fresh.timestamp = unix_now() - 590;
        let sealed = seal_envelope(MessageType::Announce, &fresh, &key).unwrap();
        assert!(open_announcement(&sealed, &key).is_ok());
    }

    #[test]
    fn test_wrong_protocol_tag_rejected() {
        let key = test_key();
        let mut announcement = test_announcement();
        announcement.protocol = "wgmesh-v0".into();
        let sealed = seal_envelope(MessageType::Hello, &announcement, &key).unwrap();

        assert!(matches!(
            open_announcement(&sealed, &key),
            Err(CryptoError::MalformedPacket)
        ));
    }

    #[test]
    fn test_garbage_input_rejected() {
        let key = test_key();
        assert!(open_announcement(b"", &key).is_err());
        assert!(open_announcement(b"not json at all", &key).is_err());
        // Plausible KRPC traffic on a shared port
        assert!(open_announcement(b"d1:ad2:id20:....e1:q4:ping1:y1:qe", &key).is_err());
    }

    #[test]
    fn test_stem_payloads_use_raw_open() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Probe {
            hop_count: u8,
        }

        let key = test_key();
        let sealed = seal_envelope(MessageType::Stem, &Probe { hop_count: 2 }, &key).unwrap();

        let (envelope, plaintext) = open_envelope(&sealed, &key).unwrap();
        assert_eq!(envelope.message_type, MessageType::Stem);
        let probe: Probe = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(probe.hop_count, 2);

        // A stem plaintext is not a valid announcement
        assert!(parse_announcement(&plaintext).is_err());
    }
}
