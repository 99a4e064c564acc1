//! Dandelion++ privacy relay (opt-in)
//!
//! Without it, announcing to the DHT ties a node's mesh membership to its
//! IP address. With it, a self-announce first travels a unicast "stem"
//! through other members; whoever eventually "fluffs" publishes to the
//! DHT, so the origin's IP never appears as the announcing source.
//!
//! Relay selection must be deterministic so all members pick the same
//! stem targets within an epoch: peers are sorted, shuffled with a
//! ChaCha20 RNG seeded from HMAC(epoch_seed, epoch_id), and the first two
//! are eligible. The epoch is the 10-minute wall-clock window, giving
//! every member the same view without coordination.

use hmac::{Hmac, Mac};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use wgmesh_core::PeerInfo;
use wgmesh_crypto::envelope::unix_now;

type HmacSha256 = Hmac<Sha256>;

/// Probability of transitioning from stem to fluff at each hop
pub const FLUFF_PROBABILITY: f64 = 0.10;

/// Hop count at which fluff becomes mandatory
pub const MAX_STEM_HOPS: u8 = 4;

/// Epoch length in seconds
pub const EPOCH_SECS: i64 = 600;

/// Number of stem relays eligible per epoch
const RELAYS_PER_EPOCH: usize = 2;

/// Maximum accepted stem-payload age, seconds
const MAX_STEM_AGE_SECS: i64 = 600;

/// An announcement traveling the stem phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DandelionAnnounce {
    pub origin_pubkey: String,
    pub origin_mesh_ip: String,
    pub origin_endpoint: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routable_networks: Vec<String>,
    pub hop_count: u8,
    pub timestamp: i64,
    pub nonce: Vec<u8>,
}

impl DandelionAnnounce {
    /// Wrap the local node's announce for stem routing.
    pub fn for_origin(
        pubkey: impl Into<String>,
        mesh_ip: impl Into<String>,
        endpoint: impl Into<String>,
        routable_networks: Vec<String>,
    ) -> Self {
        let mut nonce = vec![0u8; 16];
        rand::thread_rng().fill(nonce.as_mut_slice());

        Self {
            origin_pubkey: pubkey.into(),
            origin_mesh_ip: mesh_ip.into(),
            origin_endpoint: endpoint.into(),
            routable_networks,
            hop_count: 0,
            timestamp: unix_now(),
            nonce,
        }
    }

    /// Stem payloads carry their own freshness window.
    pub fn is_fresh(&self) -> bool {
        (unix_now() - self.timestamp).abs() <= MAX_STEM_AGE_SECS
    }
}

/// What to do with a stem announcement at this hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDecision {
    /// Publish to the DHT from here; this node's IP becomes the apparent
    /// source
    Fluff,
    /// Forward to the next stem relay at this endpoint
    Stem(String),
}

/// Stem/fluff router. Stateless apart from the derived epoch seed; the
/// epoch is recomputed from the clock on every decision.
pub struct DandelionRouter {
    epoch_seed: [u8; 32],
}

impl DandelionRouter {
    pub fn new(epoch_seed: [u8; 32]) -> Self {
        Self { epoch_seed }
    }

    /// Current epoch identifier (shared by all members with sane clocks).
    pub fn current_epoch(&self) -> u64 {
        (unix_now() / EPOCH_SECS) as u64
    }

    /// The eligible stem relays for an epoch: sorted active peers,
    /// deterministically shuffled, first two.
    pub fn relays_for_epoch(&self, epoch_id: u64, active_peers: &[PeerInfo]) -> Vec<PeerInfo> {
        let mut candidates: Vec<PeerInfo> = active_peers
            .iter()
            .filter(|p| !p.endpoint.is_empty())
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.wg_pubkey.cmp(&b.wg_pubkey));

        let mut mac = HmacSha256::new_from_slice(&self.epoch_seed)
            .expect("HMAC accepts any key length");
        mac.update(&epoch_id.to_be_bytes());
        let seed: [u8; 32] = mac.finalize().into_bytes().into();

        let mut rng = ChaCha20Rng::from_seed(seed);
        candidates.shuffle(&mut rng);
        candidates.truncate(RELAYS_PER_EPOCH);
        candidates
    }

    /// Advance an announcement one hop and decide its fate. Mutates
    /// `hop_count`.
    pub fn route(
        &self,
        announce: &mut DandelionAnnounce,
        active_peers: &[PeerInfo],
    ) -> RelayDecision {
        announce.hop_count = announce.hop_count.saturating_add(1);

        if announce.hop_count >= MAX_STEM_HOPS
            || rand::thread_rng().gen::<f64>() < FLUFF_PROBABILITY
        {
            return RelayDecision::Fluff;
        }

        let relays = self.relays_for_epoch(self.current_epoch(), active_peers);
        if relays.len() < RELAYS_PER_EPOCH {
            // Too few members to hide among
            return RelayDecision::Fluff;
        }

        // Exclude the origin so a stem never bounces straight back
        let next = relays
            .iter()
            .find(|r| r.wg_pubkey != announce.origin_pubkey)
            .map(|r| r.endpoint.clone());

        match next {
            Some(endpoint) => RelayDecision::Stem(endpoint),
            None => RelayDecision::Fluff,
        }
    }
}
