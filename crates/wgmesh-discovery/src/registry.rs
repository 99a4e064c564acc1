//! Rendezvous Registry Discovery
//!
//! Bootstrap of last resort for meshes whose members cannot reach each
//! other through the DHT or a shared LAN: a public issue tracker acts as
//! a tiny mailbox. The issue title is `wgmesh-<rendezvous_id>` (derived,
//! so members can find it; meaningless to anyone else) and the body holds
//! a sealed ANNOUNCE between sentinel markers — the tracker's operator
//! sees ciphertext.
//!
//! Search needs no credentials. Creating or updating the entry needs a
//! `GITHUB_TOKEN`; without one the layer degrades to read-only. Every
//! failure here is logged and retried with backoff, never fatal: the
//! mesh must converge without this layer.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use wgmesh_core::{LocalNode, PeerInfo, PeerStore};
use wgmesh_crypto::envelope::{
    open_announcement, seal_envelope, MessageType, PeerAnnouncement,
};

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::method;

const REGISTRY_API: &str = "https://api.github.com";
const REGISTRY_REPO: &str = "wgmesh-registry/public";

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(5);

/// How often the registry view is refreshed once bootstrapped
const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

const PEERS_START: &str = "<!-- PEERS:";
const PEERS_END: &str = ":PEERS -->";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    items: Vec<IssueItem>,
}

#[derive(Debug, Deserialize)]
struct IssueItem {
    number: u64,
    body: Option<String>,
}

pub struct RendezvousRegistry {
    search_term: String,
    gossip_key: [u8; 32],
    local: Arc<RwLock<LocalNode>>,
    store: Arc<PeerStore>,
    client: reqwest::Client,
    api_base: String,
    repo: String,
    /// Access token for create/update; `None` means read-only
    token: Option<String>,
    issue_number: Mutex<Option<u64>>,
}

impl RendezvousRegistry {
    pub fn new(
        rendezvous_id: [u8; 8],
        gossip_key: [u8; 32],
        local: Arc<RwLock<LocalNode>>,
        store: Arc<PeerStore>,
    ) -> Arc<Self> {
        let token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
        if token.is_none() {
            info!("No GITHUB_TOKEN; registry discovery is read-only");
        }

        Arc::new(Self {
            search_term: format!("wgmesh-{}", hex::encode(rendezvous_id)),
            gossip_key,
            local,
            store,
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .user_agent("wgmesh")
                .build()
                .unwrap_or_default(),
            api_base: REGISTRY_API.to_string(),
            repo: REGISTRY_REPO.to_string(),
            token,
            issue_number: Mutex::new(None),
        })
    }

    /// Initial search/publish with backoff, then a slow refresh loop.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut delay = RETRY_BASE_DELAY;
            let mut attempt = 0;
            loop {
                match registry.sync_once().await {
                    Ok(found) => {
                        debug!("Registry sync complete, {found} peers merged");
                        break;
                    }
                    Err(e) if attempt < MAX_RETRIES => {
                        attempt += 1;
                        warn!("Registry sync failed (attempt {attempt}/{MAX_RETRIES}): {e}");
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay *= 2;
                    }
                    Err(e) => {
                        warn!("Registry unreachable, giving up on bootstrap: {e}");
                        break;
                    }
                }
            }

            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = registry.sync_once().await {
                            debug!("Registry refresh failed: {e}");
                        }
                    }
                }
            }
        });
    }

    /// One full pass: search, merge whatever decrypts, then create or
    /// update our entry when we hold a token.
    async fn sync_once(&self) -> DiscoveryResult<usize> {
        let peers = self.search().await?;
        let found = peers.len();
        for peer in peers {
            self.store.update(peer, method::REGISTRY).await;
        }

        if self.token.is_some() {
            let has_issue = self.issue_number.lock().await.is_some();
            let result = if has_issue {
                self.update_entry().await
            } else {
                self.create_entry().await
            };
            if let Err(e) = result {
                // Publishing is best-effort on top of best-effort
                warn!("Failed to publish registry entry: {e}");
            }
        }

        Ok(found)
    }

    /// Unauthenticated title search for our rendezvous term.
    async fn search(&self) -> DiscoveryResult<Vec<PeerInfo>> {
        let url = format!(
            "{}/search/issues?q={}+repo:{}+in:title",
            self.api_base, self.search_term, self.repo
        );

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github.v3+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DiscoveryError::Registry(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DiscoveryError::Registry(format!(
                "search returned {}",
                response.status()
            )));
        }

        let result: SearchResponse = response
            .json()
            .await
            .map_err(|e| DiscoveryError::Registry(e.to_string()))?;

        let Some(item) = result.items.into_iter().next() else {
            debug!("No registry entry for {}", self.search_term);
            return Ok(Vec::new());
        };
        *self.issue_number.lock().await = Some(item.number);
        info!("Found registry entry #{}", item.number);

        Ok(self.decrypt_body(item.body.as_deref().unwrap_or_default()))
    }

    /// Pull the sealed blob out of an issue body and decrypt it. Anything
    /// that fails to parse or decrypt yields no peers; a stranger (or a
    /// different mesh) may have squatted the title.
    fn decrypt_body(&self, body: &str) -> Vec<PeerInfo> {
        let Some(blob) = extract_peer_blob(body) else {
            return Vec::new();
        };
        let Ok((_, announcement)) = open_announcement(blob.as_bytes(), &self.gossip_key) else {
            debug!("Registry entry did not decrypt; ignoring");
            return Vec::new();
        };

        let mut peers = Vec::new();
        if !announcement.wg_pubkey.is_empty() {
            peers.push(PeerInfo::new(
                announcement.wg_pubkey.clone(),
                announcement.mesh_ip.clone(),
                announcement.wg_endpoint.clone(),
                announcement.routable_networks.clone(),
            ));
        }
        for kp in &announcement.known_peers {
            peers.push(PeerInfo::new(
                kp.wg_pubkey.clone(),
                kp.mesh_ip.clone(),
                kp.wg_endpoint.clone(),
                Vec::new(),
            ));
        }

        debug!("Registry entry yielded {} peers", peers.len());
        peers
    }

    async fn create_entry(&self) -> DiscoveryResult<()> {
        let token = self.require_token()?;
        let body = self.build_body().await?;
        let url = format!("{}/repos/{}/issues", self.api_base, self.repo);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github.v3+json")
            .json(&serde_json::json!({ "title": self.search_term, "body": body }))
            .send()
            .await
            .map_err(|e| DiscoveryError::Registry(e.to_string()))?;

        if response.status() != reqwest::StatusCode::CREATED {
            return Err(DiscoveryError::Registry(format!(
                "create returned {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct Created {
            number: u64,
        }
        let created: Created = response
            .json()
            .await
            .map_err(|e| DiscoveryError::Registry(e.to_string()))?;
        *self.issue_number.lock().await = Some(created.number);
        info!("Created registry entry #{}", created.number);
        Ok(())
    }

    async fn update_entry(&self) -> DiscoveryResult<()> {
        let token = self.require_token()?;
        let number = self
            .issue_number
            .lock()
            .await
            .ok_or_else(|| DiscoveryError::Registry("no issue number".into()))?;

        let body = self.build_body().await?;
        let url = format!("{}/repos/{}/issues/{number}", self.api_base, self.repo);

        let response = self
            .client
            .patch(&url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github.v3+json")
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .map_err(|e| DiscoveryError::Registry(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Registry(format!(
                "update returned {}",
                response.status()
            )));
        }
        debug!("Updated registry entry #{number}");
        Ok(())
    }

    /// Body with our announcement (plus known peers) sealed inside the
    /// sentinel markers.
    async fn build_body(&self) -> DiscoveryResult<String> {
        let announcement = {
            let local = self.local.read().await;
            let known = self
                .store
                .get_active()
                .await
                .into_iter()
                .filter(|p| !p.endpoint.is_empty())
                .map(|p| wgmesh_crypto::envelope::KnownPeer {
                    wg_pubkey: p.wg_pubkey,
                    mesh_ip: p.mesh_ip,
                    wg_endpoint: p.endpoint,
                })
                .collect();
            PeerAnnouncement::new(
                local.wg_pubkey.clone(),
                local.mesh_ip.clone(),
                local.wg_endpoint.clone(),
                local.routable_networks.clone(),
                known,
            )
        };

        let sealed = seal_envelope(MessageType::Announce, &announcement, &self.gossip_key)?;
        let blob = String::from_utf8(sealed)
            .map_err(|e| DiscoveryError::Registry(format!("envelope not utf-8: {e}")))?;

        Ok(format!(
            "wgmesh registry rendezvous point\n\n{PEERS_START}\n{blob}\n{PEERS_END}"
        ))
    }

    fn require_token(&self) -> DiscoveryResult<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| DiscoveryError::Registry("no access token".into()))
    }
}

/// Extract the sealed blob between the sentinel markers.
fn extract_peer_blob(body: &str) -> Option<&str> {
    let start = body.find(PEERS_START)? + PEERS_START.len();
    let end = body[start..].find(PEERS_END)? + start;
    let blob = body[start..end].trim();
    (!blob.is_empty()).then_some(blob)
}
