//! Local node identity and persisted state
//!
//! The WireGuard keypair is generated on first run and persisted per
//! interface under `/var/lib/wgmesh/`, owner-only. Everything else about
//! the local node (mesh IP, endpoint, routes) is re-derived at startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use wgmesh_crypto::{generate_keypair, public_key_from_private};

use crate::error::CoreResult;

/// Default directory for per-interface state files
pub const STATE_DIR: &str = "/var/lib/wgmesh";

/// Our own node as advertised to the mesh
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub wg_pubkey: String,
    pub wg_privkey: String,
    pub mesh_ip: String,
    /// Advertised as `0.0.0.0:<port>`; receivers substitute the source
    /// address they observe
    pub wg_endpoint: String,
    pub routable_networks: Vec<String>,
}

/// On-disk shape of the persisted state
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    wg_pubkey: String,
    wg_private_key: String,
}

/// State file path for an interface.
pub fn state_path(interface: &str) -> PathBuf {
    Path::new(STATE_DIR).join(format!("{interface}.json"))
}

/// Load the persisted keypair, or generate and persist a fresh one.
///
/// A state file that is unreadable, unparsable or internally inconsistent
/// (public key does not match the private key) is replaced; losing a node
/// identity only means peers re-learn us under a new key.
pub async fn load_or_create_keys(path: &Path) -> CoreResult<(String, String)> {
    match load_keys(path).await {
        Ok(keys) => return Ok(keys),
        Err(e) => {
            if path.exists() {
                warn!("Unusable state file {}: {e}; generating a new identity", path.display());
            }
        }
    }

    let pair = generate_keypair();
    save_keys(path, &pair.public_key, &pair.private_key).await?;
    Ok((pair.public_key.clone(), pair.private_key.clone()))
}

async fn load_keys(path: &Path) -> CoreResult<(String, String)> {
    let data = tokio::fs::read(path).await?;
    let state: PersistedState = serde_json::from_slice(&data)
        .map_err(|e| crate::CoreError::CorruptState(e.to_string()))?;

    let expected = public_key_from_private(&state.wg_private_key)?;
    if expected != state.wg_pubkey {
        return Err(crate::CoreError::CorruptState(
            "public key does not match private key".into(),
        ));
    }

    Ok((state.wg_pubkey, state.wg_private_key))
}

async fn save_keys(path: &Path, pubkey: &str, privkey: &str) -> CoreResult<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
        #[cfg(unix)]
        set_mode(dir, 0o700).await?;
    }

    let state = PersistedState {
        wg_pubkey: pubkey.to_string(),
        wg_private_key: privkey.to_string(),
    };
    let data = serde_json::to_vec_pretty(&state)
        .map_err(|e| crate::CoreError::CorruptState(e.to_string()))?;

    tokio::fs::write(path, data).await?;
    #[cfg(unix)]
    set_mode(path, 0o600).await?;

    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("wgmesh-test-{}-{}", name, std::process::id()))
            .join("wg0.json")
    }

    #[tokio::test]
    async fn test_first_run_creates_and_persists() {
        let path = scratch_path("create");
        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;

        let (pubkey, privkey) = load_or_create_keys(&path).await.unwrap();
        assert!(path.exists());

        // Second run loads the same identity
        let (pubkey2, privkey2) = load_or_create_keys(&path).await.unwrap();
        assert_eq!(pubkey, pubkey2);
        assert_eq!(privkey, privkey2);

        tokio::fs::remove_dir_all(path.parent().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_state_is_replaced() {
        let path = scratch_path("corrupt");
        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, b"{ definitely not json")
            .await
            .unwrap();

        let (pubkey, _) = load_or_create_keys(&path).await.unwrap();
        assert!(!pubkey.is_empty());

        // The replacement file is loadable
        let (pubkey2, _) = load_or_create_keys(&path).await.unwrap();
        assert_eq!(pubkey, pubkey2);

        tokio::fs::remove_dir_all(path.parent().unwrap())
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_state_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let path = scratch_path("perms");
        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;

        load_or_create_keys(&path).await.unwrap();
        let mode = tokio::fs::metadata(&path)
            .await
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        tokio::fs::remove_dir_all(path.parent().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_keypair_is_replaced() {
        let path = scratch_path("mismatch");
        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();

        let a = wgmesh_crypto::generate_keypair();
        let b = wgmesh_crypto::generate_keypair();
        let bogus = serde_json::json!({
            "wg_pubkey": a.public_key,
            "wg_private_key": b.private_key,
        });
        tokio::fs::write(&path, bogus.to_string()).await.unwrap();

        let (pubkey, privkey) = load_or_create_keys(&path).await.unwrap();
        assert_ne!(pubkey, a.public_key);
        assert_eq!(
            wgmesh_crypto::public_key_from_private(&privkey).unwrap(),
            pubkey
        );

        tokio::fs::remove_dir_all(path.parent().unwrap())
            .await
            .unwrap();
    }
}
