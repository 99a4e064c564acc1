//! Daemon configuration and secret handling
//!
//! The secret travels as `wgmesh://v1/<base64url>` (unpadded). Query
//! parameters are advisory hints only and are stripped before the secret
//! string reaches key derivation, so they can never fork the mesh.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

use wgmesh_crypto::{derive_keys, DerivedKeys};

use crate::error::{CoreError, CoreResult};
use crate::{DEFAULT_INTERFACE, DEFAULT_WG_PORT};

const URI_PREFIX: &str = "wgmesh://";
const URI_VERSION: &str = "v1";

/// Minimum decoded entropy for a URI-form secret, bytes
const MIN_SECRET_ENTROPY: usize = 16;

/// Options collected from the command line
#[derive(Debug, Clone, Default)]
pub struct DaemonOpts {
    pub secret: String,
    pub interface: Option<String>,
    pub wg_listen_port: Option<u16>,
    pub advertise_routes: Vec<String>,
    pub log_level: Option<String>,
    pub privacy: bool,
}

/// Fully derived daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// The raw secret string (post URI stripping); also feeds mesh-IP
    /// derivation, so it stays alongside the derived keys
    pub secret: String,
    pub keys: DerivedKeys,
    pub interface: String,
    pub wg_listen_port: u16,
    pub advertise_routes: Vec<String>,
    pub log_level: String,
    pub privacy: bool,
}

impl DaemonConfig {
    /// Build a configuration from CLI options, deriving all keys.
    pub fn new(opts: DaemonOpts) -> CoreResult<Self> {
        let secret = parse_secret(&opts.secret)?;
        let keys = derive_keys(&secret)?;

        Ok(Self {
            secret,
            keys,
            interface: opts.interface.unwrap_or_else(|| DEFAULT_INTERFACE.to_string()),
            wg_listen_port: opts.wg_listen_port.unwrap_or(DEFAULT_WG_PORT),
            advertise_routes: opts.advertise_routes,
            log_level: opts.log_level.unwrap_or_else(|| "info".to_string()),
            privacy: opts.privacy,
        })
    }
}

/// Generate a fresh mesh secret: 32 random bytes as unpadded base64url.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Format a raw secret as its canonical URI.
pub fn format_secret_uri(secret: &str) -> String {
    format!("{URI_PREFIX}{URI_VERSION}/{secret}")
}

/// Extract the raw secret from URI or bare form.
///
/// URI-form secrets must decode as base64url with at least 16 bytes of
/// entropy; bare strings are passed through (length is enforced at
/// derivation).
pub fn parse_secret(input: &str) -> CoreResult<String> {
    let input = input.trim();

    let Some(rest) = input.strip_prefix(URI_PREFIX) else {
        return Ok(input.to_string());
    };

    let secret = match rest.split_once('/') {
        Some((version, secret)) => {
            if version != URI_VERSION {
                return Err(CoreError::InvalidSecret(format!(
                    "unsupported secret URI version: {version}"
                )));
            }
            secret
        }
        None => rest,
    };

    // Advisory query parameters never affect derivation
    let secret = secret.split('?').next().unwrap_or(secret);

    let decoded = URL_SAFE_NO_PAD
        .decode(secret)
        .map_err(|_| CoreError::InvalidSecret("secret is not valid base64url".into()))?;
    if decoded.len() < MIN_SECRET_ENTROPY {
        return Err(CoreError::InvalidSecret(format!(
            "secret carries {} bytes of entropy, need at least {MIN_SECRET_ENTROPY}",
            decoded.len()
        )));
    }

    Ok(secret.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_secret_roundtrips() {
        let secret = generate_secret();
        let uri = format_secret_uri(&secret);
        assert!(uri.starts_with("wgmesh://v1/"));
        assert_eq!(parse_secret(&uri).unwrap(), secret);
    }

    #[test]
    fn test_bare_secret_passes_through() {
        assert_eq!(
            parse_secret("  my-plain-mesh-secret ").unwrap(),
            "my-plain-mesh-secret"
        );
    }

    #[test]
    fn test_query_params_are_stripped() {
        let secret = generate_secret();
        let uri = format!("wgmesh://v1/{secret}?name=homelab&hint=lan");
        assert_eq!(parse_secret(&uri).unwrap(), secret);
    }

    #[test]
    fn test_bad_uris_rejected() {
        assert!(parse_secret("wgmesh://v2/AAAAAAAAAAAAAAAAAAAAAA").is_err());
        assert!(parse_secret("wgmesh://v1/!!!not-base64!!!").is_err());
        // 8 bytes of entropy is below the floor
        let short = URL_SAFE_NO_PAD.encode([0u8; 8]);
        assert!(parse_secret(&format!("wgmesh://v1/{short}")).is_err());
    }

    #[test]
    fn test_config_derives_keys() {
        let secret = generate_secret();
        let config = DaemonConfig::new(DaemonOpts {
            secret: format_secret_uri(&secret),
            advertise_routes: vec!["10.9.0.0/24".into()],
            ..Default::default()
        })
        .unwrap();

        assert_eq!(config.secret, secret);
        assert_eq!(config.interface, "wg0");
        assert_eq!(config.wg_listen_port, 51820);
        assert!((51821..=52820).contains(&config.keys.gossip_port));
        assert!(!config.privacy);
    }

    #[test]
    fn test_uri_and_bare_forms_agree() {
        let secret = generate_secret();
        let from_uri = DaemonConfig::new(DaemonOpts {
            secret: format_secret_uri(&secret),
            ..Default::default()
        })
        .unwrap();
        let from_bare = DaemonConfig::new(DaemonOpts {
            secret: secret.clone(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(from_uri.keys.network_id, from_bare.keys.network_id);
        assert_eq!(from_uri.keys.gossip_port, from_bare.keys.gossip_port);
    }
}
