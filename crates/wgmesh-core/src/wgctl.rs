//! WireGuard control surface
//!
//! A thin abstraction over the kernel WireGuard driver and the routing
//! tooling. The daemon speaks to the [`WgBackend`] trait; production uses
//! [`WgCli`], which shells out to `wg` and `ip` the same way an operator
//! would. Tests substitute a recording mock.

use std::process::Stdio;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::PERSISTENT_KEEPALIVE_SECS;

/// Operations the reconciler and daemon need from the host WireGuard stack
#[async_trait]
pub trait WgBackend: Send + Sync {
    async fn interface_exists(&self, name: &str) -> bool;

    async fn create_interface(&self, name: &str) -> CoreResult<()>;

    /// Apply the private key and listen port. If the requested port is
    /// already bound the next free one is used; the actually-bound port is
    /// returned so the caller can advertise it.
    async fn configure(&self, name: &str, private_key: &str, listen_port: u16) -> CoreResult<u16>;

    async fn set_address(&self, name: &str, cidr: &str) -> CoreResult<()>;

    async fn set_up(&self, name: &str) -> CoreResult<()>;

    async fn set_down(&self, name: &str) -> CoreResult<()>;

    /// Flush addresses and peers from an existing interface
    async fn reset(&self, name: &str) -> CoreResult<()>;

    /// Add or update a peer with the mesh PSK and the fixed keepalive
    async fn set_peer(
        &self,
        name: &str,
        pubkey: &str,
        psk: &[u8; 32],
        endpoint: &str,
        allowed_ips: &str,
    ) -> CoreResult<()>;

    async fn remove_peer(&self, name: &str, pubkey: &str) -> CoreResult<()>;

    async fn list_peers(&self, name: &str) -> CoreResult<Vec<String>>;
}

/// Production backend driving `wg`/`ip`
pub struct WgCli;

#[async_trait]
impl WgBackend for WgCli {
    async fn interface_exists(&self, name: &str) -> bool {
        tokio::fs::metadata(format!("/sys/class/net/{name}"))
            .await
            .is_ok()
    }

    async fn create_interface(&self, name: &str) -> CoreResult<()> {
        run("ip", &["link", "add", "dev", name, "type", "wireguard"]).await?;
        Ok(())
    }

    async fn configure(&self, name: &str, private_key: &str, listen_port: u16) -> CoreResult<u16> {
        let port = if is_port_free(listen_port) {
            listen_port
        } else {
            let port = find_free_port(listen_port + 1)
                .ok_or(CoreError::NoFreePort(listen_port))?;
            debug!("Port {listen_port} is in use, falling back to {port}");
            port
        };

        // `wg set` reads the private key from a file; keep it off argv and
        // out of /proc
        let key_file = std::env::temp_dir().join(format!("wgmesh-key-{name}"));
        tokio::fs::write(&key_file, private_key).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&key_file, std::fs::Permissions::from_mode(0o600)).await?;
        }

        let result = run(
            "wg",
            &[
                "set",
                name,
                "private-key",
                &key_file.to_string_lossy(),
                "listen-port",
                &port.to_string(),
            ],
        )
        .await;
        let _ = tokio::fs::remove_file(&key_file).await;
        result?;

        Ok(port)
    }

    async fn set_address(&self, name: &str, cidr: &str) -> CoreResult<()> {
        // Flush first so collision re-derivation replaces rather than stacks
        let _ = run("ip", &["addr", "flush", "dev", name]).await;
        run("ip", &["addr", "add", cidr, "dev", name]).await?;
        Ok(())
    }

    async fn set_up(&self, name: &str) -> CoreResult<()> {
        run("ip", &["link", "set", "dev", name, "up"]).await?;
        Ok(())
    }

    async fn set_down(&self, name: &str) -> CoreResult<()> {
        let _ = run("ip", &["link", "set", "dev", name, "down"]).await;
        Ok(())
    }

    async fn reset(&self, name: &str) -> CoreResult<()> {
        self.set_down(name).await?;
        let _ = run("ip", &["addr", "flush", "dev", name]).await;
        for peer in self.list_peers(name).await.unwrap_or_default() {
            let _ = self.remove_peer(name, &peer).await;
        }
        Ok(())
    }

    async fn set_peer(
        &self,
        name: &str,
        pubkey: &str,
        psk: &[u8; 32],
        endpoint: &str,
        allowed_ips: &str,
    ) -> CoreResult<()> {
        let args = set_peer_args(name, pubkey, endpoint, allowed_ips);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let mut child = Command::new("wg")
            .args(&arg_refs)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CoreError::WgDriver(format!("failed to spawn wg: {e}")))?;

        // PSK over stdin, never on the command line
        if let Some(mut stdin) = child.stdin.take() {
            let psk_b64 = STANDARD.encode(psk);
            stdin
                .write_all(format!("{psk_b64}\n").as_bytes())
                .await
                .map_err(|e| CoreError::WgDriver(format!("failed to write psk: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CoreError::WgDriver(e.to_string()))?;
        if !output.status.success() {
            return Err(CoreError::WgDriver(format!(
                "wg set peer failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn remove_peer(&self, name: &str, pubkey: &str) -> CoreResult<()> {
        run("wg", &["set", name, "peer", pubkey, "remove"]).await?;
        Ok(())
    }

    async fn list_peers(&self, name: &str) -> CoreResult<Vec<String>> {
        let output = run("wg", &["show", name, "peers"]).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

/// Argument vector for `wg set ... peer ...`; split out for testability.
fn set_peer_args(name: &str, pubkey: &str, endpoint: &str, allowed_ips: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "set".into(),
        name.into(),
        "peer".into(),
        pubkey.into(),
        "preshared-key".into(),
        "/dev/stdin".into(),
    ];
    if !endpoint.is_empty() {
        args.push("endpoint".into());
        args.push(endpoint.into());
    }
    if !allowed_ips.is_empty() {
        args.push("allowed-ips".into());
        args.push(allowed_ips.into());
    }
    args.push("persistent-keepalive".into());
    args.push(PERSISTENT_KEEPALIVE_SECS.to_string());
    args
}

async fn run(program: &str, args: &[&str]) -> CoreResult<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| CoreError::WgDriver(format!("failed to run {program}: {e}")))?;

    if !output.status.success() {
        return Err(CoreError::WgDriver(format!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check whether a UDP port can still be bound on this host.
pub fn is_port_free(port: u16) -> bool {
    std::net::UdpSocket::bind(("0.0.0.0", port)).is_ok()
}

/// First free UDP port at or after `start`, scanning a bounded range.
pub fn find_free_port(start: u16) -> Option<u16> {
    (start..start.saturating_add(100)).find(|&p| is_port_free(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_peer_args_complete() {
        let args = set_peer_args("wg0", "PUBKEY", "203.0.113.5:51820", "10.42.0.2/32");
        let joined = args.join(" ");
        assert!(joined.starts_with("set wg0 peer PUBKEY preshared-key /dev/stdin"));
        assert!(joined.contains("endpoint 203.0.113.5:51820"));
        assert!(joined.contains("allowed-ips 10.42.0.2/32"));
        assert!(joined.ends_with("persistent-keepalive 25"));
    }

    #[test]
    fn test_set_peer_args_omit_empty() {
        let args = set_peer_args("wg0", "PUBKEY", "", "");
        let joined = args.join(" ");
        assert!(!joined.contains("endpoint"));
        assert!(!joined.contains("allowed-ips"));
        assert!(joined.contains("persistent-keepalive 25"));
    }

    #[test]
    fn test_port_probing() {
        // Hold a port, then ask for the next free one
        let held = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = held.local_addr().unwrap().port();

        assert!(!is_port_free(port));
        let free = find_free_port(port).expect("some port in range should be free");
        assert_ne!(free, port);
        assert!(is_port_free(free));
    }
}
