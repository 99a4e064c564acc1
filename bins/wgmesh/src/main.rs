//! wgmesh
//!
//! Decentralized WireGuard mesh: every node holding the same secret
//! derives the same network identity, finds its peers over LAN multicast,
//! the public DHT, gossip and an optional registry, and keeps a kernel
//! WireGuard interface converged on the discovered mesh.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::RwLock;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use wgmesh_core::{
    format_secret_uri, generate_secret, DaemonConfig, DaemonOpts, LocalNode, PeerStore,
};
use wgmesh_crypto::{derive_mesh_ip, generate_keypair, network_ids_for};
use wgmesh_discovery::PeerExchange;

mod daemon;

/// wgmesh - decentralized WireGuard mesh
#[derive(Parser)]
#[command(name = "wgmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new mesh secret
    Init {
        /// Emit a fresh secret URI
        #[arg(long)]
        secret: bool,
    },

    /// Join a mesh and run the daemon until signalled
    Join {
        /// Mesh secret (wgmesh://v1/... or raw)
        #[arg(long)]
        secret: String,

        /// Comma-separated CIDRs to advertise into the mesh
        #[arg(long, value_delimiter = ',')]
        advertise_routes: Vec<String>,

        /// WireGuard listen port
        #[arg(long)]
        listen_port: Option<u16>,

        /// WireGuard interface name
        #[arg(long)]
        interface: Option<String>,

        /// Log level (trace, debug, info, warn, error)
        #[arg(long, default_value = "info")]
        log_level: String,

        /// Route self-announces through the Dandelion++ relay
        #[arg(long)]
        privacy: bool,
    },

    /// Print the identifiers derived from a secret
    Status {
        #[arg(long)]
        secret: String,
    },

    /// Test direct peer exchange with a running node
    TestPeer {
        #[arg(long)]
        secret: String,

        /// Peer exchange address, host:port
        #[arg(long)]
        peer: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { .. } => cmd_init(),
        Commands::Join {
            secret,
            advertise_routes,
            listen_port,
            interface,
            log_level,
            privacy,
        } => {
            init_logging(&log_level)?;
            let config = DaemonConfig::new(DaemonOpts {
                secret,
                interface,
                wg_listen_port: listen_port,
                advertise_routes,
                log_level: Some(log_level),
                privacy,
            })
            .context("invalid configuration")?;
            daemon::run(config).await
        }
        Commands::Status { secret } => cmd_status(secret),
        Commands::TestPeer { secret, peer } => {
            init_logging("info")?;
            cmd_test_peer(secret, peer).await
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;
    Ok(())
}

fn cmd_init() -> Result<()> {
    let secret = generate_secret();
    let uri = format_secret_uri(&secret);

    println!("{uri}");
    eprintln!();
    eprintln!("Share this secret with every node that should join the mesh:");
    eprintln!("  wgmesh join --secret \"{uri}\"");
    Ok(())
}

fn cmd_status(secret: String) -> Result<()> {
    let config = DaemonConfig::new(DaemonOpts {
        secret,
        ..Default::default()
    })
    .context("invalid secret")?;
    let keys = &config.keys;

    let (current, previous) = network_ids_for(&config.secret, wgmesh_crypto::envelope::unix_now());

    println!("Derived mesh identifiers");
    println!("========================");
    println!("Network ID:        {}", hex::encode(keys.network_id));
    println!("Current hour ID:   {}", hex::encode(current));
    println!("Previous hour ID:  {}", hex::encode(previous));
    println!("Mesh subnet:       10.{}.0.0/16", keys.mesh_subnet);
    println!(
        "Multicast group:   239.192.{}.{}:{}",
        keys.multicast_id[0],
        keys.multicast_id[1],
        wgmesh_discovery::lan::LAN_PORT
    );
    println!("Gossip port:       {}", keys.gossip_port);
    println!("Rendezvous term:   wgmesh-{}", hex::encode(keys.rendezvous_id));
    println!();
    println!("Nodes derive identical values from the same secret; compare these");
    println!("lines across hosts when peers cannot find each other.");
    Ok(())
}

async fn cmd_test_peer(secret: String, peer: String) -> Result<()> {
    let config = DaemonConfig::new(DaemonOpts {
        secret,
        ..Default::default()
    })
    .context("invalid secret")?;

    let peer_addr: SocketAddr = tokio::net::lookup_host(peer.as_str())
        .await
        .context("failed to resolve peer address")?
        .next()
        .context("peer address resolved to nothing")?;

    // A throwaway identity; the remote only needs us to hold the secret
    let pair = generate_keypair();
    let mesh_ip = derive_mesh_ip(config.keys.mesh_subnet, &pair.public_key, &config.secret);
    let local = Arc::new(RwLock::new(LocalNode {
        wg_pubkey: pair.public_key.clone(),
        wg_privkey: pair.private_key.clone(),
        mesh_ip: mesh_ip.to_string(),
        wg_endpoint: "0.0.0.0:51820".to_string(),
        routable_networks: Vec::new(),
    }));

    let store = PeerStore::new();
    let exchange = PeerExchange::bind(
        0,
        config.keys.gossip_key,
        config.keys.membership_key,
        local,
        store,
    )
    .await
    .context("failed to bind test socket")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    exchange.start(shutdown_rx);

    println!("Network ID: {}", hex::encode(&config.keys.network_id[..8]));
    println!("Sending HELLO to {peer_addr} from port {}...", exchange.port());

    match exchange.exchange_with(peer_addr).await {
        Ok(info) => {
            println!("Peer answered:");
            println!("  Public key: {}", info.wg_pubkey);
            println!("  Mesh IP:    {}", info.mesh_ip);
            println!("  Endpoint:   {}", info.endpoint);
            let _ = shutdown_tx.send(true);
            Ok(())
        }
        Err(e) => {
            let _ = shutdown_tx.send(true);
            eprintln!("No valid reply within {:?}: {e}", Duration::from_secs(10));
            eprintln!();
            eprintln!("Possible causes:");
            eprintln!("  - peer not running, or a different exchange port");
            eprintln!("  - UDP blocked between the hosts");
            eprintln!("  - different secrets (envelopes will not decrypt)");
            anyhow::bail!("peer exchange failed");
        }
    }
}
