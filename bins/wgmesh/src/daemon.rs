//! Daemon runtime
//!
//! Wires the pieces together: persisted identity, the WireGuard
//! interface, every discovery layer, the reconciler and the status
//! logger, all observing one shutdown signal. Discovery layers are
//! independent by design; a failing one logs and the rest keep the mesh
//! converging.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use wgmesh_core::{
    node, DaemonConfig, LocalNode, PeerStore, Reconciler, WgBackend, WgCli,
};
use wgmesh_crypto::derive_mesh_ip;
use wgmesh_discovery::{
    DandelionAnnounce, DandelionRouter, DhtDiscovery, LanDiscovery, PeerExchange, RelayDecision,
    RendezvousRegistry,
};

/// Status log period
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Privacy-mode self-announce period (matches the direct DHT cadence)
const PRIVACY_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Grace period for layers to drain after the shutdown signal
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(1);

/// Run the daemon until SIGINT/SIGTERM.
pub async fn run(mut config: DaemonConfig) -> Result<()> {
    info!("Starting wgmesh daemon on interface {}", config.interface);

    // Identity: persisted keypair, derived mesh IP
    let state_path = node::state_path(&config.interface);
    let (wg_pubkey, wg_privkey) = node::load_or_create_keys(&state_path)
        .await
        .context("failed to load or create node identity")?;
    let mesh_ip = derive_mesh_ip(config.keys.mesh_subnet, &wg_pubkey, &config.secret);

    info!("Local node {}", &wg_pubkey[..16.min(wg_pubkey.len())]);
    info!("Mesh IP {mesh_ip}");
    info!(
        "Network ID {} (peers must derive the same value)",
        hex::encode(&config.keys.network_id[..8])
    );

    // WireGuard interface up before discovery starts feeding it
    let backend: Arc<dyn WgBackend> = Arc::new(WgCli);
    let listen_port = setup_wireguard(&*backend, &config, &wg_privkey, &mesh_ip.to_string())
        .await
        .context("failed to set up WireGuard interface")?;
    config.wg_listen_port = listen_port;

    let local = Arc::new(RwLock::new(LocalNode {
        wg_pubkey: wg_pubkey.clone(),
        wg_privkey,
        mesh_ip: mesh_ip.to_string(),
        // Receivers rewrite the wildcard host to whatever source address
        // they observe
        wg_endpoint: format!("0.0.0.0:{listen_port}"),
        routable_networks: config.advertise_routes.clone(),
    }));
    let store = PeerStore::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Discovery layers
    let exchange = PeerExchange::bind(
        config.keys.gossip_port,
        config.keys.gossip_key,
        config.keys.membership_key,
        local.clone(),
        store.clone(),
    )
    .await
    .context("failed to bind gossip port (is another daemon running?)")?;
    exchange.start(shutdown_rx.clone());

    let dht = DhtDiscovery::new(
        config.secret.clone(),
        config.keys.gossip_port,
        exchange.clone(),
        store.clone(),
        !config.privacy,
    )
    .await
    .context("failed to bind DHT socket")?;
    tokio::spawn(dht.clone().run(shutdown_rx.clone()));

    match LanDiscovery::new(
        config.keys.multicast_id,
        config.keys.gossip_key,
        config.keys.membership_key,
        local.clone(),
        store.clone(),
    )
    .await
    {
        Ok(lan) => lan.start(shutdown_rx.clone()),
        // Multicast may be unavailable (odd container setups); the mesh
        // still converges through the other layers
        Err(e) => warn!("LAN discovery disabled: {e}"),
    }

    RendezvousRegistry::new(
        config.keys.rendezvous_id,
        config.keys.gossip_key,
        local.clone(),
        store.clone(),
    )
    .start(shutdown_rx.clone());

    if config.privacy {
        info!("Privacy mode: self-announces travel the Dandelion++ stem");
        start_dandelion(
            config.keys.epoch_seed,
            exchange.clone(),
            dht.clone(),
            store.clone(),
            local.clone(),
            shutdown_rx.clone(),
        );
    }

    // Reconciler and status
    let reconciler = Reconciler::new(
        backend,
        store.clone(),
        local.clone(),
        config.interface.clone(),
        config.keys.psk,
        config.secret.clone(),
        config.keys.mesh_subnet,
    );
    tokio::spawn(reconciler.run(shutdown_rx.clone()));

    let status_store = store.clone();
    let mut status_shutdown = shutdown_rx;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = status_shutdown.changed() => return,
                _ = ticker.tick() => {
                    let active = status_store.get_active().await;
                    info!("Active peers: {}", active.len());
                    for p in active {
                        info!(
                            "  {} ({}) via {:?}",
                            &p.wg_pubkey[..p.wg_pubkey.len().min(8)],
                            p.mesh_ip,
                            p.discovered_via
                        );
                    }
                }
            }
        }
    });

    info!("Daemon running; send SIGINT or SIGTERM to stop");
    wait_for_signal().await?;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(SHUTDOWN_DRAIN).await;
    Ok(())
}

/// Create/reset the interface, apply key and port (with free-port
/// fallback), address it and bring it up. Returns the bound listen port.
async fn setup_wireguard(
    backend: &dyn WgBackend,
    config: &DaemonConfig,
    wg_privkey: &str,
    mesh_ip: &str,
) -> Result<u16> {
    let iface = &config.interface;

    if backend.interface_exists(iface).await {
        info!("Interface {iface} exists, resetting");
        backend.reset(iface).await?;
    } else {
        backend.create_interface(iface).await?;
    }

    let port = backend
        .configure(iface, wg_privkey, config.wg_listen_port)
        .await?;
    if port != config.wg_listen_port {
        info!(
            "WireGuard port {} was taken, listening on {port}",
            config.wg_listen_port
        );
    }

    backend.set_address(iface, &format!("{mesh_ip}/16")).await?;
    backend.set_up(iface).await?;

    info!("WireGuard interface {iface} up on port {port}");
    Ok(port)
}

/// Privacy mode: periodic self-announces enter the stem, and stem hops
/// arriving from other members are routed onward or fluffed.
fn start_dandelion(
    epoch_seed: [u8; 32],
    exchange: Arc<PeerExchange>,
    dht: Arc<DhtDiscovery>,
    store: Arc<PeerStore>,
    local: Arc<RwLock<LocalNode>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let router = Arc::new(DandelionRouter::new(epoch_seed));
    let (stem_tx, mut stem_rx) = mpsc::channel::<DandelionAnnounce>(64);
    exchange.set_stem_sink(stem_tx);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRIVACY_ANNOUNCE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,

                // Our own announce enters the stem
                _ = ticker.tick() => {
                    let mut announce = {
                        let local = local.read().await;
                        DandelionAnnounce::for_origin(
                            local.wg_pubkey.clone(),
                            local.mesh_ip.clone(),
                            local.wg_endpoint.clone(),
                            local.routable_networks.clone(),
                        )
                    };
                    let active = store.get_active().await;
                    route_hop(&router, &mut announce, &active, &exchange, &dht, &store, true)
                        .await;
                }

                // A hop relayed to us by another member
                Some(mut announce) = stem_rx.recv() => {
                    let active = store.get_active().await;
                    route_hop(&router, &mut announce, &active, &exchange, &dht, &store, false)
                        .await;
                }
            }
        }
    });
}

async fn route_hop(
    router: &DandelionRouter,
    announce: &mut DandelionAnnounce,
    active: &[wgmesh_core::PeerInfo],
    exchange: &PeerExchange,
    dht: &DhtDiscovery,
    store: &PeerStore,
    own: bool,
) {
    match router.route(announce, active) {
        RelayDecision::Stem(endpoint) => {
            debug!(
                "Stemming announce (hop {}) to {endpoint}",
                announce.hop_count
            );
            if let Err(e) = exchange.send_stem(announce, &endpoint).await {
                // Never let relay trouble suppress the announce entirely
                warn!("Stem forward failed ({e}); fluffing instead");
                fluff(announce, dht, store, own).await;
            }
        }
        RelayDecision::Fluff => fluff(announce, dht, store, own).await,
    }
}

/// Fluff: merge the origin (when it is someone else) and publish to the
/// DHT from this node, making our IP the apparent announce source.
async fn fluff(announce: &DandelionAnnounce, dht: &DhtDiscovery, store: &PeerStore, own: bool) {
    debug!(
        "Fluffing announce from {} after {} hops",
        &announce.origin_pubkey[..announce.origin_pubkey.len().min(8)],
        announce.hop_count
    );

    if !own {
        let peer = wgmesh_core::PeerInfo::new(
            announce.origin_pubkey.clone(),
            announce.origin_mesh_ip.clone(),
            announce.origin_endpoint.clone(),
            announce.routable_networks.clone(),
        );
        store.update(peer, wgmesh_discovery::method::DANDELION).await;
    }

    dht.announce_now().await;
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to wait for ctrl-c")?;
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for ctrl-c")?;
        Ok(())
    }
}
