use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use peer_registry::bootstrap::make_bootstrap_addr;
use peer_registry::substrate::memory::MemoryNetwork;
use peer_registry::{
    GetOptions, Keypair, ListOptions, MemoryRecordStore, NativeRegistry, Peer, RegisterOptions,
    RegistryOptions, RunMode, SwarmSubstrate, TurnConfig,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(name = "registry-node")]
#[clap(about = "Runs registry nodes, simulated in-process or on a live libp2p overlay")]
struct Args {
    /// Join the live overlay listening on these multiaddrs, e.g. /ip4/0.0.0.0/tcp/4001
    #[clap(long)]
    listen: Vec<String>,

    /// Seed entries (/ip4/<ip>/tcp/<port>/p2p/<id>) of the live overlay
    #[clap(long)]
    bootstrap: Vec<String>,

    /// Registered name of the live node
    #[clap(long, default_value = "registry-node")]
    name: String,

    /// Number of nodes registering next to the seed
    #[clap(long, default_value = "3")]
    nodes: usize,

    /// Identity key file of the first node, relative to the working directory
    #[clap(long)]
    key_file: Option<PathBuf>,

    /// Re-publish period in seconds
    #[clap(long, default_value = "5")]
    register_interval: u64,

    /// Announce and browse over mDNS on the real network
    #[clap(long)]
    mdns: bool,

    /// STUN/TURN servers (host:port) for NAT traversal
    #[clap(long)]
    turn_server: Vec<String>,

    /// TURN user name
    #[clap(long, default_value = "")]
    turn_user: String,

    /// TURN password
    #[clap(long, default_value = "")]
    turn_password: String,

    /// Exit after listing once instead of waiting for Ctrl+C
    #[clap(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if !args.listen.is_empty() || !args.bootstrap.is_empty() {
        return run_live(args).await;
    }
    run_simulation(args).await
}

fn turn_options(args: &Args, options: RegistryOptions) -> RegistryOptions {
    if args.turn_server.is_empty() {
        return options;
    }
    options.with_turn(TurnConfig {
        enabled: true,
        server_addresses: args.turn_server.clone(),
        username: args.turn_user.clone(),
        password: args.turn_password.clone(),
        ..TurnConfig::default()
    })
}

/// One node on the real network. Nodes started with `--listen` serve the
/// DHT and print the seed entry others pass to `--bootstrap`.
async fn run_live(args: Args) -> Result<()> {
    let serving = !args.listen.is_empty();
    let mut options = RegistryOptions::default()
        .with_discovery(args.mdns)
        .with_bootstrap(serving)
        .with_bootstrap_listen_addrs(args.listen.clone())
        .with_bootstrap_nodes(args.bootstrap.clone())
        .with_register_interval(Duration::from_secs(args.register_interval.max(1)))
        .with_run_mode(if serving { RunMode::Server } else { RunMode::Auto });
    if let Some(path) = &args.key_file {
        options = options.with_identity_key_file(path);
    }
    options = turn_options(&args, options);

    let mut builder = NativeRegistry::builder(options)
        .store(Arc::new(MemoryRecordStore::new()))
        .substrate(Arc::new(SwarmSubstrate::new()));
    if args.key_file.is_none() {
        builder = builder.keypair(Keypair::generate());
    }
    let node = builder.init().await?;
    for addr in node.host().addrs() {
        info!(seed = %addr.with_peer(node.local_id()), "reachable as");
    }

    node.register(
        Peer::new(format!("{}-svc", args.name), args.name.as_str(), "1.0"),
        RegisterOptions::default(),
    )
    .await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(args.register_interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                report(&node).await;
                if args.once {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    node.close().await?;
    Ok(())
}

async fn report(node: &NativeRegistry) {
    match node.list_peers(ListOptions::default()).await {
        Ok(peers) => {
            for peer in &peers {
                info!(id = %peer.id, name = %peer.name, meta = ?peer.metadata, "peer");
            }
            info!(count = peers.len(), "listed peers");
        }
        Err(e) => warn!(error = %e, "list failed"),
    }
    if let Ok(me) = node.get_peer(GetOptions::me()).await {
        info!(id = %me.id, meta = ?me.metadata, "local node");
    }
    if let Some(stats) = node.stats() {
        info!(?stats, "discovery stats");
    }
    if let Some(addrs) = node.traversal_addresses() {
        info!(relay = ?addrs.relay, reflexive = ?addrs.reflexive, server = ?addrs.server, "traversal");
    }
}

/// A seed and `--nodes` registries on an in-process network.
async fn run_simulation(args: Args) -> Result<()> {
    let net = MemoryNetwork::new();

    let seed = NativeRegistry::builder(
        RegistryOptions::default()
            .with_bootstrap(true)
            .with_bootstrap_listen_addrs(["/ip4/10.1.0.1/tcp/4001"]),
    )
    .store(Arc::new(MemoryRecordStore::new()))
    .substrate(Arc::new(net.clone()))
    .keypair(Keypair::generate())
    .install_default(false)
    .init()
    .await?;
    info!(peer = %seed.local_id(), "seed running");

    let options = turn_options(
        &args,
        RegistryOptions::default()
            .with_discovery(args.mdns)
            .with_bootstrap_nodes([make_bootstrap_addr("10.1.0.1", 4001, &seed.local_id())])
            .with_register_interval(Duration::from_secs(args.register_interval.max(1))),
    );

    let mut nodes = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let key_file = args.key_file.as_ref().filter(|_| i == 0);
        let node_options = match key_file {
            Some(path) => options.clone().with_identity_key_file(path),
            None => options.clone(),
        };
        let mut builder = NativeRegistry::builder(node_options)
            .store(Arc::new(MemoryRecordStore::new()))
            .substrate(Arc::new(net.clone()))
            .install_default(i == 0);
        if key_file.is_none() {
            builder = builder.keypair(Keypair::generate());
        }
        let node = builder.init().await?;
        let name = format!("node-{i}");
        node.register(Peer::new(format!("{name}-svc"), name.as_str(), "1.0"), RegisterOptions::default())
            .await?;
        info!(peer = %node.local_id(), name, "node registered");
        nodes.push(node);
    }

    let Some(first) = nodes.first().cloned() else {
        warn!("no nodes requested");
        seed.close().await?;
        return Ok(());
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(args.register_interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                report(&first).await;
                if args.once {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    for node in nodes {
        node.close().await?;
    }
    seed.close().await?;
    Ok(())
}
