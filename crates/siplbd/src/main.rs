//! siplbd — SIP-aware UDP load balancer daemon.
//!
//! Wires the call engine together from command-line arguments: seeds the
//! node registry (statically or via the discovery sweep), starts the
//! dispatcher/replication/heartbeat loops, optionally opens the management
//! console, and asks running peers for their call tables.

mod console;
mod discovery;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::reload;

use siplb_call_engine::{Balancer, EngineConfig, HeartbeatConfig, Registrar, SyncConfig};

#[derive(Parser, Debug)]
#[command(name = "siplbd", version, about = "SIP-aware UDP load balancer")]
struct Args {
    /// Static node list; providing one disables passive heartbeat mode
    nodes: Vec<IpAddr>,

    /// Address the signaling socket binds to
    #[arg(long, default_value = "0.0.0.0")]
    bind_addr: IpAddr,

    /// UDP port for SIP signaling
    #[arg(long, default_value_t = 5060)]
    bind_port: u16,

    /// Signaling port calls are forwarded to on the nodes
    #[arg(long, default_value_t = 5060)]
    node_port: u16,

    /// Enable the passive heartbeat listener on this UDP port
    #[arg(long)]
    heartbeat_port: Option<u16>,

    /// Address the heartbeat listener binds to
    #[arg(long, default_value = "0.0.0.0")]
    heartbeat_interface: IpAddr,

    /// Enable the management console on this address
    #[arg(long)]
    console_interface: Option<IpAddr>,

    /// TCP port for the management console
    #[arg(long, default_value_t = 4444)]
    console_port: u16,

    /// Sweep this local IPv4 interface's subnet for SIP servers at startup
    #[arg(long)]
    discovery_interface: Option<Ipv4Addr>,

    /// How long the discovery sweep waits for replies, in seconds
    #[arg(long, default_value_t = 4)]
    discovery_timeout: u64,

    /// Active OPTIONS probing of listed nodes
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    probing: bool,

    /// Digest realm for REGISTER challenges; defaults to the host name
    #[arg(long)]
    realm: Option<String>,

    /// Credential file with `user[,password]` lines
    #[arg(long, default_value = "user.db")]
    users_file: PathBuf,

    /// Multicast group for peer replication
    #[arg(long, default_value = "226.13.25.1")]
    sync_group: Ipv4Addr,

    /// UDP port for peer replication
    #[arg(long, default_value_t = 5555)]
    sync_port: u16,

    /// Probe interval in milliseconds
    #[arg(long, default_value_t = 3000)]
    hello_interval: u64,

    /// A node silent for this many milliseconds is considered dead
    #[arg(long, default_value_t = 10_000)]
    dead_interval: u64,

    /// Log filter, e.g. `info` or `siplb_call_engine=debug`
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, filter_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "siplbd starting");

    let mut seed = args.nodes.clone();
    if let Some(interface) = args.discovery_interface {
        if seed.is_empty() {
            seed = discovery::sweep(
                interface,
                args.bind_port,
                args.node_port,
                Duration::from_secs(args.discovery_timeout),
            )
            .await
            .context("discovery sweep failed")?;
            if seed.is_empty() {
                anyhow::bail!("discovery found no SIP servers; start some and retry");
            }
            info!(nodes = ?seed, "discovery complete");
        } else {
            warn!("static node list given, discovery skipped");
        }
    }

    let registrar = Registrar::new();
    registrar
        .load_file(&args.users_file)
        .context("loading credential file")?;

    let config = EngineConfig {
        bind_addr: args.bind_addr,
        bind_port: args.bind_port,
        node_port: args.node_port,
        realm: args.realm.unwrap_or_else(siplb_call_engine::config::default_realm),
        hello_interval: Duration::from_millis(args.hello_interval),
        dead_interval: Duration::from_millis(args.dead_interval),
        active_probing: args.probing,
        heartbeat: args.heartbeat_port.map(|port| HeartbeatConfig {
            bind_addr: args.heartbeat_interface,
            port,
        }),
        sync: SyncConfig {
            group: args.sync_group,
            port: args.sync_port,
        },
        users_file: Some(args.users_file.clone()),
    };

    let balancer = Balancer::new(config, registrar, &seed).await?;
    let handles = balancer.start().await?;
    info!(addr = %balancer.local_addr()?, "listening");

    if let Some(console_addr) = args.console_interface {
        console::spawn(
            balancer.clone(),
            SocketAddr::new(console_addr, args.console_port),
            filter_handle,
        )
        .await
        .context("starting management console")?;
    } else {
        info!("management console disabled");
    }

    // Pick up in-flight calls from peers that are already running.
    balancer.request_full_sync().await?;
    info!("synchronization request broadcast to peers");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
