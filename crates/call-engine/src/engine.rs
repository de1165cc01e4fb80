//! Engine facade: owns the shared state, spawns the loops, and exposes the
//! accessor surface the management console works through.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{error, info};

use siplb_cluster_sync::{CallRecord, SyncChannel};

use crate::applier;
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::health::{ActiveProber, HeartbeatListener};
use crate::nodes::{NodeRegistry, NodeStatus};
use crate::registrar::{Registrar, UserStatus};
use crate::stats::{Stats, StatsSnapshot};
use crate::table::CallTable;

/// One running balancer: signaling socket, call table, node registry,
/// registrar, statistics and the replication channel, wired together.
pub struct Balancer {
    config: EngineConfig,
    socket: Arc<UdpSocket>,
    table: Arc<CallTable>,
    registry: Arc<NodeRegistry>,
    registrar: Arc<Registrar>,
    stats: Arc<Stats>,
    sync: Arc<SyncChannel>,
    prober: Option<Arc<ActiveProber>>,
}

impl Balancer {
    /// Bind the sockets and assemble the shared state.
    ///
    /// `seed_nodes` is the static node list (given on the command line or
    /// found by discovery). A non-empty list selects static round-robin
    /// mode with optional active probing; an empty list plus a configured
    /// heartbeat port selects passive mode. The strategies never run
    /// together against the same registry.
    pub async fn new(
        config: EngineConfig,
        registrar: Registrar,
        seed_nodes: &[IpAddr],
    ) -> Result<Arc<Self>> {
        if seed_nodes.is_empty() && config.heartbeat.is_none() {
            return Err(Error::config(
                "no nodes listed and no heartbeat port; nowhere to send calls",
            ));
        }

        let socket = Arc::new(UdpSocket::bind(config.signaling_addr()).await?);
        info!(addr = %socket.local_addr()?, "signaling socket bound");

        // A static node list means round-robin selection; otherwise the
        // cursor follows whichever node reported a heartbeat last.
        let registry = if seed_nodes.is_empty() {
            Arc::new(NodeRegistry::passive(
                config.hello_interval,
                config.dead_interval,
            ))
        } else {
            Arc::new(NodeRegistry::new(
                config.hello_interval,
                config.dead_interval,
            ))
        };
        for &address in seed_nodes {
            registry.add_node(address);
        }

        let sync = Arc::new(SyncChannel::new(&config.sync).await?);

        // Active probing only makes sense against a static list.
        let prober = if seed_nodes.is_empty() {
            None
        } else {
            Some(Arc::new(ActiveProber::new(
                socket.clone(),
                registry.clone(),
                config.node_port,
                config.active_probing,
            )))
        };

        Ok(Arc::new(Self {
            config,
            socket,
            table: Arc::new(CallTable::new()),
            registry,
            registrar: Arc::new(registrar),
            stats: Arc::new(Stats::new()),
            sync,
            prober,
        }))
    }

    /// Spawn the dispatcher, applier and (in passive mode) heartbeat loops.
    ///
    /// Each loop runs until its socket fails; that failure is logged and
    /// ends the task, per the transport-fatal rule.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        let dispatcher = Dispatcher::new(
            self.socket.clone(),
            self.table.clone(),
            self.registry.clone(),
            self.registrar.clone(),
            self.sync.clone(),
            self.prober.clone(),
            self.stats.clone(),
            self.config.realm.clone(),
            self.config.node_port,
        );
        handles.push(tokio::spawn(async move {
            if let Err(err) = dispatcher.run().await {
                error!(error = %err, "dispatcher loop ended");
            }
        }));

        let channel = self.sync.clone();
        let table = self.table.clone();
        let stats = self.stats.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = applier::run(channel, table, stats).await {
                error!(error = %err, "replication applier ended");
            }
        }));

        if self.prober.is_none() {
            if let Some(heartbeat) = &self.config.heartbeat {
                let listener =
                    HeartbeatListener::bind(heartbeat, self.registry.clone(), self.stats.clone())
                        .await?;
                handles.push(tokio::spawn(async move {
                    if let Err(err) = listener.run().await {
                        error!(error = %err, "heartbeat listener ended");
                    }
                }));
            }
        }

        Ok(handles)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    // Management accessor surface. The console (and anything else outside
    // the engine) reads and mutates runtime state only through these.

    pub fn nodes(&self) -> Vec<NodeStatus> {
        self.registry.snapshot()
    }

    pub fn calls(&self) -> Vec<(String, CallRecord)> {
        self.table.snapshot()
    }

    pub fn users(&self) -> Vec<UserStatus> {
        self.registrar.snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn add_node(&self, address: IpAddr) -> u32 {
        self.registry.add_node(address)
    }

    pub fn delete_node(&self, address: IpAddr) -> bool {
        self.registry.delete_node(address)
    }

    pub fn set_hello_interval(&self, interval: Duration) {
        self.registry.set_hello_interval(interval);
    }

    pub fn set_dead_interval(&self, interval: Duration) {
        self.registry.set_dead_interval(interval);
    }

    /// Toggle active probing. Returns `false` in passive mode, where there
    /// is no prober to toggle.
    pub fn set_probing(&self, enabled: bool) -> bool {
        match &self.prober {
            Some(prober) => {
                prober.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn probing_enabled(&self) -> Option<bool> {
        self.prober.as_ref().map(|prober| prober.is_enabled())
    }

    /// Ask all peers for their call tables.
    pub async fn request_full_sync(&self) -> Result<()> {
        self.sync.request_full_sync().await?;
        Ok(())
    }

    /// Persist the credential table.
    pub fn save_users(&self, path: &Path) -> Result<()> {
        self.registrar.save_file(path)
    }
}
