use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use siplb_cluster_sync::SyncConfig;

/// Receive buffer size for the signaling and heartbeat sockets.
pub const BUFFER_LEN: usize = 4096;

/// Balancer engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Address the signaling socket binds to
    pub bind_addr: IpAddr,

    /// UDP port for SIP signaling
    pub bind_port: u16,

    /// Signaling port new calls are forwarded to on the selected node
    pub node_port: u16,

    /// Digest realm for REGISTER challenges
    pub realm: String,

    /// How often nodes are probed when active probing is on
    pub hello_interval: Duration,

    /// A node unseen for longer than this is considered dead
    pub dead_interval: Duration,

    /// Active OPTIONS probing of nodes in the static list
    pub active_probing: bool,

    /// Passive heartbeat listener; only used when no static node list exists
    pub heartbeat: Option<HeartbeatConfig>,

    /// Peer replication group
    pub sync: SyncConfig,

    /// Credential file for the registrar (`user[,password]` lines)
    pub users_file: Option<PathBuf>,
}

/// Heartbeat listener socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
}

impl HeartbeatConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 5060,
            node_port: 5060,
            realm: default_realm(),
            hello_interval: Duration::from_millis(3000),
            dead_interval: Duration::from_millis(10_000),
            active_probing: true,
            heartbeat: None,
            sync: SyncConfig::default(),
            users_file: None,
        }
    }
}

impl EngineConfig {
    pub fn signaling_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.bind_port)
    }
}

/// The host name when the platform exposes one, otherwise a placeholder.
pub fn default_realm() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "myDomain".to_string())
}
