//! Node health strategies.
//!
//! Exactly one of the two runs against a registry at a time, chosen at
//! startup: [`ActiveProber`] when a static node list exists, and
//! [`HeartbeatListener`] when nodes announce themselves instead.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use siplb_sip_core::message;

use crate::config::{HeartbeatConfig, BUFFER_LEN};
use crate::error::Result;
use crate::nodes::NodeRegistry;
use crate::stats::Stats;

/// Service name placed in the user part of probe URIs.
const PROBE_SERVICE: &str = "siplb";

/// Active health checking: OPTIONS probes for nodes that have gone quiet.
///
/// Probing is driven inline from the dispatcher loop rather than a timer
/// task, which bounds probe traffic to one sweep per hello interval. Probes
/// go out on the signaling socket, so the replies come back through the
/// dispatcher; it reports them here via [`note_reply`](Self::note_reply).
pub struct ActiveProber {
    socket: Arc<UdpSocket>,
    registry: Arc<NodeRegistry>,
    node_port: u16,
    enabled: AtomicBool,
    awaiting: Mutex<HashSet<IpAddr>>,
    last_sweep: Mutex<Instant>,
}

impl ActiveProber {
    pub fn new(
        socket: Arc<UdpSocket>,
        registry: Arc<NodeRegistry>,
        node_port: u16,
        enabled: bool,
    ) -> Self {
        Self {
            socket,
            registry,
            node_port,
            enabled: AtomicBool::new(enabled),
            awaiting: Mutex::new(HashSet::new()),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        info!(enabled, "active probing toggled");
    }

    /// Run one probe sweep when the hello interval has elapsed since the
    /// last one; otherwise return immediately.
    ///
    /// Nodes quiet for more than a hello interval are probed, dead ones
    /// included, in case they came back. Nodes inside the dead window are
    /// reported but stay listed; only liveness changes, never membership.
    pub async fn sweep_if_due(&self) {
        if !self.is_enabled() {
            return;
        }

        let hello = self.registry.hello_interval();
        {
            let mut last = self.last_sweep.lock();
            if last.elapsed() <= hello {
                return;
            }
            *last = Instant::now();
        }

        let dead = self.registry.dead_interval();
        let local = match self.socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                warn!(error = %err, "probe sweep skipped, no local address");
                return;
            }
        };

        let mut probes: Vec<IpAddr> = Vec::new();
        for node in self.registry.snapshot() {
            if node.last_seen > hello {
                probes.push(node.address);
            }
            if node.last_seen > dead && node.last_seen <= dead + hello {
                warn!(node = %node.address, silent_for = ?node.last_seen, "dead node");
            }
        }

        {
            let mut awaiting = self.awaiting.lock();
            awaiting.clear();
            awaiting.extend(probes.iter().copied());
        }

        for address in probes {
            let call_id = message::generate_call_id(local);
            let probe = message::options_probe(PROBE_SERVICE, address, local, &call_id);
            let target = SocketAddr::new(address, self.node_port);
            if let Err(err) = self.socket.send_to(probe.as_bytes(), target).await {
                warn!(node = %address, error = %err, "OPTIONS probe failed");
            } else {
                debug!(node = %address, "OPTIONS probe sent");
            }
        }
    }

    /// A success reply arrived from `address`. Returns `true` and refreshes
    /// the node's liveness when a probe was outstanding for it; `false`
    /// otherwise.
    pub fn note_reply(&self, address: IpAddr) -> bool {
        if self.awaiting.lock().remove(&address) {
            self.registry.touch(address);
            debug!(node = %address, "node is live");
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    fn awaiting_count(&self) -> usize {
        self.awaiting.lock().len()
    }
}

/// Passive health checking: nodes send keep-alive datagrams to a dedicated
/// port; payload content does not matter, only the sender address.
///
/// Every heartbeat refreshes the sender's liveness and points the
/// round-robin cursor at it, so new calls go to whoever reported last.
pub struct HeartbeatListener {
    socket: UdpSocket,
    registry: Arc<NodeRegistry>,
    stats: Arc<Stats>,
}

impl HeartbeatListener {
    pub async fn bind(
        config: &HeartbeatConfig,
        registry: Arc<NodeRegistry>,
        stats: Arc<Stats>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(config.socket_addr()).await?;
        info!(addr = %config.socket_addr(), "heartbeat listener bound");
        Ok(Self {
            socket,
            registry,
            stats,
        })
    }

    /// Receive heartbeats until the socket fails.
    pub async fn run(self) -> Result<()> {
        let mut buf = [0u8; BUFFER_LEN];
        loop {
            let (_, sender) = self.socket.recv_from(&mut buf).await?;
            let address = sender.ip();
            self.registry.add_node(address);
            self.registry.set_cursor_to(address);
            self.stats.inc_heartbeat();
            debug!(node = %address, "heartbeat");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn probe_setup(hello: Duration) -> (Arc<ActiveProber>, UdpSocket, IpAddr) {
        let node_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let node_addr = node_socket.local_addr().unwrap();

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let registry = Arc::new(NodeRegistry::new(hello, Duration::from_secs(10)));
        registry.add_node(node_addr.ip());

        let prober = Arc::new(ActiveProber::new(
            socket,
            registry,
            node_addr.port(),
            true,
        ));
        (prober, node_socket, node_addr.ip())
    }

    #[tokio::test]
    async fn quiet_nodes_get_probed() {
        let (prober, node_socket, node_ip) = probe_setup(Duration::from_millis(1)).await;
        prober.registry.backdate(node_ip, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(5)).await;

        prober.sweep_if_due().await;
        assert_eq!(prober.awaiting_count(), 1);

        let mut buf = [0u8; BUFFER_LEN];
        let (len, _) = node_socket.recv_from(&mut buf).await.unwrap();
        let probe = String::from_utf8_lossy(&buf[..len]);
        assert!(probe.starts_with("OPTIONS "));
        assert!(probe.contains("CSeq: 1 OPTIONS\r\n"));
    }

    #[tokio::test]
    async fn reply_clears_awaiting_and_touches_node() {
        let (prober, _node_socket, node_ip) = probe_setup(Duration::from_millis(1)).await;
        prober.registry.backdate(node_ip, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(5)).await;
        prober.sweep_if_due().await;

        assert!(prober.note_reply(node_ip));
        assert_eq!(prober.awaiting_count(), 0);
        // Not awaiting any more, so a second reply is not a confirmation.
        assert!(!prober.note_reply(node_ip));

        let status = &prober.registry.snapshot()[0];
        assert!(status.last_seen < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn fresh_nodes_are_not_probed() {
        let (prober, _node_socket, node_ip) = probe_setup(Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        // Sweep is due, but the node just reported in.
        prober.registry.touch(node_ip);
        prober.sweep_if_due().await;
        assert_eq!(prober.awaiting_count(), 0);
    }

    #[tokio::test]
    async fn disabled_prober_stays_silent() {
        let (prober, _node_socket, node_ip) = probe_setup(Duration::from_millis(1)).await;
        prober.set_enabled(false);
        prober.registry.backdate(node_ip, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(5)).await;
        prober.sweep_if_due().await;
        assert_eq!(prober.awaiting_count(), 0);
    }

    #[tokio::test]
    async fn heartbeat_refreshes_and_redirects_cursor() {
        let registry = Arc::new(NodeRegistry::passive(
            Duration::from_secs(3),
            Duration::from_secs(10),
        ));
        registry.add_node("10.0.0.1".parse().unwrap());
        let stats = Arc::new(Stats::new());

        let config = HeartbeatConfig {
            bind_addr: "127.0.0.1".parse().unwrap(),
            port: 0,
        };
        let listener = HeartbeatListener::bind(&config, registry.clone(), stats.clone())
            .await
            .unwrap();
        let target = listener.socket.local_addr().unwrap();
        tokio::spawn(listener.run());

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"keepalive", target).await.unwrap();

        // Give the listener a moment to process.
        for _ in 0..50 {
            if registry.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.pick().unwrap().1, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(stats.snapshot().heartbeats, 1);
    }
}
