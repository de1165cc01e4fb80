//! The signaling receive loop.
//!
//! One task owns the signaling socket and classifies every datagram by its
//! first line: INVITE opens a call, REGISTER is answered locally, anything
//! else follows the call table. Garbage, unknown call ids and forwarding
//! failures are absorbed here; only a failure of the socket itself ends the
//! loop, since the balancer cannot route without it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use siplb_cluster_sync::{CallRecord, SyncChannel};
use siplb_sip_core::scan::{self, RegisterFields};
use siplb_sip_core::{message, MIN_DATAGRAM_LEN};

use crate::config::BUFFER_LEN;
use crate::error::Result;
use crate::health::ActiveProber;
use crate::nodes::NodeRegistry;
use crate::registrar::Registrar;
use crate::stats::Stats;
use crate::table::CallTable;

/// Outbound half of the replication channel, as the dispatcher sees it.
///
/// Call records are published fire-and-forget on INVITE and on eviction; a
/// failed publish is logged and the datagram is still forwarded.
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    async fn publish(
        &self,
        call_id: &str,
        record: &CallRecord,
    ) -> std::result::Result<(), siplb_cluster_sync::Error>;
}

#[async_trait]
impl RecordPublisher for SyncChannel {
    async fn publish(
        &self,
        call_id: &str,
        record: &CallRecord,
    ) -> std::result::Result<(), siplb_cluster_sync::Error> {
        self.send_now(call_id, record).await
    }
}

/// The per-datagram state machine over the signaling socket.
pub struct Dispatcher {
    socket: Arc<UdpSocket>,
    table: Arc<CallTable>,
    registry: Arc<NodeRegistry>,
    registrar: Arc<Registrar>,
    publisher: Arc<dyn RecordPublisher>,
    prober: Option<Arc<ActiveProber>>,
    stats: Arc<Stats>,
    realm: String,
    node_port: u16,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: Arc<UdpSocket>,
        table: Arc<CallTable>,
        registry: Arc<NodeRegistry>,
        registrar: Arc<Registrar>,
        publisher: Arc<dyn RecordPublisher>,
        prober: Option<Arc<ActiveProber>>,
        stats: Arc<Stats>,
        realm: String,
        node_port: u16,
    ) -> Self {
        Self {
            socket,
            table,
            registry,
            registrar,
            publisher,
            prober,
            stats,
            realm,
            node_port,
        }
    }

    /// Receive and dispatch datagrams until the socket fails.
    pub async fn run(self) -> Result<()> {
        info!(addr = ?self.socket.local_addr().ok(), "dispatcher listening");
        let mut buf = vec![0u8; BUFFER_LEN];
        loop {
            let (len, sender) = self.socket.recv_from(&mut buf).await?;
            self.handle_datagram(&buf[..len], sender).await;
        }
    }

    /// Classify and act on one datagram. Never fails; every condition short
    /// of a socket error is absorbed here.
    pub async fn handle_datagram(&self, data: &[u8], sender: SocketAddr) {
        if data.len() < MIN_DATAGRAM_LEN {
            debug!(%sender, len = data.len(), "runt datagram discarded");
            return;
        }

        let msg = String::from_utf8_lossy(data);
        let Some(call_id) = scan::call_id(&msg) else {
            warn!(%sender, "datagram without Call-ID discarded");
            return;
        };
        let call_id = call_id.to_string();
        let first_line = scan::first_line(&msg);

        if first_line.contains("INVITE") {
            self.on_invite(data, &call_id, sender).await;
        } else if first_line.contains("REGISTER") {
            self.on_register(&msg, &call_id, sender).await;
        } else {
            self.on_in_call(data, first_line, &call_id, sender).await;
        }
    }

    /// New call: pick a node, record the legs, replicate, forward.
    async fn on_invite(&self, data: &[u8], call_id: &str, sender: SocketAddr) {
        let Some((_, node)) = self.registry.pick() else {
            warn!(call_id, %sender, "INVITE with no node available, dropped");
            return;
        };
        let destination = SocketAddr::new(node, self.node_port);
        let record = CallRecord::new(sender, destination);

        self.table.insert(call_id, record);

        if let Err(err) = self.publisher.publish(call_id, &record).await {
            warn!(call_id, error = %err, "replication of new call failed");
        }

        match self.socket.send_to(data, destination).await {
            Ok(_) => debug!(call_id, %sender, %destination, "call opened"),
            Err(err) => warn!(call_id, %destination, error = %err, "INVITE forward failed"),
        }

        self.stats.inc_invite();

        // Next INVITE goes to the next node; a no-op in passive mode.
        self.registry.advance();

        if let Some(prober) = &self.prober {
            prober.sweep_if_due().await;
        }
    }

    /// REGISTER: validate against the registrar and answer directly. Never
    /// touches the call table.
    async fn on_register(&self, msg: &str, call_id: &str, sender: SocketAddr) {
        let fields = match RegisterFields::scan(msg) {
            Ok(fields) => fields,
            Err(err) => {
                warn!(%sender, error = %err, "malformed REGISTER discarded");
                return;
            }
        };

        let nonce = fields
            .nonce
            .clone()
            .unwrap_or_else(|| format!("{:x}", unix_millis()));

        let reply = if fields.is_unregister() {
            self.registrar.unregister(&fields.user);
            message::register_ok(&fields, call_id, sender.ip())
        } else if self.registrar.register(
            &fields.user,
            sender.ip(),
            &self.realm,
            &nonce,
            &fields.request_uri,
            fields.response.as_deref(),
        ) {
            message::register_ok(&fields, call_id, sender.ip())
        } else {
            message::register_unauthorized(
                &fields,
                call_id,
                sender.ip(),
                sender.port(),
                &self.realm,
                &nonce,
            )
        };

        if let Err(err) = self.socket.send_to(reply.as_bytes(), sender).await {
            warn!(%sender, error = %err, "REGISTER reply failed");
        }
    }

    /// Any other message follows the table entry created by its INVITE.
    async fn on_in_call(&self, data: &[u8], first_line: &str, call_id: &str, sender: SocketAddr) {
        let Some(record) = self.table.get(call_id) else {
            // A 200 OK from a probed node is a liveness confirmation, not a
            // routing error.
            if first_line.contains("200 OK") {
                if let Some(prober) = &self.prober {
                    if prober.note_reply(sender.ip()) {
                        return;
                    }
                }
            }
            warn!(call_id, %sender, "call id not found in table");
            self.stats.inc_not_found();
            return;
        };

        if sender.ip() == record.dst.ip() {
            // Reply path: node -> balancer -> original caller.
            if let Err(err) = self.socket.send_to(data, record.src).await {
                warn!(call_id, target = %record.src, error = %err, "forward to caller failed");
            }
            self.registry.touch(record.dst.ip());
        } else {
            // Caller -> balancer -> node.
            if let Err(err) = self.socket.send_to(data, record.dst).await {
                warn!(call_id, target = %record.dst, error = %err, "forward to node failed");
            }
        }

        if first_line.contains("BYE") {
            self.table.set_bye(call_id);
        }

        // Evict after the directional forward, whichever message set the
        // flag; the terminating message itself must still be routed.
        if let Some(current) = self.table.get(call_id) {
            if current.bye {
                self.table.remove(call_id);
                if let Err(err) = self.publisher.publish(call_id, &current).await {
                    warn!(call_id, error = %err, "replication of call eviction failed");
                }
                self.stats.inc_bye();
                debug!(call_id, "call closed");
            }
        }
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
