use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::record::CallRecord;
use crate::wire::{self, BatchBuffer, SyncEvent, FULL_SYNC};

/// Receive buffer size; matches the signaling socket buffer.
const BUFFER_LEN: usize = 4096;

/// Multicast group shared by a balancer cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SyncConfig {
    pub group: Ipv4Addr,
    pub port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(226, 13, 25, 1),
            port: 5555,
        }
    }
}

impl SyncConfig {
    pub fn group_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }
}

/// Transport for peer replication: a unicast send socket and a multicast
/// receive socket joined to the group.
///
/// The group loops our own datagrams back at us; every receive therefore
/// checks the sender against the local interface address set and skips
/// matches without side effects.
pub struct SyncChannel {
    group: SocketAddr,
    send: UdpSocket,
    recv: UdpSocket,
    local: HashSet<IpAddr>,
    batch: Mutex<BatchBuffer>,
}

impl SyncChannel {
    /// Join `config.group` and get ready to send and receive updates.
    pub async fn new(config: &SyncConfig) -> Result<Self> {
        let send = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let recv = multicast_socket(config)?;
        let local = local_addresses();
        debug!(
            group = %config.group_addr(),
            interfaces = local.len(),
            "replication channel joined"
        );
        Ok(Self {
            group: config.group_addr(),
            send,
            recv,
            local,
            batch: Mutex::new(BatchBuffer::new()),
        })
    }

    /// Immediately broadcast a single `(call id, record)` pair.
    ///
    /// Fire-and-forget, at-most-once: the datagram is handed to the network
    /// and never retransmitted.
    pub async fn send_now(&self, call_id: &str, record: &CallRecord) -> Result<()> {
        let datagram = wire::encode_single(call_id, record)?;
        self.send.send_to(&datagram, self.group).await?;
        trace!(call_id, bye = record.bye, "call record broadcast");
        Ok(())
    }

    /// Stage a record for the next [`flush`](Self::flush).
    pub fn store(&self, call_id: &str, record: CallRecord) -> Result<()> {
        self.batch.lock().store(call_id, record)
    }

    /// Send everything staged with [`store`](Self::store) as bounded
    /// datagrams until the staging buffer is drained.
    pub async fn flush(&self) -> Result<()> {
        let datagrams = self.batch.lock().drain_datagrams();
        for datagram in datagrams {
            self.send.send_to(&datagram, self.group).await?;
        }
        Ok(())
    }

    /// Ask every peer for its entire call table.
    pub async fn request_full_sync(&self) -> Result<()> {
        self.send.send_to(&FULL_SYNC, self.group).await?;
        Ok(())
    }

    /// Next replication event from a peer.
    ///
    /// Blocks until a datagram from somebody else decodes; self-originated
    /// and malformed datagrams are skipped. Socket errors are terminal.
    pub async fn recv(&self) -> Result<SyncEvent> {
        let mut buf = [0u8; BUFFER_LEN];
        loop {
            let (len, sender) = self.recv.recv_from(&mut buf).await?;
            if self.local.contains(&sender.ip()) {
                trace!(%sender, "skipping own multicast datagram");
                continue;
            }
            match wire::decode(&buf[..len]) {
                Ok(event) => return Ok(event),
                Err(err) => {
                    warn!(%sender, error = %err, "dropping malformed replication datagram");
                }
            }
        }
    }
}

fn multicast_socket(config: &SyncConfig) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port).into())?;
    socket.join_multicast_v4(&config.group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Every address configured on a local interface, plus the loopbacks.
///
/// Snapshot taken once at channel construction; addresses brought up later
/// are not in the set.
fn local_addresses() -> HashSet<IpAddr> {
    let mut set: HashSet<IpAddr> = HashSet::new();
    set.insert(Ipv4Addr::LOCALHOST.into());
    set.insert(std::net::Ipv6Addr::LOCALHOST.into());

    match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => {
            for ifaddr in addrs {
                let Some(storage) = ifaddr.address else {
                    continue;
                };
                if let Some(v4) = storage.as_sockaddr_in() {
                    set.insert(IpAddr::V4(v4.ip()));
                } else if let Some(v6) = storage.as_sockaddr_in6() {
                    set.insert(IpAddr::V6(v6.ip()));
                }
            }
        }
        Err(err) => {
            warn!(error = %err, "interface enumeration failed, loop prevention limited to loopback");
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_address_set_includes_loopback() {
        let set = local_addresses();
        assert!(set.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }
}
