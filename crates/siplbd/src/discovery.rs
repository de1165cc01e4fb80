//! One-shot SIP server discovery.
//!
//! Sends an OPTIONS probe to every host address of a local interface's IPv4
//! subnet and collects the senders of `200 OK` replies until the timeout.
//! Used only at startup to seed the node registry; nodes appearing later
//! are the health monitor's business.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use siplb_sip_core::{message, scan};

/// Subnets larger than this are refused rather than swept.
const MAX_SWEEP_PREFIX: u8 = 16;

const PROBE_SERVICE: &str = "discovery";

/// Probe `interface`'s subnet from `bind_port` and return every address
/// that answered `200 OK` on `node_port` within `wait`.
pub async fn sweep(
    interface: Ipv4Addr,
    bind_port: u16,
    node_port: u16,
    wait: Duration,
) -> anyhow::Result<Vec<IpAddr>> {
    let prefix = interface_prefix(interface)
        .with_context(|| format!("interface {} not found on this host", interface))?;
    if prefix < MAX_SWEEP_PREFIX {
        bail!(
            "interface {} has prefix /{}, too large to sweep (limit /{})",
            interface,
            prefix,
            MAX_SWEEP_PREFIX
        );
    }

    let socket = UdpSocket::bind((interface, bind_port))
        .await
        .with_context(|| format!("binding {}:{} for discovery", interface, bind_port))?;
    let local = socket.local_addr()?;

    let own = u32::from(interface);
    let mask = u32::MAX << (32 - prefix);
    let network = own & mask;
    let broadcast = network | !mask;

    info!(%interface, prefix, "sweeping subnet for SIP servers");
    for host in (network + 1)..broadcast {
        if host == own {
            continue;
        }
        let address = Ipv4Addr::from(host);
        let call_id = message::generate_call_id(local);
        let probe = message::options_probe(PROBE_SERVICE, address.into(), local, &call_id);
        // Errors per host are expected on a sparse subnet; keep sweeping.
        if let Err(err) = socket.send_to(probe.as_bytes(), (address, node_port)).await {
            debug!(%address, error = %err, "probe not sent");
        }
    }

    let mut found: Vec<IpAddr> = Vec::new();
    let deadline = Instant::now() + wait;
    let mut buf = [0u8; 4096];
    loop {
        let (len, sender) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => break, // collection window over
        };
        let msg = String::from_utf8_lossy(&buf[..len]);
        if scan::first_line(&msg).contains("200 OK") && !found.contains(&sender.ip()) {
            debug!(server = %sender.ip(), "SIP server discovered");
            found.push(sender.ip());
        }
    }

    Ok(found)
}

/// Prefix length of the interface carrying `address`.
fn interface_prefix(address: Ipv4Addr) -> Option<u8> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifaddr in addrs {
        let Some(found) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };
        if found.ip() != address {
            continue;
        }
        let netmask = ifaddr.netmask.as_ref().and_then(|m| m.as_sockaddr_in())?;
        return Some(u32::from(netmask.ip()).count_ones() as u8);
    }
    None
}
