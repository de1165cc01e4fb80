//! Line-oriented management console.
//!
//! A thin remote shell over TCP: one task per connection, one command per
//! line. Everything goes through the engine facade's accessor surface, so
//! the console holds no state of its own beyond the log filter handle.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::reload;

use siplb_call_engine::Balancer;

/// Handle for swapping the active log filter at runtime.
pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

const GREETING: &str = "siplb management console; 'help' lists commands\r\n";

const HELP: &str = "\
show nodes              node list with liveness\r\n\
show calls              call table contents\r\n\
show users              registrar table\r\n\
show stats              runtime counters\r\n\
add node <ip>           add a node to the list\r\n\
del node <ip>           remove a node from the list\r\n\
set hello <ms>          probe interval\r\n\
set dead <ms>           dead interval\r\n\
set probing on|off      toggle active OPTIONS probing\r\n\
set verbose <filter>    change the log filter, e.g. debug\r\n\
sync                    request full state from peers\r\n\
save users [path]       write the credential file\r\n\
quit                    close this session\r\n";

/// Bind the console and serve sessions in the background.
pub async fn spawn(
    balancer: Arc<Balancer>,
    addr: SocketAddr,
    filter: FilterHandle,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "management console listening");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "console session opened");
                    let balancer = balancer.clone();
                    let filter = filter.clone();
                    tokio::spawn(async move {
                        if let Err(err) = session(stream, balancer, filter).await {
                            warn!(%peer, error = %err, "console session error");
                        }
                        info!(%peer, "console session closed");
                    });
                }
                Err(err) => {
                    error!(error = %err, "console accept failed");
                    break;
                }
            }
        }
    });
    Ok(())
}

async fn session(
    stream: TcpStream,
    balancer: Arc<Balancer>,
    filter: FilterHandle,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(GREETING.as_bytes()).await?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            break;
        }
        let reply = execute(&balancer, &filter, line).await;
        writer.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}

async fn execute(balancer: &Balancer, filter: &FilterHandle, line: &str) -> String {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["help"] => HELP.to_string(),

        ["show", "nodes"] => show_nodes(balancer),
        ["show", "calls"] => show_calls(balancer),
        ["show", "users"] => show_users(balancer),
        ["show", "stats"] => show_stats(balancer),

        ["add", "node", addr] => match addr.parse::<IpAddr>() {
            Ok(address) => {
                let index = balancer.add_node(address);
                format!("node {} listed with index {}\r\n", address, index)
            }
            Err(_) => format!("not an ip address: {}\r\n", addr),
        },

        ["del", "node", addr] => match addr.parse::<IpAddr>() {
            Ok(address) if balancer.delete_node(address) => {
                format!("node {} removed\r\n", address)
            }
            Ok(address) => format!("node {} is not listed\r\n", address),
            Err(_) => format!("not an ip address: {}\r\n", addr),
        },

        ["set", "hello", millis] => match millis.parse::<u64>() {
            Ok(ms) => {
                balancer.set_hello_interval(Duration::from_millis(ms));
                format!("hello interval set to {} ms\r\n", ms)
            }
            Err(_) => format!("not a number of milliseconds: {}\r\n", millis),
        },

        ["set", "dead", millis] => match millis.parse::<u64>() {
            Ok(ms) => {
                balancer.set_dead_interval(Duration::from_millis(ms));
                format!("dead interval set to {} ms\r\n", ms)
            }
            Err(_) => format!("not a number of milliseconds: {}\r\n", millis),
        },

        ["set", "probing", state @ ("on" | "off")] => {
            if balancer.set_probing(*state == "on") {
                format!("active probing {}\r\n", state)
            } else {
                "running in passive heartbeat mode, no prober to toggle\r\n".to_string()
            }
        }

        ["set", "verbose", directive] => match EnvFilter::try_new(directive) {
            Ok(new_filter) => match filter.reload(new_filter) {
                Ok(()) => format!("log filter set to {}\r\n", directive),
                Err(err) => format!("log filter unchanged: {}\r\n", err),
            },
            Err(err) => format!("invalid filter directive: {}\r\n", err),
        },

        ["sync"] => match balancer.request_full_sync().await {
            Ok(()) => "synchronization request broadcast\r\n".to_string(),
            Err(err) => format!("synchronization request failed: {}\r\n", err),
        },

        ["save", "users", path] => match balancer.save_users(std::path::Path::new(path)) {
            Ok(()) => format!("credential table written to {}\r\n", path),
            Err(err) => format!("save failed: {}\r\n", err),
        },

        ["save", "users"] => match balancer.config().users_file.clone() {
            Some(path) => match balancer.save_users(&path) {
                Ok(()) => format!("credential table written to {}\r\n", path.display()),
                Err(err) => format!("save failed: {}\r\n", err),
            },
            None => "no credential file configured; give a path\r\n".to_string(),
        },

        _ => format!("unknown command: {} ('help' lists commands)\r\n", line),
    }
}

fn show_nodes(balancer: &Balancer) -> String {
    let nodes = balancer.nodes();
    if nodes.is_empty() {
        return "node list is empty\r\n".to_string();
    }
    let mut out = format!("{:<8}{:<40}{:<16}cursor\r\n", "INDEX", "ADDRESS", "LAST SEEN");
    for node in nodes {
        out.push_str(&format!(
            "{:<8}{:<40}{:<16}{}\r\n",
            node.index,
            node.address.to_string(),
            format!("{:.1} s ago", node.last_seen.as_secs_f64()),
            if node.is_cursor { "<--" } else { "" },
        ));
    }
    out
}

fn show_calls(balancer: &Balancer) -> String {
    let calls = balancer.calls();
    if calls.is_empty() {
        return "call table is empty\r\n".to_string();
    }
    let mut out = format!("{:<44}{:<28}{:<28}bye\r\n", "CALL-ID", "SOURCE", "DESTINATION");
    for (call_id, record) in calls {
        out.push_str(&format!(
            "{:<44}{:<28}{:<28}{}\r\n",
            call_id,
            record.src.to_string(),
            record.dst.to_string(),
            record.bye,
        ));
    }
    out
}

fn show_users(balancer: &Balancer) -> String {
    let users = balancer.users();
    if users.is_empty() {
        return "registrar table is empty\r\n".to_string();
    }
    let mut out = format!("{:<20}{:<12}{:<28}registered for\r\n", "USER", "REGISTERED", "ADDRESS");
    for user in users {
        let address = user
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        let since = user
            .registered_for
            .map(|d| format!("{:.0} s", d.as_secs_f64()))
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<20}{:<12}{:<28}{}\r\n",
            user.user, user.registered, address, since,
        ));
    }
    out
}

fn show_stats(balancer: &Balancer) -> String {
    let s = balancer.stats();
    format!(
        "invites routed     {}\r\n\
         calls completed    {}\r\n\
         call-id misses     {}\r\n\
         heartbeats         {}\r\n\
         full syncs served  {}\r\n\
         peer records in    {}\r\n\
         peer evictions in  {}\r\n",
        s.sip_invite,
        s.sip_bye,
        s.sip_not_found,
        s.heartbeats,
        s.sync_full,
        s.sync_stored,
        s.sync_evicted,
    )
}
