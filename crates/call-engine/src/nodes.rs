use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

/// Management view of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub index: u32,
    pub address: IpAddr,
    /// Time since the node was last seen alive
    pub last_seen: Duration,
    /// Whether the round-robin cursor currently points here
    pub is_cursor: bool,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<u32, IpAddr>,
    seen: HashMap<u32, Instant>,
    cursor: Option<u32>,
    next_id: u32,
}

/// Ordered node list with per-node liveness and the round-robin cursor.
///
/// Node ids are stable handles assigned monotonically; list order for the
/// round robin is insertion order. The cursor-advance operation is a
/// compound find-next-fresh-with-wraparound and is guarded by a single
/// mutex together with the rest of the registry state.
#[derive(Debug)]
pub struct NodeRegistry {
    inner: Mutex<Inner>,
    hello_interval_ms: AtomicU64,
    dead_interval_ms: AtomicU64,
    /// Passive mode: the cursor follows heartbeats and never round-robins.
    follow_heartbeat: bool,
}

impl NodeRegistry {
    /// Registry in static-list mode: the cursor round-robins over the
    /// nodes on every [`advance`](Self::advance).
    pub fn new(hello_interval: Duration, dead_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            hello_interval_ms: AtomicU64::new(hello_interval.as_millis() as u64),
            dead_interval_ms: AtomicU64::new(dead_interval.as_millis() as u64),
            follow_heartbeat: false,
        }
    }

    /// Registry in passive heartbeat mode: the cursor is only ever moved by
    /// [`set_cursor_to`](Self::set_cursor_to) and [`advance`](Self::advance)
    /// does nothing. The two modes are fixed for the registry's lifetime.
    pub fn passive(hello_interval: Duration, dead_interval: Duration) -> Self {
        Self {
            follow_heartbeat: true,
            ..Self::new(hello_interval, dead_interval)
        }
    }

    pub fn hello_interval(&self) -> Duration {
        Duration::from_millis(self.hello_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_hello_interval(&self, interval: Duration) {
        self.hello_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn dead_interval(&self) -> Duration {
        Duration::from_millis(self.dead_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_dead_interval(&self, interval: Duration) {
        self.dead_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    /// Add a node, or refresh its liveness when the address is already
    /// present. Returns the node's id either way.
    pub fn add_node(&self, address: IpAddr) -> u32 {
        let mut inner = self.inner.lock();
        if let Some(id) = find(&inner.nodes, address) {
            inner.seen.insert(id, Instant::now());
            return id;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.nodes.insert(id, address);
        inner.seen.insert(id, Instant::now());
        if inner.cursor.is_none() {
            inner.cursor = Some(id);
        }
        info!(%address, index = id, "node added");
        id
    }

    /// Remove a node by address. Returns `false` when it was not listed.
    pub fn delete_node(&self, address: IpAddr) -> bool {
        let mut inner = self.inner.lock();
        let Some(id) = find(&inner.nodes, address) else {
            return false;
        };
        inner.nodes.remove(&id);
        inner.seen.remove(&id);
        if inner.cursor == Some(id) {
            inner.cursor = inner.nodes.keys().next().copied();
        }
        info!(%address, index = id, "node deleted");
        true
    }

    /// Refresh the last-seen timestamp for `address`. No-op for unknown
    /// addresses.
    pub fn touch(&self, address: IpAddr) {
        let mut inner = self.inner.lock();
        if let Some(id) = find(&inner.nodes, address) {
            inner.seen.insert(id, Instant::now());
        }
    }

    /// The node the cursor points at, for the next new call.
    pub fn pick(&self) -> Option<(u32, IpAddr)> {
        let mut inner = self.inner.lock();
        let id = match inner.cursor {
            Some(id) if inner.nodes.contains_key(&id) => id,
            // Deleted-from-under-us cursor falls back to the first node.
            _ => {
                let id = inner.nodes.keys().next().copied()?;
                inner.cursor = Some(id);
                id
            }
        };
        Some((id, inner.nodes[&id]))
    }

    /// Advance the cursor to the next node in insertion order, skipping
    /// nodes unseen for longer than the dead interval, wrapping circularly.
    /// When every node is stale the cursor returns to where it started
    /// instead of looping forever.
    pub fn advance(&self) {
        if self.follow_heartbeat {
            return;
        }
        let dead = self.dead_interval();
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let ids: Vec<u32> = inner.nodes.keys().copied().collect();
        if ids.is_empty() {
            inner.cursor = None;
            return;
        }

        let start = match inner.cursor {
            Some(id) if ids.contains(&id) => id,
            _ => ids[0],
        };
        let mut idx = ids.iter().position(|&id| id == start).unwrap_or(0);

        loop {
            idx = (idx + 1) % ids.len();
            let id = ids[idx];
            let fresh = inner
                .seen
                .get(&id)
                .map(|seen| now.duration_since(*seen) <= dead)
                .unwrap_or(false);
            if fresh || id == start {
                inner.cursor = Some(id);
                break;
            }
        }

        debug!(cursor = ?inner.cursor, "round-robin cursor advanced");
    }

    /// Point the cursor at `address` directly (passive heartbeat mode).
    /// The address must already be listed.
    pub fn set_cursor_to(&self, address: IpAddr) -> bool {
        let mut inner = self.inner.lock();
        match find(&inner.nodes, address) {
            Some(id) => {
                inner.cursor = Some(id);
                true
            }
            None => false,
        }
    }

    /// Management view of every node.
    pub fn snapshot(&self) -> Vec<NodeStatus> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .nodes
            .iter()
            .map(|(&index, &address)| NodeStatus {
                index,
                address,
                last_seen: inner
                    .seen
                    .get(&index)
                    .map(|seen| now.duration_since(*seen))
                    .unwrap_or_default(),
                is_cursor: inner.cursor == Some(index),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().nodes.is_empty()
    }

    /// Rewind a node's last-seen timestamp, as if it had been silent for
    /// `age`. Test hook for staleness paths.
    #[doc(hidden)]
    pub fn backdate(&self, address: IpAddr, age: Duration) {
        let then = Instant::now().checked_sub(age).unwrap_or_else(Instant::now);
        let mut inner = self.inner.lock();
        if let Some(id) = find(&inner.nodes, address) {
            inner.seen.insert(id, then);
        }
    }
}

fn find(nodes: &BTreeMap<u32, IpAddr>, address: IpAddr) -> Option<u32> {
    nodes
        .iter()
        .find(|(_, &addr)| addr == address)
        .map(|(&id, _)| id)
}
