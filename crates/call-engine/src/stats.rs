use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Runtime counters, incremented from the dispatcher, applier and
/// heartbeat loops.
#[derive(Debug, Default)]
pub struct Stats {
    sip_invite: AtomicU64,
    sip_bye: AtomicU64,
    sip_not_found: AtomicU64,
    heartbeats: AtomicU64,
    sync_full: AtomicU64,
    sync_stored: AtomicU64,
    sync_evicted: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// INVITEs routed to a node
    pub sip_invite: u64,
    /// Calls evicted after their BYE
    pub sip_bye: u64,
    /// Non-INVITE messages whose call id was unknown
    pub sip_not_found: u64,
    /// Keep-alive datagrams seen by the heartbeat listener
    pub heartbeats: u64,
    /// Full-sync requests served
    pub sync_full: u64,
    /// Records stored on behalf of peers
    pub sync_stored: u64,
    /// Records evicted on behalf of peers
    pub sync_evicted: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_invite(&self) {
        self.sip_invite.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bye(&self) {
        self.sip_bye.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_not_found(&self) {
        self.sip_not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sync_full(&self) {
        self.sync_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sync_stored(&self) {
        self.sync_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sync_evicted(&self) {
        self.sync_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sip_invite: self.sip_invite.load(Ordering::Relaxed),
            sip_bye: self.sip_bye.load(Ordering::Relaxed),
            sip_not_found: self.sip_not_found.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            sync_full: self.sync_full.load(Ordering::Relaxed),
            sync_stored: self.sync_stored.load(Ordering::Relaxed),
            sync_evicted: self.sync_evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();
        stats.inc_invite();
        stats.inc_invite();
        stats.inc_bye();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sip_invite, 2);
        assert_eq!(snapshot.sip_bye, 1);
        assert_eq!(snapshot.sip_not_found, 0);
    }
}
