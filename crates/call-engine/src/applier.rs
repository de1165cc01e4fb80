//! The replication receive loop.
//!
//! Drains the multicast channel and keeps the local call table eventually
//! consistent with the peers. The merge rule is last-writer-wins per call
//! id with bye dominating, so inserts and evictions may arrive in either
//! order relative to local traffic and still converge.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use siplb_cluster_sync::{SyncChannel, SyncEvent};

use crate::error::Result;
use crate::stats::Stats;
use crate::table::{CallTable, Merge};

/// Apply replication events until the channel's socket fails.
pub async fn run(channel: Arc<SyncChannel>, table: Arc<CallTable>, stats: Arc<Stats>) -> Result<()> {
    loop {
        match channel.recv().await? {
            SyncEvent::FullSyncRequest => {
                stats.inc_sync_full();
                let snapshot = table.snapshot();
                debug!(records = snapshot.len(), "peer requested full sync");
                for (call_id, record) in snapshot {
                    if let Err(err) = channel.store(&call_id, record) {
                        warn!(call_id, error = %err, "record skipped in full sync reply");
                    }
                }
                channel.flush().await?;
            }
            SyncEvent::Records(records) => {
                for (call_id, record) in records {
                    match table.apply(&call_id, record) {
                        Merge::Stored => {
                            stats.inc_sync_stored();
                            trace!(call_id, "peer call stored");
                        }
                        Merge::Removed => {
                            stats.inc_sync_evicted();
                            trace!(call_id, "peer call evicted");
                        }
                    }
                }
            }
        }
    }
}
