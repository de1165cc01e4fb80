use dashmap::DashMap;

use siplb_cluster_sync::CallRecord;

/// What a replicated record did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// Record inserted or overwritten
    Stored,
    /// Record carried the bye flag; the entry (if any) was evicted
    Removed,
}

/// Concurrent map from call id to [`CallRecord`]; the single source of truth
/// for in-flight calls.
///
/// Populated two ways: directly by the dispatcher when an INVITE arrives,
/// and by the replication applier when a peer broadcasts its own inserts.
/// Insertion and bye-eviction are the only table-level mutations. All
/// methods are safe under concurrent use from both loops.
#[derive(Debug, Default)]
pub struct CallTable {
    calls: DashMap<String, CallRecord>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `record` under `call_id`, replacing any previous entry.
    pub fn insert(&self, call_id: &str, record: CallRecord) {
        self.calls.insert(call_id.to_string(), record);
    }

    /// Copy of the record for `call_id`.
    pub fn get(&self, call_id: &str) -> Option<CallRecord> {
        self.calls.get(call_id).map(|entry| *entry.value())
    }

    /// Flag the call as terminating. The flag is never cleared again.
    ///
    /// Returns `false` when the call id is unknown.
    pub fn set_bye(&self, call_id: &str) -> bool {
        match self.calls.get_mut(call_id) {
            Some(mut entry) => {
                entry.value_mut().bye = true;
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `call_id`. Absent entries are a no-op.
    pub fn remove(&self, call_id: &str) {
        self.calls.remove(call_id);
    }

    /// Merge a record received from a peer: bye evicts, anything else
    /// inserts or overwrites. Last writer wins per call id, bye dominates.
    pub fn apply(&self, call_id: &str, record: CallRecord) -> Merge {
        if record.bye {
            self.calls.remove(call_id);
            Merge::Removed
        } else {
            self.calls.insert(call_id.to_string(), record);
            Merge::Stored
        }
    }

    /// All current entries, copied out.
    pub fn snapshot(&self) -> Vec<(String, CallRecord)> {
        self.calls
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
