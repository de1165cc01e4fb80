//! Call-state replication between balancer peers.
//!
//! Peers running the balancer join a multicast group and exchange call
//! records as small binary datagrams: single-pair updates for INVITE/BYE
//! events, batched dumps in answer to a full-sync request. The wire format
//! is length-prefixed throughout and carries raw IPv4 or IPv6 addresses,
//! so mixed-family peers interoperate.

mod channel;
mod error;
mod record;
pub mod wire;

pub use channel::{SyncChannel, SyncConfig};
pub use error::{Error, Result};
pub use record::CallRecord;
pub use wire::{BatchBuffer, SyncEvent};
