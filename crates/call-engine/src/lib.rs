//! # Call engine for the siplb balancer
//!
//! The engine sits between SIP user agents and a pool of SIP servers. Every
//! inbound datagram on the signaling socket is classified by the
//! [`Dispatcher`]: INVITEs open a call and pick a destination node, REGISTERs
//! are answered locally by the [`Registrar`], and everything else follows the
//! call table entry created by its INVITE. Call state is replicated to
//! cluster peers over multicast and merged back by the applier, so any peer
//! can take over mid-call routing.
//!
//! Key pieces:
//!
//! - [`CallTable`]: concurrent call-id to record map, the single source of
//!   truth for in-flight calls
//! - [`NodeRegistry`]: node list, liveness timestamps and the round-robin
//!   cursor
//! - [`ActiveProber`] / [`HeartbeatListener`]: the two mutually exclusive
//!   node health strategies
//! - [`Registrar`]: digest-authenticating REGISTER handler
//! - [`Balancer`]: facade that owns the shared state, spawns the loops and
//!   exposes the management accessor surface

pub mod applier;
pub mod config;
pub mod dispatcher;
pub mod engine;
mod error;
pub mod health;
pub mod nodes;
pub mod registrar;
pub mod stats;
pub mod table;

pub use config::{EngineConfig, HeartbeatConfig};
pub use dispatcher::{Dispatcher, RecordPublisher};
pub use engine::Balancer;
pub use error::{Error, Result};
pub use health::{ActiveProber, HeartbeatListener};
pub use nodes::{NodeRegistry, NodeStatus};
pub use registrar::{Registrar, UserStatus};
pub use stats::{Stats, StatsSnapshot};
pub use table::CallTable;

pub use siplb_cluster_sync::{CallRecord, Error as SyncError, SyncChannel, SyncConfig};
pub use table::Merge;
