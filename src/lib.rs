//! WolfRing - Membership and Range Replication Layer
//!
//! The replication layer of a partitioned key-value store. Every replica
//! runs a failure detector, a leader oracle, a replication engine fed by a
//! consensus log, a flow-controlled data mover and a request router.
//!
//! # Architecture
//!
//! Each component is a task owning its state and talking to the others
//! through bounded channels; see [`node`] for the wiring.
//!
//! # Features
//!
//! - Heartbeat failure detection with RTT-based retransmission timeouts
//! - Eventual leader election (Ω) over the installed view
//! - Log-ordered execution of client operations and view changes
//! - Range handover to joining replicas with quota-based flow control
//! - Request forwarding while a replica syncs, with automatic pagination

pub mod config;
pub mod consensus;
pub mod error;
pub mod id;
pub mod keyspace;
pub mod membership;
pub mod network;
pub mod node;
pub mod ops;
pub mod placement;
pub mod replication;
pub mod router;
pub mod store;
pub mod timer;
pub mod transfer;

pub use config::WolfRingConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfRingConfig;
    pub use crate::error::{Error, Result};
    pub use crate::keyspace::KeyRange;
    pub use crate::membership::{NodeId, View};
    pub use crate::node::{Node, NodeHandle};
    pub use crate::ops::{OpKind, OpResponse, Operation, Response};
}
