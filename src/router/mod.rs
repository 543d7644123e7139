//! Request Router Module
//!
//! Front door for client operations. Operations inside this replica's
//! responsibility are replicated through the engine once the replica is
//! synced; everything else is forwarded, either to a live member of the
//! view (while syncing) or to the owner reported by the placement service.

mod request;
pub mod stats;

pub use request::RequestRouter;
pub use stats::{LogMonitor, Monitor, StatsCollector, StatsReport};

use tokio::sync::mpsc;

use crate::membership::{Liveness, NodeId};
use crate::network::Envelope;
use crate::ops::{OpId, OpResponse, Operation};

/// Router state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    /// Local replica not trustworthy yet
    Forwarding,
    /// Local replica serves its responsibility
    Active,
}

/// Where the answer to a request goes
#[derive(Debug, Clone)]
pub enum ReplyTo {
    /// A local caller
    Local(mpsc::Sender<OpResponse>),
    /// The router of another node
    Remote(NodeId),
}

/// Inputs of the router task
#[derive(Debug, Clone)]
pub enum RouterInput {
    /// Client operation
    Request { operation: Operation, reply: ReplyTo },
    /// Forward or Reply from another node
    Inbound(Envelope),
    /// Liveness of view members
    Liveness(Liveness),
    /// Stats interval elapsed
    StatsTick,
    /// A forwarded operation went unanswered
    ForwardTimeout { id: OpId },
}
