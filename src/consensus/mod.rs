//! Consensus Log Port
//!
//! The multi-decree consensus algorithm is an external collaborator. The
//! replication engine talks to it through exactly three message kinds:
//! `Propose` and `Prune` requests going in, `Decide` indications coming
//! out, in position order per subscriber.

mod local;

pub use local::LocalLog;

use serde::{Deserialize, Serialize};

use crate::keyspace::KeyRange;
use crate::membership::View;
use crate::ops::Operation;

/// Log position
pub type Position = u64;

/// A view change decided through the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconfigure {
    pub view: View,
    pub quorum: usize,
    /// Data version of the responsibility; 0 means the range holds no data yet
    pub version_id: u64,
    pub responsibility: KeyRange,
}

/// Log entry value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Noop,
    Reconfigure(Reconfigure),
    Op(Operation),
}

impl Value {
    /// Class rank then id; values sharing a key are not ordered further
    pub fn order_key(&self) -> (u8, u64) {
        match self {
            Value::Noop => (0, 0),
            Value::Reconfigure(r) => (1, r.view.id),
            Value::Op(op) => (2, op.id),
        }
    }

    /// Get the value type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Noop => "Noop",
            Value::Reconfigure(_) => "Reconfigure",
            Value::Op(_) => "Op",
        }
    }
}

/// Requests into the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRequest {
    Propose(Value),
    /// Entries below `position` are no longer needed by this replica
    Prune(Position),
}

/// Indications out of the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogIndication {
    Decide { position: Position, value: Value },
}
