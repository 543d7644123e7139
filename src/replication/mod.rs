//! Replication Module
//!
//! The replication engine applies values decided by the consensus log to
//! the local store in log order and reacts to decided view changes.
//!
//! ## Lifecycle
//!
//! - PASSIVE: no view installed (or this node was removed from the view)
//! - SYNCING: view installed, waiting for the range transfer that brings
//!   this replica up to date
//! - READY: caught up; the request router may serve locally

mod engine;

pub use engine::ReplicationEngine;

use serde::{Deserialize, Serialize};

use crate::consensus::Reconfigure;
use crate::keyspace::KeyRange;
use crate::membership::View;
use crate::ops::{OpResponse, Operation};

/// Replication engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Passive,
    Syncing,
    Ready,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Passive => write!(f, "PASSIVE"),
            EngineState::Syncing => write!(f, "SYNCING"),
            EngineState::Ready => write!(f, "READY"),
        }
    }
}

/// Requests into the engine
#[derive(Debug, Clone)]
pub enum EngineInput {
    /// Replicate and execute a client operation
    Submit(Operation),
    /// Propose a view change (honoured only on the trusted leader)
    ProposeReconfigure(Reconfigure),
}

/// Indications from the engine to the request router
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A view was installed
    ViewInstalled {
        view: View,
        responsibility: KeyRange,
        state: EngineState,
    },
    /// The replica caught up with its responsibility
    Synced { view_id: u64 },
    /// Outcome of an executed (or rejected) operation
    Response(OpResponse),
}
