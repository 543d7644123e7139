//! Client Operations
//!
//! Operations travel from the request router through the replicated log to
//! the store; responses travel back keyed by operation id.

use serde::{Deserialize, Serialize};

use crate::keyspace::{Key, KeyRange};
use crate::store::StoreDelta;

/// Operation identifier, unique per cluster (see [`crate::id::IdGenerator`])
pub type OpId = u64;

/// What an operation does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Get { key: Key },
    Put { key: Key, value: Vec<u8> },
    Delete { key: Key },
    /// Range read; `limit` caps the number of items the caller wants back.
    /// Without a cap the router pages through the whole range.
    RangeQuery { range: KeyRange, limit: Option<usize> },
    /// Anything this layer does not understand
    Other { name: String, payload: Vec<u8> },
}

/// A client operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub kind: OpKind,
}

/// The part of the key space an operation touches
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Key(&'a [u8]),
    Range(&'a KeyRange),
    Unrouted,
}

impl Operation {
    pub fn new(id: OpId, kind: OpKind) -> Self {
        Self { id, kind }
    }

    pub fn target(&self) -> Target<'_> {
        match &self.kind {
            OpKind::Get { key } | OpKind::Put { key, .. } | OpKind::Delete { key } => Target::Key(key),
            OpKind::RangeQuery { range, .. } => Target::Range(range),
            OpKind::Other { .. } => Target::Unrouted,
        }
    }

    /// Get the operation type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            OpKind::Get { .. } => "Get",
            OpKind::Put { .. } => "Put",
            OpKind::Delete { .. } => "Delete",
            OpKind::RangeQuery { .. } => "RangeQuery",
            OpKind::Other { .. } => "Other",
        }
    }
}

/// Outcome of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Value(Option<Vec<u8>>),
    Written,
    Deleted,
    /// A page of a range query; `remaining` is set when the page limit was
    /// hit before the queried range was exhausted
    Range {
        items: Vec<(Key, Vec<u8>)>,
        remaining: Option<KeyRange>,
    },
    Unsupported(String),
    /// The operation id was already executed
    Duplicate,
    Unavailable(String),
    Failed(String),
}

/// Response correlated with its operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResponse {
    pub id: OpId,
    pub response: Response,
    /// Store size change caused by executing the operation
    #[serde(default)]
    pub delta: StoreDelta,
}

impl OpResponse {
    pub fn new(id: OpId, response: Response) -> Self {
        Self {
            id,
            response,
            delta: StoreDelta::default(),
        }
    }
}
