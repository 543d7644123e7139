//! Node identity and membership views
//!
//! A view is an ordered snapshot of the members of a replication group.
//! Node ordering doubles as ring ordering: the successor of a member is the
//! next member in the view, wrapping around to the first.

use std::collections::BTreeSet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Replica identity: host, port and an optional virtual-node suffix
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub host: String,
    pub port: u16,
    pub vnode: Option<u32>,
}

impl NodeId {
    /// Create a physical node id
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            vnode: None,
        }
    }

    /// Create a virtual node hosted by the given physical node
    pub fn with_vnode(host: impl Into<String>, port: u16, vnode: u32) -> Self {
        Self {
            host: host.into(),
            port,
            vnode: Some(vnode),
        }
    }

    /// Network address of the hosting process (host:port)
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The physical node hosting this (possibly virtual) node
    pub fn physical(&self) -> NodeId {
        NodeId::new(self.host.clone(), self.port)
    }

    /// Parse `host:port` or `host:port#vnode`
    pub fn parse(s: &str) -> Result<Self> {
        let (addr, vnode) = match s.split_once('#') {
            Some((addr, vnode)) => {
                let vnode = vnode
                    .parse::<u32>()
                    .map_err(|_| Error::Config(format!("invalid vnode suffix in '{}'", s)))?;
                (addr, Some(vnode))
            }
            None => (s, None),
        };

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("node id '{}' must be host:port", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("invalid port in '{}'", s)))?;

        if host.is_empty() {
            return Err(Error::Config(format!("empty host in '{}'", s)));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            vnode,
        })
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.vnode {
            Some(v) => write!(f, "{}:{}#{}", self.host, self.port, v),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Ordered membership snapshot with a monotonically increasing id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub id: u64,
    pub members: BTreeSet<NodeId>,
}

/// Members added and removed between two views
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewDiff {
    pub added: BTreeSet<NodeId>,
    pub removed: BTreeSet<NodeId>,
}

impl ViewDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl View {
    pub fn new(id: u64, members: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            id,
            members: members.into_iter().collect(),
        }
    }

    /// The empty view (no members, id 0)
    pub fn empty() -> Self {
        Self {
            id: 0,
            members: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    /// Compute what changed going from `previous` to `self`
    pub fn diff(&self, previous: &View) -> ViewDiff {
        ViewDiff {
            added: self.members.difference(&previous.members).cloned().collect(),
            removed: previous.members.difference(&self.members).cloned().collect(),
        }
    }

    /// Ring successor of `node` within this view
    ///
    /// Returns the node itself when it is the only member, and `None` when
    /// it is not a member at all.
    pub fn successor(&self, node: &NodeId) -> Option<&NodeId> {
        if !self.contains(node) {
            return None;
        }
        use std::ops::Bound::{Excluded, Unbounded};
        self.members
            .range((Excluded(node), Unbounded))
            .next()
            .or_else(|| self.members.iter().next())
    }

    /// Check whether `candidate` lies strictly between `from` and `to` on the ring
    ///
    /// When `from == to` the arc covers the whole ring except `from` itself.
    pub fn between(from: &NodeId, to: &NodeId, candidate: &NodeId) -> bool {
        if from < to {
            candidate > from && candidate < to
        } else {
            // wrap-around arc (or whole ring when from == to)
            candidate > from || candidate < to
        }
    }
}

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let members: Vec<String> = self.members.iter().map(|m| m.to_string()).collect();
        write!(f, "View#{}[{}]", self.id, members.join(", "))
    }
}
