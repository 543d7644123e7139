//! In-process network
//!
//! Routes envelopes between nodes living in the same process. Every
//! envelope is encoded and decoded on the way through so the wire format
//! is exercised exactly as on TCP. Links can be cut to simulate
//! partitions.

use std::collections::{HashMap, HashSet};
use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use super::{Envelope, Transport};
use crate::error::{Error, Result};
use crate::membership::NodeId;

/// In-process message hub keyed by physical node
#[derive(Default)]
pub struct LocalNetwork {
    inboxes: RwLock<HashMap<NodeId, mpsc::Sender<Envelope>>>,
    /// Directed links that silently drop traffic
    cut: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node's inbound channel
    pub async fn register(&self, node: &NodeId, inbox: mpsc::Sender<Envelope>) {
        self.inboxes.write().await.insert(node.physical(), inbox);
    }

    /// Detach a node
    pub async fn unregister(&self, node: &NodeId) {
        self.inboxes.write().await.remove(&node.physical());
    }

    /// Drop all traffic between `a` and `b` in both directions
    pub async fn partition(&self, a: &NodeId, b: &NodeId) {
        let mut cut = self.cut.write().await;
        cut.insert((a.physical(), b.physical()));
        cut.insert((b.physical(), a.physical()));
    }

    /// Restore traffic between `a` and `b`
    pub async fn heal(&self, a: &NodeId, b: &NodeId) {
        let mut cut = self.cut.write().await;
        cut.remove(&(a.physical(), b.physical()));
        cut.remove(&(b.physical(), a.physical()));
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        let src = envelope.src.physical();
        let dst = envelope.dst.physical();

        if self.cut.read().await.contains(&(src.clone(), dst.clone())) {
            tracing::trace!("Link {} -> {} is cut, dropping {}", src, dst, envelope.message.type_name());
            return Ok(());
        }

        let inbox = self
            .inboxes
            .read()
            .await
            .get(&dst)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(dst.to_string()))?;

        let bytes = envelope.serialize()?;
        let decoded = Envelope::deserialize(&bytes)?;

        inbox
            .send(decoded)
            .await
            .map_err(|_| Error::Network(format!("inbox of {} closed", dst)))
    }
}
