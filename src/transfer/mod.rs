//! Data Transfer Module
//!
//! Point-to-point bulk transfer of a key range, used to bring a replica
//! that became responsible for a range up to date. The sender serves pages
//! of the range only against quota granted by the receiver:
//!
//! ```text
//! sender                          receiver
//!   InitiateTransfer  ------------->
//!                     <-------------  Ack
//!   RequestToSend     ------------->
//!                     <-------------  ClearToSend{quota}
//!   Data{page}        ------------->
//!                     <-------------  AllReceived
//!   ...                               (until a final page)
//! ```
//!
//! Every frame the sender is waiting on an answer for is retransmitted on a
//! timer, so the protocol survives a lossy transport. The receiver is
//! idempotent against duplicates.

mod receiver;
mod sender;

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::id::IdGenerator;
use crate::keyspace::KeyRange;
use crate::membership::{NodeId, RtoMap};
use crate::network::{Envelope, Message, Outbox};
use crate::store::{KvStore, StoreItem};
use crate::timer::Timers;

use receiver::ReceiverSession;
use sender::SenderSession;

pub use sender::SenderState;

/// Transfer session identifier
pub type SessionId = u64;

/// Ended sessions remembered for dropping late frames
const RECENT_SESSIONS: usize = 1024;

/// Insertion-ordered set that forgets its oldest entries past `capacity`
#[derive(Debug)]
struct RecentSet<T> {
    members: HashSet<T>,
    order: VecDeque<T>,
    capacity: usize,
}

impl<T: Eq + Hash + Clone> RecentSet<T> {
    fn new(capacity: usize) -> Self {
        Self {
            members: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, value: T) {
        if !self.members.insert(value.clone()) {
            return;
        }
        self.order.push_back(value);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.members.remove(&old);
            }
        }
    }

    fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.members.len()
    }
}

/// What a session transfers, sent with the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub range: KeyRange,
    /// View that created the obligation
    pub view_id: u64,
    /// Pages are LZ4 compressed
    pub compressed: bool,
}

/// Requests from the replication engine
#[derive(Debug, Clone)]
pub enum MoverCommand {
    /// Push `range` to `destination`, superseding any session to it
    StartSend {
        destination: NodeId,
        range: KeyRange,
        view_id: u64,
    },
    /// Stop the outbound session to `destination`, if any
    StopSend { destination: NodeId },
    /// Stop every outbound session
    StopAll,
}

/// Indications to the replication engine
#[derive(Debug, Clone, PartialEq)]
pub enum MoverEvent {
    /// An inbound transfer delivered its final page
    TransferComplete {
        session: SessionId,
        source: NodeId,
        metadata: TransferMetadata,
        items: u64,
        bytes: u64,
    },
    /// An outbound transfer reached DONE
    SendFinished {
        session: SessionId,
        destination: NodeId,
        items: u64,
        bytes: u64,
    },
    /// An outbound transfer was abandoned
    SendFailed {
        session: SessionId,
        destination: NodeId,
        reason: String,
    },
}

/// Inputs of the data mover task
#[derive(Debug, Clone)]
pub enum MoverInput {
    Command(MoverCommand),
    /// Transfer frame from the network
    Inbound(Envelope),
    /// Retransmission timer of an outbound session
    Retry { session: SessionId },
}

/// Data mover: both roles of the transfer protocol for one node
pub struct DataMover {
    self_id: NodeId,
    config: TransferConfig,
    store: Arc<dyn KvStore>,
    ids: Arc<IdGenerator>,
    outbox: Outbox,
    events: mpsc::Sender<MoverEvent>,
    /// Per-destination RTO learned by the failure detector
    rto: watch::Receiver<RtoMap>,
    timers: Timers<SessionId, MoverInput>,

    outbound: HashMap<SessionId, SenderSession>,
    by_destination: HashMap<NodeId, SessionId>,
    /// Outbound sessions that reached DONE or were stopped
    finished: RecentSet<SessionId>,
    /// Stopped sessions awaiting teardown after the current input
    teardown: Vec<SessionId>,

    inbound: HashMap<(NodeId, SessionId), ReceiverSession>,
    completed: RecentSet<(NodeId, SessionId)>,
}

impl DataMover {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: NodeId,
        config: TransferConfig,
        store: Arc<dyn KvStore>,
        ids: Arc<IdGenerator>,
        outbox: Outbox,
        events: mpsc::Sender<MoverEvent>,
        rto: watch::Receiver<RtoMap>,
        inbox_tx: mpsc::Sender<MoverInput>,
    ) -> Self {
        Self {
            self_id,
            config,
            store,
            ids,
            outbox,
            events,
            rto,
            timers: Timers::new(inbox_tx),
            outbound: HashMap::new(),
            by_destination: HashMap::new(),
            finished: RecentSet::new(RECENT_SESSIONS),
            teardown: Vec::new(),
            inbound: HashMap::new(),
            completed: RecentSet::new(RECENT_SESSIONS),
        }
    }

    /// Run the data mover until cancelled
    pub async fn run(mut self, mut inbox: mpsc::Receiver<MoverInput>, cancel: CancellationToken) {
        tracing::info!("Data mover started on {}", self.self_id);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                input = inbox.recv() => match input {
                    Some(input) => self.handle(input).await,
                    None => break,
                },
            }
        }
        self.timers.cancel_all();
        tracing::debug!("Data mover stopped");
    }

    /// Handle a single input, then tear down sessions stopped by it
    pub async fn handle(&mut self, input: MoverInput) {
        match input {
            MoverInput::Command(MoverCommand::StartSend {
                destination,
                range,
                view_id,
            }) => self.start_send(destination, range, view_id).await,
            MoverInput::Command(MoverCommand::StopSend { destination }) => {
                if let Some(id) = self.by_destination.get(&destination).copied() {
                    self.stop_session(id, "stopped by engine");
                }
            }
            MoverInput::Command(MoverCommand::StopAll) => {
                let ids: Vec<SessionId> = self.outbound.keys().copied().collect();
                for id in ids {
                    self.stop_session(id, "stopped by engine");
                }
            }
            MoverInput::Inbound(envelope) => self.on_envelope(envelope).await,
            MoverInput::Retry { session } => self.on_retry(session).await,
        }
        self.finish_teardown();
    }

    async fn on_envelope(&mut self, envelope: Envelope) {
        let src = envelope.src;
        match envelope.message {
            // receiver role
            Message::InitiateTransfer { id, metadata } => self.on_initiate(src, id, metadata).await,
            Message::RequestToSend { id } => self.on_request_to_send(src, id).await,
            Message::Data { id, payload, is_final } => self.on_data(src, id, payload, is_final).await,
            // sender role
            Message::Ack { id } => self.on_ack(src, id).await,
            Message::ClearToSend { id, quota } => self.on_clear_to_send(src, id, quota).await,
            Message::AllReceived { id } => self.on_all_received(src, id).await,
            other => {
                tracing::warn!("Data mover ignoring {} from {}", other.type_name(), src);
            }
        }
    }

    /// Number of live outbound sessions
    pub fn outbound_count(&self) -> usize {
        self.outbound.len()
    }

    /// State of the outbound session to `destination`
    pub fn sender_state(&self, destination: &NodeId) -> Option<SenderState> {
        let id = self.by_destination.get(destination)?;
        self.outbound.get(id).map(|s| s.state)
    }

    /// Number of in-progress inbound sessions
    pub fn inbound_count(&self) -> usize {
        self.inbound.len()
    }

    async fn send(&self, dst: NodeId, message: Message) {
        let envelope = Envelope::new(self.self_id.clone(), dst, message);
        let _ = self.outbox.send(envelope).await;
    }

    async fn emit(&self, event: MoverEvent) {
        let _ = self.events.send(event).await;
    }
}

/// Encode a page of items into a frame payload
///
/// An empty page encodes to an empty payload.
pub fn encode_page(items: &[StoreItem], compressed: bool) -> Result<Bytes> {
    if items.is_empty() {
        return Ok(Bytes::new());
    }
    let raw = bincode::serialize(items)?;
    if compressed {
        Ok(Bytes::from(lz4_flex::compress_prepend_size(&raw)))
    } else {
        Ok(Bytes::from(raw))
    }
}

/// Decode a frame payload produced by [`encode_page`]
pub fn decode_page(payload: &[u8], compressed: bool) -> Result<Vec<StoreItem>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    if compressed {
        let raw = lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| Error::Compression(e.to_string()))?;
        Ok(bincode::deserialize(&raw)?)
    } else {
        Ok(bincode::deserialize(payload)?)
    }
}
