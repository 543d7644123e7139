//! Request routing and response correlation

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::stats::{Monitor, StatsCollector};
use super::{ReplyTo, RouterInput, RouterState};
use crate::config::RouterConfig;
use crate::error::Result;
use crate::id::IdGenerator;
use crate::keyspace::{Key, KeyRange};
use crate::membership::{Liveness, NodeId, View};
use crate::network::{Envelope, Message, Outbox};
use crate::ops::{OpId, OpKind, OpResponse, Operation, Response, Target};
use crate::placement::Placement;
use crate::replication::{EngineEvent, EngineInput, EngineState};
use crate::timer::Timers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RouterTimer {
    Stats,
    Forward(OpId),
}

/// A caller waiting for an operation
#[derive(Debug)]
struct PendingOp {
    /// Id the caller knows the operation by
    origin: OpId,
    reply: ReplyTo,
    /// Continue range pages automatically
    paginate: bool,
    /// Items of earlier pages
    collected: Vec<(Key, Vec<u8>)>,
    /// Peer the operation was forwarded to
    forwarded_to: Option<NodeId>,
}

impl PendingOp {
    fn new(origin: OpId, reply: ReplyTo, paginate: bool) -> Self {
        Self {
            origin,
            reply,
            paginate,
            collected: Vec::new(),
            forwarded_to: None,
        }
    }
}

/// Request router for one node
pub struct RequestRouter {
    self_id: NodeId,
    config: RouterConfig,
    state: RouterState,
    view: Option<View>,
    responsibility: Option<KeyRange>,
    suspected: HashSet<NodeId>,

    placement: Arc<dyn Placement>,
    monitor: Arc<dyn Monitor>,
    ids: Arc<IdGenerator>,
    engine: mpsc::Sender<EngineInput>,
    outbox: Outbox,

    /// Operation id (as submitted to the engine or a peer) -> waiting caller
    pending: HashMap<OpId, PendingOp>,
    stats: StatsCollector,
    timers: Timers<RouterTimer, RouterInput>,
}

impl RequestRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: NodeId,
        config: RouterConfig,
        placement: Arc<dyn Placement>,
        monitor: Arc<dyn Monitor>,
        ids: Arc<IdGenerator>,
        engine: mpsc::Sender<EngineInput>,
        outbox: Outbox,
        inbox_tx: mpsc::Sender<RouterInput>,
    ) -> Self {
        let stats = StatsCollector::new(&self_id);
        Self {
            self_id,
            config,
            state: RouterState::Forwarding,
            view: None,
            responsibility: None,
            suspected: HashSet::new(),
            placement,
            monitor,
            ids,
            engine,
            outbox,
            pending: HashMap::new(),
            stats,
            timers: Timers::new(inbox_tx),
        }
    }

    /// Run the router until cancelled
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<RouterInput>,
        mut engine_events: mpsc::Receiver<EngineEvent>,
        cancel: CancellationToken,
    ) {
        let interval = self.config.stats_interval();
        self.timers
            .schedule_periodic(RouterTimer::Stats, interval, RouterInput::StatsTick);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(input) = inbox.recv() => self.handle(input).await,
                Some(event) = engine_events.recv() => self.handle_engine(event).await,
                else => break,
            }
        }

        self.timers.cancel_all();
        tracing::debug!("Request router stopped with {} pending operations", self.pending.len());
    }

    pub fn state(&self) -> RouterState {
        self.state
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub async fn handle(&mut self, input: RouterInput) {
        match input {
            RouterInput::Request { operation, reply } => self.on_request(operation, reply).await,
            RouterInput::Inbound(envelope) => self.on_envelope(envelope).await,
            RouterInput::Liveness(Liveness::Suspect { node, .. }) => {
                self.fail_forwards_to(&node).await;
                self.suspected.insert(node);
            }
            RouterInput::Liveness(Liveness::Restore { node, .. }) => {
                self.suspected.remove(&node);
            }
            RouterInput::StatsTick => self.on_stats_tick().await,
            RouterInput::ForwardTimeout { id } => self.on_forward_timeout(id).await,
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope) {
        match envelope.message {
            Message::Forward { operation, reply_to } => {
                self.on_request(operation, ReplyTo::Remote(reply_to)).await
            }
            Message::Reply { response } => self.on_response(response).await,
            other => {
                tracing::warn!("Router ignoring {} from {}", other.type_name(), envelope.src);
            }
        }
    }

    /// Route a client operation
    pub async fn on_request(&mut self, operation: Operation, reply: ReplyTo) {
        self.stats.record_op();

        if self.pending.contains_key(&operation.id) {
            tracing::debug!("Operation {} already in flight", operation.id);
            return;
        }

        let inside = self.is_inside(&operation);
        match (inside, self.state) {
            (true, RouterState::Active) => {
                let paginate = matches!(operation.kind, OpKind::RangeQuery { limit: None, .. });
                self.pending
                    .insert(operation.id, PendingOp::new(operation.id, reply, paginate));
                let _ = self.engine.send(EngineInput::Submit(operation)).await;
            }
            (true, RouterState::Forwarding) => {
                if matches!(reply, ReplyTo::Remote(_)) {
                    // forwarded to us already; bouncing it again could loop
                    let response = Response::Unavailable("replica is syncing".into());
                    return self.deliver(reply, OpResponse::new(operation.id, response)).await;
                }
                match self.pick_live_member() {
                    Some(peer) => self.forward(peer, operation, reply).await,
                    None => {
                        let response = Response::Unavailable("no live replica".into());
                        self.deliver(reply, OpResponse::new(operation.id, response)).await;
                    }
                }
            }
            (false, _) => {
                let owner = self.placement_owner(&operation).await;
                match owner {
                    Ok(Some(owner)) if owner != self.self_id => self.forward(owner, operation, reply).await,
                    Ok(_) => {
                        let response = Response::Unavailable("no owner for operation".into());
                        self.deliver(reply, OpResponse::new(operation.id, response)).await;
                    }
                    Err(e) => {
                        tracing::warn!("Placement lookup for {} failed: {}", operation.id, e);
                        let response = Response::Unavailable(e.to_string());
                        self.deliver(reply, OpResponse::new(operation.id, response)).await;
                    }
                }
            }
        }
    }

    /// Check whether the operation falls inside this replica's responsibility
    fn is_inside(&self, operation: &Operation) -> bool {
        let Some(responsibility) = &self.responsibility else {
            return false;
        };
        match operation.target() {
            Target::Key(key) => responsibility.contains(key),
            Target::Range(range) => responsibility.covers(range),
            // nothing to place by; the local engine answers it
            Target::Unrouted => true,
        }
    }

    async fn placement_owner(&self, operation: &Operation) -> Result<Option<NodeId>> {
        match operation.target() {
            Target::Key(key) => self.placement.owner_of(key).await,
            Target::Range(range) => Ok(self.placement.owners_of(range).await?.into_iter().next()),
            Target::Unrouted => Ok(None),
        }
    }

    /// Arbitrary unsuspected member of the view other than this node
    fn pick_live_member(&self) -> Option<NodeId> {
        let view = self.view.as_ref()?;
        let live: Vec<&NodeId> = view
            .members
            .iter()
            .filter(|n| **n != self.self_id && !self.suspected.contains(*n))
            .collect();
        live.choose(&mut rand::thread_rng()).map(|n| (*n).clone())
    }

    async fn forward(&mut self, peer: NodeId, operation: Operation, reply: ReplyTo) {
        tracing::trace!("Forwarding {} {} to {}", operation.type_name(), operation.id, peer);
        let id = operation.id;
        let mut pending = PendingOp::new(id, reply, false);
        pending.forwarded_to = Some(peer.clone());
        self.pending.insert(id, pending);
        self.timers.schedule_once(
            RouterTimer::Forward(id),
            self.config.forward_timeout(),
            RouterInput::ForwardTimeout { id },
        );
        let message = Message::Forward {
            operation,
            reply_to: self.self_id.clone(),
        };
        let _ = self
            .outbox
            .send(Envelope::new(self.self_id.clone(), peer, message))
            .await;
    }

    pub async fn handle_engine(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ViewInstalled {
                view,
                responsibility,
                state,
            } => {
                tracing::debug!("Router adopting view {} (engine {})", view.id, state);
                self.suspected.retain(|n| view.contains(n));
                self.view = Some(view);
                self.responsibility = Some(responsibility);
                if state != EngineState::Ready {
                    self.set_state(RouterState::Forwarding);
                }
            }
            EngineEvent::Synced { view_id } => {
                tracing::info!("Replica synced in view {}", view_id);
                self.set_state(RouterState::Active);
            }
            EngineEvent::Response(response) => {
                // only writes applied by this replica change its store
                self.stats.record_delta(response.delta);
                self.on_response(response).await
            }
        }
    }

    /// Match a response to its caller, continuing paginated range queries
    async fn on_response(&mut self, response: OpResponse) {
        let delta = response.delta;
        let Some(mut pending) = self.pending.remove(&response.id) else {
            tracing::trace!("No caller waiting for operation {}", response.id);
            return;
        };
        if pending.forwarded_to.is_some() {
            self.timers.cancel(&RouterTimer::Forward(response.id));
        }

        let response = match response.response {
            Response::Range { items, remaining } => {
                pending.collected.extend(items);
                match remaining {
                    Some(rest) if pending.paginate => {
                        let next_id = self.ids.next();
                        tracing::trace!("Continuing range query {} as {}", pending.origin, next_id);
                        let next = Operation::new(next_id, OpKind::RangeQuery { range: rest, limit: None });
                        self.pending.insert(next_id, pending);
                        let _ = self.engine.send(EngineInput::Submit(next)).await;
                        return;
                    }
                    remaining => Response::Range {
                        items: std::mem::take(&mut pending.collected),
                        remaining,
                    },
                }
            }
            other => other,
        };

        let reply = OpResponse {
            id: pending.origin,
            response,
            delta,
        };
        self.deliver(pending.reply, reply).await;
    }

    /// No answer from the peer within the forward timeout
    async fn on_forward_timeout(&mut self, id: OpId) {
        let Some(peer) = self.pending.get(&id).and_then(|p| p.forwarded_to.clone()) else {
            return;
        };
        if let Some(pending) = self.pending.remove(&id) {
            tracing::debug!("Forward of {} to {} timed out", id, peer);
            let response = Response::Unavailable(format!("no answer from {}", peer));
            self.deliver(pending.reply, OpResponse::new(pending.origin, response)).await;
        }
    }

    /// Answer every operation waiting on a suspected peer
    async fn fail_forwards_to(&mut self, node: &NodeId) {
        let ids: Vec<OpId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.forwarded_to.as_ref() == Some(node))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.timers.cancel(&RouterTimer::Forward(id));
            if let Some(pending) = self.pending.remove(&id) {
                tracing::debug!("Failing forward of {} to suspected {}", id, node);
                let response = Response::Unavailable(format!("{} is suspected", node));
                self.deliver(pending.reply, OpResponse::new(pending.origin, response)).await;
            }
        }
    }

    async fn deliver(&self, reply: ReplyTo, response: OpResponse) {
        match reply {
            ReplyTo::Local(tx) => {
                let _ = tx.send(response).await;
            }
            ReplyTo::Remote(node) => {
                let message = Message::Reply { response };
                let _ = self
                    .outbox
                    .send(Envelope::new(self.self_id.clone(), node, message))
                    .await;
            }
        }
    }

    async fn on_stats_tick(&mut self) {
        let report = self.stats.tick(Instant::now());
        if let Err(e) = self.monitor.report(report).await {
            tracing::warn!("Stats report failed: {}", e);
        }
    }

    fn set_state(&mut self, state: RouterState) {
        if self.state != state {
            tracing::info!("Router state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}
