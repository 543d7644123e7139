//! Heartbeat Failure Detector
//!
//! Push-heartbeat liveness oracle. Every round (half the detection timeout)
//! the detector compares the peers it heard from during the last two
//! rounds against the peers it currently believes live, and reports each
//! transition exactly once per subscription: `Suspect` when a live node
//! went quiet, `Restore` when a suspected node was heard again.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::probe::RttEstimator;
use super::NodeId;
use crate::config::DetectorConfig;
use crate::network::{Envelope, Message, Outbox};
use crate::timer::Timers;

/// Liveness subscription identifier
pub type RequestId = u64;

/// Per-node retransmission timeouts learned from probes
pub type RtoMap = HashMap<NodeId, Duration>;

/// Inputs of the failure detector task
#[derive(Debug, Clone)]
pub enum DetectorInput {
    Subscribe { request_id: RequestId, node: NodeId },
    Unsubscribe { request_id: RequestId },
    /// Heartbeat, Ping or Pong from the network
    Inbound(Envelope),
    /// Detection round
    Tick,
}

/// Liveness indications, one per affected subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Suspect { node: NodeId, request_id: RequestId },
    Restore { node: NodeId, request_id: RequestId },
}

impl Liveness {
    pub fn node(&self) -> &NodeId {
        match self {
            Liveness::Suspect { node, .. } | Liveness::Restore { node, .. } => node,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DetectorTimer {
    Round,
}

/// Failure detector state
pub struct FailureDetector {
    self_id: NodeId,
    config: DetectorConfig,
    /// Subscription -> monitored node
    subscriptions: HashMap<RequestId, NodeId>,
    /// Nodes we send heartbeats to every round
    broadcast: BTreeSet<NodeId>,
    /// Subscribed nodes currently believed live
    live: HashSet<NodeId>,
    /// Heard from during the current round
    active: HashSet<NodeId>,
    /// Heard from during the previous round
    last_active: HashSet<NodeId>,
    rtt: HashMap<NodeId, RttEstimator>,
    next_ping: u64,
    clock_origin: Instant,
    rto_tx: watch::Sender<RtoMap>,
    outbox: Outbox,
    indications: mpsc::Sender<Liveness>,
}

impl FailureDetector {
    /// Create a detector; returns it with the receiving end of its RTO map
    pub fn new(
        self_id: NodeId,
        config: DetectorConfig,
        outbox: Outbox,
        indications: mpsc::Sender<Liveness>,
    ) -> (Self, watch::Receiver<RtoMap>) {
        let (rto_tx, rto_rx) = watch::channel(RtoMap::new());
        let detector = Self {
            self_id,
            config,
            subscriptions: HashMap::new(),
            broadcast: BTreeSet::new(),
            live: HashSet::new(),
            active: HashSet::new(),
            last_active: HashSet::new(),
            rtt: HashMap::new(),
            next_ping: 0,
            clock_origin: Instant::now(),
            rto_tx,
            outbox,
            indications,
        };
        (detector, rto_rx)
    }

    /// Heartbeat period: half the detection timeout
    pub fn period(&self) -> Duration {
        self.config.detection_timeout() / 2
    }

    /// Run the detector until cancelled
    pub async fn run(
        mut self,
        inbox_tx: mpsc::Sender<DetectorInput>,
        mut inbox: mpsc::Receiver<DetectorInput>,
        cancel: CancellationToken,
    ) {
        let mut timers: Timers<DetectorTimer, DetectorInput> = Timers::new(inbox_tx);
        timers.schedule_periodic(DetectorTimer::Round, self.period(), DetectorInput::Tick);
        tracing::info!("Failure detector started (period {:?})", self.period());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                input = inbox.recv() => match input {
                    Some(input) => self.handle(input).await,
                    None => break,
                },
            }
        }

        timers.cancel_all();
        tracing::debug!("Failure detector stopped");
    }

    /// Handle a single input
    pub async fn handle(&mut self, input: DetectorInput) {
        match input {
            DetectorInput::Subscribe { request_id, node } => self.subscribe(request_id, node).await,
            DetectorInput::Unsubscribe { request_id } => self.unsubscribe(request_id),
            DetectorInput::Inbound(envelope) => self.on_message(envelope).await,
            DetectorInput::Tick => self.on_tick().await,
        }
    }

    /// Start monitoring `node` under `request_id`
    pub async fn subscribe(&mut self, request_id: RequestId, node: NodeId) {
        tracing::debug!("Liveness subscription {} for {}", request_id, node);
        let monitored = self.subscriptions.values().any(|n| *n == node);
        self.subscriptions.insert(request_id, node.clone());

        if monitored {
            // later subscribers inherit the current verdict
            if !self.live.contains(&node) {
                let _ = self.indications.send(Liveness::Suspect { node, request_id }).await;
            }
            return;
        }

        self.broadcast.insert(node.clone());
        self.live.insert(node.clone());
        // one round of grace before the first verdict
        self.last_active.insert(node.clone());
        self.send(node, Message::Heartbeat).await;
    }

    /// Drop exactly one subscription
    ///
    /// When it was the last one for its node the node also leaves the
    /// broadcast set.
    pub fn unsubscribe(&mut self, request_id: RequestId) {
        let Some(node) = self.subscriptions.remove(&request_id) else {
            tracing::debug!("Unsubscribe for unknown request {}", request_id);
            return;
        };

        if !self.subscriptions.values().any(|n| *n == node) {
            self.broadcast.remove(&node);
            self.live.remove(&node);
            self.rtt.remove(&node);
            self.publish_rto();
        }
    }

    async fn on_message(&mut self, envelope: Envelope) {
        let src = envelope.src;
        match envelope.message {
            Message::Heartbeat => {
                // reply once per round so the sender sees us as well
                if self.active.insert(src.clone()) {
                    self.send(src, Message::Heartbeat).await;
                }
            }
            Message::Ping { id, ts } => {
                self.send(src, Message::Pong { id, ts }).await;
            }
            Message::Pong { ts, .. } => {
                if !self.broadcast.contains(&src) {
                    return;
                }
                let now = self.now_micros();
                let rtt = Duration::from_micros(now.saturating_sub(ts));
                let (k, min_rto) = (self.config.rto_k, self.config.min_rto());
                self.rtt
                    .entry(src)
                    .or_insert_with(|| RttEstimator::new(k, min_rto))
                    .sample(rtt);
                self.publish_rto();
            }
            other => {
                tracing::warn!("Failure detector ignoring {} from {}", other.type_name(), src);
            }
        }
    }

    /// One detection round
    pub async fn on_tick(&mut self) {
        let all_active: HashSet<NodeId> = self.active.union(&self.last_active).cloned().collect();
        let subscribed: HashSet<NodeId> = self.subscriptions.values().cloned().collect();

        let failed: HashSet<NodeId> = self
            .live
            .intersection(&subscribed)
            .filter(|n| !all_active.contains(*n))
            .cloned()
            .collect();
        let restored: HashSet<NodeId> = all_active
            .iter()
            .filter(|n| !self.live.contains(*n) && subscribed.contains(*n))
            .cloned()
            .collect();

        let mut subs: Vec<(RequestId, NodeId)> =
            self.subscriptions.iter().map(|(r, n)| (*r, n.clone())).collect();
        subs.sort();

        for (request_id, node) in subs {
            if failed.contains(&node) {
                tracing::warn!("Suspecting {} (request {})", node, request_id);
                let _ = self.indications.send(Liveness::Suspect { node, request_id }).await;
            } else if restored.contains(&node) {
                tracing::info!("Restoring {} (request {})", node, request_id);
                let _ = self.indications.send(Liveness::Restore { node, request_id }).await;
            }
        }

        self.last_active = std::mem::take(&mut self.active);
        self.live = all_active.intersection(&subscribed).cloned().collect();

        let targets: Vec<NodeId> = self.broadcast.iter().cloned().collect();
        for node in targets {
            self.send(node, Message::Heartbeat).await;
        }

        if self.config.probe {
            let ts = self.now_micros();
            let monitored: BTreeSet<NodeId> = subscribed.into_iter().collect();
            for node in monitored {
                self.next_ping += 1;
                let id = self.next_ping;
                self.send(node, Message::Ping { id, ts }).await;
            }
        }
    }

    /// Subscribed nodes currently believed live
    pub fn live(&self) -> &HashSet<NodeId> {
        &self.live
    }

    pub fn broadcast_set(&self) -> &BTreeSet<NodeId> {
        &self.broadcast
    }

    fn publish_rto(&self) {
        let map: RtoMap = self.rtt.iter().map(|(n, e)| (n.clone(), e.rto())).collect();
        self.rto_tx.send_replace(map);
    }

    fn now_micros(&self) -> u64 {
        self.clock_origin.elapsed().as_micros() as u64
    }

    async fn send(&self, dst: NodeId, message: Message) {
        let envelope = Envelope::new(self.self_id.clone(), dst, message);
        let _ = self.outbox.send(envelope).await;
    }
}
