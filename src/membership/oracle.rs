//! Leader Oracle (Ω)
//!
//! Trusts the lowest-ordered member of the current view that the failure
//! detector does not suspect. Views come from the replication engine,
//! liveness from the detector; the oracle keeps one detector subscription
//! per remote member.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::detector::{DetectorInput, Liveness, RequestId};
use super::{NodeId, View};
use crate::id::IdGenerator;

/// Inputs of the oracle task
#[derive(Debug, Clone)]
pub enum OracleInput {
    Install(View),
    Liveness(Liveness),
}

/// Leadership indications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleEvent {
    /// A new leader is trusted
    Trust { leader: NodeId, view_id: u64 },
    /// Liveness changed without changing the leader
    LivenessChanged { leader: Option<NodeId> },
}

pub struct LeaderOracle {
    self_id: NodeId,
    view: Option<View>,
    candidates: BTreeSet<NodeId>,
    /// Members currently reported as suspected
    suspected: HashSet<NodeId>,
    leader: Option<NodeId>,
    leader_tx: watch::Sender<Option<NodeId>>,
    /// Member -> detector subscription
    subscriptions: HashMap<NodeId, RequestId>,
    ids: Arc<IdGenerator>,
    detector: mpsc::Sender<DetectorInput>,
    events: mpsc::Sender<OracleEvent>,
}

impl LeaderOracle {
    pub fn new(
        self_id: NodeId,
        ids: Arc<IdGenerator>,
        detector: mpsc::Sender<DetectorInput>,
        events: mpsc::Sender<OracleEvent>,
    ) -> Self {
        Self {
            self_id,
            view: None,
            candidates: BTreeSet::new(),
            suspected: HashSet::new(),
            leader: None,
            leader_tx: watch::channel(None).0,
            subscriptions: HashMap::new(),
            ids,
            detector,
            events,
        }
    }

    /// Run the oracle until cancelled
    pub async fn run(mut self, mut inbox: mpsc::Receiver<OracleInput>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                input = inbox.recv() => match input {
                    Some(OracleInput::Install(view)) => self.install(view).await,
                    Some(OracleInput::Liveness(l)) => self.on_liveness(l).await,
                    None => break,
                },
            }
        }
        tracing::debug!("Leader oracle stopped");
    }

    /// Currently trusted leader
    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    pub fn candidates(&self) -> &BTreeSet<NodeId> {
        &self.candidates
    }

    /// Follow the trusted leader from outside the oracle task
    pub fn watch_leader(&self) -> watch::Receiver<Option<NodeId>> {
        self.leader_tx.subscribe()
    }

    fn set_leader(&mut self, leader: Option<NodeId>) {
        self.leader_tx.send_replace(leader.clone());
        self.leader = leader;
    }

    /// Adopt a new view
    pub async fn install(&mut self, view: View) {
        if view.is_empty() {
            tracing::info!("Leader oracle cleared by empty view {}", view.id);
            let subs: Vec<RequestId> = self.subscriptions.drain().map(|(_, r)| r).collect();
            for request_id in subs {
                let _ = self.detector.send(DetectorInput::Unsubscribe { request_id }).await;
            }
            self.view = None;
            self.candidates.clear();
            self.suspected.clear();
            self.set_leader(None);
            return;
        }

        if let Some(current) = &self.view {
            if view.id <= current.id {
                tracing::debug!("Ignoring stale view {} (current {})", view.id, current.id);
                return;
            }
        }

        let previous = self.view.clone().unwrap_or_else(View::empty);
        let diff = view.diff(&previous);

        for node in diff.added {
            if node == self.self_id {
                continue;
            }
            let request_id = self.ids.next();
            self.subscriptions.insert(node.clone(), request_id);
            let _ = self.detector.send(DetectorInput::Subscribe { request_id, node }).await;
        }
        for node in diff.removed {
            self.suspected.remove(&node);
            if let Some(request_id) = self.subscriptions.remove(&node) {
                let _ = self.detector.send(DetectorInput::Unsubscribe { request_id }).await;
            }
        }

        // retained members stay suspected until the detector restores them
        self.candidates = view
            .members
            .iter()
            .filter(|n| !self.suspected.contains(*n))
            .cloned()
            .collect();
        self.view = Some(view);
        self.set_leader(self.candidates.first().cloned());

        if let (Some(leader), Some(view)) = (self.leader.clone(), self.view.as_ref()) {
            tracing::info!("Trusting {} in view {}", leader, view.id);
            let _ = self.events.send(OracleEvent::Trust { leader, view_id: view.id }).await;
        }
    }

    /// Apply a detector indication
    pub async fn on_liveness(&mut self, liveness: Liveness) {
        let node = liveness.node().clone();
        let request_id = match &liveness {
            Liveness::Suspect { request_id, .. } | Liveness::Restore { request_id, .. } => *request_id,
        };
        if self.subscriptions.get(&node) != Some(&request_id) {
            tracing::debug!("Ignoring liveness for stale subscription {}", request_id);
            return;
        }

        match liveness {
            Liveness::Suspect { .. } => {
                self.suspected.insert(node.clone());
                self.candidates.remove(&node);
            }
            Liveness::Restore { .. } => {
                self.suspected.remove(&node);
                self.candidates.insert(node);
            }
        }

        let leader = self.candidates.first().cloned();
        if leader != self.leader {
            self.set_leader(leader.clone());
            match leader {
                Some(leader) => {
                    let view_id = self.view.as_ref().map(|v| v.id).unwrap_or(0);
                    tracing::info!("Leadership moved to {} in view {}", leader, view_id);
                    let _ = self.events.send(OracleEvent::Trust { leader, view_id }).await;
                }
                None => {
                    let _ = self.events.send(OracleEvent::LivenessChanged { leader: None }).await;
                }
            }
        } else {
            let _ = self.events.send(OracleEvent::LivenessChanged { leader }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> NodeId {
        NodeId::new("10.0.0.1", port)
    }

    struct Harness {
        oracle: LeaderOracle,
        det_rx: mpsc::Receiver<DetectorInput>,
        ev_rx: mpsc::Receiver<OracleEvent>,
    }

    fn harness(me: NodeId) -> Harness {
        let (det_tx, det_rx) = mpsc::channel(64);
        let (ev_tx, ev_rx) = mpsc::channel(64);
        let ids = Arc::new(IdGenerator::with_hash(1));
        Harness {
            oracle: LeaderOracle::new(me, ids, det_tx, ev_tx),
            det_rx,
            ev_rx,
        }
    }

    fn subscription_for(rx: &mut mpsc::Receiver<DetectorInput>, target: &NodeId) -> RequestId {
        let mut found = None;
        while let Ok(input) = rx.try_recv() {
            if let DetectorInput::Subscribe { request_id, node } = input {
                if &node == target {
                    found = Some(request_id);
                }
            }
        }
        found.unwrap()
    }

    #[tokio::test]
    async fn test_leader_failover_and_recovery() {
        let (a, b, c) = (node(1), node(2), node(3));
        let mut h = harness(c.clone());

        h.oracle.install(View::new(1, [a.clone(), b.clone(), c.clone()])).await;
        assert_eq!(
            h.ev_rx.try_recv().unwrap(),
            OracleEvent::Trust { leader: a.clone(), view_id: 1 }
        );
        let sub_a = subscription_for(&mut h.det_rx, &a);

        h.oracle.on_liveness(Liveness::Suspect { node: a.clone(), request_id: sub_a }).await;
        assert_eq!(
            h.ev_rx.try_recv().unwrap(),
            OracleEvent::Trust { leader: b.clone(), view_id: 1 }
        );

        h.oracle.on_liveness(Liveness::Restore { node: a.clone(), request_id: sub_a }).await;
        assert_eq!(
            h.ev_rx.try_recv().unwrap(),
            OracleEvent::Trust { leader: a.clone(), view_id: 1 }
        );
    }

    #[tokio::test]
    async fn test_leader_watch_follows_changes() {
        let (a, b) = (node(1), node(2));
        let mut h = harness(b.clone());
        let mut leader = h.oracle.watch_leader();
        assert_eq!(*leader.borrow(), None);

        h.oracle.install(View::new(1, [a.clone(), b.clone()])).await;
        assert!(leader.has_changed().unwrap());
        assert_eq!(*leader.borrow_and_update(), Some(a.clone()));

        let sub_a = subscription_for(&mut h.det_rx, &a);
        h.oracle.on_liveness(Liveness::Suspect { node: a, request_id: sub_a }).await;
        assert_eq!(*leader.borrow_and_update(), Some(b));

        h.oracle.install(View::new(2, Vec::new())).await;
        assert_eq!(*leader.borrow(), None);
    }

    #[tokio::test]
    async fn test_non_leader_change_reports_liveness() {
        let (a, b) = (node(1), node(2));
        let mut h = harness(a.clone());
        h.oracle.install(View::new(1, [a.clone(), b.clone()])).await;
        h.ev_rx.try_recv().unwrap();
        let sub_b = subscription_for(&mut h.det_rx, &b);

        h.oracle.on_liveness(Liveness::Suspect { node: b, request_id: sub_b }).await;
        assert_eq!(
            h.ev_rx.try_recv().unwrap(),
            OracleEvent::LivenessChanged { leader: Some(a) }
        );
    }

    #[tokio::test]
    async fn test_never_subscribes_to_self() {
        let (a, b) = (node(1), node(2));
        let mut h = harness(a.clone());
        h.oracle.install(View::new(1, [a.clone(), b.clone()])).await;

        let mut subscribed = Vec::new();
        while let Ok(DetectorInput::Subscribe { node, .. }) = h.det_rx.try_recv() {
            subscribed.push(node);
        }
        assert_eq!(subscribed, vec![b]);
    }

    #[tokio::test]
    async fn test_view_change_diffs_subscriptions() {
        let (a, b, c) = (node(1), node(2), node(3));
        let mut h = harness(a.clone());
        h.oracle.install(View::new(1, [a.clone(), b.clone()])).await;
        let sub_b = subscription_for(&mut h.det_rx, &b);

        h.oracle.install(View::new(2, [a.clone(), c.clone()])).await;
        let mut unsubscribed = Vec::new();
        let mut subscribed = Vec::new();
        while let Ok(input) = h.det_rx.try_recv() {
            match input {
                DetectorInput::Subscribe { node, .. } => subscribed.push(node),
                DetectorInput::Unsubscribe { request_id } => unsubscribed.push(request_id),
                _ => {}
            }
        }
        assert_eq!(subscribed, vec![c]);
        assert_eq!(unsubscribed, vec![sub_b]);
    }

    #[tokio::test]
    async fn test_stale_view_ignored() {
        let (a, b) = (node(1), node(2));
        let mut h = harness(b.clone());
        h.oracle.install(View::new(5, [a.clone(), b.clone()])).await;
        h.ev_rx.try_recv().unwrap();

        h.oracle.install(View::new(4, [b.clone()])).await;
        assert!(h.ev_rx.try_recv().is_err());
        assert_eq!(h.oracle.leader(), Some(&a));
    }

    #[tokio::test]
    async fn test_empty_view_clears_state() {
        let (a, b) = (node(1), node(2));
        let mut h = harness(a.clone());
        h.oracle.install(View::new(1, [a.clone(), b.clone()])).await;
        let sub_b = subscription_for(&mut h.det_rx, &b);

        h.oracle.install(View::new(2, Vec::new())).await;
        assert!(h.oracle.leader().is_none());
        assert!(h.oracle.candidates().is_empty());
        assert!(matches!(
            h.det_rx.try_recv().unwrap(),
            DetectorInput::Unsubscribe { request_id } if request_id == sub_b
        ));
    }
}
