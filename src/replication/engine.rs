//! Replication Engine Implementation
//!
//! Turns the decided log into local state: operations run against the
//! store strictly in log position order, and a decided view change installs
//! the new view, hands it to the leader oracle, and starts the range
//! transfers this replica owes to members that just joined.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{EngineEvent, EngineInput, EngineState};
use crate::config::ReplicationConfig;
use crate::consensus::{LogIndication, LogRequest, Position, Reconfigure, Value};
use crate::error::{Error, Result};
use crate::membership::{NodeId, OracleEvent, OracleInput, View};
use crate::ops::{OpId, OpKind, OpResponse, Operation, Response, Target};
use crate::store::{KvStore, ReadFilter, ScanLimit, StoreDelta};
use crate::transfer::{MoverCommand, MoverEvent, MoverInput};

/// Replication engine for one replica
pub struct ReplicationEngine {
    self_id: NodeId,
    config: ReplicationConfig,
    state: EngineState,
    store: Arc<dyn KvStore>,

    /// Outputs
    log: mpsc::Sender<LogRequest>,
    oracle: mpsc::Sender<OracleInput>,
    mover: mpsc::Sender<MoverInput>,
    events: mpsc::Sender<EngineEvent>,

    /// Installed configuration
    installed: Option<Reconfigure>,
    /// Next log position to apply
    next_apply: Position,
    /// Decided values waiting for a gap to close
    held: BTreeMap<Position, Value>,
    applied_since_prune: u64,

    /// Recently executed operation ids, oldest first
    executed: HashSet<OpId>,
    executed_order: VecDeque<OpId>,

    /// Leader currently trusted by the oracle
    leader: Option<NodeId>,
    /// View whose range transfer this replica is waiting for
    awaiting_transfer: Option<u64>,
    /// Decided operations held until that transfer lands, in log order
    deferred: Vec<Operation>,
}

impl ReplicationEngine {
    pub fn new(
        self_id: NodeId,
        config: ReplicationConfig,
        store: Arc<dyn KvStore>,
        log: mpsc::Sender<LogRequest>,
        oracle: mpsc::Sender<OracleInput>,
        mover: mpsc::Sender<MoverInput>,
        events: mpsc::Sender<EngineEvent>,
    ) -> Self {
        Self {
            self_id,
            config,
            state: EngineState::Passive,
            store,
            log,
            oracle,
            mover,
            events,
            installed: None,
            next_apply: 1,
            held: BTreeMap::new(),
            applied_since_prune: 0,
            executed: HashSet::new(),
            executed_order: VecDeque::new(),
            leader: None,
            awaiting_transfer: None,
            deferred: Vec::new(),
        }
    }

    /// Run the engine until cancelled
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<EngineInput>,
        mut decisions: mpsc::Receiver<LogIndication>,
        mut oracle_events: mpsc::Receiver<OracleEvent>,
        mut mover_events: mpsc::Receiver<MoverEvent>,
        cancel: CancellationToken,
    ) {
        tracing::info!("Replication engine started on {} ({})", self.self_id, self.state);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(indication) = decisions.recv() => {
                    let LogIndication::Decide { position, value } = indication;
                    self.handle_decide(position, value).await;
                }
                Some(input) = inbox.recv() => self.handle_input(input).await,
                Some(event) = oracle_events.recv() => self.handle_oracle(event),
                Some(event) = mover_events.recv() => self.handle_mover(event).await,
                else => break,
            }
        }
        tracing::debug!("Replication engine stopped at position {}", self.next_apply);
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Installed view, if any
    pub fn view(&self) -> Option<&View> {
        self.installed.as_ref().map(|r| &r.view)
    }

    pub fn installed(&self) -> Option<&Reconfigure> {
        self.installed.as_ref()
    }

    /// Next log position to apply
    pub fn next_position(&self) -> Position {
        self.next_apply
    }

    fn is_leader(&self) -> bool {
        self.leader.as_ref() == Some(&self.self_id)
    }

    /// Install a bootstrap configuration without going through the log
    pub async fn bootstrap(&mut self, reconfigure: Reconfigure) {
        tracing::info!("Bootstrapping with view {}", reconfigure.view);
        self.on_reconfigure(reconfigure).await;
    }

    /// Handle a client submission or a view-change proposal
    pub async fn handle_input(&mut self, input: EngineInput) {
        match input {
            EngineInput::Submit(operation) => {
                if self.state == EngineState::Passive {
                    let response = Response::Unavailable("no view installed".into());
                    self.respond(OpResponse::new(operation.id, response)).await;
                    return;
                }
                tracing::trace!("Proposing {} {}", operation.type_name(), operation.id);
                let _ = self.log.send(LogRequest::Propose(Value::Op(operation))).await;
            }
            EngineInput::ProposeReconfigure(reconfigure) => {
                if let Err(e) = self.propose_reconfigure(reconfigure).await {
                    tracing::warn!("Reconfiguration not proposed: {}", e);
                }
            }
        }
    }

    async fn propose_reconfigure(&mut self, reconfigure: Reconfigure) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }
        if let Some(current) = &self.installed {
            if reconfigure.view.id <= current.view.id {
                return Err(Error::StaleView {
                    proposed: reconfigure.view.id,
                    current: current.view.id,
                });
            }
        }
        tracing::info!("Proposing view {}", reconfigure.view);
        self.log
            .send(LogRequest::Propose(Value::Reconfigure(reconfigure)))
            .await?;
        Ok(())
    }

    /// Buffer a decided value and apply everything that is now contiguous
    pub async fn handle_decide(&mut self, position: Position, value: Value) {
        if position < self.next_apply {
            tracing::debug!("Skipping already applied position {} (next={})", position, self.next_apply);
            return;
        }
        self.held.insert(position, value);

        while let Some(value) = self.held.remove(&self.next_apply) {
            tracing::trace!("Applying {} at position {}", value.type_name(), self.next_apply);
            self.apply(value).await;
            self.next_apply += 1;
            self.applied_since_prune += 1;

            if self.applied_since_prune >= self.config.prune_interval {
                self.applied_since_prune = 0;
                let _ = self.log.send(LogRequest::Prune(self.next_apply)).await;
            }
        }
    }

    async fn apply(&mut self, value: Value) {
        match value {
            Value::Noop => {}
            Value::Reconfigure(reconfigure) => self.on_reconfigure(reconfigure).await,
            // a page arriving later must not overwrite this write
            Value::Op(operation) if self.awaiting_transfer.is_some() => {
                tracing::trace!("Deferring {} until the range transfer completes", operation.id);
                self.deferred.push(operation);
            }
            Value::Op(operation) => {
                let response = self.execute(operation).await;
                self.respond(response).await;
            }
        }
    }

    /// Execute the operations decided while the transfer was in flight
    async fn replay_deferred(&mut self) {
        let deferred = std::mem::take(&mut self.deferred);
        if !deferred.is_empty() {
            tracing::debug!("Replaying {} deferred operations", deferred.len());
        }
        for operation in deferred {
            let response = self.execute(operation).await;
            self.respond(response).await;
        }
    }

    /// Answer deferred operations that will never run here
    async fn abandon_deferred(&mut self, reason: &str) {
        for operation in std::mem::take(&mut self.deferred) {
            let response = Response::Unavailable(reason.to_string());
            self.respond(OpResponse::new(operation.id, response)).await;
        }
    }

    /// Execute a decided operation, at most once per id
    async fn execute(&mut self, operation: Operation) -> OpResponse {
        let id = operation.id;
        if self.executed.contains(&id) {
            tracing::debug!("Operation {} already executed", id);
            return OpResponse::new(id, Response::Duplicate);
        }

        let Some(installed) = &self.installed else {
            return OpResponse::new(id, Response::Unavailable("no view installed".into()));
        };
        let inside = match operation.target() {
            Target::Key(key) => installed.responsibility.contains(key),
            Target::Range(range) => installed.responsibility.covers(range),
            Target::Unrouted => true,
        };
        if !inside {
            return OpResponse::new(id, Response::Unavailable("outside responsibility".into()));
        }
        // only operations that reach the store count as executed
        self.remember(id);

        let mut delta = StoreDelta::default();
        let result = match operation.kind {
            OpKind::Get { key } => self.store.get(&key).await.map(Response::Value),
            OpKind::Put { key, value } => self.store.put(key, value).await.map(|d| {
                delta = d;
                Response::Written
            }),
            OpKind::Delete { key } => self.store.delete(&key).await.map(|d| {
                delta = d;
                Response::Deleted
            }),
            OpKind::RangeQuery { range, limit } => self.range_query(range, limit).await,
            OpKind::Other { name, .. } => {
                tracing::warn!("Unsupported operation {} ({})", id, name);
                Ok(Response::Unsupported(name))
            }
        };

        match result {
            Ok(response) => OpResponse {
                id,
                response,
                delta,
            },
            Err(e) => {
                tracing::error!("Operation {} failed: {}", id, e);
                OpResponse::new(id, Response::Failed(e.to_string()))
            }
        }
    }

    async fn range_query(&self, range: crate::keyspace::KeyRange, limit: Option<usize>) -> Result<Response> {
        let scan_limit = ScanLimit {
            max_items: Some(limit.unwrap_or(self.config.page_items)),
            max_bytes: Some(self.config.page_bytes),
        };
        let page = self.store.scan(&range, scan_limit, ReadFilter::SkipTombstones).await?;

        // a capped query never continues
        let remaining = match (limit, page.more, page.last_key()) {
            (None, true, Some(last)) => Some(range.after(last)),
            _ => None,
        };
        let items = page
            .items
            .into_iter()
            .filter_map(|item| item.value.map(|v| (item.key, v)))
            .collect();
        Ok(Response::Range { items, remaining })
    }

    fn remember(&mut self, id: OpId) {
        self.executed.insert(id);
        self.executed_order.push_back(id);
        while self.executed_order.len() > self.config.dedup_window {
            if let Some(old) = self.executed_order.pop_front() {
                self.executed.remove(&old);
            }
        }
    }

    /// Install a decided view change
    async fn on_reconfigure(&mut self, reconfigure: Reconfigure) {
        if let Some(current) = &self.installed {
            if reconfigure.view.id <= current.view.id {
                tracing::debug!(
                    "Ignoring stale view {} (installed {})",
                    reconfigure.view.id,
                    current.view.id
                );
                return;
            }
        }

        let previous = self.installed.take();
        let member = reconfigure.view.contains(&self.self_id);
        let was_member = previous
            .as_ref()
            .map(|p| p.view.contains(&self.self_id))
            .unwrap_or(false);
        tracing::info!("Installing view {} (member={})", reconfigure.view, member);

        if let Some(previous) = &previous {
            if was_member {
                self.reassign_transfers(previous, &reconfigure, member).await;
            }
        }

        let _ = self.oracle.send(OracleInput::Install(reconfigure.view.clone())).await;
        let view_id = reconfigure.view.id;
        let fresh = reconfigure.version_id == 0 || reconfigure.view.len() == 1;
        self.installed = Some(reconfigure);

        if !member {
            self.awaiting_transfer = None;
            self.abandon_deferred("replica removed from view").await;
            self.set_state(EngineState::Passive);
        } else if !was_member {
            if self.state == EngineState::Passive {
                self.set_state(EngineState::Syncing);
            }
            if fresh {
                self.awaiting_transfer = None;
            } else {
                self.awaiting_transfer = Some(view_id);
            }
        }

        self.announce_view().await;
        if member && self.state == EngineState::Syncing && self.awaiting_transfer.is_none() {
            self.mark_ready().await;
        }
    }

    /// Start the transfers owed to newly added members, stop those to removed ones
    async fn reassign_transfers(&mut self, previous: &Reconfigure, next: &Reconfigure, member: bool) {
        if !member {
            let _ = self.mover.send(MoverInput::Command(MoverCommand::StopAll)).await;
            return;
        }

        let diff = next.view.diff(&previous.view);
        for node in &diff.removed {
            let _ = self
                .mover
                .send(MoverInput::Command(MoverCommand::StopSend {
                    destination: node.clone(),
                }))
                .await;
        }

        if next.version_id == 0 {
            return;
        }
        for peer in newly_responsible(&self.self_id, &previous.view, &next.view) {
            tracing::info!("Now responsible for syncing {} in view {}", peer, next.view.id);
            let _ = self
                .mover
                .send(MoverInput::Command(MoverCommand::StartSend {
                    destination: peer,
                    range: next.responsibility.clone(),
                    view_id: next.view.id,
                }))
                .await;
        }
    }

    /// Track the leader trusted by the oracle
    pub fn handle_oracle(&mut self, event: OracleEvent) {
        match event {
            OracleEvent::Trust { leader, view_id } => {
                tracing::debug!("Oracle trusts {} in view {}", leader, view_id);
                self.leader = Some(leader);
            }
            OracleEvent::LivenessChanged { leader } => self.leader = leader,
        }
    }

    pub async fn handle_mover(&mut self, event: MoverEvent) {
        match event {
            MoverEvent::TransferComplete {
                source,
                metadata,
                items,
                ..
            } => {
                let Some(awaited) = self.awaiting_transfer else {
                    tracing::debug!("Unexpected transfer from {} completed", source);
                    return;
                };
                let covers = self
                    .installed
                    .as_ref()
                    .map(|r| metadata.range.covers(&r.responsibility))
                    .unwrap_or(false);
                if metadata.view_id < awaited || !covers {
                    tracing::debug!("Transfer from {} for view {} does not satisfy view {}", source, metadata.view_id, awaited);
                    return;
                }
                tracing::info!("Received {} items from {}", items, source);
                self.awaiting_transfer = None;
                self.replay_deferred().await;
                if self.state == EngineState::Syncing {
                    self.mark_ready().await;
                }
            }
            MoverEvent::SendFinished { destination, items, .. } => {
                tracing::info!("Synced {} with {} items", destination, items);
            }
            MoverEvent::SendFailed {
                destination, reason, ..
            } => {
                tracing::warn!("Sync of {} failed: {}", destination, reason);
            }
        }
    }

    async fn mark_ready(&mut self) {
        self.set_state(EngineState::Ready);
        if let Some(installed) = &self.installed {
            let view_id = installed.view.id;
            let _ = self.events.send(EngineEvent::Synced { view_id }).await;
        }
    }

    async fn announce_view(&self) {
        if let Some(installed) = &self.installed {
            let _ = self
                .events
                .send(EngineEvent::ViewInstalled {
                    view: installed.view.clone(),
                    responsibility: installed.responsibility.clone(),
                    state: self.state,
                })
                .await;
        }
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            tracing::info!("Replication state {} -> {}", self.state, state);
            self.state = state;
        }
    }

    async fn respond(&self, response: OpResponse) {
        let _ = self.events.send(EngineEvent::Response(response)).await;
    }
}

/// Members added in `next` that lie between `me` and its successor in `previous`
///
/// Every added member falls into exactly one such arc, so exactly one old
/// member owes it a transfer. A previous view holding only `me` covers the
/// whole ring.
pub fn newly_responsible(me: &NodeId, previous: &View, next: &View) -> Vec<NodeId> {
    let Some(successor) = previous.successor(me) else {
        return Vec::new();
    };
    next.diff(previous)
        .added
        .into_iter()
        .filter(|n| n != me && View::between(me, successor, n))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::KeyRange;
    use crate::store::MemStore;

    fn node(name: &str) -> NodeId {
        NodeId::new(name, 7000)
    }

    struct Harness {
        engine: ReplicationEngine,
        store: Arc<MemStore>,
        log_rx: mpsc::Receiver<LogRequest>,
        oracle_rx: mpsc::Receiver<OracleInput>,
        mover_rx: mpsc::Receiver<MoverInput>,
        events_rx: mpsc::Receiver<EngineEvent>,
    }

    fn harness(me: &str, config: ReplicationConfig) -> Harness {
        let store = Arc::new(MemStore::new());
        let (log_tx, log_rx) = mpsc::channel(64);
        let (oracle_tx, oracle_rx) = mpsc::channel(64);
        let (mover_tx, mover_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);
        let engine = ReplicationEngine::new(
            node(me),
            config,
            store.clone(),
            log_tx,
            oracle_tx,
            mover_tx,
            events_tx,
        );
        Harness {
            engine,
            store,
            log_rx,
            oracle_rx,
            mover_rx,
            events_rx,
        }
    }

    fn reconfig(id: u64, members: &[&str], version_id: u64) -> Reconfigure {
        Reconfigure {
            view: View::new(id, members.iter().map(|m| node(m))),
            quorum: members.len() / 2 + 1,
            version_id,
            responsibility: KeyRange::full(),
        }
    }

    fn put(id: OpId, key: &str, value: &str) -> Value {
        Value::Op(Operation::new(
            id,
            OpKind::Put {
                key: key.as_bytes().to_vec(),
                value: value.as_bytes().to_vec(),
            },
        ))
    }

    fn drain<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(v) = rx.try_recv() {
            out.push(v);
        }
        out
    }

    fn responses(rx: &mut mpsc::Receiver<EngineEvent>) -> Vec<OpResponse> {
        drain(rx)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Response(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn started_sends(rx: &mut mpsc::Receiver<MoverInput>) -> Vec<NodeId> {
        drain(rx)
            .into_iter()
            .filter_map(|i| match i {
                MoverInput::Command(MoverCommand::StartSend { destination, .. }) => Some(destination),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_bootstrap_goes_ready() {
        let mut h = harness("a", ReplicationConfig::default());
        assert_eq!(h.engine.state(), EngineState::Passive);

        h.engine.bootstrap(reconfig(1, &["a", "b"], 0)).await;
        assert_eq!(h.engine.state(), EngineState::Ready);
        assert!(matches!(h.oracle_rx.try_recv().unwrap(), OracleInput::Install(v) if v.id == 1));

        let events = drain(&mut h.events_rx);
        assert!(matches!(events[0], EngineEvent::ViewInstalled { .. }));
        assert_eq!(events[1], EngineEvent::Synced { view_id: 1 });
    }

    #[tokio::test]
    async fn test_applies_in_position_order() {
        let mut h = harness("a", ReplicationConfig::default());
        h.engine.bootstrap(reconfig(1, &["a"], 0)).await;
        drain(&mut h.events_rx);

        h.engine.handle_decide(2, put(11, "k", "second")).await;
        assert_eq!(h.store.get(b"k").await.unwrap(), None);
        assert_eq!(h.engine.next_position(), 1);

        h.engine.handle_decide(1, put(10, "k", "first")).await;
        assert_eq!(h.store.get(b"k").await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(h.engine.next_position(), 3);

        let ids: Vec<OpId> = responses(&mut h.events_rx).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![10, 11]);

        // a replayed decision is ignored
        h.engine.handle_decide(1, put(10, "k", "first")).await;
        assert!(responses(&mut h.events_rx).is_empty());
    }

    #[tokio::test]
    async fn test_operation_executes_at_most_once() {
        let mut h = harness("a", ReplicationConfig::default());
        h.engine.bootstrap(reconfig(1, &["a"], 0)).await;
        drain(&mut h.events_rx);

        h.engine.handle_decide(1, put(42, "k", "v")).await;
        h.engine.handle_decide(2, put(42, "k", "v")).await;

        let got = responses(&mut h.events_rx);
        assert_eq!(got[0].response, Response::Written);
        assert_eq!(got[0].delta, StoreDelta { bytes: 2, keys: 1 });
        assert_eq!(got[1].response, Response::Duplicate);
        assert_eq!(got[1].delta, StoreDelta::default());
    }

    #[tokio::test]
    async fn test_dedup_window_is_bounded() {
        let config = ReplicationConfig {
            dedup_window: 2,
            ..ReplicationConfig::default()
        };
        let mut h = harness("a", config);
        h.engine.bootstrap(reconfig(1, &["a"], 0)).await;
        drain(&mut h.events_rx);

        for (pos, id) in [(1, 1), (2, 2), (3, 3), (4, 1)] {
            h.engine.handle_decide(pos, put(id, "k", "v")).await;
        }
        let got = responses(&mut h.events_rx);
        assert!(got.iter().all(|r| r.response == Response::Written));
    }

    #[tokio::test]
    async fn test_unsupported_operation() {
        let mut h = harness("a", ReplicationConfig::default());
        h.engine.bootstrap(reconfig(1, &["a"], 0)).await;
        drain(&mut h.events_rx);

        let op = Operation::new(
            5,
            OpKind::Other {
                name: "cas".into(),
                payload: vec![],
            },
        );
        h.engine.handle_decide(1, Value::Op(op)).await;
        assert_eq!(
            responses(&mut h.events_rx)[0].response,
            Response::Unsupported("cas".into())
        );
    }

    #[tokio::test]
    async fn test_range_query_pages() {
        let config = ReplicationConfig {
            page_items: 2,
            ..ReplicationConfig::default()
        };
        let mut h = harness("a", config);
        h.engine.bootstrap(reconfig(1, &["a"], 0)).await;
        for k in ["a", "b", "c", "d", "e"] {
            h.store.put(k.as_bytes().to_vec(), b"v".to_vec()).await.unwrap();
        }
        h.store.delete(b"b").await.unwrap();
        drain(&mut h.events_rx);

        let range = KeyRange::half_open(b"a".to_vec(), b"z".to_vec());
        let query = |id, limit| {
            Value::Op(Operation::new(
                id,
                OpKind::RangeQuery {
                    range: range.clone(),
                    limit,
                },
            ))
        };
        h.engine.handle_decide(1, query(1, None)).await;
        h.engine.handle_decide(2, query(2, Some(2))).await;

        let got = responses(&mut h.events_rx);
        match &got[0].response {
            Response::Range { items, remaining } => {
                let keys: Vec<&[u8]> = items.iter().map(|(k, _)| k.as_slice()).collect();
                assert_eq!(keys, vec![b"a".as_slice(), b"c".as_slice()]);
                assert_eq!(remaining.as_ref(), Some(&range.after(b"c")));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &got[1].response {
            Response::Range { items, remaining } => {
                assert_eq!(items.len(), 2);
                assert!(remaining.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_view_changes_nothing() {
        let mut h = harness("a", ReplicationConfig::default());
        h.engine.bootstrap(reconfig(5, &["a", "b"], 0)).await;
        drain(&mut h.oracle_rx);
        drain(&mut h.events_rx);

        h.engine.handle_decide(1, Value::Reconfigure(reconfig(5, &["a"], 0))).await;
        h.engine.handle_decide(2, Value::Reconfigure(reconfig(3, &["b"], 0))).await;

        assert_eq!(h.engine.view().unwrap().len(), 2);
        assert_eq!(h.engine.state(), EngineState::Ready);
        assert!(h.oracle_rx.try_recv().is_err());
        assert!(h.events_rx.try_recv().is_err());
        assert!(h.mover_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_newly_responsible_peers() {
        // a's old successor is c, so a owes b; c owes d (wrap-around)
        let mut h = harness("a", ReplicationConfig::default());
        h.engine.bootstrap(reconfig(1, &["a", "c"], 1)).await;
        h.engine
            .handle_decide(1, Value::Reconfigure(reconfig(2, &["a", "b", "c", "d"], 1)))
            .await;
        assert_eq!(started_sends(&mut h.mover_rx), vec![node("b")]);

        let previous = View::new(1, [node("a"), node("c")]);
        let next = View::new(2, [node("a"), node("b"), node("c"), node("d")]);
        assert_eq!(newly_responsible(&node("c"), &previous, &next), vec![node("d")]);
    }

    #[tokio::test]
    async fn test_single_member_owes_every_joiner() {
        let mut h = harness("b", ReplicationConfig::default());
        h.engine.bootstrap(reconfig(1, &["b"], 1)).await;
        h.engine
            .handle_decide(1, Value::Reconfigure(reconfig(2, &["a", "b", "c"], 1)))
            .await;
        assert_eq!(started_sends(&mut h.mover_rx), vec![node("a"), node("c")]);
    }

    #[tokio::test]
    async fn test_fresh_range_needs_no_transfer() {
        let mut h = harness("a", ReplicationConfig::default());
        h.engine.bootstrap(reconfig(1, &["a"], 0)).await;
        h.engine
            .handle_decide(1, Value::Reconfigure(reconfig(2, &["a", "b"], 0)))
            .await;
        assert!(started_sends(&mut h.mover_rx).is_empty());
    }

    #[tokio::test]
    async fn test_joiner_syncs_then_ready() {
        let mut h = harness("b", ReplicationConfig::default());
        h.engine
            .handle_decide(1, Value::Reconfigure(reconfig(2, &["a", "b"], 1)))
            .await;
        assert_eq!(h.engine.state(), EngineState::Syncing);
        assert!(!drain(&mut h.events_rx).iter().any(|e| matches!(e, EngineEvent::Synced { .. })));

        h.engine
            .handle_mover(MoverEvent::TransferComplete {
                session: 9,
                source: node("a"),
                metadata: crate::transfer::TransferMetadata {
                    range: KeyRange::full(),
                    view_id: 2,
                    compressed: true,
                },
                items: 10,
                bytes: 10,
            })
            .await;
        assert_eq!(h.engine.state(), EngineState::Ready);
        assert_eq!(h.events_rx.try_recv().unwrap(), EngineEvent::Synced { view_id: 2 });
    }

    fn transfer_complete(view_id: u64) -> MoverEvent {
        MoverEvent::TransferComplete {
            session: 9,
            source: node("a"),
            metadata: crate::transfer::TransferMetadata {
                range: KeyRange::full(),
                view_id,
                compressed: true,
            },
            items: 1,
            bytes: 3,
        }
    }

    #[tokio::test]
    async fn test_writes_during_sync_survive_transferred_pages() {
        let mut h = harness("b", ReplicationConfig::default());
        h.engine
            .handle_decide(1, Value::Reconfigure(reconfig(2, &["a", "b"], 1)))
            .await;
        drain(&mut h.events_rx);

        h.engine.handle_decide(2, put(20, "k", "new")).await;
        assert!(responses(&mut h.events_rx).is_empty());
        assert_eq!(h.store.get(b"k").await.unwrap(), None);

        // the page from the old owner lands after the write was decided
        h.store.put(b"k".to_vec(), b"old".to_vec()).await.unwrap();
        h.engine.handle_mover(transfer_complete(2)).await;

        assert_eq!(h.store.get(b"k").await.unwrap(), Some(b"new".to_vec()));
        let events = drain(&mut h.events_rx);
        assert!(matches!(
            &events[0],
            EngineEvent::Response(r) if r.id == 20 && r.response == Response::Written
        ));
        assert_eq!(events[1], EngineEvent::Synced { view_id: 2 });

        // later decisions run immediately
        h.engine.handle_decide(3, put(21, "k", "newer")).await;
        assert_eq!(h.store.get(b"k").await.unwrap(), Some(b"newer".to_vec()));
    }

    #[tokio::test]
    async fn test_deferred_operations_answered_on_removal() {
        let mut h = harness("b", ReplicationConfig::default());
        h.engine
            .handle_decide(1, Value::Reconfigure(reconfig(2, &["a", "b"], 1)))
            .await;
        h.engine.handle_decide(2, put(20, "k", "v")).await;
        drain(&mut h.events_rx);

        h.engine
            .handle_decide(3, Value::Reconfigure(reconfig(3, &["a"], 1)))
            .await;
        let got = responses(&mut h.events_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, 20);
        assert!(matches!(got[0].response, Response::Unavailable(_)));
        assert_eq!(h.store.get(b"k").await.unwrap(), None);

        // a late transfer does not resurrect them
        h.engine.handle_mover(transfer_complete(2)).await;
        assert!(responses(&mut h.events_rx).is_empty());
    }

    #[tokio::test]
    async fn test_rejected_operation_may_run_later() {
        let mut h = harness("a", ReplicationConfig::default());
        let mut narrow = reconfig(1, &["a"], 0);
        narrow.responsibility = KeyRange::half_open(b"a".to_vec(), b"m".to_vec());
        h.engine.bootstrap(narrow).await;
        drain(&mut h.events_rx);

        h.engine.handle_decide(1, put(30, "z", "v")).await;
        assert!(matches!(
            responses(&mut h.events_rx)[0].response,
            Response::Unavailable(_)
        ));

        h.engine
            .handle_decide(2, Value::Reconfigure(reconfig(2, &["a"], 0)))
            .await;
        h.engine.handle_decide(3, put(30, "z", "v")).await;
        assert_eq!(responses(&mut h.events_rx)[0].response, Response::Written);
        assert_eq!(h.store.get(b"z").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_removed_replica_goes_passive() {
        let mut h = harness("a", ReplicationConfig::default());
        h.engine.bootstrap(reconfig(1, &["a", "b"], 1)).await;
        drain(&mut h.mover_rx);

        h.engine.handle_decide(1, Value::Reconfigure(reconfig(2, &["b"], 1))).await;
        assert_eq!(h.engine.state(), EngineState::Passive);
        assert!(matches!(
            h.mover_rx.try_recv().unwrap(),
            MoverInput::Command(MoverCommand::StopAll)
        ));
    }

    #[tokio::test]
    async fn test_view_change_proposed_only_by_leader() {
        let mut h = harness("a", ReplicationConfig::default());
        h.engine.bootstrap(reconfig(1, &["a", "b"], 0)).await;

        h.engine
            .handle_input(EngineInput::ProposeReconfigure(reconfig(2, &["a", "b", "c"], 0)))
            .await;
        assert!(h.log_rx.try_recv().is_err());

        h.engine.handle_oracle(OracleEvent::Trust {
            leader: node("a"),
            view_id: 1,
        });
        h.engine
            .handle_input(EngineInput::ProposeReconfigure(reconfig(1, &["a"], 0)))
            .await;
        assert!(h.log_rx.try_recv().is_err());

        h.engine
            .handle_input(EngineInput::ProposeReconfigure(reconfig(2, &["a", "b", "c"], 0)))
            .await;
        assert!(matches!(
            h.log_rx.try_recv().unwrap(),
            LogRequest::Propose(Value::Reconfigure(r)) if r.view.id == 2
        ));
    }

    #[tokio::test]
    async fn test_submit_and_prune() {
        let config = ReplicationConfig {
            prune_interval: 2,
            ..ReplicationConfig::default()
        };
        let mut h = harness("a", config);

        // nothing installed yet
        h.engine
            .handle_input(EngineInput::Submit(Operation::new(1, OpKind::Get { key: b"k".to_vec() })))
            .await;
        assert!(matches!(
            responses(&mut h.events_rx)[0].response,
            Response::Unavailable(_)
        ));

        h.engine.bootstrap(reconfig(1, &["a"], 0)).await;
        h.engine
            .handle_input(EngineInput::Submit(Operation::new(2, OpKind::Get { key: b"k".to_vec() })))
            .await;
        assert!(matches!(h.log_rx.try_recv().unwrap(), LogRequest::Propose(Value::Op(_))));

        h.engine.handle_decide(1, Value::Noop).await;
        h.engine.handle_decide(2, Value::Noop).await;
        assert_eq!(h.log_rx.try_recv().unwrap(), LogRequest::Prune(3));
    }
}
