//! Node Runtime
//!
//! Wires the components of one replica together:
//!
//! ```text
//!  inbound ─┬─ liveness ─▶ FailureDetector ─▶ (oracle, router)
//!           ├─ transfer ─▶ DataMover ◀──────▶ ReplicationEngine ◀── consensus log
//!           └─ client ───▶ RequestRouter ◀──▶ ReplicationEngine ◀─▶ LeaderOracle
//! ```
//!
//! Every component sends its network traffic to a shared outbox drained
//! by the outbound pump.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WolfRingConfig;
use crate::consensus::{LocalLog, LogIndication, LogRequest, Reconfigure};
use crate::error::{Error, Result};
use crate::id::IdGenerator;
use crate::keyspace::KeyRange;
use crate::membership::{
    DetectorInput, FailureDetector, LeaderOracle, Liveness, NodeId, OracleInput, View,
};
use crate::network::{self, Envelope, Lane, Transport};
use crate::ops::{OpKind, OpResponse, Operation};
use crate::placement::Placement;
use crate::replication::{EngineInput, ReplicationEngine};
use crate::router::{Monitor, ReplyTo, RequestRouter, RouterInput};
use crate::store::KvStore;
use crate::transfer::{DataMover, MoverInput};

const CHANNEL_CAPACITY: usize = 1024;

/// How the replica reaches the consensus log
pub enum LogPort {
    /// Run a private in-process log
    Local,
    /// Use an externally run log
    External {
        requests: mpsc::Sender<LogRequest>,
        decisions: mpsc::Receiver<LogIndication>,
    },
}

/// External collaborators of a node
pub struct NodeDeps {
    pub store: Arc<dyn KvStore>,
    pub placement: Arc<dyn Placement>,
    pub monitor: Arc<dyn Monitor>,
    pub transport: Arc<dyn Transport>,
    pub log: LogPort,
}

/// Running replica
pub struct Node;

impl Node {
    /// Spawn every component of the replica
    ///
    /// `inbound` carries envelopes the transport received for this node.
    /// With `bootstrap` set, the configuration is installed before any
    /// component starts.
    pub async fn spawn(
        config: &WolfRingConfig,
        deps: NodeDeps,
        inbound: mpsc::Receiver<Envelope>,
        bootstrap: Option<Reconfigure>,
    ) -> Result<NodeHandle> {
        let self_id = config.node_id()?;
        let ids = Arc::new(IdGenerator::new(&self_id));
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (detector_tx, detector_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (liveness_tx, liveness_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (oracle_tx, oracle_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (oracle_events_tx, oracle_events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (mover_tx, mover_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (mover_events_tx, mover_events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (engine_tx, engine_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (engine_events_tx, engine_events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (router_tx, router_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let (log_tx, decisions) = match deps.log {
            LogPort::Local => {
                let (decide_tx, decide_rx) = mpsc::channel(CHANNEL_CAPACITY);
                let (log_tx, handle) = LocalLog::spawn(vec![decide_tx], cancel.clone());
                tasks.push(handle);
                (log_tx, decide_rx)
            }
            LogPort::External { requests, decisions } => (requests, decisions),
        };

        let (detector, rto) = FailureDetector::new(
            self_id.clone(),
            config.detector.clone(),
            out_tx.clone(),
            liveness_tx,
        );
        let oracle = LeaderOracle::new(
            self_id.clone(),
            ids.clone(),
            detector_tx.clone(),
            oracle_events_tx,
        );
        let leader = oracle.watch_leader();
        let mover = DataMover::new(
            self_id.clone(),
            config.transfer.clone(),
            deps.store.clone(),
            ids.clone(),
            out_tx.clone(),
            mover_events_tx,
            rto,
            mover_tx.clone(),
        );
        let mut engine = ReplicationEngine::new(
            self_id.clone(),
            config.replication.clone(),
            deps.store,
            log_tx,
            oracle_tx.clone(),
            mover_tx.clone(),
            engine_events_tx,
        );
        let router = RequestRouter::new(
            self_id.clone(),
            config.router.clone(),
            deps.placement,
            deps.monitor,
            ids.clone(),
            engine_tx.clone(),
            out_tx,
            router_tx.clone(),
        );

        if let Some(reconfigure) = bootstrap {
            engine.bootstrap(reconfigure).await;
        }

        tasks.push(tokio::spawn(network::run_pump(deps.transport, out_rx, cancel.clone())));
        tasks.push(tokio::spawn(detector.run(detector_tx.clone(), detector_rx, cancel.clone())));
        tasks.push(tokio::spawn(oracle.run(oracle_rx, cancel.clone())));
        tasks.push(tokio::spawn(mover.run(mover_rx, cancel.clone())));
        tasks.push(tokio::spawn(engine.run(
            engine_rx,
            decisions,
            oracle_events_rx,
            mover_events_rx,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(router.run(
            router_rx,
            engine_events_rx,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(fan_out_liveness(
            liveness_rx,
            oracle_tx,
            router_tx.clone(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(dispatch_inbound(
            inbound,
            detector_tx,
            mover_tx,
            router_tx.clone(),
            cancel.clone(),
        )));

        tracing::info!("Node {} started", self_id);
        Ok(NodeHandle {
            self_id,
            ids,
            router: router_tx,
            engine: engine_tx,
            leader,
            cancel,
            tasks,
        })
    }
}

/// Route inbound envelopes to the component owning their lane
async fn dispatch_inbound(
    mut inbound: mpsc::Receiver<Envelope>,
    detector: mpsc::Sender<DetectorInput>,
    mover: mpsc::Sender<MoverInput>,
    router: mpsc::Sender<RouterInput>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            envelope = inbound.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        tracing::trace!("Inbound {} from {}", envelope.message.type_name(), envelope.src);
        let delivered = match envelope.message.lane() {
            Lane::Liveness => detector.send(DetectorInput::Inbound(envelope)).await.is_ok(),
            Lane::Transfer => mover.send(MoverInput::Inbound(envelope)).await.is_ok(),
            Lane::Client => router.send(RouterInput::Inbound(envelope)).await.is_ok(),
        };
        if !delivered {
            break;
        }
    }
    tracing::debug!("Inbound dispatch stopped");
}

/// Deliver detector indications to the oracle and the router
async fn fan_out_liveness(
    mut indications: mpsc::Receiver<Liveness>,
    oracle: mpsc::Sender<OracleInput>,
    router: mpsc::Sender<RouterInput>,
    cancel: CancellationToken,
) {
    loop {
        let liveness = tokio::select! {
            _ = cancel.cancelled() => break,
            liveness = indications.recv() => match liveness {
                Some(liveness) => liveness,
                None => break,
            },
        };
        let _ = oracle.send(OracleInput::Liveness(liveness.clone())).await;
        let _ = router.send(RouterInput::Liveness(liveness)).await;
    }
}

/// Bootstrap configuration: this node and its peers own the whole key space
pub fn bootstrap_reconfigure(config: &WolfRingConfig) -> Result<Reconfigure> {
    let mut members = config.peer_ids()?;
    members.push(config.node_id()?);
    Ok(Reconfigure {
        view: View::new(1, members),
        quorum: config.quorum_size(),
        version_id: 0,
        responsibility: KeyRange::full(),
    })
}

/// Handle to a running node
pub struct NodeHandle {
    self_id: NodeId,
    ids: Arc<IdGenerator>,
    router: mpsc::Sender<RouterInput>,
    engine: mpsc::Sender<EngineInput>,
    leader: watch::Receiver<Option<NodeId>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn id(&self) -> &NodeId {
        &self.self_id
    }

    /// Leader currently trusted by this node's oracle
    pub fn leader(&self) -> Option<NodeId> {
        self.leader.borrow().clone()
    }

    pub fn watch_leader(&self) -> watch::Receiver<Option<NodeId>> {
        self.leader.clone()
    }

    /// Submit a client operation and wait for its response
    pub async fn submit(&self, kind: OpKind) -> Result<OpResponse> {
        let operation = Operation::new(self.ids.next(), kind);
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.router
            .send(RouterInput::Request {
                operation,
                reply: ReplyTo::Local(reply_tx),
            })
            .await
            .map_err(|_| Error::ChannelClosed("router"))?;
        reply_rx.recv().await.ok_or(Error::ShuttingDown)
    }

    /// Ask the engine to propose a view change
    pub async fn propose_reconfigure(&self, reconfigure: Reconfigure) -> Result<()> {
        self.engine
            .send(EngineInput::ProposeReconfigure(reconfigure))
            .await
            .map_err(|_| Error::ChannelClosed("engine"))
    }

    /// Stop every component and wait for them
    pub async fn shutdown(self) {
        tracing::info!("Shutting down node {}", self.self_id);
        self.cancel.cancel();
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::warn!("Node task ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalNetwork;
    use crate::ops::Response;
    use crate::placement::StaticPlacement;
    use crate::router::LogMonitor;
    use crate::store::MemStore;
    use std::time::Duration;

    fn config(id: &str, peers: &[&str]) -> WolfRingConfig {
        let mut config = WolfRingConfig::sample(id, "127.0.0.1:0");
        config.cluster.peers = peers.iter().map(|p| p.to_string()).collect();
        config
    }

    fn deps(network: &Arc<LocalNetwork>, log: LogPort) -> NodeDeps {
        deps_with_store(network, Arc::new(MemStore::new()), log)
    }

    fn deps_with_store(network: &Arc<LocalNetwork>, store: Arc<MemStore>, log: LogPort) -> NodeDeps {
        NodeDeps {
            store,
            placement: Arc::new(StaticPlacement::new()),
            monitor: Arc::new(LogMonitor),
            transport: network.clone(),
            log,
        }
    }

    /// Submit until the node stops answering Unavailable
    async fn submit_ready(node: &NodeHandle, kind: OpKind) -> Response {
        for _ in 0..100 {
            let response = node.submit(kind.clone()).await.unwrap().response;
            if !matches!(response, Response::Unavailable(_)) {
                return response;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node never became available");
    }

    #[tokio::test]
    async fn test_single_node_serves_requests() {
        let network = Arc::new(LocalNetwork::new());
        let config = config("a:7000", &[]);
        let (in_tx, in_rx) = mpsc::channel(64);
        network.register(&config.node_id().unwrap(), in_tx).await;

        let bootstrap = bootstrap_reconfigure(&config).unwrap();
        let node = Node::spawn(&config, deps(&network, LogPort::Local), in_rx, Some(bootstrap))
            .await
            .unwrap();

        let put = OpKind::Put {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        };
        assert_eq!(submit_ready(&node, put).await, Response::Written);
        let got = submit_ready(&node, OpKind::Get { key: b"k".to_vec() }).await;
        assert_eq!(got, Response::Value(Some(b"v".to_vec())));

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_replicas_share_decided_writes() {
        let network = Arc::new(LocalNetwork::new());
        let config_a = config("a:7000", &["b:7000"]);
        let config_b = config("b:7000", &["a:7000"]);

        let (decide_a, decisions_a) = mpsc::channel(1024);
        let (decide_b, decisions_b) = mpsc::channel(1024);
        let cancel = CancellationToken::new();
        let (log_tx, _log) = LocalLog::spawn(vec![decide_a, decide_b], cancel.clone());

        let (in_a, inbox_a) = mpsc::channel(64);
        let (in_b, inbox_b) = mpsc::channel(64);
        network.register(&config_a.node_id().unwrap(), in_a).await;
        network.register(&config_b.node_id().unwrap(), in_b).await;

        let node_a = Node::spawn(
            &config_a,
            deps(
                &network,
                LogPort::External {
                    requests: log_tx.clone(),
                    decisions: decisions_a,
                },
            ),
            inbox_a,
            Some(bootstrap_reconfigure(&config_a).unwrap()),
        )
        .await
        .unwrap();
        let node_b = Node::spawn(
            &config_b,
            deps(
                &network,
                LogPort::External {
                    requests: log_tx,
                    decisions: decisions_b,
                },
            ),
            inbox_b,
            Some(bootstrap_reconfigure(&config_b).unwrap()),
        )
        .await
        .unwrap();

        let put = OpKind::Put {
            key: b"shared".to_vec(),
            value: b"1".to_vec(),
        };
        assert_eq!(submit_ready(&node_a, put).await, Response::Written);
        let got = submit_ready(&node_b, OpKind::Get { key: b"shared".to_vec() }).await;
        assert_eq!(got, Response::Value(Some(b"1".to_vec())));

        node_a.shutdown().await;
        node_b.shutdown().await;
        cancel.cancel();
    }

    async fn await_leader(rx: &mut watch::Receiver<Option<NodeId>>, expected: &NodeId) {
        let waited = tokio::time::timeout(Duration::from_secs(60), async {
            while rx.borrow_and_update().as_ref() != Some(expected) {
                if rx.changed().await.is_err() {
                    return false;
                }
            }
            true
        })
        .await;
        assert!(matches!(waited, Ok(true)), "leader never became {}", expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_receives_range_then_serves_it() {
        let network = Arc::new(LocalNetwork::new());
        let config_a = config("a:7000", &[]);
        let config_b = config("b:7000", &["a:7000"]);
        let (a, b) = (config_a.node_id().unwrap(), config_b.node_id().unwrap());

        let (decide_a, decisions_a) = mpsc::channel(1024);
        let (decide_b, decisions_b) = mpsc::channel(1024);
        let cancel = CancellationToken::new();
        let (log_tx, _log) = LocalLog::spawn(vec![decide_a, decide_b], cancel.clone());

        let (in_a, inbox_a) = mpsc::channel(64);
        let (in_b, inbox_b) = mpsc::channel(64);
        network.register(&a, in_a).await;
        network.register(&b, in_b).await;

        // a holds data alone; b starts without a view
        let alone = Reconfigure {
            view: View::new(1, [a.clone()]),
            quorum: 1,
            version_id: 1,
            responsibility: KeyRange::full(),
        };
        let node_a = Node::spawn(
            &config_a,
            deps(
                &network,
                LogPort::External {
                    requests: log_tx.clone(),
                    decisions: decisions_a,
                },
            ),
            inbox_a,
            Some(alone),
        )
        .await
        .unwrap();
        let store_b = Arc::new(MemStore::new());
        let node_b = Node::spawn(
            &config_b,
            deps_with_store(
                &network,
                store_b.clone(),
                LogPort::External {
                    requests: log_tx,
                    decisions: decisions_b,
                },
            ),
            inbox_b,
            None,
        )
        .await
        .unwrap();

        let put = OpKind::Put {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        };
        assert_eq!(submit_ready(&node_a, put).await, Response::Written);
        assert_eq!(store_b.get(b"k").await.unwrap(), None);

        let joined = Reconfigure {
            view: View::new(2, [a.clone(), b.clone()]),
            quorum: 2,
            version_id: 1,
            responsibility: KeyRange::full(),
        };
        let mut synced = false;
        for _ in 0..100 {
            node_a.propose_reconfigure(joined.clone()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            if store_b.get(b"k").await.unwrap().is_some() {
                synced = true;
                break;
            }
        }
        assert!(synced, "range never reached the joiner");

        // cut b off so only its own replica can answer
        network.partition(&a, &b).await;
        let got = submit_ready(&node_b, OpKind::Get { key: b"k".to_vec() }).await;
        assert_eq!(got, Response::Value(Some(b"v".to_vec())));

        node_a.shutdown().await;
        node_b.shutdown().await;
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_fails_over_and_returns() {
        let network = Arc::new(LocalNetwork::new());
        let configs = [
            config("a:7000", &["b:7000", "c:7000"]),
            config("b:7000", &["a:7000", "c:7000"]),
            config("c:7000", &["a:7000", "b:7000"]),
        ];

        let mut nodes = Vec::new();
        for config in &configs {
            let (in_tx, in_rx) = mpsc::channel(256);
            network.register(&config.node_id().unwrap(), in_tx).await;
            let bootstrap = bootstrap_reconfigure(config).unwrap();
            let node = Node::spawn(config, deps(&network, LogPort::Local), in_rx, Some(bootstrap))
                .await
                .unwrap();
            nodes.push(node);
        }
        let (a, b) = (nodes[0].id().clone(), nodes[1].id().clone());
        let c = nodes[2].id().clone();
        let mut leader_b = nodes[1].watch_leader();
        let mut leader_c = nodes[2].watch_leader();

        await_leader(&mut leader_c, &a).await;

        network.partition(&a, &b).await;
        network.partition(&a, &c).await;
        await_leader(&mut leader_c, &b).await;

        network.heal(&a, &b).await;
        network.heal(&a, &c).await;
        await_leader(&mut leader_c, &a).await;
        await_leader(&mut leader_b, &a).await;
        assert_eq!(nodes[1].leader(), Some(a));

        for node in nodes {
            node.shutdown().await;
        }
    }
}
