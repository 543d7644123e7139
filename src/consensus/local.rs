//! Local Consensus Log
//!
//! Single-sequencer stand-in for the consensus log: every proposal is
//! decided at the next position and the decision is delivered to every
//! subscriber in position order. Sufficient for a single replica and for
//! driving several in-process replicas off one agreed sequence in tests.

use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{LogIndication, LogRequest, Position, Value};

/// In-process consensus log
pub struct LocalLog {
    next_position: Position,
    pruned_below: Position,
    /// Decided entries not yet pruned
    decided: BTreeMap<Position, Value>,
    subscribers: Vec<mpsc::Sender<LogIndication>>,
}

impl LocalLog {
    pub fn new(subscribers: Vec<mpsc::Sender<LogIndication>>) -> Self {
        Self {
            next_position: 1,
            pruned_below: 1,
            decided: BTreeMap::new(),
            subscribers,
        }
    }

    /// Spawn the log as a task; returns its request inbox
    pub fn spawn(
        subscribers: Vec<mpsc::Sender<LogIndication>>,
        cancel: CancellationToken,
    ) -> (mpsc::Sender<LogRequest>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1024);
        let log = Self::new(subscribers);
        let handle = tokio::spawn(log.run(rx, cancel));
        (tx, handle)
    }

    /// Process requests until the inbox closes or the token is cancelled
    pub async fn run(mut self, mut inbox: mpsc::Receiver<LogRequest>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = inbox.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
            }
        }
        tracing::debug!("Local log stopped at position {}", self.next_position);
    }

    /// Handle a single request
    pub async fn handle(&mut self, request: LogRequest) {
        match request {
            LogRequest::Propose(value) => {
                let position = self.next_position;
                self.next_position += 1;
                tracing::trace!("Deciding {} at position {}", value.type_name(), position);
                self.decided.insert(position, value.clone());

                for subscriber in &self.subscribers {
                    let _ = subscriber
                        .send(LogIndication::Decide {
                            position,
                            value: value.clone(),
                        })
                        .await;
                }
            }
            LogRequest::Prune(position) => {
                if position > self.pruned_below {
                    self.pruned_below = position;
                    self.decided = self.decided.split_off(&position);
                    tracing::debug!("Pruned log below position {}", position);
                }
            }
        }
    }

    /// Number of decided entries still retained
    pub fn retained(&self) -> usize {
        self.decided.len()
    }

    pub fn next_position(&self) -> Position {
        self.next_position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_decides_in_order_to_all_subscribers() {
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let mut log = LocalLog::new(vec![tx_a, tx_b]);

        log.handle(LogRequest::Propose(Value::Noop)).await;
        log.handle(LogRequest::Propose(Value::Noop)).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let LogIndication::Decide { position, .. } = rx.try_recv().unwrap();
            assert_eq!(position, 1);
            let LogIndication::Decide { position, .. } = rx.try_recv().unwrap();
            assert_eq!(position, 2);
        }
    }

    #[tokio::test]
    async fn test_prune_drops_old_entries() {
        let (tx, _rx) = mpsc::channel(16);
        let mut log = LocalLog::new(vec![tx]);
        for _ in 0..5 {
            log.handle(LogRequest::Propose(Value::Noop)).await;
        }
        assert_eq!(log.retained(), 5);

        log.handle(LogRequest::Prune(4)).await;
        assert_eq!(log.retained(), 2);

        // pruning backwards is ignored
        log.handle(LogRequest::Prune(2)).await;
        assert_eq!(log.retained(), 2);
        assert_eq!(log.next_position(), 6);
    }
}
