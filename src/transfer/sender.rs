//! Sender role of the transfer protocol

use std::collections::VecDeque;
use std::time::Duration;

use super::{encode_page, DataMover, MoverEvent, MoverInput, SessionId, TransferMetadata};
use crate::keyspace::{Key, KeyRange};
use crate::membership::NodeId;
use crate::network::Message;
use crate::store::{ReadFilter, ScanLimit};

/// Outbound session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    /// Handshake sent, not acknowledged yet
    Initialising,
    /// Acknowledged, waiting for a grant
    Waiting,
    /// A page is in flight
    Transferring,
    /// Final page acknowledged
    Done,
}

pub(super) struct SenderSession {
    pub destination: NodeId,
    pub metadata: TransferMetadata,
    pub state: SenderState,
    /// Grants not served yet, in arrival order
    pub grants: VecDeque<u64>,
    /// Open lower bound of the next page
    pub last_key: Option<Key>,
    pub final_sent: bool,
    /// Frame retransmitted until answered
    pub in_flight: Option<Message>,
    pub attempts: u32,
    pub retry_interval: Duration,
    pub data_sent: u64,
    pub items_sent: u64,
    pub stopped: bool,
}

impl SenderSession {
    /// Part of the range not delivered yet
    fn remaining(&self) -> KeyRange {
        match &self.last_key {
            Some(key) => self.metadata.range.after(key),
            None => self.metadata.range.clone(),
        }
    }
}

impl DataMover {
    pub(super) async fn start_send(&mut self, destination: NodeId, range: KeyRange, view_id: u64) {
        // at most one outbound session per destination
        if let Some(old) = self.by_destination.get(&destination).copied() {
            self.stop_session(old, "superseded");
            self.finish_teardown();
        }

        let id = self.ids.next();
        let metadata = TransferMetadata {
            range,
            view_id,
            compressed: self.config.compression,
        };
        tracing::info!(
            "Starting transfer {} of {} to {} (view {})",
            id,
            metadata.range,
            destination,
            view_id
        );

        self.outbound.insert(
            id,
            SenderSession {
                destination: destination.clone(),
                metadata: metadata.clone(),
                state: SenderState::Initialising,
                grants: VecDeque::new(),
                last_key: None,
                final_sent: false,
                in_flight: None,
                attempts: 0,
                retry_interval: self.base_retry_interval(&destination),
                data_sent: 0,
                items_sent: 0,
                stopped: false,
            },
        );
        self.by_destination.insert(destination, id);
        self.transmit(id, Message::InitiateTransfer { id, metadata }).await;
    }

    pub(super) async fn on_ack(&mut self, src: NodeId, id: SessionId) {
        let Some(session) = self.active_session(&src, id) else {
            return;
        };
        if session.state != SenderState::Initialising {
            tracing::debug!("Duplicate Ack for transfer {}", id);
            return;
        }
        session.state = SenderState::Waiting;
        session.in_flight = None;
        self.timers.cancel(&id);
        tracing::debug!("Transfer {} acknowledged by {}", id, src);
        self.proceed(id).await;
    }

    pub(super) async fn on_clear_to_send(&mut self, src: NodeId, id: SessionId, quota: u64) {
        let Some(session) = self.active_session(&src, id) else {
            return;
        };
        match session.state {
            SenderState::Waiting => {
                session.in_flight = None;
                self.timers.cancel(&id);
                self.serve(id, quota).await;
            }
            SenderState::Initialising | SenderState::Transferring => {
                tracing::trace!("Queueing grant of {} bytes for transfer {}", quota, id);
                session.grants.push_back(quota);
            }
            SenderState::Done => {}
        }
    }

    pub(super) async fn on_all_received(&mut self, src: NodeId, id: SessionId) {
        let Some(session) = self.active_session(&src, id) else {
            return;
        };
        if session.state != SenderState::Transferring {
            tracing::debug!("Stale AllReceived for transfer {}", id);
            return;
        }
        session.in_flight = None;

        if session.final_sent {
            session.state = SenderState::Done;
            let event = MoverEvent::SendFinished {
                session: id,
                destination: session.destination.clone(),
                items: session.items_sent,
                bytes: session.data_sent,
            };
            tracing::info!(
                "Transfer {} to {} done ({} items, {} bytes)",
                id,
                session.destination,
                session.items_sent,
                session.data_sent
            );
            self.stop_session(id, "done");
            self.emit(event).await;
        } else {
            session.state = SenderState::Waiting;
            self.timers.cancel(&id);
            self.proceed(id).await;
        }
    }

    /// Retransmission timer fired
    pub(super) async fn on_retry(&mut self, id: SessionId) {
        let max_attempts = self.config.max_handshake_attempts;
        let max_interval = self.config.max_retry_interval();
        let multiplier = self.config.backoff_multiplier;

        let Some(session) = self.outbound.get_mut(&id) else {
            return;
        };
        if session.stopped {
            return;
        }
        let Some(message) = session.in_flight.clone() else {
            return;
        };

        if max_attempts > 0 && session.attempts >= max_attempts {
            let destination = session.destination.clone();
            let attempts = session.attempts;
            tracing::warn!(
                "Transfer {} to {} gave up after {} attempts",
                id,
                destination,
                attempts
            );
            self.stop_session(id, "retries exhausted");
            let reason = crate::Error::HandshakeExhausted {
                destination: destination.to_string(),
                attempts,
            }
            .to_string();
            self.emit(MoverEvent::SendFailed {
                session: id,
                destination,
                reason,
            })
            .await;
            return;
        }

        session.attempts += 1;
        session.retry_interval = session.retry_interval.mul_f64(multiplier).min(max_interval);
        let (destination, interval) = (session.destination.clone(), session.retry_interval);
        tracing::debug!("Retransmitting {} for transfer {}", message.type_name(), id);
        self.send(destination, message).await;
        self.timers
            .schedule_once(id, interval, MoverInput::Retry { session: id });
    }

    /// Serve a queued grant or ask for one
    async fn proceed(&mut self, id: SessionId) {
        let Some(session) = self.outbound.get_mut(&id) else {
            return;
        };
        match session.grants.pop_front() {
            Some(quota) => self.serve(id, quota).await,
            None => self.transmit(id, Message::RequestToSend { id }).await,
        }
    }

    /// Read and send the next page within `quota` bytes
    async fn serve(&mut self, id: SessionId, quota: u64) {
        let Some(session) = self.outbound.get_mut(&id) else {
            return;
        };
        session.state = SenderState::Transferring;
        let range = session.remaining();
        let compressed = session.metadata.compressed;
        let limit = ScanLimit::bytes(usize::try_from(quota).unwrap_or(usize::MAX));

        let scanned = self.store.scan(&range, limit, ReadFilter::All).await;
        let page = match scanned {
            Ok(page) => page,
            Err(e) => return self.fail(id, format!("store scan failed: {}", e)).await,
        };
        let payload = match encode_page(&page.items, compressed) {
            Ok(payload) => payload,
            Err(e) => return self.fail(id, format!("page encoding failed: {}", e)).await,
        };

        let Some(session) = self.outbound.get_mut(&id) else {
            return;
        };
        let is_final = !page.more;
        session.final_sent = is_final;
        session.data_sent += page.bytes as u64;
        session.items_sent += page.items.len() as u64;
        if let Some(key) = page.last_key() {
            session.last_key = Some(key.to_vec());
        }
        tracing::trace!(
            "Transfer {}: {} items, {} bytes, final={}",
            id,
            page.items.len(),
            page.bytes,
            is_final
        );

        self.transmit(
            id,
            Message::Data {
                id,
                payload,
                is_final,
            },
        )
        .await;
    }

    /// Send a frame that must be answered, arming its retransmission
    async fn transmit(&mut self, id: SessionId, message: Message) {
        let base = match self.outbound.get(&id) {
            Some(session) => self.base_retry_interval(&session.destination),
            None => return,
        };
        let Some(session) = self.outbound.get_mut(&id) else {
            return;
        };
        session.in_flight = Some(message.clone());
        session.attempts = 1;
        session.retry_interval = base;
        let destination = session.destination.clone();

        self.send(destination, message).await;
        self.timers.schedule_once(id, base, MoverInput::Retry { session: id });
    }

    async fn fail(&mut self, id: SessionId, reason: String) {
        let Some(session) = self.outbound.get(&id) else {
            return;
        };
        let destination = session.destination.clone();
        tracing::error!("Transfer {} to {} failed: {}", id, destination, reason);
        self.stop_session(id, "failed");
        self.emit(MoverEvent::SendFailed {
            session: id,
            destination,
            reason,
        })
        .await;
    }

    /// First phase of a stop: no further sends or timers for this session
    pub(super) fn stop_session(&mut self, id: SessionId, reason: &str) {
        let Some(session) = self.outbound.get_mut(&id) else {
            return;
        };
        if session.stopped {
            return;
        }
        session.stopped = true;
        session.in_flight = None;
        tracing::debug!("Stopping transfer {} to {} ({})", id, session.destination, reason);
        self.timers.cancel(&id);
        self.teardown.push(id);
    }

    /// Second phase: drop the session and its destination mapping
    pub(super) fn finish_teardown(&mut self) {
        for id in std::mem::take(&mut self.teardown) {
            if let Some(session) = self.outbound.remove(&id) {
                if self.by_destination.get(&session.destination) == Some(&id) {
                    self.by_destination.remove(&session.destination);
                }
                self.finished.insert(id);
            }
        }
    }

    /// Live, unstopped session `id` owned by `src`
    fn active_session(&mut self, src: &NodeId, id: SessionId) -> Option<&mut SenderSession> {
        if self.finished.contains(&id) {
            tracing::debug!("Dropping frame for finished transfer {}", id);
            return None;
        }
        match self.outbound.get_mut(&id) {
            Some(session) if !session.stopped && session.destination == *src => Some(session),
            Some(_) => None,
            None => {
                tracing::warn!("Frame for unknown transfer {} from {}", id, src);
                None
            }
        }
    }

    /// Configured retry interval, stretched to the destination's RTO
    fn base_retry_interval(&self, destination: &NodeId) -> Duration {
        let configured = self.config.retry_interval();
        match self.rto.borrow().get(destination) {
            Some(rto) => configured.max(*rto),
            None => configured,
        }
    }
}
