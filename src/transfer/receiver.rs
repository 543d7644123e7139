//! Receiver role of the transfer protocol

use bytes::Bytes;

use super::{decode_page, DataMover, MoverEvent, SessionId, TransferMetadata};
use crate::keyspace::Key;
use crate::membership::NodeId;
use crate::network::Message;

pub(super) struct ReceiverSession {
    pub metadata: TransferMetadata,
    /// Highest key written so far; pages replayed by the sender are skipped up to it
    pub last_key: Option<Key>,
    pub items: u64,
    pub bytes: u64,
}

impl DataMover {
    pub(super) async fn on_initiate(&mut self, src: NodeId, id: SessionId, metadata: TransferMetadata) {
        let key = (src.clone(), id);
        if self.inbound.contains_key(&key) || self.completed.contains(&key) {
            tracing::debug!("Repeated handshake for transfer {} from {}", id, src);
        } else {
            tracing::info!(
                "Accepting transfer {} of {} from {} (view {})",
                id,
                metadata.range,
                src,
                metadata.view_id
            );
            self.inbound.insert(
                key,
                ReceiverSession {
                    metadata,
                    last_key: None,
                    items: 0,
                    bytes: 0,
                },
            );
        }
        self.send(src, Message::Ack { id }).await;
    }

    pub(super) async fn on_request_to_send(&mut self, src: NodeId, id: SessionId) {
        let key = (src, id);
        if self.inbound.contains_key(&key) {
            let quota = self.config.quota_bytes;
            self.send(key.0, Message::ClearToSend { id, quota }).await;
        } else if self.completed.contains(&key) {
            tracing::debug!("RequestToSend for completed transfer {}", id);
        } else {
            tracing::warn!("RequestToSend for unknown transfer {} from {}", id, key.0);
        }
    }

    pub(super) async fn on_data(&mut self, src: NodeId, id: SessionId, payload: Bytes, is_final: bool) {
        let key = (src, id);
        if self.completed.contains(&key) {
            // our AllReceived for the final page was lost
            self.send(key.0, Message::AllReceived { id }).await;
            return;
        }
        let Some(session) = self.inbound.get_mut(&key) else {
            tracing::warn!("Data for unknown transfer {} from {}", id, key.0);
            return;
        };

        let items = match decode_page(&payload, session.metadata.compressed) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!("Dropping undecodable page of transfer {}: {}", id, e);
                return;
            }
        };

        for item in items {
            if matches!(&session.last_key, Some(last) if item.key <= *last) {
                continue;
            }
            let size = item.size() as u64;
            let written = match item.value {
                Some(value) => self.store.put(item.key.clone(), value).await.map(|_| ()),
                None => self.store.delete(&item.key).await.map(|_| ()),
            };
            if let Err(e) = written {
                // no AllReceived: the sender retransmits the page
                tracing::error!("Store write failed during transfer {}: {}", id, e);
                return;
            }
            session.items += 1;
            session.bytes += size;
            session.last_key = Some(item.key);
        }

        self.send(key.0.clone(), Message::AllReceived { id }).await;

        if is_final {
            if let Some(session) = self.inbound.remove(&key) {
                tracing::info!(
                    "Transfer {} from {} complete ({} items, {} bytes)",
                    id,
                    key.0,
                    session.items,
                    session.bytes
                );
                self.completed.insert(key.clone());
                self.emit(MoverEvent::TransferComplete {
                    session: id,
                    source: key.0,
                    metadata: session.metadata,
                    items: session.items,
                    bytes: session.bytes,
                })
                .await;
            }
        }
    }
}
