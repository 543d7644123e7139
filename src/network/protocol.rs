//! Wire Protocol
//!
//! Defines the messages exchanged between nodes. Every message travels in
//! an [`Envelope`] naming the source and destination (virtual) node.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::membership::NodeId;
use crate::ops::{OpResponse, Operation};
use crate::transfer::{SessionId, TransferMetadata};

/// Protocol messages for node communication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // ========== Liveness ==========
    /// Failure detector heartbeat
    Heartbeat,

    /// Round-trip probe; `ts` is opaque to the receiver and echoed back
    Ping { id: u64, ts: u64 },

    /// Probe answer
    Pong { id: u64, ts: u64 },

    // ========== Data Transfer ==========
    /// Sender asks the receiver to open a session
    InitiateTransfer { id: SessionId, metadata: TransferMetadata },

    /// Receiver accepted the session
    Ack { id: SessionId },

    /// Sender is waiting for quota
    RequestToSend { id: SessionId },

    /// Receiver grants `quota` bytes
    ClearToSend { id: SessionId, quota: u64 },

    /// One page of the transferred range
    Data { id: SessionId, payload: Bytes, is_final: bool },

    /// Receiver consumed a page
    AllReceived { id: SessionId },

    // ========== Client Traffic ==========
    /// Client operation forwarded to another node
    Forward { operation: Operation, reply_to: NodeId },

    /// Answer to a forwarded operation
    Reply { response: OpResponse },
}

impl Message {
    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Heartbeat => "Heartbeat",
            Message::Ping { .. } => "Ping",
            Message::Pong { .. } => "Pong",
            Message::InitiateTransfer { .. } => "InitiateTransfer",
            Message::Ack { .. } => "Ack",
            Message::RequestToSend { .. } => "RequestToSend",
            Message::ClearToSend { .. } => "ClearToSend",
            Message::Data { .. } => "Data",
            Message::AllReceived { .. } => "AllReceived",
            Message::Forward { .. } => "Forward",
            Message::Reply { .. } => "Reply",
        }
    }

    /// Which component consumes this message
    pub fn lane(&self) -> Lane {
        match self {
            Message::Heartbeat | Message::Ping { .. } | Message::Pong { .. } => Lane::Liveness,
            Message::InitiateTransfer { .. }
            | Message::Ack { .. }
            | Message::RequestToSend { .. }
            | Message::ClearToSend { .. }
            | Message::Data { .. }
            | Message::AllReceived { .. } => Lane::Transfer,
            Message::Forward { .. } | Message::Reply { .. } => Lane::Client,
        }
    }
}

/// Component lane an inbound message is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Liveness,
    Transfer,
    Client,
}

/// Addressed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub src: NodeId,
    pub dst: NodeId,
    pub message: Message,
}

impl Envelope {
    pub fn new(src: NodeId, dst: NodeId, message: Message) -> Self {
        Self { src, dst, message }
    }

    /// Serialize envelope to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize envelope from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut length = [0u8; 4];
        let mut checksum = [0u8; 4];
        length.copy_from_slice(&bytes[0..4]);
        checksum.copy_from_slice(&bytes[4..8]);
        Self {
            length: u32::from_le_bytes(length),
            checksum: u32::from_le_bytes(checksum),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::KeyRange;

    #[test]
    fn test_envelope_serialization() {
        let env = Envelope::new(
            NodeId::new("a", 1),
            NodeId::with_vnode("b", 2, 4),
            Message::InitiateTransfer {
                id: 42,
                metadata: TransferMetadata {
                    range: KeyRange::half_open(b"a".to_vec(), b"q".to_vec()),
                    view_id: 3,
                    compressed: true,
                },
            },
        );

        let bytes = env.serialize().unwrap();
        let restored = Envelope::deserialize(&bytes).unwrap();
        assert_eq!(restored, env);
        assert_eq!(restored.message.lane(), Lane::Transfer);
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(header, restored);
        assert_eq!(restored.length as usize, data.len());
    }

    #[test]
    fn test_lanes() {
        assert_eq!(Message::Heartbeat.lane(), Lane::Liveness);
        assert_eq!(Message::Pong { id: 1, ts: 2 }.lane(), Lane::Liveness);
        assert_eq!(Message::AllReceived { id: 1 }.lane(), Lane::Transfer);
    }
}
