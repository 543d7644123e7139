//! Network Module
//!
//! Framing, the transport port, and the outbound pump that drains a node's
//! outbox into the transport. Transports provide at-least-once delivery
//! under retry; nothing above them assumes ordering.

pub mod protocol;
mod local;
mod tcp;

pub use protocol::{Envelope, FrameHeader, Lane, Message};
pub use local::LocalNetwork;
pub use tcp::{TcpServer, TcpTransport};

use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Frames larger than this are rejected before allocating the body
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Outbound side of a component: envelopes handed to the pump
pub type Outbox = mpsc::Sender<Envelope>;

/// Message transport between nodes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one envelope to `envelope.dst`
    async fn send(&self, envelope: Envelope) -> Result<()>;
}

/// Read a framed envelope from a reader
pub async fn read_envelope<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_SIZE {
        return Err(Error::FrameCorrupted(format!("frame of {} bytes exceeds limit", header.length)));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::FrameCorrupted("checksum mismatch".into()));
    }

    Ok(Envelope::deserialize(&body)?)
}

/// Write a framed envelope to a writer
pub async fn write_envelope<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = envelope.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

/// Drain `outbox` into `transport` until cancelled
///
/// A failed send is logged and the envelope dropped; retries belong to the
/// protocols that need them.
pub async fn run_pump(
    transport: Arc<dyn Transport>,
    mut outbox: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            envelope = outbox.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let kind = envelope.message.type_name();
        let dst = envelope.dst.clone();
        match transport.send(envelope).await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => tracing::debug!("Dropping {} to {}: {}", kind, dst, e),
            Err(e) => tracing::warn!("Dropping {} to {}: {}", kind, dst, e),
        }
    }
    tracing::debug!("Outbound pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::NodeId;

    #[tokio::test]
    async fn test_frame_roundtrip_over_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let env = Envelope::new(NodeId::new("a", 1), NodeId::new("b", 2), Message::Ping { id: 5, ts: 99 });

        write_envelope(&mut client, &env).await.unwrap();
        let read = read_envelope(&mut server).await.unwrap();
        assert_eq!(read, env);
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut client, mut server) = tokio::io::duplex(1024);
        let env = Envelope::new(NodeId::new("a", 1), NodeId::new("b", 2), Message::Heartbeat);
        let body = env.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xFFFF;

        client.write_all(&header.to_bytes()).await.unwrap();
        client.write_all(&body).await.unwrap();

        assert!(matches!(read_envelope(&mut server).await, Err(Error::FrameCorrupted(_))));
    }
}
