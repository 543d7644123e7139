//! TCP Transport
//!
//! One-way framed connections: the client side caches a writer per peer
//! address, the server side accepts connections and forwards every inbound
//! envelope to the node's dispatch channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{read_envelope, write_envelope, Envelope, Transport};
use crate::error::{Error, Result};

/// Connection pool entry
struct PoolEntry {
    writer: OwnedWriteHalf,
}

/// Client side of the TCP transport
pub struct TcpTransport {
    /// Connection pool: address -> writer
    pool: RwLock<HashMap<String, Arc<Mutex<PoolEntry>>>>,
    /// Connection timeout
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Create a new transport
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn get_connection(&self, address: &str) -> Option<Arc<Mutex<PoolEntry>>> {
        self.pool.read().await.get(address).cloned()
    }

    async fn remove_connection(&self, address: &str) {
        self.pool.write().await.remove(address);
    }

    async fn open_connection(&self, address: &str) -> Result<Arc<Mutex<PoolEntry>>> {
        let stream = self.connect(address).await?;
        let (_, writer) = stream.into_split();
        let entry = Arc::new(Mutex::new(PoolEntry { writer }));
        self.pool.write().await.insert(address.to_string(), entry.clone());
        Ok(entry)
    }

    /// Get connection count
    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.len()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        let address = envelope.dst.address();

        // Try the cached connection first
        if let Some(entry) = self.get_connection(&address).await {
            let mut entry = entry.lock().await;
            if write_envelope(&mut entry.writer, &envelope).await.is_ok() {
                return Ok(());
            }
            drop(entry);
            // Connection is dead, reconnect below
            self.remove_connection(&address).await;
        }

        let entry = self.open_connection(&address).await?;
        let mut entry = entry.lock().await;
        if let Err(e) = write_envelope(&mut entry.writer, &envelope).await {
            drop(entry);
            self.remove_connection(&address).await;
            return Err(e);
        }
        Ok(())
    }
}

/// Server side of the TCP transport
pub struct TcpServer {
    /// Bind address
    bind_address: String,
    /// Channel for inbound envelopes
    inbound_tx: mpsc::Sender<Envelope>,
}

impl TcpServer {
    /// Create a new server
    pub fn new(bind_address: String, inbound_tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            bind_address,
            inbound_tx,
        }
    }

    /// Bind and serve until cancelled
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Network server listening on {}", self.bind_address);
        self.serve_listener(listener, cancel).await
    }

    /// Serve an already bound listener until cancelled
    pub async fn serve_listener(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let inbound_tx = self.inbound_tx.clone();
                            let cancel = cancel.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), inbound_tx, cancel).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }
}

/// Handle a single inbound connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    inbound_tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) -> Result<()> {
    let (mut reader, _writer) = socket.into_split();

    loop {
        let result = tokio::select! {
            result = read_envelope(&mut reader) => result,
            _ = cancel.cancelled() => break,
        };

        match result {
            Ok(envelope) => {
                tracing::trace!("Received {} from {}", envelope.message.type_name(), peer_addr);
                if inbound_tx.send(envelope).await.is_err() {
                    break;
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(Error::Serialization(e)) => {
                // A bad message is fatal to that message only
                tracing::warn!("Undecodable envelope from {}: {}", peer_addr, e);
            }
            Err(e) => {
                tracing::warn!("Error reading envelope from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}
