//! WolfRing Error Types

use thiserror::Error;

/// Result type alias for WolfRing operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfRing error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Wire errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Frame corrupted: {0}")]
    FrameCorrupted(String),

    // Membership errors
    #[error("Stale view {proposed} (installed view is {current})")]
    StaleView { proposed: u64, current: u64 },

    #[error("Not the trusted leader")]
    NotLeader,

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Transfer errors
    #[error("Transfer handshake to {destination} gave up after {attempts} attempts")]
    HandshakeExhausted { destination: String, attempts: u32 },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed("receiver dropped")
    }
}
