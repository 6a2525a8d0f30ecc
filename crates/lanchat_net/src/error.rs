//! Network error types.

use std::time::Duration;

/// Errors that can occur in the lanchat_net crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (connect, short read, closed stream).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote violated the framing protocol (bad kind tag, bad header).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame header announced a payload larger than the configured bound.
    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// No live connection exists for the requested peer key.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Discovery subsystem error.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// The hello exchange after connect/accept failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Whether this error must tear down the connection it occurred on.
    ///
    /// Transport and protocol failures are fatal to the session; a failed
    /// serialization of an outgoing payload is not.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Protocol(_)
                | Self::FrameTooLarge { .. }
                | Self::Handshake(_)
                | Self::Io(_)
        )
    }
}
