//! Network error types

use thiserror::Error;

use crate::protocol::FrameError;

/// Errors that can occur on the broker connection
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection timeout: no CONNACK within {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("Connection refused by broker (return code {0})")]
    ConnectionRefused(u8),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    Closed,

    #[error("Keepalive timeout: {0} pings unanswered")]
    KeepaliveTimeout(u32),

    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    #[error("Unexpected packet during handshake: {0}")]
    UnexpectedPacket(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Envelope encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl TransportError {
    /// Malformed frames mean the stream can no longer be trusted; the
    /// connection is torn down and rebuilt instead of skipping ahead.
    pub fn forces_reconnect(&self) -> bool {
        matches!(self, TransportError::MalformedFrame(_))
    }
}
