//! Error types surfaced to the host by the tunnel engine.

use std::io;
use std::time::Duration;

/// Failures that end a connection attempt or a running session.
///
/// Transient transport errors during the relay never show up here; they are
/// recovered inside the loops.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("handshake timed out after {0:?} waiting for WELCOME")]
    HandshakeTimeout(Duration),

    #[error("unexpected packet type {got} during handshake (expected {expected})")]
    UnexpectedPacket { expected: u8, got: u8 },

    #[error("malformed WELCOME: {0}")]
    MalformedWelcome(String),

    #[error("invalid server address '{0}'")]
    InvalidServerAddress(String),

    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("tunnel device error: {0}")]
    TunnelDevice(String),

    #[error("a session is already active")]
    AlreadyConnected,
}

impl EngineError {
    /// Whether the error happened while negotiating the session.
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            EngineError::HandshakeTimeout(_)
                | EngineError::UnexpectedPacket { .. }
                | EngineError::MalformedWelcome(_)
        )
    }
}
