use std::io;

use thiserror::Error;

use crate::kcp::mux::MuxState;

/// Errors surfaced by sockets, sessions and the loops driving them.
///
/// Transport errors (`Io`, `ReadTimeout`, `WriteTimeout`, `WebSocket`, `Kcp`) end the loop that
///  hit them. Protocol and handler errors are fatal to the connection. `Overflow` and
///  `AlreadyClosed` are returned synchronously to callers of `send_msg` and never end a loop.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("read timed out")]
    ReadTimeout,
    #[error("write timed out")]
    WriteTimeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("message handler failed: {0:#}")]
    Handler(anyhow::Error),
    #[error("message queue overflow")]
    Overflow,
    #[error("socket already closed")]
    AlreadyClosed,
    #[error("message of {len} bytes exceeds the maximum of {max}")]
    MessageTooLarge { len: usize, max: usize },
    #[error("connection not established (state {0:?})")]
    NotEstablished(MuxState),
    #[error("handshake timed out in state {0:?}")]
    HandshakeTimeout(MuxState),
    #[error("teardown complete")]
    TeardownComplete,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("kcp error: {0}")]
    Kcp(#[from] ::kcp::Error),
}

impl SocketError {
    /// Shutdown indicators that end a read loop without being reported as a failure
    pub fn is_benign(&self) -> bool {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match self {
            SocketError::TeardownComplete => true,
            SocketError::Io(e) => matches!(e.kind(), io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe),
            SocketError::WebSocket(WsError::ConnectionClosed | WsError::AlreadyClosed) => true,
            _ => false,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> SocketError {
        SocketError::Protocol(msg.into())
    }
}
