use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::error::SocketError;

/// The sending side of a connection or session, as the application sees it.
///
/// `send_msg` never blocks: it enqueues the message for the connection's write loop and fails
///  with `SocketError::Overflow` if the queue is full, or `SocketError::AlreadyClosed` once the
///  connection started shutting down.
#[cfg_attr(test, automock)]
pub trait Socket: Send + Sync + 'static {
    fn send_msg(&self, msg: Bytes) -> Result<(), SocketError>;
    fn local_addr(&self) -> SocketAddr;
    fn remote_addr(&self) -> SocketAddr;
}

/// Application callbacks for a server or client.
///
/// Each connection (or UDP session) gets its own `State`, created by `on_connect` when the
///  connection's read loop starts and handed back to `on_disconnect` when it ends. All three
///  callbacks for a given connection are called from that connection's read loop, so they are
///  never called concurrently for the same `State`.
pub trait MessageHandler: Send + Sync + 'static {
    type State: Send + 'static;

    fn on_connect(&self, socket: Arc<dyn Socket>) -> Self::State;

    /// Called with all bytes received and not yet consumed. Returns the number of bytes consumed
    ///  from the front of `buf`, or 0 if `buf` does not yet contain a complete message. The
    ///  callback is called repeatedly until it returns 0.
    ///
    /// For message based transports (UDP, WebSocket), `buf` is exactly one message and the return
    ///  value is ignored.
    ///
    /// An error terminates the connection.
    fn on_message(&self, state: &mut Self::State, buf: &[u8]) -> anyhow::Result<usize>;

    fn on_disconnect(&self, state: Self::State);
}
