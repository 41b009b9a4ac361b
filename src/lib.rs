//! A message socket layer with the same connect / send / receive / close contract over TCP, UDP,
//!  reliable UDP (KCP) and WebSocket.
//!
//! Applications implement [handler::MessageHandler]: `on_connect` creates per-connection state,
//!  `on_message` is offered the bytes received so far and returns how many of them it consumed
//!  (0 meaning it needs more), and `on_disconnect` is called exactly once when the connection
//!  ends. Sending goes through [handler::Socket::send_msg], which never blocks: a full outbound
//!  queue is reported as [error::SocketError::Overflow].
//!
//! Plain UDP has no connections, so [udp::udp_server::UdpServer] creates a virtual session per
//!  peer address and reclaims it after a configurable idle time.
//!
//! KCP has no connect or close signal of its own. Connections over KCP therefore run a small
//!  lifecycle protocol ([kcp::mux]) modelled on TCP's handshake and teardown. Every message on the
//!  wire is prefixed with a single flag byte:
//!
//! ```ascii
//! 0: data frame, followed by the application payload
//! 1: control frame, followed by the sender's new state as an i32 (little endian)
//! ```

pub mod buffers;
pub mod config;
pub mod connection_set;
pub mod error;
pub mod handler;
pub mod kcp;
pub mod signal;
pub mod stream_socket;
pub mod tcp;
pub mod udp;
pub mod websocket;

#[cfg(test)]
pub mod test_util;
