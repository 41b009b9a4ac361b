//! Message sockets over plain UDP: one physical socket, demultiplexed into a virtual session per
//!  peer address.
//!
//! Datagrams are neither acknowledged nor retransmitted, and a session has no connect or
//!  disconnect on the wire. Sessions are created by the first datagram from a new peer and
//!  reclaimed by a periodic sweep once they have been idle for `udp_session_timeout_secs`.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod udp_client;
pub mod udp_server;
pub mod udp_session;
pub mod udp_socket;

/// Wall clock seconds, the time base of session activity
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
