use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::handler::{MessageHandler, MockSocket, Socket};

const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Encodes a payload with a 4 byte little endian length prefix
pub fn length_prefixed(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decodes length prefixed messages, reports every payload together with the peer address, and
///  optionally answers each message with a fixed reply.
pub struct LengthPrefixedHandler {
    reply: Option<Vec<u8>>,
    received: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl LengthPrefixedHandler {
    pub fn new(reply: Option<Vec<u8>>) -> (Arc<LengthPrefixedHandler>, mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>) {
        let (received, rx) = mpsc::unbounded_channel();
        let handler = LengthPrefixedHandler {
            reply,
            received,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        };
        (Arc::new(handler), rx)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl MessageHandler for LengthPrefixedHandler {
    type State = Arc<dyn Socket>;

    fn on_connect(&self, socket: Arc<dyn Socket>) -> Arc<dyn Socket> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        socket
    }

    fn on_message(&self, socket: &mut Arc<dyn Socket>, buf: &[u8]) -> anyhow::Result<usize> {
        if buf.len() < 4 {
            return Ok(0);
        }
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_PAYLOAD_LEN {
            bail!("message length {} exceeds the maximum of {}", len, MAX_PAYLOAD_LEN);
        }
        if buf.len() < 4 + len {
            return Ok(0);
        }

        let _ = self.received.send((socket.remote_addr(), buf[4..4 + len].to_vec()));
        if let Some(reply) = &self.reply {
            socket.send_msg(length_prefixed(reply))?;
        }
        Ok(4 + len)
    }

    fn on_disconnect(&self, _socket: Arc<dyn Socket>) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// A send-less socket for handler state, reporting fixed addresses
pub fn peer_socket(local_addr: SocketAddr, remote_addr: SocketAddr) -> Arc<dyn Socket> {
    let mut socket = MockSocket::new();
    socket.expect_local_addr().return_const(local_addr);
    socket.expect_remote_addr().return_const(remote_addr);
    Arc::new(socket)
}

/// Waits for `n` payloads, failing the test if they do not arrive in time
pub async fn receive_n(rx: &mut mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>, n: usize) -> Vec<(SocketAddr, Vec<u8>)> {
    let mut result = Vec::with_capacity(n);
    while result.len() < n {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(msg)) => result.push(msg),
            Ok(None) => panic!("handler dropped after {} of {} messages", result.len(), n),
            Err(_) => panic!("timeout after {} of {} messages", result.len(), n),
        }
    }
    result
}

/// Polls `condition` until it holds, failing the test after a few seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
