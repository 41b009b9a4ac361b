use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::SocketError;
use crate::handler::{MessageHandler, Socket};
use crate::signal::Signal;
use crate::stream_socket::Outbound;
use crate::udp::udp_socket::Datagram;

/// A virtual connection with one peer of a shared UDP socket.
///
/// Inbound datagrams are queued by the socket's read loop and handed to the application by the
///  session's own dispatch loop, so a slow or stuck session never holds up other sessions. There
///  is no disconnect on the wire: a session ends when it is closed explicitly, when its handler
///  fails, or when it was idle for too long.
pub struct UdpSession {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    outbound: Outbound<Datagram>,
    max_datagram_size: usize,
    inbound: Outbound<Bytes>,
    /// unix timestamp (seconds) of the last received datagram
    last_active: AtomicU64,
    dispatch_loop: Mutex<Option<JoinHandle<()>>>,
}

impl UdpSession {
    pub fn spawn<H: MessageHandler>(
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        outbound: Outbound<Datagram>,
        max_datagram_size: usize,
        handler: Arc<H>,
        queue_limit: usize,
        now: u64,
    ) -> Arc<UdpSession> {
        let (inbound, queue) = Outbound::new(queue_limit, Signal::new());
        let session = Arc::new(UdpSession {
            local_addr,
            remote_addr,
            outbound,
            max_datagram_size,
            inbound,
            last_active: AtomicU64::new(now),
            dispatch_loop: Mutex::new(None),
        });

        let span = info_span!("udp_session", peer = %remote_addr);
        let handle = tokio::spawn(dispatch_loop(session.clone(), queue, handler).instrument(span));
        *session.dispatch_loop.lock() = Some(handle);
        session
    }

    /// Queues an inbound datagram without blocking, and marks the session as active
    pub fn recv_msg(&self, msg: Bytes, now: u64) -> Result<(), SocketError> {
        self.inbound.try_send(msg)?;
        self.last_active.store(now, Ordering::Release);
        Ok(())
    }

    pub fn last_active(&self) -> u64 {
        self.last_active.load(Ordering::Acquire)
    }

    pub fn is_idle(&self, now: u64, timeout_secs: u64) -> bool {
        self.last_active() + timeout_secs < now
    }

    pub fn is_closed(&self) -> bool {
        self.inbound.close_signal().is_fired()
    }

    pub fn force_close(&self) {
        self.inbound.close_signal().fire();
    }

    /// Ends the dispatch loop and waits for it, including the `on_disconnect` callback
    pub async fn close(&self) {
        self.force_close();
        let handle = self.dispatch_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("session dispatch loop did not terminate cleanly: {}", e);
            }
        }
    }
}

impl Socket for UdpSession {
    fn send_msg(&self, msg: Bytes) -> Result<(), SocketError> {
        if self.is_closed() {
            return Err(SocketError::AlreadyClosed);
        }
        if msg.len() > self.max_datagram_size {
            return Err(SocketError::MessageTooLarge { len: msg.len(), max: self.max_datagram_size });
        }
        self.outbound.try_send(Datagram {
            payload: msg,
            addr: self.remote_addr,
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

async fn dispatch_loop<H: MessageHandler>(session: Arc<UdpSession>, mut queue: mpsc::Receiver<Bytes>, handler: Arc<H>) {
    debug!("session started");
    let close = session.inbound.close_signal().clone();
    let mut state = handler.on_connect(session.clone());

    loop {
        let msg = select! {
            biased;
            _ = close.fired() => break,
            msg = queue.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        if let Err(e) = handler.on_message(&mut state, &msg) {
            warn!("dispatch loop exit with error: {:#}", e);
            break;
        }
    }

    handler.on_disconnect(state);
    // a session that ended on its own is reclaimed by the next sweep
    close.fire();
    debug!("session finished");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::test_util::{length_prefixed, receive_n, LengthPrefixedHandler};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn session(handler: Arc<LengthPrefixedHandler>, queue_limit: usize, now: u64) -> (Arc<UdpSession>, mpsc::Receiver<Datagram>) {
        let (outbound, datagrams) = Outbound::new(16, Signal::new());
        (UdpSession::spawn(addr(1), addr(2), outbound, 1472, handler, queue_limit, now), datagrams)
    }

    #[tokio::test]
    async fn test_dispatch_and_reply() {
        let (handler, mut rx) = LengthPrefixedHandler::new(Some(b"pong".to_vec()));
        let (session, mut datagrams) = session(handler.clone(), 16, 100);

        session.recv_msg(length_prefixed(b"ping"), 101).unwrap();
        let received = receive_n(&mut rx, 1).await;
        assert_eq!(received[0], (addr(2), b"ping".to_vec()));
        assert_eq!(session.last_active(), 101);

        let reply = datagrams.recv().await.unwrap();
        assert_eq!(reply, Datagram { payload: length_prefixed(b"pong"), addr: addr(2) });

        session.close().await;
        assert_eq!(handler.connects(), 1);
        assert_eq!(handler.disconnects(), 1);
        assert!(matches!(session.recv_msg(Bytes::new(), 102), Err(SocketError::AlreadyClosed)));
        assert!(matches!(session.send_msg(Bytes::new()), Err(SocketError::AlreadyClosed)));
        assert_eq!(session.last_active(), 101);
    }

    #[tokio::test]
    async fn test_oversized_send_is_refused() {
        let (handler, _rx) = LengthPrefixedHandler::new(None);
        let (session, mut datagrams) = session(handler, 16, 100);

        assert!(matches!(session.send_msg(Bytes::from(vec![0; 1473])), Err(SocketError::MessageTooLarge { len: 1473, max: 1472 })));
        session.send_msg(Bytes::from(vec![0; 1472])).unwrap();
        assert_eq!(datagrams.recv().await.unwrap().payload.len(), 1472);

        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_does_not_update_activity() {
        let (handler, _rx) = LengthPrefixedHandler::new(None);
        let (session, _datagrams) = session(handler, 2, 100);

        // the dispatch loop does not get to run before the queue is full
        session.recv_msg(length_prefixed(b"a"), 101).unwrap();
        session.recv_msg(length_prefixed(b"b"), 102).unwrap();
        assert!(matches!(session.recv_msg(length_prefixed(b"c"), 103), Err(SocketError::Overflow)));
        assert_eq!(session.last_active(), 102);

        session.close().await;
    }

    #[tokio::test]
    async fn test_handler_error_ends_session() {
        let (handler, _rx) = LengthPrefixedHandler::new(None);
        let (session, _datagrams) = session(handler.clone(), 16, 100);

        session.recv_msg(Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]), 101).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !session.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();
        session.close().await;
        assert_eq!(handler.disconnects(), 1);
    }

    #[rstest]
    #[case::fresh(100, 105, false)]
    #[case::at_limit(100, 110, false)]
    #[case::expired(100, 111, true)]
    #[case::clock_went_back(100, 50, false)]
    fn test_is_idle(#[case] last_active: u64, #[case] now: u64, #[case] expected: bool) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (handler, _rx) = LengthPrefixedHandler::new(None);
            let (session, _datagrams) = session(handler, 16, last_active);
            assert_eq!(session.is_idle(now, 10), expected);
            session.close().await;
        });
    }
}
