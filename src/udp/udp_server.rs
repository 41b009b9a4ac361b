use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SocketConfig;
use crate::handler::{MessageHandler, Socket};
use crate::signal::Signal;
use crate::stream_socket::Outbound;
use crate::udp::udp_session::UdpSession;
use crate::udp::udp_socket::{Datagram, DatagramDispatcher, UdpSocket};
use crate::udp::unix_now;

/// The server's sessions by peer address
struct SessionRegistry<H: MessageHandler> {
    local_addr: SocketAddr,
    handler: Arc<H>,
    outbound: Outbound<Datagram>,
    max_datagram_size: usize,
    queue_limit: usize,
    sessions: Mutex<FxHashMap<SocketAddr, Arc<UdpSession>>>,
    closing: Signal,
}

impl<H: MessageHandler> DatagramDispatcher for SessionRegistry<H> {
    fn on_datagram(&self, datagram: Datagram) {
        if self.closing.is_fired() {
            debug!("server is closing: dropping datagram from {}", datagram.addr);
            return;
        }

        let now = unix_now();
        let session = self.sessions.lock()
            .entry(datagram.addr)
            .or_insert_with(|| {
                debug!("new session for {}", datagram.addr);
                UdpSession::spawn(self.local_addr, datagram.addr, self.outbound.clone(), self.max_datagram_size, self.handler.clone(), self.queue_limit, now)
            })
            .clone();

        if let Err(e) = session.recv_msg(datagram.payload, now) {
            warn!("dropping datagram from {}: {}", datagram.addr, e);
        }
    }
}

impl<H: MessageHandler> SessionRegistry<H> {
    /// Removes and returns sessions that were idle for longer than the timeout, or ended on their own
    fn remove_expired(&self, now: u64, timeout_secs: u64) -> Vec<Arc<UdpSession>> {
        let mut sessions = self.sessions.lock();
        let expired = sessions.iter()
            .filter(|(_, s)| s.is_closed() || s.is_idle(now, timeout_secs))
            .map(|(addr, _)| *addr)
            .collect::<Vec<_>>();

        expired.iter()
            .filter_map(|addr| sessions.remove(addr))
            .collect()
    }

    fn drain(&self) -> Vec<Arc<UdpSession>> {
        self.sessions.lock()
            .drain()
            .map(|(_, s)| s)
            .collect()
    }

    fn len(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// Reclaims expired sessions. If the physical socket died, all sessions are closed since none of
///  them can send or receive anymore.
async fn check_loop<H: MessageHandler>(registry: Arc<SessionRegistry<H>>, socket_closed: Signal, check_interval: Duration, timeout_secs: u64) {
    let mut ticks = tokio::time::interval(check_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = registry.closing.fired() => break,
            _ = socket_closed.fired() => {
                registry.closing.fire();
                let sessions = registry.drain();
                warn!("UDP socket closed unexpectedly, closing {} sessions", sessions.len());
                join_all(sessions.iter().map(|s| s.close())).await;
                break;
            }
            _ = ticks.tick() => {
                let expired = registry.remove_expired(unix_now(), timeout_secs);
                for session in &expired {
                    info!("session {} timed out", session.remote_addr());
                }
                join_all(expired.iter().map(|s| s.close())).await;
            }
        }
    }
    debug!("check loop finished");
}

/// Serves any number of peers over a single UDP socket, one [UdpSession] per peer address
pub struct UdpServer<H: MessageHandler> {
    registry: Arc<SessionRegistry<H>>,
    socket: UdpSocket,
    check_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<H: MessageHandler> UdpServer<H> {
    pub async fn bind(addr: SocketAddr, handler: Arc<H>, config: Arc<SocketConfig>) -> anyhow::Result<UdpServer<H>> {
        config.validate()?;

        let raw_socket = tokio::net::UdpSocket::bind(addr).await?;
        let local_addr = raw_socket.local_addr()?;
        info!("UDP server listening on {}", local_addr);

        let (outbound, queue) = UdpSocket::outbound_queue(&config);
        let registry = Arc::new(SessionRegistry {
            local_addr,
            handler,
            outbound: outbound.clone(),
            max_datagram_size: config.max_datagram_size,
            queue_limit: config.udp_session_queue_limit,
            sessions: Mutex::new(FxHashMap::default()),
            closing: Signal::new(),
        });

        let socket_closed = outbound.close_signal().clone();
        let socket = UdpSocket::spawn(raw_socket, false, outbound, queue, registry.clone(), &config)?;
        let check_loop = tokio::spawn(check_loop(registry.clone(), socket_closed, config.udp_check_interval, config.udp_session_timeout_secs));

        Ok(UdpServer {
            registry,
            socket,
            check_loop: tokio::sync::Mutex::new(Some(check_loop)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn num_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Stops the sweep, closes all sessions, and finally the socket
    pub async fn close(&self) {
        self.registry.closing.fire();
        if let Some(handle) = self.check_loop.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("check loop did not terminate cleanly: {}", e);
            }
        }

        let sessions = self.registry.drain();
        info!("closing {} sessions", sessions.len());
        join_all(sessions.iter().map(|s| s.close())).await;

        self.socket.close().await;
    }
}
