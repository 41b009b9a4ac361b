use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SocketConfig;
use crate::error::SocketError;
use crate::handler::{MessageHandler, Socket};
use crate::signal::Signal;
use crate::udp::udp_session::UdpSession;
use crate::udp::udp_socket::{Datagram, DatagramDispatcher, UdpSocket};
use crate::udp::unix_now;

struct SessionDispatcher {
    session: Arc<UdpSession>,
}

impl DatagramDispatcher for SessionDispatcher {
    fn on_datagram(&self, datagram: Datagram) {
        if let Err(e) = self.session.recv_msg(datagram.payload, unix_now()) {
            warn!("dropping datagram from {}: {}", datagram.addr, e);
        }
    }
}

/// A connected socket with its single session, and the sweep watching that session
struct UdpConnection {
    socket: Arc<UdpSocket>,
    session: Arc<UdpSession>,
    stop_check: Signal,
    check_loop: Mutex<Option<JoinHandle<()>>>,
}

impl UdpConnection {
    async fn open<H: MessageHandler>(remote_addr: SocketAddr, handler: Arc<H>, config: &SocketConfig) -> anyhow::Result<UdpConnection> {
        let bind_addr = match remote_addr {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let raw_socket = tokio::net::UdpSocket::bind(bind_addr).await?;
        raw_socket.connect(remote_addr).await?;
        let local_addr = raw_socket.local_addr()?;
        info!("UDP client {} connected to {}", local_addr, remote_addr);

        let (outbound, queue) = UdpSocket::outbound_queue(config);
        let session = UdpSession::spawn(local_addr, remote_addr, outbound.clone(), config.max_datagram_size, handler, config.udp_session_queue_limit, unix_now());
        let dispatcher = Arc::new(SessionDispatcher { session: session.clone() });
        let socket = Arc::new(UdpSocket::spawn(raw_socket, true, outbound, queue, dispatcher, config)?);

        let stop_check = Signal::new();
        let check_loop = tokio::spawn(check_loop(socket.clone(), session.clone(), config.udp_check_interval, config.udp_session_timeout_secs, stop_check.clone()));

        Ok(UdpConnection {
            socket,
            session,
            stop_check,
            check_loop: Mutex::new(Some(check_loop)),
        })
    }

    async fn close(&self) {
        self.stop_check.fire();
        let handle = self.check_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("check loop did not terminate cleanly: {}", e);
            }
        }
        self.session.close().await;
        self.socket.close().await;
    }
}

/// Closes the whole connection once its session was idle too long or ended on its own
async fn check_loop(socket: Arc<UdpSocket>, session: Arc<UdpSession>, check_interval: Duration, timeout_secs: u64, stop: Signal) {
    let mut ticks = tokio::time::interval(check_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = stop.fired() => break,
            _ = ticks.tick() => {
                if session.is_closed() || socket.is_closed() || session.is_idle(unix_now(), timeout_secs) {
                    info!("session with {} timed out or ended, closing", session.remote_addr());
                    session.close().await;
                    socket.close().await;
                    break;
                }
            }
        }
    }
    debug!("check loop finished");
}

pub struct UdpClient<H: MessageHandler> {
    remote_addr: SocketAddr,
    handler: Arc<H>,
    config: Arc<SocketConfig>,
    connection: UdpConnection,
}

impl<H: MessageHandler> UdpClient<H> {
    pub async fn connect(remote_addr: SocketAddr, handler: Arc<H>, config: Arc<SocketConfig>) -> anyhow::Result<UdpClient<H>> {
        config.validate()?;
        let connection = UdpConnection::open(remote_addr, handler.clone(), &config).await?;

        Ok(UdpClient {
            remote_addr,
            handler,
            config,
            connection,
        })
    }

    pub fn send_msg(&self, msg: Bytes) -> Result<(), SocketError> {
        self.connection.session.send_msg(msg)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.connection.socket.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.connection.session.is_closed()
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }

    /// Discards the socket and session and starts over with fresh ones
    pub async fn reconnect(&mut self) -> anyhow::Result<()> {
        let fresh = UdpConnection::open(self.remote_addr, self.handler.clone(), &self.config).await?;
        let old = std::mem::replace(&mut self.connection, fresh);
        old.close().await;
        Ok(())
    }
}
