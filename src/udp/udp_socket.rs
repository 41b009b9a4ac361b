use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::config::SocketConfig;
use crate::error::SocketError;
use crate::signal::Signal;
use crate::stream_socket::{write_loop, FrameWriter, Outbound};

/// A single UDP packet's payload with the peer address it came from or goes to
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Datagram {
    pub payload: Bytes,
    pub addr: SocketAddr,
}

/// Receives every datagram read from a physical socket. Called on the socket's read loop, so
///  implementations must not block.
#[cfg_attr(test, automock)]
pub trait DatagramDispatcher: Send + Sync + 'static {
    fn on_datagram(&self, datagram: Datagram);
}

struct DatagramWriter {
    socket: Arc<tokio::net::UdpSocket>,
    connected: bool,
    write_timeout: Duration,
}

#[async_trait]
impl FrameWriter for DatagramWriter {
    type Item = Datagram;

    async fn write_batch(&mut self, batch: Vec<Datagram>) -> Result<(), SocketError> {
        for datagram in batch {
            let sent = if self.connected {
                timeout(self.write_timeout, self.socket.send(&datagram.payload)).await
            }
            else {
                timeout(self.write_timeout, self.socket.send_to(&datagram.payload, datagram.addr)).await
            };

            match sent.map_err(|_| SocketError::WriteTimeout)? {
                Ok(n) => trace!("sent {} bytes to {}", n, datagram.addr),
                Err(e) if !self.connected => {
                    // the socket is shared by all peers: a datagram that cannot be sent is dropped
                    //  on its own
                    warn!("dropping datagram of {} bytes to {}: {}", datagram.payload.len(), datagram.addr, e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        debug!("datagram writer finished");
    }
}

/// One physical UDP socket: a read loop handing every datagram to a [DatagramDispatcher], and a
///  write loop draining a bounded queue of outbound datagrams. A connected socket (client side)
///  sends to its peer, an unconnected one (server side) to each datagram's address.
pub struct UdpSocket {
    local_addr: SocketAddr,
    outbound: Outbound<Datagram>,
    read_shutdown: Signal,
    loops: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl UdpSocket {
    /// Creates the outbound queue. It is created ahead of the socket so that the dispatcher can
    ///  hold on to it.
    pub fn outbound_queue(config: &SocketConfig) -> (Outbound<Datagram>, mpsc::Receiver<Datagram>) {
        Outbound::new(config.udp_write_queue_limit, Signal::new())
    }

    pub fn spawn<D: DatagramDispatcher>(
        socket: tokio::net::UdpSocket,
        connected: bool,
        outbound: Outbound<Datagram>,
        queue: mpsc::Receiver<Datagram>,
        dispatcher: Arc<D>,
        config: &SocketConfig,
    ) -> io::Result<UdpSocket> {
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let span = info_span!("udp_socket", local = %local_addr);

        let read_shutdown = Signal::new();
        let close = outbound.close_signal().clone();

        let read_handle = tokio::spawn(
            read_loop(socket.clone(), dispatcher, config.max_datagram_size, read_shutdown.clone(), close.clone())
                .instrument(span.clone()));

        let writer = DatagramWriter {
            socket,
            connected,
            write_timeout: config.write_timeout,
        };
        let write_handle = tokio::spawn(write_loop(writer, queue, close, read_shutdown.clone()).instrument(span));

        Ok(UdpSocket {
            local_addr,
            outbound,
            read_shutdown,
            loops: tokio::sync::Mutex::new(vec![read_handle, write_handle]),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn send_datagram(&self, datagram: Datagram) -> Result<(), SocketError> {
        self.outbound.try_send(datagram)
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.close_signal().is_fired()
    }

    pub fn force_close(&self) {
        self.read_shutdown.fire();
        self.outbound.close_signal().fire();
    }

    /// Stops reading, flushes queued datagrams and waits for both loops to finish
    pub async fn close(&self) {
        self.force_close();
        let mut loops = self.loops.lock().await;
        for handle in loops.drain(..) {
            if let Err(e) = handle.await {
                warn!("UDP socket loop did not terminate cleanly: {}", e);
            }
        }
    }
}

async fn read_loop<D: DatagramDispatcher>(
    socket: Arc<tokio::net::UdpSocket>,
    dispatcher: Arc<D>,
    max_datagram_size: usize,
    read_shutdown: Signal,
    close: Signal,
) {
    debug!("starting receive loop");
    let mut buf = vec![0u8; max_datagram_size];

    loop {
        let received = select! {
            biased;
            _ = read_shutdown.fired() => break,
            r = socket.recv_from(&mut buf) => r,
        };

        match received {
            Ok((n, addr)) => {
                trace!("received {} bytes from {}", n, addr);
                dispatcher.on_datagram(Datagram {
                    payload: Bytes::copy_from_slice(&buf[..n]),
                    addr,
                });
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset) => {
                // ICMP feedback for an earlier send, the socket itself is fine
                debug!("peer not reachable: {}", e);
            }
            Err(e) => {
                warn!("read loop exit with error: {}", e);
                break;
            }
        }
    }

    close.fire();
    debug!("receive loop finished");
}
