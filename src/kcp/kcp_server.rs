use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_kcp::{KcpListener, KcpStream};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::buffers::buffer_pool::BufferManager;
use crate::config::SocketConfig;
use crate::connection_set::ConnectionSet;
use crate::handler::MessageHandler;
use crate::kcp::kcp_config;
use crate::kcp::reliable_socket::ReliableSocket;
use crate::signal::Signal;

struct Acceptor<H: MessageHandler> {
    local_addr: SocketAddr,
    handler: Arc<H>,
    buffers: Arc<BufferManager>,
    config: Arc<SocketConfig>,
    connections: Arc<ConnectionSet<ReliableSocket>>,
    stop: Signal,
}

impl<H: MessageHandler> Acceptor<H> {
    async fn accept_loop(self: Arc<Self>, mut listener: KcpListener) -> KcpListener {
        info!("starting accept loop on {}", self.local_addr);

        loop {
            select! {
                _ = self.stop.fired() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted KCP connection from {}", peer);
                        tokio::spawn(self.clone().on_accepted(stream, peer));
                    }
                    Err(e) => {
                        error!("error accepting KCP connection: {}", e);
                        break;
                    }
                },
            }
        }

        info!("accept loop on {} finished", self.local_addr);
        listener
    }

    /// The handshake runs in its own task so a slow peer does not hold up the accept loop
    #[instrument(name="kcp_handshake", skip_all, fields(peer=%peer))]
    async fn on_accepted(self: Arc<Self>, stream: KcpStream, peer: SocketAddr) {
        let id = Uuid::new_v4();
        let connections = self.connections.clone();
        let release = Box::new(move || { connections.remove(&id); });

        let socket = match ReliableSocket::start(stream, self.local_addr, peer, true, self.handler.clone(), self.buffers.clone(), &self.config, Some(release)).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!("dropping connection from {}: {}", peer, e);
                return;
            }
        };

        self.connections.insert(id, socket.clone());
        if socket.is_closed() {
            self.connections.remove(&id);
        }
        else if self.stop.is_fired() {
            // the server was closed while the handshake was in progress
            self.connections.remove(&id);
            socket.close().await;
        }
    }
}

/// Accepts reliable UDP connections and runs the lifecycle protocol on each of them
pub struct KcpServer<H: MessageHandler> {
    acceptor: Arc<Acceptor<H>>,
    accept_loop: tokio::sync::Mutex<Option<JoinHandle<KcpListener>>>,
}

impl<H: MessageHandler> KcpServer<H> {
    pub async fn bind(addr: SocketAddr, handler: Arc<H>, config: Arc<SocketConfig>) -> anyhow::Result<KcpServer<H>> {
        config.validate()?;

        let listener = KcpListener::bind(kcp_config(&config.kcp_tuning), addr).await?;
        let local_addr = listener.local_addr()?;

        let acceptor = Arc::new(Acceptor {
            local_addr,
            handler,
            buffers: Arc::new(BufferManager::new(config.read_buffer_size, config.buffer_pool_size)),
            config,
            connections: Arc::new(ConnectionSet::default()),
            stop: Signal::new(),
        });

        let accept_loop = tokio::spawn(acceptor.clone().accept_loop(listener));

        Ok(KcpServer {
            acceptor,
            accept_loop: tokio::sync::Mutex::new(Some(accept_loop)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr
    }

    pub fn num_connections(&self) -> usize {
        self.acceptor.connections.len()
    }

    /// Stops accepting, tears down all connections, and finally releases the UDP port. The
    ///  listener is kept alive until the connections are closed since it routes their packets.
    pub async fn close(&self) {
        self.acceptor.stop.fire();

        let listener = match self.accept_loop.lock().await.take() {
            Some(handle) => match handle.await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    warn!("accept loop did not terminate cleanly: {}", e);
                    None
                }
            },
            None => None,
        };

        let connections = self.acceptor.connections.drain();
        info!("closing {} connections", connections.len());
        join_all(connections.iter().map(|c| c.close())).await;

        drop(listener);
    }
}
