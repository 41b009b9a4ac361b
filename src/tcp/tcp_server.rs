use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::buffers::buffer_pool::BufferManager;
use crate::config::SocketConfig;
use crate::connection_set::ConnectionSet;
use crate::handler::MessageHandler;
use crate::signal::Signal;
use crate::stream_socket::StreamSocket;
use crate::tcp::spawn_tcp_socket;

struct Acceptor<H: MessageHandler> {
    local_addr: SocketAddr,
    handler: Arc<H>,
    buffers: Arc<BufferManager>,
    config: Arc<SocketConfig>,
    connections: Arc<ConnectionSet<StreamSocket>>,
    stop: Signal,
}

impl<H: MessageHandler> Acceptor<H> {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        info!("starting accept loop on {}", self.local_addr);

        loop {
            select! {
                _ = self.stop.fired() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.on_accepted(stream, peer),
                    Err(e) => {
                        // e.g. running out of file descriptors: the listener itself is still fine
                        warn!("error accepting TCP connection: {}", e);
                    }
                },
            }
        }

        info!("accept loop on {} finished", self.local_addr);
    }

    #[instrument(name="accepted_connection", skip_all, fields(peer=%peer))]
    fn on_accepted(&self, stream: TcpStream, peer: SocketAddr) {
        debug!("received connection request");

        let id = Uuid::new_v4();
        let connections = self.connections.clone();
        let release = Box::new(move || { connections.remove(&id); });

        let socket = Arc::new(spawn_tcp_socket(stream, self.local_addr, peer, self.handler.clone(), self.buffers.clone(), &self.config, Some(release)));
        self.connections.insert(id, socket.clone());
        if socket.is_closed() {
            self.connections.remove(&id);
        }
    }
}

/// Accepts TCP connections, running a [StreamSocket] for each of them
pub struct TcpServer<H: MessageHandler> {
    acceptor: Arc<Acceptor<H>>,
    accept_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<H: MessageHandler> TcpServer<H> {
    pub async fn bind(addr: SocketAddr, handler: Arc<H>, config: Arc<SocketConfig>) -> anyhow::Result<TcpServer<H>> {
        config.validate()?;

        let listener = TcpListener::bind(addr).await?;
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

        Ok(TcpServer {
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

    /// Stops accepting new connections, then closes all active ones
    pub async fn close(&self) {
        self.acceptor.stop.fire();
        if let Some(handle) = self.accept_loop.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("accept loop did not terminate cleanly: {}", e);
            }
        }

        let connections = self.acceptor.connections.drain();
        info!("closing {} connections", connections.len());
        join_all(connections.iter().map(|c| c.close())).await;
    }
}
