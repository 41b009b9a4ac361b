use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::info;

use crate::buffers::buffer_pool::BufferManager;
use crate::config::SocketConfig;
use crate::error::SocketError;
use crate::handler::{MessageHandler, Socket};
use crate::stream_socket::StreamSocket;
use crate::tcp::spawn_tcp_socket;

pub struct TcpClient<H: MessageHandler> {
    remote_addr: SocketAddr,
    handler: Arc<H>,
    config: Arc<SocketConfig>,
    buffers: Arc<BufferManager>,
    socket: StreamSocket,
}

impl<H: MessageHandler> TcpClient<H> {
    pub async fn connect(remote_addr: SocketAddr, handler: Arc<H>, config: Arc<SocketConfig>) -> anyhow::Result<TcpClient<H>> {
        config.validate()?;

        let buffers = Arc::new(BufferManager::new(config.read_buffer_size, config.buffer_pool_size));
        let socket = Self::dial(remote_addr, &handler, &config, &buffers).await?;

        Ok(TcpClient {
            remote_addr,
            handler,
            config,
            buffers,
            socket,
        })
    }

    async fn dial(remote_addr: SocketAddr, handler: &Arc<H>, config: &SocketConfig, buffers: &Arc<BufferManager>) -> anyhow::Result<StreamSocket> {
        info!("connecting to {}", remote_addr);
        let stream = TcpStream::connect(remote_addr).await?;
        let local_addr = stream.local_addr()?;
        Ok(spawn_tcp_socket(stream, local_addr, remote_addr, handler.clone(), buffers.clone(), config, None))
    }

    pub fn send_msg(&self, msg: Bytes) -> Result<(), SocketError> {
        self.socket.endpoint().send_msg(msg)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.endpoint().local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }

    pub async fn close(&self) {
        self.socket.close().await;
    }

    /// Closes the current connection and replaces it with a new one
    pub async fn reconnect(&mut self) -> anyhow::Result<()> {
        self.socket.close().await;
        self.socket = Self::dial(self.remote_addr, &self.handler, &self.config, &self.buffers).await?;
        Ok(())
    }
}
