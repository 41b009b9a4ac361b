use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio_kcp::KcpStream;
use tracing::info;

use crate::buffers::buffer_pool::BufferManager;
use crate::config::SocketConfig;
use crate::error::SocketError;
use crate::handler::MessageHandler;
use crate::kcp::{kcp_config, unspecified_local_addr};
use crate::kcp::mux::MuxState;
use crate::kcp::reliable_socket::ReliableSocket;

pub struct KcpClient<H: MessageHandler> {
    remote_addr: SocketAddr,
    handler: Arc<H>,
    config: Arc<SocketConfig>,
    buffers: Arc<BufferManager>,
    socket: ReliableSocket,
}

impl<H: MessageHandler> KcpClient<H> {
    /// Connects and completes the handshake before returning
    pub async fn connect(remote_addr: SocketAddr, handler: Arc<H>, config: Arc<SocketConfig>) -> anyhow::Result<KcpClient<H>> {
        config.validate()?;

        let buffers = Arc::new(BufferManager::new(config.read_buffer_size, config.buffer_pool_size));
        let socket = Self::dial(remote_addr, &handler, &config, &buffers).await?;

        Ok(KcpClient {
            remote_addr,
            handler,
            config,
            buffers,
            socket,
        })
    }

    async fn dial(remote_addr: SocketAddr, handler: &Arc<H>, config: &SocketConfig, buffers: &Arc<BufferManager>) -> anyhow::Result<ReliableSocket> {
        info!("connecting to {}", remote_addr);
        let stream = KcpStream::connect(&kcp_config(&config.kcp_tuning), remote_addr).await?;
        let socket = ReliableSocket::start(stream, unspecified_local_addr(&remote_addr), remote_addr, false, handler.clone(), buffers.clone(), config, None).await?;
        Ok(socket)
    }

    pub fn send_msg(&self, msg: Bytes) -> Result<(), SocketError> {
        self.socket.send_msg(msg)
    }

    pub fn state(&self) -> MuxState {
        self.socket.state()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
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

    /// Closes the current connection and establishes a new one, including a fresh handshake
    pub async fn reconnect(&mut self) -> anyhow::Result<()> {
        self.socket.close().await;
        self.socket = Self::dial(self.remote_addr, &self.handler, &self.config, &self.buffers).await?;
        Ok(())
    }
}
