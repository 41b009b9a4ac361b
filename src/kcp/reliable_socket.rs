use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::buffers::buffer_pool::BufferManager;
use crate::config::SocketConfig;
use crate::error::SocketError;
use crate::handler::{MessageHandler, Socket};
use crate::kcp::mux::{Mux, MuxFraming, MuxSocket, MuxState};
use crate::stream_socket::{ByteStreamWriter, ReleaseFn, StreamEndpoint, StreamSocket, StreamSocketArgs};

/// A connection over a reliable, ordered transport with the [Mux] handshake / teardown on top.
///  A `ReliableSocket` only exists once the handshake is complete.
pub struct ReliableSocket {
    mux: Arc<Mux>,
    app_socket: Arc<MuxSocket>,
    inner: StreamSocket,
}

impl ReliableSocket {
    /// Starts the read / write loops on `transport` and runs the handshake. If the handshake does
    ///  not complete in time, the loops are shut down and the error is returned.
    pub async fn start<H, S>(
        transport: S,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        is_listener: bool,
        handler: Arc<H>,
        buffers: Arc<BufferManager>,
        config: &SocketConfig,
        release: Option<ReleaseFn>,
    ) -> Result<ReliableSocket, SocketError>
    where
        H: MessageHandler,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mux = Arc::new(Mux::new(config.kcp_inline, is_listener, config.kcp_handshake_timeout, config.kcp_teardown_timeout));
        let (endpoint, outbound) = StreamEndpoint::new(local_addr, remote_addr, config.write_queue_limit);
        let app_socket = Arc::new(MuxSocket::new(mux.clone(), endpoint.clone()));
        let (reader, writer) = tokio::io::split(transport);

        let inner = StreamSocket::spawn(StreamSocketArgs {
            endpoint: endpoint.clone(),
            outbound,
            reader,
            writer: ByteStreamWriter::new(writer, config.write_timeout),
            handler,
            framing: MuxFraming { mux: mux.clone(), raw: endpoint.clone() },
            app_socket: app_socket.clone(),
            buffers,
            read_timeout: config.read_timeout,
            release,
        });

        if let Err(e) = mux.init(endpoint.as_ref()).await {
            warn!("handshake with {} failed: {}", remote_addr, e);
            inner.force_close();
            inner.join().await;
            return Err(e);
        }

        debug!("connection to {} established", remote_addr);
        Ok(ReliableSocket { mux, app_socket, inner })
    }

    pub fn state(&self) -> MuxState {
        self.mux.state()
    }

    pub fn send_msg(&self, msg: Bytes) -> Result<(), SocketError> {
        self.app_socket.send_msg(msg)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.app_socket.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.app_socket.remote_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Runs the teardown (bounded, best effort), then shuts down the transport and waits for
    ///  the loops to finish. There is no teardown once the transport has gone away.
    pub async fn close(&self) {
        if self.inner.is_closed() {
            debug!("transport to {} is closed, skipping teardown", self.remote_addr());
        }
        else {
            self.mux.close(self.inner.endpoint().as_ref()).await;
        }
        self.inner.force_close();
        self.inner.join().await;
    }
}
