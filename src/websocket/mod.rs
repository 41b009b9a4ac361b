//! Message sockets over WebSocket.
//!
//! The connection follows the same read / write loop pair and shutdown cascade as the byte stream
//!  transports, but WebSocket frames messages itself: every binary or text message is passed to
//!  the handler as a whole, and there is no accumulator. Each outbound message becomes one binary
//!  message. Closing sends a close frame before the transport is shut down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::select;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::config::SocketConfig;
use crate::error::SocketError;
use crate::handler::{MessageHandler, Socket};
use crate::signal::Signal;
use crate::stream_socket::{write_loop, FrameWriter, ReleaseFn, StreamEndpoint, StreamSocket};

pub mod ws_client;
pub mod ws_server;

pub(crate) fn ws_config(config: &SocketConfig) -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(config.websocket_max_message_size),
        max_frame_size: Some(config.websocket_max_message_size),
        ..Default::default()
    }
}

struct WsFrameWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    write_timeout: Duration,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> FrameWriter for WsFrameWriter<S> {
    type Item = Bytes;

    async fn write_batch(&mut self, batch: Vec<Bytes>) -> Result<(), SocketError> {
        for msg in batch {
            timeout(self.write_timeout, self.sink.feed(Message::Binary(msg.to_vec()))).await
                .map_err(|_| SocketError::WriteTimeout)??;
        }
        timeout(self.write_timeout, self.sink.flush()).await
            .map_err(|_| SocketError::WriteTimeout)??;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let close_frame = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }));

        match timeout(self.write_timeout, self.sink.send(close_frame)).await {
            Ok(Ok(())) => debug!("sent close frame"),
            Ok(Err(tungstenite::Error::ConnectionClosed))
            | Ok(Err(tungstenite::Error::AlreadyClosed))
            | Ok(Err(tungstenite::Error::Protocol(ProtocolError::SendAfterClosing))) => debug!("close frame already sent"),
            Ok(Err(e)) => warn!("error sending close frame: {}", e),
            Err(_) => warn!("timeout sending close frame"),
        }

        match timeout(self.write_timeout, self.sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("error closing WebSocket sink: {}", e),
            Err(_) => debug!("timeout closing WebSocket sink"),
        }
    }
}

struct WsReadLoop<H: MessageHandler, S> {
    stream: SplitStream<WebSocketStream<S>>,
    handler: Arc<H>,
    app_socket: Arc<dyn Socket>,
    read_timeout: Duration,
    read_shutdown: Signal,
    close: Signal,
    release: Option<ReleaseFn>,
}

impl<H: MessageHandler, S: AsyncRead + AsyncWrite + Unpin + Send + 'static> WsReadLoop<H, S> {
    async fn run(mut self) {
        let mut state = self.handler.on_connect(self.app_socket.clone());

        match self.read_messages(&mut state).await {
            Ok(()) => debug!("read loop finished"),
            Err(e) if e.is_benign() => debug!("read loop finished: {}", e),
            Err(e) => warn!("read loop exit with error: {}", e),
        }

        self.handler.on_disconnect(state);
        if let Some(release) = self.release.take() {
            release();
        }
        self.close.fire();
    }

    async fn read_messages(&mut self, state: &mut H::State) -> Result<(), SocketError> {
        loop {
            let next = select! {
                biased;
                _ = self.read_shutdown.fired() => return Ok(()),
                r = timeout(self.read_timeout, self.stream.next()) => r.map_err(|_| SocketError::ReadTimeout)?,
            };

            let msg = match next {
                Some(msg) => msg?,
                None => {
                    debug!("stream ended");
                    return Ok(());
                }
            };

            match msg {
                Message::Binary(data) => self.deliver(state, &data)?,
                Message::Text(text) => self.deliver(state, text.as_bytes())?,
                Message::Close(frame) => {
                    debug!("received close frame: {:?}", frame);
                    return Ok(());
                }
                Message::Ping(_) | Message::Pong(_) => trace!("ping / pong"),
                Message::Frame(_) => return Err(SocketError::protocol("unexpected raw frame")),
            }
        }
    }

    fn deliver(&self, state: &mut H::State, msg: &[u8]) -> Result<(), SocketError> {
        let consumed = self.handler.on_message(state, msg)
            .map_err(SocketError::Handler)?;
        trace!("delivered message of {} bytes, {} consumed", msg.len(), consumed);
        Ok(())
    }
}

/// Runs a connection over an established WebSocket. The returned socket's `close` fires the
///  read side's shutdown, and the write loop then flushes, sends a close frame and closes the
///  transport.
pub(crate) fn spawn_websocket<H, S>(
    ws: WebSocketStream<S>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    handler: Arc<H>,
    config: &SocketConfig,
    release: Option<ReleaseFn>,
) -> StreamSocket
where
    H: MessageHandler,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let span = info_span!("websocket", id = %Uuid::new_v4(), peer = %remote_addr);
    let (endpoint, outbound) = StreamEndpoint::new(local_addr, remote_addr, config.write_queue_limit);
    let close = endpoint.close_signal().clone();
    let read_shutdown = Signal::new();
    let (sink, stream) = ws.split();

    let read_loop = WsReadLoop {
        stream,
        handler,
        app_socket: endpoint.clone(),
        read_timeout: config.read_timeout,
        read_shutdown: read_shutdown.clone(),
        close: close.clone(),
        release,
    };
    let writer = WsFrameWriter {
        sink,
        write_timeout: config.write_timeout,
    };

    let read_handle = tokio::spawn(read_loop.run().instrument(span.clone()));
    let write_handle = tokio::spawn(write_loop(writer, outbound, close, read_shutdown.clone()).instrument(span));

    StreamSocket::from_loops(endpoint, read_shutdown, vec![read_handle, write_handle])
}
