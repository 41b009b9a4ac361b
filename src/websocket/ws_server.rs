use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::SocketConfig;
use crate::connection_set::ConnectionSet;
use crate::handler::MessageHandler;
use crate::signal::Signal;
use crate::stream_socket::StreamSocket;
use crate::websocket::{spawn_websocket, ws_config};

/// Rejects upgrade requests for any path other than `path`
fn check_path(path: &str, request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == path {
        return Ok(response);
    }

    debug!("rejecting upgrade request for {}", request.uri());
    let mut rejection = ErrorResponse::new(Some(format!("no WebSocket endpoint at {}", request.uri().path())));
    *rejection.status_mut() = StatusCode::NOT_FOUND;
    Err(rejection)
}

struct Acceptor<H: MessageHandler> {
    local_addr: SocketAddr,
    handler: Arc<H>,
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
                    Ok((stream, peer)) => {
                        tokio::spawn(self.clone().on_accepted(stream, peer));
                    }
                    Err(e) => warn!("error accepting TCP connection: {}", e),
                },
            }
        }

        info!("accept loop on {} finished", self.local_addr);
    }

    #[instrument(name="ws_handshake", skip_all, fields(peer=%peer))]
    async fn on_accepted(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        debug!("received connection request");

        let path = self.config.websocket_path.clone();
        let handshake = accept_hdr_async_with_config(
            stream,
            move |request: &Request, response: Response| check_path(&path, request, response),
            Some(ws_config(&self.config)),
        );
        let ws = match timeout(self.config.read_timeout, handshake).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                warn!("WebSocket handshake failed: {}", e);
                return;
            }
            Err(_) => {
                warn!("timeout in WebSocket handshake");
                return;
            }
        };

        self.register(ws, peer).await;
    }

    /// Tracks a new connection. A connection arriving while the server is closing is closed right
    ///  away, since `close` may already have drained the set.
    async fn register<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(&self, ws: WebSocketStream<S>, peer: SocketAddr) {
        let id = Uuid::new_v4();
        let connections = self.connections.clone();
        let release = Box::new(move || { connections.remove(&id); });

        let socket = Arc::new(spawn_websocket(ws, self.local_addr, peer, self.handler.clone(), &self.config, Some(release)));
        self.connections.insert(id, socket.clone());
        if socket.is_closed() {
            self.connections.remove(&id);
        }
        else if self.stop.is_fired() {
            debug!("server is closing, closing new connection");
            self.connections.remove(&id);
            socket.close().await;
        }
    }
}

/// Accepts WebSocket upgrades on the configured path, running a connection for each of them
pub struct WsServer<H: MessageHandler> {
    acceptor: Arc<Acceptor<H>>,
    accept_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<H: MessageHandler> WsServer<H> {
    pub async fn bind(addr: SocketAddr, handler: Arc<H>, config: Arc<SocketConfig>) -> anyhow::Result<WsServer<H>> {
        config.validate()?;

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let acceptor = Arc::new(Acceptor {
            local_addr,
            handler,
            config,
            connections: Arc::new(ConnectionSet::default()),
            stop: Signal::new(),
        });

        let accept_loop = tokio::spawn(acceptor.clone().accept_loop(listener));

        Ok(WsServer {
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

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::io::duplex;
    use tokio_tungstenite::tungstenite::handshake::client::generate_key;
    use tokio_tungstenite::tungstenite::http;
    use tokio_tungstenite::tungstenite::protocol::Role;

    use super::*;
    use crate::test_util::LengthPrefixedHandler;

    fn request(path: &str) -> Request {
        http::Request::builder()
            .uri(format!("ws://localhost{}", path))
            .header("Sec-WebSocket-Key", generate_key())
            .body(())
            .unwrap()
    }

    #[rstest]
    #[case::root("/", "/", true)]
    #[case::other_path("/", "/chat", false)]
    #[case::configured_path("/chat", "/chat", true)]
    #[case::query_is_ignored("/chat", "/chat?x=1", true)]
    #[case::prefix_only("/chat", "/chat/more", false)]
    fn test_check_path(#[case] configured: &str, #[case] requested: &str, #[case] accepted: bool) {
        match check_path(configured, &request(requested), Response::new(())) {
            Ok(_) => assert!(accepted),
            Err(rejection) => {
                assert!(!accepted);
                assert_eq!(rejection.status(), StatusCode::NOT_FOUND);
            }
        }
    }

    #[tokio::test]
    async fn test_connection_registered_during_close_is_closed() {
        let (handler, _rx) = LengthPrefixedHandler::new(None);
        let acceptor = Acceptor {
            local_addr: "127.0.0.1:1".parse().unwrap(),
            handler: handler.clone(),
            config: Arc::new(SocketConfig::default()),
            connections: Arc::new(ConnectionSet::default()),
            stop: Signal::new(),
        };

        // the server's close fired and drained the set while the handshake was still running
        acceptor.stop.fire();
        assert!(acceptor.connections.drain().is_empty());

        let (local, _remote) = duplex(1024);
        let ws = WebSocketStream::from_raw_socket(local, Role::Server, None).await;
        acceptor.register(ws, "127.0.0.1:2".parse().unwrap()).await;

        assert!(acceptor.connections.is_empty());
        assert_eq!(handler.connects(), 1);
        assert_eq!(handler.disconnects(), 1);
    }
}
