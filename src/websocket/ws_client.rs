use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio_tungstenite::client_async_with_config;
use tracing::info;

use crate::config::SocketConfig;
use crate::error::SocketError;
use crate::handler::{MessageHandler, Socket};
use crate::stream_socket::StreamSocket;
use crate::websocket::{spawn_websocket, ws_config};

pub struct WsClient<H: MessageHandler> {
    remote_addr: SocketAddr,
    handler: Arc<H>,
    config: Arc<SocketConfig>,
    socket: StreamSocket,
}

impl<H: MessageHandler> WsClient<H> {
    /// Connects to `ws://<remote_addr><websocket_path>`
    pub async fn connect(remote_addr: SocketAddr, handler: Arc<H>, config: Arc<SocketConfig>) -> anyhow::Result<WsClient<H>> {
        config.validate()?;
        let socket = Self::dial(remote_addr, &handler, &config).await?;

        Ok(WsClient {
            remote_addr,
            handler,
            config,
            socket,
        })
    }

    async fn dial(remote_addr: SocketAddr, handler: &Arc<H>, config: &SocketConfig) -> anyhow::Result<StreamSocket> {
        let url = format!("ws://{}{}", remote_addr, config.websocket_path);
        info!("connecting to {}", url);

        let stream = TcpStream::connect(remote_addr).await?;
        let local_addr = stream.local_addr()?;
        let (ws, _response) = client_async_with_config(url, stream, Some(ws_config(config))).await?;

        Ok(spawn_websocket(ws, local_addr, remote_addr, handler.clone(), config, None))
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
        self.socket = Self::dial(self.remote_addr, &self.handler, &self.config).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{eventually, length_prefixed, receive_n, LengthPrefixedHandler};
    use crate::websocket::ws_server::WsServer;

    fn config(path: &str) -> Arc<SocketConfig> {
        Arc::new(SocketConfig {
            websocket_path: path.to_string(),
            ..SocketConfig::default()
        })
    }

    #[tokio::test]
    async fn test_hello_ack() {
        let (server_handler, mut server_rx) = LengthPrefixedHandler::new(Some(b"hello-ack".to_vec()));
        let server = WsServer::bind("127.0.0.1:0".parse().unwrap(), server_handler.clone(), config("/ws")).await.unwrap();

        let (client_handler, mut client_rx) = LengthPrefixedHandler::new(None);
        let client = WsClient::connect(server.local_addr(), client_handler.clone(), config("/ws")).await.unwrap();

        for _ in 0..5 {
            client.send_msg(length_prefixed(b"hello")).unwrap();
        }

        let received = receive_n(&mut server_rx, 5).await;
        assert!(received.iter().all(|(peer, p)| *peer == client.local_addr() && p == b"hello"));
        let acks = receive_n(&mut client_rx, 5).await;
        assert!(acks.iter().all(|(peer, p)| *peer == server.local_addr() && p == b"hello-ack"));

        client.close().await;
        assert_eq!(client_handler.disconnects(), 1);
        eventually(|| server.num_connections() == 0).await;
        assert_eq!(server_handler.disconnects(), 1);

        server.close().await;
    }

    #[tokio::test]
    async fn test_wrong_path_is_rejected() {
        let (server_handler, _server_rx) = LengthPrefixedHandler::new(None);
        let server = WsServer::bind("127.0.0.1:0".parse().unwrap(), server_handler.clone(), config("/ws")).await.unwrap();

        let (client_handler, _client_rx) = LengthPrefixedHandler::new(None);
        assert!(WsClient::connect(server.local_addr(), client_handler.clone(), config("/other")).await.is_err());
        assert_eq!(client_handler.connects(), 0);
        assert_eq!(server_handler.connects(), 0);
        assert_eq!(server.num_connections(), 0);

        server.close().await;
    }

    #[tokio::test]
    async fn test_oversized_message_ends_connection() {
        let (server_handler, _server_rx) = LengthPrefixedHandler::new(None);
        let server = WsServer::bind("127.0.0.1:0".parse().unwrap(), server_handler.clone(), config("/")).await.unwrap();

        let client_config = Arc::new(SocketConfig {
            websocket_max_message_size: 64 * 1024,
            ..SocketConfig::default()
        });
        let (client_handler, _client_rx) = LengthPrefixedHandler::new(None);
        let client = WsClient::connect(server.local_addr(), client_handler.clone(), client_config).await.unwrap();

        client.send_msg(length_prefixed(&[7u8; 4096])).unwrap();

        eventually(|| server_handler.disconnects() == 1).await;
        eventually(|| client.is_closed()).await;
        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_server_close_and_reconnect() {
        let (server_handler, mut server_rx) = LengthPrefixedHandler::new(None);
        let server = WsServer::bind("127.0.0.1:0".parse().unwrap(), server_handler.clone(), config("/")).await.unwrap();

        let (client_handler, _client_rx) = LengthPrefixedHandler::new(None);
        let mut client = WsClient::connect(server.local_addr(), client_handler.clone(), config("/")).await.unwrap();
        let first_local = client.local_addr();

        client.reconnect().await.unwrap();
        assert_ne!(client.local_addr(), first_local);
        client.send_msg(length_prefixed(b"again")).unwrap();
        let received = receive_n(&mut server_rx, 1).await;
        assert_eq!(received[0], (client.local_addr(), b"again".to_vec()));
        assert_eq!(client_handler.connects(), 2);

        server.close().await;
        assert_eq!(server_handler.disconnects(), 2);
        eventually(|| client.is_closed()).await;
        assert_eq!(client_handler.disconnects(), 2);
        assert!(matches!(client.send_msg(length_prefixed(b"late")), Err(SocketError::AlreadyClosed)));
    }
}
