//! Length-agnostic message sockets over TCP: the framing callback decides where messages end.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::buffers::buffer_pool::BufferManager;
use crate::config::SocketConfig;
use crate::handler::MessageHandler;
use crate::stream_socket::{ByteStreamWriter, PlainFraming, ReleaseFn, StreamEndpoint, StreamSocket, StreamSocketArgs};

pub mod tcp_client;
pub mod tcp_server;

pub(crate) fn spawn_tcp_socket<H: MessageHandler>(
    stream: TcpStream,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    handler: Arc<H>,
    buffers: Arc<BufferManager>,
    config: &SocketConfig,
    release: Option<ReleaseFn>,
) -> StreamSocket {
    let (endpoint, outbound) = StreamEndpoint::new(local_addr, remote_addr, config.write_queue_limit);
    let (reader, writer) = stream.into_split();

    StreamSocket::spawn(StreamSocketArgs {
        app_socket: endpoint.clone(),
        endpoint,
        outbound,
        reader,
        writer: ByteStreamWriter::new(writer, config.write_timeout),
        handler,
        framing: PlainFraming,
        buffers,
        read_timeout: config.read_timeout,
        release,
    })
}
