//! Read / write loop pair shared by all stream-like transports.
//!
//! A connection runs two tasks:
//! * the read loop reads into pooled buffers, accumulates bytes, and repeatedly offers the
//!   accumulated bytes to a [Framing] until it needs more data
//! * the write loop waits for queued messages, drains everything that is queued, and writes it
//!   in one go
//!
//! Shutdown always cascades the same way: the read loop ends (EOF, error, or `read_shutdown`),
//!  calls `on_disconnect` and the release callback, and fires the `close` signal. The write loop
//!  then flushes whatever is still queued, shuts down the transport's write side and fires
//!  `read_shutdown` so that a write failure takes the read side down with it.

use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::buffers::buffer_pool::{BufferManager, BufferPool};
use crate::error::SocketError;
use crate::handler::{MessageHandler, Socket};
use crate::signal::Signal;

/// Called once when a connection's read loop has ended, e.g. to remove the connection from a
///  server's set of active connections
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

/// The enqueueing side of a bounded outbound queue
pub struct Outbound<T> {
    tx: mpsc::Sender<T>,
    close: Signal,
}

impl<T> Clone for Outbound<T> {
    fn clone(&self) -> Self {
        Outbound {
            tx: self.tx.clone(),
            close: self.close.clone(),
        }
    }
}

impl<T> Outbound<T> {
    pub fn new(limit: usize, close: Signal) -> (Outbound<T>, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(limit);
        (Outbound { tx, close }, rx)
    }

    pub fn try_send(&self, item: T) -> Result<(), SocketError> {
        if self.close.is_fired() {
            return Err(SocketError::AlreadyClosed);
        }
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SocketError::Overflow),
            Err(TrySendError::Closed(_)) => Err(SocketError::AlreadyClosed),
        }
    }

    pub fn close_signal(&self) -> &Signal {
        &self.close
    }
}

/// The raw sending side of a stream connection: messages go on the wire exactly as passed in.
pub struct StreamEndpoint {
    outbound: Outbound<Bytes>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl StreamEndpoint {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr, queue_limit: usize) -> (Arc<StreamEndpoint>, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = Outbound::new(queue_limit, Signal::new());
        let endpoint = StreamEndpoint {
            outbound,
            local_addr,
            remote_addr,
        };
        (Arc::new(endpoint), rx)
    }

    pub fn close_signal(&self) -> &Signal {
        self.outbound.close_signal()
    }
}

impl Socket for StreamEndpoint {
    fn send_msg(&self, msg: Bytes) -> Result<(), SocketError> {
        self.outbound.try_send(msg)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// Turns accumulated inbound bytes into application messages.
pub trait Framing<H: MessageHandler>: Send + Sync + 'static {
    /// Returns the number of bytes consumed from the front of `buf`, 0 meaning "need more bytes"
    fn frame(&self, handler: &H, state: &mut H::State, buf: &[u8]) -> Result<usize, SocketError>;
}

/// Passes the accumulated bytes straight to the application
pub struct PlainFraming;

impl<H: MessageHandler> Framing<H> for PlainFraming {
    fn frame(&self, handler: &H, state: &mut H::State, buf: &[u8]) -> Result<usize, SocketError> {
        handler.on_message(state, buf)
            .map_err(SocketError::Handler)
    }
}

/// Offers `acc` to the framing callback until it needs more bytes. Consumed prefixes are removed
///  from `acc` and handed to the pool, unconsumed bytes stay in `acc` for the next round.
pub(crate) fn deliver<H: MessageHandler, F: Framing<H>>(
    acc: &mut BytesMut,
    handler: &H,
    framing: &F,
    state: &mut H::State,
    pool: &mut BufferPool,
) -> Result<(), SocketError> {
    while !acc.is_empty() {
        let consumed = framing.frame(handler, state, acc)?;
        if consumed == 0 {
            break;
        }
        if consumed > acc.len() {
            return Err(SocketError::protocol(format!("consumed {} bytes, but only {} are available", consumed, acc.len())));
        }
        trace!("consumed {} of {} bytes", consumed, acc.len());
        let prefix = acc.split_to(consumed);
        pool.put(&prefix);
    }
    Ok(())
}

/// Writes batches of queued items to a transport
#[async_trait]
pub trait FrameWriter: Send + 'static {
    type Item: Send + 'static;

    async fn write_batch(&mut self, batch: Vec<Self::Item>) -> Result<(), SocketError>;

    /// Called once after the last batch
    async fn shutdown(&mut self);
}

/// Writes concatenated messages to a byte stream
pub struct ByteStreamWriter<W> {
    inner: W,
    write_timeout: Duration,
}

impl<W> ByteStreamWriter<W> {
    pub fn new(inner: W, write_timeout: Duration) -> ByteStreamWriter<W> {
        ByteStreamWriter { inner, write_timeout }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> FrameWriter for ByteStreamWriter<W> {
    type Item = Bytes;

    async fn write_batch(&mut self, batch: Vec<Bytes>) -> Result<(), SocketError> {
        let mut buf = BytesMut::with_capacity(batch.iter().map(|m| m.len()).sum());
        for msg in &batch {
            buf.extend_from_slice(msg);
        }

        let mut remaining = &buf[..];
        while !remaining.is_empty() {
            let n = timeout(self.write_timeout, self.inner.write(remaining)).await
                .map_err(|_| SocketError::WriteTimeout)??;
            if n == 0 {
                return Err(SocketError::Io(std::io::ErrorKind::WriteZero.into()));
            }
            if n < remaining.len() {
                trace!("partial write of {} bytes, {} remaining", n, remaining.len() - n);
            }
            remaining = &remaining[n..];
        }

        timeout(self.write_timeout, self.inner.flush()).await
            .map_err(|_| SocketError::WriteTimeout)??;
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.inner.shutdown().await {
            debug!("error shutting down write side: {}", e);
        }
    }
}

/// Drains `queue` into `writer` until `close` fires, then flushes what is left.
pub(crate) async fn write_loop<W: FrameWriter>(mut writer: W, mut queue: mpsc::Receiver<W::Item>, close: Signal, read_shutdown: Signal) {
    let mut closing = false;
    let mut batch = Vec::new();

    loop {
        if closing {
            queue.close();
        }
        else {
            select! {
                biased;
                msg = queue.recv() => match msg {
                    Some(msg) => batch.push(msg),
                    None => closing = true,
                },
                _ = close.fired() => {
                    debug!("close signal received, flushing remaining messages");
                    closing = true;
                    // no further sends are accepted, but everything queued so far is still written
                    queue.close();
                }
            }
        }

        while let Ok(msg) = queue.try_recv() {
            batch.push(msg);
        }

        if !batch.is_empty() {
            trace!("writing batch of {} messages", batch.len());
            if let Err(e) = writer.write_batch(mem::take(&mut batch)).await {
                warn!("write loop exit with error: {}", e);
                close.fire();
                break;
            }
        }

        if closing {
            break;
        }
    }

    writer.shutdown().await;
    read_shutdown.fire();
    debug!("write loop finished");
}

struct ReadLoop<H: MessageHandler, F, R> {
    reader: R,
    handler: Arc<H>,
    framing: F,
    app_socket: Arc<dyn Socket>,
    pool: BufferPool,
    read_timeout: Duration,
    read_shutdown: Signal,
    close: Signal,
    release: Option<ReleaseFn>,
}

impl<H: MessageHandler, F: Framing<H>, R: AsyncRead + Unpin + Send + 'static> ReadLoop<H, F, R> {
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
        let mut acc = BytesMut::new();

        loop {
            let mut buf = self.pool.get();

            let n = select! {
                biased;
                _ = self.read_shutdown.fired() => {
                    self.pool.put(&buf);
                    return Ok(());
                }
                r = timeout(self.read_timeout, self.reader.read(&mut buf[..])) => match r {
                    Err(_) => return Err(SocketError::ReadTimeout),
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok(0)) => {
                        debug!("EOF");
                        return Ok(());
                    }
                    Ok(Ok(n)) => n,
                }
            };

            trace!("read {} bytes", n);
            self.pool.put(&buf[n..]);
            acc.extend_from_slice(&buf[..n]);

            deliver(&mut acc, &*self.handler, &self.framing, state, &mut self.pool)?;
        }
    }
}

/// Everything a [StreamSocket] needs to start its loops
pub struct StreamSocketArgs<H: MessageHandler, F, R, W> {
    pub endpoint: Arc<StreamEndpoint>,
    pub outbound: mpsc::Receiver<Bytes>,
    pub reader: R,
    pub writer: W,
    pub handler: Arc<H>,
    pub framing: F,
    /// The socket passed to `on_connect`, typically `endpoint` or a wrapper around it
    pub app_socket: Arc<dyn Socket>,
    pub buffers: Arc<BufferManager>,
    pub read_timeout: Duration,
    pub release: Option<ReleaseFn>,
}

/// A running connection over a byte stream
pub struct StreamSocket {
    endpoint: Arc<StreamEndpoint>,
    read_shutdown: Signal,
    loops: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl StreamSocket {
    pub fn spawn<H, F, R, W>(args: StreamSocketArgs<H, F, R, W>) -> StreamSocket
    where
        H: MessageHandler,
        F: Framing<H>,
        R: AsyncRead + Unpin + Send + 'static,
        W: FrameWriter<Item = Bytes>,
    {
        let span = info_span!("stream_socket", id = %Uuid::new_v4(), peer = %args.endpoint.remote_addr());
        let close = args.endpoint.close_signal().clone();
        let read_shutdown = Signal::new();

        let read_loop = ReadLoop {
            reader: args.reader,
            handler: args.handler,
            framing: args.framing,
            app_socket: args.app_socket,
            pool: BufferPool::new(args.buffers),
            read_timeout: args.read_timeout,
            read_shutdown: read_shutdown.clone(),
            close: close.clone(),
            release: args.release,
        };

        let read_handle = tokio::spawn(read_loop.run().instrument(span.clone()));
        let write_handle = tokio::spawn(write_loop(args.writer, args.outbound, close, read_shutdown.clone()).instrument(span));

        StreamSocket::from_loops(args.endpoint, read_shutdown, vec![read_handle, write_handle])
    }

    /// Wraps loops that were spawned elsewhere but follow the same shutdown cascade
    pub(crate) fn from_loops(endpoint: Arc<StreamEndpoint>, read_shutdown: Signal, loops: Vec<JoinHandle<()>>) -> StreamSocket {
        StreamSocket {
            endpoint,
            read_shutdown,
            loops: tokio::sync::Mutex::new(loops),
        }
    }

    pub fn endpoint(&self) -> &Arc<StreamEndpoint> {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.endpoint.close_signal().is_fired()
    }

    /// Stops reading, lets the write loop flush everything queued so far, and waits for both
    ///  loops to finish. Must not be called from inside a handler callback of this socket.
    pub async fn close(&self) {
        self.read_shutdown.fire();
        self.join().await;
    }

    /// Stops both loops without waiting for them
    pub fn force_close(&self) {
        self.read_shutdown.fire();
        self.endpoint.close_signal().fire();
    }

    pub async fn join(&self) {
        let mut loops = self.loops.lock().await;
        for handle in loops.drain(..) {
            if let Err(e) = handle.await {
                warn!("socket loop did not terminate cleanly: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::rstest;
    use tokio::io::duplex;
    use tokio::runtime::Builder;

    use super::*;
    use crate::test_util::{length_prefixed, peer_socket, LengthPrefixedHandler};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[rstest]
    #[case::one_piece(vec![3, 5, 7], vec![100])]
    #[case::byte_by_byte(vec![3, 5, 7], vec![1; 100])]
    #[case::split_headers(vec![2, 10], vec![2, 3, 1, 30])]
    #[case::empty_payloads(vec![0, 0, 4], vec![5, 5, 5])]
    fn test_deliver_incremental(#[case] payload_lens: Vec<usize>, #[case] chunk_lens: Vec<usize>) {
        let (handler, mut received) = LengthPrefixedHandler::new(None);
        let manager = Arc::new(BufferManager::new(4, 16));
        let mut pool = BufferPool::new(manager);

        let payloads: Vec<Vec<u8>> = payload_lens.iter().enumerate()
            .map(|(i, len)| vec![i as u8; *len])
            .collect();
        let mut wire = Vec::new();
        for p in &payloads {
            wire.extend_from_slice(&length_prefixed(p));
        }

        let mut state = handler.on_connect(peer_socket(addr(1), addr(2)));
        let mut acc = BytesMut::new();
        let mut offset = 0;
        for len in chunk_lens {
            let end = (offset + len).min(wire.len());
            acc.extend_from_slice(&wire[offset..end]);
            offset = end;
            deliver(&mut acc, &*handler, &PlainFraming, &mut state, &mut pool).unwrap();
        }

        assert!(acc.is_empty());
        let mut actual = Vec::new();
        while let Ok((from, payload)) = received.try_recv() {
            assert_eq!(from, addr(2));
            actual.push(payload);
        }
        assert_eq!(actual, payloads);
    }

    struct OverConsuming;
    impl MessageHandler for OverConsuming {
        type State = ();
        fn on_connect(&self, _socket: Arc<dyn Socket>) {}
        fn on_message(&self, _state: &mut (), buf: &[u8]) -> anyhow::Result<usize> {
            Ok(buf.len() + 1)
        }
        fn on_disconnect(&self, _state: ()) {}
    }

    #[test]
    fn test_deliver_rejects_over_consumption() {
        let mut pool = BufferPool::new(Arc::new(BufferManager::new(4, 4)));
        let mut acc = BytesMut::from(&b"abc"[..]);
        let result = deliver(&mut acc, &OverConsuming, &PlainFraming, &mut (), &mut pool);
        assert!(matches!(result, Err(SocketError::Protocol(_))));
    }

    #[test]
    fn test_outbound_overflow_and_closed() {
        let close = Signal::new();
        let (outbound, _rx) = Outbound::<u32>::new(2, close.clone());

        outbound.try_send(1).unwrap();
        outbound.try_send(2).unwrap();
        assert!(matches!(outbound.try_send(3), Err(SocketError::Overflow)));

        close.fire();
        assert!(matches!(outbound.try_send(4), Err(SocketError::AlreadyClosed)));
    }

    fn spawn_socket(
        handler: Arc<LengthPrefixedHandler>,
        transport: tokio::io::DuplexStream,
        queue_limit: usize,
        release: Option<ReleaseFn>,
    ) -> StreamSocket {
        let (reader, writer) = tokio::io::split(transport);
        let (endpoint, outbound) = StreamEndpoint::new(addr(1), addr(2), queue_limit);
        StreamSocket::spawn(StreamSocketArgs {
            app_socket: endpoint.clone(),
            endpoint,
            outbound,
            reader,
            writer: ByteStreamWriter::new(writer, Duration::from_secs(10)),
            handler,
            framing: PlainFraming,
            buffers: Arc::new(BufferManager::new(8, 16)),
            read_timeout: Duration::from_secs(60),
            release,
        })
    }

    #[tokio::test]
    async fn test_receive_and_reply() {
        let (handler, mut received) = LengthPrefixedHandler::new(Some(b"ack".to_vec()));
        let (local, mut remote) = duplex(1024);
        let socket = spawn_socket(handler.clone(), local, 16, None);

        for _ in 0..3 {
            remote.write_all(&length_prefixed(b"hello, world")).await.unwrap();
        }

        for _ in 0..3 {
            let (_, payload) = received.recv().await.unwrap();
            assert_eq!(payload, b"hello, world");
        }

        let expected: Vec<u8> = (0..3).flat_map(|_| length_prefixed(b"ack")).collect();
        let mut actual = vec![0u8; expected.len()];
        remote.read_exact(&mut actual).await.unwrap();
        assert_eq!(actual, expected);

        socket.close().await;
        assert_eq!(handler.connects(), 1);
        assert_eq!(handler.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_close_flushes_queued_messages() {
        let (handler, _received) = LengthPrefixedHandler::new(None);
        let (local, mut remote) = duplex(64 * 1024);
        let socket = spawn_socket(handler, local, 100, None);

        for i in 0..50u8 {
            socket.endpoint().send_msg(Bytes::from(vec![i; 10])).unwrap();
        }
        socket.close().await;

        assert!(matches!(socket.endpoint().send_msg(Bytes::from_static(b"late")), Err(SocketError::AlreadyClosed)));

        let mut all = Vec::new();
        remote.read_to_end(&mut all).await.unwrap();
        let expected: Vec<u8> = (0..50u8).flat_map(|i| vec![i; 10]).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_overflow_does_not_block() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (handler, _received) = LengthPrefixedHandler::new(None);
            // the peer never reads, so the write loop stalls once the duplex buffer is full
            let (local, _remote) = duplex(16);
            let socket = spawn_socket(handler, local, 4, None);

            let mut overflowed = false;
            for _ in 0..100 {
                match socket.endpoint().send_msg(Bytes::from_static(b"0123456789")) {
                    Ok(()) => {}
                    Err(SocketError::Overflow) => {
                        overflowed = true;
                        break;
                    }
                    Err(e) => panic!("unexpected error {}", e),
                }
                tokio::task::yield_now().await;
            }
            assert!(overflowed);
            socket.force_close();
        });
    }

    #[tokio::test]
    async fn test_peer_eof_releases() {
        let (handler, _received) = LengthPrefixedHandler::new(None);
        let (local, remote) = duplex(1024);
        let released = Arc::new(AtomicUsize::new(0));
        let released2 = released.clone();
        let socket = spawn_socket(handler.clone(), local, 16, Some(Box::new(move || { released2.fetch_add(1, Ordering::SeqCst); })));

        drop(remote);
        socket.join().await;

        assert!(socket.is_closed());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(handler.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_terminates() {
        let (handler, _received) = LengthPrefixedHandler::new(None);
        let (local, mut remote) = duplex(1024);
        let socket = spawn_socket(handler.clone(), local, 16, None);

        // a length prefix beyond the handler's limit is rejected
        remote.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        socket.join().await;

        assert!(socket.is_closed());
        assert_eq!(handler.disconnects(), 1);
    }
}
