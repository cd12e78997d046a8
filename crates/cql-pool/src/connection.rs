//! A live, handshaked connection owned by a pool.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_rustls::client::TlsStream;
use tokio_util::codec::Framed;

use crate::address::Address;
use crate::error::RequestError;
use crate::proto::{Frame, FrameCodec, Message, ProtocolVersion, ResultKind};

/// Either a plaintext or a TLS-wrapped TCP stream.
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// The outcome delivered to a request's responder.
pub type RequestOutcome = Result<ResultKind, RequestError>;

/// A request to be written on a pooled connection.
///
/// The responder receives the outcome once the server replies, or a
/// [`RequestError::ConnectionClosed`] if the connection goes away first.
#[derive(Debug)]
pub struct Request {
    /// The query text.
    pub query: String,
    /// Completion channel for the response.
    pub responder: oneshot::Sender<RequestOutcome>,
}

enum Command {
    Write(Request),
    Flush,
    Close,
}

struct ConnectionShared {
    in_flight: AtomicUsize,
    keyspace: RwLock<Option<String>>,
}

/// One live, handshaked connection to one address.
///
/// Owned exclusively by its [`ConnectionPool`](crate::ConnectionPool). A
/// reference obtained through `find_least_busy` is a non-owning, time-bounded
/// view: perform the write and flush before yielding back to the scheduler,
/// because the pool may close the connection between turns.
pub struct PooledConnection {
    address: Address,
    shared: Arc<ConnectionShared>,
    commands: mpsc::UnboundedSender<Command>,
    closed: watch::Receiver<bool>,
    max_in_flight: usize,
}

impl PooledConnection {
    /// Spawn the I/O task for a freshly handshaked transport and return the
    /// connection handle.
    pub(crate) fn spawn(
        address: Address,
        keyspace: Option<String>,
        framed: Framed<Transport, FrameCodec>,
        version: ProtocolVersion,
        max_in_flight: usize,
    ) -> Self {
        let shared = Arc::new(ConnectionShared {
            in_flight: AtomicUsize::new(0),
            keyspace: RwLock::new(keyspace),
        });
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(io_task(
            address.clone(),
            framed,
            command_rx,
            Arc::clone(&shared),
            closed_tx,
            version,
        ));

        Self {
            address,
            shared,
            commands: command_tx,
            closed: closed_rx,
            max_in_flight,
        }
    }

    /// The address this connection belongs to.
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The currently selected keyspace, if any.
    ///
    /// Updated when a keyspace-switch query completes on this connection.
    #[must_use]
    pub fn keyspace(&self) -> Option<String> {
        self.shared.keyspace.read().clone()
    }

    /// Number of requests currently awaiting a response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Whether the connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Queue a request on this connection.
    ///
    /// Returns `false` if the connection is closed or at its in-flight cap.
    /// The write is buffered; call [`flush`](Self::flush) to push buffered
    /// requests to the socket.
    pub fn write(&self, request: Request) -> bool {
        if self.is_closed() || self.in_flight() >= self.max_in_flight {
            return false;
        }
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.commands.send(Command::Write(request)).is_err() {
            self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Flush buffered writes to the socket.
    pub fn flush(&self) {
        let _ = self.commands.send(Command::Flush);
    }

    /// Write a query, flush, and await its result.
    pub async fn execute(&self, query: impl Into<String>) -> RequestOutcome {
        let (responder, response) = oneshot::channel();
        let request = Request {
            query: query.into(),
            responder,
        };
        if !self.write(request) {
            return Err(RequestError::ConnectionClosed);
        }
        self.flush();
        response.await.map_err(|_| RequestError::ConnectionClosed)?
    }

    /// Close the connection. The I/O task fails any outstanding requests.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Wait until the connection has closed.
    pub(crate) async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("address", &self.address)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn io_task(
    address: Address,
    mut framed: Framed<Transport, FrameCodec>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<ConnectionShared>,
    closed_tx: watch::Sender<bool>,
    version: ProtocolVersion,
) {
    let mut pending: HashMap<i16, oneshot::Sender<RequestOutcome>> = HashMap::new();
    let mut next_stream: i16 = 0;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Write(request)) => {
                    let stream = allocate_stream(&pending, &mut next_stream);
                    pending.insert(stream, request.responder);
                    let frame = Frame {
                        version,
                        stream,
                        message: Message::Query(request.query),
                    };
                    if let Err(error) = framed.feed(frame).await {
                        tracing::debug!(%address, %error, "write failed, closing connection");
                        break;
                    }
                }
                Some(Command::Flush) => {
                    if let Err(error) = framed.flush().await {
                        tracing::debug!(%address, %error, "flush failed, closing connection");
                        break;
                    }
                }
                Some(Command::Close) | None => break,
            },
            incoming = framed.next() => match incoming {
                Some(Ok(frame)) => dispatch_response(&address, frame, &mut pending, &shared),
                Some(Err(error)) => {
                    tracing::debug!(%address, %error, "read failed, closing connection");
                    break;
                }
                None => {
                    tracing::debug!(%address, "peer closed connection");
                    break;
                }
            },
        }
    }

    for (_, responder) in pending.drain() {
        shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        let _ = responder.send(Err(RequestError::ConnectionClosed));
    }
    let _ = closed_tx.send(true);
}

fn dispatch_response(
    address: &Address,
    frame: Frame,
    pending: &mut HashMap<i16, oneshot::Sender<RequestOutcome>>,
    shared: &ConnectionShared,
) {
    let Some(responder) = pending.remove(&frame.stream) else {
        tracing::trace!(%address, stream = frame.stream, "response for unknown stream");
        return;
    };
    shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    let outcome = match frame.message {
        Message::Result(kind) => {
            if let ResultKind::SetKeyspace(keyspace) = &kind {
                *shared.keyspace.write() = Some(keyspace.clone());
            }
            Ok(kind)
        }
        Message::Error { code, message } => Err(RequestError::Server { code, message }),
        _ => Err(RequestError::Unexpected),
    };
    let _ = responder.send(outcome);
}

// Stream ids are non-negative and reused only after their response arrives.
fn allocate_stream(
    pending: &HashMap<i16, oneshot::Sender<RequestOutcome>>,
    next: &mut i16,
) -> i16 {
    loop {
        let id = *next;
        *next = next.wrapping_add(1) & 0x7FFF;
        if !pending.contains_key(&id) {
            return id;
        }
    }
}
