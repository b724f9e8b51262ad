//! Connection Handler
//!
//! One task per client connection. The task owns the socket and the
//! connection's [`ClientConnection`] state and waits on three sources:
//!
//! ```text
//!            ┌──────────────────────── socket bytes ─────────────┐
//!            │                                                   ▼
//!  client ───┤                                    parse frame ─> CommandExecutor ─> reply
//!            │
//!            ├──── <── EVENT frames <── session event queue <── EventHub
//!            │
//!            └──── close <── TransportHandle (session replaced or disposed)
//! ```
//!
//! Commands of one connection are executed strictly one after another.
//! Pushed events are written between replies, in queue order. When the
//! loop ends for any reason the session is handed to
//! [`CommandExecutor::close_connection`] for teardown.
//!
//! ## Buffer Management
//!
//! Incoming bytes accumulate in a `BytesMut`; TCP may deliver partial
//! frames or several frames per read.

use crate::commands::CommandExecutor;
use crate::protocol::{Frame, FrameError, FrameParser};
use crate::session::{CacheEvent, ClientConnection, TransportHandle};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Upper bound on buffered, not yet parsed bytes (128 MB)
const MAX_BUFFER_SIZE: usize = 128 * 1024 * 1024;

const INITIAL_BUFFER_SIZE: usize = 8192;

/// Counters shared by all connections.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub connections_accepted: AtomicU64,
    pub active_connections: AtomicU64,
    pub commands_processed: AtomicU64,
    pub events_pushed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_pushed(&self) {
        self.events_pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    FrameError(#[from] FrameError),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Buffer size limit exceeded")]
    BufferFull,

    /// The session asked for its transport to be closed
    #[error("Transport closed by session")]
    TransportClosed,
}

/// State of one connection task.
pub struct ConnectionHandler {
    reader: OwnedReadHalf,
    writer: BufWriter<OwnedWriteHalf>,
    conn: ClientConnection,
    close_rx: watch::Receiver<bool>,
    events: Option<mpsc::UnboundedReceiver<CacheEvent>>,
    event_push: bool,
    buffer: BytesMut,
    parser: FrameParser,
    executor: Arc<CommandExecutor>,
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        executor: Arc<CommandExecutor>,
        stats: Arc<ConnectionStats>,
        event_push: bool,
    ) -> Result<Self, ConnectionError> {
        let local = stream.local_addr()?;
        let (reader, writer) = stream.into_split();
        let (transport, close_rx) = TransportHandle::new();
        stats.connection_opened();

        Ok(Self {
            reader,
            writer: BufWriter::new(writer),
            conn: ClientConnection::new(addr, local, transport),
            close_rx,
            events: None,
            event_push,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            parser: FrameParser::new(),
            executor,
            stats,
        })
    }

    /// Runs the connection until it ends, then tears its session down.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let addr = self.conn.peer();
        info!(client = %addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %addr, "Client disconnected gracefully"),
            Err(ConnectionError::ClientDisconnected) => debug!(client = %addr, "Client disconnected"),
            Err(ConnectionError::TransportClosed) => {
                debug!(client = %addr, "Connection closed by its session")
            }
            Err(ConnectionError::IoError(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %addr, error = %e, "Connection error"),
        }

        self.executor.close_connection(&mut self.conn);
        let _ = self.writer.shutdown().await;
        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            while let Some(frame) = self.try_parse_frame().await? {
                let reply = self.executor.execute(&mut self.conn, frame);
                self.stats.command_processed();
                self.send_frame(&reply).await?;
                self.attach_event_queue();
            }

            tokio::select! {
                read = read_into(&mut self.reader, &mut self.buffer) => {
                    let n = read?;
                    self.stats.bytes_read(n);
                    trace!(client = %self.conn.peer(), bytes = n, "Read data");
                }
                event = next_event(&mut self.events) => match event {
                    Some(event) => {
                        self.send_frame(&event.to_frame()).await?;
                        self.stats.event_pushed();
                    }
                    None => self.events = None,
                },
                _ = self.close_rx.changed() => {
                    return Err(ConnectionError::TransportClosed);
                }
            }
        }
    }

    /// Starts draining the session's event queue once a handshake succeeded.
    ///
    /// With push disabled a queue bound anyway is closed here, which makes
    /// the hub drop it on its next publish.
    fn attach_event_queue(&mut self) {
        if self.events.is_some() {
            return;
        }
        let Some(session) = self.conn.session() else {
            return;
        };
        let receiver = session.take_event_receiver();
        if self.event_push {
            self.events = receiver;
        }
    }

    async fn try_parse_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse(&self.buffer) {
            Ok(Some((frame, consumed))) => {
                let _ = self.buffer.split_to(consumed);
                trace!(
                    client = %self.conn.peer(),
                    consumed,
                    remaining = self.buffer.len(),
                    "Parsed frame"
                );
                Ok(Some(frame))
            }
            Ok(None) => {
                if self.buffer.len() >= MAX_BUFFER_SIZE {
                    error!(
                        client = %self.conn.peer(),
                        size = self.buffer.len(),
                        "Buffer size limit exceeded"
                    );
                    return Err(ConnectionError::BufferFull);
                }
                Ok(None)
            }
            Err(e) => {
                warn!(client = %self.conn.peer(), error = %e, "Frame error");
                self.send_frame(&Frame::error(format!("ERR protocol error: {}", e)))
                    .await?;
                Err(ConnectionError::FrameError(e))
            }
        }
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<(), ConnectionError> {
        let bytes = frame.serialize();
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        self.stats.bytes_written(bytes.len());
        trace!(client = %self.conn.peer(), bytes = bytes.len(), "Sent frame");
        Ok(())
    }
}

async fn read_into(reader: &mut OwnedReadHalf, buffer: &mut BytesMut) -> Result<usize, ConnectionError> {
    if buffer.capacity() - buffer.len() < 1024 {
        buffer.reserve(INITIAL_BUFFER_SIZE);
    }
    let n = reader.read_buf(buffer).await?;
    if n == 0 {
        return Err(if buffer.is_empty() {
            ConnectionError::ClientDisconnected
        } else {
            ConnectionError::UnexpectedEof
        });
    }
    Ok(n)
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<CacheEvent>>) -> Option<CacheEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Runs a connection to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    executor: Arc<CommandExecutor>,
    stats: Arc<ConnectionStats>,
    event_push: bool,
) {
    let handler = match ConnectionHandler::new(stream, addr, executor, stats, event_push) {
        Ok(handler) => handler,
        Err(e) => {
            warn!(client = %addr, error = %e, "Could not set up connection");
            return;
        }
    };
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected | ConnectionError::TransportClosed => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => debug!(client = %addr, error = %e, "Connection ended with error"),
        }
    }
}
