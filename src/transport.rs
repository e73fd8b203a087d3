//! Worker connection transport.
//!
//! The broker carries no wire protocol of its own: a [`Connection`] is any
//! already-established full-duplex framed channel to one worker process.
//! Two implementations ship here: an in-memory crossed pair for embedding
//! and tests, and u32 length-prefixed framing over an arbitrary byte stream.

use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, timeout_at, Instant};

/// Maximum accepted frame length (10 MiB).
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Stable identity of one worker connection.
///
/// Drawn from a process-global counter, so ids never collide across
/// concurrently accepted connections and stay valid for as long as the
/// connection object exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next unused id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Errors produced by connection I/O.
///
/// The broker branches on exactly these three classes: `Timeout` keeps a
/// loop running, `Closed` ends a connection's run benignly, `Io` escalates
/// to a failed run.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,

    #[error("connection closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl TransportError {
    /// True when the error only means the peer went away.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Map an I/O error to its transport class. End-of-stream conditions mean
/// the peer disconnected, everything else is unexpected.
fn classify(e: io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            TransportError::Closed
        }
        _ => TransportError::Io(e),
    }
}

/// An established bidirectional framed channel to one worker process.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Identity of this connection, distinct from all others in the process.
    fn id(&self) -> ConnectionId;

    /// Receive one frame, waiting at most `wait`.
    async fn recv_frame(&self, wait: Duration) -> Result<Bytes, TransportError>;

    /// Send one frame.
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError>;
}

/// In-memory connection built from two crossed bounded channels.
///
/// [`MemoryConnection::pair`] yields the broker-side and worker-side ends;
/// frames sent on one arrive on the other. Dropping either end is observed
/// as `Closed` by its peer.
pub struct MemoryConnection {
    id: ConnectionId,
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

impl MemoryConnection {
    /// Create a crossed pair with `capacity` frames of buffer per direction.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ConnectionId::next(),
                tx: a_tx,
                rx: Mutex::new(a_rx),
            },
            Self {
                id: ConnectionId::next(),
                tx: b_tx,
                rx: Mutex::new(b_rx),
            },
        )
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn recv_frame(&self, wait: Duration) -> Result<Bytes, TransportError> {
        let mut rx = self.rx.lock().await;
        match timeout(wait, rx.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// Length-prefixed framing (u32 big-endian) over any byte stream.
///
/// Suitable for Unix sockets or duplex pipes between a worker and the
/// broker process. Frames above [`MAX_FRAME_LEN`] are refused.
pub struct FramedConnection<S> {
    id: ConnectionId,
    reader: Mutex<FrameReader<S>>,
    writer: Mutex<WriteHalf<S>>,
}

/// Read half plus the bytes accumulated so far.
///
/// Partial frames survive a receive timeout here; a timed-out
/// `recv_frame` must never desync the stream.
struct FrameReader<S> {
    stream: ReadHalf<S>,
    buf: BytesMut,
}

/// Split one complete frame off the front of `buf`, if present.
fn take_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Io(io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        )));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(len).freeze()))
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap an established stream.
    pub fn new(stream: S) -> Self {
        let (stream, writer) = tokio::io::split(stream);
        Self {
            id: ConnectionId::next(),
            reader: Mutex::new(FrameReader {
                stream,
                buf: BytesMut::new(),
            }),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<S> Connection for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn recv_frame(&self, wait: Duration) -> Result<Bytes, TransportError> {
        let mut reader = self.reader.lock().await;
        let FrameReader { stream, buf } = &mut *reader;
        let deadline = Instant::now() + wait;
        loop {
            if let Some(frame) = take_frame(buf)? {
                return Ok(frame);
            }
            // read_buf appends to the buffer, so a deadline firing between
            // reads leaves any partial frame intact for the next call.
            match timeout_at(deadline, stream.read_buf(buf)).await {
                Ok(Ok(0)) => return Err(TransportError::Closed),
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(classify(e)),
                Err(_) => return Err(TransportError::Timeout),
            }
        }
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(TransportError::Io(io::Error::new(
                ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", frame.len()),
            )));
        }
        let mut writer = self.writer.lock().await;
        let len_bytes = (frame.len() as u32).to_be_bytes();
        writer.write_all(&len_bytes).await.map_err(classify)?;
        writer.write_all(&frame).await.map_err(classify)?;
        writer.flush().await.map_err(classify)?;
        Ok(())
    }
}
