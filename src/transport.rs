//! Per-leg message transport.
//!
//! A leg either carries raw bytes (plain) or a sequence of length-prefixed
//! sealed messages (keyed):
//!
//! ```text
//! +----------------+----------------------------+
//! | Length (u32 BE)| Sealed message (Length)    |
//! +----------------+----------------------------+
//! ```
//!
//! The length always counts the sealed bytes, never the plaintext. Which
//! variant a leg uses is decided once, when the connection is set up, by
//! whether a key is configured for it.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{CryptoError, MessageCipher, MAX_MESSAGE_SIZE, SEAL_OVERHEAD};

/// Length prefix size in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest sealed message a keyed reader will accept.
pub const MAX_FRAME_SIZE: usize = MAX_MESSAGE_SIZE + SEAL_OVERHEAD;

/// Default read deadline (idle ceiling).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Default write deadline.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport error types.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("decrypt failed: {0}")]
    Decrypt(#[source] CryptoError),

    #[error("encrypt failed: {0}")]
    Encrypt(#[source] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether this error came from a read or write deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Io(e) if e.kind() == io::ErrorKind::TimedOut)
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Read and write deadlines applied to every operation on a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    pub read: Duration,
    pub write: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            read: DEFAULT_READ_TIMEOUT,
            write: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Reading half of a leg.
pub trait MessageRead: Send {
    /// Reads the next chunk of application bytes into `buf`.
    ///
    /// `Ok(0)` means the peer closed the stream.
    fn read_message(
        &mut self,
        buf: &mut [u8],
    ) -> impl Future<Output = TransportResult<usize>> + Send;
}

/// Writing half of a leg.
pub trait MessageWrite: Send {
    /// Writes all of `buf` as one unit and returns the number of bytes put on
    /// the wire, which for a keyed leg includes framing and cipher overhead.
    fn write_message(&mut self, buf: &[u8]) -> impl Future<Output = TransportResult<usize>> + Send;
}

async fn with_deadline<T, F>(limit: Duration, op: &'static str, fut: F) -> TransportResult<T>
where
    F: Future<Output = TransportResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} deadline exceeded", op),
        ))),
    }
}

/// Pass-through reader.
#[derive(Debug)]
pub struct PlainReader<R> {
    inner: R,
    timeout: Duration,
}

impl<R> PlainReader<R> {
    pub fn new(inner: R, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<R: AsyncRead + Unpin + Send> MessageRead for PlainReader<R> {
    async fn read_message(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        let limit = self.timeout;
        let inner = &mut self.inner;
        with_deadline(limit, "read", async move {
            Ok::<_, TransportError>(inner.read(buf).await?)
        })
        .await
    }
}

/// Pass-through writer.
#[derive(Debug)]
pub struct PlainWriter<W> {
    inner: W,
    timeout: Duration,
}

impl<W> PlainWriter<W> {
    pub fn new(inner: W, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<W: AsyncWrite + Unpin + Send> MessageWrite for PlainWriter<W> {
    async fn write_message(&mut self, buf: &[u8]) -> TransportResult<usize> {
        let limit = self.timeout;
        let inner = &mut self.inner;
        with_deadline(limit, "write", async move {
            inner.write_all(buf).await?;
            inner.flush().await?;
            Ok::<_, TransportError>(buf.len())
        })
        .await
    }
}

/// Reader for a keyed leg: one framed, sealed message per call.
#[derive(Debug)]
pub struct KeyedReader<R> {
    inner: R,
    cipher: Arc<MessageCipher>,
    timeout: Duration,
    /// Scratch space for the sealed body, reused across messages.
    body: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> KeyedReader<R> {
    pub fn new(inner: R, cipher: Arc<MessageCipher>, timeout: Duration) -> Self {
        Self {
            inner,
            cipher,
            timeout,
            body: Vec::new(),
        }
    }

    async fn read_frame(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut filled = 0;
        while filled < FRAME_HEADER_SIZE {
            let n = self
                .inner
                .read(&mut header[filled..])
                .await
                .map_err(|e| TransportError::Framing(format!("length prefix read failed: {}", e)))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(0);
                }
                return Err(TransportError::Framing(format!(
                    "stream closed after {} of {} length prefix bytes",
                    filled, FRAME_HEADER_SIZE
                )));
            }
            filled += n;
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::Framing(format!(
                "frame length {} exceeds maximum {}",
                len, MAX_FRAME_SIZE
            )));
        }

        self.body.resize(len, 0);
        self.inner.read_exact(&mut self.body).await.map_err(|e| {
            TransportError::Framing(format!("short frame body, expected {} bytes: {}", len, e))
        })?;

        let plaintext = self.cipher.open(&self.body).map_err(TransportError::Decrypt)?;
        if plaintext.len() > buf.len() {
            return Err(TransportError::Framing(format!(
                "message of {} bytes does not fit a {} byte buffer",
                plaintext.len(),
                buf.len()
            )));
        }

        buf[..plaintext.len()].copy_from_slice(&plaintext);
        Ok(plaintext.len())
    }
}

impl<R: AsyncRead + Unpin + Send> MessageRead for KeyedReader<R> {
    async fn read_message(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        let limit = self.timeout;
        with_deadline(limit, "read", self.read_frame(buf)).await
    }
}

/// Writer for a keyed leg: seals each call's input as one framed message.
#[derive(Debug)]
pub struct KeyedWriter<W> {
    inner: W,
    cipher: Arc<MessageCipher>,
    timeout: Duration,
}

impl<W> KeyedWriter<W> {
    pub fn new(inner: W, cipher: Arc<MessageCipher>, timeout: Duration) -> Self {
        Self {
            inner,
            cipher,
            timeout,
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> MessageWrite for KeyedWriter<W> {
    async fn write_message(&mut self, buf: &[u8]) -> TransportResult<usize> {
        let sealed = self.cipher.seal(buf).map_err(TransportError::Encrypt)?;

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + sealed.len());
        frame.put_u32(sealed.len() as u32);
        frame.put_slice(&sealed);

        let limit = self.timeout;
        let inner = &mut self.inner;
        let frame = &frame;
        with_deadline(limit, "write", async move {
            inner.write_all(frame).await?;
            inner.flush().await?;
            Ok::<_, TransportError>(frame.len())
        })
        .await
    }
}

/// Reading half of a leg, plain or keyed.
#[derive(Debug)]
pub enum LegReader<R> {
    Plain(PlainReader<R>),
    Keyed(KeyedReader<R>),
}

impl<R> LegReader<R> {
    pub fn is_keyed(&self) -> bool {
        matches!(self, LegReader::Keyed(_))
    }
}

impl<R: AsyncRead + Unpin + Send> MessageRead for LegReader<R> {
    async fn read_message(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        match self {
            LegReader::Plain(r) => r.read_message(buf).await,
            LegReader::Keyed(r) => r.read_message(buf).await,
        }
    }
}

/// Writing half of a leg, plain or keyed.
#[derive(Debug)]
pub enum LegWriter<W> {
    Plain(PlainWriter<W>),
    Keyed(KeyedWriter<W>),
}

impl<W> LegWriter<W> {
    pub fn is_keyed(&self) -> bool {
        matches!(self, LegWriter::Keyed(_))
    }
}

impl<W: AsyncWrite + Unpin + Send> MessageWrite for LegWriter<W> {
    async fn write_message(&mut self, buf: &[u8]) -> TransportResult<usize> {
        match self {
            LegWriter::Plain(w) => w.write_message(buf).await,
            LegWriter::Keyed(w) => w.write_message(buf).await,
        }
    }
}

/// Builds both halves of a leg from the halves of its stream.
///
/// With a cipher the leg is keyed, otherwise it is a plain pass-through.
pub fn split_leg<R, W>(
    reader: R,
    writer: W,
    cipher: Option<&Arc<MessageCipher>>,
    deadlines: Deadlines,
) -> (LegReader<R>, LegWriter<W>)
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    match cipher {
        Some(cipher) => (
            LegReader::Keyed(KeyedReader::new(reader, Arc::clone(cipher), deadlines.read)),
            LegWriter::Keyed(KeyedWriter::new(writer, Arc::clone(cipher), deadlines.write)),
        ),
        None => (
            LegReader::Plain(PlainReader::new(reader, deadlines.read)),
            LegWriter::Plain(PlainWriter::new(writer, deadlines.write)),
        ),
    }
}
