//! Byte stream plumbing shared by the codecs.

use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::common::{CodecError, Result};

/// Source a decoder pulls encoded bytes from.
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Writers that can also reposition, e.g. files.
pub trait SeekableWrite: AsyncWrite + AsyncSeek + Send + Unpin {}

impl<T: AsyncWrite + AsyncSeek + Send + Unpin> SeekableWrite for T {}

/// Sink an encoder pushes encoded bytes into.
pub enum OutputStream {
    Plain(Box<dyn AsyncWrite + Send + Unpin>),
    Seekable(Box<dyn SeekableWrite>),
}

impl OutputStream {
    pub fn plain(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self::Plain(Box::new(writer))
    }

    pub fn seekable(writer: impl AsyncWrite + AsyncSeek + Send + Unpin + 'static) -> Self {
        Self::Seekable(Box::new(writer))
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self, Self::Seekable(_))
    }

    /// Repositions a seekable stream.
    pub async fn seek_to(&mut self, pos: SeekFrom) -> Result<u64> {
        match self {
            Self::Seekable(w) => Ok(w.seek(pos).await?),
            Self::Plain(_) => Err(CodecError::invalid_usage("output stream is not seekable")),
        }
    }

    /// Current position of a seekable stream, `None` otherwise.
    pub async fn position(&mut self) -> Result<Option<u64>> {
        match self {
            Self::Seekable(w) => Ok(Some(w.stream_position().await?)),
            Self::Plain(_) => Ok(None),
        }
    }
}

impl AsyncWrite for OutputStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(w) => Pin::new(w).poll_write(cx, buf),
            Self::Seekable(w) => Pin::new(w).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(w) => Pin::new(w).poll_flush(cx),
            Self::Seekable(w) => Pin::new(w).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(w) => Pin::new(w).poll_shutdown(cx),
            Self::Seekable(w) => Pin::new(w).poll_shutdown(cx),
        }
    }
}

// ── Cancellation-aware helpers ───────────────────────────────────────────────

/// Reads once, racing the read against `cancel`. Dropping an in-flight read
/// loses no bytes, so a cancelled call leaves the stream intact.
pub async fn read_cancellable<R>(stream: &mut R, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if cancel.is_cancelled() {
        return Err(CodecError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CodecError::Cancelled),
        read = stream.read(buf) => Ok(read?),
    }
}

/// Fills `buf` completely. Returns `false` if the stream ended first.
pub async fn read_exact_cancellable<R>(
    stream: &mut R,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<bool>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_cancellable(stream, &mut buf[filled..], cancel).await?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

/// Writes all of `buf`, checking `cancel` first. A write that has started is
/// allowed to finish so the output never holds a torn unit.
pub async fn write_all_cancellable<W>(stream: &mut W, buf: &[u8], cancel: &CancellationToken) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if cancel.is_cancelled() {
        return Err(CodecError::Cancelled);
    }
    stream.write_all(buf).await?;
    Ok(())
}

// ── Output ownership ─────────────────────────────────────────────────────────

/// Output binding of an encoder together with its ownership flag.
#[derive(Default)]
pub(crate) struct OutputSlot {
    stream: Option<OutputStream>,
    owns_stream: bool,
}

impl OutputSlot {
    pub fn is_bound(&self) -> bool {
        self.stream.is_some()
    }

    pub fn bind(&mut self, stream: OutputStream, owns_stream: bool) {
        self.stream = Some(stream);
        self.owns_stream = owns_stream;
    }

    pub fn get(&mut self) -> Result<&mut OutputStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| CodecError::invalid_usage("encoder is not initialized"))
    }

    /// Shuts an owned stream down, or hands a borrowed one back.
    pub async fn release(self) -> Result<Option<OutputStream>> {
        match self.stream {
            Some(mut stream) if self.owns_stream => {
                stream.shutdown().await?;
                Ok(None)
            }
            Some(mut stream) => {
                stream.flush().await?;
                Ok(Some(stream))
            }
            None => Ok(None),
        }
    }
}

// ── Shared stream ────────────────────────────────────────────────────────────

/// A stream handle that can be lent to an inner codec and taken back later.
///
/// Reads and writes fail with `BrokenPipe` while the stream is taken out.
pub struct SharedStream<S> {
    inner: Arc<Mutex<Option<S>>>,
}

impl<S> Clone for SharedStream<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> SharedStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(stream))),
        }
    }

    pub fn take(&self) -> Option<S> {
        self.inner.lock().take()
    }

    pub fn restore(&self, stream: S) {
        *self.inner.lock() = Some(stream);
    }

    fn detached() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "shared stream is detached")
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SharedStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.inner.lock().as_mut() {
            Some(stream) => Pin::new(stream).poll_read(cx, buf),
            None => Poll::Ready(Err(Self::detached())),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SharedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.inner.lock().as_mut() {
            Some(stream) => Pin::new(stream).poll_write(cx, buf),
            None => Poll::Ready(Err(Self::detached())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.inner.lock().as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.inner.lock().as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

// ── In-memory stream ─────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    data: BytesMut,
    position: usize,
}

/// Growable in-memory stream with a shared cursor. Clones see the same bytes,
/// which lets a caller inspect what an owning codec wrote.
#[derive(Clone, Default)]
pub struct MemoryStream {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: impl AsRef<[u8]>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                data: BytesMut::from(data.as_ref()),
                position: 0,
            })),
        }
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Bytes {
        Bytes::copy_from_slice(&self.state.lock().data)
    }

    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rewind(&self) {
        self.state.lock().position = 0;
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state.lock();
        let start = state.position.min(state.data.len());
        let n = buf.remaining().min(state.data.len() - start);
        buf.put_slice(&state.data[start..start + n]);
        state.position = start + n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock();
        let position = state.position;
        let end = position + buf.len();
        if end > state.data.len() {
            state.data.resize(end, 0);
        }
        state.data[position..end].copy_from_slice(buf);
        state.position = end;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for MemoryStream {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let mut state = self.state.lock();
        let target = match position {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => state.data.len() as i64 + offset,
            SeekFrom::Current(offset) => state.position as i64 + offset,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }
        state.position = target as usize;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.state.lock().position as u64))
    }
}

/// Reader that hands out at most `chunk` bytes per call, for exercising
/// partial and misaligned transport reads.
#[cfg(test)]
pub(crate) struct TrickleReader {
    data: Vec<u8>,
    position: usize,
    chunk: usize,
}

#[cfg(test)]
impl TrickleReader {
    pub fn new(data: impl Into<Vec<u8>>, chunk: usize) -> Self {
        Self {
            data: data.into(),
            position: 0,
            chunk,
        }
    }
}

#[cfg(test)]
impl AsyncRead for TrickleReader {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let n = self
            .chunk
            .min(buf.remaining())
            .min(self.data.len() - self.position);
        let start = self.position;
        buf.put_slice(&self.data[start..start + n]);
        self.position += n;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_stream_overwrites_after_seek() {
        let stream = MemoryStream::new();
        let mut out = OutputStream::seekable(stream.clone());
        out.write_all(b"hello world").await.unwrap();
        out.seek_to(SeekFrom::Start(0)).await.unwrap();
        out.write_all(b"J").await.unwrap();
        assert_eq!(out.position().await.unwrap(), Some(1));
        assert_eq!(&stream.contents()[..], b"Jello world");
    }

    #[tokio::test]
    async fn plain_output_refuses_seek() {
        let mut out = OutputStream::plain(MemoryStream::new());
        assert!(!out.is_seekable());
        assert!(matches!(
            out.seek_to(SeekFrom::Start(0)).await,
            Err(CodecError::InvalidUsage(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_read_fails_fast() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stream = MemoryStream::from_bytes([1, 2, 3]);
        let mut buf = [0u8; 3];
        assert!(matches!(
            read_cancellable(&mut stream, &mut buf, &cancel).await,
            Err(CodecError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn read_exact_reports_short_stream() {
        let cancel = CancellationToken::new();
        let mut stream = TrickleReader::new(vec![1, 2, 3], 1);
        let mut buf = [0u8; 4];
        assert!(!read_exact_cancellable(&mut stream, &mut buf, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn shared_stream_detaches() {
        let shared = SharedStream::new(MemoryStream::from_bytes(b"abc"));
        let mut reader = shared.clone();
        let taken = SharedStream::take(&shared).unwrap();

        let mut buf = [0u8; 3];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        shared.restore(taken);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 3);
    }
}
