//! Frame-aligned reads over an arbitrary transport.
//!
//! Transports may return any number of bytes per read. [`FrameReader`]
//! buffers them and only exposes whole frames, carrying a partial frame over
//! to the next fill.

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::audio::buffer::{BufferPool, ByteRing};
use crate::audio::codec::io::{InputStream, read_cancellable};
use crate::audio::constants::DEFAULT_BUFFER_SIZE;
use crate::common::Result;

pub(crate) struct FrameReader {
    stream: Option<InputStream>,
    owns_stream: bool,
    ring: ByteRing,
    frame_bytes: usize,
    ended: bool,
}

impl FrameReader {
    pub fn new(pool: &BufferPool<u8>, stream: InputStream, owns_stream: bool, frame_bytes: usize) -> Self {
        assert!(frame_bytes > 0, "frame size must be positive");
        Self {
            stream: Some(stream),
            owns_stream,
            ring: ByteRing::new(pool, DEFAULT_BUFFER_SIZE.max(frame_bytes * 2)),
            frame_bytes,
            ended: false,
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// True once the transport has reported its end.
    pub fn transport_ended(&self) -> bool {
        self.ended
    }

    /// Reads until at least one whole frame is buffered. Returns the number
    /// of buffered whole frames, or `None` once the transport is exhausted
    /// and no whole frame remains.
    pub async fn fill(&mut self, cancel: &CancellationToken) -> Result<Option<usize>> {
        loop {
            let whole = self.ring.len() / self.frame_bytes;
            if whole > 0 {
                return Ok(Some(whole));
            }
            if self.ended {
                return Ok(None);
            }
            let Some(stream) = self.stream.as_mut() else {
                self.ended = true;
                return Ok(None);
            };

            self.ring.compact_if_needed(self.frame_bytes);
            let n = read_cancellable(stream, self.ring.writable(), cancel).await?;
            if n == 0 {
                trace!(trailing = self.ring.len(), "transport ended");
                self.ended = true;
            } else {
                self.ring.commit(n);
            }
        }
    }

    /// The first `frames` buffered frames.
    pub fn frames(&self, frames: usize) -> &[u8] {
        &self.ring.readable()[..frames * self.frame_bytes]
    }

    pub fn consume_frames(&mut self, frames: usize) {
        self.ring.consume(frames * self.frame_bytes);
    }

    /// Bytes short of a whole frame left after the transport ended.
    pub fn remainder(&self) -> &[u8] {
        self.ring.readable()
    }

    /// Drops a dangling partial frame at the end of the stream.
    pub fn discard_remainder(&mut self) {
        let dangling = self.ring.len();
        if dangling > 0 {
            debug!(bytes = dangling, "discarding partial frame at end of stream");
            self.ring.clear();
        }
    }

    /// Drops an owned stream; hands a borrowed one back.
    pub fn into_stream(mut self) -> Option<InputStream> {
        let stream = self.stream.take();
        if self.owns_stream { None } else { stream }
    }
}
