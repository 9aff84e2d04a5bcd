//! Byte stream over the concatenated `data` chunks of a RIFF body.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, trace};

use crate::audio::codec::io::{InputStream, SharedStream};
use crate::audio::codec::riff::header::DATA_TAG;

const SKIP_SCRATCH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    /// Collecting an 8-byte chunk header.
    Header { bytes: [u8; 8], filled: usize },
    /// Inside a `data` chunk. `None` means the length field was zero and
    /// the chunk runs to the end of the stream.
    Data { remaining: Option<u64>, padded: bool },
    /// Discarding a foreign chunk or a pad byte.
    Skip { remaining: u64 },
    Done,
}

/// Yields only `data` chunk payloads and passes over every other chunk,
/// including odd-length padding.
pub struct RiffDataReader {
    stream: SharedStream<InputStream>,
    chunk: Chunk,
    delivered: u64,
}

impl RiffDataReader {
    /// Starts right after the `fmt ` chunk, at a chunk boundary.
    pub fn new(stream: SharedStream<InputStream>) -> Self {
        Self {
            stream,
            chunk: Chunk::Header {
                bytes: [0; 8],
                filled: 0,
            },
            delivered: 0,
        }
    }

    /// Payload bytes handed out so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    fn enter_chunk(&mut self, header: [u8; 8]) {
        let tag = &header[..4];
        let len = LittleEndian::read_u32(&header[4..]) as u64;
        self.chunk = if tag == DATA_TAG {
            trace!(len, "entering data chunk");
            Chunk::Data {
                remaining: (len > 0).then_some(len),
                padded: len % 2 == 1,
            }
        } else {
            debug!(
                tag = %String::from_utf8_lossy(tag),
                len,
                "skipping chunk"
            );
            Chunk::Skip {
                remaining: len + len % 2,
            }
        };
    }
}

impl AsyncRead for RiffDataReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.chunk {
                Chunk::Done => return Poll::Ready(Ok(())),
                Chunk::Header { mut bytes, filled } => {
                    let mut header = ReadBuf::new(&mut bytes[filled..]);
                    ready!(Pin::new(&mut this.stream).poll_read(cx, &mut header))?;
                    let n = header.filled().len();
                    if n == 0 {
                        if filled > 0 {
                            debug!(bytes = filled, "stream ended inside a chunk header");
                        }
                        this.chunk = Chunk::Done;
                        continue;
                    }
                    if filled + n == bytes.len() {
                        this.enter_chunk(bytes);
                    } else {
                        this.chunk = Chunk::Header {
                            bytes,
                            filled: filled + n,
                        };
                    }
                }
                Chunk::Skip { remaining: 0 } => {
                    this.chunk = Chunk::Header {
                        bytes: [0; 8],
                        filled: 0,
                    };
                }
                Chunk::Skip { remaining } => {
                    let mut scratch = [0u8; SKIP_SCRATCH];
                    let limit = remaining.min(SKIP_SCRATCH as u64) as usize;
                    let mut skipped = ReadBuf::new(&mut scratch[..limit]);
                    ready!(Pin::new(&mut this.stream).poll_read(cx, &mut skipped))?;
                    let n = skipped.filled().len() as u64;
                    this.chunk = if n == 0 {
                        Chunk::Done
                    } else {
                        Chunk::Skip {
                            remaining: remaining - n,
                        }
                    };
                }
                Chunk::Data {
                    remaining: Some(0),
                    padded,
                } => {
                    this.chunk = Chunk::Skip {
                        remaining: padded as u64,
                    };
                }
                Chunk::Data { remaining, padded } => {
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let limit = remaining.map_or(buf.remaining(), |r| r.min(buf.remaining() as u64) as usize);
                    let mut payload = ReadBuf::new(buf.initialize_unfilled_to(limit));
                    ready!(Pin::new(&mut this.stream).poll_read(cx, &mut payload))?;
                    let n = payload.filled().len();
                    buf.advance(n);

                    if n == 0 {
                        if let Some(left) = remaining {
                            debug!(missing = left, "stream ended inside a data chunk");
                        }
                        this.chunk = Chunk::Done;
                    } else {
                        this.delivered += n as u64;
                        this.chunk = Chunk::Data {
                            remaining: remaining.map(|r| r - n as u64),
                            padded,
                        };
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::io::TrickleReader;
    use tokio::io::AsyncReadExt;

    fn chunk(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = tag.to_vec();
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        if payload.len() % 2 == 1 {
            out.push(0);
        }
        out
    }

    async fn read_all(bytes: Vec<u8>, trickle: usize) -> Vec<u8> {
        let shared = SharedStream::new(Box::new(TrickleReader::new(bytes, trickle)) as InputStream);
        let mut reader = RiffDataReader::new(shared);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(reader.delivered(), out.len() as u64);
        out
    }

    #[tokio::test]
    async fn skips_foreign_chunks_and_padding() {
        let mut bytes = chunk(b"LIST", b"abc");
        bytes.extend(chunk(b"data", &[1, 2, 3]));
        bytes.extend(chunk(b"fact", &[9; 4]));
        bytes.extend(chunk(b"data", &[4, 5]));

        for trickle in [1, 3, 64] {
            assert_eq!(read_all(bytes.clone(), trickle).await, vec![1, 2, 3, 4, 5]);
        }
    }

    #[tokio::test]
    async fn zero_length_data_runs_to_end() {
        let mut bytes = b"data".to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes.extend_from_slice(&[7; 100]);
        assert_eq!(read_all(bytes, 13).await, vec![7; 100]);
    }

    #[tokio::test]
    async fn truncated_data_chunk_ends_cleanly() {
        let mut bytes = b"data".to_vec();
        bytes.extend_from_slice(&1000u32.to_le_bytes());
        bytes.extend_from_slice(&[1; 10]);
        assert_eq!(read_all(bytes, 4).await, vec![1; 10]);
    }
}
