//! Page sync and packet reassembly for one logical Ogg bitstream.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::audio::buffer::ByteRing;
use crate::audio::codec::opus::ogg::page::{NO_GRANULE, OGG_CAPTURE, PageHeader, page_crc};
use crate::audio::constants::{OGG_MAX_PACKET_SIZE, OGG_MAX_SYNC_SKIP, OGG_PAGE_HEADER_LEN};
use crate::common::{CodecError, Result};

/// Pulls pages out of a [`ByteRing`] and queues the packets of the first
/// stream that starts with a BOS page. Pages of other streams are ignored.
#[derive(Debug, Default)]
pub(crate) struct OggDemuxer {
    serial: Option<u32>,
    next_sequence: u32,
    partial: BytesMut,
    /// The packet being assembled lost its start or grew too large.
    discard_partial: bool,
    packets: VecDeque<Bytes>,
    skipped: usize,
    end_of_stream: bool,
    exhausted: bool,
    end_granule: Option<u64>,
    pages: u64,
}

impl OggDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the stream's last page was seen or the input ran out.
    pub fn ended(&self) -> bool {
        self.end_of_stream || self.exhausted
    }

    /// Final granule position, known once the EOS page was read.
    pub fn end_granule(&self) -> Option<u64> {
        self.end_granule
    }

    pub fn pages(&self) -> u64 {
        self.pages
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        self.packets.pop_front()
    }

    /// Next packet, held back until a packet behind it is queued or the
    /// stream ended, so the end granule is known when the last one leaves.
    pub fn pop_with_lookahead(&mut self) -> Option<Bytes> {
        if self.packets.len() >= 2 || self.ended() {
            self.packets.pop_front()
        } else {
            None
        }
    }

    /// Called when the input is exhausted. Drops unfinished data.
    pub fn mark_exhausted(&mut self, ring: &mut ByteRing) {
        if !self.partial.is_empty() || !ring.is_empty() {
            debug!(
                partial = self.partial.len(),
                buffered = ring.len(),
                "discarding incomplete Ogg data at end of input"
            );
        }
        self.partial.clear();
        ring.clear();
        self.exhausted = true;
    }

    /// Consumes at most one page from `ring`. Returns `false` when more
    /// input is needed to make progress.
    pub fn feed(&mut self, ring: &mut ByteRing) -> Result<bool> {
        if self.end_of_stream {
            return Ok(false);
        }
        let readable = ring.readable();

        let Some(start) = find_capture(readable) else {
            let keep = readable.len().min(OGG_CAPTURE.len() - 1);
            let skip = readable.len() - keep;
            if skip > 0 {
                ring.consume(skip);
                self.skip(skip)?;
            }
            return Ok(false);
        };
        if start > 0 {
            ring.consume(start);
            self.skip(start)?;
            return Ok(true);
        }

        let Some(header) = PageHeader::parse(readable) else {
            return Ok(false);
        };
        let lacing_end = OGG_PAGE_HEADER_LEN + header.segments;
        if readable.len() < lacing_end {
            return Ok(false);
        }
        let body_len: usize = readable[OGG_PAGE_HEADER_LEN..lacing_end].iter().map(|&l| l as usize).sum();
        let page_len = lacing_end + body_len;
        if readable.len() < page_len {
            return Ok(false);
        }

        if header.version != 0 || page_crc(&readable[..page_len]) != header.crc {
            warn!(
                version = header.version,
                sequence = header.sequence,
                "corrupt Ogg page; resyncing"
            );
            ring.consume(1);
            self.skip(1)?;
            self.lose_partial();
            return Ok(true);
        }
        self.skipped = 0;

        let lacing = readable[OGG_PAGE_HEADER_LEN..lacing_end].to_vec();
        let body = Bytes::copy_from_slice(&readable[lacing_end..page_len]);
        ring.consume(page_len);
        self.accept_page(&header, &lacing, body);
        Ok(true)
    }

    fn skip(&mut self, bytes: usize) -> Result<()> {
        self.skipped += bytes;
        if self.skipped > OGG_MAX_SYNC_SKIP {
            return Err(CodecError::format(format!(
                "no valid Ogg page in {} bytes",
                self.skipped
            )));
        }
        Ok(())
    }

    fn lose_partial(&mut self) {
        if !self.partial.is_empty() {
            self.partial.clear();
            self.discard_partial = true;
        }
    }

    fn accept_page(&mut self, header: &PageHeader, lacing: &[u8], body: Bytes) {
        match self.serial {
            Some(serial) if serial == header.serial => {}
            None if header.is_begin_of_stream() => {
                debug!(serial = header.serial, "Ogg stream found");
                self.serial = Some(header.serial);
                self.next_sequence = header.sequence;
            }
            _ => {
                trace!(serial = header.serial, "skipping page of another Ogg stream");
                return;
            }
        }
        self.pages += 1;

        if header.sequence != self.next_sequence {
            warn!(
                expected = self.next_sequence,
                found = header.sequence,
                "Ogg pages missing"
            );
            self.lose_partial();
        }
        self.next_sequence = header.sequence.wrapping_add(1);

        if header.is_continued() {
            if self.partial.is_empty() && !self.discard_partial {
                // Start of the packet was never seen.
                self.discard_partial = true;
            }
        } else if !self.partial.is_empty() || self.discard_partial {
            debug!(bytes = self.partial.len(), "unterminated Ogg packet dropped");
            self.partial.clear();
            self.discard_partial = false;
        }

        let mut offset = 0;
        for &len in lacing {
            let len = len as usize;
            let segment = body.slice(offset..offset + len);
            offset += len;

            if !self.discard_partial {
                if self.partial.len() + len > OGG_MAX_PACKET_SIZE {
                    warn!(limit = OGG_MAX_PACKET_SIZE, "oversized Ogg packet dropped");
                    self.partial.clear();
                    self.discard_partial = true;
                } else {
                    self.partial.extend_from_slice(&segment);
                }
            }
            if len < 255 {
                self.finish_packet();
            }
        }

        if header.is_end_of_stream() {
            self.end_of_stream = true;
            if header.granule != NO_GRANULE {
                self.end_granule = Some(header.granule);
            }
            debug!(
                pages = self.pages,
                granule = header.granule,
                "Ogg end of stream"
            );
        }
    }

    fn finish_packet(&mut self) {
        if self.discard_partial {
            self.discard_partial = false;
            self.partial.clear();
            return;
        }
        if self.partial.is_empty() {
            return;
        }
        self.packets.push_back(self.partial.split().freeze());
    }
}

fn find_capture(bytes: &[u8]) -> Option<usize> {
    bytes.windows(OGG_CAPTURE.len()).position(|w| w == OGG_CAPTURE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::BufferPool;
    use crate::audio::codec::opus::ogg::page::{
        FLAG_BEGIN_OF_STREAM, FLAG_CONTINUED, FLAG_END_OF_STREAM, PageBuilder,
    };
    use crate::audio::constants::{OGG_INPUT_RING_SIZE, OGG_MAX_PAGE_SIZE};

    fn page(flags: u8, granule: u64, serial: u32, sequence: u32, packets: &[&[u8]]) -> Bytes {
        let mut builder = PageBuilder::new();
        for packet in packets {
            builder.push_packet(packet);
        }
        builder.finish(flags, granule, serial, sequence)
    }

    fn demux_all(bytes: &[u8]) -> (OggDemuxer, Vec<Bytes>) {
        let pool = BufferPool::default();
        let mut ring = ByteRing::new(&pool, OGG_INPUT_RING_SIZE);
        ring.writable()[..bytes.len()].copy_from_slice(bytes);
        ring.commit(bytes.len());

        let mut demux = OggDemuxer::new();
        while demux.feed(&mut ring).unwrap() {}
        demux.mark_exhausted(&mut ring);
        let mut packets = Vec::new();
        while let Some(packet) = demux.pop() {
            packets.push(packet);
        }
        (demux, packets)
    }

    #[test]
    fn packets_are_joined_across_pages() {
        let long: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        let mut first = PageBuilder::new();
        first.push_packet(b"head");
        first.push_fragment(&long[..510], false);
        let mut second = PageBuilder::new();
        second.push_fragment(&long[510..], true);
        second.push_packet(b"tail");

        let mut stream = first.finish(FLAG_BEGIN_OF_STREAM, NO_GRANULE, 9, 0).to_vec();
        stream.extend_from_slice(&second.finish(FLAG_CONTINUED | FLAG_END_OF_STREAM, 4800, 9, 1));

        let (demux, packets) = demux_all(&stream);
        assert_eq!(packets.len(), 3);
        assert_eq!(&packets[0][..], b"head");
        assert_eq!(&packets[1][..], &long[..]);
        assert_eq!(&packets[2][..], b"tail");
        assert_eq!(demux.end_granule(), Some(4800));
        assert_eq!(demux.pages(), 2);
    }

    #[test]
    fn garbage_and_corrupt_pages_are_skipped() {
        let mut stream = b"junk before the stream".to_vec();
        stream.extend_from_slice(&page(FLAG_BEGIN_OF_STREAM, 0, 3, 0, &[b"one"]));
        let mut corrupt = page(0, 0, 3, 1, &[b"two"]).to_vec();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        stream.extend_from_slice(&corrupt);
        stream.extend_from_slice(&page(FLAG_END_OF_STREAM, 0, 3, 2, &[b"three"]));

        let (demux, packets) = demux_all(&stream);
        let packets: Vec<&[u8]> = packets.iter().map(|p| &p[..]).collect();
        assert_eq!(packets, vec![&b"one"[..], &b"three"[..]]);
        assert!(demux.ended());
    }

    #[test]
    fn continuation_after_a_lost_page_is_dropped() {
        let mut orphan = PageBuilder::new();
        orphan.push_fragment(&[2; 20], true);
        orphan.push_packet(b"next");

        // Page 1, which opened the continued packet, never arrives.
        let mut stream = page(FLAG_BEGIN_OF_STREAM, 0, 4, 0, &[b"start"]).to_vec();
        stream.extend_from_slice(&orphan.finish(FLAG_CONTINUED, 0, 4, 2));

        let (_, packets) = demux_all(&stream);
        let packets: Vec<&[u8]> = packets.iter().map(|p| &p[..]).collect();
        assert_eq!(packets, vec![&b"start"[..], &b"next"[..]]);
    }

    #[test]
    fn other_streams_are_ignored() {
        let mut stream = page(0, 0, 1, 0, &[b"before bos"]).to_vec();
        stream.extend_from_slice(&page(FLAG_BEGIN_OF_STREAM, 0, 2, 0, &[b"ours"]));
        stream.extend_from_slice(&page(FLAG_BEGIN_OF_STREAM, 0, 5, 0, &[b"theirs"]));
        stream.extend_from_slice(&page(0, 0, 2, 1, &[b"ours too"]));

        let (demux, packets) = demux_all(&stream);
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[1][..], b"ours too");
        assert!(demux.end_granule().is_none());
    }

    #[test]
    fn lookahead_holds_the_last_packet_until_the_end() {
        let pool = BufferPool::default();
        let mut ring = ByteRing::new(&pool, OGG_INPUT_RING_SIZE);
        let bytes = page(FLAG_BEGIN_OF_STREAM, 0, 8, 0, &[b"a", b"b"]);
        ring.writable()[..bytes.len()].copy_from_slice(&bytes);
        ring.commit(bytes.len());

        let mut demux = OggDemuxer::new();
        assert!(demux.feed(&mut ring).unwrap());
        assert_eq!(demux.pop_with_lookahead().as_deref(), Some(&b"a"[..]));
        assert!(demux.pop_with_lookahead().is_none());
        assert!(!demux.feed(&mut ring).unwrap());
        demux.mark_exhausted(&mut ring);
        assert_eq!(demux.pop_with_lookahead().as_deref(), Some(&b"b"[..]));
    }

    #[test]
    fn ring_holds_the_largest_page() {
        let pool = BufferPool::default();
        assert!(ByteRing::new(&pool, OGG_INPUT_RING_SIZE).capacity() >= OGG_MAX_PAGE_SIZE);
    }

    #[test]
    fn endless_garbage_is_a_format_error() {
        let pool = BufferPool::default();
        let mut ring = ByteRing::new(&pool, OGG_INPUT_RING_SIZE);
        let mut demux = OggDemuxer::new();
        let mut result = Ok(false);
        for _ in 0..3 {
            let room = ring.tail_room();
            ring.writable().fill(b'x');
            ring.commit(room);
            result = demux.feed(&mut ring);
            if result.is_err() {
                break;
            }
            ring.compact_if_needed(OGG_INPUT_RING_SIZE);
        }
        assert!(matches!(result, Err(CodecError::Format(_))));
    }
}
