//! Ogg page framing.
//!
//! ```text
//! 0   "OggS"
//! 4   version (0)
//! 5   flags
//! 6   granule position   i64 LE
//! 14  bitstream serial   u32 LE
//! 18  page sequence      u32 LE
//! 22  CRC-32             u32 LE
//! 26  segment count
//! 27  lacing values, then the segment bytes
//! ```

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

use crate::audio::constants::{OGG_MAX_SEGMENTS, OGG_PAGE_HEADER_LEN};

pub const OGG_CAPTURE: &[u8; 4] = b"OggS";

pub const FLAG_CONTINUED: u8 = 0x01;
pub const FLAG_BEGIN_OF_STREAM: u8 = 0x02;
pub const FLAG_END_OF_STREAM: u8 = 0x04;

/// Granule position of a page on which no packet ends.
pub const NO_GRANULE: u64 = u64::MAX;

const CRC_OFFSET: usize = 22;

// ── CRC ──────────────────────────────────────────────────────────────────────

const CRC_TABLE: [u32; 256] = crc_table();

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Unreflected CRC-32, polynomial 0x04C11DB7, zero initial value.
pub fn crc32_update(crc: u32, data: &[u8]) -> u32 {
    data.iter()
        .fold(crc, |crc, &b| (crc << 8) ^ CRC_TABLE[((crc >> 24) as u8 ^ b) as usize])
}

/// Checksum of a whole page, computed with its CRC field zeroed.
pub fn page_crc(page: &[u8]) -> u32 {
    let crc = crc32_update(0, &page[..CRC_OFFSET]);
    let crc = crc32_update(crc, &[0; 4]);
    crc32_update(crc, &page[CRC_OFFSET + 4..])
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub version: u8,
    pub flags: u8,
    pub granule: u64,
    pub serial: u32,
    pub sequence: u32,
    pub crc: u32,
    pub segments: usize,
}

impl PageHeader {
    /// Parses the fixed header at the start of `bytes`. `None` when fewer
    /// than [`OGG_PAGE_HEADER_LEN`] bytes are given or the capture pattern
    /// is missing.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < OGG_PAGE_HEADER_LEN || !bytes.starts_with(OGG_CAPTURE) {
            return None;
        }
        Some(Self {
            version: bytes[4],
            flags: bytes[5],
            granule: LittleEndian::read_u64(&bytes[6..14]),
            serial: LittleEndian::read_u32(&bytes[14..18]),
            sequence: LittleEndian::read_u32(&bytes[18..22]),
            crc: LittleEndian::read_u32(&bytes[CRC_OFFSET..CRC_OFFSET + 4]),
            segments: bytes[26] as usize,
        })
    }

    pub fn is_continued(&self) -> bool {
        self.flags & FLAG_CONTINUED != 0
    }

    pub fn is_begin_of_stream(&self) -> bool {
        self.flags & FLAG_BEGIN_OF_STREAM != 0
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags & FLAG_END_OF_STREAM != 0
    }
}

// ── Writing ──────────────────────────────────────────────────────────────────

/// Collects segments for one page.
#[derive(Debug, Default)]
pub struct PageBuilder {
    lacing: Vec<u8>,
    body: BytesMut,
}

/// Lacing values needed for a complete packet of `len` bytes.
pub fn segments_for(len: usize) -> usize {
    len / 255 + 1
}

impl PageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> usize {
        self.lacing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lacing.is_empty()
    }

    /// Free lacing slots on this page.
    pub fn room(&self) -> usize {
        OGG_MAX_SEGMENTS - self.lacing.len()
    }

    /// Appends a complete packet. A packet whose length is a multiple of
    /// 255 is closed by a zero lacing value.
    pub fn push_packet(&mut self, packet: &[u8]) {
        self.push_fragment(packet, true);
    }

    /// Appends part of a packet. Unless `ends_packet` is set only whole
    /// 255 byte segments are laced, so `data.len()` must be a multiple of
    /// 255 and the packet continues on the next page.
    pub fn push_fragment(&mut self, data: &[u8], ends_packet: bool) {
        let needed = if ends_packet {
            segments_for(data.len())
        } else {
            debug_assert_eq!(data.len() % 255, 0, "open fragment must be whole segments");
            data.len() / 255
        };
        assert!(needed <= self.room(), "page lacing table overflow");

        self.lacing.extend(std::iter::repeat_n(255u8, data.len() / 255));
        if ends_packet {
            self.lacing.push((data.len() % 255) as u8);
        }
        self.body.put_slice(data);
    }

    /// Serializes the collected segments into a page and resets the builder.
    pub fn finish(&mut self, flags: u8, granule: u64, serial: u32, sequence: u32) -> Bytes {
        let mut page = BytesMut::with_capacity(OGG_PAGE_HEADER_LEN + self.lacing.len() + self.body.len());
        page.put_slice(OGG_CAPTURE);
        page.put_u8(0);
        page.put_u8(flags);
        page.put_u64_le(granule);
        page.put_u32_le(serial);
        page.put_u32_le(sequence);
        page.put_u32_le(0);
        page.put_u8(self.lacing.len() as u8);
        page.put_slice(&self.lacing);
        page.put_slice(&self.body);

        let crc = page_crc(&page);
        LittleEndian::write_u32(&mut page[CRC_OFFSET..CRC_OFFSET + 4], crc);

        self.lacing.clear();
        self.body.clear();
        page.freeze()
    }
}
