//! Ogg encapsulated Opus: an `OpusHead` packet, an `OpusTags` packet, then
//! audio packets, carried in CRC-checked Ogg pages. Granule positions count
//! 48 kHz samples, including the decoder pre-skip.

pub mod decoder;
mod demux;
pub mod encoder;
pub mod page;

pub use decoder::OpusOggDecoder;
pub use encoder::OpusOggEncoder;

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

use crate::audio::codec::opus::{OpusChannelLayout, OpusProvider};
use crate::audio::codec::{AudioDecoder, AudioEncoder, CodecContext, CodecFactory};
use crate::audio::format::AudioSampleFormat;
use crate::common::{CodecError, Result};
use crate::configs::OpusConfig;

pub const OGG_OPUS: &str = "oggopus";

const OPUS_HEAD_MAGIC: &[u8; 8] = b"OpusHead";
const OPUS_TAGS_MAGIC: &[u8; 8] = b"OpusTags";
const OPUS_HEAD_MIN_LEN: usize = 19;

// ── Header packets ───────────────────────────────────────────────────────────

/// Identification header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusHead {
    pub version: u8,
    pub channels: u8,
    /// 48 kHz samples to drop from the start of the decoded output.
    pub pre_skip: u16,
    /// Rate of the original input; informational, 0 when unknown.
    pub input_sample_rate: u32,
    /// Gain in dB, Q7.8.
    pub output_gain: i16,
    pub mapping_family: u8,
    pub streams: u8,
    pub coupled_streams: u8,
    pub mapping: Vec<u8>,
}

impl OpusHead {
    pub fn for_layout(layout: &OpusChannelLayout, input_sample_rate: u32, pre_skip: u16) -> Self {
        let mapping_family = if layout.is_single_stream() && layout.channels <= 2 { 0 } else { 1 };
        Self {
            version: 1,
            channels: layout.channels as u8,
            pre_skip,
            input_sample_rate,
            output_gain: 0,
            mapping_family,
            streams: layout.streams,
            coupled_streams: layout.coupled_streams,
            mapping: layout.mapping.clone(),
        }
    }

    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < OPUS_HEAD_MIN_LEN || !packet.starts_with(OPUS_HEAD_MAGIC) {
            return Err(CodecError::format("missing OpusHead packet"));
        }
        let version = packet[8];
        if version >> 4 != 0 {
            return Err(CodecError::unsupported(format!("OpusHead version {}", version)));
        }
        let channels = packet[9];
        if channels == 0 {
            return Err(CodecError::format("OpusHead declares zero channels"));
        }
        let mapping_family = packet[18];

        let (streams, coupled_streams, mapping) = if mapping_family == 0 {
            if channels > 2 {
                return Err(CodecError::format(format!(
                    "mapping family 0 with {} channels",
                    channels
                )));
            }
            (1, channels - 1, (0..channels).collect())
        } else {
            let table_end = 21 + channels as usize;
            if packet.len() < table_end {
                return Err(CodecError::format("OpusHead channel mapping table truncated"));
            }
            let streams = packet[19];
            let coupled = packet[20];
            if streams == 0 || coupled > streams {
                return Err(CodecError::format(format!(
                    "OpusHead declares {} streams, {} coupled",
                    streams, coupled
                )));
            }
            (streams, coupled, packet[21..table_end].to_vec())
        };

        Ok(Self {
            version,
            channels,
            pre_skip: LittleEndian::read_u16(&packet[10..12]),
            input_sample_rate: LittleEndian::read_u32(&packet[12..16]),
            output_gain: LittleEndian::read_i16(&packet[16..18]),
            mapping_family,
            streams,
            coupled_streams,
            mapping,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(OPUS_HEAD_MIN_LEN + 2 + self.mapping.len());
        out.put_slice(OPUS_HEAD_MAGIC);
        out.put_u8(self.version);
        out.put_u8(self.channels);
        out.put_u16_le(self.pre_skip);
        out.put_u32_le(self.input_sample_rate);
        out.put_i16_le(self.output_gain);
        out.put_u8(self.mapping_family);
        if self.mapping_family != 0 {
            out.put_u8(self.streams);
            out.put_u8(self.coupled_streams);
            out.put_slice(&self.mapping);
        }
        out.freeze()
    }

    /// Linear factor for [`output_gain`](Self::output_gain).
    pub fn gain_factor(&self) -> f32 {
        10f32.powf(self.output_gain as f32 / (20.0 * 256.0))
    }
}

/// Comment header: a vendor string and `KEY=value` fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpusTags {
    pub vendor: String,
    pub comments: Vec<String>,
}

impl OpusTags {
    pub fn new(vendor: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            comments: Vec::new(),
        }
    }

    pub fn parse(packet: &[u8]) -> Result<Self> {
        if !packet.starts_with(OPUS_TAGS_MAGIC) {
            return Err(CodecError::format("missing OpusTags packet"));
        }
        let mut rest = &packet[OPUS_TAGS_MAGIC.len()..];
        let vendor = take_string(&mut rest)?;
        let count = take_u32(&mut rest)? as usize;
        let mut comments = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            comments.push(take_string(&mut rest)?);
        }
        Ok(Self { vendor, comments })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_slice(OPUS_TAGS_MAGIC);
        out.put_u32_le(self.vendor.len() as u32);
        out.put_slice(self.vendor.as_bytes());
        out.put_u32_le(self.comments.len() as u32);
        for comment in &self.comments {
            out.put_u32_le(comment.len() as u32);
            out.put_slice(comment.as_bytes());
        }
        out.freeze()
    }

    /// Value of the first field named `key`, compared case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.comments.iter().find_map(|comment| {
            let (name, value) = comment.split_once('=')?;
            name.eq_ignore_ascii_case(key).then_some(value)
        })
    }
}

fn take_u32(rest: &mut &[u8]) -> Result<u32> {
    if rest.len() < 4 {
        return Err(CodecError::format("OpusTags truncated"));
    }
    let value = LittleEndian::read_u32(rest);
    *rest = &rest[4..];
    Ok(value)
}

fn take_string(rest: &mut &[u8]) -> Result<String> {
    let len = take_u32(rest)? as usize;
    if rest.len() < len {
        return Err(CodecError::format("OpusTags field runs past the packet"));
    }
    let value = String::from_utf8_lossy(&rest[..len]).into_owned();
    *rest = &rest[len..];
    Ok(value)
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Serves `oggopus` through an [`OpusProvider`].
pub struct OpusOggCodecFactory {
    context: CodecContext,
    provider: Arc<dyn OpusProvider>,
    config: OpusConfig,
}

impl OpusOggCodecFactory {
    pub fn new(context: CodecContext, provider: Arc<dyn OpusProvider>, config: OpusConfig) -> Self {
        Self {
            context,
            provider,
            config,
        }
    }
}

impl CodecFactory for OpusOggCodecFactory {
    fn supported_decode_formats(&self) -> Vec<String> {
        vec![OGG_OPUS.to_string()]
    }

    fn supported_encode_formats(&self) -> Vec<String> {
        vec![OGG_OPUS.to_string()]
    }

    /// The stream headers describe the format, so `codec_params` is unused.
    fn create_decoder(&self, codec: &str, _codec_params: Option<&str>) -> Result<Box<dyn AudioDecoder>> {
        if codec != OGG_OPUS {
            return Err(CodecError::unsupported(format!("codec \"{}\"", codec)));
        }
        Ok(Box::new(OpusOggDecoder::new(
            Arc::clone(&self.provider),
            self.config.clone(),
            self.context.clone(),
        )))
    }

    fn create_encoder(&self, codec: &str, input_format: AudioSampleFormat) -> Result<Box<dyn AudioEncoder>> {
        if codec != OGG_OPUS {
            return Err(CodecError::unsupported(format!("codec \"{}\"", codec)));
        }
        Ok(Box::new(OpusOggEncoder::new(
            input_format,
            self.provider.as_ref(),
            &self.config,
            self.context.clone(),
        )?))
    }
}
