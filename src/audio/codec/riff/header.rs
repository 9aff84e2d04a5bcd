//! `fmt ` chunk parsing and canonical header construction.

use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::audio::constants::{
    RIFF_CLASSIC_HEADER_LEN, RIFF_EXTENSIBLE_HEADER_LEN, WAVE_FORMAT_EXTENSIBLE,
};
use crate::audio::format::{AudioSampleFormat, ChannelMapping, WaveFormat};
use crate::common::{CodecError, Result};

pub const RIFF_TAG: &[u8; 4] = b"RIFF";
pub const WAVE_TAG: &[u8; 4] = b"WAVE";
pub const FMT_TAG: &[u8; 4] = b"fmt ";
pub const DATA_TAG: &[u8; 4] = b"data";

/// Smallest `fmt ` body: `WAVEFORMAT` plus bits per sample.
pub const MIN_FMT_LEN: usize = 16;
/// `fmt ` bodies up to this size are read; larger ones are treated as corrupt.
pub const MAX_FMT_LEN: usize = 1_024;

const EXTENSIBLE_FMT_LEN: u32 = 40;
const EXTENSIBLE_CB_SIZE: u16 = 22;
const EXTENSIBLE_MIN_LEN: usize = 40;

/// What a `fmt ` chunk says about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveHeader {
    pub encoding: WaveFormat,
    pub format: AudioSampleFormat,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

impl WaveHeader {
    /// Parses a `fmt ` chunk body.
    ///
    /// Malformed structure is a [`CodecError::Format`]; well-formed headers
    /// this build cannot play are [`CodecError::UnsupportedFormat`].
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < MIN_FMT_LEN {
            return Err(CodecError::format(format!(
                "fmt chunk is {} bytes, need at least {}",
                body.len(),
                MIN_FMT_LEN
            )));
        }

        let mut cursor = Cursor::new(body);
        let tag = cursor.read_u16::<LittleEndian>()?;
        let channels = cursor.read_u16::<LittleEndian>()? as usize;
        let sample_rate = cursor.read_u32::<LittleEndian>()?;
        let _byte_rate = cursor.read_u32::<LittleEndian>()?;
        let block_align = cursor.read_u16::<LittleEndian>()?;
        let bits_per_sample = cursor.read_u16::<LittleEndian>()?;

        if !(1..=8).contains(&channels) {
            return Err(CodecError::format(format!("unusable channel count {}", channels)));
        }
        if sample_rate == 0 {
            return Err(CodecError::format("sample rate is zero"));
        }

        let mut mapping = if channels == 2 {
            ChannelMapping::StereoLR
        } else {
            ChannelMapping::default_for_channels(channels)?
        };

        let encoding = if tag == WAVE_FORMAT_EXTENSIBLE {
            if body.len() < EXTENSIBLE_MIN_LEN {
                return Err(CodecError::format(format!(
                    "extensible fmt chunk is {} bytes, need {}",
                    body.len(),
                    EXTENSIBLE_MIN_LEN
                )));
            }
            let _cb_size = cursor.read_u16::<LittleEndian>()?;
            let _valid_bits = cursor.read_u16::<LittleEndian>()?;
            let mask = cursor.read_u32::<LittleEndian>()?;
            if channels > 1 {
                mapping = ChannelMapping::from_speaker_mask(channels, mask, mapping);
            }
            let mut guid = [0u8; 16];
            guid.copy_from_slice(&body[24..40]);
            WaveFormat::from_subtype_guid(&guid, bits_per_sample)?
        } else {
            WaveFormat::from_format_tag(tag, bits_per_sample)?
        };

        Ok(Self {
            encoding,
            format: AudioSampleFormat::new(sample_rate, channels, mapping)?,
            block_align,
            bits_per_sample,
        })
    }

    /// Header for `format` carrying `encoding`. `block_align` overrides the
    /// computed frame size for block codecs.
    pub fn for_encoding(format: AudioSampleFormat, encoding: WaveFormat, block_align: Option<u16>) -> Self {
        let bits_per_sample = encoding.bits_per_sample();
        Self {
            encoding,
            format,
            block_align: block_align
                .unwrap_or((bits_per_sample as usize * format.num_channels / 8) as u16),
            bits_per_sample,
        }
    }

    /// Plain mono and stereo fit the classic layout; everything else needs
    /// a speaker mask.
    pub fn needs_extensible(&self) -> bool {
        !matches!(
            self.format.channel_mapping,
            ChannelMapping::Monaural | ChannelMapping::StereoLR
        )
    }

    pub fn header_len(&self) -> usize {
        if self.needs_extensible() {
            RIFF_EXTENSIBLE_HEADER_LEN
        } else {
            RIFF_CLASSIC_HEADER_LEN
        }
    }

    /// Serializes the full file header. With `file_len` unknown both length
    /// fields are zero.
    pub fn build(&self, file_len: Option<u64>) -> Result<Vec<u8>> {
        let header_len = self.header_len();
        let (riff_len, data_len) = match file_len {
            Some(len) => (clamp_u32(len.saturating_sub(8)), clamp_u32(len.saturating_sub(header_len as u64))),
            None => (0, 0),
        };
        let tag = self
            .encoding
            .format_tag()
            .ok_or_else(|| CodecError::unsupported(format!("no format tag for {}", self.encoding)))?;
        let channels = self.format.num_channels as u16;
        let rate = self.format.sample_rate_hz;
        let byte_rate = (rate as u64 * channels as u64 * self.bits_per_sample as u64 / 8) as u32;

        let mut out = Vec::with_capacity(header_len);
        out.write_all(RIFF_TAG)?;
        out.write_u32::<LittleEndian>(riff_len)?;
        out.write_all(WAVE_TAG)?;
        out.write_all(FMT_TAG)?;

        if self.needs_extensible() {
            let guid = self
                .encoding
                .subtype_guid()
                .ok_or_else(|| CodecError::unsupported(format!("no subtype GUID for {}", self.encoding)))?;
            out.write_u32::<LittleEndian>(EXTENSIBLE_FMT_LEN)?;
            out.write_u16::<LittleEndian>(WAVE_FORMAT_EXTENSIBLE)?;
            out.write_u16::<LittleEndian>(channels)?;
            out.write_u32::<LittleEndian>(rate)?;
            out.write_u32::<LittleEndian>(byte_rate)?;
            out.write_u16::<LittleEndian>(self.block_align)?;
            out.write_u16::<LittleEndian>(self.bits_per_sample)?;
            out.write_u16::<LittleEndian>(EXTENSIBLE_CB_SIZE)?;
            out.write_u16::<LittleEndian>(self.bits_per_sample)?;
            out.write_u32::<LittleEndian>(self.format.channel_mapping.speaker_mask())?;
            out.write_all(&guid)?;
        } else {
            out.write_u32::<LittleEndian>(MIN_FMT_LEN as u32)?;
            out.write_u16::<LittleEndian>(tag)?;
            out.write_u16::<LittleEndian>(channels)?;
            out.write_u32::<LittleEndian>(rate)?;
            out.write_u32::<LittleEndian>(byte_rate)?;
            out.write_u16::<LittleEndian>(self.block_align)?;
            out.write_u16::<LittleEndian>(self.bits_per_sample)?;
        }

        out.write_all(DATA_TAG)?;
        out.write_u32::<LittleEndian>(data_len)?;
        debug_assert_eq!(out.len(), header_len);
        Ok(out)
    }
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::constants::{SUBTYPE_GUID_SUFFIX, WAVE_FORMAT_MS_ADPCM};
    use byteorder::ByteOrder;

    fn fmt_body(tag: u16, channels: u16, rate: u32, block_align: u16, bits: u16) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u16::<LittleEndian>(tag).unwrap();
        body.write_u16::<LittleEndian>(channels).unwrap();
        body.write_u32::<LittleEndian>(rate).unwrap();
        body.write_u32::<LittleEndian>(rate * block_align as u32).unwrap();
        body.write_u16::<LittleEndian>(block_align).unwrap();
        body.write_u16::<LittleEndian>(bits).unwrap();
        body
    }

    fn extensible_body(channels: u16, bits: u16, mask: u32, subtype: u16) -> Vec<u8> {
        let mut body = fmt_body(WAVE_FORMAT_EXTENSIBLE, channels, 48_000, channels * bits / 8, bits);
        body.write_u16::<LittleEndian>(22).unwrap();
        body.write_u16::<LittleEndian>(bits).unwrap();
        body.write_u32::<LittleEndian>(mask).unwrap();
        body.write_u16::<LittleEndian>(subtype).unwrap();
        body.extend_from_slice(&[0, 0]);
        body.extend_from_slice(&SUBTYPE_GUID_SUFFIX);
        body
    }

    #[test]
    fn mono_pcm_header_layout() {
        let header = WaveHeader::for_encoding(AudioSampleFormat::mono(16_000), WaveFormat::Int16LE, None);
        let bytes = header.build(None).unwrap();
        assert_eq!(bytes.len(), 44);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..16], b"WAVEfmt ");
        assert_eq!(LittleEndian::read_u16(&bytes[20..22]), 1);
        assert_eq!(LittleEndian::read_u16(&bytes[22..24]), 1);
        assert_eq!(LittleEndian::read_u32(&bytes[24..28]), 16_000);
        assert_eq!(LittleEndian::read_u32(&bytes[28..32]), 32_000);
        assert_eq!(LittleEndian::read_u16(&bytes[32..34]), 2);
        assert_eq!(LittleEndian::read_u16(&bytes[34..36]), 16);
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(LittleEndian::read_u32(&bytes[40..44]), 0);
    }

    #[test]
    fn surround_header_is_extensible() {
        let format = AudioSampleFormat::with_layout(48_000, ChannelMapping::Surround5_1).unwrap();
        let header = WaveHeader::for_encoding(format, WaveFormat::Float32LE, None);
        let bytes = header.build(Some(68 + 24)).unwrap();
        assert_eq!(bytes.len(), 68);
        assert_eq!(LittleEndian::read_u32(&bytes[4..8]), 84);
        assert_eq!(LittleEndian::read_u32(&bytes[16..20]), 40);
        assert_eq!(LittleEndian::read_u16(&bytes[20..22]), WAVE_FORMAT_EXTENSIBLE);
        assert_eq!(LittleEndian::read_u16(&bytes[22..24]), 6);
        assert_eq!(LittleEndian::read_u32(&bytes[40..44]), 0x3F);
        assert_eq!(&bytes[44..48], &[3, 0, 0, 0]);
        assert_eq!(LittleEndian::read_u32(&bytes[64..68]), 24);

        let parsed = WaveHeader::parse(&bytes[20..60]).unwrap();
        assert_eq!(parsed.format, format);
        assert_eq!(parsed.encoding, WaveFormat::Float32LE);
    }

    #[test]
    fn adpcm_header_uses_block_size() {
        let header = WaveHeader::for_encoding(AudioSampleFormat::mono(8_000), WaveFormat::AdpcmIma, Some(256));
        let bytes = header.build(None).unwrap();
        assert_eq!(LittleEndian::read_u16(&bytes[20..22]), 0x11);
        assert_eq!(LittleEndian::read_u16(&bytes[32..34]), 256);
        assert_eq!(LittleEndian::read_u16(&bytes[34..36]), 4);
    }

    #[test]
    fn classic_stereo_defaults_to_left_right() {
        let parsed = WaveHeader::parse(&fmt_body(1, 2, 44_100, 4, 16)).unwrap();
        assert_eq!(parsed.format, AudioSampleFormat::stereo(44_100));
        assert_eq!(parsed.encoding, WaveFormat::Int16LE);

        let parsed = WaveHeader::parse(&fmt_body(1, 3, 44_100, 6, 16)).unwrap();
        assert_eq!(parsed.format.channel_mapping, ChannelMapping::Packed(3));
    }

    #[test]
    fn mask_refines_layout() {
        let parsed = WaveHeader::parse(&extensible_body(6, 16, 0x60F, 1)).unwrap();
        assert_eq!(parsed.format.channel_mapping, ChannelMapping::Surround5_1Side);

        let parsed = WaveHeader::parse(&extensible_body(2, 16, 0, 1)).unwrap();
        assert_eq!(parsed.format.channel_mapping, ChannelMapping::Packed(2));
    }

    #[test]
    fn rejects_bad_headers() {
        assert!(matches!(WaveHeader::parse(&[0u8; 10]), Err(CodecError::Format(_))));
        assert!(matches!(
            WaveHeader::parse(&fmt_body(1, 9, 8_000, 18, 16)),
            Err(CodecError::Format(_))
        ));
        assert!(matches!(
            WaveHeader::parse(&fmt_body(1, 1, 8_000, 1, 8)),
            Err(CodecError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            WaveHeader::parse(&extensible_body(2, 16, 3, 0x55)),
            Err(CodecError::Format(_))
        ));

        let ms_adpcm = WaveHeader::parse(&extensible_body(1, 4, 4, WAVE_FORMAT_MS_ADPCM)).unwrap();
        assert_eq!(ms_adpcm.encoding, WaveFormat::AdpcmMs);
    }
}
