//! Sample format value types.

use std::fmt;

use crate::audio::constants::*;
use crate::common::{CodecError, Result};

/// Speaker layout of an interleaved stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMapping {
    Unknown,
    Monaural,
    StereoLR,
    /// FL FR BL BR
    Quadraphonic,
    /// FL FR FC BC
    QuadraphonicRear,
    /// FL FR FC LFE BL BR
    Surround5_1,
    /// FL FR FC LFE SL SR
    Surround5_1Side,
    /// FL FR FC LFE BL BR FLC FRC
    Surround7_1,
    /// FL FR FC LFE BL BR SL SR
    Surround7_1Side,
    /// N channels with no defined speaker relation.
    Packed(u16),
}

impl ChannelMapping {
    /// Number of channels the layout implies, `None` for [`Unknown`](Self::Unknown).
    pub fn num_channels(self) -> Option<usize> {
        Some(match self {
            Self::Unknown => return None,
            Self::Monaural => 1,
            Self::StereoLR => 2,
            Self::Quadraphonic | Self::QuadraphonicRear => 4,
            Self::Surround5_1 | Self::Surround5_1Side => 6,
            Self::Surround7_1 | Self::Surround7_1Side => 8,
            Self::Packed(n) => n as usize,
        })
    }

    /// Numeric code used by the `layout=` codec parameter.
    pub fn code(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Monaural => 1,
            Self::StereoLR => 2,
            Self::Quadraphonic => 3,
            Self::QuadraphonicRear => 4,
            Self::Surround5_1 => 5,
            Self::Surround5_1Side => 6,
            Self::Surround7_1 => 7,
            Self::Surround7_1Side => 8,
            Self::Packed(n) => 100 + n as u32,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::Unknown,
            1 => Self::Monaural,
            2 => Self::StereoLR,
            3 => Self::Quadraphonic,
            4 => Self::QuadraphonicRear,
            5 => Self::Surround5_1,
            6 => Self::Surround5_1Side,
            7 => Self::Surround7_1,
            8 => Self::Surround7_1Side,
            102..=108 => Self::Packed((code - 100) as u16),
            _ => return None,
        })
    }

    pub fn is_packed(self) -> bool {
        matches!(self, Self::Packed(_))
    }

    /// `WAVEFORMATEXTENSIBLE` speaker mask. Packed layouts have no speaker
    /// positions and map to zero.
    pub fn speaker_mask(self) -> u32 {
        match self {
            Self::Unknown | Self::Packed(_) => 0,
            Self::Monaural => SPEAKER_FRONT_CENTER,
            Self::StereoLR => SPEAKER_FRONT_LEFT | SPEAKER_FRONT_RIGHT,
            Self::Quadraphonic => {
                SPEAKER_FRONT_LEFT | SPEAKER_FRONT_RIGHT | SPEAKER_BACK_LEFT | SPEAKER_BACK_RIGHT
            }
            Self::QuadraphonicRear => {
                SPEAKER_FRONT_LEFT | SPEAKER_FRONT_RIGHT | SPEAKER_FRONT_CENTER | SPEAKER_BACK_CENTER
            }
            Self::Surround5_1 => {
                SPEAKER_FRONT_LEFT
                    | SPEAKER_FRONT_RIGHT
                    | SPEAKER_FRONT_CENTER
                    | SPEAKER_LOW_FREQUENCY
                    | SPEAKER_BACK_LEFT
                    | SPEAKER_BACK_RIGHT
            }
            Self::Surround5_1Side => {
                SPEAKER_FRONT_LEFT
                    | SPEAKER_FRONT_RIGHT
                    | SPEAKER_FRONT_CENTER
                    | SPEAKER_LOW_FREQUENCY
                    | SPEAKER_SIDE_LEFT
                    | SPEAKER_SIDE_RIGHT
            }
            Self::Surround7_1 => {
                Self::Surround5_1.speaker_mask()
                    | SPEAKER_FRONT_LEFT_OF_CENTER
                    | SPEAKER_FRONT_RIGHT_OF_CENTER
            }
            Self::Surround7_1Side => {
                Self::Surround5_1.speaker_mask() | SPEAKER_SIDE_LEFT | SPEAKER_SIDE_RIGHT
            }
        }
    }

    /// Layout assumed when a stream only states its channel count.
    pub fn default_for_channels(channels: usize) -> Result<Self> {
        match channels {
            1 => Ok(Self::Monaural),
            2..=8 => Ok(Self::Packed(channels as u16)),
            _ => Err(CodecError::unsupported(format!(
                "no default layout for {} channels",
                channels
            ))),
        }
    }

    /// Refines `fallback` with an explicit speaker mask. The first layout
    /// whose speakers are all present in `mask` wins, so extra speaker bits
    /// are tolerated. Masks that cover no known layout for the channel count
    /// leave `fallback` as is.
    pub fn from_speaker_mask(channels: usize, mask: u32, fallback: Self) -> Self {
        let candidates: &[Self] = match channels {
            1 => &[Self::Monaural],
            2 => {
                if mask == 0 {
                    return Self::Packed(2);
                }
                &[Self::StereoLR]
            }
            4 => &[Self::Quadraphonic, Self::QuadraphonicRear],
            6 => &[Self::Surround5_1, Self::Surround5_1Side],
            8 => &[Self::Surround7_1, Self::Surround7_1Side],
            _ => &[],
        };

        candidates
            .iter()
            .copied()
            .find(|layout| {
                let required = layout.speaker_mask();
                mask & required == required
            })
            .unwrap_or(fallback)
    }
}

impl fmt::Display for ChannelMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Packed(n) => write!(f, "Packed{}Ch", n),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Rate, channel count and layout of an interleaved float stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioSampleFormat {
    pub sample_rate_hz: u32,
    pub num_channels: usize,
    pub channel_mapping: ChannelMapping,
}

impl AudioSampleFormat {
    pub fn new(sample_rate_hz: u32, num_channels: usize, channel_mapping: ChannelMapping) -> Result<Self> {
        if sample_rate_hz == 0 {
            return Err(CodecError::unsupported("sample rate must be positive"));
        }
        if num_channels == 0 {
            return Err(CodecError::unsupported("channel count must be positive"));
        }
        if let Some(expected) = channel_mapping.num_channels() {
            if expected != num_channels {
                return Err(CodecError::unsupported(format!(
                    "layout {} has {} channels, not {}",
                    channel_mapping, expected, num_channels
                )));
            }
        }
        Ok(Self {
            sample_rate_hz,
            num_channels,
            channel_mapping,
        })
    }

    pub fn mono(sample_rate_hz: u32) -> Self {
        Self {
            sample_rate_hz,
            num_channels: 1,
            channel_mapping: ChannelMapping::Monaural,
        }
    }

    pub fn stereo(sample_rate_hz: u32) -> Self {
        Self {
            sample_rate_hz,
            num_channels: 2,
            channel_mapping: ChannelMapping::StereoLR,
        }
    }

    /// A format with the default layout for `num_channels`.
    pub fn packed(sample_rate_hz: u32, num_channels: usize) -> Result<Self> {
        Self::new(
            sample_rate_hz,
            num_channels,
            ChannelMapping::default_for_channels(num_channels)?,
        )
    }

    pub fn with_layout(sample_rate_hz: u32, channel_mapping: ChannelMapping) -> Result<Self> {
        let channels = channel_mapping
            .num_channels()
            .ok_or_else(|| CodecError::unsupported("layout does not define a channel count"))?;
        Self::new(sample_rate_hz, channels, channel_mapping)
    }

    /// Interleaved samples for `frames` frames.
    pub fn samples_for_frames(&self, frames: usize) -> usize {
        frames * self.num_channels
    }
}

impl fmt::Display for AudioSampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz {}ch {}",
            self.sample_rate_hz, self.num_channels, self.channel_mapping
        )
    }
}

/// Encoding of individual samples inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaveFormat {
    Int16LE,
    Int24LE,
    Int32LE,
    Float32LE,
    ALaw,
    MuLaw,
    AdpcmIma,
    AdpcmMs,
    Unknown,
}

impl WaveFormat {
    pub fn bits_per_sample(self) -> u16 {
        match self {
            Self::Int16LE => 16,
            Self::Int24LE => 24,
            Self::Int32LE | Self::Float32LE => 32,
            Self::ALaw | Self::MuLaw => 8,
            Self::AdpcmIma | Self::AdpcmMs => 4,
            Self::Unknown => 0,
        }
    }

    /// Bytes per sample for the fixed-width encodings.
    pub fn bytes_per_sample(self) -> Option<usize> {
        match self {
            Self::AdpcmIma | Self::AdpcmMs | Self::Unknown => None,
            other => Some(other.bits_per_sample() as usize / 8),
        }
    }

    /// Codec name of the payload codec handling this encoding.
    pub fn codec_name(self) -> Option<&'static str> {
        Some(match self {
            Self::Int16LE => "pcm",
            Self::Int24LE => "pcm_s24le",
            Self::Int32LE => "pcm_s32le",
            Self::Float32LE => "pcm_f32le",
            Self::ALaw => "alaw",
            Self::MuLaw => "ulaw",
            Self::AdpcmIma => "adpcm_ima",
            Self::AdpcmMs | Self::Unknown => return None,
        })
    }

    /// `WAVEFORMATEX` tag for the encoding.
    pub fn format_tag(self) -> Option<u16> {
        Some(match self {
            Self::Int16LE | Self::Int24LE | Self::Int32LE => WAVE_FORMAT_PCM,
            Self::Float32LE => WAVE_FORMAT_IEEE_FLOAT,
            Self::ALaw => WAVE_FORMAT_ALAW,
            Self::MuLaw => WAVE_FORMAT_MULAW,
            Self::AdpcmIma => WAVE_FORMAT_IMA_ADPCM,
            Self::AdpcmMs => WAVE_FORMAT_MS_ADPCM,
            Self::Unknown => return None,
        })
    }

    /// Resolves a classic format tag plus bit depth.
    pub fn from_format_tag(tag: u16, bits_per_sample: u16) -> Result<Self> {
        let resolved = match (tag, bits_per_sample) {
            (WAVE_FORMAT_PCM, 16) => Self::Int16LE,
            (WAVE_FORMAT_PCM, 24) => Self::Int24LE,
            (WAVE_FORMAT_PCM, 32) => Self::Int32LE,
            (WAVE_FORMAT_IEEE_FLOAT, 32) => Self::Float32LE,
            (WAVE_FORMAT_ALAW, 8) => Self::ALaw,
            (WAVE_FORMAT_MULAW, 8) => Self::MuLaw,
            (WAVE_FORMAT_IMA_ADPCM, 4) => Self::AdpcmIma,
            (WAVE_FORMAT_MS_ADPCM, _) => Self::AdpcmMs,
            (WAVE_FORMAT_PCM | WAVE_FORMAT_IEEE_FLOAT | WAVE_FORMAT_ALAW | WAVE_FORMAT_MULAW
            | WAVE_FORMAT_IMA_ADPCM, bits) => {
                return Err(CodecError::unsupported(format!(
                    "format tag {:#06x} with {} bits per sample",
                    tag, bits
                )));
            }
            _ => {
                return Err(CodecError::format(format!(
                    "unrecognized format tag {:#06x}",
                    tag
                )));
            }
        };
        Ok(resolved)
    }

    /// The 16-byte `KSDATAFORMAT_SUBTYPE_*` GUID for the encoding.
    pub fn subtype_guid(self) -> Option<[u8; 16]> {
        let tag = self.format_tag()?;
        let mut guid = [0u8; 16];
        guid[..2].copy_from_slice(&tag.to_le_bytes());
        guid[4..].copy_from_slice(&SUBTYPE_GUID_SUFFIX);
        Some(guid)
    }

    /// Resolves an extensible subtype GUID plus bit depth.
    pub fn from_subtype_guid(guid: &[u8; 16], bits_per_sample: u16) -> Result<Self> {
        if guid[4..] != SUBTYPE_GUID_SUFFIX || guid[2..4] != [0, 0] {
            return Err(CodecError::format("unrecognized format subtype GUID"));
        }
        let tag = u16::from_le_bytes([guid[0], guid[1]]);
        if tag == WAVE_FORMAT_EXTENSIBLE {
            return Err(CodecError::format("nested extensible subtype GUID"));
        }
        Self::from_format_tag(tag, bits_per_sample)
    }
}

impl fmt::Display for WaveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
