//! Raw length-delimited Opus: `[u16 LE length][packet]*`.
//!
//! The Opus primitive itself sits behind [`OpusProvider`] so the framing
//! can be exercised without libopus. [`ogg`] carries the same packets in
//! Ogg pages. The `native-opus` feature supplies an
//! `audiopus` backed provider.

pub mod decoder;
pub mod encoder;
#[cfg(feature = "native-opus")]
pub mod native;
pub mod ogg;

pub use decoder::OpusRawDecoder;
pub use encoder::OpusRawEncoder;
pub use ogg::{OGG_OPUS, OpusOggCodecFactory};

use std::sync::Arc;

use crate::audio::codec::{AudioDecoder, AudioEncoder, CodecContext, CodecFactory};
use crate::audio::constants::{OPUS_FRAME_DURATIONS_MS, OPUS_SAMPLE_RATES};
use crate::audio::format::{AudioSampleFormat, ChannelMapping};
use crate::audio::params::try_parse_codec_params;
use crate::common::{CodecError, Result};
use crate::configs::OpusConfig;

pub const OPUS: &str = "opus";

// ── Black box ────────────────────────────────────────────────────────────────

/// One Opus decoder state.
pub trait OpusPacketDecoder: Send {
    /// Decodes `packet` into interleaved samples and returns the samples
    /// per channel produced.
    fn decode(&mut self, packet: &[u8], output: &mut [f32]) -> Result<usize>;
}

/// One Opus encoder state.
pub trait OpusPacketEncoder: Send {
    /// Encodes exactly `frame_size` frames from `input` and returns the
    /// packet length written to `output`.
    fn encode(&mut self, input: &[f32], frame_size: usize, output: &mut [u8]) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpusEncoderSettings {
    pub bitrate_kbps: Option<u32>,
}

/// Creates Opus primitive instances.
pub trait OpusProvider: Send + Sync {
    fn name(&self) -> &str;

    fn create_decoder(&self, sample_rate_hz: u32, channels: usize) -> Result<Box<dyn OpusPacketDecoder>>;

    fn create_encoder(
        &self,
        sample_rate_hz: u32,
        layout: &OpusChannelLayout,
        settings: OpusEncoderSettings,
    ) -> Result<Box<dyn OpusPacketEncoder>>;
}

// ── Channel layouts ──────────────────────────────────────────────────────────

/// Multistream arrangement for a speaker layout. `mapping[i]` is the
/// decoded channel index fed by input channel `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusChannelLayout {
    pub channels: usize,
    pub streams: u8,
    pub coupled_streams: u8,
    pub mapping: Vec<u8>,
}

impl OpusChannelLayout {
    pub fn for_mapping(mapping: ChannelMapping) -> Result<Self> {
        let (streams, coupled_streams, table): (u8, u8, &[u8]) = match mapping {
            ChannelMapping::Monaural => (1, 0, &[0]),
            ChannelMapping::StereoLR => (1, 1, &[0, 1]),
            ChannelMapping::Quadraphonic => (2, 2, &[0, 1, 2, 3]),
            ChannelMapping::QuadraphonicRear => (3, 1, &[0, 1, 2, 3]),
            ChannelMapping::Surround5_1 | ChannelMapping::Surround5_1Side => (4, 2, &[0, 1, 4, 5, 2, 3]),
            ChannelMapping::Surround7_1 | ChannelMapping::Surround7_1Side => {
                (5, 3, &[0, 1, 6, 7, 2, 3, 4, 5])
            }
            other => {
                return Err(CodecError::unsupported(format!("Opus channel layout {}", other)));
            }
        };
        Ok(Self {
            channels: table.len(),
            streams,
            coupled_streams,
            mapping: table.to_vec(),
        })
    }

    pub fn is_single_stream(&self) -> bool {
        self.streams == 1
    }
}

// ── Format negotiation ───────────────────────────────────────────────────────

/// Smallest Opus rate not below `rate`, or 48 kHz.
pub fn snap_sample_rate(rate: u32) -> u32 {
    OPUS_SAMPLE_RATES
        .iter()
        .copied()
        .find(|&r| r >= rate)
        .unwrap_or(OPUS_SAMPLE_RATES[OPUS_SAMPLE_RATES.len() - 1])
}

pub fn is_opus_sample_rate(rate: u32) -> bool {
    OPUS_SAMPLE_RATES.contains(&rate)
}

/// Encoder frame size in samples per channel.
pub fn frame_size(sample_rate_hz: u32, frame_ms: f32) -> Result<usize> {
    if !OPUS_FRAME_DURATIONS_MS.iter().any(|&d| (d - frame_ms).abs() < f32::EPSILON) {
        return Err(CodecError::unsupported(format!("Opus frame duration {} ms", frame_ms)));
    }
    Ok((sample_rate_hz as f32 * frame_ms / 1000.0).round() as usize)
}

/// Largest output the decoder is configured to produce.
pub fn max_output_format(config: &OpusConfig) -> AudioSampleFormat {
    let rate = snap_sample_rate(config.max_sample_rate);
    if config.max_channels <= 1 {
        AudioSampleFormat::mono(rate)
    } else {
        AudioSampleFormat::stereo(rate)
    }
}

/// Decoder output for a stream described by `codec_params`.
///
/// Params win over the configured maximum, but the rate is capped by it and
/// then snapped up to an Opus rate. Channels are capped and never upmixed.
pub fn resolve_output_format(codec_params: Option<&str>, max: &AudioSampleFormat) -> Result<AudioSampleFormat> {
    let Some(params) = codec_params else {
        return Ok(*max);
    };
    let requested = try_parse_codec_params(params)?;
    let rate = snap_sample_rate(requested.sample_rate_hz.min(max.sample_rate_hz));

    if requested.num_channels <= max.num_channels {
        return AudioSampleFormat::new(rate, requested.num_channels, requested.channel_mapping);
    }
    if requested.num_channels <= 2 {
        return AudioSampleFormat::new(rate, max.num_channels, max.channel_mapping);
    }
    Err(CodecError::unsupported(format!(
        "raw Opus decoding of {} channels (limit {})",
        requested.num_channels, max.num_channels
    )))
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Serves `opus` through an [`OpusProvider`].
pub struct OpusRawCodecFactory {
    context: CodecContext,
    provider: Arc<dyn OpusProvider>,
    config: OpusConfig,
}

impl OpusRawCodecFactory {
    pub fn new(context: CodecContext, provider: Arc<dyn OpusProvider>, config: OpusConfig) -> Self {
        Self {
            context,
            provider,
            config,
        }
    }
}

impl CodecFactory for OpusRawCodecFactory {
    fn supported_decode_formats(&self) -> Vec<String> {
        vec![OPUS.to_string()]
    }

    fn supported_encode_formats(&self) -> Vec<String> {
        vec![OPUS.to_string()]
    }

    fn create_decoder(&self, codec: &str, codec_params: Option<&str>) -> Result<Box<dyn AudioDecoder>> {
        if codec != OPUS {
            return Err(CodecError::unsupported(format!("codec \"{}\"", codec)));
        }
        let format = resolve_output_format(codec_params, &max_output_format(&self.config))?;
        let decoder = self
            .provider
            .create_decoder(format.sample_rate_hz, format.num_channels)?;
        Ok(Box::new(OpusRawDecoder::new(format, decoder, self.context.clone())))
    }

    fn create_encoder(&self, codec: &str, input_format: AudioSampleFormat) -> Result<Box<dyn AudioEncoder>> {
        if codec != OPUS {
            return Err(CodecError::unsupported(format!("codec \"{}\"", codec)));
        }
        Ok(Box::new(OpusRawEncoder::new(
            input_format,
            self.provider.as_ref(),
            &self.config,
            self.context.clone(),
        )?))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_table() {
        let stereo = OpusChannelLayout::for_mapping(ChannelMapping::StereoLR).unwrap();
        assert_eq!((stereo.streams, stereo.coupled_streams), (1, 1));
        assert!(stereo.is_single_stream());

        let quad_rear = OpusChannelLayout::for_mapping(ChannelMapping::QuadraphonicRear).unwrap();
        assert_eq!((quad_rear.streams, quad_rear.coupled_streams), (3, 1));

        let side = OpusChannelLayout::for_mapping(ChannelMapping::Surround5_1Side).unwrap();
        assert_eq!(side.mapping, vec![0, 1, 4, 5, 2, 3]);
        assert_eq!(side.channels, 6);

        let eight = OpusChannelLayout::for_mapping(ChannelMapping::Surround7_1).unwrap();
        assert_eq!((eight.streams, eight.coupled_streams), (5, 3));
        assert_eq!(eight.mapping, vec![0, 1, 6, 7, 2, 3, 4, 5]);

        assert!(matches!(
            OpusChannelLayout::for_mapping(ChannelMapping::Packed(3)),
            Err(CodecError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn rates_snap_up() {
        assert_eq!(snap_sample_rate(8_000), 8_000);
        assert_eq!(snap_sample_rate(11_025), 12_000);
        assert_eq!(snap_sample_rate(22_050), 24_000);
        assert_eq!(snap_sample_rate(44_100), 48_000);
        assert_eq!(snap_sample_rate(96_000), 48_000);
    }

    #[test]
    fn frame_sizes() {
        assert_eq!(frame_size(48_000, 20.0).unwrap(), 960);
        assert_eq!(frame_size(8_000, 2.5).unwrap(), 20);
        assert_eq!(frame_size(16_000, 60.0).unwrap(), 960);
        assert!(frame_size(48_000, 15.0).is_err());
    }

    #[test]
    fn output_format_resolution() {
        let stereo48 = AudioSampleFormat::stereo(48_000);
        let mono24 = AudioSampleFormat::mono(24_000);

        assert_eq!(resolve_output_format(None, &stereo48).unwrap(), stereo48);
        assert_eq!(
            resolve_output_format(Some("samplerate=44100 channels=2"), &mono24).unwrap(),
            mono24
        );
        // Mono stays mono even when stereo is allowed.
        assert_eq!(
            resolve_output_format(Some("samplerate=11025 channels=1"), &stereo48).unwrap(),
            AudioSampleFormat::mono(12_000)
        );
        assert!(matches!(
            resolve_output_format(Some("samplerate=48000 channels=6 layout=5"), &stereo48),
            Err(CodecError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            resolve_output_format(Some("channels=2"), &stereo48),
            Err(CodecError::Param { .. })
        ));
    }

    #[test]
    fn max_format_follows_config() {
        let config = OpusConfig {
            max_sample_rate: 22_050,
            max_channels: 1,
            ..OpusConfig::default()
        };
        assert_eq!(max_output_format(&config), AudioSampleFormat::mono(24_000));
        assert_eq!(max_output_format(&OpusConfig::default()), AudioSampleFormat::stereo(48_000));
    }
}
