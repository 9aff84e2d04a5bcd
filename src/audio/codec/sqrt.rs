//! Square-root delta codec.
//!
//! Each byte carries the signed square root of the step from the previous
//! reconstructed sample of the same channel, scaled so that code 127 means a
//! rate-dependent ceiling. Encoder and decoder run the same reconstruction,
//! so their staircases match bit for bit.
//!
//! Stream layout: `[i32 LE sample rate][1 byte per sample per channel]*`.

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::codec::io::{InputStream, OutputStream, read_exact_cancellable, write_all_cancellable};
use crate::audio::codec::payload::{PayloadDecoder, PayloadEncoder, SamplePacker, SampleUnpacker};
use crate::audio::codec::{
    AudioDecoder, AudioEncoder, CodecContext, CodecFactory, InitializationResult,
};
use crate::audio::constants::{
    INT16_SCALE, SQRT_CEILING_HIGH_RATE, SQRT_CEILING_LOW_RATE, SQRT_CEILING_MID_RATE, SQRT_MAX_CODE,
};
use crate::audio::format::AudioSampleFormat;
use crate::audio::params::{create_codec_params, try_parse_codec_params};
use crate::common::{CodecError, Result};

pub const SQRT: &str = "sqrt";

const CODE_SCALE: i64 = (SQRT_MAX_CODE * SQRT_MAX_CODE) as i64;

/// Largest single step representable at `sample_rate_hz`.
pub fn step_ceiling(sample_rate_hz: u32) -> i32 {
    if sample_rate_hz > 44_100 {
        SQRT_CEILING_HIGH_RATE
    } else if sample_rate_hz > 16_000 {
        SQRT_CEILING_MID_RATE
    } else {
        SQRT_CEILING_LOW_RATE
    }
}

pub fn encode_step(diff: i32, ceiling: i32) -> u8 {
    let scaled = (diff.unsigned_abs() as f64 * CODE_SCALE as f64 / ceiling as f64).sqrt();
    let magnitude = (scaled.round() as i32).min(SQRT_MAX_CODE) as u8;
    if diff < 0 { magnitude | 0x80 } else { magnitude }
}

pub fn decode_step(code: u8, ceiling: i32) -> i32 {
    let magnitude = (code & 0x7F) as i64;
    let delta = (magnitude * magnitude * ceiling as i64 / CODE_SCALE) as i32;
    if code & 0x80 != 0 { -delta } else { delta }
}

fn accumulate(previous: i32, delta: i32) -> i32 {
    (previous + delta).clamp(i16::MIN as i32, i16::MAX as i32)
}

/// Per-channel reconstruction state, shared by both directions.
#[derive(Debug, Clone)]
pub struct SquareDelta {
    ceiling: i32,
    previous: Vec<i32>,
}

impl SquareDelta {
    pub fn new(sample_rate_hz: u32, channels: usize) -> Self {
        Self {
            ceiling: step_ceiling(sample_rate_hz),
            previous: vec![0; channels],
        }
    }
}

impl SampleUnpacker for SquareDelta {
    fn bytes_per_sample(&self) -> usize {
        1
    }

    fn unpack(&mut self, input: &[u8], output: &mut [f32], channels: usize) {
        for (i, (&code, sample)) in input.iter().zip(output.iter_mut()).enumerate() {
            let channel = i % channels;
            let value = accumulate(self.previous[channel], decode_step(code, self.ceiling));
            self.previous[channel] = value;
            *sample = value as f32 / INT16_SCALE;
        }
    }
}

impl SamplePacker for SquareDelta {
    fn bytes_per_sample(&self) -> usize {
        1
    }

    fn pack(&mut self, input: &[f32], output: &mut [u8], channels: usize) {
        for (i, (&sample, code)) in input.iter().zip(output.iter_mut()).enumerate() {
            let channel = i % channels;
            let target = (sample.clamp(-1.0, 1.0) * INT16_SCALE).round() as i32;
            let step = encode_step(target - self.previous[channel], self.ceiling);
            // Track what the decoder will reconstruct, not the raw target.
            self.previous[channel] = accumulate(self.previous[channel], decode_step(step, self.ceiling));
            *code = step;
        }
    }
}

// ── Decoder ──────────────────────────────────────────────────────────────────

pub struct SquareDeltaDecoder {
    declared_format: Option<AudioSampleFormat>,
    context: CodecContext,
    inner: Option<PayloadDecoder<SquareDelta>>,
    /// Borrowed stream whose header was rejected, kept for `dispose`.
    rejected_input: Option<InputStream>,
}

impl SquareDeltaDecoder {
    /// `declared_format` comes from the codec params; without it the header
    /// rate and a single channel are assumed.
    pub fn new(declared_format: Option<AudioSampleFormat>, context: CodecContext) -> Self {
        Self {
            declared_format,
            context,
            inner: None,
            rejected_input: None,
        }
    }

    fn reject(&mut self, input: InputStream, owns_stream: bool, result: InitializationResult) -> InitializationResult {
        if !owns_stream {
            self.rejected_input = Some(input);
        }
        result
    }
}

#[async_trait]
impl AudioDecoder for SquareDeltaDecoder {
    fn codec_name(&self) -> String {
        SQRT.to_string()
    }

    fn codec_params(&self) -> Option<String> {
        self.output_format().map(|f| create_codec_params(&f))
    }

    fn output_format(&self) -> Option<AudioSampleFormat> {
        match &self.inner {
            Some(inner) => Some(*inner.format()),
            None => self.declared_format,
        }
    }

    fn is_initialized(&self) -> bool {
        self.inner.is_some()
    }

    fn playback_end_of_stream(&self) -> bool {
        self.inner.as_ref().is_some_and(|i| i.playback_end_of_stream())
    }

    async fn initialize(
        &mut self,
        mut input: InputStream,
        owns_stream: bool,
        cancel: &CancellationToken,
    ) -> Result<InitializationResult> {
        if self.inner.is_some() {
            return Ok(InitializationResult::AlreadyInitialized);
        }

        let mut header = [0u8; 4];
        if !read_exact_cancellable(&mut input, &mut header, cancel).await? {
            warn!("square-delta stream ended inside its header");
            return Ok(self.reject(input, owns_stream, InitializationResult::FailedInvalidData));
        }
        let header_rate = LittleEndian::read_i32(&header);
        if header_rate <= 0 {
            warn!(rate = header_rate, "square-delta header has an invalid sample rate");
            return Ok(self.reject(input, owns_stream, InitializationResult::FailedInvalidData));
        }

        let format = match self.declared_format {
            Some(declared) => {
                if declared.sample_rate_hz != header_rate as u32 {
                    debug!(
                        declared = declared.sample_rate_hz,
                        header = header_rate,
                        "square-delta header rate differs from codec params"
                    );
                }
                declared
            }
            None => AudioSampleFormat::mono(header_rate as u32),
        };

        let mut inner = PayloadDecoder::new(
            SQRT,
            format,
            SquareDelta::new(format.sample_rate_hz, format.num_channels),
            self.context.clone(),
        );
        let result = inner.initialize(input, owns_stream, cancel).await?;
        self.inner = Some(inner);
        Ok(result)
    }

    async fn read(
        &mut self,
        buffer: &mut [f32],
        samples_per_channel: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>> {
        match self.inner.as_mut() {
            Some(inner) => inner.read(buffer, samples_per_channel, cancel).await,
            None => Err(CodecError::invalid_usage("decoder is not initialized")),
        }
    }

    async fn dispose(self: Box<Self>) -> Result<Option<InputStream>> {
        match self.inner {
            Some(inner) => Box::new(inner).dispose().await,
            None => Ok(self.rejected_input),
        }
    }
}

// ── Encoder ──────────────────────────────────────────────────────────────────

pub struct SquareDeltaEncoder {
    inner: PayloadEncoder<SquareDelta>,
    format: AudioSampleFormat,
}

impl SquareDeltaEncoder {
    pub fn new(format: AudioSampleFormat, context: CodecContext) -> Self {
        Self {
            inner: PayloadEncoder::new(
                SQRT,
                format,
                SquareDelta::new(format.sample_rate_hz, format.num_channels),
                context,
            ),
            format,
        }
    }
}

#[async_trait]
impl AudioEncoder for SquareDeltaEncoder {
    fn codec_name(&self) -> String {
        SQRT.to_string()
    }

    fn codec_params(&self) -> Option<String> {
        Some(create_codec_params(&self.format))
    }

    fn input_format(&self) -> AudioSampleFormat {
        self.format
    }

    fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    async fn initialize(
        &mut self,
        mut output: OutputStream,
        owns_stream: bool,
        cancel: &CancellationToken,
    ) -> Result<InitializationResult> {
        if self.inner.is_initialized() {
            return Ok(InitializationResult::AlreadyInitialized);
        }
        let mut header = [0u8; 4];
        LittleEndian::write_i32(&mut header, self.format.sample_rate_hz as i32);
        write_all_cancellable(&mut output, &header, cancel).await?;
        self.inner.initialize(output, owns_stream, cancel).await
    }

    async fn write(
        &mut self,
        buffer: &[f32],
        samples_per_channel: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.write(buffer, samples_per_channel, cancel).await
    }

    async fn finish(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.inner.finish(cancel).await
    }

    async fn dispose(self: Box<Self>) -> Result<Option<OutputStream>> {
        Box::new(self.inner).dispose().await
    }
}

/// Serves `sqrt`. Codec params are optional for decoding.
pub struct SquareDeltaCodecFactory {
    context: CodecContext,
}

impl SquareDeltaCodecFactory {
    pub fn new(context: CodecContext) -> Self {
        Self { context }
    }
}

impl CodecFactory for SquareDeltaCodecFactory {
    fn supported_decode_formats(&self) -> Vec<String> {
        vec![SQRT.to_string()]
    }

    fn supported_encode_formats(&self) -> Vec<String> {
        vec![SQRT.to_string()]
    }

    fn create_decoder(&self, codec: &str, codec_params: Option<&str>) -> Result<Box<dyn AudioDecoder>> {
        if codec != SQRT {
            return Err(CodecError::unsupported(format!("codec \"{}\"", codec)));
        }
        let declared = codec_params.map(try_parse_codec_params).transpose()?;
        Ok(Box::new(SquareDeltaDecoder::new(declared, self.context.clone())))
    }

    fn create_encoder(&self, codec: &str, input_format: AudioSampleFormat) -> Result<Box<dyn AudioEncoder>> {
        if codec != SQRT {
            return Err(CodecError::unsupported(format!("codec \"{}\"", codec)));
        }
        Ok(Box::new(SquareDeltaEncoder::new(input_format, self.context.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::MemoryStream;
    use crate::audio::codec::test_util::{decode_all, sine};

    async fn encode(format: AudioSampleFormat, samples: &[f32]) -> Vec<u8> {
        let cancel = CancellationToken::new();
        let sink = MemoryStream::new();
        let mut encoder = SquareDeltaEncoder::new(format, CodecContext::default());
        encoder
            .initialize(OutputStream::plain(sink.clone()), true, &cancel)
            .await
            .unwrap();
        // Uneven write sizes must not change the output.
        let frames = samples.len() / format.num_channels;
        let split = frames / 3;
        let ch = format.num_channels;
        encoder.write(&samples[..split * ch], split, &cancel).await.unwrap();
        encoder
            .write(&samples[split * ch..], frames - split, &cancel)
            .await
            .unwrap();
        encoder.finish(&cancel).await.unwrap();
        Box::new(encoder).dispose().await.unwrap();
        sink.contents().to_vec()
    }

    #[test]
    fn ceiling_depends_on_rate() {
        assert_eq!(step_ceiling(48_000), 5_000);
        assert_eq!(step_ceiling(44_100), 8_000);
        assert_eq!(step_ceiling(22_050), 8_000);
        assert_eq!(step_ceiling(16_000), 16_000);
        assert_eq!(step_ceiling(8_000), 16_000);
    }

    #[test]
    fn step_codes() {
        assert_eq!(encode_step(0, 8_000), 0);
        assert_eq!(encode_step(8_000, 8_000), 127);
        assert_eq!(encode_step(100_000, 8_000), 127);
        assert_eq!(encode_step(-8_000, 8_000), 0xFF);
        assert_eq!(decode_step(127, 8_000), 8_000);
        assert_eq!(decode_step(0xFF, 8_000), -8_000);
        assert_eq!(decode_step(0x80, 8_000), 0);
    }

    #[tokio::test]
    async fn header_carries_sample_rate() {
        let bytes = encode(AudioSampleFormat::mono(22_050), &[0.0; 10]).await;
        assert_eq!(bytes.len(), 14);
        assert_eq!(LittleEndian::read_i32(&bytes[..4]), 22_050);
    }

    #[tokio::test]
    async fn encoding_is_deterministic() {
        let format = AudioSampleFormat::stereo(48_000);
        let wave = sine(4_800, 2, 48_000, 440.0);
        let first = encode(format, &wave).await;
        let second = encode(format, &wave).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn decoder_tracks_encoder_staircase() {
        let format = AudioSampleFormat::stereo(16_000);
        let wave = sine(1_600, 2, 16_000, 300.0);
        let bytes = encode(format, &wave).await;

        // Replay the encoder's reconstruction independently.
        let mut expected = Vec::with_capacity(wave.len());
        let mut previous = [0i32; 2];
        for (i, &code) in bytes[4..].iter().enumerate() {
            let ch = i % 2;
            previous[ch] = accumulate(previous[ch], decode_step(code, step_ceiling(16_000)));
            expected.push(previous[ch] as f32 / INT16_SCALE);
        }

        let factory = SquareDeltaCodecFactory::new(CodecContext::default());
        let mut decoder = factory
            .create_decoder(SQRT, Some(&create_codec_params(&format)))
            .unwrap();
        decoder
            .initialize(Box::new(MemoryStream::from_bytes(&bytes)), true, &CancellationToken::new())
            .await
            .unwrap();
        let decoded = decode_all(decoder.as_mut(), 2, 128).await;
        assert_eq!(decoded, expected);

        // Slow waveforms stay close to the input.
        let worst = wave
            .iter()
            .zip(&decoded)
            .map(|(a, b)| (a - b).abs())
            .fold(0f32, f32::max);
        assert!(worst < 0.05, "worst error {}", worst);
    }

    #[tokio::test]
    async fn header_rate_is_used_without_params() {
        let bytes = encode(AudioSampleFormat::mono(44_100), &[0.25; 64]).await;
        let factory = SquareDeltaCodecFactory::new(CodecContext::default());
        let mut decoder = factory.create_decoder(SQRT, None).unwrap();
        assert_eq!(decoder.output_format(), None);
        decoder
            .initialize(Box::new(MemoryStream::from_bytes(&bytes)), true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decoder.output_format(), Some(AudioSampleFormat::mono(44_100)));
        assert_eq!(decode_all(decoder.as_mut(), 1, 10).await.len(), 64);
    }

    #[tokio::test]
    async fn truncated_header_is_invalid() {
        let mut decoder = SquareDeltaDecoder::new(None, CodecContext::default());
        let result = decoder
            .initialize(Box::new(MemoryStream::from_bytes([1u8, 2])), true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, InitializationResult::FailedInvalidData);
        assert!(!decoder.is_initialized());
    }

    #[tokio::test]
    async fn borrowed_input_survives_a_rejected_header() {
        let cancel = CancellationToken::new();
        let negative_rate = (-8_000i32).to_le_bytes();
        for bytes in [&[1u8, 2][..], &negative_rate[..]] {
            let mut decoder = SquareDeltaDecoder::new(None, CodecContext::default());
            let result = decoder
                .initialize(Box::new(MemoryStream::from_bytes(bytes)), false, &cancel)
                .await
                .unwrap();
            assert_eq!(result, InitializationResult::FailedInvalidData);
            assert!(Box::new(decoder).dispose().await.unwrap().is_some());
        }

        let mut owning = SquareDeltaDecoder::new(None, CodecContext::default());
        owning
            .initialize(Box::new(MemoryStream::from_bytes([1u8, 2])), true, &cancel)
            .await
            .unwrap();
        assert!(Box::new(owning).dispose().await.unwrap().is_none());
    }
}
