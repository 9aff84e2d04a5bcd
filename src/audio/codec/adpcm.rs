//! IMA ADPCM in the block layout used by `WAVE_FORMAT_IMA_ADPCM`.
//!
//! A block starts with one 4-byte header per channel (i16 predictor, u8 step
//! index, u8 reserved); the predictor doubles as the block's first sample.
//! After the headers come 4-byte chunks, one per channel in turn, each
//! carrying eight nibbles low nibble first.

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::audio::buffer::{BufferPool, PooledBuffer};
use crate::audio::codec::io::{InputStream, OutputSlot, OutputStream, write_all_cancellable};
use crate::audio::codec::reader::FrameReader;
use crate::audio::codec::{
    AudioDecoder, AudioEncoder, CodecContext, CodecFactory, EncoderState, InitializationResult,
    ReadDeadline, check_buffer,
};
use crate::audio::constants::{
    ADPCM_BLOCK_BYTES_PER_CHANNEL, ADPCM_BLOCK_HEADER_BYTES, ADPCM_INDEX_TABLE, ADPCM_MAX_CHANNELS,
    ADPCM_SMALL_BLOCK_BYTES_PER_CHANNEL, ADPCM_STEP_TABLE, INT16_SCALE,
};
use crate::audio::format::AudioSampleFormat;
use crate::audio::params::{create_codec_params, try_parse_codec_params};
use crate::common::{CodecError, Result};

pub const ADPCM_IMA: &str = "adpcm_ima";

const BLOCK_ALIGN_KEY: &str = "blockalign";
const SAMPLES_PER_CHUNK: usize = 8;
const MAX_STEP_INDEX: i32 = 88;

// ── Block geometry ───────────────────────────────────────────────────────────

/// Block size the encoder picks for `format`.
pub fn default_block_align(format: &AudioSampleFormat) -> usize {
    let per_channel = if format.sample_rate_hz <= 11_025 {
        ADPCM_SMALL_BLOCK_BYTES_PER_CHANNEL
    } else {
        ADPCM_BLOCK_BYTES_PER_CHANNEL
    };
    per_channel * format.num_channels
}

/// Samples per channel stored in a block of `block_align` bytes.
pub fn samples_per_block(block_align: usize, channels: usize) -> usize {
    let header = ADPCM_BLOCK_HEADER_BYTES * channels;
    1 + SAMPLES_PER_CHUNK * (block_align.saturating_sub(header) / (4 * channels))
}

fn validate_layout(channels: usize, block_align: usize) -> Result<()> {
    if channels == 0 || channels > ADPCM_MAX_CHANNELS {
        return Err(CodecError::unsupported(format!(
            "IMA ADPCM supports 1 to {} channels, not {}",
            ADPCM_MAX_CHANNELS, channels
        )));
    }
    let header = ADPCM_BLOCK_HEADER_BYTES * channels;
    if block_align < header || (block_align - header) % (4 * channels) != 0 {
        return Err(CodecError::unsupported(format!(
            "block align {} does not fit {} channels",
            block_align, channels
        )));
    }
    Ok(())
}

/// Codec params of an ADPCM stream, block align included.
pub fn adpcm_codec_params(format: &AudioSampleFormat, block_align: usize) -> String {
    format!("{} {}={}", create_codec_params(format), BLOCK_ALIGN_KEY, block_align)
}

fn parse_block_align(params: &str) -> Result<Option<usize>> {
    for field in params.split_whitespace() {
        if let Some(value) = field.strip_prefix(BLOCK_ALIGN_KEY).and_then(|v| v.strip_prefix('=')) {
            return value.parse().map(Some).map_err(|_| {
                CodecError::param(params, format!("blockalign is not a number: \"{}\"", value))
            });
        }
    }
    Ok(None)
}

// ── Nibble arithmetic ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelState {
    predictor: i32,
    index: i32,
}

impl ChannelState {
    fn reconstruct(&self, nibble: u8) -> i32 {
        let step = ADPCM_STEP_TABLE[self.index as usize];
        let mut diff = step >> 3;
        if nibble & 1 != 0 {
            diff += step >> 2;
        }
        if nibble & 2 != 0 {
            diff += step >> 1;
        }
        if nibble & 4 != 0 {
            diff += step;
        }
        let predicted = if nibble & 8 != 0 {
            self.predictor - diff
        } else {
            self.predictor + diff
        };
        predicted.clamp(i16::MIN as i32, i16::MAX as i32)
    }

    fn advance(&mut self, nibble: u8) -> i16 {
        self.predictor = self.reconstruct(nibble);
        self.index = (self.index + ADPCM_INDEX_TABLE[(nibble & 7) as usize]).clamp(0, MAX_STEP_INDEX);
        self.predictor as i16
    }

    /// Picks the nibble whose reconstruction lands closest to `sample`.
    fn encode(&mut self, sample: i16) -> u8 {
        let target = sample as i32;
        let sign = if target < self.predictor { 8 } else { 0 };
        let best = (0..8u8)
            .map(|magnitude| sign | magnitude)
            .min_by_key(|&nibble| (self.reconstruct(nibble) - target).abs())
            .unwrap_or(sign);
        self.advance(best);
        best
    }
}

/// Decodes one block into interleaved samples and returns the frame count.
/// A block shorter than `block_align` yields the frames it fully holds.
fn decode_block(block: &[u8], channels: usize, output: &mut [f32]) -> Result<usize> {
    let header = ADPCM_BLOCK_HEADER_BYTES * channels;
    let frames = samples_per_block(block.len(), channels);
    let mut states = [ChannelState::default(); ADPCM_MAX_CHANNELS];

    for (c, state) in states.iter_mut().take(channels).enumerate() {
        let h = &block[c * ADPCM_BLOCK_HEADER_BYTES..];
        let index = h[2] as i32;
        if index > MAX_STEP_INDEX {
            return Err(CodecError::format(format!(
                "IMA ADPCM step index {} out of range",
                index
            )));
        }
        state.predictor = LittleEndian::read_i16(h) as i32;
        state.index = index;
        output[c] = state.predictor as f32 / INT16_SCALE;
    }

    let chunk_row = 4 * channels;
    for (g, row) in block[header..].chunks_exact(chunk_row).enumerate() {
        let first_frame = 1 + g * SAMPLES_PER_CHUNK;
        for (c, chunk) in row.chunks_exact(4).enumerate() {
            let state = &mut states[c];
            for (k, &byte) in chunk.iter().enumerate() {
                let frame = first_frame + 2 * k;
                output[frame * channels + c] = state.advance(byte & 0x0F) as f32 / INT16_SCALE;
                output[(frame + 1) * channels + c] = state.advance(byte >> 4) as f32 / INT16_SCALE;
            }
        }
    }
    Ok(frames)
}

/// Encodes `frames` interleaved frames into `output` and returns the bytes
/// written. `frames - 1` must be a multiple of eight.
fn encode_block(samples: &[i16], frames: usize, states: &mut [ChannelState], output: &mut [u8]) -> usize {
    let channels = states.len();
    for (c, state) in states.iter_mut().enumerate() {
        let h = &mut output[c * ADPCM_BLOCK_HEADER_BYTES..(c + 1) * ADPCM_BLOCK_HEADER_BYTES];
        state.predictor = samples[c] as i32;
        LittleEndian::write_i16(h, samples[c]);
        h[2] = state.index as u8;
        h[3] = 0;
    }

    let mut offset = ADPCM_BLOCK_HEADER_BYTES * channels;
    for g in 0..(frames - 1) / SAMPLES_PER_CHUNK {
        let first_frame = 1 + g * SAMPLES_PER_CHUNK;
        for (c, state) in states.iter_mut().enumerate() {
            for k in 0..4 {
                let frame = first_frame + 2 * k;
                let low = state.encode(samples[frame * channels + c]);
                let high = state.encode(samples[(frame + 1) * channels + c]);
                output[offset] = low | (high << 4);
                offset += 1;
            }
        }
    }
    offset
}

// ── Decoder ──────────────────────────────────────────────────────────────────

pub struct AdpcmImaDecoder {
    format: AudioSampleFormat,
    block_align: usize,
    context: CodecContext,
    reader: Option<FrameReader>,
    decoded: PooledBuffer<f32>,
    decoded_pos: usize,
    decoded_frames: usize,
    ended: bool,
}

impl AdpcmImaDecoder {
    pub fn new(format: AudioSampleFormat, block_align: usize, context: CodecContext) -> Result<Self> {
        validate_layout(format.num_channels, block_align)?;
        let decoded = context
            .pools
            .samples
            .rent(samples_per_block(block_align, format.num_channels) * format.num_channels);
        Ok(Self {
            format,
            block_align,
            context,
            reader: None,
            decoded,
            decoded_pos: 0,
            decoded_frames: 0,
            ended: false,
        })
    }

    pub fn block_align(&self) -> usize {
        self.block_align
    }

    /// Decodes the next block, or the short tail block once the transport
    /// has ended. Returns `false` when nothing is left.
    async fn next_block(&mut self, cancel: &CancellationToken) -> Result<bool> {
        let channels = self.format.num_channels;
        let Some(reader) = self.reader.as_mut() else {
            return Ok(false);
        };

        let frames = match reader.fill(cancel).await? {
            Some(_) => {
                let frames = decode_block(reader.frames(1), channels, &mut self.decoded)?;
                reader.consume_frames(1);
                frames
            }
            None => {
                let tail = reader.remainder();
                if tail.len() < ADPCM_BLOCK_HEADER_BYTES * channels {
                    reader.discard_remainder();
                    return Ok(false);
                }
                let usable = tail.len() - (tail.len() - ADPCM_BLOCK_HEADER_BYTES * channels) % (4 * channels);
                trace!(bytes = tail.len(), usable, "decoding short final block");
                let frames = decode_block(&tail[..usable], channels, &mut self.decoded)?;
                reader.discard_remainder();
                frames
            }
        };
        self.decoded_pos = 0;
        self.decoded_frames = frames;
        Ok(true)
    }
}

#[async_trait]
impl AudioDecoder for AdpcmImaDecoder {
    fn codec_name(&self) -> String {
        ADPCM_IMA.to_string()
    }

    fn codec_params(&self) -> Option<String> {
        Some(adpcm_codec_params(&self.format, self.block_align))
    }

    fn output_format(&self) -> Option<AudioSampleFormat> {
        Some(self.format)
    }

    fn is_initialized(&self) -> bool {
        self.reader.is_some()
    }

    fn playback_end_of_stream(&self) -> bool {
        self.ended
    }

    async fn initialize(
        &mut self,
        input: InputStream,
        owns_stream: bool,
        _cancel: &CancellationToken,
    ) -> Result<InitializationResult> {
        if self.reader.is_some() {
            return Ok(InitializationResult::AlreadyInitialized);
        }
        self.reader = Some(FrameReader::new(
            &self.context.pools.bytes,
            input,
            owns_stream,
            self.block_align,
        ));
        debug!(
            codec = ADPCM_IMA,
            format = %self.format,
            block_align = self.block_align,
            "decoder initialized"
        );
        Ok(InitializationResult::Success)
    }

    async fn read(
        &mut self,
        buffer: &mut [f32],
        samples_per_channel: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>> {
        if self.reader.is_none() {
            return Err(CodecError::invalid_usage("decoder is not initialized"));
        }
        if self.ended {
            return Ok(None);
        }
        let channels = self.format.num_channels;
        check_buffer(buffer.len(), samples_per_channel, channels)?;

        let deadline = ReadDeadline::start(self.context.realtime_budget);
        let mut produced = 0;
        while produced < samples_per_channel {
            if self.decoded_pos == self.decoded_frames {
                if deadline.expired(produced) {
                    break;
                }
                match self.next_block(cancel).await {
                    Ok(true) => {}
                    Ok(false) => {
                        self.ended = true;
                        break;
                    }
                    Err(CodecError::Cancelled) if produced > 0 => break,
                    Err(e) => return Err(e),
                }
            }

            let frames = (self.decoded_frames - self.decoded_pos).min(samples_per_channel - produced);
            let src = self.decoded_pos * channels..(self.decoded_pos + frames) * channels;
            buffer[produced * channels..(produced + frames) * channels]
                .copy_from_slice(&self.decoded[src]);
            self.decoded_pos += frames;
            produced += frames;
        }

        if produced == 0 && self.ended {
            debug!(codec = ADPCM_IMA, "end of stream");
            return Ok(None);
        }
        Ok(Some(produced))
    }

    async fn dispose(self: Box<Self>) -> Result<Option<InputStream>> {
        Ok(self.reader.and_then(FrameReader::into_stream))
    }
}

// ── Encoder ──────────────────────────────────────────────────────────────────

pub struct AdpcmImaEncoder {
    format: AudioSampleFormat,
    block_align: usize,
    frames_per_block: usize,
    states: Vec<ChannelState>,
    pending: Vec<i16>,
    pool: BufferPool<u8>,
    output: OutputSlot,
    state: EncoderState,
}

impl AdpcmImaEncoder {
    /// Encoder with the default block size for `format`.
    pub fn new(format: AudioSampleFormat, context: CodecContext) -> Result<Self> {
        Self::with_block_align(format, default_block_align(&format), context)
    }

    pub fn with_block_align(format: AudioSampleFormat, block_align: usize, context: CodecContext) -> Result<Self> {
        validate_layout(format.num_channels, block_align)?;
        let frames_per_block = samples_per_block(block_align, format.num_channels);
        Ok(Self {
            format,
            block_align,
            frames_per_block,
            states: vec![ChannelState::default(); format.num_channels],
            pending: Vec::with_capacity(frames_per_block * format.num_channels),
            pool: context.pools.bytes,
            output: OutputSlot::default(),
            state: EncoderState::Uninitialized,
        })
    }

    pub fn block_align(&self) -> usize {
        self.block_align
    }

    pub fn frames_per_block(&self) -> usize {
        self.frames_per_block
    }

    async fn flush_block(&mut self, frames: usize, cancel: &CancellationToken) -> Result<()> {
        let mut block = self.pool.rent(self.block_align);
        let written = encode_block(&self.pending, frames, &mut self.states, &mut block);
        self.pending.clear();
        write_all_cancellable(self.output.get()?, &block[..written], cancel).await
    }
}

#[async_trait]
impl AudioEncoder for AdpcmImaEncoder {
    fn codec_name(&self) -> String {
        ADPCM_IMA.to_string()
    }

    fn codec_params(&self) -> Option<String> {
        Some(adpcm_codec_params(&self.format, self.block_align))
    }

    fn input_format(&self) -> AudioSampleFormat {
        self.format
    }

    fn is_initialized(&self) -> bool {
        self.output.is_bound()
    }

    async fn initialize(
        &mut self,
        output: OutputStream,
        owns_stream: bool,
        _cancel: &CancellationToken,
    ) -> Result<InitializationResult> {
        if self.output.is_bound() {
            return Ok(InitializationResult::AlreadyInitialized);
        }
        self.output.bind(output, owns_stream);
        self.state = EncoderState::Streaming;
        debug!(
            codec = ADPCM_IMA,
            format = %self.format,
            block_align = self.block_align,
            "encoder initialized"
        );
        Ok(InitializationResult::Success)
    }

    async fn write(
        &mut self,
        buffer: &[f32],
        samples_per_channel: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.state.ensure_writable()?;
        let channels = self.format.num_channels;
        check_buffer(buffer.len(), samples_per_channel, channels)?;

        let block_samples = self.frames_per_block * channels;
        let mut input = &buffer[..samples_per_channel * channels];
        while !input.is_empty() {
            let take = (block_samples - self.pending.len()).min(input.len());
            self.pending.extend(
                input[..take]
                    .iter()
                    .map(|s| (s.clamp(-1.0, 1.0) * INT16_SCALE).round() as i16),
            );
            input = &input[take..];
            if self.pending.len() == block_samples {
                self.flush_block(self.frames_per_block, cancel).await?;
            }
        }
        Ok(())
    }

    async fn finish(&mut self, cancel: &CancellationToken) -> Result<()> {
        match self.state {
            EncoderState::Uninitialized => Err(CodecError::invalid_usage("encoder is not initialized")),
            EncoderState::Finished => Ok(()),
            EncoderState::Streaming => {
                let channels = self.format.num_channels;
                let frames = self.pending.len() / channels;
                if frames > 0 {
                    // Pad to a whole chunk after the header sample.
                    let padded = 1 + (frames - 1).div_ceil(SAMPLES_PER_CHUNK) * SAMPLES_PER_CHUNK;
                    self.pending.resize(padded * channels, 0);
                    trace!(frames, padded, "flushing short final block");
                    self.flush_block(padded, cancel).await?;
                }
                self.output.get()?.flush().await?;
                self.state = EncoderState::Finished;
                debug!(codec = ADPCM_IMA, "encoder finished");
                Ok(())
            }
        }
    }

    async fn dispose(self: Box<Self>) -> Result<Option<OutputStream>> {
        if self.state == EncoderState::Streaming {
            warn!(codec = ADPCM_IMA, "encoder disposed without finish");
        }
        self.output.release().await
    }
}

/// Serves `adpcm_ima`. Decoding needs codec params; a missing `blockalign`
/// field falls back to the encoder's default for the format.
pub struct AdpcmCodecFactory {
    context: CodecContext,
}

impl AdpcmCodecFactory {
    pub fn new(context: CodecContext) -> Self {
        Self { context }
    }
}

impl CodecFactory for AdpcmCodecFactory {
    fn supported_decode_formats(&self) -> Vec<String> {
        vec![ADPCM_IMA.to_string()]
    }

    fn supported_encode_formats(&self) -> Vec<String> {
        vec![ADPCM_IMA.to_string()]
    }

    fn create_decoder(&self, codec: &str, codec_params: Option<&str>) -> Result<Box<dyn AudioDecoder>> {
        if codec != ADPCM_IMA {
            return Err(CodecError::unsupported(format!("codec \"{}\"", codec)));
        }
        let params = codec_params
            .ok_or_else(|| CodecError::param("", "IMA ADPCM requires codec params"))?;
        let format = try_parse_codec_params(params)?;
        let block_align = parse_block_align(params)?.unwrap_or_else(|| default_block_align(&format));
        Ok(Box::new(AdpcmImaDecoder::new(format, block_align, self.context.clone())?))
    }

    fn create_encoder(&self, codec: &str, input_format: AudioSampleFormat) -> Result<Box<dyn AudioEncoder>> {
        if codec != ADPCM_IMA {
            return Err(CodecError::unsupported(format!("codec \"{}\"", codec)));
        }
        Ok(Box::new(AdpcmImaEncoder::new(input_format, self.context.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::MemoryStream;
    use crate::audio::codec::io::TrickleReader;
    use crate::audio::codec::test_util::{decode_all, sine};

    async fn encode(encoder: &mut AdpcmImaEncoder, samples: &[f32]) -> Vec<u8> {
        let cancel = CancellationToken::new();
        let sink = MemoryStream::new();
        encoder
            .initialize(OutputStream::plain(sink.clone()), true, &cancel)
            .await
            .unwrap();
        let channels = encoder.input_format().num_channels;
        for chunk in samples.chunks(300 * channels) {
            encoder.write(chunk, chunk.len() / channels, &cancel).await.unwrap();
        }
        encoder.finish(&cancel).await.unwrap();
        sink.contents().to_vec()
    }

    #[test]
    fn block_geometry() {
        assert_eq!(samples_per_block(512, 1), 1017);
        assert_eq!(samples_per_block(256, 1), 505);
        assert_eq!(samples_per_block(1024, 2), 1017);
        assert_eq!(default_block_align(&AudioSampleFormat::mono(8_000)), 256);
        assert_eq!(default_block_align(&AudioSampleFormat::mono(11_025)), 256);
        assert_eq!(default_block_align(&AudioSampleFormat::stereo(44_100)), 1024);
        assert!(validate_layout(2, 1023).is_err());
        assert!(validate_layout(9, 4608).is_err());
    }

    #[test]
    fn step_index_stays_in_table() {
        let mut state = ChannelState::default();
        for _ in 0..200 {
            state.advance(0x7);
        }
        assert_eq!(state.index, MAX_STEP_INDEX);
        assert_eq!(state.predictor, i16::MAX as i32);
        for _ in 0..200 {
            state.advance(0x0);
        }
        assert_eq!(state.index, 0);
    }

    #[test]
    fn encoder_picks_the_closest_nibble() {
        let mut state = ChannelState {
            predictor: 0,
            index: 20,
        };
        let target = 150i16;
        let mut trial = state;
        let chosen = trial.encode(target);
        let best = (0..16u8)
            .map(|n| (state.reconstruct(n) - target as i32).abs())
            .min()
            .unwrap();
        assert_eq!((state.reconstruct(chosen) - target as i32).abs(), best);
        state.encode(target);
        assert_ne!(state.predictor, 0);
    }

    #[test]
    fn out_of_range_index_is_a_format_error() {
        let mut block = vec![0u8; 36];
        block[2] = 89;
        let mut out = vec![0f32; 64];
        assert!(matches!(
            decode_block(&block, 1, &mut out),
            Err(CodecError::Format(_))
        ));
    }

    #[tokio::test]
    async fn mono_round_trip_tracks_input() {
        let format = AudioSampleFormat::mono(16_000);
        let wave = sine(3_000, 1, 16_000, 440.0);
        let mut encoder = AdpcmImaEncoder::new(format, CodecContext::default()).unwrap();
        let bytes = encode(&mut encoder, &wave).await;

        // Two full blocks plus a short one padded to whole chunks.
        let tail_frames: usize = 3_000 - 2 * 1017;
        let tail_bytes = 4 + (tail_frames - 1).div_ceil(8) * 4;
        assert_eq!(bytes.len(), 2 * 512 + tail_bytes);

        let mut decoder = AdpcmImaDecoder::new(format, 512, CodecContext::default()).unwrap();
        decoder
            .initialize(Box::new(TrickleReader::new(bytes, 77)), true, &CancellationToken::new())
            .await
            .unwrap();
        let decoded = decode_all(&mut decoder, 1, 400).await;
        assert!(decoded.len() >= wave.len());
        assert!(decoded.len() < wave.len() + 8);
        assert!(decoder.playback_end_of_stream());

        let worst = wave
            .iter()
            .zip(&decoded)
            .skip(32)
            .map(|(a, b)| (a - b).abs())
            .fold(0f32, f32::max);
        assert!(worst < 0.05, "worst error {}", worst);
    }

    #[tokio::test]
    async fn stereo_channels_stay_separate() {
        let format = AudioSampleFormat::stereo(8_000);
        let mut wave = Vec::new();
        for i in 0..1_200 {
            let v = ((i as f32) * 0.05).sin() * 0.5;
            wave.push(v);
            wave.push(0.0);
        }
        let factory = AdpcmCodecFactory::new(CodecContext::default());
        let mut encoder = AdpcmImaEncoder::new(format, CodecContext::default()).unwrap();
        let bytes = encode(&mut encoder, &wave).await;
        let params = encoder.codec_params().unwrap();
        assert!(params.ends_with("blockalign=512"));

        let mut decoder = factory.create_decoder(ADPCM_IMA, Some(&params)).unwrap();
        decoder
            .initialize(Box::new(MemoryStream::from_bytes(&bytes)), true, &CancellationToken::new())
            .await
            .unwrap();
        let decoded = decode_all(decoder.as_mut(), 2, 256).await;
        for frame in decoded.chunks(2).take(1_200) {
            assert!(frame[1].abs() < 0.01, "right channel leaked {}", frame[1]);
        }
    }

    #[tokio::test]
    async fn dangling_bytes_shorter_than_a_header_are_dropped() {
        let format = AudioSampleFormat::mono(16_000);
        let mut encoder = AdpcmImaEncoder::new(format, CodecContext::default()).unwrap();
        let mut bytes = encode(&mut encoder, &sine(1017, 1, 16_000, 200.0)).await;
        assert_eq!(bytes.len(), 512);
        bytes.extend_from_slice(&[1, 2]);

        let mut decoder = AdpcmImaDecoder::new(format, 512, CodecContext::default()).unwrap();
        decoder
            .initialize(Box::new(MemoryStream::from_bytes(&bytes)), true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decode_all(&mut decoder, 1, 4096).await.len(), 1017);
    }

    #[tokio::test]
    async fn write_after_finish_fails() {
        let mut encoder = AdpcmImaEncoder::new(AudioSampleFormat::mono(8_000), CodecContext::default()).unwrap();
        let cancel = CancellationToken::new();
        encode(&mut encoder, &[0.1; 10]).await;
        encoder.finish(&cancel).await.unwrap();
        assert!(matches!(
            encoder.write(&[0.0], 1, &cancel).await,
            Err(CodecError::InvalidUsage(_))
        ));
    }
}
