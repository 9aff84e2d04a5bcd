//! Streaming codec contract.
//!
//! Decoders pull encoded bytes from an [`InputStream`] and produce interleaved
//! `f32` samples; encoders accept interleaved samples and push encoded bytes
//! into an [`OutputStream`]. Both move through
//! `Uninitialized → Initialized → Streaming → Finished/Disposed`.
//!
//! All entry points are async. [`BlockingDecoder`] and [`BlockingEncoder`]
//! drive the same futures to completion on the calling thread.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::audio::buffer::BufferPools;
use crate::audio::format::AudioSampleFormat;
use crate::common::{CodecError, Result};

pub mod adpcm;
pub mod factory;
pub mod g711;
pub mod io;
pub mod opus;
pub mod payload;
pub mod pcm;
pub mod reader;
pub mod riff;
pub mod sqrt;

pub use factory::{AggregateCodecFactory, CodecFactory, default_factory};
pub use io::{InputStream, MemoryStream, OutputStream};

/// Outcome of binding a codec to its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializationResult {
    Success,
    /// The codec was already bound; the new stream was dropped untouched.
    AlreadyInitialized,
    /// The stream header is malformed.
    FailedInvalidData,
    /// The stream is well-formed but describes something unsupported.
    FailedUnsupportedFormat,
}

impl InitializationResult {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Everything a codec instance borrows from its environment.
#[derive(Clone, Debug, Default)]
pub struct CodecContext {
    pub pools: BufferPools,
    /// Decoders return early once a read has run this long and produced
    /// at least one sample.
    pub realtime_budget: Option<Duration>,
}

impl CodecContext {
    pub fn new(pools: BufferPools) -> Self {
        Self {
            pools,
            realtime_budget: None,
        }
    }

    pub fn with_realtime_budget(mut self, budget: Option<Duration>) -> Self {
        self.realtime_budget = budget;
        self
    }
}

/// Tracks the real-time budget of a single read call.
pub(crate) struct ReadDeadline {
    start: Instant,
    budget: Option<Duration>,
}

impl ReadDeadline {
    pub fn start(budget: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    /// True once the budget is spent and something has been produced.
    pub fn expired(&self, produced: usize) -> bool {
        produced > 0 && self.budget.is_some_and(|b| self.start.elapsed() >= b)
    }
}

/// Checks a caller buffer against the requested frame count.
pub(crate) fn check_buffer(len: usize, frames: usize, channels: usize) -> Result<()> {
    let needed = frames * channels;
    if len < needed {
        return Err(CodecError::invalid_usage(format!(
            "buffer holds {} samples but {} frames of {} channels were requested",
            len, frames, channels
        )));
    }
    Ok(())
}

/// Lifecycle of an encoder after binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum EncoderState {
    #[default]
    Uninitialized,
    Streaming,
    Finished,
}

impl EncoderState {
    pub fn ensure_writable(self) -> Result<()> {
        match self {
            Self::Streaming => Ok(()),
            Self::Uninitialized => Err(CodecError::invalid_usage("encoder is not initialized")),
            Self::Finished => Err(CodecError::invalid_usage("write after finish")),
        }
    }
}

#[async_trait]
pub trait AudioDecoder: Send {
    /// Codec name as understood by the factories.
    fn codec_name(&self) -> String;

    /// Parameter string describing the decoded output, once known.
    fn codec_params(&self) -> Option<String>;

    /// Output format, once known. Headerless codecs know it up front.
    fn output_format(&self) -> Option<AudioSampleFormat>;

    fn is_initialized(&self) -> bool;

    /// True once `read` has reported the end of the stream.
    fn playback_end_of_stream(&self) -> bool;

    async fn initialize(
        &mut self,
        input: InputStream,
        owns_stream: bool,
        cancel: &CancellationToken,
    ) -> Result<InitializationResult>;

    /// Decodes up to `samples_per_channel` frames into `buffer`.
    ///
    /// Returns `Ok(None)` at the end of the stream and on every call after.
    /// Fewer frames than requested come back only at the end of the stream
    /// or when the real-time budget ran out.
    async fn read(
        &mut self,
        buffer: &mut [f32],
        samples_per_channel: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>>;

    /// Releases the decoder. An owned stream is dropped; a borrowed one is
    /// handed back.
    async fn dispose(self: Box<Self>) -> Result<Option<InputStream>>;
}

#[async_trait]
pub trait AudioEncoder: Send {
    fn codec_name(&self) -> String;

    /// Parameter string a decoder needs to read this encoder's output.
    fn codec_params(&self) -> Option<String>;

    fn input_format(&self) -> AudioSampleFormat;

    fn is_initialized(&self) -> bool;

    async fn initialize(
        &mut self,
        output: OutputStream,
        owns_stream: bool,
        cancel: &CancellationToken,
    ) -> Result<InitializationResult>;

    /// Encodes `samples_per_channel` frames from `buffer`. Partial internal
    /// frames carry over to the next call.
    async fn write(
        &mut self,
        buffer: &[f32],
        samples_per_channel: usize,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Flushes the trailing partial frame, padded with silence. Writing
    /// afterwards is an error.
    async fn finish(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Releases the encoder. An owned stream is shut down; a borrowed one is
    /// handed back.
    async fn dispose(self: Box<Self>) -> Result<Option<OutputStream>>;
}

// ── Blocking adapters ────────────────────────────────────────────────────────

/// Blocking entry points with the same semantics as [`AudioDecoder`].
pub trait BlockingDecoder: AudioDecoder {
    fn initialize_blocking(
        &mut self,
        input: InputStream,
        owns_stream: bool,
        cancel: &CancellationToken,
    ) -> Result<InitializationResult> {
        futures::executor::block_on(self.initialize(input, owns_stream, cancel))
    }

    fn read_blocking(
        &mut self,
        buffer: &mut [f32],
        samples_per_channel: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>> {
        futures::executor::block_on(self.read(buffer, samples_per_channel, cancel))
    }
}

impl<T: AudioDecoder + ?Sized> BlockingDecoder for T {}

/// Blocking entry points with the same semantics as [`AudioEncoder`].
pub trait BlockingEncoder: AudioEncoder {
    fn initialize_blocking(
        &mut self,
        output: OutputStream,
        owns_stream: bool,
        cancel: &CancellationToken,
    ) -> Result<InitializationResult> {
        futures::executor::block_on(self.initialize(output, owns_stream, cancel))
    }

    fn write_blocking(
        &mut self,
        buffer: &[f32],
        samples_per_channel: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        futures::executor::block_on(self.write(buffer, samples_per_channel, cancel))
    }

    fn finish_blocking(&mut self, cancel: &CancellationToken) -> Result<()> {
        futures::executor::block_on(self.finish(cancel))
    }
}

impl<T: AudioEncoder + ?Sized> BlockingEncoder for T {}

/// Disposes a boxed decoder on the calling thread.
pub fn dispose_decoder_blocking(decoder: Box<dyn AudioDecoder>) -> Result<Option<InputStream>> {
    futures::executor::block_on(decoder.dispose())
}

/// Disposes a boxed encoder on the calling thread.
pub fn dispose_encoder_blocking(encoder: Box<dyn AudioEncoder>) -> Result<Option<OutputStream>> {
    futures::executor::block_on(encoder.dispose())
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Decodes until the end of the stream, `chunk` frames at a time.
    pub async fn decode_all(decoder: &mut dyn AudioDecoder, channels: usize, chunk: usize) -> Vec<f32> {
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        let mut buffer = vec![0f32; chunk * channels];
        while let Some(n) = decoder.read(&mut buffer, chunk, &cancel).await.unwrap() {
            out.extend_from_slice(&buffer[..n * channels]);
        }
        out
    }

    /// Deterministic pseudo-random samples in `[-amplitude, amplitude]`.
    pub fn random_samples(count: usize, amplitude: f32, seed: u64) -> Vec<f32> {
        use rand::{Rng, SeedableRng, rngs::StdRng};

        let mut rng = StdRng::seed_from_u64(seed);
        (0..count).map(|_| rng.gen_range(-amplitude..=amplitude)).collect()
    }

    /// Interleaved sine wave.
    pub fn sine(frames: usize, channels: usize, rate: u32, hz: f32) -> Vec<f32> {
        let mut out = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            let v = (i as f32 * hz * std::f32::consts::TAU / rate as f32).sin() * 0.6;
            for c in 0..channels {
                out.push(if c % 2 == 0 { v } else { -v });
            }
        }
        out
    }
}
