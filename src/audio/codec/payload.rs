//! Headerless fixed-width sample payloads.
//!
//! Every codec that stores a fixed number of bytes per sample plugs a
//! [`SampleUnpacker`] or [`SamplePacker`] into [`PayloadDecoder`] or
//! [`PayloadEncoder`], which own the stream, the lifecycle and the pooled
//! scratch space.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::buffer::BufferPool;
use crate::audio::codec::io::{InputStream, OutputSlot, OutputStream, write_all_cancellable};
use crate::audio::codec::reader::FrameReader;
use crate::audio::codec::{
    AudioDecoder, AudioEncoder, CodecContext, EncoderState, InitializationResult, ReadDeadline,
    check_buffer,
};
use crate::audio::format::AudioSampleFormat;
use crate::audio::params::create_codec_params;
use crate::common::{CodecError, Result};

/// Turns encoded bytes into samples.
pub trait SampleUnpacker: Send {
    fn bytes_per_sample(&self) -> usize;

    /// Decodes whole frames. `input.len()` is a multiple of
    /// `bytes_per_sample() * channels` and `output` holds exactly the
    /// matching number of samples.
    fn unpack(&mut self, input: &[u8], output: &mut [f32], channels: usize);
}

/// Turns samples into encoded bytes.
pub trait SamplePacker: Send {
    fn bytes_per_sample(&self) -> usize;

    /// Encodes whole frames into `output`, which holds exactly
    /// `input.len() * bytes_per_sample()` bytes.
    fn pack(&mut self, input: &[f32], output: &mut [u8], channels: usize);
}

// ── Decoder ──────────────────────────────────────────────────────────────────

pub struct PayloadDecoder<U: SampleUnpacker> {
    name: String,
    format: AudioSampleFormat,
    unpacker: U,
    context: CodecContext,
    reader: Option<FrameReader>,
    ended: bool,
}

impl<U: SampleUnpacker> PayloadDecoder<U> {
    pub fn new(name: impl Into<String>, format: AudioSampleFormat, unpacker: U, context: CodecContext) -> Self {
        Self {
            name: name.into(),
            format,
            unpacker,
            context,
            reader: None,
            ended: false,
        }
    }

    pub fn format(&self) -> &AudioSampleFormat {
        &self.format
    }
}

#[async_trait]
impl<U: SampleUnpacker> AudioDecoder for PayloadDecoder<U> {
    fn codec_name(&self) -> String {
        self.name.clone()
    }

    fn codec_params(&self) -> Option<String> {
        Some(create_codec_params(&self.format))
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

        let frame_bytes = self.unpacker.bytes_per_sample() * self.format.num_channels;
        self.reader = Some(FrameReader::new(
            &self.context.pools.bytes,
            input,
            owns_stream,
            frame_bytes,
        ));
        debug!(codec = %self.name, format = %self.format, "decoder initialized");
        Ok(InitializationResult::Success)
    }

    async fn read(
        &mut self,
        buffer: &mut [f32],
        samples_per_channel: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>> {
        let channels = self.format.num_channels;
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| CodecError::invalid_usage("decoder is not initialized"))?;
        if self.ended {
            return Ok(None);
        }
        check_buffer(buffer.len(), samples_per_channel, channels)?;

        let deadline = ReadDeadline::start(self.context.realtime_budget);
        let mut produced = 0;
        while produced < samples_per_channel {
            if deadline.expired(produced) {
                break;
            }

            let available = match reader.fill(cancel).await {
                Ok(Some(available)) => available,
                Ok(None) => {
                    reader.discard_remainder();
                    self.ended = true;
                    break;
                }
                Err(CodecError::Cancelled) if produced > 0 => break,
                Err(e) => return Err(e),
            };

            let frames = available.min(samples_per_channel - produced);
            self.unpacker.unpack(
                reader.frames(frames),
                &mut buffer[produced * channels..(produced + frames) * channels],
                channels,
            );
            reader.consume_frames(frames);
            produced += frames;
        }

        if produced == 0 && self.ended {
            debug!(codec = %self.name, "end of stream");
            return Ok(None);
        }
        Ok(Some(produced))
    }

    async fn dispose(self: Box<Self>) -> Result<Option<InputStream>> {
        Ok(self.reader.and_then(FrameReader::into_stream))
    }
}

// ── Encoder ──────────────────────────────────────────────────────────────────

pub struct PayloadEncoder<P: SamplePacker> {
    name: String,
    format: AudioSampleFormat,
    packer: P,
    pool: BufferPool<u8>,
    output: OutputSlot,
    state: EncoderState,
}

impl<P: SamplePacker> PayloadEncoder<P> {
    pub fn new(name: impl Into<String>, format: AudioSampleFormat, packer: P, context: CodecContext) -> Self {
        Self {
            name: name.into(),
            format,
            packer,
            pool: context.pools.bytes,
            output: OutputSlot::default(),
            state: EncoderState::Uninitialized,
        }
    }
}

#[async_trait]
impl<P: SamplePacker> AudioEncoder for PayloadEncoder<P> {
    fn codec_name(&self) -> String {
        self.name.clone()
    }

    fn codec_params(&self) -> Option<String> {
        Some(create_codec_params(&self.format))
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
        debug!(codec = %self.name, format = %self.format, "encoder initialized");
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

        let frame_bytes = self.packer.bytes_per_sample() * channels;
        let mut scratch = self.pool.rent_default();
        let frames_per_chunk = (scratch.capacity() / frame_bytes).max(1);
        let stream = self.output.get()?;

        let input = &buffer[..samples_per_channel * channels];
        for chunk in input.chunks(frames_per_chunk * channels) {
            let bytes = chunk.len() * self.packer.bytes_per_sample();
            scratch.set_len(bytes);
            self.packer.pack(chunk, &mut scratch, channels);
            write_all_cancellable(stream, &scratch, cancel).await?;
        }
        Ok(())
    }

    async fn finish(&mut self, _cancel: &CancellationToken) -> Result<()> {
        match self.state {
            EncoderState::Uninitialized => {
                Err(CodecError::invalid_usage("encoder is not initialized"))
            }
            EncoderState::Finished => Ok(()),
            EncoderState::Streaming => {
                self.output.get()?.flush().await?;
                self.state = EncoderState::Finished;
                debug!(codec = %self.name, "encoder finished");
                Ok(())
            }
        }
    }

    async fn dispose(self: Box<Self>) -> Result<Option<OutputStream>> {
        if self.state == EncoderState::Streaming {
            warn!(codec = %self.name, "encoder disposed without finish");
        }
        self.output.release().await
    }
}
