use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::audio::buffer::PooledBuffer;
use crate::audio::codec::io::{OutputSlot, OutputStream, write_all_cancellable};
use crate::audio::codec::opus::ogg::page::{
    FLAG_BEGIN_OF_STREAM, FLAG_END_OF_STREAM, PageBuilder, segments_for,
};
use crate::audio::codec::opus::ogg::{OGG_OPUS, OpusHead, OpusTags};
use crate::audio::codec::opus::{
    OpusChannelLayout, OpusEncoderSettings, OpusPacketEncoder, OpusProvider, frame_size,
    is_opus_sample_rate,
};
use crate::audio::codec::{AudioEncoder, CodecContext, EncoderState, InitializationResult, check_buffer};
use crate::audio::constants::{
    OGG_MAX_SEGMENTS, OPUS_GRANULE_RATE, OPUS_MAX_PACKET_SIZE, OPUS_OGG_PRE_SKIP,
};
use crate::audio::format::AudioSampleFormat;
use crate::common::{CodecError, Result};
use crate::configs::OpusConfig;

const VENDOR: &str = concat!("streamcodec ", env!("CARGO_PKG_VERSION"));

/// Encodes fixed-duration Opus frames into an Ogg stream. The stream opens
/// with 80 ms of silence that decoders drop as pre-skip, and the final page
/// carries the exact sample count.
pub struct OpusOggEncoder {
    format: AudioSampleFormat,
    layout: OpusChannelLayout,
    encoder: Box<dyn OpusPacketEncoder>,
    context: CodecContext,
    frame_size: usize,
    /// Granule advance of one frame.
    granule_step: u64,
    pending: PooledBuffer<f32>,
    pending_frames: usize,
    packet: PooledBuffer<u8>,
    page: PageBuilder,
    page_segments: usize,
    serial: u32,
    sequence: u32,
    granule: u64,
    output: OutputSlot,
    state: EncoderState,
    packets: u64,
}

impl OpusOggEncoder {
    pub fn new(
        format: AudioSampleFormat,
        provider: &dyn OpusProvider,
        config: &OpusConfig,
        context: CodecContext,
    ) -> Result<Self> {
        if !is_opus_sample_rate(format.sample_rate_hz) {
            return Err(CodecError::unsupported(format!(
                "Opus cannot encode at {} Hz",
                format.sample_rate_hz
            )));
        }
        let layout = OpusChannelLayout::for_mapping(format.channel_mapping)?;
        let frame_size = frame_size(format.sample_rate_hz, config.frame_ms)?;
        let settings = OpusEncoderSettings {
            bitrate_kbps: config.bitrate_kbps,
        };
        let encoder = provider.create_encoder(format.sample_rate_hz, &layout, settings)?;

        let mut pending = context.pools.samples.rent(frame_size * format.num_channels);
        pending.set_len(frame_size * format.num_channels);
        let mut packet = context.pools.bytes.rent(OPUS_MAX_PACKET_SIZE);
        packet.set_len(OPUS_MAX_PACKET_SIZE);

        let serial = rand::random::<u32>();
        let page_segments = config.ogg_page_segments.clamp(1, OGG_MAX_SEGMENTS);
        debug!(
            provider = provider.name(),
            format = %format,
            frame_size,
            serial,
            page_segments,
            "Ogg Opus encoder created"
        );
        Ok(Self {
            format,
            granule_step: frame_size as u64 * OPUS_GRANULE_RATE as u64 / format.sample_rate_hz as u64,
            layout,
            encoder,
            context,
            frame_size,
            pending,
            pending_frames: 0,
            packet,
            page: PageBuilder::new(),
            page_segments,
            serial,
            sequence: 0,
            granule: 0,
            output: OutputSlot::default(),
            state: EncoderState::Uninitialized,
            packets: 0,
        })
    }

    /// Samples per channel in each packet.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    async fn write_page(&mut self, flags: u8, granule: u64, cancel: &CancellationToken) -> Result<()> {
        let page = self.page.finish(flags, granule, self.serial, self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        trace!(sequence = self.sequence, bytes = page.len(), granule, "Ogg page written");
        write_all_cancellable(self.output.get()?, &page, cancel).await
    }

    async fn write_headers(&mut self, cancel: &CancellationToken) -> Result<()> {
        let head = OpusHead::for_layout(&self.layout, self.format.sample_rate_hz, OPUS_OGG_PRE_SKIP);
        self.page.push_packet(&head.to_bytes());
        self.write_page(FLAG_BEGIN_OF_STREAM, 0, cancel).await?;

        let tags = OpusTags::new(VENDOR).to_bytes();
        // Tags larger than one page are continued on the following pages.
        let mut rest = &tags[..];
        while rest.len() >= self.page.room() * 255 {
            let take = self.page.room() * 255;
            self.page.push_fragment(&rest[..take], false);
            rest = &rest[take..];
            self.write_page(0, 0, cancel).await?;
        }
        self.page.push_fragment(rest, true);
        self.write_page(0, 0, cancel).await
    }

    /// Appends samples to the pending frame, emitting every full one.
    async fn push(&mut self, buffer: &[f32], samples_per_channel: usize, cancel: &CancellationToken) -> Result<()> {
        let channels = self.format.num_channels;
        let mut consumed = 0;
        while consumed < samples_per_channel {
            let frames = (self.frame_size - self.pending_frames).min(samples_per_channel - consumed);
            let start = self.pending_frames * channels;
            self.pending[start..start + frames * channels]
                .copy_from_slice(&buffer[consumed * channels..(consumed + frames) * channels]);
            self.pending_frames += frames;
            consumed += frames;

            if self.pending_frames == self.frame_size {
                self.emit_frame(self.granule_step, cancel).await?;
            }
        }
        Ok(())
    }

    /// Encodes the pending frame and advances the granule by `advance`.
    async fn emit_frame(&mut self, advance: u64, cancel: &CancellationToken) -> Result<()> {
        let len = self.encoder.encode(&self.pending, self.frame_size, &mut self.packet)?;
        if len == 0 || len > OPUS_MAX_PACKET_SIZE {
            return Err(CodecError::Opus(format!("encoder produced a {} byte packet", len)));
        }
        if segments_for(len) > self.page.room() {
            self.write_page(0, self.granule, cancel).await?;
        }
        self.page.push_packet(&self.packet[..len]);
        self.granule += advance;
        self.pending_frames = 0;
        self.packets += 1;

        if self.page.segments() >= self.page_segments {
            self.write_page(0, self.granule, cancel).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AudioEncoder for OpusOggEncoder {
    fn codec_name(&self) -> String {
        OGG_OPUS.to_string()
    }

    /// Ogg Opus describes itself.
    fn codec_params(&self) -> Option<String> {
        None
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
        cancel: &CancellationToken,
    ) -> Result<InitializationResult> {
        if self.output.is_bound() {
            return Ok(InitializationResult::AlreadyInitialized);
        }
        self.output.bind(output, owns_stream);
        self.write_headers(cancel).await?;

        let channels = self.format.num_channels;
        let pre_skip = OPUS_OGG_PRE_SKIP as usize * self.format.sample_rate_hz as usize / OPUS_GRANULE_RATE as usize;
        let mut silence = self.context.pools.samples.rent(pre_skip * channels);
        silence.set_len(pre_skip * channels);
        silence.fill(0.0);
        self.push(&silence, pre_skip, cancel).await?;

        self.state = EncoderState::Streaming;
        info!(
            format = %self.format,
            frame_size = self.frame_size,
            serial = self.serial,
            "Ogg Opus encoder initialized"
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
        check_buffer(buffer.len(), samples_per_channel, self.format.num_channels)?;
        self.push(buffer, samples_per_channel, cancel).await
    }

    async fn finish(&mut self, cancel: &CancellationToken) -> Result<()> {
        match self.state {
            EncoderState::Uninitialized => Err(CodecError::invalid_usage("encoder is not initialized")),
            EncoderState::Finished => Ok(()),
            EncoderState::Streaming => {
                if self.pending_frames > 0 {
                    // Only the real samples count towards the granule.
                    let advance = self.pending_frames as u64 * OPUS_GRANULE_RATE as u64
                        / self.format.sample_rate_hz as u64;
                    let start = self.pending_frames * self.format.num_channels;
                    self.pending[start..].fill(0.0);
                    self.emit_frame(advance, cancel).await?;
                }
                if !self.page.is_empty() {
                    self.write_page(0, self.granule, cancel).await?;
                }
                self.page.push_packet(&[]);
                self.write_page(FLAG_END_OF_STREAM, self.granule, cancel).await?;
                self.output.get()?.flush().await?;
                self.state = EncoderState::Finished;
                debug!(
                    packets = self.packets,
                    pages = self.sequence,
                    granule = self.granule,
                    "Ogg Opus encoder finished"
                );
                Ok(())
            }
        }
    }

    async fn dispose(self: Box<Self>) -> Result<Option<OutputStream>> {
        if self.state == EncoderState::Streaming {
            warn!(codec = OGG_OPUS, "encoder disposed without finish");
        }
        self.output.release().await
    }
}
