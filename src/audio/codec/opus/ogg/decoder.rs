use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::audio::buffer::{ByteRing, PooledBuffer};
use crate::audio::codec::io::{InputStream, read_cancellable};
use crate::audio::codec::opus::ogg::demux::OggDemuxer;
use crate::audio::codec::opus::ogg::{OGG_OPUS, OpusHead, OpusTags};
use crate::audio::codec::opus::{OpusPacketDecoder, OpusProvider, snap_sample_rate};
use crate::audio::codec::{
    AudioDecoder, CodecContext, InitializationResult, ReadDeadline, check_buffer,
};
use crate::audio::constants::{
    MAX_OPUS_FRAME_SIZE, OGG_INPUT_RING_SIZE, OGG_READ_RESERVE, OPUS_GRANULE_RATE,
};
use crate::audio::format::AudioSampleFormat;
use crate::audio::params::create_codec_params;
use crate::common::{CodecError, Result};
use crate::configs::OpusConfig;

struct Input {
    stream: InputStream,
    owns_stream: bool,
    ring: ByteRing,
    demux: OggDemuxer,
}

impl Input {
    /// Reads more bytes into the ring. Returns `false` at end of input.
    async fn fill_ring(&mut self, cancel: &CancellationToken) -> Result<bool> {
        self.ring.compact_if_needed(OGG_READ_RESERVE);
        let n = read_cancellable(&mut self.stream, self.ring.writable(), cancel).await?;
        if n == 0 {
            self.demux.mark_exhausted(&mut self.ring);
            return Ok(false);
        }
        self.ring.commit(n);
        Ok(true)
    }

    /// Next packet of the stream, with no lookahead.
    async fn next_packet(&mut self, cancel: &CancellationToken) -> Result<Option<Bytes>> {
        loop {
            if let Some(packet) = self.demux.pop() {
                return Ok(Some(packet));
            }
            if self.demux.ended() {
                return Ok(None);
            }
            if self.demux.feed(&mut self.ring)? {
                continue;
            }
            if !self.fill_ring(cancel).await? {
                return Ok(None);
            }
        }
    }
}

/// Output window bookkeeping over decoded packets.
struct Playback {
    decoder: Box<dyn OpusPacketDecoder>,
    format: AudioSampleFormat,
    decoded: PooledBuffer<f32>,
    decoded_frames: usize,
    decoded_pos: usize,
    /// Output frames decoded so far, pre-skip included.
    position: u64,
    pre_skip: u64,
    gain: f32,
    packets: u64,
    ended: bool,
}

impl Playback {
    /// Granule positions are in 48 kHz samples.
    fn to_output_frames(&self, granule: u64) -> u64 {
        granule * self.format.sample_rate_hz as u64 / OPUS_GRANULE_RATE as u64
    }

    fn decode(&mut self, packet: &[u8], end_granule: Option<u64>) -> Result<()> {
        let channels = self.format.num_channels;
        let frames = self.decoder.decode(packet, &mut self.decoded)?;
        let frames = frames.min(self.decoded.len() / channels);
        self.packets += 1;

        let start = self.position;
        let end = start + frames as u64;
        self.position = end;

        let keep_from = self.pre_skip.clamp(start, end);
        let keep_to = end_granule
            .map(|granule| self.to_output_frames(granule))
            .map_or(end, |limit| limit.clamp(keep_from, end));
        self.decoded_pos = (keep_from - start) as usize;
        self.decoded_frames = (keep_to - start) as usize;
        trace!(
            len = packet.len(),
            frames,
            kept = self.decoded_frames - self.decoded_pos,
            "Ogg Opus packet decoded"
        );

        if self.gain != 1.0 {
            let gain = self.gain;
            self.decoded[self.decoded_pos * channels..self.decoded_frames * channels]
                .iter_mut()
                .for_each(|s| *s *= gain);
        }
        Ok(())
    }

    /// Every await point leaves `input` and `self` consistent, so dropping
    /// this future loses no buffered bytes.
    async fn fill(
        &mut self,
        input: &mut Input,
        buffer: &mut [f32],
        samples_per_channel: usize,
        budget: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>> {
        if self.ended {
            return Ok(None);
        }
        let channels = self.format.num_channels;
        check_buffer(buffer.len(), samples_per_channel, channels)?;

        let deadline = ReadDeadline::start(budget);
        let mut produced = 0;
        while produced < samples_per_channel {
            if self.decoded_pos < self.decoded_frames {
                let frames = (self.decoded_frames - self.decoded_pos).min(samples_per_channel - produced);
                let src = &self.decoded[self.decoded_pos * channels..(self.decoded_pos + frames) * channels];
                buffer[produced * channels..(produced + frames) * channels].copy_from_slice(src);
                self.decoded_pos += frames;
                produced += frames;
                continue;
            }
            if deadline.expired(produced) {
                break;
            }
            if let Some(packet) = input.demux.pop_with_lookahead() {
                self.decode(&packet, input.demux.end_granule())?;
                continue;
            }
            if input.demux.ended() {
                self.ended = true;
                break;
            }
            if input.demux.feed(&mut input.ring)? {
                continue;
            }
            match input.fill_ring(cancel).await {
                Ok(_) => {}
                Err(CodecError::Cancelled) if produced > 0 => break,
                Err(e) => return Err(e),
            }
        }

        if produced == 0 && self.ended {
            debug!(
                packets = self.packets,
                pages = input.demux.pages(),
                "end of Ogg Opus stream"
            );
            return Ok(None);
        }
        Ok(Some(produced))
    }
}

/// Decodes Ogg Opus streams through an [`OpusProvider`]. Output is capped
/// at the configured rate and channel count.
pub struct OpusOggDecoder {
    provider: Arc<dyn OpusProvider>,
    config: OpusConfig,
    context: CodecContext,
    input: Option<Input>,
    playback: Option<Playback>,
    head: Option<OpusHead>,
    tags: Option<OpusTags>,
}

impl OpusOggDecoder {
    pub fn new(provider: Arc<dyn OpusProvider>, config: OpusConfig, context: CodecContext) -> Self {
        Self {
            provider,
            config,
            context,
            input: None,
            playback: None,
            head: None,
            tags: None,
        }
    }

    pub fn head(&self) -> Option<&OpusHead> {
        self.head.as_ref()
    }

    pub fn tags(&self) -> Option<&OpusTags> {
        self.tags.as_ref()
    }

    /// Output for a stream: the header rate capped by the configured
    /// maximum and snapped to an Opus rate, channels capped.
    pub fn output_format_for(head: &OpusHead, config: &OpusConfig) -> Result<AudioSampleFormat> {
        if !matches!(head.mapping_family, 0 | 1) || head.streams != 1 {
            return Err(CodecError::unsupported(format!(
                "Ogg Opus mapping family {} with {} streams",
                head.mapping_family, head.streams
            )));
        }
        let requested = match head.input_sample_rate {
            0 => config.max_sample_rate,
            rate => rate.min(config.max_sample_rate),
        };
        let rate = snap_sample_rate(requested);
        let channels = (head.channels as usize).min(config.max_channels.max(1));
        Ok(if channels == 1 {
            AudioSampleFormat::mono(rate)
        } else {
            AudioSampleFormat::stereo(rate)
        })
    }

    fn open(&self, head: &OpusHead) -> Result<Playback> {
        let format = Self::output_format_for(head, &self.config)?;
        let decoder = self
            .provider
            .create_decoder(format.sample_rate_hz, format.num_channels)?;
        let mut decoded = self
            .context
            .pools
            .samples
            .rent(MAX_OPUS_FRAME_SIZE * format.num_channels);
        let capacity = decoded.capacity();
        decoded.set_len(capacity);

        let mut playback = Playback {
            decoder,
            format,
            decoded,
            decoded_frames: 0,
            decoded_pos: 0,
            position: 0,
            pre_skip: 0,
            gain: head.gain_factor(),
            packets: 0,
            ended: false,
        };
        playback.pre_skip = playback.to_output_frames(head.pre_skip as u64);
        Ok(playback)
    }
}

#[async_trait]
impl AudioDecoder for OpusOggDecoder {
    fn codec_name(&self) -> String {
        OGG_OPUS.to_string()
    }

    fn codec_params(&self) -> Option<String> {
        self.playback.as_ref().map(|p| create_codec_params(&p.format))
    }

    fn output_format(&self) -> Option<AudioSampleFormat> {
        self.playback.as_ref().map(|p| p.format)
    }

    fn is_initialized(&self) -> bool {
        self.playback.is_some()
    }

    fn playback_end_of_stream(&self) -> bool {
        self.playback.as_ref().is_some_and(|p| p.ended)
    }

    async fn initialize(
        &mut self,
        input: InputStream,
        owns_stream: bool,
        cancel: &CancellationToken,
    ) -> Result<InitializationResult> {
        if self.playback.is_some() {
            return Ok(InitializationResult::AlreadyInitialized);
        }

        // Held from here on so a failed open still hands a borrowed stream back.
        let input = self.input.insert(Input {
            stream: input,
            owns_stream,
            ring: ByteRing::new(&self.context.pools.bytes, OGG_INPUT_RING_SIZE),
            demux: OggDemuxer::new(),
        });

        let Some(packet) = input.next_packet(cancel).await? else {
            warn!("Ogg stream ended before OpusHead");
            return Ok(InitializationResult::FailedInvalidData);
        };
        let head = match OpusHead::parse(&packet) {
            Ok(head) => head,
            Err(CodecError::UnsupportedFormat(reason)) => {
                warn!(%reason, "unsupported OpusHead");
                return Ok(InitializationResult::FailedUnsupportedFormat);
            }
            Err(e) => {
                warn!(error = %e, "malformed OpusHead");
                return Ok(InitializationResult::FailedInvalidData);
            }
        };

        let tags = match input.next_packet(cancel).await? {
            Some(packet) => OpusTags::parse(&packet),
            None => Err(CodecError::format("Ogg stream ended before OpusTags")),
        };
        let tags = match tags {
            Ok(tags) => tags,
            Err(e) => {
                warn!(error = %e, "malformed OpusTags");
                return Ok(InitializationResult::FailedInvalidData);
            }
        };

        let playback = match self.open(&head) {
            Ok(playback) => playback,
            Err(e) => {
                warn!(
                    channels = head.channels,
                    family = head.mapping_family,
                    error = %e,
                    "cannot decode Ogg Opus stream"
                );
                return Ok(InitializationResult::FailedUnsupportedFormat);
            }
        };

        info!(
            format = %playback.format,
            input_rate = head.input_sample_rate,
            pre_skip = head.pre_skip,
            gain_db = head.output_gain as f32 / 256.0,
            vendor = %tags.vendor,
            "Ogg Opus stream opened"
        );
        self.playback = Some(playback);
        self.head = Some(head);
        self.tags = Some(tags);
        Ok(InitializationResult::Success)
    }

    async fn read(
        &mut self,
        buffer: &mut [f32],
        samples_per_channel: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>> {
        let Self {
            context,
            input,
            playback,
            ..
        } = self;
        let (Some(input), Some(playback)) = (input.as_mut(), playback.as_mut()) else {
            return Err(CodecError::invalid_usage("decoder is not initialized"));
        };
        playback
            .fill(input, buffer, samples_per_channel, context.realtime_budget, cancel)
            .await
    }

    async fn dispose(self: Box<Self>) -> Result<Option<InputStream>> {
        debug!(
            packets = self.playback.as_ref().map_or(0, |p| p.packets),
            "Ogg Opus decoder disposed"
        );
        Ok(self
            .input
            .and_then(|input| (!input.owns_stream).then_some(input.stream)))
    }
}
