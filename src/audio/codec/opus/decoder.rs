use std::time::Duration;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::audio::buffer::{ByteRing, PooledBuffer};
use crate::audio::codec::io::{InputStream, read_cancellable};
use crate::audio::codec::opus::{OPUS, OpusPacketDecoder};
use crate::audio::codec::{
    AudioDecoder, CodecContext, InitializationResult, ReadDeadline, check_buffer,
};
use crate::audio::constants::{
    MAX_OPUS_FRAME_SIZE, OPUS_INPUT_RING_SIZE, OPUS_LENGTH_PREFIX_BYTES, OPUS_MAX_PACKET_SIZE,
};
use crate::audio::format::AudioSampleFormat;
use crate::audio::params::create_codec_params;
use crate::common::{CodecError, Result};

/// Bytes that must fit after the write cursor before reading more input.
const PACKET_RESERVE: usize = OPUS_LENGTH_PREFIX_BYTES + OPUS_MAX_PACKET_SIZE;

struct Input {
    stream: InputStream,
    owns_stream: bool,
    ring: ByteRing,
    exhausted: bool,
}

/// Packet decoder together with the samples of the last decoded packet.
struct Frames {
    decoder: Box<dyn OpusPacketDecoder>,
    channels: usize,
    /// One decoded packet, interleaved.
    decoded: PooledBuffer<f32>,
    decoded_frames: usize,
    decoded_pos: usize,
    packets: u64,
    ended: bool,
}

/// Decodes `[u16 LE length][packet]*` streams.
pub struct OpusRawDecoder {
    format: AudioSampleFormat,
    context: CodecContext,
    input: Option<Input>,
    frames: Frames,
}

impl OpusRawDecoder {
    pub fn new(format: AudioSampleFormat, decoder: Box<dyn OpusPacketDecoder>, context: CodecContext) -> Self {
        let mut decoded = context.pools.samples.rent(MAX_OPUS_FRAME_SIZE * format.num_channels);
        let capacity = decoded.capacity();
        decoded.set_len(capacity);
        Self {
            format,
            context,
            input: None,
            frames: Frames {
                decoder,
                channels: format.num_channels,
                decoded,
                decoded_frames: 0,
                decoded_pos: 0,
                packets: 0,
                ended: false,
            },
        }
    }

    /// Packets decoded so far.
    pub fn packets(&self) -> u64 {
        self.frames.packets
    }
}

impl Frames {
    /// Decodes the next complete packet in the ring. Returns `false` when
    /// more input is needed first.
    fn decode_buffered(&mut self, ring: &mut ByteRing) -> Result<bool> {
        let readable = ring.readable();
        if readable.len() < OPUS_LENGTH_PREFIX_BYTES {
            return Ok(false);
        }
        let len = LittleEndian::read_u16(readable) as usize;
        if len == 0 || len > OPUS_MAX_PACKET_SIZE {
            warn!(len, "Opus packet length out of range");
            return Err(CodecError::format(format!(
                "Opus packet length {} outside 1..={}",
                len, OPUS_MAX_PACKET_SIZE
            )));
        }
        let total = OPUS_LENGTH_PREFIX_BYTES + len;
        if readable.len() < total {
            return Ok(false);
        }

        let frames = self
            .decoder
            .decode(&readable[OPUS_LENGTH_PREFIX_BYTES..total], &mut self.decoded)?;
        ring.consume(total);
        self.packets += 1;
        trace!(len, frames, "Opus packet decoded");

        self.decoded_frames = frames.min(self.decoded.len() / self.channels);
        self.decoded_pos = 0;
        Ok(true)
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
        let channels = self.channels;
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
            if self.decode_buffered(&mut input.ring)? {
                continue;
            }

            if input.exhausted {
                if !input.ring.is_empty() {
                    debug!(bytes = input.ring.len(), "discarding truncated Opus packet");
                    input.ring.clear();
                }
                self.ended = true;
                break;
            }
            input.ring.compact_if_needed(PACKET_RESERVE);
            let n = match read_cancellable(&mut input.stream, input.ring.writable(), cancel).await {
                Ok(n) => n,
                Err(CodecError::Cancelled) if produced > 0 => break,
                Err(e) => return Err(e),
            };
            if n == 0 {
                input.exhausted = true;
            } else {
                input.ring.commit(n);
            }
        }

        if produced == 0 && self.ended {
            debug!(packets = self.packets, "end of Opus stream");
            return Ok(None);
        }
        Ok(Some(produced))
    }
}

#[async_trait]
impl AudioDecoder for OpusRawDecoder {
    fn codec_name(&self) -> String {
        OPUS.to_string()
    }

    fn codec_params(&self) -> Option<String> {
        Some(create_codec_params(&self.format))
    }

    fn output_format(&self) -> Option<AudioSampleFormat> {
        Some(self.format)
    }

    fn is_initialized(&self) -> bool {
        self.input.is_some()
    }

    fn playback_end_of_stream(&self) -> bool {
        self.frames.ended
    }

    async fn initialize(
        &mut self,
        input: InputStream,
        owns_stream: bool,
        _cancel: &CancellationToken,
    ) -> Result<InitializationResult> {
        if self.input.is_some() {
            return Ok(InitializationResult::AlreadyInitialized);
        }
        self.input = Some(Input {
            stream: input,
            owns_stream,
            ring: ByteRing::new(&self.context.pools.bytes, OPUS_INPUT_RING_SIZE),
            exhausted: false,
        });
        debug!(format = %self.format, "Opus decoder initialized");
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
            frames,
            ..
        } = self;
        let input = input
            .as_mut()
            .ok_or_else(|| CodecError::invalid_usage("decoder is not initialized"))?;
        frames
            .fill(input, buffer, samples_per_channel, context.realtime_budget, cancel)
            .await
    }

    async fn dispose(self: Box<Self>) -> Result<Option<InputStream>> {
        debug!(packets = self.frames.packets, "Opus decoder disposed");
        Ok(self
            .input
            .and_then(|input| (!input.owns_stream).then_some(input.stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::MemoryStream;
    use crate::audio::codec::io::TrickleReader;
    use crate::audio::codec::opus::fake::FakeOpus;
    use crate::audio::codec::opus::{OpusProvider, OpusRawCodecFactory};
    use crate::audio::codec::test_util::decode_all;
    use crate::audio::codec::CodecFactory;
    use crate::configs::OpusConfig;
    use futures::FutureExt;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    fn packet(frames: u16, samples: &[i8]) -> Vec<u8> {
        let mut body = frames.to_le_bytes().to_vec();
        body.push(samples.len() as u8);
        body.extend(samples.iter().map(|&s| s as u8));
        let mut out = (body.len() as u16).to_le_bytes().to_vec();
        out.extend(body);
        out
    }

    async fn open(provider: &FakeOpus, format: AudioSampleFormat, bytes: Vec<u8>, trickle: usize) -> OpusRawDecoder {
        let inner = provider.create_decoder(format.sample_rate_hz, format.num_channels).unwrap();
        let mut decoder = OpusRawDecoder::new(format, inner, CodecContext::default());
        let input: InputStream = Box::new(TrickleReader::new(bytes, trickle));
        let result = decoder.initialize(input, true, &CancellationToken::new()).await.unwrap();
        assert!(result.is_success());
        decoder
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_decoding() {
        let provider = FakeOpus::default();
        let mut bytes = 2000u16.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 16]);
        let mut decoder = open(&provider, AudioSampleFormat::mono(48_000), bytes, 64).await;

        let mut buffer = vec![0f32; 960];
        let result = decoder.read(&mut buffer, 960, &CancellationToken::new()).await;
        assert!(matches!(result, Err(CodecError::Format(_))));
        assert_eq!(provider.decoded(), 0);
    }

    #[tokio::test]
    async fn zero_length_is_rejected() {
        let provider = FakeOpus::default();
        let mut bytes = packet(10, &[20]);
        bytes.extend_from_slice(&[0, 0]);
        let mut decoder = open(&provider, AudioSampleFormat::mono(48_000), bytes, 64).await;

        let mut buffer = vec![0f32; 10];
        let cancel = CancellationToken::new();
        assert_eq!(decoder.read(&mut buffer, 10, &cancel).await.unwrap(), Some(10));
        assert!(matches!(
            decoder.read(&mut buffer, 10, &cancel).await,
            Err(CodecError::Format(_))
        ));
        assert_eq!(provider.decoded(), 1);
    }

    #[tokio::test]
    async fn leftover_frames_carry_across_reads() {
        let provider = FakeOpus::default();
        let mut bytes = packet(100, &[127, -127]);
        bytes.extend(packet(100, &[0, 64]));
        let mut decoder = open(&provider, AudioSampleFormat::stereo(48_000), bytes, 5).await;

        let cancel = CancellationToken::new();
        let mut buffer = vec![0f32; 2 * 70];
        assert_eq!(decoder.read(&mut buffer, 70, &cancel).await.unwrap(), Some(70));
        assert_eq!(&buffer[..2], &[1.0, -1.0]);
        assert_eq!(decoder.read(&mut buffer, 70, &cancel).await.unwrap(), Some(70));
        // 30 frames of the first packet, then the second one.
        assert_eq!(&buffer[58..62], &[1.0, -1.0, 0.0, 64.0 / 127.0]);
        assert_eq!(decoder.read(&mut buffer, 70, &cancel).await.unwrap(), Some(60));
        assert_eq!(decoder.read(&mut buffer, 70, &cancel).await.unwrap(), None);
        assert!(decoder.playback_end_of_stream());
        assert_eq!(decoder.packets(), 2);
    }

    #[tokio::test]
    async fn dropped_read_keeps_stream_and_buffered_bytes() {
        let provider = FakeOpus::default();
        let format = AudioSampleFormat::mono(48_000);
        let inner = provider.create_decoder(48_000, 1).unwrap();
        let mut decoder = OpusRawDecoder::new(format, inner, CodecContext::default());
        let (mut writer, reader) = tokio::io::duplex(256);
        let cancel = CancellationToken::new();
        decoder.initialize(Box::new(reader), true, &cancel).await.unwrap();

        let bytes = packet(10, &[20]);
        writer.write_all(&bytes[..3]).await.unwrap();
        let mut buffer = vec![0f32; 10];
        assert!(decoder.read(&mut buffer, 10, &cancel).now_or_never().is_none());
        assert!(decoder.is_initialized());

        writer.write_all(&bytes[3..]).await.unwrap();
        assert_eq!(decoder.read(&mut buffer, 10, &cancel).await.unwrap(), Some(10));
        assert_eq!(buffer[0], 20.0 / 127.0);
        assert_eq!(provider.decoded(), 1);
    }

    #[tokio::test]
    async fn truncated_trailing_packet_is_dropped() {
        let provider = FakeOpus::default();
        let mut bytes = packet(40, &[10]);
        let tail = packet(40, &[10]);
        bytes.extend_from_slice(&tail[..tail.len() - 1]);
        let mut decoder = open(&provider, AudioSampleFormat::mono(16_000), bytes, 3).await;

        let decoded = decode_all(&mut decoder, 1, 32).await;
        assert_eq!(decoded.len(), 40);
        assert_eq!(provider.decoded(), 1);
    }

    #[tokio::test]
    async fn factory_resolves_format_from_params() {
        let factory = OpusRawCodecFactory::new(
            CodecContext::default(),
            Arc::new(FakeOpus::default()),
            OpusConfig::default(),
        );
        let decoder = factory
            .create_decoder("opus", Some("samplerate=22050 channels=1"))
            .unwrap();
        assert_eq!(decoder.output_format(), Some(AudioSampleFormat::mono(24_000)));
        assert_eq!(decoder.codec_params().as_deref(), Some("samplerate=24000 channels=1 layout=1"));

        let default = factory.create_decoder("opus", None).unwrap();
        assert_eq!(default.output_format(), Some(AudioSampleFormat::stereo(48_000)));

        let mut decoder = default;
        let cancel = CancellationToken::new();
        decoder
            .initialize(Box::new(MemoryStream::new()), true, &cancel)
            .await
            .unwrap();
        let mut buffer = vec![0f32; 8];
        assert_eq!(decoder.read(&mut buffer, 4, &cancel).await.unwrap(), None);
    }
}
