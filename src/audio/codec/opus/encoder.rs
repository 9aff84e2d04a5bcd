use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::buffer::PooledBuffer;
use crate::audio::codec::io::{OutputSlot, OutputStream, write_all_cancellable};
use crate::audio::codec::opus::{
    OPUS, OpusChannelLayout, OpusEncoderSettings, OpusPacketEncoder, OpusProvider, frame_size,
    is_opus_sample_rate,
};
use crate::audio::codec::{AudioEncoder, CodecContext, EncoderState, InitializationResult, check_buffer};
use crate::audio::constants::{OPUS_LENGTH_PREFIX_BYTES, OPUS_MAX_PACKET_SIZE};
use crate::audio::format::AudioSampleFormat;
use crate::audio::params::create_codec_params;
use crate::common::{CodecError, Result};
use crate::configs::OpusConfig;

/// Encodes fixed-duration frames into `[u16 LE length][packet]*`.
pub struct OpusRawEncoder {
    format: AudioSampleFormat,
    encoder: Box<dyn OpusPacketEncoder>,
    frame_size: usize,
    /// Interleaved samples of the frame being assembled.
    pending: PooledBuffer<f32>,
    pending_frames: usize,
    packet: PooledBuffer<u8>,
    output: OutputSlot,
    state: EncoderState,
    packets: u64,
}

impl OpusRawEncoder {
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
        let mut packet = context.pools.bytes.rent(OPUS_LENGTH_PREFIX_BYTES + OPUS_MAX_PACKET_SIZE);
        packet.set_len(OPUS_LENGTH_PREFIX_BYTES + OPUS_MAX_PACKET_SIZE);

        debug!(
            provider = provider.name(),
            format = %format,
            frame_size,
            streams = layout.streams,
            coupled = layout.coupled_streams,
            "Opus encoder created"
        );
        Ok(Self {
            format,
            encoder,
            frame_size,
            pending,
            pending_frames: 0,
            packet,
            output: OutputSlot::default(),
            state: EncoderState::Uninitialized,
            packets: 0,
        })
    }

    /// Samples per channel in each packet.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    async fn emit_frame(&mut self, cancel: &CancellationToken) -> Result<()> {
        let len = self.encoder.encode(
            &self.pending,
            self.frame_size,
            &mut self.packet[OPUS_LENGTH_PREFIX_BYTES..],
        )?;
        if len == 0 || len > OPUS_MAX_PACKET_SIZE {
            return Err(CodecError::Opus(format!("encoder produced a {} byte packet", len)));
        }
        self.packet[..OPUS_LENGTH_PREFIX_BYTES].copy_from_slice(&(len as u16).to_le_bytes());
        let stream = self.output.get()?;
        write_all_cancellable(stream, &self.packet[..OPUS_LENGTH_PREFIX_BYTES + len], cancel).await?;
        self.pending_frames = 0;
        self.packets += 1;
        Ok(())
    }
}

#[async_trait]
impl AudioEncoder for OpusRawEncoder {
    fn codec_name(&self) -> String {
        OPUS.to_string()
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
        info!(format = %self.format, frame_size = self.frame_size, "Opus encoder initialized");
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

        let mut consumed = 0;
        while consumed < samples_per_channel {
            let frames = (self.frame_size - self.pending_frames).min(samples_per_channel - consumed);
            let start = self.pending_frames * channels;
            self.pending[start..start + frames * channels]
                .copy_from_slice(&buffer[consumed * channels..(consumed + frames) * channels]);
            self.pending_frames += frames;
            consumed += frames;

            if self.pending_frames == self.frame_size {
                self.emit_frame(cancel).await?;
            }
        }
        Ok(())
    }

    async fn finish(&mut self, cancel: &CancellationToken) -> Result<()> {
        match self.state {
            EncoderState::Uninitialized => Err(CodecError::invalid_usage("encoder is not initialized")),
            EncoderState::Finished => Ok(()),
            EncoderState::Streaming => {
                if self.pending_frames > 0 {
                    let start = self.pending_frames * self.format.num_channels;
                    self.pending[start..].fill(0.0);
                    self.emit_frame(cancel).await?;
                }
                self.output.get()?.flush().await?;
                self.state = EncoderState::Finished;
                debug!(packets = self.packets, "Opus encoder finished");
                Ok(())
            }
        }
    }

    async fn dispose(self: Box<Self>) -> Result<Option<OutputStream>> {
        if self.state == EncoderState::Streaming {
            warn!(codec = OPUS, "encoder disposed without finish");
        }
        self.output.release().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::opus::fake::FakeOpus;
    use crate::audio::codec::opus::OpusRawCodecFactory;
    use crate::audio::codec::test_util::decode_all;
    use crate::audio::codec::{AudioDecoder, CodecFactory, MemoryStream};
    use crate::audio::format::ChannelMapping;
    use std::sync::Arc;

    fn packet_lengths(bytes: &[u8]) -> Vec<usize> {
        let mut lengths = Vec::new();
        let mut pos = 0;
        while pos + 2 <= bytes.len() {
            let len = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]) as usize;
            lengths.push(len);
            pos += 2 + len;
        }
        assert_eq!(pos, bytes.len());
        lengths
    }

    #[tokio::test]
    async fn frames_are_prefixed_and_tail_is_padded() {
        let provider = FakeOpus::default();
        let format = AudioSampleFormat::mono(16_000);
        let mut encoder =
            OpusRawEncoder::new(format, &provider, &OpusConfig::default(), CodecContext::default()).unwrap();
        assert_eq!(encoder.frame_size(), 320);

        let sink = MemoryStream::new();
        let cancel = CancellationToken::new();
        encoder
            .initialize(OutputStream::seekable(sink.clone()), true, &cancel)
            .await
            .unwrap();

        let samples = vec![0.5f32; 700];
        encoder.write(&samples[..300], 300, &cancel).await.unwrap();
        assert_eq!(sink.len(), 0);
        encoder.write(&samples[300..], 400, &cancel).await.unwrap();
        assert_eq!(packet_lengths(&sink.contents()), vec![4, 4]);

        encoder.finish(&cancel).await.unwrap();
        encoder.finish(&cancel).await.unwrap();
        assert_eq!(packet_lengths(&sink.contents()), vec![4, 4, 4]);
        assert!(encoder.write(&samples, 1, &cancel).await.is_err());
    }

    #[tokio::test]
    async fn round_trip_through_factory() {
        let factory = OpusRawCodecFactory::new(
            CodecContext::default(),
            Arc::new(FakeOpus::default()),
            OpusConfig {
                frame_ms: 10.0,
                ..OpusConfig::default()
            },
        );
        let format = AudioSampleFormat::stereo(48_000);
        let mut encoder = factory.create_encoder("opus", format).unwrap();
        let sink = MemoryStream::new();
        let cancel = CancellationToken::new();
        encoder
            .initialize(OutputStream::seekable(sink.clone()), true, &cancel)
            .await
            .unwrap();
        let samples: Vec<f32> = (0..1000).flat_map(|_| [0.25f32, -0.5]).collect();
        encoder.write(&samples, 1000, &cancel).await.unwrap();
        encoder.finish(&cancel).await.unwrap();
        let params = encoder.codec_params();
        assert!(encoder.dispose().await.unwrap().is_none());

        let mut decoder = factory.create_decoder("opus", params.as_deref()).unwrap();
        sink.rewind();
        decoder.initialize(Box::new(sink), true, &cancel).await.unwrap();
        let decoded = decode_all(decoder.as_mut(), 2, 333).await;
        // Three 480-frame packets, the last one padded.
        assert_eq!(decoded.len(), 2 * 1440);
        assert!((decoded[0] - 32.0 / 127.0).abs() < 1e-6);
        assert!((decoded[1] + 64.0 / 127.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_unencodable_formats() {
        let provider = FakeOpus::default();
        let config = OpusConfig::default();
        let context = CodecContext::default();

        let cd_rate = AudioSampleFormat::stereo(44_100);
        assert!(matches!(
            OpusRawEncoder::new(cd_rate, &provider, &config, context.clone()),
            Err(CodecError::UnsupportedFormat(_))
        ));

        let packed = AudioSampleFormat::new(48_000, 3, ChannelMapping::Packed(3)).unwrap();
        assert!(OpusRawEncoder::new(packed, &provider, &config, context.clone()).is_err());

        let odd_frame = OpusConfig {
            frame_ms: 30.0,
            ..OpusConfig::default()
        };
        let mono = AudioSampleFormat::mono(48_000);
        assert!(OpusRawEncoder::new(mono, &provider, &odd_frame, context.clone()).is_err());

        let surround = AudioSampleFormat::with_layout(48_000, ChannelMapping::Surround5_1).unwrap();
        assert!(OpusRawEncoder::new(surround, &provider, &config, context).is_ok());
    }
}
