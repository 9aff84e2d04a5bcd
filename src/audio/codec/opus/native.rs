//! libopus through `audiopus`. Single-stream (mono and stereo) only.

use audiopus::{
    Application, Bitrate, Channels, MutSignals, SampleRate,
    coder::{Decoder as OpusDecoder, Encoder as OpusEncoder},
    packet::Packet,
};
use tracing::debug;

use crate::audio::codec::opus::{
    OpusChannelLayout, OpusEncoderSettings, OpusPacketDecoder, OpusPacketEncoder, OpusProvider,
};
use crate::audio::constants::{INT16_SCALE, MAX_OPUS_FRAME_SIZE};
use crate::common::{CodecError, Result};

fn opus_error(e: audiopus::Error) -> CodecError {
    CodecError::Opus(e.to_string())
}

fn opus_rate(sample_rate_hz: u32) -> Result<SampleRate> {
    Ok(match sample_rate_hz {
        8000 => SampleRate::Hz8000,
        12000 => SampleRate::Hz12000,
        16000 => SampleRate::Hz16000,
        24000 => SampleRate::Hz24000,
        48000 => SampleRate::Hz48000,
        other => return Err(CodecError::unsupported(format!("Opus rate {} Hz", other))),
    })
}

fn opus_channels(channels: usize) -> Result<Channels> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        n => Err(CodecError::unsupported(format!(
            "{} channels without multistream support",
            n
        ))),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AudiopusProvider;

impl OpusProvider for AudiopusProvider {
    fn name(&self) -> &str {
        "audiopus"
    }

    fn create_decoder(&self, sample_rate_hz: u32, channels: usize) -> Result<Box<dyn OpusPacketDecoder>> {
        let decoder = OpusDecoder::new(opus_rate(sample_rate_hz)?, opus_channels(channels)?).map_err(opus_error)?;
        Ok(Box::new(NativeDecoder {
            decoder,
            channels,
            pcm: vec![0i16; MAX_OPUS_FRAME_SIZE * channels],
        }))
    }

    fn create_encoder(
        &self,
        sample_rate_hz: u32,
        layout: &OpusChannelLayout,
        settings: OpusEncoderSettings,
    ) -> Result<Box<dyn OpusPacketEncoder>> {
        if !layout.is_single_stream() {
            return Err(CodecError::unsupported(format!(
                "Opus multistream ({} streams)",
                layout.streams
            )));
        }
        let mut encoder = OpusEncoder::new(
            opus_rate(sample_rate_hz)?,
            opus_channels(layout.channels)?,
            Application::Audio,
        )
        .map_err(opus_error)?;
        let bitrate = match settings.bitrate_kbps {
            Some(kbps) => Bitrate::BitsPerSecond(kbps.saturating_mul(1000).min(i32::MAX as u32) as i32),
            None => Bitrate::Auto,
        };
        encoder.set_bitrate(bitrate).map_err(opus_error)?;
        debug!(bitrate_kbps = ?settings.bitrate_kbps, "libopus encoder ready");

        Ok(Box::new(NativeEncoder {
            encoder,
            pcm: Vec::new(),
        }))
    }
}

struct NativeDecoder {
    decoder: OpusDecoder,
    channels: usize,
    /// Interleaved scratch for one packet.
    pcm: Vec<i16>,
}

impl OpusPacketDecoder for NativeDecoder {
    fn decode(&mut self, packet: &[u8], output: &mut [f32]) -> Result<usize> {
        let packet = Packet::try_from(packet).map_err(opus_error)?;
        let signals = MutSignals::try_from(self.pcm.as_mut_slice()).map_err(opus_error)?;
        let frames = self.decoder.decode(Some(packet), signals, false).map_err(opus_error)?;

        let samples = (frames * self.channels).min(output.len());
        for (out, &s) in output[..samples].iter_mut().zip(&self.pcm[..samples]) {
            *out = s as f32 / INT16_SCALE;
        }
        Ok(samples / self.channels)
    }
}

struct NativeEncoder {
    encoder: OpusEncoder,
    pcm: Vec<i16>,
}

impl OpusPacketEncoder for NativeEncoder {
    fn encode(&mut self, input: &[f32], _frame_size: usize, output: &mut [u8]) -> Result<usize> {
        self.pcm.clear();
        self.pcm
            .extend(input.iter().map(|&s| (s * INT16_SCALE).round().clamp(-32768.0, 32767.0) as i16));
        self.encoder.encode(&self.pcm, output).map_err(opus_error)
    }
}
