//! Raw little-endian PCM in 16, 24 and 32-bit integer or 32-bit float form.

use byteorder::{ByteOrder, LittleEndian};

use crate::audio::codec::payload::{PayloadDecoder, PayloadEncoder, SamplePacker, SampleUnpacker};
use crate::audio::codec::{AudioDecoder, AudioEncoder, CodecContext, CodecFactory};
use crate::audio::constants::{INT16_SCALE, INT24_SCALE, INT32_SCALE};
use crate::audio::format::{AudioSampleFormat, WaveFormat};
use crate::audio::params::try_parse_codec_params;
use crate::common::{CodecError, Result};

pub const PCM_S16: &str = "pcm";
pub const PCM_S24: &str = "pcm_s24le";
pub const PCM_S32: &str = "pcm_s32le";
pub const PCM_F32: &str = "pcm_f32le";

const CODEC_NAMES: [&str; 4] = [PCM_S16, PCM_S24, PCM_S32, PCM_F32];

/// Sample conversion for one of the raw PCM encodings.
#[derive(Debug, Clone, Copy)]
pub struct PcmSamples {
    encoding: WaveFormat,
}

impl PcmSamples {
    pub fn new(encoding: WaveFormat) -> Result<Self> {
        match encoding {
            WaveFormat::Int16LE | WaveFormat::Int24LE | WaveFormat::Int32LE | WaveFormat::Float32LE => {
                Ok(Self { encoding })
            }
            other => Err(CodecError::unsupported(format!("{} is not raw PCM", other))),
        }
    }

    pub fn for_codec(codec: &str) -> Option<Self> {
        let encoding = match codec {
            PCM_S16 => WaveFormat::Int16LE,
            PCM_S24 => WaveFormat::Int24LE,
            PCM_S32 => WaveFormat::Int32LE,
            PCM_F32 => WaveFormat::Float32LE,
            _ => return None,
        };
        Some(Self { encoding })
    }

    pub fn codec_name(&self) -> &'static str {
        self.encoding.codec_name().unwrap_or(PCM_S16)
    }
}

impl SampleUnpacker for PcmSamples {
    fn bytes_per_sample(&self) -> usize {
        self.encoding.bits_per_sample() as usize / 8
    }

    fn unpack(&mut self, input: &[u8], output: &mut [f32], _channels: usize) {
        let width = SampleUnpacker::bytes_per_sample(self);
        for (bytes, sample) in input.chunks_exact(width).zip(output.iter_mut()) {
            *sample = match self.encoding {
                WaveFormat::Int16LE => LittleEndian::read_i16(bytes) as f32 / INT16_SCALE,
                WaveFormat::Int24LE => LittleEndian::read_i24(bytes) as f32 / INT24_SCALE,
                WaveFormat::Int32LE => (LittleEndian::read_i32(bytes) as f64 / INT32_SCALE) as f32,
                _ => LittleEndian::read_f32(bytes),
            };
        }
    }
}

impl SamplePacker for PcmSamples {
    fn bytes_per_sample(&self) -> usize {
        SampleUnpacker::bytes_per_sample(self)
    }

    fn pack(&mut self, input: &[f32], output: &mut [u8], _channels: usize) {
        let width = SampleUnpacker::bytes_per_sample(self);
        for (sample, bytes) in input.iter().zip(output.chunks_exact_mut(width)) {
            let clamped = sample.clamp(-1.0, 1.0);
            match self.encoding {
                WaveFormat::Int16LE => {
                    LittleEndian::write_i16(bytes, (clamped * INT16_SCALE).round() as i16)
                }
                WaveFormat::Int24LE => {
                    LittleEndian::write_i24(bytes, (clamped * INT24_SCALE).round() as i32)
                }
                WaveFormat::Int32LE => {
                    LittleEndian::write_i32(bytes, (clamped as f64 * INT32_SCALE).round() as i32)
                }
                _ => LittleEndian::write_f32(bytes, *sample),
            }
        }
    }
}

pub type RawPcmDecoder = PayloadDecoder<PcmSamples>;
pub type RawPcmEncoder = PayloadEncoder<PcmSamples>;

pub fn raw_pcm_decoder(encoding: WaveFormat, format: AudioSampleFormat, context: CodecContext) -> Result<RawPcmDecoder> {
    let samples = PcmSamples::new(encoding)?;
    Ok(PayloadDecoder::new(samples.codec_name(), format, samples, context))
}

pub fn raw_pcm_encoder(encoding: WaveFormat, format: AudioSampleFormat, context: CodecContext) -> Result<RawPcmEncoder> {
    let samples = PcmSamples::new(encoding)?;
    Ok(PayloadEncoder::new(samples.codec_name(), format, samples, context))
}

/// Serves `pcm`, `pcm_s24le`, `pcm_s32le` and `pcm_f32le`.
pub struct RawPcmCodecFactory {
    context: CodecContext,
}

impl RawPcmCodecFactory {
    pub fn new(context: CodecContext) -> Self {
        Self { context }
    }
}

impl CodecFactory for RawPcmCodecFactory {
    fn supported_decode_formats(&self) -> Vec<String> {
        CODEC_NAMES.iter().map(|s| s.to_string()).collect()
    }

    fn supported_encode_formats(&self) -> Vec<String> {
        self.supported_decode_formats()
    }

    fn create_decoder(&self, codec: &str, codec_params: Option<&str>) -> Result<Box<dyn AudioDecoder>> {
        let samples = PcmSamples::for_codec(codec)
            .ok_or_else(|| CodecError::unsupported(format!("codec \"{}\"", codec)))?;
        let params = codec_params
            .ok_or_else(|| CodecError::param("", "raw PCM requires codec params"))?;
        let format = try_parse_codec_params(params)?;
        Ok(Box::new(PayloadDecoder::new(codec, format, samples, self.context.clone())))
    }

    fn create_encoder(&self, codec: &str, input_format: AudioSampleFormat) -> Result<Box<dyn AudioEncoder>> {
        let samples = PcmSamples::for_codec(codec)
            .ok_or_else(|| CodecError::unsupported(format!("codec \"{}\"", codec)))?;
        Ok(Box::new(PayloadEncoder::new(codec, input_format, samples, self.context.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::test_util::{decode_all, random_samples};
    use crate::audio::codec::{InitializationResult, MemoryStream, OutputStream};
    use crate::audio::codec::io::TrickleReader;
    use tokio_util::sync::CancellationToken;

    async fn encode(codec: &str, format: AudioSampleFormat, samples: &[f32]) -> Vec<u8> {
        let factory = RawPcmCodecFactory::new(CodecContext::default());
        let cancel = CancellationToken::new();
        let sink = MemoryStream::new();
        let mut encoder = factory.create_encoder(codec, format).unwrap();
        encoder
            .initialize(OutputStream::plain(sink.clone()), true, &cancel)
            .await
            .unwrap();
        encoder
            .write(samples, samples.len() / format.num_channels, &cancel)
            .await
            .unwrap();
        encoder.finish(&cancel).await.unwrap();
        assert!(encoder.dispose().await.unwrap().is_none());
        sink.contents().to_vec()
    }

    async fn round_trip(codec: &str, tolerance: f32) {
        let format = AudioSampleFormat::stereo(48000);
        let input = random_samples(4_002, 1.0, 7);
        let bytes = encode(codec, format, &input).await;

        let factory = RawPcmCodecFactory::new(CodecContext::default());
        let params = crate::audio::params::create_codec_params(&format);
        let mut decoder = factory.create_decoder(codec, Some(&params)).unwrap();
        decoder
            .initialize(Box::new(MemoryStream::from_bytes(bytes)), true, &CancellationToken::new())
            .await
            .unwrap();
        let output = decode_all(decoder.as_mut(), 2, 333).await;

        assert_eq!(output.len(), input.len());
        for (a, b) in input.iter().zip(&output) {
            assert!((a - b).abs() <= tolerance, "{} vs {}", a, b);
        }
        assert!(decoder.playback_end_of_stream());
    }

    #[tokio::test]
    async fn int16_round_trip() {
        round_trip(PCM_S16, 1.0 / INT16_SCALE).await;
    }

    #[tokio::test]
    async fn int24_round_trip() {
        round_trip(PCM_S24, 1.0 / INT24_SCALE).await;
    }

    #[tokio::test]
    async fn int32_round_trip() {
        round_trip(PCM_S32, 1e-6).await;
    }

    #[tokio::test]
    async fn float_round_trip_is_exact() {
        round_trip(PCM_F32, 0.0).await;
    }

    #[test]
    fn int16_encoding_clamps_and_rounds() {
        let mut samples = PcmSamples::new(WaveFormat::Int16LE).unwrap();
        let mut out = [0u8; 6];
        samples.pack(&[1.5, -2.0, 0.5], &mut out, 1);
        assert_eq!(LittleEndian::read_i16(&out[0..2]), 32767);
        assert_eq!(LittleEndian::read_i16(&out[2..4]), -32767);
        assert_eq!(LittleEndian::read_i16(&out[4..6]), 16384);
    }

    #[tokio::test]
    async fn misaligned_transport_reads_are_stitched() {
        let format = AudioSampleFormat::stereo(16000);
        let input = random_samples(200, 0.9, 3);
        let mut bytes = encode(PCM_S16, format, &input).await;
        // Dangling half sample at the end of the stream.
        bytes.push(0x7F);

        let mut decoder = raw_pcm_decoder(WaveFormat::Int16LE, format, CodecContext::default()).unwrap();
        decoder
            .initialize(Box::new(TrickleReader::new(bytes, 3)), true, &CancellationToken::new())
            .await
            .unwrap();

        let output = decode_all(&mut decoder, 2, 64).await;
        assert_eq!(output.len(), input.len());

        let cancel = CancellationToken::new();
        let mut buffer = [0f32; 8];
        assert_eq!(decoder.read(&mut buffer, 4, &cancel).await.unwrap(), None);
        assert_eq!(decoder.read(&mut buffer, 4, &cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn second_initialize_reports_already_initialized() {
        let cancel = CancellationToken::new();
        let mut decoder =
            raw_pcm_decoder(WaveFormat::Int16LE, AudioSampleFormat::mono(8000), CodecContext::default())
                .unwrap();
        assert_eq!(
            decoder
                .initialize(Box::new(MemoryStream::new()), true, &cancel)
                .await
                .unwrap(),
            InitializationResult::Success
        );
        assert_eq!(
            decoder
                .initialize(Box::new(MemoryStream::new()), true, &cancel)
                .await
                .unwrap(),
            InitializationResult::AlreadyInitialized
        );
    }

    #[tokio::test]
    async fn write_after_finish_fails() {
        let cancel = CancellationToken::new();
        let mut encoder =
            raw_pcm_encoder(WaveFormat::Int16LE, AudioSampleFormat::mono(8000), CodecContext::default())
                .unwrap();
        assert!(matches!(
            encoder.write(&[0.0], 1, &cancel).await,
            Err(CodecError::InvalidUsage(_))
        ));
        encoder
            .initialize(OutputStream::plain(MemoryStream::new()), true, &cancel)
            .await
            .unwrap();
        encoder.write(&[0.0], 1, &cancel).await.unwrap();
        encoder.finish(&cancel).await.unwrap();
        assert!(matches!(
            encoder.write(&[0.0], 1, &cancel).await,
            Err(CodecError::InvalidUsage(_))
        ));
    }

    #[tokio::test]
    async fn borrowed_stream_comes_back_on_dispose() {
        let cancel = CancellationToken::new();
        let mut encoder =
            raw_pcm_encoder(WaveFormat::Int16LE, AudioSampleFormat::mono(8000), CodecContext::default())
                .unwrap();
        encoder
            .initialize(OutputStream::plain(MemoryStream::new()), false, &cancel)
            .await
            .unwrap();
        encoder.finish(&cancel).await.unwrap();
        assert!(Box::new(encoder).dispose().await.unwrap().is_some());
    }

    #[test]
    fn missing_params_are_rejected() {
        let factory = RawPcmCodecFactory::new(CodecContext::default());
        assert!(factory.create_decoder(PCM_S16, None).is_err());
        assert!(factory.create_decoder("flac", Some("samplerate=8000")).is_err());
    }
}
