//! RIFF/WAVE container codec.
//!
//! The container layer only handles headers and chunk framing; sample
//! payloads go through the raw PCM, G.711 and IMA ADPCM codecs.

pub mod data;
pub mod decoder;
pub mod encoder;
pub mod header;

pub use decoder::RiffWaveDecoder;
pub use encoder::RiffWaveEncoder;
pub use header::WaveHeader;

use crate::audio::codec::{AudioDecoder, AudioEncoder, CodecContext, CodecFactory};
use crate::audio::format::AudioSampleFormat;
use crate::common::{CodecError, Result};

pub const RIFF: &str = "riff";

/// Serves `riff`. The container describes itself, so decoder params are
/// ignored; encoders write 16-bit PCM.
pub struct RiffWaveCodecFactory {
    context: CodecContext,
}

impl RiffWaveCodecFactory {
    pub fn new(context: CodecContext) -> Self {
        Self { context }
    }
}

impl CodecFactory for RiffWaveCodecFactory {
    fn supported_decode_formats(&self) -> Vec<String> {
        vec![RIFF.to_string()]
    }

    fn supported_encode_formats(&self) -> Vec<String> {
        vec![RIFF.to_string()]
    }

    fn create_decoder(&self, codec: &str, _codec_params: Option<&str>) -> Result<Box<dyn AudioDecoder>> {
        if codec != RIFF {
            return Err(CodecError::unsupported(format!("codec \"{}\"", codec)));
        }
        Ok(Box::new(RiffWaveDecoder::new(self.context.clone())))
    }

    fn create_encoder(&self, codec: &str, input_format: AudioSampleFormat) -> Result<Box<dyn AudioEncoder>> {
        if codec != RIFF {
            return Err(CodecError::unsupported(format!("codec \"{}\"", codec)));
        }
        Ok(Box::new(RiffWaveEncoder::new(input_format, self.context.clone())?))
    }
}
