//! ITU-T G.711 A-law and μ-law companding.
//!
//! One byte per sample, no header; the format travels in the codec params.

use crate::audio::codec::payload::{PayloadDecoder, PayloadEncoder, SamplePacker, SampleUnpacker};
use crate::audio::codec::{AudioDecoder, AudioEncoder, CodecContext, CodecFactory};
use crate::audio::constants::{G711_CLIP, INT16_SCALE, ULAW_BIAS};
use crate::audio::format::AudioSampleFormat;
use crate::audio::params::try_parse_codec_params;
use crate::common::{CodecError, Result};

pub const ALAW: &str = "alaw";
pub const ULAW: &str = "ulaw";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Companding {
    ALaw,
    MuLaw,
}

impl Companding {
    pub fn codec_name(self) -> &'static str {
        match self {
            Self::ALaw => ALAW,
            Self::MuLaw => ULAW,
        }
    }

    pub fn for_codec(codec: &str) -> Option<Self> {
        match codec {
            ALAW => Some(Self::ALaw),
            ULAW => Some(Self::MuLaw),
            _ => None,
        }
    }

    pub fn encode(self, sample: i16) -> u8 {
        match self {
            Self::ALaw => linear_to_alaw(sample),
            Self::MuLaw => linear_to_ulaw(sample),
        }
    }

    pub fn decode(self, code: u8) -> i16 {
        match self {
            Self::ALaw => ALAW_DECODE[code as usize],
            Self::MuLaw => ULAW_DECODE[code as usize],
        }
    }
}

// ── Tables ───────────────────────────────────────────────────────────────────

const fn alaw_to_linear(code: u8) -> i16 {
    let a = code ^ 0x55;
    let mut t = ((a & 0x0F) as i32) << 4;
    let segment = ((a & 0x70) >> 4) as i32;
    match segment {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= segment - 1;
        }
    }
    if a & 0x80 != 0 { t as i16 } else { -t as i16 }
}

const fn ulaw_to_linear(code: u8) -> i16 {
    let u = !code;
    let mut t = (((u & 0x0F) as i32) << 3) + ULAW_BIAS;
    t <<= ((u & 0x70) >> 4) as i32;
    if u & 0x80 != 0 {
        (ULAW_BIAS - t) as i16
    } else {
        (t - ULAW_BIAS) as i16
    }
}

const fn build_decode_table(alaw: bool) -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = if alaw {
            alaw_to_linear(i as u8)
        } else {
            ulaw_to_linear(i as u8)
        };
        i += 1;
    }
    table
}

/// Segment exponent for each value of the magnitude's top seven bits.
const fn build_alaw_segments() -> [u8; 128] {
    let mut table = [0u8; 128];
    let mut i = 1;
    while i < 128 {
        table[i] = 8 - (i as u8).leading_zeros() as u8;
        i += 1;
    }
    table[0] = 1;
    table
}

/// Segment exponent for each value of the biased magnitude's bits 7..15.
const fn build_ulaw_segments() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 1;
    while i < 256 {
        table[i] = 7 - (i as u8).leading_zeros() as u8;
        i += 1;
    }
    table
}

static ALAW_DECODE: [i16; 256] = build_decode_table(true);
static ULAW_DECODE: [i16; 256] = build_decode_table(false);
static ALAW_SEGMENTS: [u8; 128] = build_alaw_segments();
static ULAW_SEGMENTS: [u8; 256] = build_ulaw_segments();

pub fn linear_to_alaw(sample: i16) -> u8 {
    let value = sample as i32;
    let sign = ((!value) >> 8) & 0x80;
    let magnitude = (if sign == 0 { -value } else { value }).min(G711_CLIP);

    let compressed = if magnitude >= 256 {
        let exponent = ALAW_SEGMENTS[((magnitude >> 8) & 0x7F) as usize] as i32;
        let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
        (exponent << 4) | mantissa
    } else {
        magnitude >> 4
    };
    (compressed ^ (sign ^ 0x55)) as u8
}

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let value = sample as i32;
    let sign = (value >> 8) & 0x80;
    let magnitude = (if sign != 0 { -value } else { value }).min(G711_CLIP) + ULAW_BIAS;

    let exponent = ULAW_SEGMENTS[((magnitude >> 7) & 0xFF) as usize] as i32;
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * INT16_SCALE).round() as i16
}

impl SampleUnpacker for Companding {
    fn bytes_per_sample(&self) -> usize {
        1
    }

    fn unpack(&mut self, input: &[u8], output: &mut [f32], _channels: usize) {
        for (&code, sample) in input.iter().zip(output.iter_mut()) {
            *sample = self.decode(code) as f32 / INT16_SCALE;
        }
    }
}

impl SamplePacker for Companding {
    fn bytes_per_sample(&self) -> usize {
        1
    }

    fn pack(&mut self, input: &[f32], output: &mut [u8], _channels: usize) {
        for (&sample, code) in input.iter().zip(output.iter_mut()) {
            *code = self.encode(to_i16(sample));
        }
    }
}

pub type G711Decoder = PayloadDecoder<Companding>;
pub type G711Encoder = PayloadEncoder<Companding>;

pub fn g711_decoder(law: Companding, format: AudioSampleFormat, context: CodecContext) -> G711Decoder {
    PayloadDecoder::new(law.codec_name(), format, law, context)
}

pub fn g711_encoder(law: Companding, format: AudioSampleFormat, context: CodecContext) -> G711Encoder {
    PayloadEncoder::new(law.codec_name(), format, law, context)
}

/// Serves `alaw` and `ulaw`.
pub struct G711CodecFactory {
    context: CodecContext,
}

impl G711CodecFactory {
    pub fn new(context: CodecContext) -> Self {
        Self { context }
    }
}

impl CodecFactory for G711CodecFactory {
    fn supported_decode_formats(&self) -> Vec<String> {
        vec![ALAW.to_string(), ULAW.to_string()]
    }

    fn supported_encode_formats(&self) -> Vec<String> {
        self.supported_decode_formats()
    }

    fn create_decoder(&self, codec: &str, codec_params: Option<&str>) -> Result<Box<dyn AudioDecoder>> {
        let law = Companding::for_codec(codec)
            .ok_or_else(|| CodecError::unsupported(format!("codec \"{}\"", codec)))?;
        let params = codec_params
            .ok_or_else(|| CodecError::param("", "G.711 requires codec params"))?;
        let format = try_parse_codec_params(params)?;
        Ok(Box::new(g711_decoder(law, format, self.context.clone())))
    }

    fn create_encoder(&self, codec: &str, input_format: AudioSampleFormat) -> Result<Box<dyn AudioEncoder>> {
        let law = Companding::for_codec(codec)
            .ok_or_else(|| CodecError::unsupported(format!("codec \"{}\"", codec)))?;
        Ok(Box::new(g711_encoder(law, input_format, self.context.clone())))
    }
}
