//! Codec parameter strings: `samplerate=R[ channels=C][ layout=L]`.
//!
//! The string travels out-of-band next to a codec name and is all a decoder
//! needs to interpret headerless payloads.

use crate::audio::format::{AudioSampleFormat, ChannelMapping};
use crate::common::{CodecError, Result};

const SAMPLE_RATE_KEY: &str = "samplerate";
const CHANNELS_KEY: &str = "channels";
const LAYOUT_KEY: &str = "layout";

/// Serializes `format` with all three fields.
pub fn create_codec_params(format: &AudioSampleFormat) -> String {
    format!(
        "{}={} {}={} {}={}",
        SAMPLE_RATE_KEY,
        format.sample_rate_hz,
        CHANNELS_KEY,
        format.num_channels,
        LAYOUT_KEY,
        format.channel_mapping.code()
    )
}

fn parse_field<T: std::str::FromStr>(params: &str, key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CodecError::param(params, format!("{} is not a number: \"{}\"", key, value)))
}

/// Parses a parameter string. Unknown keys are ignored.
pub fn try_parse_codec_params(params: &str) -> Result<AudioSampleFormat> {
    let mut sample_rate = None;
    let mut channels = None;
    let mut layout = None;

    for field in params.split_whitespace() {
        let Some((key, value)) = field.split_once('=') else {
            return Err(CodecError::param(params, format!("field \"{}\" has no value", field)));
        };
        match key {
            SAMPLE_RATE_KEY => sample_rate = Some(parse_field::<u32>(params, key, value)?),
            CHANNELS_KEY => channels = Some(parse_field::<usize>(params, key, value)?),
            LAYOUT_KEY => layout = Some(parse_field::<u32>(params, key, value)?),
            _ => {}
        }
    }

    let sample_rate =
        sample_rate.ok_or_else(|| CodecError::param(params, "samplerate is required"))?;
    let channels = channels.unwrap_or(1);

    let mapping = match layout {
        Some(code) => ChannelMapping::from_code(code)
            .ok_or_else(|| CodecError::param(params, format!("unknown layout {}", code)))?,
        None => match channels {
            2 => ChannelMapping::StereoLR,
            n => ChannelMapping::default_for_channels(n)
                .map_err(|e| CodecError::param(params, e.to_string()))?,
        },
    };

    AudioSampleFormat::new(sample_rate, channels, mapping)
        .map_err(|e| CodecError::param(params, e.to_string()))
}
