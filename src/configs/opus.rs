use serde::{Deserialize, Serialize};

use crate::audio::constants::{
    OGG_DEFAULT_PAGE_SEGMENTS, OPUS_DEFAULT_FRAME_MS, OPUS_MAX_CHANNELS, OPUS_MAX_SAMPLE_RATE,
};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OpusConfig {
    /// Upper bound for the decoder output rate when no codec params are given.
    #[serde(default = "default_max_sample_rate")]
    pub max_sample_rate: u32,
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
    /// Encoder frame duration; one of 2.5, 5, 10, 20, 40, 60.
    #[serde(default = "default_frame_ms")]
    pub frame_ms: f32,
    pub bitrate_kbps: Option<u32>,
    /// Lacing values per Ogg page written by the `oggopus` encoder, 1..=255.
    #[serde(default = "default_ogg_page_segments")]
    pub ogg_page_segments: usize,
}

fn default_max_sample_rate() -> u32 {
    OPUS_MAX_SAMPLE_RATE
}

fn default_max_channels() -> usize {
    OPUS_MAX_CHANNELS
}

fn default_frame_ms() -> f32 {
    OPUS_DEFAULT_FRAME_MS
}

fn default_ogg_page_segments() -> usize {
    OGG_DEFAULT_PAGE_SEGMENTS
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            max_sample_rate: default_max_sample_rate(),
            max_channels: default_max_channels(),
            frame_ms: default_frame_ms(),
            bitrate_kbps: None,
            ogg_page_segments: default_ogg_page_segments(),
        }
    }
}
