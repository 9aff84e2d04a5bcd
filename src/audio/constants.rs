//! Central constants for the codec framework.
//!
//! Wire-format numbers, pool sizing and codec tables live here so they can be
//! tuned in one place and remain consistent across modules.

// ── Buffer pool ──────────────────────────────────────────────────────────────

/// Capacities of the pooled size bins, smallest first.
pub const POOL_BIN_SIZES: [usize; 6] = [64, 1_024, 4_096, 16_384, 65_536, 262_144];

/// Fast-path bin, also the default rent size.
pub const DEFAULT_BUFFER_SIZE: usize = 65_536;

/// Index of [`DEFAULT_BUFFER_SIZE`] inside [`POOL_BIN_SIZES`].
pub const DEFAULT_BIN_INDEX: usize = 4;

/// Largest pooled capacity; bigger requests are never recycled.
pub const MAX_POOLED_SIZE: usize = 262_144;

/// Per-thread ring capacity for each bin.
pub const THREAD_LOCAL_RING_CAPACITY: usize = 16;

/// Global lock-free cache capacity for each bin.
pub const GLOBAL_CACHE_CAPACITY: usize = 1_024;

// ── PCM scaling ──────────────────────────────────────────────────────────────

pub const INT16_SCALE: f32 = 32_767.0;
pub const INT24_SCALE: f32 = 8_388_607.0;
pub const INT32_SCALE: f64 = 2_147_483_647.0;

// ── G.711 ────────────────────────────────────────────────────────────────────

/// Largest magnitude the companders accept before clipping.
pub const G711_CLIP: i32 = 32_635;

/// Bias added to the magnitude before μ-law segment lookup.
pub const ULAW_BIAS: i32 = 0x84;

// ── Square-delta ─────────────────────────────────────────────────────────────

/// Largest 7-bit step code.
pub const SQRT_MAX_CODE: i32 = 127;

/// Step ceilings selected by sample rate.
pub const SQRT_CEILING_HIGH_RATE: i32 = 5_000;
pub const SQRT_CEILING_MID_RATE: i32 = 8_000;
pub const SQRT_CEILING_LOW_RATE: i32 = 16_000;

// ── IMA ADPCM ────────────────────────────────────────────────────────────────

pub const ADPCM_MAX_CHANNELS: usize = 8;

/// Bytes per channel in each block header: predictor, step index, reserved.
pub const ADPCM_BLOCK_HEADER_BYTES: usize = 4;

/// Block size per channel used by the encoder above 11025 Hz.
pub const ADPCM_BLOCK_BYTES_PER_CHANNEL: usize = 512;

/// Block size per channel used by the encoder at 11025 Hz and below.
pub const ADPCM_SMALL_BLOCK_BYTES_PER_CHANNEL: usize = 256;

pub const ADPCM_STEP_TABLE: [i32; 89] = [
    7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 19, 21, 23, 25, 28, 31, 34, 37, 41, 45, 50, 55, 60, 66,
    73, 80, 88, 97, 107, 118, 130, 143, 157, 173, 190, 209, 230, 253, 279, 307, 337, 371, 408,
    449, 494, 544, 598, 658, 724, 796, 876, 963, 1_060, 1_166, 1_282, 1_411, 1_552, 1_707, 1_878,
    2_066, 2_272, 2_499, 2_749, 3_024, 3_327, 3_660, 4_026, 4_428, 4_871, 5_358, 5_894, 6_484,
    7_132, 7_845, 8_630, 9_493, 10_442, 11_487, 12_635, 13_899, 15_289, 16_818, 18_500, 20_350,
    22_385, 24_623, 27_086, 29_794, 32_767,
];

pub const ADPCM_INDEX_TABLE: [i32; 8] = [-1, -1, -1, -1, 2, 4, 6, 8];

// ── RIFF / WAVE ──────────────────────────────────────────────────────────────

pub const RIFF_CLASSIC_HEADER_LEN: usize = 44;
pub const RIFF_EXTENSIBLE_HEADER_LEN: usize = 68;

pub const WAVE_FORMAT_PCM: u16 = 0x0001;
pub const WAVE_FORMAT_MS_ADPCM: u16 = 0x0002;
pub const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
pub const WAVE_FORMAT_ALAW: u16 = 0x0006;
pub const WAVE_FORMAT_MULAW: u16 = 0x0007;
pub const WAVE_FORMAT_IMA_ADPCM: u16 = 0x0011;
pub const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// Shared tail of every `KSDATAFORMAT_SUBTYPE_*` GUID.
pub const SUBTYPE_GUID_SUFFIX: [u8; 12] = [
    0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
];

// ── Speaker masks ────────────────────────────────────────────────────────────

pub const SPEAKER_FRONT_LEFT: u32 = 0x1;
pub const SPEAKER_FRONT_RIGHT: u32 = 0x2;
pub const SPEAKER_FRONT_CENTER: u32 = 0x4;
pub const SPEAKER_LOW_FREQUENCY: u32 = 0x8;
pub const SPEAKER_BACK_LEFT: u32 = 0x10;
pub const SPEAKER_BACK_RIGHT: u32 = 0x20;
pub const SPEAKER_FRONT_LEFT_OF_CENTER: u32 = 0x40;
pub const SPEAKER_FRONT_RIGHT_OF_CENTER: u32 = 0x80;
pub const SPEAKER_BACK_CENTER: u32 = 0x100;
pub const SPEAKER_SIDE_LEFT: u32 = 0x200;
pub const SPEAKER_SIDE_RIGHT: u32 = 0x400;

// ── Opus ─────────────────────────────────────────────────────────────────────

/// Largest legal Opus packet payload.
pub const OPUS_MAX_PACKET_SIZE: usize = 1_275;

/// Length prefix preceding every packet in the raw framing.
pub const OPUS_LENGTH_PREFIX_BYTES: usize = 2;

/// Byte ring size of the raw decoder.
pub const OPUS_INPUT_RING_SIZE: usize = 65_536;

/// Largest decoded frame: 120 ms at 48 kHz.
pub const MAX_OPUS_FRAME_SIZE: usize = 5_760;

/// Rates the Opus primitive accepts, ascending.
pub const OPUS_SAMPLE_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

/// Legal encoder frame durations in milliseconds.
pub const OPUS_FRAME_DURATIONS_MS: [f32; 6] = [2.5, 5.0, 10.0, 20.0, 40.0, 60.0];

pub const OPUS_MAX_SAMPLE_RATE: u32 = 48_000;
pub const OPUS_MAX_CHANNELS: usize = 2;
pub const OPUS_DEFAULT_FRAME_MS: f32 = 20.0;

// ── Ogg ──────────────────────────────────────────────────────────────────────

/// Fixed part of a page header, before the lacing table.
pub const OGG_PAGE_HEADER_LEN: usize = 27;

/// Lacing values a single page can carry.
pub const OGG_MAX_SEGMENTS: usize = 255;

/// Header, full lacing table and 255 full segments.
pub const OGG_MAX_PAGE_SIZE: usize = OGG_PAGE_HEADER_LEN + OGG_MAX_SEGMENTS + OGG_MAX_SEGMENTS * 255;

/// Byte ring of the Ogg reader; always holds one whole page.
pub const OGG_INPUT_RING_SIZE: usize = 65_536;

/// Free tail kept before each read into the Ogg ring.
pub const OGG_READ_RESERVE: usize = 4_096;

/// Bytes the reader may skip looking for a valid page before giving up.
pub const OGG_MAX_SYNC_SKIP: usize = 65_536;

/// Packets larger than this are dropped while being assembled.
pub const OGG_MAX_PACKET_SIZE: usize = 1 << 20;

/// Default page size limit of the Ogg Opus writer, in lacing values.
pub const OGG_DEFAULT_PAGE_SEGMENTS: usize = 248;

/// Ogg Opus granule positions count 48 kHz samples.
pub const OPUS_GRANULE_RATE: u32 = 48_000;

/// Pre-skip written by the Ogg Opus encoder: 80 ms at 48 kHz.
pub const OPUS_OGG_PRE_SKIP: u16 = 3_840;
