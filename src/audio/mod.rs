pub mod buffer;
pub mod codec;
pub mod constants;
pub mod format;
pub mod params;

pub use buffer::{BufferPool, BufferPools, PooledBuffer};
pub use codec::{AggregateCodecFactory, AudioDecoder, AudioEncoder, CodecContext, CodecFactory};
pub use format::{AudioSampleFormat, ChannelMapping, WaveFormat};
