pub mod pool;
pub mod ring;

pub use pool::{BufferPool, PoolElement, PoolStats, PooledBuffer, bin_for};
pub use ring::ByteRing;

use crate::configs::PoolConfig;

/// The pools a codec needs: raw bytes for transport I/O and floats for
/// decoded samples.
#[derive(Clone, Debug, Default)]
pub struct BufferPools {
    pub bytes: BufferPool<u8>,
    pub samples: BufferPool<f32>,
}

impl BufferPools {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            bytes: BufferPool::new(config),
            samples: BufferPool::new(config),
        }
    }
}
