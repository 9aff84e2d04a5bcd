use serde::{Deserialize, Serialize};

use crate::audio::constants::{GLOBAL_CACHE_CAPACITY, THREAD_LOCAL_RING_CAPACITY};

/// Sizing of the two cache tiers in front of every size bin.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    #[serde(default = "default_thread_local_capacity")]
    pub thread_local_capacity: usize,
    #[serde(default = "default_global_capacity")]
    pub global_capacity: usize,
}

fn default_thread_local_capacity() -> usize {
    THREAD_LOCAL_RING_CAPACITY
}

fn default_global_capacity() -> usize {
    GLOBAL_CACHE_CAPACITY
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            thread_local_capacity: default_thread_local_capacity(),
            global_capacity: default_global_capacity(),
        }
    }
}
