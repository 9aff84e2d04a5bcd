//! Streaming audio codecs over async byte streams, backed by a tiered
//! buffer pool.

pub mod audio;
pub mod common;
pub mod configs;
