pub mod base;
pub mod decoding;
pub mod logging;
pub mod opus;
pub mod pool;

pub use base::*;
pub use decoding::*;
pub use logging::*;
pub use opus::*;
pub use pool::*;
