//! Progress reporting module
//!
//! Provides progress bars for copy operations with file count, byte
//! transfer and throughput display.

mod reporter;

pub use reporter::*;
