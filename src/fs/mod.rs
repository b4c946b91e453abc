//! Directory listing module
//!
//! Provides the glob name filter and the lazy, filtered directory
//! iterator the copy engine consumes.

mod filter;
mod listing;

pub use filter::*;
pub use listing::*;
