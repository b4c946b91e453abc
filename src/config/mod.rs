//! Configuration module for xcp
//!
//! Provides the CLI arguments and the runtime settings derived from them.

mod settings;

pub use settings::*;
