//! Core copy engine module
//!
//! Provides the copy orchestration, the bounded transfer queue,
//! and the worker pool that streams files between backends.

mod copier;
mod scheduler;

pub use copier::*;
pub use scheduler::*;
