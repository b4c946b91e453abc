//! # xcp - Parallel Copy Between Storage Backends
//!
//! xcp copies directory trees between local filesystems and object stores.
//! Every location is addressed by a URL and served by a [`storage::Backend`];
//! a lazy, filtered [`fs::DirIterator`] lists the source and a
//! [`core::CopyEngine`] streams the matching files to the destination with
//! bounded concurrency.
//!
//! ## Features
//!
//! - **Uniform addressing**: local paths, `file://`, `s3://` and `mem://`
//! - **Lazy listings**: entries are produced on demand, page by page
//! - **Glob filtering**: base-name patterns plus size, age and hidden-file predicates
//! - **Metadata preservation**: modification time and permission bits
//! - **Bounded parallelism**: a fixed worker pool fed by a bounded queue
//! - **Failure aggregation**: every failed file is reported, or stop at the first
//!
//! ## Quick Start
//!
//! ```no_run
//! use xcp::core::copy_dir;
//! use xcp::fs::ListDirTask;
//! use xcp::storage::StorageUrl;
//!
//! let listing = ListDirTask::parse("/data/in", "*.csv").unwrap().with_meta(true);
//! let destination = StorageUrl::parse("mem://backup/in").unwrap();
//!
//! let result = copy_dir(listing, &destination, 8).unwrap();
//! println!("Copied {} files ({} bytes)", result.files_copied, result.bytes_copied);
//! ```
//!
//! ## Listing
//!
//! ```no_run
//! use xcp::fs::{list_dir, ListDirTask};
//!
//! let task = ListDirTask::parse("/data/in", "*.*").unwrap().skip_hidden(true);
//! let mut entries = list_dir(task).unwrap();
//!
//! while entries.advance() {
//!     if let Some(entry) = entries.current() {
//!         println!("{} {}", entry.name, entry.size);
//!     }
//! }
//! if let Some(err) = entries.error() {
//!     eprintln!("listing stopped: {}", err);
//! }
//! ```
//!
//! ## Advanced Usage
//!
//! ```no_run
//! use xcp::core::{CopyEngine, CopyOptions, FailurePolicy};
//! use xcp::fs::ListDirTask;
//! use xcp::progress::ProgressReporter;
//! use xcp::storage::StorageUrl;
//!
//! let options = CopyOptions {
//!     concurrency: 16,
//!     failure_policy: FailurePolicy::FailFast,
//!     ..Default::default()
//! };
//!
//! let engine = CopyEngine::new(options).with_progress(ProgressReporter::new());
//! let listing = ListDirTask::parse("s3://bucket/data", "*").unwrap();
//! let destination = StorageUrl::parse("/restore/data").unwrap();
//!
//! let result = engine.execute(listing, &destination).unwrap();
//! result.print_summary();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod error;
pub mod fs;
pub mod progress;
pub mod storage;

// Re-export commonly used types
pub use config::{CopyConfig, ListingConfig};
pub use core::{copy_dir, CopyEngine, CopyOptions, CopyResult};
pub use error::{Result, XcpError};
pub use fs::{list_dir, DirEntry, DirIterator, ListDirTask};
pub use progress::ProgressReporter;
pub use storage::{Backend, StorageUrl};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use xcp::prelude::*;
    //! ```

    pub use crate::config::{CopyConfig, ListingConfig};
    pub use crate::core::{copy_dir, CopyEngine, CopyOptions, CopyResult, FailurePolicy};
    pub use crate::error::{Result, XcpError};
    pub use crate::fs::{list_dir, DirEntry, DirIterator, ListDirTask, ListSummary, NameFilter};
    pub use crate::progress::ProgressReporter;
    pub use crate::storage::{open_backend, Backend, BackendRegistry, FileMeta, StorageUrl};
}
