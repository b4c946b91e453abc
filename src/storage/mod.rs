//! Storage backends
//!
//! Every backend exposes the same small capability set: open a reader,
//! open a writer (optionally carrying metadata) and enumerate the files
//! under a prefix. The local filesystem maps paths onto the host; object
//! stores map them onto keys under a bucket.

mod local;
mod memory;
mod object;
mod registry;
#[cfg(feature = "native_s3")]
mod s3;
pub mod url;

pub use local::*;
pub use memory::*;
pub use object::*;
pub use registry::*;
#[cfg(feature = "native_s3")]
pub use s3::*;
pub use url::{Scheme, StorageUrl};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::SystemTime;

/// Default permission bits for files whose backend has no notion of them
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Metadata replicated between backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Modification time
    pub mtime: SystemTime,
    /// Permission bits (lower 12 bits of the Unix mode)
    pub mode: u32,
}

impl FileMeta {
    /// Create metadata from a modification time and permission bits
    pub fn new(mtime: SystemTime, mode: u32) -> Self {
        Self {
            mtime,
            mode: mode & 0o7777,
        }
    }
}

/// A file reported by [`Backend::enumerate`]
#[derive(Debug, Clone)]
pub struct RawEntry {
    /// Path relative to the enumerated prefix, `/`-separated
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time and mode
    pub meta: FileMeta,
    /// Whether `meta` is what [`Backend::stat`] would report. Object
    /// listings only carry the store's timestamp, so their entries are
    /// approximate until stat'ed.
    pub meta_exact: bool,
}

/// Options for [`Backend::enumerate`]
#[derive(Debug, Clone, Copy, Default)]
pub struct EnumerateOptions {
    /// Descend into subdirectories / nested key prefixes
    pub recursive: bool,
}

/// Lazy enumeration of the files under a prefix
pub type EntryStream = Box<dyn Iterator<Item = Result<RawEntry>> + Send>;

/// Byte sink returned by [`Backend::open_writer`].
///
/// Data is only guaranteed to be durable, and metadata applied, once
/// [`FileWriter::close`] returns successfully.
pub trait FileWriter: Write + Send {
    /// Commit the written data and apply any pending metadata.
    /// Returns the number of bytes committed.
    fn close(self: Box<Self>) -> Result<u64>;
}

/// Uniform read/write/enumerate surface over a storage root
pub trait Backend: Send + Sync {
    /// Scheme this backend serves
    fn scheme(&self) -> Scheme;

    /// Open `path` for reading
    fn open_reader(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Create or truncate `path` for writing. When `meta` is given, the
    /// modification time and mode are applied when the writer is closed.
    fn open_writer(&self, path: &str, meta: Option<&FileMeta>) -> Result<Box<dyn FileWriter>>;

    /// Enumerate regular files under `prefix` without loading the whole
    /// tree. Failures are reported through the stream.
    fn enumerate(&self, prefix: &str, options: EnumerateOptions) -> Result<EntryStream>;

    /// Metadata of a single file
    fn stat(&self, path: &str) -> Result<FileMeta>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_file_meta_masks_type_bits() {
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let meta = FileMeta::new(mtime, 0o100755);
        assert_eq!(meta.mode, 0o755);
        assert_eq!(meta.mtime, mtime);
    }
}
