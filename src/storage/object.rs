//! Object-store backend
//!
//! Adapts any [`ObjectStore`] (a flat key space under a bucket) to the
//! [`Backend`] capability set. Directories are synthesized from `/`-separated
//! key prefixes, and mtime/mode travel as custom object metadata since object
//! stores have no POSIX attributes.

use crate::error::{Result, XcpError};
use crate::storage::{
    Backend, EntryStream, EnumerateOptions, FileMeta, FileWriter, RawEntry, Scheme,
    DEFAULT_FILE_MODE,
};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

/// User-metadata field carrying the modification time (RFC 3339)
pub const META_MTIME: &str = "mtime";

/// User-metadata field carrying the permission bits (octal)
pub const META_MODE: &str = "mode";

/// Default part size for multipart uploads: 8 MB.
/// Bodies smaller than one part are stored with a single `put`.
pub const MULTIPART_PART_SIZE: usize = 8 * 1024 * 1024;

/// Object description returned by listings and HEAD requests
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    /// Full object key
    pub key: String,
    /// Size in bytes
    pub size: u64,
    /// Store-assigned modification time
    pub last_modified: SystemTime,
    /// Custom metadata, when the request returned it
    pub metadata: Option<HashMap<String, String>>,
}

impl ObjectInfo {
    /// File metadata recorded on the object, falling back to the store's
    /// timestamp and the default mode
    pub fn file_meta(&self) -> FileMeta {
        let fields = self.metadata.as_ref();
        let mtime = fields
            .and_then(|m| m.get(META_MTIME))
            .and_then(|v| humantime::parse_rfc3339(v).ok())
            .unwrap_or(self.last_modified);
        let mode = fields
            .and_then(|m| m.get(META_MODE))
            .and_then(|v| u32::from_str_radix(v, 8).ok())
            .unwrap_or(DEFAULT_FILE_MODE);
        FileMeta::new(mtime, mode)
    }
}

/// Encode file metadata as object user-metadata
pub fn encode_meta(meta: &FileMeta) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    fields.insert(
        META_MTIME.to_string(),
        humantime::format_rfc3339_nanos(meta.mtime).to_string(),
    );
    fields.insert(META_MODE.to_string(), format!("{:o}", meta.mode));
    fields
}

/// One page of a listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Objects directly matched by the request
    pub objects: Vec<ObjectInfo>,
    /// Key prefixes rolled up by the delimiter
    pub common_prefixes: Vec<String>,
    /// Token for the next page, if the listing is truncated
    pub next_token: Option<String>,
}

/// Receipt for one uploaded part of a multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    /// 1-based part number
    pub number: u32,
    /// Store-assigned tag, echoed back on completion
    pub etag: String,
}

/// Minimal object-store client
pub trait ObjectStore: Send + Sync + 'static {
    /// Scheme served by this store
    fn scheme(&self) -> Scheme;

    /// Bucket name
    fn bucket(&self) -> &str;

    /// Fetch an object's body
    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>>;

    /// Store an object, replacing any existing one
    fn put(&self, key: &str, data: Vec<u8>, metadata: HashMap<String, String>) -> Result<()>;

    /// Fetch an object's description including custom metadata
    fn head(&self, key: &str) -> Result<ObjectInfo>;

    /// Size of the parts a writer sends once a body outgrows one part
    fn part_size(&self) -> usize {
        MULTIPART_PART_SIZE
    }

    /// Start a multipart upload, returning its upload ID
    fn create_upload(&self, key: &str, metadata: HashMap<String, String>) -> Result<String>;

    /// Upload part `number` (1-based) of a multipart upload
    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: u32,
        data: Vec<u8>,
    ) -> Result<UploadedPart>;

    /// Assemble the uploaded parts into the final object
    fn complete_upload(&self, key: &str, upload_id: &str, parts: Vec<UploadedPart>) -> Result<()>;

    /// Discard a multipart upload and its parts
    fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()>;

    /// List one page of keys starting with `prefix`
    fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<&str>,
    ) -> Result<ListPage>;
}

/// [`Backend`] over an [`ObjectStore`]
pub struct ObjectBackend<S: ObjectStore> {
    store: Arc<S>,
}

impl<S: ObjectStore> ObjectBackend<S> {
    /// Wrap a store
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: ObjectStore> Backend for ObjectBackend<S> {
    fn scheme(&self) -> Scheme {
        self.store.scheme()
    }

    fn open_reader(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        self.store.get(path)
    }

    fn open_writer(&self, path: &str, meta: Option<&FileMeta>) -> Result<Box<dyn FileWriter>> {
        if path.is_empty() || path.ends_with('/') {
            return Err(XcpError::remote(path, "object key must name a file"));
        }
        Ok(Box::new(ObjectWriter {
            part_size: self.store.part_size().max(1),
            store: Arc::clone(&self.store),
            key: path.to_string(),
            buffer: Vec::new(),
            meta: meta.copied(),
            upload: None,
            written: 0,
            failed: false,
            closed: false,
        }))
    }

    fn enumerate(&self, prefix: &str, options: EnumerateOptions) -> Result<EntryStream> {
        let list_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix.trim_end_matches('/'))
        };

        Ok(Box::new(ObjectLister {
            store: Arc::clone(&self.store),
            prefix: list_prefix,
            options,
            buffer: VecDeque::new(),
            token: None,
            started: false,
            exhausted: false,
        }))
    }

    fn stat(&self, path: &str) -> Result<FileMeta> {
        Ok(self.store.head(path)?.file_meta())
    }
}

/// Lazily pages through a listing
struct ObjectLister<S: ObjectStore> {
    store: Arc<S>,
    prefix: String,
    options: EnumerateOptions,
    buffer: VecDeque<ObjectInfo>,
    token: Option<String>,
    started: bool,
    exhausted: bool,
}

impl<S: ObjectStore> ObjectLister<S> {
    fn fetch_next_page(&mut self) -> Result<()> {
        // Non-recursive listings roll nested keys up into common prefixes,
        // which stand for subdirectories and are not descended into.
        let delimiter = if self.options.recursive { None } else { Some("/") };
        let page = self
            .store
            .list_page(&self.prefix, delimiter, self.token.as_deref())?;

        self.started = true;
        self.token = page.next_token;
        self.exhausted = self.token.is_none();
        self.buffer.extend(page.objects);

        tracing::trace!(
            "Listed page under '{}' ({} buffered, {} prefixes)",
            self.prefix,
            self.buffer.len(),
            page.common_prefixes.len()
        );
        Ok(())
    }

    fn to_entry(&self, info: ObjectInfo) -> RawEntry {
        let path = info
            .key
            .strip_prefix(&self.prefix)
            .unwrap_or(&info.key)
            .to_string();

        RawEntry {
            path,
            size: info.size,
            meta: info.file_meta(),
            // Listings without user metadata only know the upload time
            meta_exact: info.metadata.is_some(),
        }
    }
}

impl<S: ObjectStore> Iterator for ObjectLister<S> {
    type Item = Result<RawEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(info) = self.buffer.pop_front() {
                // Directory markers are not files
                if info.key.ends_with('/') || info.key.len() <= self.prefix.len() {
                    continue;
                }
                return Some(Ok(self.to_entry(info)));
            }

            if self.started && self.exhausted {
                return None;
            }

            if let Err(e) = self.fetch_next_page() {
                self.exhausted = true;
                self.started = true;
                return Some(Err(e));
            }
        }
    }
}

/// Streams an object body to the store.
///
/// Bodies smaller than one part are buffered and stored with a single `put`
/// on close. Larger bodies switch to a multipart upload and send a part
/// whenever a full part is buffered, so at most one part is held in memory.
struct ObjectWriter<S: ObjectStore> {
    store: Arc<S>,
    key: String,
    buffer: Vec<u8>,
    part_size: usize,
    meta: Option<FileMeta>,
    upload: Option<MultipartUpload>,
    written: u64,
    failed: bool,
    closed: bool,
}

struct MultipartUpload {
    id: String,
    parts: Vec<UploadedPart>,
}

impl<S: ObjectStore> ObjectWriter<S> {
    fn metadata(&self) -> HashMap<String, String> {
        self.meta.as_ref().map(encode_meta).unwrap_or_default()
    }

    /// Send up to one part from the front of the buffer
    fn send_part(&mut self) -> Result<()> {
        if self.upload.is_none() {
            let id = self.store.create_upload(&self.key, self.metadata())?;
            tracing::debug!("Started multipart upload of {}/{}", self.store.bucket(), self.key);
            self.upload = Some(MultipartUpload {
                id,
                parts: Vec::new(),
            });
        }

        let rest = self.buffer.split_off(self.part_size.min(self.buffer.len()));
        let data = std::mem::replace(&mut self.buffer, rest);

        let sent = match self.upload.as_mut() {
            Some(upload) => {
                let number = upload.parts.len() as u32 + 1;
                self.store
                    .upload_part(&self.key, &upload.id, number, data)
                    .map(|part| upload.parts.push(part))
            }
            None => Ok(()),
        };

        if let Err(e) = sent {
            self.failed = true;
            self.abort();
            return Err(e);
        }
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(upload) = self.upload.take() {
            if let Err(e) = self.store.abort_upload(&self.key, &upload.id) {
                tracing::warn!(
                    "Failed to abort upload of {}/{}: {}",
                    self.store.bucket(),
                    self.key,
                    e
                );
            }
        }
    }
}

impl<S: ObjectStore> Write for ObjectWriter<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.written += buf.len() as u64;

        while self.buffer.len() >= self.part_size {
            self.send_part()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: ObjectStore> FileWriter for ObjectWriter<S> {
    fn close(mut self: Box<Self>) -> Result<u64> {
        self.closed = true;

        if self.failed {
            return Err(XcpError::remote(&self.key, "upload aborted after a failed part"));
        }
        if self.upload.is_none() {
            let data = std::mem::take(&mut self.buffer);
            self.store.put(&self.key, data, self.metadata())?;
        } else {
            if !self.buffer.is_empty() {
                self.send_part()?;
            }
            if let Some(MultipartUpload { id, parts }) = self.upload.take() {
                let count = parts.len();
                if let Err(e) = self.store.complete_upload(&self.key, &id, parts) {
                    self.upload = Some(MultipartUpload {
                        id,
                        parts: Vec::new(),
                    });
                    self.abort();
                    return Err(e);
                }
                tracing::debug!("Completed upload of {} in {} parts", self.key, count);
            }
        }

        tracing::debug!(
            "Uploaded {}/{} ({} bytes)",
            self.store.bucket(),
            self.key,
            self.written
        );
        Ok(self.written)
    }
}

impl<S: ObjectStore> Drop for ObjectWriter<S> {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(
                "Writer for {}/{} dropped without close; {} bytes discarded",
                self.store.bucket(),
                self.key,
                self.written
            );
            self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    /// Memory store whose second part upload fails
    struct FailingSecondPart(MemoryStore);

    impl ObjectStore for FailingSecondPart {
        fn scheme(&self) -> Scheme {
            self.0.scheme()
        }
        fn bucket(&self) -> &str {
            self.0.bucket()
        }
        fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
            self.0.get(key)
        }
        fn put(&self, key: &str, data: Vec<u8>, metadata: HashMap<String, String>) -> Result<()> {
            self.0.put(key, data, metadata)
        }
        fn head(&self, key: &str) -> Result<ObjectInfo> {
            self.0.head(key)
        }
        fn part_size(&self) -> usize {
            4
        }
        fn create_upload(&self, key: &str, metadata: HashMap<String, String>) -> Result<String> {
            self.0.create_upload(key, metadata)
        }
        fn upload_part(
            &self,
            key: &str,
            upload_id: &str,
            number: u32,
            data: Vec<u8>,
        ) -> Result<UploadedPart> {
            if number == 2 {
                return Err(XcpError::remote(key, "connection reset"));
            }
            self.0.upload_part(key, upload_id, number, data)
        }
        fn complete_upload(&self, key: &str, upload_id: &str, parts: Vec<UploadedPart>) -> Result<()> {
            self.0.complete_upload(key, upload_id, parts)
        }
        fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()> {
            self.0.abort_upload(key, upload_id)
        }
        fn list_page(
            &self,
            prefix: &str,
            delimiter: Option<&str>,
            token: Option<&str>,
        ) -> Result<ListPage> {
            self.0.list_page(prefix, delimiter, token)
        }
    }

    #[test]
    fn test_failed_part_aborts_and_blocks_close() {
        let store = Arc::new(FailingSecondPart(MemoryStore::new("t")));
        let backend = ObjectBackend::new(Arc::clone(&store));

        let mut w = backend.open_writer("big.bin", None).unwrap();
        w.write_all(b"0123").unwrap();
        assert!(w.write_all(b"4567").is_err());
        assert_eq!(store.0.pending_uploads(), 0);

        w.write_all(b"89").unwrap();
        assert!(matches!(w.close(), Err(XcpError::Remote { .. })));
        assert!(store.0.is_empty());
    }

    #[test]
    fn test_meta_encoding_round_trips() {
        let mtime = SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        let meta = FileMeta::new(mtime, 0o750);
        let info = ObjectInfo {
            key: "k".into(),
            size: 0,
            last_modified: SystemTime::UNIX_EPOCH,
            metadata: Some(encode_meta(&meta)),
        };
        assert_eq!(info.file_meta(), meta);
        assert_eq!(encode_meta(&meta)[META_MODE], "750");
    }

    #[test]
    fn test_missing_meta_falls_back() {
        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(42);
        let info = ObjectInfo {
            key: "k".into(),
            size: 3,
            last_modified: stamp,
            metadata: None,
        };
        let meta = info.file_meta();
        assert_eq!(meta.mtime, stamp);
        assert_eq!(meta.mode, DEFAULT_FILE_MODE);
    }
}
