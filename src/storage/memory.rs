//! In-memory object store
//!
//! A process-wide set of named buckets addressed as `mem://bucket/key`.
//! Behaves like a remote object store (flat keys, paged listings, metadata
//! as object headers), which makes it the workhorse for tests.

use crate::error::{Result, XcpError};
use crate::storage::{
    ListPage, ObjectBackend, ObjectInfo, ObjectStore, Scheme, StorageUrl, UploadedPart,
    MULTIPART_PART_SIZE,
};
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::SystemTime;

/// Default number of keys per listing page
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Arc<Vec<u8>>,
    last_modified: SystemTime,
    metadata: HashMap<String, String>,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    metadata: HashMap<String, String>,
    parts: BTreeMap<u32, Vec<u8>>,
}

/// In-memory bucket
#[derive(Debug)]
pub struct MemoryStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    next_upload: AtomicU64,
    page_size: usize,
    part_size: usize,
}

fn buckets() -> &'static Mutex<HashMap<String, Arc<MemoryStore>>> {
    static BUCKETS: OnceLock<Mutex<HashMap<String, Arc<MemoryStore>>>> = OnceLock::new();
    BUCKETS.get_or_init(|| Mutex::new(HashMap::new()))
}

impl MemoryStore {
    /// Create a detached bucket (not visible through `mem://` addresses)
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
            uploads: Mutex::new(HashMap::new()),
            next_upload: AtomicU64::new(1),
            page_size: DEFAULT_PAGE_SIZE,
            part_size: MULTIPART_PART_SIZE,
        }
    }

    /// Set the listing page size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Set the multipart part size
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    /// Get or create the shared bucket with this name
    pub fn shared(bucket: &str) -> Arc<Self> {
        let mut all = buckets().lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            all.entry(bucket.to_string())
                .or_insert_with(|| Arc::new(Self::new(bucket))),
        )
    }

    /// Drop the shared bucket with this name
    pub fn remove_shared(bucket: &str) -> bool {
        let mut all = buckets().lock().unwrap_or_else(|e| e.into_inner());
        all.remove(bucket).is_some()
    }

    /// Backend for a `mem://` address
    pub fn backend_for(url: &StorageUrl) -> Result<ObjectBackend<MemoryStore>> {
        if url.scheme() != Scheme::Memory {
            return Err(XcpError::UnsupportedScheme(url.scheme().to_string()));
        }
        Ok(ObjectBackend::new(Self::shared(url.root())))
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.read_objects().len()
    }

    /// Whether the bucket holds no objects
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw object body, if present
    pub fn object_data(&self, key: &str) -> Option<Vec<u8>> {
        self.read_objects().get(key).map(|o| o.data.as_ref().clone())
    }

    /// Number of multipart uploads started but neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.lock_uploads().len()
    }

    fn lock_uploads(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingUpload>> {
        self.uploads.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn no_such_upload(&self, key: &str, upload_id: &str) -> XcpError {
        XcpError::remote(
            format!("mem://{}/{}", self.bucket, key),
            format!("no such upload: {}", upload_id),
        )
    }

    fn read_objects(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn info(key: &str, object: &StoredObject) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            size: object.data.len() as u64,
            last_modified: object.last_modified,
            metadata: Some(object.metadata.clone()),
        }
    }
}

impl ObjectStore for MemoryStore {
    fn scheme(&self) -> Scheme {
        Scheme::Memory
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let objects = self.read_objects();
        let object = objects
            .get(key)
            .ok_or_else(|| XcpError::NotFound(format!("mem://{}/{}", self.bucket, key)))?;
        Ok(Box::new(Cursor::new(SharedBytes(Arc::clone(&object.data)))))
    }

    fn put(&self, key: &str, data: Vec<u8>, metadata: HashMap<String, String>) -> Result<()> {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        objects.insert(
            key.to_string(),
            StoredObject {
                data: Arc::new(data),
                last_modified: SystemTime::now(),
                metadata,
            },
        );
        Ok(())
    }

    fn head(&self, key: &str) -> Result<ObjectInfo> {
        let objects = self.read_objects();
        objects
            .get(key)
            .map(|o| Self::info(key, o))
            .ok_or_else(|| XcpError::NotFound(format!("mem://{}/{}", self.bucket, key)))
    }

    fn part_size(&self) -> usize {
        self.part_size
    }

    fn create_upload(&self, key: &str, metadata: HashMap<String, String>) -> Result<String> {
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::Relaxed));
        self.lock_uploads().insert(
            id.clone(),
            PendingUpload {
                key: key.to_string(),
                metadata,
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: u32,
        data: Vec<u8>,
    ) -> Result<UploadedPart> {
        let mut uploads = self.lock_uploads();
        let upload = uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| self.no_such_upload(key, upload_id))?;
        let etag = format!("{}-{}", upload_id, number);
        upload.parts.insert(number, data);
        Ok(UploadedPart { number, etag })
    }

    fn complete_upload(&self, key: &str, upload_id: &str, parts: Vec<UploadedPart>) -> Result<()> {
        let mut upload = self
            .lock_uploads()
            .remove(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| self.no_such_upload(key, upload_id))?;

        let mut data = Vec::new();
        for part in &parts {
            let body = upload.parts.remove(&part.number).ok_or_else(|| {
                XcpError::remote(key, format!("part {} was never uploaded", part.number))
            })?;
            data.extend_from_slice(&body);
        }

        self.put(key, data, upload.metadata)
    }

    fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.lock_uploads()
            .remove(upload_id)
            .filter(|u| u.key == key)
            .map(|_| ())
            .ok_or_else(|| self.no_such_upload(key, upload_id))
    }

    fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<&str>,
    ) -> Result<ListPage> {
        let objects = self.read_objects();
        let start = match token {
            Some(t) => Bound::Excluded(t.to_string()),
            None => Bound::Included(prefix.to_string()),
        };

        let mut page = ListPage::default();
        let mut last_key = None;
        let mut emitted = 0;

        for (key, object) in objects.range((start, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                break;
            }
            if emitted == self.page_size {
                page.next_token = last_key;
                return Ok(page);
            }

            let rest = &key[prefix.len()..];
            match delimiter.and_then(|d| rest.find(d).map(|i| i + d.len())) {
                Some(end) => {
                    let common = format!("{}{}", prefix, &rest[..end]);
                    if page.common_prefixes.last() != Some(&common) {
                        page.common_prefixes.push(common);
                        emitted += 1;
                    }
                }
                None => {
                    page.objects.push(Self::info(key, object));
                    emitted += 1;
                }
            }
            last_key = Some(key.clone());
        }

        Ok(page)
    }
}

/// Read-only view over a shared object body
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
