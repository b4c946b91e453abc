//! Native AWS S3 object store
//!
//! Drives the AWS SDK from synchronous transfer workers through an owned
//! multi-threaded tokio runtime. Supports S3-compatible endpoints (MinIO,
//! Ceph), part-by-part multipart uploads and exponential backoff retry. Credentials come
//! from the standard AWS chain or the environment.

use crate::error::{Result, XcpError};
use crate::storage::{
    Backend, ListPage, ObjectBackend, ObjectInfo, ObjectStore, Scheme, StorageUrl, UploadedPart,
};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use std::collections::HashMap;
use std::future::Future;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Maximum retry delay cap in seconds.
const MAX_RETRY_DELAY_SECS: u64 = 64;

/// Configuration for the S3 store.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// AWS region (e.g., "us-east-1")
    pub region: String,
    /// Custom endpoint URL for S3-compatible services (MinIO, Wasabi)
    pub endpoint_url: Option<String>,
    /// Maximum number of retries per request
    pub max_retries: u32,
    /// Force path-style access (required for some S3-compatible services)
    pub force_path_style: bool,
    /// Access key ID (optional, falls back to AWS credential chain)
    pub access_key_id: Option<String>,
    /// Secret access key (optional, falls back to AWS credential chain)
    pub secret_access_key: Option<String>,
    /// Keys per listing page
    pub page_size: i32,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            max_retries: 3,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
            page_size: 1000,
        }
    }
}

impl S3Config {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            region: std::env::var("AWS_REGION")
                .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
                .unwrap_or_else(|_| "us-east-1".to_string()),
            endpoint_url: std::env::var("AWS_ENDPOINT_URL")
                .ok()
                .or_else(|| std::env::var("S3_ENDPOINT").ok()),
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
            force_path_style: std::env::var("S3_PATH_STYLE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            ..Default::default()
        }
    }
}

/// S3 bucket client
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    config: S3Config,
    runtime: tokio::runtime::Runtime,
}

impl S3Store {
    /// Connect to `bucket` with the given configuration
    pub fn connect(bucket: impl Into<String>, config: S3Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("xcp-s3")
            .build()
            .map_err(|e| XcpError::config(format!("Failed to create runtime: {}", e)))?;

        let client = runtime.block_on(build_client(&config));

        Ok(Self {
            client,
            bucket: bucket.into(),
            config,
            runtime,
        })
    }

    /// Run a request, retrying recoverable failures with exponential backoff
    fn with_retry<T, F, Fut>(&self, key: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.runtime.block_on(async {
            let mut retries = 0;
            loop {
                match op().await {
                    Ok(value) => return Ok(value),
                    Err(e) if e.is_recoverable() && retries < self.config.max_retries => {
                        retries += 1;
                        let delay = exponential_backoff_delay(retries);
                        tracing::warn!(
                            "S3 request for {} failed (attempt {}/{}): {}. Retrying in {:?}",
                            key,
                            retries,
                            self.config.max_retries,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }

    async fn put_simple(
        &self,
        key: &str,
        data: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata(Some(metadata.clone()))
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| map_sdk_error(key, "put_object", e))?;
        Ok(())
    }

}

async fn build_client(config: &S3Config) -> aws_sdk_s3::Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()));

    if let Some(ref endpoint) = config.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }

    if let (Some(ref key_id), Some(ref secret)) = (&config.access_key_id, &config.secret_access_key)
    {
        let creds = aws_credential_types::Credentials::new(key_id, secret, None, None, "xcp-static");
        loader = loader.credentials_provider(creds);
    }

    let shared = loader.load().await;
    let mut s3_config = aws_sdk_s3::config::Builder::from(&shared);
    if config.force_path_style {
        s3_config = s3_config.force_path_style(true);
    }
    aws_sdk_s3::Client::from_conf(s3_config.build())
}

impl ObjectStore for S3Store {
    fn scheme(&self) -> Scheme {
        Scheme::S3
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let bytes = self.with_retry(key, || async {
            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| map_sdk_error(key, "get_object", e))?;
            let body = resp
                .body
                .collect()
                .await
                .map_err(|e| XcpError::remote(key, format!("body read failed: {}", e)))?;
            Ok(body.into_bytes())
        })?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn put(&self, key: &str, data: Vec<u8>, metadata: HashMap<String, String>) -> Result<()> {
        self.with_retry(key, || self.put_simple(key, &data, &metadata))
    }

    fn create_upload(&self, key: &str, metadata: HashMap<String, String>) -> Result<String> {
        let metadata = &metadata;
        self.with_retry(key, || async move {
            let create = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .set_metadata(Some(metadata.clone()))
                .send()
                .await
                .map_err(|e| map_sdk_error(key, "create_multipart_upload", e))?;

            create
                .upload_id()
                .map(str::to_string)
                .ok_or_else(|| XcpError::remote(key, "missing upload_id"))
        })
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: u32,
        data: Vec<u8>,
    ) -> Result<UploadedPart> {
        let data = &data;
        self.with_retry(key, || async move {
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(number as i32)
                .body(ByteStream::from(data.clone()))
                .send()
                .await
                .map_err(|e| map_sdk_error(key, "upload_part", e))?;

            Ok(UploadedPart {
                number,
                etag: uploaded.e_tag().unwrap_or_default().to_string(),
            })
        })
    }

    fn complete_upload(&self, key: &str, upload_id: &str, parts: Vec<UploadedPart>) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|part| {
                        CompletedPart::builder()
                            .part_number(part.number as i32)
                            .e_tag(part.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();
        let completed = &completed;

        self.with_retry(key, || async move {
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .multipart_upload(completed.clone())
                .send()
                .await
                .map_err(|e| map_sdk_error(key, "complete_multipart_upload", e))?;
            Ok(())
        })
    }

    fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.with_retry(key, || async move {
            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await
                .map_err(|e| map_sdk_error(key, "abort_multipart_upload", e))?;
            Ok(())
        })
    }

    fn head(&self, key: &str) -> Result<ObjectInfo> {
        self.with_retry(key, || async {
            let head = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| map_sdk_error(key, "head_object", e))?;
            Ok(ObjectInfo {
                key: key.to_string(),
                size: head.content_length().unwrap_or(0).max(0) as u64,
                last_modified: head
                    .last_modified()
                    .and_then(|t| SystemTime::try_from(*t).ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH),
                metadata: Some(head.metadata().cloned().unwrap_or_default()),
            })
        })
    }

    fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<&str>,
    ) -> Result<ListPage> {
        self.with_retry(prefix, || async {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .max_keys(self.config.page_size)
                .set_delimiter(delimiter.map(str::to_string))
                .set_continuation_token(token.map(str::to_string))
                .send()
                .await
                .map_err(|e| map_sdk_error(prefix, "list_objects_v2", e))?;

            let objects = response
                .contents()
                .iter()
                .filter_map(|obj| {
                    let key = obj.key()?;
                    Some(ObjectInfo {
                        key: key.to_string(),
                        size: obj.size().unwrap_or(0).max(0) as u64,
                        last_modified: obj
                            .last_modified()
                            .and_then(|t| SystemTime::try_from(*t).ok())
                            .unwrap_or(SystemTime::UNIX_EPOCH),
                        // Listings do not carry user metadata
                        metadata: None,
                    })
                })
                .collect();

            let common_prefixes = response
                .common_prefixes()
                .iter()
                .filter_map(|cp| cp.prefix().map(str::to_string))
                .collect();

            let next_token = if response.is_truncated() == Some(true) {
                response.next_continuation_token().map(str::to_string)
            } else {
                None
            };

            Ok(ListPage {
                objects,
                common_prefixes,
                next_token,
            })
        })
    }
}

/// Backend constructor registered for `s3://`
pub fn open_s3(url: &StorageUrl) -> Result<Arc<dyn Backend>> {
    if url.scheme() != Scheme::S3 {
        return Err(XcpError::UnsupportedScheme(url.scheme().to_string()));
    }
    let store = S3Store::connect(url.root(), S3Config::from_env())?;
    Ok(Arc::new(ObjectBackend::new(Arc::new(store))))
}

fn map_sdk_error<E, R>(key: &str, op: &str, err: SdkError<E, R>) -> XcpError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    let status = match &err {
        SdkError::ServiceError(e) => Some(format!("{:?}", e.raw())),
        _ => None,
    };
    let code = err.code().map(str::to_string);

    match code.as_deref() {
        Some("NoSuchKey") | Some("NotFound") | Some("NoSuchBucket") => {
            XcpError::NotFound(key.to_string())
        }
        Some("AccessDenied") | Some("Forbidden") => XcpError::PermissionDenied(key.to_string()),
        _ => {
            let raw = status.unwrap_or_default();
            if raw.contains("status: 404") || raw.contains("StatusCode(404)") {
                XcpError::NotFound(key.to_string())
            } else if raw.contains("status: 403") || raw.contains("StatusCode(403)") {
                XcpError::PermissionDenied(key.to_string())
            } else {
                XcpError::remote(key, format!("S3 {} failed: {:?}", op, err))
            }
        }
    }
}

/// Calculate exponential backoff delay: 2^retries seconds, capped at MAX_RETRY_DELAY_SECS.
fn exponential_backoff_delay(retries: u32) -> Duration {
    let secs = (1u64 << retries.min(16)).min(MAX_RETRY_DELAY_SECS);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = S3Config::default();
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.max_retries, 3);
        assert!(!config.force_path_style);
    }

    #[test]
    fn test_exponential_backoff() {
        assert_eq!(exponential_backoff_delay(1), Duration::from_secs(2));
        assert_eq!(exponential_backoff_delay(3), Duration::from_secs(8));
        assert_eq!(exponential_backoff_delay(10), Duration::from_secs(64));
    }
}
