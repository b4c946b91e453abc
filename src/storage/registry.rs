//! Scheme to backend mapping

use crate::error::{Result, XcpError};
use crate::storage::{Backend, LocalBackend, MemoryStore, Scheme, StorageUrl};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Constructor for a backend serving one scheme
pub type BackendFactory = fn(&StorageUrl) -> Result<Arc<dyn Backend>>;

/// Maps storage schemes to backend constructors
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<Scheme, BackendFactory>,
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend compiled into this build
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Scheme::Local, open_local);
        registry.register(Scheme::Memory, open_memory);
        #[cfg(feature = "native_s3")]
        registry.register(Scheme::S3, crate::storage::s3::open_s3);
        registry
    }

    /// Register (or replace) the constructor for a scheme
    pub fn register(&mut self, scheme: Scheme, factory: BackendFactory) -> &mut Self {
        self.factories.insert(scheme, factory);
        self
    }

    /// Whether a constructor is registered for `scheme`
    pub fn supports(&self, scheme: Scheme) -> bool {
        self.factories.contains_key(&scheme)
    }

    /// Construct the backend serving `url`
    pub fn open(&self, url: &StorageUrl) -> Result<Arc<dyn Backend>> {
        let factory = self.factories.get(&url.scheme()).ok_or_else(|| {
            XcpError::UnsupportedScheme(format!(
                "{} (not enabled in this build)",
                url.scheme()
            ))
        })?;
        tracing::debug!("Opening {} backend for {}", url.scheme(), url);
        factory(url)
    }
}

fn open_local(url: &StorageUrl) -> Result<Arc<dyn Backend>> {
    Ok(Arc::new(LocalBackend::from_url(url)?))
}

fn open_memory(url: &StorageUrl) -> Result<Arc<dyn Backend>> {
    Ok(Arc::new(MemoryStore::backend_for(url)?))
}

/// Process-wide default registry
pub fn default_registry() -> &'static BackendRegistry {
    static REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();
    REGISTRY.get_or_init(BackendRegistry::with_defaults)
}

/// Construct the backend for `url` through the default registry
pub fn open_backend(url: &StorageUrl) -> Result<Arc<dyn Backend>> {
    default_registry().open(url)
}
