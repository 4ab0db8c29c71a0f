//! In-memory object URLs.
//!
//! Uploaded bytes are registered under a `blob:<uuid>` URL that records can
//! hold instead of the bytes themselves. The URL stays resolvable until it is
//! revoked; revoking does not affect documents that were already opened.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub const BLOB_SCHEME: &str = "blob:";

/// Shared table of object URLs. Clones refer to the same table.
#[derive(Debug, Clone, Default)]
pub struct BlobStore {
    entries: Arc<RwLock<HashMap<String, Arc<[u8]>>>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `bytes` and returns a fresh `blob:` URL for them.
    pub fn create_object_url(&self, bytes: impl Into<Arc<[u8]>>) -> String {
        let url = format!("{BLOB_SCHEME}{}", uuid::Uuid::new_v4());
        self.entries.write().insert(url.clone(), bytes.into());
        url
    }

    /// Releases the bytes behind `url`. Returns `false` if the URL was unknown
    /// or already revoked.
    pub fn revoke_object_url(&self, url: &str) -> bool {
        self.entries.write().remove(url).is_some()
    }

    pub fn resolve(&self, url: &str) -> Option<Arc<[u8]>> {
        self.entries.read().get(url).cloned()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.read().contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

pub fn is_blob_url(url: &str) -> bool {
    url.starts_with(BLOB_SCHEME)
}
