//! Content-addressed object storage for captured images.
//!
//! Keys are derived from request semantics, so an object at a key is
//! immutable in meaning. Writes land at a temporary name and are renamed
//! into place; a reader never observes a partially written object.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::{
    cache_key::StorageKey,
    error::{CaptureError, Result},
};

#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Stores `bytes` at `key` and returns the object's public URL.
    async fn put(&self, key: &StorageKey, bytes: Vec<u8>, content_type: &str) -> Result<String>;

    async fn exists(&self, key: &StorageKey) -> Result<bool>;

    fn public_url(&self, key: &StorageKey) -> String;
}

fn join_url(base: &str, key: &StorageKey) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key.as_str())
}

/// Objects written under a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    public_base: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &StorageKey) -> Result<PathBuf> {
        let relative = Path::new(key.as_str());
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(CaptureError::Storage(format!(
                "refusing to write outside the store: {key}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &StorageKey, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let path = self.path_for(key)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).await?;

        let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let write = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &path).await
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&tmp).await;
            return Err(CaptureError::Storage(format!(
                "failed to write {}: {err}",
                path.display()
            )));
        }

        debug!(key = %key, content_type, size = bytes.len(), "object stored");
        Ok(self.public_url(key))
    }

    async fn exists(&self, key: &StorageKey) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    fn public_url(&self, key: &StorageKey) -> String {
        join_url(&self.public_base, key)
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Objects held in process memory.
#[derive(Debug, Clone)]
pub struct InMemoryObjectStore {
    public_base: String,
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new("memory://artifacts")
    }
}

impl InMemoryObjectStore {
    pub fn new(public_base: impl Into<String>) -> Self {
        Self {
            public_base: public_base.into(),
            objects: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn object(&self, key: &StorageKey) -> Option<StoredObject> {
        self.objects.lock().await.get(key.as_str()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &StorageKey, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        self.objects.lock().await.insert(
            key.as_str().to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(self.public_url(key))
    }

    async fn exists(&self, key: &StorageKey) -> Result<bool> {
        Ok(self.objects.lock().await.contains_key(key.as_str()))
    }

    fn public_url(&self, key: &StorageKey) -> String {
        join_url(&self.public_base, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::CaptureRequest;

    fn key() -> StorageKey {
        StorageKey::for_request(
            &CaptureRequest::new("https://example.com").with_full_page(true),
        )
    }

    #[tokio::test]
    async fn local_store_writes_and_reports_existence() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "http://localhost:3000/artifacts/");
        let key = key();

        assert!(!store.exists(&key).await.unwrap());
        let url = store
            .put(&key, vec![1, 2, 3], "image/jpeg")
            .await
            .unwrap();

        assert_eq!(url, format!("http://localhost:3000/artifacts/{key}"));
        assert!(store.exists(&key).await.unwrap());
        let on_disk = std::fs::read(dir.path().join(key.as_str())).unwrap();
        assert_eq!(on_disk, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn overwrite_replaces_whole_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "/artifacts");
        let key = key();

        store.put(&key, vec![9; 64], "image/jpeg").await.unwrap();
        store.put(&key, vec![7; 8], "image/jpeg").await.unwrap();

        let on_disk = std::fs::read(dir.path().join(key.as_str())).unwrap();
        assert_eq!(on_disk, vec![7; 8]);

        let parent = dir.path().join(key.as_str());
        let leftovers = std::fs::read_dir(parent.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = InMemoryObjectStore::default();
        let key = key();
        store.put(&key, vec![1], "image/jpeg").await.unwrap();
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(store.object(&key).await.unwrap().content_type, "image/jpeg");
    }
}
