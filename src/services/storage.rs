use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Blob storage holding job inputs and results.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
}

/// Process-local object storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content type recorded at upload, if the object exists.
    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.content_type.clone())
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::Backend("object key must not be empty".to_string()));
        }
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.read().await.contains_key(key))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage operation failed: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_download_delete() {
        let storage = MemoryStorage::new();
        storage
            .upload("uploads/a.png", b"bytes", "image/png")
            .await
            .unwrap();

        assert!(storage.exists("uploads/a.png").await.unwrap());
        assert_eq!(storage.download("uploads/a.png").await.unwrap(), b"bytes");
        assert_eq!(
            storage.content_type("uploads/a.png").await.as_deref(),
            Some("image/png")
        );

        storage.delete("uploads/a.png").await.unwrap();
        storage.delete("uploads/a.png").await.unwrap();
        assert!(!storage.exists("uploads/a.png").await.unwrap());
    }

    #[tokio::test]
    async fn test_download_missing_object() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            storage.download("nope").await,
            Err(StorageError::NotFound(key)) if key == "nope"
        ));
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            storage.upload("", b"x", "image/png").await,
            Err(StorageError::Backend(_))
        ));
    }
}
