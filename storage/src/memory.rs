use std::collections::HashMap;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncReadExt, sync::RwLock};

use storage_driver::{Driver, Metadata, ReadStream, Reader, StorageError, StorageErrorKind};

#[derive(Debug, Clone)]
struct MemoryObject {
    created: DateTime<Utc>,
    data: Bytes,
}

impl From<Vec<u8>> for MemoryObject {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data: data.into(),
        }
    }
}

impl From<&MemoryObject> for Metadata {
    fn from(value: &MemoryObject) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

/// Storage driver that keeps objects in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<Utf8PathBuf, MemoryObject>>,
}

impl MemoryStorage {
    /// Create a new, empty `MemoryStorage` instance.
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(&self, path: &Utf8Path) -> StorageError {
        StorageError::new(
            self.name(),
            StorageErrorKind::NotFound,
            format!("object not found: {path}"),
        )
        .with_path(path.as_str())
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        let objects = self.objects.read().await;
        objects
            .get(path)
            .map(Metadata::from)
            .ok_or_else(|| self.not_found(path))
    }

    async fn upload(&self, path: &Utf8Path, reader: &mut Reader<'_>) -> Result<u64, StorageError> {
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|err| StorageError::io(self.name(), err).with_path(path.as_str()))?;

        let size = buf.len() as u64;
        let mut objects = self.objects.write().await;
        objects.insert(path.to_owned(), buf.into());
        Ok(size)
    }

    async fn open(&self, path: &Utf8Path) -> Result<ReadStream, StorageError> {
        let objects = self.objects.read().await;
        let object = objects.get(path).ok_or_else(|| self.not_found(path))?;
        Ok(Box::new(std::io::Cursor::new(object.data.clone())))
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let mut objects = self.objects.write().await;
        let object = objects.remove(from).ok_or_else(|| self.not_found(from))?;
        objects.insert(to.to_owned(), object);
        Ok(())
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let mut objects = self.objects.write().await;
        objects.remove(path).ok_or_else(|| self.not_found(path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_then_read() {
        let storage = MemoryStorage::new();
        let path = Utf8Path::new("blobs/sha256/abc");

        let mut reader: &[u8] = b"hello world";
        let written = storage.upload(path, &mut reader).await.unwrap();
        assert_eq!(written, 11);

        assert_eq!(storage.read(path).await.unwrap(), b"hello world");
        assert_eq!(storage.metadata(path).await.unwrap().size, 11);
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let storage = MemoryStorage::new();
        let path = Utf8Path::new("missing");

        let error = storage.metadata(path).await.unwrap_err();
        assert!(error.is_not_found());
        assert!(!storage.exists(path).await.unwrap());
        assert!(storage.open(path).await.is_err());
    }

    #[tokio::test]
    async fn rename_moves_object() {
        let storage = MemoryStorage::new();
        let mut reader: &[u8] = b"data";
        storage
            .upload(Utf8Path::new("uploads/1"), &mut reader)
            .await
            .unwrap();

        storage
            .rename(Utf8Path::new("uploads/1"), Utf8Path::new("blobs/1"))
            .await
            .unwrap();

        assert!(!storage.exists(Utf8Path::new("uploads/1")).await.unwrap());
        assert_eq!(storage.read(Utf8Path::new("blobs/1")).await.unwrap(), b"data");
    }
}
