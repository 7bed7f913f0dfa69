use std::{fmt, ops::Deref, sync::Arc};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io::{self, AsyncReadExt};

use crate::error::StorageError;

/// A buffered reader providing contents to upload.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + 'r;

/// An owned reader over stored contents, independent of the driver borrow.
pub type ReadStream = Box<dyn io::AsyncRead + Unpin + Send + 'static>;

/// File object metadata, which will be generically provided by the driver.
///
/// This struct only provides common metadata fields, and drivers may provide more specific
/// metadata fields directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// The creation timestamp of the object.
    pub created: DateTime<Utc>,
}

/// A storage driver, which provides the ability to interact with a storage backend.
///
/// Paths are relative and `/` separated. Objects written with [`Driver::upload`]
/// become visible to readers only once fully written, so a reader never observes
/// a partially written object.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug + Send + Sync {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Get the metadata for an object, by path.
    async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Store an object, using a reader stream to provide the contents.
    ///
    /// Returns the number of bytes written. Existing objects are replaced.
    async fn upload(&self, path: &Utf8Path, reader: &mut Reader<'_>) -> Result<u64, StorageError>;

    /// Open an object for streaming reads.
    async fn open(&self, path: &Utf8Path) -> Result<ReadStream, StorageError>;

    /// Move an object to a new path, replacing whatever was there.
    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError>;

    /// Delete an object from the storage, by path.
    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError>;

    /// Read an entire object into memory.
    async fn read(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        tracing::trace!(%path, "Reading object");
        let mut stream = self.open(path).await?;
        let mut buffer = Vec::new();
        stream
            .read_to_end(&mut buffer)
            .await
            .map_err(|err| StorageError::io(self.name(), err).with_path(path.as_str()))?;
        Ok(buffer)
    }

    /// Check whether an object exists.
    async fn exists(&self, path: &Utf8Path) -> Result<bool, StorageError> {
        match self.metadata(path).await {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(path).await
    }

    async fn upload(&self, path: &Utf8Path, reader: &mut Reader<'_>) -> Result<u64, StorageError> {
        self.deref().upload(path, reader).await
    }

    async fn open(&self, path: &Utf8Path) -> Result<ReadStream, StorageError> {
        self.deref().open(path).await
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.deref().rename(from, to).await
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);
    static_assertions::assert_impl_all!(Arc<dyn Driver>: Driver, Send, Sync);
}
