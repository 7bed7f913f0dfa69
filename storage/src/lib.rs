//! # Storage backends
//!
//! Configuration and unification for the storage backends.

use std::sync::Arc;

use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[doc(inline)]
pub use storage_driver::{Driver, Metadata, ReadStream, StorageError, StorageErrorKind};

/// Selects and configures a storage backend.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep everything in process memory.
    Memory,

    /// Keep objects in a directory on the local filesystem.
    #[cfg(feature = "local")]
    Local {
        /// Root directory for stored objects.
        path: Utf8PathBuf,
    },
}

impl StorageConfig {
    /// Construct the configured backend.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory => MemoryStorage::new().into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => {
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|err| StorageError::io("local", err).with_path(path.as_str()))?;
                LocalDriver::new(path).into()
            }
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver>;

/// A cloneable handle to a storage backend.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// Get metadata for a stored object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(remote).await
    }

    /// Check whether an object exists.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn exists(&self, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.driver.exists(remote).await
    }

    /// Store an object from a buffered reader, returning the number of bytes written.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name()))]
    pub async fn upload<R>(&self, remote: &Utf8Path, reader: &mut R) -> Result<u64, StorageError>
    where
        R: tokio::io::AsyncBufRead + Unpin + Send,
    {
        tracing::trace!(%remote, "Uploading to: {remote}");
        self.driver.upload(remote, reader).await
    }

    /// Store an object from an in-memory buffer.
    pub async fn write(&self, remote: &Utf8Path, data: &[u8]) -> Result<u64, StorageError> {
        let mut reader = data;
        self.upload(remote, &mut reader).await
    }

    /// Open an object for streaming reads.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn open(&self, remote: &Utf8Path) -> Result<ReadStream, StorageError> {
        self.driver.open(remote).await
    }

    /// Read an entire object into memory.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn read(&self, remote: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        self.driver.read(remote).await
    }

    /// Move an object to a new path.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.driver.rename(from, to).await
    }

    /// Delete an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(remote).await
    }
}

impl Default for Storage {
    fn default() -> Self {
        MemoryStorage::new().into()
    }
}
