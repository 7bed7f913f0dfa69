use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;

use storage_driver::{Driver, Metadata, ReadStream, Reader, StorageError, StorageErrorKind};

/// Storage driver backed by a directory on the local filesystem.
///
/// Uploads are written to a uniquely named `.partial` file next to the
/// destination and renamed into place once complete.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`. The directory is created on first write.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    /// The directory holding all objects.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        let acceptable = remote
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)));
        if !acceptable || remote.as_str().is_empty() {
            return Err(StorageError::new(
                self.name(),
                StorageErrorKind::InvalidPath,
                format!("path must be relative and stay within the storage root: {remote}"),
            )
            .with_path(remote.as_str()));
        }
        Ok(self.root.join(remote))
    }

    fn io(&self, remote: &Utf8Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
        let path = remote.to_string();
        move |err| StorageError::io(self.name(), err).with_path(path)
    }

    async fn create_parent(&self, target: &Utf8Path, remote: &Utf8Path) -> Result<(), StorageError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(self.io(remote))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let target = self.path(remote)?;
        let metadata = tokio::fs::metadata(&target)
            .await
            .map_err(self.io(remote))?;
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(self.io(remote))?;
        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn upload(&self, remote: &Utf8Path, reader: &mut Reader<'_>) -> Result<u64, StorageError> {
        let target = self.path(remote)?;
        self.create_parent(&target, remote).await?;

        let partial = Utf8PathBuf::from(format!(
            "{target}.{}.partial",
            uuid::Uuid::new_v4().simple()
        ));

        let written = async {
            let mut writer = tokio::io::BufWriter::new(tokio::fs::File::create(&partial).await?);
            let written = tokio::io::copy_buf(reader, &mut writer).await?;
            writer.shutdown().await?;
            tokio::fs::rename(&partial, &target).await?;
            Ok::<_, std::io::Error>(written)
        }
        .await;

        match written {
            Ok(written) => Ok(written),
            Err(err) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    tracing::trace!(%partial, "Partial upload not removed: {cleanup}");
                }
                Err(self.io(remote)(err))
            }
        }
    }

    async fn open(&self, remote: &Utf8Path) -> Result<ReadStream, StorageError> {
        let target = self.path(remote)?;
        let file = tokio::fs::File::open(&target)
            .await
            .map_err(self.io(remote))?;
        Ok(Box::new(file))
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let source = self.path(from)?;
        let target = self.path(to)?;
        self.create_parent(&target, to).await?;
        tokio::fs::rename(&source, &target)
            .await
            .map_err(self.io(from))
    }

    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        let target = self.path(remote)?;
        tokio::fs::remove_file(&target)
            .await
            .map_err(self.io(remote))
    }
}
