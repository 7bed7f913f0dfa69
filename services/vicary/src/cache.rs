//! Content-addressed artifact cache.
//!
//! Bytes are stored once per digest under `blobs/sha256/<hex>` or
//! `manifests/sha256/<hex>`. Each cache key additionally has a small JSON
//! record under `records/` pointing at those bytes, so that a restarted
//! gateway can serve what it stored before. Incoming bytes are written to
//! `uploads/<uuid>` while being hashed, and moved into place only after the
//! digest checks out.

use std::fmt;
use std::future::Future;
use std::io;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use echocache::{BoxFut, CacheMap, Fresh};
use serde::{Deserialize, Serialize};
use storage::{ReadStream, Storage, StorageError, StorageErrorKind};
use tokio::io::BufReader;

use crate::digest::{Digest, DigestReader};
use crate::error::RegistryError;
use crate::manifest::Accept;
use crate::resolve::Reference;

/// Identifies one cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// A manifest, addressed within one upstream's repository.
    Manifest {
        /// Upstream id.
        upstream: String,
        /// Canonical repository name.
        repository: String,
        /// Tag or digest.
        reference: Reference,
        /// Media types a tag was resolved for. Digests name fixed content and
        /// carry none.
        accept: Option<Accept>,
    },
    /// A blob. Blobs are shared across repositories and upstreams.
    Blob(Digest),
}

impl CacheKey {
    /// Key for a manifest served to clients taking `accept`.
    pub fn manifest(
        upstream: impl Into<String>,
        repository: impl Into<String>,
        reference: Reference,
        accept: &Accept,
    ) -> Self {
        let accept = matches!(reference, Reference::Tag(_)).then(|| accept.clone());
        CacheKey::Manifest {
            upstream: upstream.into(),
            repository: repository.into(),
            reference,
            accept,
        }
    }

    /// The digest the stored bytes must have, when the key names one.
    pub fn expected_digest(&self) -> Option<&Digest> {
        match self {
            CacheKey::Manifest { reference, .. } => reference.digest(),
            CacheKey::Blob(digest) => Some(digest),
        }
    }

    /// Content-addressed keys never go stale.
    fn is_permanent(&self) -> bool {
        self.expected_digest().is_some()
    }

    fn object_prefix(&self) -> &'static str {
        match self {
            CacheKey::Manifest { .. } => "manifests",
            CacheKey::Blob(_) => "blobs",
        }
    }

    fn record_path(&self) -> Utf8PathBuf {
        match self {
            CacheKey::Blob(digest) => format!(
                "records/blobs/{}/{}.json",
                digest.algorithm(),
                digest.hex()
            ),
            CacheKey::Manifest {
                upstream,
                repository,
                reference: Reference::Tag(tag),
                accept,
            } => format!(
                "records/manifests/{upstream}/{repository}/_tags/{tag}/{}.json",
                accept.as_ref().map(Accept::fingerprint).unwrap_or_else(|| "any".into())
            ),
            CacheKey::Manifest {
                upstream,
                repository,
                reference: Reference::Digest(digest),
                ..
            } => format!(
                "records/manifests/{upstream}/{repository}/_digests/{}/{}.json",
                digest.algorithm(),
                digest.hex()
            ),
        }
        .into()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Manifest {
                upstream,
                repository,
                reference,
                ..
            } => write!(f, "manifest {upstream}/{repository}:{reference}"),
            CacheKey::Blob(digest) => write!(f, "blob {digest}"),
        }
    }
}

/// A committed artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The key this entry was stored under.
    pub key: CacheKey,
    /// Size of the stored bytes.
    pub size: u64,
    /// Content type served to clients.
    pub content_type: String,
    /// When the bytes were fetched.
    pub stored_at: DateTime<Utc>,
    /// Digest of the stored bytes.
    pub digest: Digest,
}

impl CacheEntry {
    fn object_path(&self) -> Utf8PathBuf {
        format!(
            "{}/{}/{}",
            self.key.object_prefix(),
            self.digest.algorithm(),
            self.digest.hex()
        )
        .into()
    }

    fn record(&self) -> EntryRecord {
        EntryRecord {
            size: self.size,
            content_type: self.content_type.clone(),
            stored_at: self.stored_at,
            digest: self.digest.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct EntryRecord {
    size: u64,
    content_type: String,
    stored_at: DateTime<Utc>,
    digest: Digest,
}

impl EntryRecord {
    fn into_entry(self, key: CacheKey) -> CacheEntry {
        CacheEntry {
            key,
            size: self.size,
            content_type: self.content_type,
            stored_at: self.stored_at,
            digest: self.digest,
        }
    }
}

/// The response of an upstream fetch, ready to be stored.
pub struct Fetched {
    /// Response body.
    pub body: ReadStream,
    /// Content type to serve the artifact with.
    pub content_type: String,
    /// Id of the upstream the body comes from.
    pub upstream: String,
}

impl fmt::Debug for Fetched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetched")
            .field("content_type", &self.content_type)
            .field("upstream", &self.upstream)
            .finish_non_exhaustive()
    }
}

/// The artifact cache.
///
/// At most one fetch runs per key. Callers arriving while a fetch is
/// running wait for its outcome; a failed fetch stores nothing.
#[derive(Debug, Clone)]
pub struct CacheStore {
    storage: Storage,
    entries: CacheMap<CacheKey, CacheEntry, RegistryError>,
    manifest_ttl: Option<Duration>,
}

impl CacheStore {
    /// Create a cache over `storage`. Tag-addressed manifests are served for
    /// `manifest_ttl` before being fetched again; `None` keeps them until
    /// invalidated.
    pub fn new(storage: Storage, manifest_ttl: Option<Duration>) -> Self {
        Self {
            storage,
            entries: CacheMap::new(),
            manifest_ttl,
        }
    }

    /// Get the entry for `key`, running `fetch` to populate it on a miss.
    ///
    /// `fetch` runs on a detached task, so it completes even if every caller
    /// stops waiting.
    #[tracing::instrument(skip(self, key, fetch), fields(%key))]
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: CacheKey,
        fetch: F,
    ) -> Result<CacheEntry, RegistryError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Fetched, RegistryError>> + Send + 'static,
    {
        let store = self.clone();
        let populate_key = key.clone();
        self.entries
            .get_or_fetch(
                key,
                move || -> BoxFut<'static, Result<Fresh<CacheEntry>, RegistryError>> {
                    Box::pin(store.populate(populate_key, fetch))
                },
            )
            .await
    }

    async fn populate<F, Fut>(
        self,
        key: CacheKey,
        fetch: F,
    ) -> Result<Fresh<CacheEntry>, RegistryError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Fetched, RegistryError>> + Send + 'static,
    {
        if let Some(entry) = self.load(&key).await? {
            if let Some(fresh) = self.freshness(entry) {
                tracing::debug!(%key, "Serving stored record");
                return Ok(fresh);
            }
        }

        tracing::debug!(%key, "Fetching from upstream");
        let fetched = fetch().await?;
        let entry = self.commit(key, fetched).await?;
        if let CacheKey::Manifest {
            upstream,
            repository,
            reference: Reference::Tag(_),
            ..
        } = &entry.key
        {
            self.alias_digest(upstream, repository, &entry).await;
        }

        let now = Instant::now();
        Ok(self
            .freshness(entry.clone())
            .unwrap_or_else(|| Fresh::until(entry, now)))
    }

    /// Read the persisted record for `key`, if its bytes are still present.
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, RegistryError> {
        let path = key.record_path();
        let data = match self.storage.read(&path).await {
            Ok(data) => data,
            Err(error) if error.is_not_found() => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let record: EntryRecord = match serde_json::from_slice(&data) {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(%key, %path, "Ignoring unreadable record: {error}");
                return Ok(None);
            }
        };

        let entry = record.into_entry(key.clone());
        if !self.storage.exists(&entry.object_path()).await? {
            tracing::debug!(%key, "Record points at missing bytes");
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// How long `entry` stays servable, or `None` if it already expired.
    fn freshness(&self, entry: CacheEntry) -> Option<Fresh<CacheEntry>> {
        if entry.key.is_permanent() {
            return Some(Fresh::forever(entry));
        }
        let Some(ttl) = self.manifest_ttl else {
            return Some(Fresh::forever(entry));
        };
        let age = (Utc::now() - entry.stored_at).to_std().unwrap_or_default();
        let remaining = ttl.checked_sub(age)?;
        if remaining.is_zero() {
            return None;
        }
        Some(Fresh::until(entry, Instant::now() + remaining))
    }

    /// Stream `fetched` into storage, verify it, and record it under `key`.
    async fn commit(&self, key: CacheKey, fetched: Fetched) -> Result<CacheEntry, RegistryError> {
        let staging = Utf8PathBuf::from(format!("uploads/{}", uuid::Uuid::new_v4()));
        let mut reader = BufReader::new(DigestReader::new(fetched.body));

        let size = match self.storage.upload(&staging, &mut reader).await {
            Ok(size) => size,
            Err(error) => {
                self.discard(&staging).await;
                return Err(match reader.get_ref().failure() {
                    Some((io::ErrorKind::TimedOut, _)) => {
                        RegistryError::UpstreamTimeout(fetched.upstream)
                    }
                    Some((_, reason)) => RegistryError::UpstreamUnavailable {
                        upstream: fetched.upstream,
                        reason: format!("reading response body: {reason}"),
                    },
                    None => error.into(),
                });
            }
        };

        let actual = reader.get_ref().digest();
        if let Some(expected) = key.expected_digest() {
            if *expected != actual {
                self.discard(&staging).await;
                tracing::error!(
                    %key,
                    %expected,
                    %actual,
                    upstream = %fetched.upstream,
                    "Digest mismatch, discarding fetched content"
                );
                return Err(RegistryError::DigestMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let entry = CacheEntry {
            key,
            size,
            content_type: fetched.content_type,
            stored_at: Utc::now(),
            digest: actual,
        };

        if let Err(error) = self.storage.rename(&staging, &entry.object_path()).await {
            self.discard(&staging).await;
            return Err(error.into());
        }
        self.write_record(&entry).await?;

        tracing::debug!(key = %entry.key, size, digest = %entry.digest, "Stored");
        Ok(entry)
    }

    async fn write_record(&self, entry: &CacheEntry) -> Result<(), RegistryError> {
        let record = serde_json::to_vec(&entry.record())
            .map_err(StorageError::with("json", StorageErrorKind::Other))?;
        self.storage
            .write(&entry.key.record_path(), &record)
            .await?;
        Ok(())
    }

    /// Make a manifest fetched by tag reachable by its digest as well.
    async fn alias_digest(&self, upstream: &str, repository: &str, entry: &CacheEntry) {
        let alias = CacheEntry {
            key: CacheKey::manifest(
                upstream,
                repository,
                Reference::Digest(entry.digest.clone()),
                &Accept::default(),
            ),
            ..entry.clone()
        };
        match self.write_record(&alias).await {
            Ok(()) => self.entries.insert(alias.key.clone(), Fresh::forever(alias)),
            Err(error) => tracing::warn!(key = %alias.key, "Digest record not written: {error}"),
        }
    }

    async fn discard(&self, staging: &Utf8PathBuf) {
        if let Err(error) = self.storage.delete(staging).await {
            if !error.is_not_found() {
                tracing::warn!(%staging, "Staged upload not removed: {error}");
            }
        }
    }

    /// True when the stored bytes of an entry are present.
    pub async fn contains(&self, entry: &CacheEntry) -> Result<bool, RegistryError> {
        Ok(self.storage.exists(&entry.object_path()).await?)
    }

    /// Open the stored bytes of an entry. Returns `None` when they are gone.
    pub async fn open(&self, entry: &CacheEntry) -> Result<Option<ReadStream>, RegistryError> {
        match self.storage.open(&entry.object_path()).await {
            Ok(stream) => Ok(Some(stream)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Forget `key`, so that the next request fetches it again.
    ///
    /// Stored bytes are left in place; only the record pointing at them is
    /// removed. Returns true if an entry was cached in memory.
    #[tracing::instrument(skip(self, key), fields(%key))]
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool, RegistryError> {
        let cached = self.entries.invalidate(key);
        match self.storage.delete(&key.record_path()).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error.into()),
        }
        tracing::debug!(cached, "Invalidated");
        Ok(cached)
    }

    /// The cached entry for `key`, without fetching.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use camino::Utf8Path;
    use storage::MemoryStorage;
    use tokio::io::AsyncReadExt;

    use super::*;

    const BLOB: &[u8] = b"layer contents";

    fn fetched(data: &'static [u8]) -> Fetched {
        Fetched {
            body: Box::new(data),
            content_type: "application/octet-stream".into(),
            upstream: "docker.io".into(),
        }
    }

    fn counting(
        calls: &Arc<AtomicUsize>,
        data: &'static [u8],
    ) -> impl FnOnce() -> BoxFut<'static, Result<Fetched, RegistryError>> + Send + 'static {
        let calls = calls.clone();
        move || -> BoxFut<'static, Result<Fetched, RegistryError>> {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(fetched(data)) })
        }
    }

    async fn read(store: &CacheStore, entry: &CacheEntry) -> Vec<u8> {
        let mut stream = store.open(entry).await.unwrap().expect("bytes present");
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    fn tag_key(tag: &str) -> CacheKey {
        CacheKey::manifest(
            "docker.io",
            "library/python",
            Reference::Tag(tag.into()),
            &Accept::default(),
        )
    }

    #[tokio::test]
    async fn blobs_are_fetched_once() {
        let store = CacheStore::new(MemoryStorage::new().into(), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::Blob(Digest::sha256_of(BLOB));

        let first = store
            .get_or_fetch(key.clone(), counting(&calls, BLOB))
            .await
            .unwrap();
        let second = store
            .get_or_fetch(key.clone(), counting(&calls, BLOB))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(first.size, BLOB.len() as u64);
        assert_eq!(read(&store, &first).await, BLOB);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_fetch() {
        let store = CacheStore::new(MemoryStorage::new().into(), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::Blob(Digest::sha256_of(BLOB));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    store
                        .get_or_fetch(key, move || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            async move {
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                Ok(fetched(BLOB))
                            }
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().size, BLOB.len() as u64);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn digest_mismatch_stores_nothing() {
        let storage: Storage = MemoryStorage::new().into();
        let store = CacheStore::new(storage.clone(), None);
        let key = CacheKey::Blob(Digest::sha256_of(b"what was asked for"));

        let err = store
            .get_or_fetch(key.clone(), || async { Ok(fetched(b"something else")) })
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
        assert!(store.peek(&key).is_none());
        assert!(!storage.exists(&key.record_path()).await.unwrap());
        let stray = CacheEntry {
            key: key.clone(),
            size: 0,
            content_type: String::new(),
            stored_at: Utc::now(),
            digest: Digest::sha256_of(b"something else"),
        };
        assert!(store.open(&stray).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_body_is_upstream_unavailable() {
        let store = CacheStore::new(MemoryStorage::new().into(), None);
        let key = CacheKey::Blob(Digest::sha256_of(BLOB));

        let err = store
            .get_or_fetch(key, || async {
                let body = tokio_util::io::StreamReader::new(futures::stream::iter(vec![
                    Ok(bytes::Bytes::from_static(b"partial")),
                    Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
                ]));
                Ok(Fetched {
                    body: Box::new(body),
                    content_type: "application/octet-stream".into(),
                    upstream: "docker.io".into(),
                })
            })
            .await
            .unwrap_err();

        assert!(
            matches!(err, RegistryError::UpstreamUnavailable { ref upstream, .. } if upstream == "docker.io"),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn tag_manifests_expire() {
        let store = CacheStore::new(
            MemoryStorage::new().into(),
            Some(Duration::from_millis(50)),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let manifest: &'static [u8] = br#"{"schemaVersion": 2}"#;

        store
            .get_or_fetch(tag_key("3.10"), counting(&calls, manifest))
            .await
            .unwrap();
        store
            .get_or_fetch(tag_key("3.10"), counting(&calls, manifest))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        store
            .get_or_fetch(tag_key("3.10"), counting(&calls, manifest))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tag_fetch_also_serves_digest() {
        let store = CacheStore::new(MemoryStorage::new().into(), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let manifest: &'static [u8] = br#"{"schemaVersion": 2}"#;

        let by_tag = store
            .get_or_fetch(tag_key("latest"), counting(&calls, manifest))
            .await
            .unwrap();
        let digest_key = CacheKey::manifest(
            "docker.io",
            "library/python",
            Reference::Digest(by_tag.digest.clone()),
            &Accept::new([crate::manifest::OCI_MANIFEST]),
        );
        let by_digest = store
            .get_or_fetch(digest_key, counting(&calls, manifest))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(by_digest.digest, by_tag.digest);
        assert_eq!(read(&store, &by_digest).await, manifest);
    }

    #[tokio::test]
    async fn tags_are_cached_per_accept_list() {
        let store = CacheStore::new(MemoryStorage::new().into(), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let legacy: &'static [u8] = br#"{"schemaVersion": 1}"#;
        let index: &'static [u8] = br#"{"schemaVersion": 2, "manifests": []}"#;
        let old = Accept::new(crate::manifest::LEGACY);
        let new = Accept::new([crate::manifest::OCI_INDEX]);
        let key = |accept: &Accept| {
            CacheKey::manifest(
                "docker.io",
                "library/python",
                Reference::Tag("3.10".into()),
                accept,
            )
        };

        let first = store
            .get_or_fetch(key(&old), counting(&calls, legacy))
            .await
            .unwrap();
        let second = store
            .get_or_fetch(key(&new), counting(&calls, index))
            .await
            .unwrap();
        assert_ne!(first.digest, second.digest);
        assert_ne!(key(&old).record_path(), key(&new).record_path());

        let again = store
            .get_or_fetch(key(&old), counting(&calls, index))
            .await
            .unwrap();
        assert_eq!(again, first);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let by_digest = |accept: &Accept| {
            CacheKey::manifest(
                "docker.io",
                "library/python",
                Reference::Digest(first.digest.clone()),
                accept,
            )
        };
        assert_eq!(by_digest(&old), by_digest(&new));
    }

    #[tokio::test]
    async fn stalled_body_is_upstream_timeout() {
        let store = CacheStore::new(MemoryStorage::new().into(), None);
        let key = CacheKey::Blob(Digest::sha256_of(BLOB));

        let err = store
            .get_or_fetch(key.clone(), || async {
                let body = tokio_util::io::StreamReader::new(futures::stream::iter(vec![
                    Ok(bytes::Bytes::from_static(b"partial")),
                    Err(io::Error::new(io::ErrorKind::TimedOut, "stalled")),
                ]));
                Ok(Fetched {
                    body: Box::new(body),
                    content_type: "application/octet-stream".into(),
                    upstream: "quay.io".into(),
                })
            })
            .await
            .unwrap_err();

        assert!(
            matches!(err, RegistryError::UpstreamTimeout(ref upstream) if upstream == "quay.io"),
            "{err:?}"
        );
        assert!(store.peek(&key).is_none());
    }

    #[tokio::test]
    async fn records_survive_restart() {
        let storage: Storage = MemoryStorage::new().into();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::Blob(Digest::sha256_of(BLOB));

        let before = CacheStore::new(storage.clone(), None)
            .get_or_fetch(key.clone(), counting(&calls, BLOB))
            .await
            .unwrap();

        let restarted = CacheStore::new(storage.clone(), None);
        let after = restarted
            .get_or_fetch(key.clone(), counting(&calls, BLOB))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(after, before);
        assert_eq!(read(&restarted, &after).await, BLOB);
    }

    #[tokio::test]
    async fn tags_survive_restart_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        let calls = Arc::new(AtomicUsize::new(0));
        let manifest: &'static [u8] = br#"{"schemaVersion": 2, "layers": []}"#;

        let storage: Storage = storage::LocalDriver::new(root.clone()).into();
        let before = CacheStore::new(storage, Some(Duration::from_secs(300)))
            .get_or_fetch(tag_key("3.12"), counting(&calls, manifest))
            .await
            .unwrap();

        let storage: Storage = storage::LocalDriver::new(root).into();
        let restarted = CacheStore::new(storage, Some(Duration::from_secs(300)));
        let after = restarted
            .get_or_fetch(tag_key("3.12"), counting(&calls, manifest))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(after.digest, before.digest);
        assert_eq!(read(&restarted, &after).await, manifest);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let storage: Storage = MemoryStorage::new().into();
        let store = CacheStore::new(storage.clone(), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let manifest: &'static [u8] = br#"{"schemaVersion": 2}"#;

        store
            .get_or_fetch(tag_key("latest"), counting(&calls, manifest))
            .await
            .unwrap();
        assert!(store.invalidate(&tag_key("latest")).await.unwrap());
        assert!(!storage.exists(&tag_key("latest").record_path()).await.unwrap());

        store
            .get_or_fetch(tag_key("latest"), counting(&calls, manifest))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_bytes_are_reported() {
        let storage: Storage = MemoryStorage::new().into();
        let store = CacheStore::new(storage.clone(), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::Blob(Digest::sha256_of(BLOB));

        let entry = store
            .get_or_fetch(key.clone(), counting(&calls, BLOB))
            .await
            .unwrap();
        storage
            .delete(Utf8Path::new(&format!("blobs/sha256/{}", entry.digest.hex())))
            .await
            .unwrap();

        assert!(store.open(&entry).await.unwrap().is_none());
        assert!(!store.contains(&entry).await.unwrap());

        // A restarted gateway does not trust a record whose bytes are gone.
        let restarted = CacheStore::new(storage, None);
        restarted
            .get_or_fetch(key, counting(&calls, BLOB))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
