//! Upload of the blobs an action needs

use crate::client::ContentStore;
use crate::config::RetryConfig;
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::retry::retry_with_backoff;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Allowance for request framing around each blob in a batch
const BATCH_ENTRY_OVERHEAD: i64 = 128;

/// Where the content of a blob can be found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobSource {
    /// Held in memory
    Bytes(Arc<Vec<u8>>),
    /// A local file
    File(PathBuf),
    /// Already in the content store, with no local copy
    Remote,
}

/// The blobs one action refers to, deduplicated by digest
#[derive(Debug, Clone, Default)]
pub struct BlobSet {
    blobs: BTreeMap<Digest, BlobSource>,
}

impl BlobSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add in-memory content
    pub fn insert_bytes(&mut self, digest: Digest, data: Vec<u8>) {
        self.insert(digest, BlobSource::Bytes(Arc::new(data)));
    }

    /// Add a local file whose content hashes to `digest`
    pub fn insert_file(&mut self, digest: Digest, path: impl Into<PathBuf>) {
        self.insert(digest, BlobSource::File(path.into()));
    }

    /// Add a blob that should already be in the content store
    pub fn insert_remote(&mut self, digest: Digest) {
        self.insert(digest, BlobSource::Remote);
    }

    /// Known local content is never replaced by a remote-only entry
    fn insert(&mut self, digest: Digest, source: BlobSource) {
        match self.blobs.get(&digest) {
            Some(BlobSource::Bytes(_) | BlobSource::File(_)) => {}
            _ => {
                self.blobs.insert(digest, source);
            }
        }
    }

    /// Every digest in the set
    #[must_use]
    pub fn digests(&self) -> Vec<Digest> {
        self.blobs.keys().cloned().collect()
    }

    /// Source of one blob
    #[must_use]
    pub fn source(&self, digest: &Digest) -> Option<&BlobSource> {
        self.blobs.get(digest)
    }

    /// Number of blobs
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Total size of every blob
    #[must_use]
    pub fn total_bytes(&self) -> i64 {
        self.blobs.keys().map(|d| d.size_bytes).sum()
    }
}

/// What an upload did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    /// Blobs the store already had
    pub present: usize,
    /// Blobs sent in batch calls
    pub batched: usize,
    /// Blobs sent through ByteStream
    pub streamed: usize,
    /// Bytes sent
    pub bytes: i64,
}

/// Uploads a [`BlobSet`], sending only what the store lacks
pub struct Uploader {
    store: Arc<dyn ContentStore>,
    retry: RetryConfig,
}

impl Uploader {
    /// Create an uploader
    pub fn new(store: Arc<dyn ContentStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Upload every blob of `blobs` the store does not hold.
    ///
    /// Blobs that fit are grouped into batches of at most `max_batch_bytes`;
    /// larger ones are streamed.
    pub async fn upload(&self, blobs: &BlobSet, max_batch_bytes: i64) -> Result<UploadStats> {
        let digests = blobs.digests();
        let missing = retry_with_backoff(&self.retry, "FindMissingBlobs", || {
            let digests = digests.clone();
            async move { self.store.find_missing_blobs(&digests).await }
        })
        .await?;

        let mut stats = UploadStats {
            present: digests.len().saturating_sub(missing.len()),
            ..UploadStats::default()
        };
        if missing.is_empty() {
            debug!(blobs = digests.len(), "All blobs already in CAS");
            return Ok(stats);
        }
        info!(
            missing = missing.len(),
            total = digests.len(),
            "Uploading missing blobs to CAS"
        );

        let mut batch: Vec<(Digest, Vec<u8>)> = Vec::new();
        let mut batch_bytes = 0;
        for digest in missing {
            let source = blobs.source(&digest).ok_or_else(|| {
                RemoteError::upload_failed(digest.to_string(), "server asked for a blob that was not offered")
            })?;
            let cost = digest.size_bytes + BATCH_ENTRY_OVERHEAD;
            stats.bytes += digest.size_bytes;

            if cost > max_batch_bytes {
                self.stream(&digest, source).await?;
                stats.streamed += 1;
                continue;
            }
            if batch_bytes + cost > max_batch_bytes {
                stats.batched += self.flush(&mut batch).await?;
                batch_bytes = 0;
            }
            batch.push((digest.clone(), load(&digest, source).await?));
            batch_bytes += cost;
        }
        stats.batched += self.flush(&mut batch).await?;

        debug!(?stats, "Uploaded missing blobs");
        Ok(stats)
    }

    async fn flush(&self, batch: &mut Vec<(Digest, Vec<u8>)>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let blobs = std::mem::take(batch);
        let count = blobs.len();
        retry_with_backoff(&self.retry, "BatchUpdateBlobs", || {
            let blobs = blobs.clone();
            async move { self.store.batch_update_blobs(blobs).await }
        })
        .await?;
        Ok(count)
    }

    async fn stream(&self, digest: &Digest, source: &BlobSource) -> Result<()> {
        match source {
            BlobSource::Bytes(data) => {
                retry_with_backoff(&self.retry, "ByteStream.Write", || {
                    let data = data.as_ref().clone();
                    async move { self.store.write_blob(digest, data).await }
                })
                .await
            }
            BlobSource::File(path) => {
                check_size(digest, path).await?;
                retry_with_backoff(&self.retry, "ByteStream.Write", || async {
                    self.store.write_file(digest, path).await
                })
                .await
            }
            BlobSource::Remote => Err(RemoteError::content_not_found(digest.to_string())),
        }
    }
}

/// Content of a blob small enough to batch
async fn load(digest: &Digest, source: &BlobSource) -> Result<Vec<u8>> {
    match source {
        BlobSource::Bytes(data) => Ok(data.as_ref().clone()),
        BlobSource::File(path) => {
            let data = tokio::fs::read(path)
                .await
                .map_err(|e| RemoteError::io(e, path, "read for upload"))?;
            if data.len() as i64 != digest.size_bytes {
                return Err(changed_since_hashing(digest, path, data.len() as i64));
            }
            Ok(data)
        }
        BlobSource::Remote => Err(RemoteError::content_not_found(digest.to_string())),
    }
}

async fn check_size(digest: &Digest, path: &Path) -> Result<()> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| RemoteError::io(e, path, "stat for upload"))?;
    let len = metadata.len() as i64;
    if len == digest.size_bytes {
        Ok(())
    } else {
        Err(changed_since_hashing(digest, path, len))
    }
}

fn changed_since_hashing(digest: &Digest, path: &Path, len: i64) -> RemoteError {
    RemoteError::upload_failed(
        digest.to_string(),
        format!(
            "{} is {len} bytes but was {} bytes when hashed",
            path.display(),
            digest.size_bytes
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryContentStore;
    use crate::reapi;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            backoff_multiplier: 1.0,
        }
    }

    /// Records the shape of each call on top of an in-memory store
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryContentStore,
        batches: Mutex<Vec<usize>>,
        streamed: Mutex<Vec<Digest>>,
    }

    #[async_trait]
    impl ContentStore for RecordingStore {
        async fn find_missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
            self.inner.find_missing_blobs(digests).await
        }
        async fn batch_update_blobs(&self, blobs: Vec<(Digest, Vec<u8>)>) -> Result<()> {
            self.batches.lock().unwrap().push(blobs.len());
            self.inner.batch_update_blobs(blobs).await
        }
        async fn batch_read_blobs(&self, digests: &[Digest]) -> Result<Vec<(Digest, Vec<u8>)>> {
            self.inner.batch_read_blobs(digests).await
        }
        async fn write_blob(&self, digest: &Digest, data: Vec<u8>) -> Result<()> {
            self.streamed.lock().unwrap().push(digest.clone());
            self.inner.write_blob(digest, data).await
        }
        async fn write_file(&self, digest: &Digest, path: &Path) -> Result<()> {
            self.streamed.lock().unwrap().push(digest.clone());
            self.inner.write_file(digest, path).await
        }
        async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
            self.inner.read_blob(digest).await
        }
        async fn get_tree(&self, root: &Digest) -> Result<Vec<reapi::Directory>> {
            self.inner.get_tree(root).await
        }
    }

    fn bytes_set(contents: &[&[u8]]) -> BlobSet {
        let mut set = BlobSet::new();
        for c in contents {
            set.insert_bytes(Digest::from_bytes(c), c.to_vec());
        }
        set
    }

    #[tokio::test]
    async fn test_only_missing_blobs_are_sent() {
        let store = Arc::new(RecordingStore::default());
        store.inner.insert(b"already".to_vec());
        let uploader = Uploader::new(store.clone(), fast_retry());

        let stats = uploader
            .upload(&bytes_set(&[b"already", b"new"]), 1 << 20)
            .await
            .unwrap();
        assert_eq!(stats.present, 1);
        assert_eq!(stats.batched, 1);
        assert_eq!(*store.batches.lock().unwrap(), vec![1]);
        assert!(store.inner.contains(&Digest::from_bytes(b"new")));
    }

    #[tokio::test]
    async fn test_batches_respect_limit() {
        let store = Arc::new(RecordingStore::default());
        let uploader = Uploader::new(store.clone(), fast_retry());
        let blobs = bytes_set(&[&[1u8; 100], &[2u8; 100], &[3u8; 100]]);

        // Room for two entries per batch
        let limit = 2 * (100 + BATCH_ENTRY_OVERHEAD);
        let stats = uploader.upload(&blobs, limit).await.unwrap();
        assert_eq!(stats.batched, 3);
        assert_eq!(*store.batches.lock().unwrap(), vec![2, 1]);
        assert!(store.streamed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_large_file_is_streamed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();
        let digest = Digest::from_file(&path).unwrap();

        let store = Arc::new(RecordingStore::default());
        let uploader = Uploader::new(store.clone(), fast_retry());
        let mut blobs = BlobSet::new();
        blobs.insert_file(digest.clone(), &path);

        let stats = uploader.upload(&blobs, 1024).await.unwrap();
        assert_eq!(stats.streamed, 1);
        assert_eq!(*store.streamed.lock().unwrap(), vec![digest.clone()]);
        assert!(store.inner.contains(&digest));
    }

    #[tokio::test]
    async fn test_file_changed_since_hashing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"before").unwrap();
        let digest = Digest::from_file(&path).unwrap();
        std::fs::write(&path, b"after, and longer").unwrap();

        let mut blobs = BlobSet::new();
        blobs.insert_file(digest, &path);
        let uploader = Uploader::new(Arc::new(MemoryContentStore::new()), fast_retry());
        let err = uploader.upload(&blobs, 1 << 20).await.unwrap_err();
        assert!(matches!(err, RemoteError::UploadFailed { .. }));
    }

    #[tokio::test]
    async fn test_missing_remote_blob_is_an_error() {
        let mut blobs = BlobSet::new();
        blobs.insert_remote(Digest::from_bytes(b"gone"));
        let uploader = Uploader::new(Arc::new(MemoryContentStore::new()), fast_retry());
        let err = uploader.upload(&blobs, 1 << 20).await.unwrap_err();
        assert!(matches!(err, RemoteError::ContentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_overlapping_uploads() {
        let store = Arc::new(MemoryContentStore::new());
        let first = Uploader::new(store.clone(), fast_retry());
        let second = Uploader::new(store.clone(), fast_retry());
        let left = bytes_set(&[b"shared", b"left", &[4u8; 600]]);
        let right = bytes_set(&[b"shared", b"right", &[4u8; 600]]);

        let (a, b) = tokio::join!(first.upload(&left, 512), second.upload(&right, 512));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.present + a.batched + a.streamed, 3);
        assert_eq!(b.present + b.batched + b.streamed, 3);

        assert_eq!(store.len(), 4);
        for content in [&b"shared"[..], b"left", b"right", &[4u8; 600]] {
            let digest = Digest::from_bytes(content);
            assert_eq!(store.get(&digest).unwrap().as_slice(), content);
        }
    }

    #[test]
    fn test_local_source_wins_over_remote() {
        let digest = Digest::from_bytes(b"x");
        let mut blobs = BlobSet::new();
        blobs.insert_bytes(digest.clone(), b"x".to_vec());
        blobs.insert_remote(digest.clone());
        assert!(matches!(blobs.source(&digest), Some(BlobSource::Bytes(_))));
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs.total_bytes(), 1);
    }
}
