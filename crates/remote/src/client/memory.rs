//! In-process content store

use super::ContentStore;
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::reapi;
use async_trait::async_trait;
use prost::Message;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

/// A thread-safe content store held in memory.
///
/// Every write is checked against its digest.
#[derive(Debug, Clone, Default)]
pub struct MemoryContentStore {
    blobs: Arc<RwLock<HashMap<Digest, Arc<Vec<u8>>>>>,
}

impl MemoryContentStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob and return its digest
    pub fn insert(&self, data: Vec<u8>) -> Digest {
        let digest = Digest::from_bytes(&data);
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(digest.clone(), Arc::new(data));
        digest
    }

    /// Store the encoding of a message and return its digest
    pub fn insert_message(&self, message: &impl Message) -> Digest {
        self.insert(message.encode_to_vec())
    }

    /// Look up a blob
    #[must_use]
    pub fn get(&self, digest: &Digest) -> Option<Arc<Vec<u8>>> {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(digest)
            .cloned()
    }

    /// Whether the store holds a blob
    #[must_use]
    pub fn contains(&self, digest: &Digest) -> bool {
        self.get(digest).is_some()
    }

    /// Number of stored blobs
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn put_checked(&self, digest: &Digest, data: Vec<u8>) -> Result<()> {
        let actual = Digest::from_bytes(&data);
        if actual != *digest {
            return Err(RemoteError::upload_failed(
                digest.to_string(),
                format!("content hashes to {actual}"),
            ));
        }
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(actual, Arc::new(data));
        Ok(())
    }

    fn fetch(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.get(digest)
            .map(|data| data.as_ref().clone())
            .ok_or_else(|| RemoteError::content_not_found(digest.to_string()))
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn find_missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(digests
            .iter()
            .filter(|d| !blobs.contains_key(d))
            .cloned()
            .collect())
    }

    async fn batch_update_blobs(&self, blobs: Vec<(Digest, Vec<u8>)>) -> Result<()> {
        for (digest, data) in blobs {
            self.put_checked(&digest, data)?;
        }
        Ok(())
    }

    async fn batch_read_blobs(&self, digests: &[Digest]) -> Result<Vec<(Digest, Vec<u8>)>> {
        digests
            .iter()
            .map(|d| self.fetch(d).map(|data| (d.clone(), data)))
            .collect()
    }

    async fn write_blob(&self, digest: &Digest, data: Vec<u8>) -> Result<()> {
        self.put_checked(digest, data)
    }

    async fn write_file(&self, digest: &Digest, path: &Path) -> Result<()> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| RemoteError::io(e, path, "read for upload"))?;
        self.put_checked(digest, data)
    }

    async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.fetch(digest)
    }

    async fn get_tree(&self, root: &Digest) -> Result<Vec<reapi::Directory>> {
        let mut directories = Vec::new();
        let mut seen = HashSet::new();
        let mut pending = VecDeque::from([root.clone()]);
        while let Some(digest) = pending.pop_front() {
            if !seen.insert(digest.clone()) {
                continue;
            }
            let data = self.fetch(&digest)?;
            let directory = reapi::Directory::decode(data.as_slice())
                .map_err(|e| RemoteError::protocol(format!("directory {digest}: {e}")))?;
            for child in &directory.directories {
                pending.push_back(Digest::require(child.digest.as_ref(), &child.name)?);
            }
            directories.push(directory);
        }
        Ok(directories)
    }
}
