//! Reconciling action results with declared outputs, and writing them locally

use crate::client::ContentStore;
use crate::config::RetryConfig;
use crate::error::{RemoteError, Result};
use crate::mapper::ExecutionMode;
use crate::mapper::command::{fetch_hashes, fetch_output_name};
use crate::merkle::{Digest, FileEntry};
use crate::reapi;
use crate::retry::retry_with_backoff;
use prost::Message;
use relay_core::{BuildTarget, RemoteOutput};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Every file below an output directory, as (relative path, entry) in path order.
///
/// Subdirectories are looked up among the tree's children first and fetched
/// with `GetTree` when the tree omits them.
pub async fn expand_tree(store: &dyn ContentStore, tree_digest: &Digest) -> Result<Vec<(String, FileEntry)>> {
    let data = store.read_blob(tree_digest).await?;
    let tree = reapi::Tree::decode(data.as_slice())
        .map_err(|e| RemoteError::protocol(format!("tree {tree_digest}: {e}")))?;
    let root = tree
        .root
        .ok_or_else(|| RemoteError::protocol(format!("tree {tree_digest} has no root")))?;

    let mut children: HashMap<Digest, reapi::Directory> = tree
        .children
        .into_iter()
        .map(|dir| (Digest::from_message(&dir).0, dir))
        .collect();

    let mut files = Vec::new();
    let mut pending = VecDeque::from([(String::new(), root)]);
    while let Some((prefix, directory)) = pending.pop_front() {
        for file in &directory.files {
            files.push((
                join(&prefix, &file.name),
                FileEntry {
                    digest: Digest::require(file.digest.as_ref(), &file.name)?,
                    is_executable: file.is_executable,
                },
            ));
        }
        for node in &directory.directories {
            let digest = Digest::require(node.digest.as_ref(), &node.name)?;
            if !children.contains_key(&digest) {
                debug!(directory = %digest, "Directory missing from tree, fetching");
                for dir in store.get_tree(&digest).await? {
                    children.insert(Digest::from_message(&dir).0, dir);
                }
            }
            let child = children
                .get(&digest)
                .cloned()
                .ok_or_else(|| RemoteError::content_not_found(digest.to_string()))?;
            pending.push_back((join(&prefix, &node.name), child));
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn output_file<'r>(result: &'r reapi::ActionResult, path: &str) -> Option<&'r reapi::OutputFile> {
    result.output_files.iter().find(|f| f.path == path)
}

/// The concrete outputs an action produced for a target.
///
/// Output files keep their declared names; each output directory is replaced
/// by the leaf files it expanded to, named relative to that directory.
pub async fn collect_outputs(
    store: &dyn ContentStore,
    target: &BuildTarget,
    mode: ExecutionMode,
    result: &reapi::ActionResult,
) -> Result<Vec<RemoteOutput>> {
    let label = target.label.to_string();
    if mode == ExecutionMode::Fetch {
        return collect_fetched(target, result);
    }

    let mut outputs = Vec::new();
    for output in target.outputs() {
        let path = target.label.package_path(output);
        let file = output_file(result, &path).ok_or_else(|| RemoteError::missing_output(&label, &path))?;
        let digest = Digest::require(file.digest.as_ref(), &path)?;
        outputs.push(remote_output(output.clone(), &digest, file.is_executable));
    }

    for dir in target.output_directories() {
        let path = target.label.package_path(dir);
        let declared = result
            .output_directories
            .iter()
            .find(|d| d.path == path)
            .ok_or_else(|| RemoteError::missing_output(&label, &path))?;
        let tree_digest = Digest::require(declared.tree_digest.as_ref(), &path)?;
        let leaves = expand_tree(store, &tree_digest).await?;
        debug!(label = %target.label, directory = %path, files = leaves.len(), "Expanded output directory");
        for (leaf, entry) in leaves {
            outputs.push(remote_output(leaf, &entry.digest, entry.is_executable));
        }
    }
    Ok(outputs)
}

fn collect_fetched(target: &BuildTarget, result: &reapi::ActionResult) -> Result<Vec<RemoteOutput>> {
    let label = target.label.to_string();
    let name = fetch_output_name(target);
    let path = target.label.package_path(&name);
    let file = output_file(result, &path).ok_or_else(|| RemoteError::missing_output(&label, &path))?;
    let digest = Digest::require(file.digest.as_ref(), &path)?;

    let expected = fetch_hashes(target);
    if !expected.is_empty() && !expected.iter().any(|h| h.eq_ignore_ascii_case(&digest.hash)) {
        return Err(RemoteError::HashMismatch {
            target: label,
            expected,
            actual: digest.hash,
        });
    }
    Ok(vec![remote_output(name, &digest, file.is_executable)])
}

fn remote_output(path: String, digest: &Digest, is_executable: bool) -> RemoteOutput {
    RemoteOutput {
        path,
        hash: digest.hash.clone(),
        size_bytes: digest.size_bytes,
        is_executable,
    }
}

/// Writes remote outputs into a local directory
pub struct Materializer {
    store: Arc<dyn ContentStore>,
    retry: RetryConfig,
}

impl Materializer {
    /// Create a materializer
    pub fn new(store: Arc<dyn ContentStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Write every output under `out_dir`, skipping files whose local content
    /// already matches.
    ///
    /// Blobs within `max_batch_bytes` are read in batches, larger ones streamed.
    pub async fn materialize(
        &self,
        outputs: &[RemoteOutput],
        out_dir: &Path,
        max_batch_bytes: i64,
    ) -> Result<usize> {
        let mut wanted: Vec<(PathBuf, Digest, bool)> = Vec::new();
        for output in outputs {
            let dest = out_dir.join(&output.path);
            let digest = Digest::new(output.hash.clone(), output.size_bytes);
            if is_current(&dest, &digest) {
                continue;
            }
            wanted.push((dest, digest, output.is_executable));
        }
        if wanted.is_empty() {
            debug!(dir = %out_dir.display(), "Outputs already up to date");
            return Ok(0);
        }

        let mut batch: Vec<Digest> = Vec::new();
        let mut batch_bytes = 0;
        let mut contents: HashMap<Digest, Vec<u8>> = HashMap::new();
        for (_, digest, _) in &wanted {
            if contents.contains_key(digest) || batch.contains(digest) {
                continue;
            }
            if digest.size_bytes > max_batch_bytes {
                contents.insert(digest.clone(), self.read(digest).await?);
                continue;
            }
            if batch_bytes + digest.size_bytes > max_batch_bytes {
                contents.extend(self.read_batch(std::mem::take(&mut batch)).await?);
                batch_bytes = 0;
            }
            batch_bytes += digest.size_bytes;
            batch.push(digest.clone());
        }
        contents.extend(self.read_batch(batch).await?);

        for (dest, digest, is_executable) in &wanted {
            let data = contents
                .get(digest)
                .ok_or_else(|| RemoteError::content_not_found(digest.to_string()))?;
            write_output(dest, data, *is_executable).await?;
        }
        info!(dir = %out_dir.display(), files = wanted.len(), "Downloaded outputs");
        Ok(wanted.len())
    }

    async fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        retry_with_backoff(&self.retry, "ByteStream.Read", || self.store.read_blob(digest)).await
    }

    async fn read_batch(&self, digests: Vec<Digest>) -> Result<Vec<(Digest, Vec<u8>)>> {
        if digests.is_empty() {
            return Ok(Vec::new());
        }
        retry_with_backoff(&self.retry, "BatchReadBlobs", || self.store.batch_read_blobs(&digests)).await
    }
}

fn is_current(dest: &Path, digest: &Digest) -> bool {
    dest.is_file() && Digest::from_file(dest).is_ok_and(|local| local == *digest)
}

async fn write_output(dest: &Path, data: &[u8], is_executable: bool) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RemoteError::io(e, parent, "create output directory"))?;
    }
    tokio::fs::write(dest, data)
        .await
        .map_err(|e| RemoteError::io(e, dest, "write output"))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if is_executable { 0o755 } else { 0o644 };
        tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| RemoteError::io(e, dest, "set output permissions"))?;
    }
    #[cfg(not(unix))]
    let _ = is_executable;
    Ok(())
}
