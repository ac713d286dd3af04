//! Merkle tree builder for input roots

use super::Digest;
use crate::error::{RemoteError, Result};
use crate::reapi::{self, DirectoryNode, FileNode, SymlinkNode};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// A file placed in the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Content digest of the file
    pub digest: Digest,
    /// Whether the file is executable
    pub is_executable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File(FileEntry),
    Symlink(String),
    Dir(DirectoryBuilder),
}

/// Builder for an input root.
///
/// Entries are kept in name order, so the encoded directories (and the root
/// digest) depend only on names and contents, never on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryBuilder {
    entries: BTreeMap<String, Node>,
}

/// Result of building a directory tree
#[derive(Debug, Clone)]
pub struct DirectoryTree {
    /// Root digest of the tree
    pub root_digest: Digest,
    /// Every encoded directory, root last
    pub directories: Vec<(Digest, Vec<u8>)>,
}

impl DirectoryBuilder {
    /// Create an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file at a relative `/`-separated path.
    ///
    /// Adding the same file twice is a no-op; the same path with different
    /// content is an error.
    pub fn add_file(&mut self, path: &str, digest: Digest, is_executable: bool) -> Result<()> {
        let (dir, name) = self.parent_of(path)?;
        let entry = FileEntry {
            digest,
            is_executable,
        };
        match dir.entries.entry(name.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Node::File(entry));
                Ok(())
            }
            Entry::Occupied(existing) => match existing.get() {
                Node::File(current) if *current == entry => Ok(()),
                Node::File(current) => Err(conflict(
                    path,
                    &current.digest.to_string(),
                    &entry.digest.to_string(),
                )),
                Node::Symlink(target) => Err(conflict(
                    path,
                    &format!("symlink to {target}"),
                    &entry.digest.to_string(),
                )),
                Node::Dir(_) => Err(conflict(path, "directory", &entry.digest.to_string())),
            },
        }
    }

    /// Add a symlink at a relative path
    pub fn add_symlink(&mut self, path: &str, target: &str) -> Result<()> {
        let (dir, name) = self.parent_of(path)?;
        match dir.entries.entry(name.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Node::Symlink(target.to_string()));
                Ok(())
            }
            Entry::Occupied(existing) => match existing.get() {
                Node::Symlink(current) if current == target => Ok(()),
                _ => Err(conflict(path, "existing entry", &format!("symlink to {target}"))),
            },
        }
    }

    /// Number of files in the tree
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.entries
            .values()
            .map(|node| match node {
                Node::File(_) => 1,
                Node::Symlink(_) => 0,
                Node::Dir(dir) => dir.file_count(),
            })
            .sum()
    }

    /// All files as (relative path, entry), in path order
    #[must_use]
    pub fn files(&self) -> Vec<(String, FileEntry)> {
        let mut out = Vec::new();
        self.collect_files("", &mut out);
        out
    }

    fn collect_files(&self, prefix: &str, out: &mut Vec<(String, FileEntry)>) {
        for (name, node) in &self.entries {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            match node {
                Node::File(entry) => out.push((path, entry.clone())),
                Node::Dir(dir) => dir.collect_files(&path, out),
                Node::Symlink(_) => {}
            }
        }
    }

    /// Build the Merkle tree bottom-up
    pub fn build(&self) -> DirectoryTree {
        let mut directories = Vec::new();
        let root_digest = self.build_into(&mut directories);
        DirectoryTree {
            root_digest,
            directories,
        }
    }

    fn build_into(&self, directories: &mut Vec<(Digest, Vec<u8>)>) -> Digest {
        let mut directory = reapi::Directory::default();
        for (name, node) in &self.entries {
            match node {
                Node::File(entry) => directory.files.push(FileNode {
                    name: name.clone(),
                    digest: Some(entry.digest.to_proto()),
                    is_executable: entry.is_executable,
                }),
                Node::Symlink(target) => directory.symlinks.push(SymlinkNode {
                    name: name.clone(),
                    target: target.clone(),
                }),
                Node::Dir(child) => {
                    let digest = child.build_into(directories);
                    directory.directories.push(DirectoryNode {
                        name: name.clone(),
                        digest: Some(digest.to_proto()),
                    });
                }
            }
        }
        let (digest, bytes) = Digest::from_message(&directory);
        directories.push((digest.clone(), bytes));
        digest
    }

    /// Walk to the directory that will hold `path`, creating it as needed
    fn parent_of<'a>(&mut self, path: &'a str) -> Result<(&mut Self, &'a str)> {
        let components = normalize(path)?;
        let Some((name, parents)) = components.split_last() else {
            return Err(RemoteError::config(format!("empty input path '{path}'")));
        };
        let mut dir = self;
        for (depth, part) in parents.iter().enumerate() {
            let node = dir
                .entries
                .entry((*part).to_string())
                .or_insert_with(|| Node::Dir(Self::new()));
            dir = match node {
                Node::Dir(child) => child,
                _ => {
                    let prefix = parents[..=depth].join("/");
                    return Err(conflict(&prefix, "file", "directory"));
                }
            };
        }
        Ok((dir, *name))
    }
}

fn normalize(path: &str) -> Result<Vec<&str>> {
    if path.starts_with('/') {
        return Err(RemoteError::config(format!(
            "input path '{path}' must be relative"
        )));
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(RemoteError::config(format!(
                    "input path '{path}' escapes the input root"
                )));
            }
            other => parts.push(other),
        }
    }
    Ok(parts)
}

fn conflict(path: &str, first: &str, second: &str) -> RemoteError {
    RemoteError::ConflictingInput {
        path: path.to_string(),
        first: first.to_string(),
        second: second.to_string(),
    }
}
