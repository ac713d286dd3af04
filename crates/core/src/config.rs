//! Build configuration and the local output layout

use crate::{BuildLabel, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the directory (under the repo root) holding all build outputs.
pub const OUT_DIR: &str = "relay-out";
/// Generated (non-binary) outputs live here.
pub const GEN_DIR: &str = "relay-out/gen";
/// Binary outputs live here.
pub const BIN_DIR: &str = "relay-out/bin";
/// Per-target scratch directories live here.
pub const TMP_DIR: &str = "relay-out/tmp";

/// Local build configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildConfig {
    /// Absolute path of the repository root
    pub repo_root: PathBuf,

    /// Search path used to find tools (the `PATH` given to build commands)
    #[serde(default = "default_path")]
    pub path: Vec<String>,

    /// Target operating system
    #[serde(default = "default_os")]
    pub os: String,

    /// Target architecture
    #[serde(default = "default_arch")]
    pub arch: String,
}

impl BuildConfig {
    /// Create a config rooted at `repo_root` with default settings
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            path: default_path(),
            os: default_os(),
            arch: default_arch(),
        }
    }

    /// Parse a config from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::configuration(format!("invalid build config: {e}")))
    }

    /// Read a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| Error::io(e, path, "read"))?;
        Self::from_json(&json)
    }

    /// Directory holding the outputs of the given target
    #[must_use]
    pub fn out_dir(&self, label: &BuildLabel, is_binary: bool) -> PathBuf {
        let base = if is_binary { BIN_DIR } else { GEN_DIR };
        join_package(&self.repo_root.join(base), label)
    }

    /// Scratch directory for the given target
    #[must_use]
    pub fn tmp_dir(&self, label: &BuildLabel) -> PathBuf {
        join_package(&self.repo_root.join(TMP_DIR), label).join(format!("{}._build", label.name))
    }

    /// Absolute path of a repo-relative source file
    #[must_use]
    pub fn source_path(&self, repo_relative: &str) -> PathBuf {
        self.repo_root.join(repo_relative)
    }

    /// The string forms of local directories that must never leak into remote commands
    #[must_use]
    pub fn local_dir_markers(&self) -> Vec<String> {
        vec![
            OUT_DIR.to_string(),
            self.repo_root.to_string_lossy().into_owned(),
        ]
    }
}

fn join_package(base: &Path, label: &BuildLabel) -> PathBuf {
    if label.package.is_empty() {
        base.to_path_buf()
    } else {
        base.join(&label.package)
    }
}

fn default_path() -> Vec<String> {
    vec!["/usr/local/bin".to_string(), "/usr/bin".to_string(), "/bin".to_string()]
}

fn default_os() -> String {
    std::env::consts::OS.to_string()
}

fn default_arch() -> String {
    match std::env::consts::ARCH {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_dirs() {
        let config = BuildConfig::new("/repo");
        let label = BuildLabel::new("pkg/sub", "t");
        assert_eq!(config.out_dir(&label, false), PathBuf::from("/repo/relay-out/gen/pkg/sub"));
        assert_eq!(config.out_dir(&label, true), PathBuf::from("/repo/relay-out/bin/pkg/sub"));
        assert_eq!(
            config.tmp_dir(&label),
            PathBuf::from("/repo/relay-out/tmp/pkg/sub/t._build")
        );
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = BuildConfig::from_json(r#"{"repo_root": "/repo", "os": "linux"}"#).unwrap();
        assert_eq!(config.repo_root, PathBuf::from("/repo"));
        assert_eq!(config.os, "linux");
        assert_eq!(config.path, default_path());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            BuildConfig::from_json("{"),
            Err(Error::Configuration { .. })
        ));
    }
}
