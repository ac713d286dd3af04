//! Build targets as seen by the execution backends

use crate::config::BuildConfig;
use crate::label::BuildLabel;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle state of a build target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    /// Not yet scheduled
    #[default]
    Inactive,
    /// Dependencies are being resolved
    Pending,
    /// Currently being built
    Building,
    /// Built successfully
    Built,
    /// The build command failed
    Failed,
    /// Tests ran and passed
    Tested,
    /// Tests ran and failed
    TestFailed,
}

/// One input of a target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceInput {
    /// A file checked into the repo, relative to its package
    File {
        /// Package the file belongs to
        package: String,
        /// Path relative to the package
        file: String,
    },
    /// The outputs of another target
    Target(BuildLabel),
    /// A URL to download (only meaningful for remote-file targets)
    Url(String),
}

impl SourceInput {
    /// Convenience constructor for a package file
    pub fn file(package: impl Into<String>, file: impl Into<String>) -> Self {
        Self::File {
            package: package.into(),
            file: file.into(),
        }
    }
}

/// A tool a target's command invokes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolRef {
    /// A tool built by another target in the repo
    Target(BuildLabel),
    /// A tool found on the host by searching `search_path` for `name`
    SystemPath {
        /// Directories to search locally
        search_path: Vec<String>,
        /// Binary name
        name: String,
    },
}

/// Digest of an output that exists in the remote content store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOutput {
    /// Path relative to the target's output directory
    pub path: String,
    /// Lowercase hex hash of the content
    pub hash: String,
    /// Content size in bytes
    pub size_bytes: i64,
    /// Whether the file is executable
    pub is_executable: bool,
}

/// A single buildable target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTarget {
    /// The target's label
    pub label: BuildLabel,
    /// Build-time inputs
    #[serde(default)]
    pub sources: Vec<SourceInput>,
    /// Runtime inputs for tests
    #[serde(default)]
    pub data: Vec<SourceInput>,
    /// Tools used by the command
    #[serde(default)]
    pub tools: Vec<ToolRef>,
    /// Shell command that builds the target
    #[serde(default)]
    pub command: String,
    /// Shell command that runs the target's tests
    #[serde(default)]
    pub test_command: String,
    /// Upper bound on build time
    #[serde(default)]
    pub build_timeout: Option<Duration>,
    /// Upper bound on test time
    #[serde(default)]
    pub test_timeout: Option<Duration>,
    /// Whether the target is a test
    #[serde(default)]
    pub is_test: bool,
    /// Whether the outputs are binaries
    #[serde(default)]
    pub is_binary: bool,
    /// Whether the target downloads a URL instead of running a command
    #[serde(default)]
    pub is_remote_file: bool,
    /// Accepted hashes of the output (remote files only)
    #[serde(default)]
    pub hashes: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    output_dirs: Vec<String>,
    #[serde(default)]
    state: TargetState,
    #[serde(default)]
    remote_outputs: Vec<RemoteOutput>,
}

impl BuildTarget {
    /// Create an empty target with the given label
    #[must_use]
    pub fn new(label: BuildLabel) -> Self {
        Self {
            label,
            sources: Vec::new(),
            data: Vec::new(),
            tools: Vec::new(),
            command: String::new(),
            test_command: String::new(),
            build_timeout: None,
            test_timeout: None,
            is_test: false,
            is_binary: false,
            is_remote_file: false,
            hashes: Vec::new(),
            outputs: Vec::new(),
            output_dirs: Vec::new(),
            state: TargetState::Inactive,
            remote_outputs: Vec::new(),
        }
    }

    /// Add a build-time input
    pub fn add_source(&mut self, source: SourceInput) {
        if !self.sources.contains(&source) {
            self.sources.push(source);
        }
    }

    /// Add a test-time input
    pub fn add_data(&mut self, data: SourceInput) {
        if !self.data.contains(&data) {
            self.data.push(data);
        }
    }

    /// Add a tool
    pub fn add_tool(&mut self, tool: ToolRef) {
        if !self.tools.contains(&tool) {
            self.tools.push(tool);
        }
    }

    /// Declare an output file (relative to the package)
    pub fn add_output(&mut self, output: impl Into<String>) {
        let output = output.into();
        if !self.outputs.contains(&output) {
            self.outputs.push(output);
        }
    }

    /// Declare an output directory whose contents become outputs
    pub fn add_output_directory(&mut self, dir: impl Into<String>) {
        let dir = dir.into();
        if !self.output_dirs.contains(&dir) {
            self.output_dirs.push(dir);
        }
    }

    /// Declared output files
    #[must_use]
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Declared output directories
    #[must_use]
    pub fn output_directories(&self) -> &[String] {
        &self.output_dirs
    }

    /// Replace the recorded outputs with concrete files.
    ///
    /// Output directories are dropped: once expanded, their leaf files are
    /// part of `outputs`.
    pub fn set_outputs(&mut self, outputs: Vec<String>) {
        self.outputs = outputs;
        self.output_dirs.clear();
    }

    /// URLs this target downloads
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().filter_map(|s| match s {
            SourceInput::Url(url) => Some(url.as_str()),
            _ => None,
        })
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TargetState {
        self.state
    }

    /// Move to a new state
    pub fn set_state(&mut self, state: TargetState) {
        tracing::trace!(label = %self.label, from = ?self.state, to = ?state, "Target state change");
        self.state = state;
    }

    /// Digests of this target's outputs in the remote content store, if it was built remotely
    #[must_use]
    pub fn remote_outputs(&self) -> &[RemoteOutput] {
        &self.remote_outputs
    }

    /// Record where this target's outputs live remotely
    pub fn set_remote_outputs(&mut self, outputs: Vec<RemoteOutput>) {
        self.remote_outputs = outputs;
    }

    /// Local directory holding this target's outputs
    #[must_use]
    pub fn out_dir(&self, config: &BuildConfig) -> PathBuf {
        config.out_dir(&self.label, self.is_binary)
    }

    /// Outputs as paths relative to the repo root (`package/output`)
    #[must_use]
    pub fn full_outputs(&self) -> Vec<String> {
        self.outputs
            .iter()
            .map(|o| self.label.package_path(o))
            .collect()
    }
}
