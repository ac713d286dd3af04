//! Build policy: what the caller wants from a remote build

use crate::config::BuildConfig;
use crate::graph::BuildGraph;
use crate::label::BuildLabel;
use crate::target::BuildTarget;
use std::collections::HashSet;
use std::sync::Arc;

/// Decisions that belong to the build tool rather than to an execution backend
pub trait BuildPolicy: Send + Sync {
    /// Whether this target's outputs should be written to the local output directory
    fn should_download(&self, target: &BuildTarget) -> bool;

    /// Whether coverage should be collected for test runs
    fn need_coverage(&self) -> bool;
}

/// Shared, read-only state of one build invocation
#[derive(Debug)]
pub struct BuildState {
    /// Local build configuration
    pub config: BuildConfig,
    /// All known targets
    pub graph: Arc<BuildGraph>,
    /// Targets the user asked for on the command line
    pub original_targets: HashSet<BuildLabel>,
    /// Download outputs of the original targets
    pub download_outputs: bool,
    /// Collect coverage when running tests
    pub need_coverage: bool,
}

impl BuildState {
    /// Create a state with an empty graph and default policy
    #[must_use]
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            graph: Arc::new(BuildGraph::new()),
            original_targets: HashSet::new(),
            download_outputs: false,
            need_coverage: false,
        }
    }

    /// Set the targets requested by the user
    #[must_use]
    pub fn with_original_targets(mut self, labels: impl IntoIterator<Item = BuildLabel>) -> Self {
        self.original_targets = labels.into_iter().collect();
        self
    }

    /// Enable downloading of requested outputs
    #[must_use]
    pub fn with_download_outputs(mut self, download: bool) -> Self {
        self.download_outputs = download;
        self
    }

    /// Enable coverage collection
    #[must_use]
    pub fn with_coverage(mut self, coverage: bool) -> Self {
        self.need_coverage = coverage;
        self
    }
}

impl BuildPolicy for BuildState {
    fn should_download(&self, target: &BuildTarget) -> bool {
        // Tests always need their binaries locally; otherwise only what was asked for.
        self.download_outputs && (self.original_targets.contains(&target.label) || target.is_test)
    }

    fn need_coverage(&self) -> bool {
        self.need_coverage
    }
}
