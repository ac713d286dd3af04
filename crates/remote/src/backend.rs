//! Remote execution backend: builds and tests targets on a REAPI server

use crate::client::{
    ActionCache, Capabilities, ContentStore, Execution, GrpcActionCache, GrpcCapabilities,
    GrpcChannel, GrpcContentStore, GrpcExecution,
};
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::execute::{ExecutionOutcome, Executor};
use crate::mapper::{ActionBuilder, ActionOutput, ExecutionMode, PreparedAction, ResultMapper};
use crate::materialize::{Materializer, collect_outputs};
use crate::merkle::Digest;
use crate::negotiate::{NegotiatedCapabilities, Negotiator};
use crate::test_results::{self, TestReport};
use crate::upload::{BlobSet, Uploader};
use relay_core::{BuildPolicy, BuildState, BuildTarget, RemoteOutput, TargetState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// The four remote services a backend talks to
#[derive(Clone)]
pub struct RemoteServices {
    /// Capabilities service
    pub capabilities: Arc<dyn Capabilities>,
    /// Content store
    pub cas: Arc<dyn ContentStore>,
    /// Execution service
    pub execution: Arc<dyn Execution>,
    /// Action cache
    pub action_cache: Arc<dyn ActionCache>,
}

impl RemoteServices {
    /// gRPC clients sharing one channel
    #[must_use]
    pub fn grpc(channel: &GrpcChannel) -> Self {
        Self {
            capabilities: Arc::new(GrpcCapabilities::new(channel)),
            cas: Arc::new(GrpcContentStore::new(channel)),
            execution: Arc::new(GrpcExecution::new(channel)),
            action_cache: Arc::new(GrpcActionCache::new(channel)),
        }
    }
}

/// Result of building a target remotely
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    /// Digest of the action that ran
    pub action_digest: Digest,
    /// Exit code, logs and execution metadata
    pub output: ActionOutput,
    /// Outputs as produced, empty when the command failed
    pub outputs: Vec<RemoteOutput>,
    /// Whether the outputs were written to the local output directory
    pub materialized: bool,
}

impl BuildOutcome {
    /// Whether the command succeeded
    #[must_use]
    pub fn success(&self) -> bool {
        self.output.success()
    }

    /// Captured stdout, for post-build processing by the caller
    #[must_use]
    pub fn stdout(&self) -> &[u8] {
        &self.output.stdout
    }

    /// Record the outcome on the target.
    ///
    /// On success the target's outputs become the concrete files produced
    /// (output directories are replaced by their leaves) and the remote
    /// digests are remembered for dependents.
    pub fn apply(&self, target: &mut BuildTarget) {
        if !self.success() {
            target.set_state(TargetState::Failed);
            return;
        }
        if !target.output_directories().is_empty() {
            let mut names: Vec<String> = self.outputs.iter().map(|o| o.path.clone()).collect();
            names.sort();
            names.dedup();
            target.set_outputs(names);
        }
        target.set_remote_outputs(self.outputs.clone());
        target.set_state(TargetState::Built);
    }
}

/// Result of running a test remotely
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    /// Digest of the action that ran
    pub action_digest: Digest,
    /// Exit code, logs and execution metadata
    pub output: ActionOutput,
    /// Test reports
    pub results: Vec<TestReport>,
    /// Coverage profile; empty unless requested
    pub coverage: String,
}

impl TestOutcome {
    /// Whether the test command succeeded
    #[must_use]
    pub fn success(&self) -> bool {
        self.output.success()
    }

    /// Record the outcome on the target
    pub fn apply(&self, target: &mut BuildTarget) {
        target.set_state(if self.success() {
            TargetState::Tested
        } else {
            TargetState::TestFailed
        });
    }
}

/// Remote backend that executes targets via REAPI
pub struct RemoteBackend {
    config: RemoteConfig,
    state: Arc<BuildState>,
    negotiator: Negotiator,
    cas: Arc<dyn ContentStore>,
    uploader: Uploader,
    executor: Executor,
    materializer: Materializer,
}

impl RemoteBackend {
    /// Connect to the configured server
    pub async fn connect(config: RemoteConfig, state: Arc<BuildState>) -> Result<Self> {
        debug!(endpoint = %config.endpoint, "Connecting to REAPI server");
        let channel = GrpcChannel::connect(&config).await?;
        let services = RemoteServices::grpc(&channel);
        Ok(Self::with_services(config, state, services))
    }

    /// Create a backend over the given services
    #[must_use]
    pub fn with_services(config: RemoteConfig, state: Arc<BuildState>, services: RemoteServices) -> Self {
        let retry = config.retry.clone();
        Self {
            negotiator: Negotiator::new(services.capabilities, config.max_batch_size_bytes),
            uploader: Uploader::new(services.cas.clone(), retry.clone()),
            executor: Executor::new(
                services.execution,
                services.action_cache,
                config.remote_cache,
                retry.clone(),
            ),
            materializer: Materializer::new(services.cas.clone(), retry),
            cas: services.cas,
            config,
            state,
        }
    }

    /// Check the server is compatible; must pass before anything is built
    pub async fn check_initialised(&self) -> Result<()> {
        self.negotiator.check().await.map(|_| ())
    }

    /// Build a target remotely.
    ///
    /// The target is not modified; apply the outcome to record it. Everything
    /// after the action is prepared, negotiation and downloads included, is
    /// bounded by the target's build timeout.
    #[instrument(skip(self, target), fields(label = %target.label))]
    pub async fn build(&self, worker: usize, target: &BuildTarget) -> Result<BuildOutcome> {
        let mode = ExecutionMode::for_target(target, false, false);
        let prepared = self.prepare(target, mode)?;
        info!(action = %prepared.action_digest, ?mode, "Building remotely");
        self.bounded(target, &prepared, self.build_remotely(target, &prepared))
            .await
    }

    /// Run a target's tests remotely, bounded by its test timeout
    #[instrument(skip(self, target), fields(label = %target.label))]
    pub async fn test(&self, worker: usize, target: &BuildTarget) -> Result<TestOutcome> {
        let coverage = self.state.need_coverage();
        let mode = ExecutionMode::for_target(target, true, coverage);
        let prepared = self.prepare(target, mode)?;
        info!(action = %prepared.action_digest, coverage, "Testing remotely");
        self.bounded(target, &prepared, self.test_remotely(target, &prepared, coverage))
            .await
    }

    /// Upload the outputs of a locally built target so remote actions can use them.
    ///
    /// Returns what to record with [`BuildTarget::set_remote_outputs`].
    #[instrument(skip(self, target), fields(label = %target.label))]
    pub async fn upload_local_target(&self, target: &BuildTarget) -> Result<Vec<RemoteOutput>> {
        let negotiated = self.negotiator.check().await?;
        let out_dir = target.out_dir(&self.state.config);
        let mut blobs = BlobSet::new();
        let mut outputs = Vec::with_capacity(target.outputs().len());
        for output in target.outputs() {
            let path = out_dir.join(output);
            let digest = Digest::from_file(&path)?;
            outputs.push(RemoteOutput {
                path: output.clone(),
                hash: digest.hash.clone(),
                size_bytes: digest.size_bytes,
                is_executable: is_executable(&path)?,
            });
            blobs.insert_file(digest, path);
        }
        let stats = self
            .uploader
            .upload(&blobs, negotiated.max_batch_total_size_bytes)
            .await?;
        debug!(?stats, "Uploaded local outputs");
        Ok(outputs)
    }

    /// Download the outputs of an earlier remote build
    pub async fn materialize(&self, target: &BuildTarget, outcome: &BuildOutcome) -> Result<()> {
        let negotiated = self.negotiator.check().await?;
        self.materializer
            .materialize(
                &outcome.outputs,
                &target.out_dir(&self.state.config),
                negotiated.max_batch_total_size_bytes,
            )
            .await?;
        Ok(())
    }

    async fn build_remotely(&self, target: &BuildTarget, prepared: &PreparedAction) -> Result<BuildOutcome> {
        let negotiated = self.negotiator.check().await?;
        let (result, cached) = self.run(prepared, negotiated).await?;
        let output = ResultMapper::map_result(&result, cached, self.cas.as_ref()).await?;
        if !output.success() {
            warn!(exit_code = output.exit_code, "Remote build failed");
            return Ok(BuildOutcome {
                action_digest: prepared.action_digest.clone(),
                output,
                outputs: Vec::new(),
                materialized: false,
            });
        }

        let outputs = collect_outputs(self.cas.as_ref(), target, prepared.mode, &result).await?;
        let materialized = self.state.should_download(target);
        if materialized {
            self.materializer
                .materialize(&outputs, &target.out_dir(&self.state.config), negotiated.max_batch_total_size_bytes)
                .await?;
        }
        Ok(BuildOutcome {
            action_digest: prepared.action_digest.clone(),
            output,
            outputs,
            materialized,
        })
    }

    async fn test_remotely(
        &self,
        target: &BuildTarget,
        prepared: &PreparedAction,
        coverage: bool,
    ) -> Result<TestOutcome> {
        let negotiated = self.negotiator.check().await?;
        let (result, cached) = self.run(prepared, negotiated).await?;
        let output = ResultMapper::map_result(&result, cached, self.cas.as_ref()).await?;
        let artifacts =
            test_results::extract(self.cas.as_ref(), &target.label.to_string(), &result, coverage).await?;
        Ok(TestOutcome {
            action_digest: prepared.action_digest.clone(),
            output,
            results: artifacts.results,
            coverage: artifacts.coverage,
        })
    }

    fn prepare(&self, target: &BuildTarget, mode: ExecutionMode) -> Result<PreparedAction> {
        ActionBuilder::new(
            &self.state.config,
            &self.state.graph,
            Duration::from_secs(self.config.timeout_secs),
        )
        .build(target, mode)
    }

    /// Bound the network phase by the action's timeout
    async fn bounded<T>(
        &self,
        target: &BuildTarget,
        prepared: &PreparedAction,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(prepared.timeout, work).await.map_err(|_| {
            warn!(timeout_secs = prepared.timeout.as_secs(), "Remote execution timed out");
            RemoteError::timeout(target.label.to_string(), prepared.timeout.as_secs())
        })?
    }

    /// Serve from the action cache, or upload and execute
    async fn run(
        &self,
        prepared: &PreparedAction,
        negotiated: &NegotiatedCapabilities,
    ) -> Result<(crate::reapi::ActionResult, bool)> {
        if let Some(result) = self.executor.cached_result(&prepared.action_digest).await {
            return Ok((result, true));
        }
        self.uploader
            .upload(&prepared.blobs, negotiated.max_batch_total_size_bytes)
            .await?;
        match self.executor.execute(&prepared.action_digest).await? {
            ExecutionOutcome::Completed { result, cached } => Ok((result, cached)),
            ExecutionOutcome::Failed { status, .. } => Err(RemoteError::grpc(
                "Execute",
                tonic::Status::new(tonic::Code::from(status.code), status.message),
            )),
            ExecutionOutcome::TimedOut { .. } => Err(RemoteError::timeout(
                prepared.action_digest.to_string(),
                prepared.timeout.as_secs(),
            )),
        }
    }
}

fn is_executable(path: &std::path::Path) -> Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata =
            std::fs::metadata(path).map_err(|e| RemoteError::io(e, path, "stat output"))?;
        Ok(metadata.permissions().mode() & 0o111 != 0)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ExecutionMetadata;
    use relay_core::BuildLabel;

    fn outcome(exit_code: i32, outputs: &[&str]) -> BuildOutcome {
        BuildOutcome {
            action_digest: Digest::from_bytes(b"action"),
            output: ActionOutput {
                exit_code,
                stdout: b"hello\n".to_vec(),
                stderr: Vec::new(),
                metadata: ExecutionMetadata::default(),
                cached: false,
            },
            outputs: outputs
                .iter()
                .map(|p| RemoteOutput {
                    path: (*p).to_string(),
                    hash: Digest::from_bytes(p.as_bytes()).hash,
                    size_bytes: p.len() as i64,
                    is_executable: false,
                })
                .collect(),
            materialized: false,
        }
    }

    #[test]
    fn test_apply_success_replaces_directory_outputs() {
        let mut target = BuildTarget::new(BuildLabel::new("package", "t"));
        target.add_output_directory("foo");
        let outcome = outcome(0, &["foo.txt", "bar.txt"]);
        outcome.apply(&mut target);

        assert_eq!(target.outputs(), ["bar.txt", "foo.txt"]);
        assert!(target.output_directories().is_empty());
        assert_eq!(target.remote_outputs().len(), 2);
        assert_eq!(target.state(), TargetState::Built);
        assert_eq!(outcome.stdout(), b"hello\n");
    }

    #[test]
    fn test_apply_success_keeps_declared_files() {
        let mut target = BuildTarget::new(BuildLabel::new("package", "t"));
        target.add_output("z.txt");
        target.add_output("a.txt");
        outcome(0, &["z.txt", "a.txt"]).apply(&mut target);
        assert_eq!(target.outputs(), ["z.txt", "a.txt"]);
    }

    #[test]
    fn test_apply_failure() {
        let mut target = BuildTarget::new(BuildLabel::new("package", "t"));
        target.add_output("out.txt");
        outcome(1, &[]).apply(&mut target);
        assert_eq!(target.state(), TargetState::Failed);
        assert!(target.remote_outputs().is_empty());
    }

    #[test]
    fn test_test_outcome_apply() {
        let mut target = BuildTarget::new(BuildLabel::new("package", "t"));
        let mut tested = TestOutcome {
            action_digest: Digest::from_bytes(b"action"),
            output: ActionOutput::default(),
            results: Vec::new(),
            coverage: String::new(),
        };
        tested.apply(&mut target);
        assert_eq!(target.state(), TargetState::Tested);
        tested.output.exit_code = 1;
        tested.apply(&mut target);
        assert_eq!(target.state(), TargetState::TestFailed);
    }
}
