//! Builder for REAPI Actions and their input roots

use super::command::{CommandBuilder, CommandInputs, ExecutionMode};
use super::inputs::{InputFile, InputOrigin, InputResolver};
use crate::error::{RemoteError, Result};
use crate::merkle::{Digest, DirectoryBuilder};
use crate::reapi::{Action as ReapiAction, Command as ReapiCommand};
use crate::upload::BlobSet;
use relay_core::{BuildConfig, BuildGraph, BuildTarget};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// An action ready to upload and execute
#[derive(Debug, Clone)]
pub struct PreparedAction {
    /// What the action does
    pub mode: ExecutionMode,
    /// The command proto
    pub command: ReapiCommand,
    /// Digest of the encoded command
    pub command_digest: Digest,
    /// The action proto
    pub action: ReapiAction,
    /// Digest of the encoded action
    pub action_digest: Digest,
    /// Digest of the input root
    pub input_root: Digest,
    /// Every blob the server may need: command, action, directories and files
    pub blobs: BlobSet,
    /// Upper bound on the execution
    pub timeout: Duration,
}

/// Builds actions for targets
pub struct ActionBuilder<'a> {
    resolver: InputResolver<'a>,
    commands: CommandBuilder<'a>,
}

impl<'a> ActionBuilder<'a> {
    /// Create a builder; `default_timeout` applies to targets without their own
    #[must_use]
    pub fn new(config: &'a BuildConfig, graph: &'a BuildGraph, default_timeout: Duration) -> Self {
        Self {
            resolver: InputResolver::new(config, graph),
            commands: CommandBuilder::new(config, default_timeout),
        }
    }

    /// Build the action that runs `target` in `mode`
    pub fn build(&self, target: &BuildTarget, mode: ExecutionMode) -> Result<PreparedAction> {
        let (inputs, files) = self.inputs(target, mode)?;
        let command = self.commands.build(target, mode, &inputs)?;
        let timeout = self.commands.timeout(target, mode);

        let mut blobs = BlobSet::new();
        let mut root = DirectoryBuilder::new();
        for file in &files {
            add_input(&mut root, &mut blobs, file)?;
        }
        let tree = root.build();
        for (digest, bytes) in tree.directories {
            blobs.insert_bytes(digest, bytes);
        }

        let (command_digest, command_bytes) = Digest::from_message(&command);
        blobs.insert_bytes(command_digest.clone(), command_bytes);

        let action = ReapiAction {
            command_digest: Some(command_digest.to_proto()),
            input_root_digest: Some(tree.root_digest.to_proto()),
            timeout: Some(prost_types::Duration {
                seconds: timeout.as_secs() as i64,
                nanos: 0,
            }),
            do_not_cache: false,
            salt: Vec::new(),
            platform: command.platform.clone(),
        };
        let (action_digest, action_bytes) = Digest::from_message(&action);
        blobs.insert_bytes(action_digest.clone(), action_bytes);

        debug!(
            label = %target.label,
            ?mode,
            action = %action_digest,
            inputs = files.len(),
            "Built action"
        );
        Ok(PreparedAction {
            mode,
            command,
            command_digest,
            action,
            action_digest,
            input_root: tree.root_digest,
            blobs,
            timeout,
        })
    }

    /// What the command refers to and what the input root holds
    fn inputs(&self, target: &BuildTarget, mode: ExecutionMode) -> Result<(CommandInputs, Vec<InputFile>)> {
        match mode {
            ExecutionMode::Fetch => Ok((CommandInputs::default(), Vec::new())),
            ExecutionMode::Build => {
                let inputs = CommandInputs {
                    sources: self.resolver.sources(target)?,
                    tools: self.resolver.tools(target)?,
                    data: Vec::new(),
                };
                let files = inputs
                    .sources
                    .iter()
                    .chain(inputs.tools.iter().flat_map(|t| &t.files))
                    .cloned()
                    .collect();
                Ok((inputs, files))
            }
            ExecutionMode::Test { .. } => {
                let inputs = CommandInputs {
                    sources: Vec::new(),
                    tools: Vec::new(),
                    data: self.resolver.data(target)?,
                };
                let mut files = self.resolver.outputs_of(target);
                files.extend(inputs.data.iter().cloned());
                Ok((inputs, files))
            }
        }
    }
}

fn add_input(root: &mut DirectoryBuilder, blobs: &mut BlobSet, file: &InputFile) -> Result<()> {
    match &file.origin {
        InputOrigin::Remote(output) => {
            let digest = Digest::new(output.hash.clone(), output.size_bytes);
            root.add_file(&file.path, digest.clone(), output.is_executable)?;
            blobs.insert_remote(digest);
            Ok(())
        }
        InputOrigin::Local(path) => add_local(root, blobs, &file.path, path),
    }
}

/// Add a local file, or every file below a local directory
fn add_local(root: &mut DirectoryBuilder, blobs: &mut BlobSet, rel: &str, path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| RemoteError::io(e, path, "stat input"))?;
    if metadata.is_dir() {
        let entries = std::fs::read_dir(path).map_err(|e| RemoteError::io(e, path, "list input"))?;
        for entry in entries {
            let entry = entry.map_err(|e| RemoteError::io(e, path, "list input"))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            add_local(root, blobs, &format!("{rel}/{name}"), &entry.path())?;
        }
        return Ok(());
    }

    #[cfg(unix)]
    let is_executable = {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    };
    #[cfg(not(unix))]
    let is_executable = false;

    let digest = Digest::from_file(path)?;
    root.add_file(rel, digest.clone(), is_executable)?;
    blobs.insert_file(digest, path);
    Ok(())
}
