//! Resolution of a target's inputs to paths inside the input root.
//!
//! The input root mirrors the repository: a source file lives at
//! `package/file` and a dependency's output at `package/output`, whichever
//! local directory the dependency was actually built into.

use crate::error::Result;
use relay_core::{BuildConfig, BuildGraph, BuildTarget, Error, RemoteOutput, SourceInput, ToolRef};
use std::path::PathBuf;

/// Where the content of an input comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputOrigin {
    /// A file on local disk
    Local(PathBuf),
    /// A blob already recorded in the content store
    Remote(RemoteOutput),
}

/// One file of the input root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    /// Path relative to the input root
    pub path: String,
    /// Where its content lives
    pub origin: InputOrigin,
}

/// A tool as seen by a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInput {
    /// Words contributed to `$TOOLS`
    pub names: Vec<String>,
    /// Files the tool needs in the input root
    pub files: Vec<InputFile>,
}

/// Resolves inputs against the build configuration and target graph
pub struct InputResolver<'a> {
    config: &'a BuildConfig,
    graph: &'a BuildGraph,
}

impl<'a> InputResolver<'a> {
    /// Create a resolver
    #[must_use]
    pub fn new(config: &'a BuildConfig, graph: &'a BuildGraph) -> Self {
        Self { config, graph }
    }

    /// Build-time inputs
    pub fn sources(&self, target: &BuildTarget) -> Result<Vec<InputFile>> {
        self.resolve_all(target, &target.sources)
    }

    /// Test-time inputs
    pub fn data(&self, target: &BuildTarget) -> Result<Vec<InputFile>> {
        self.resolve_all(target, &target.data)
    }

    /// Tools, in declaration order
    pub fn tools(&self, target: &BuildTarget) -> Result<Vec<ToolInput>> {
        target
            .tools
            .iter()
            .map(|tool| match tool {
                ToolRef::Target(label) => {
                    let dep = self
                        .graph
                        .target(label)
                        .ok_or_else(|| Error::missing_dependency(&target.label, label))?;
                    let files = self.outputs_of(&dep);
                    Ok(ToolInput {
                        names: files.iter().map(|f| f.path.clone()).collect(),
                        files,
                    })
                }
                ToolRef::SystemPath { name, .. } => Ok(ToolInput {
                    names: vec![name.clone()],
                    files: Vec::new(),
                }),
            })
            .collect()
    }

    /// A target's own outputs, as placed in the input root of its test run
    #[must_use]
    pub fn outputs_of(&self, target: &BuildTarget) -> Vec<InputFile> {
        let out_dir = target.out_dir(self.config);
        target
            .outputs()
            .iter()
            .map(|output| {
                let origin = target
                    .remote_outputs()
                    .iter()
                    .find(|r| r.path == *output)
                    .map_or_else(
                        || InputOrigin::Local(out_dir.join(output)),
                        |r| InputOrigin::Remote(r.clone()),
                    );
                InputFile {
                    path: target.label.package_path(output),
                    origin,
                }
            })
            .collect()
    }

    fn resolve_all(&self, target: &BuildTarget, inputs: &[SourceInput]) -> Result<Vec<InputFile>> {
        let mut files = Vec::new();
        for input in inputs {
            match input {
                SourceInput::File { package, file } => {
                    let path = if package.is_empty() {
                        file.clone()
                    } else {
                        format!("{package}/{file}")
                    };
                    files.push(InputFile {
                        origin: InputOrigin::Local(self.config.source_path(&path)),
                        path,
                    });
                }
                SourceInput::Target(label) => {
                    let dep = self
                        .graph
                        .target(label)
                        .ok_or_else(|| Error::missing_dependency(&target.label, label))?;
                    files.extend(self.outputs_of(&dep));
                }
                SourceInput::Url(_) => {}
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use relay_core::BuildLabel;

    fn tool_target() -> BuildTarget {
        let mut tool = BuildTarget::new(BuildLabel::new("package", "tool"));
        tool.add_output("bin");
        tool
    }

    #[test]
    fn test_sources_mirror_repo_layout() {
        let config = BuildConfig::new("/repo");
        let graph = BuildGraph::new();
        graph.add_target(tool_target());

        let mut target = BuildTarget::new(BuildLabel::new("package", "t"));
        target.add_source(SourceInput::file("package", "src.txt"));
        target.add_source(SourceInput::Target(BuildLabel::new("package", "tool")));

        let sources = InputResolver::new(&config, &graph).sources(&target).unwrap();
        assert_eq!(sources[0].path, "package/src.txt");
        assert_eq!(
            sources[0].origin,
            InputOrigin::Local(PathBuf::from("/repo/package/src.txt"))
        );
        assert_eq!(sources[1].path, "package/bin");
        assert_eq!(
            sources[1].origin,
            InputOrigin::Local(PathBuf::from("/repo/relay-out/gen/package/bin"))
        );
    }

    #[test]
    fn test_remote_outputs_are_preferred() {
        let config = BuildConfig::new("/repo");
        let graph = BuildGraph::new();
        let mut tool = tool_target();
        let remote = RemoteOutput {
            path: "bin".to_string(),
            hash: "ab".repeat(32),
            size_bytes: 3,
            is_executable: true,
        };
        tool.set_remote_outputs(vec![remote.clone()]);
        graph.add_target(tool);

        let mut target = BuildTarget::new(BuildLabel::new("package", "t"));
        target.add_tool(ToolRef::Target(BuildLabel::new("package", "tool")));

        let tools = InputResolver::new(&config, &graph).tools(&target).unwrap();
        assert_eq!(tools[0].names, ["package/bin"]);
        assert_eq!(tools[0].files[0].origin, InputOrigin::Remote(remote));
    }

    #[test]
    fn test_system_tool_is_bare_name() {
        let config = BuildConfig::new("/repo");
        let graph = BuildGraph::new();
        let mut target = BuildTarget::new(BuildLabel::new("package", "t"));
        target.add_tool(ToolRef::SystemPath {
            search_path: vec!["/opt/tools/bin".to_string()],
            name: "protoc".to_string(),
        });

        let tools = InputResolver::new(&config, &graph).tools(&target).unwrap();
        assert_eq!(tools[0].names, ["protoc"]);
        assert!(tools[0].files.is_empty());
    }

    #[test]
    fn test_missing_dependency() {
        let config = BuildConfig::new("/repo");
        let graph = BuildGraph::new();
        let mut target = BuildTarget::new(BuildLabel::new("package", "t"));
        target.add_source(SourceInput::Target(BuildLabel::new("other", "gone")));

        let err = InputResolver::new(&config, &graph).sources(&target).unwrap_err();
        assert!(matches!(
            err,
            RemoteError::Core(Error::MissingDependency { .. })
        ));
    }
}
