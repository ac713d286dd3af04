//! Construction of the `Command` for each execution mode

use super::inputs::{InputFile, ToolInput};
use crate::error::{RemoteError, Result};
use crate::reapi::{Command as ReapiCommand, Platform, command::EnvironmentVariable, platform::Property};
use relay_core::label::REPO_MARKER;
use relay_core::{BuildConfig, BuildTarget};
use std::collections::BTreeMap;
use std::time::Duration;

/// Where a test writes its results, relative to the input root
pub const TEST_RESULTS_FILE: &str = "test.results";
/// Where a test writes coverage, relative to the input root
pub const TEST_COVERAGE_FILE: &str = "test.coverage";

/// Bound on fetch actions whose target sets no timeout of its own
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(600);

const SHELL: [&str; 7] = ["bash", "--noprofile", "--norc", "-u", "-o", "pipefail", "-c"];

/// What an action does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run the target's build command
    Build,
    /// Run the target's test command
    Test {
        /// Collect coverage
        coverage: bool,
    },
    /// Download the target's URLs and verify their hashes
    Fetch,
}

impl ExecutionMode {
    /// Pick the mode for a target
    #[must_use]
    pub fn for_target(target: &BuildTarget, is_test_run: bool, coverage: bool) -> Self {
        if is_test_run {
            Self::Test { coverage }
        } else if target.is_remote_file {
            Self::Fetch
        } else {
            Self::Build
        }
    }

    /// Whether this is a test run
    #[must_use]
    pub fn is_test(self) -> bool {
        matches!(self, Self::Test { .. })
    }
}

/// Everything a command refers to, already resolved to input-root paths
#[derive(Debug, Clone, Default)]
pub struct CommandInputs {
    /// Build-time inputs
    pub sources: Vec<InputFile>,
    /// Tools
    pub tools: Vec<ToolInput>,
    /// Test-time inputs
    pub data: Vec<InputFile>,
}

/// Builds commands from targets
pub struct CommandBuilder<'a> {
    config: &'a BuildConfig,
    default_timeout: Duration,
}

impl<'a> CommandBuilder<'a> {
    /// Create a builder; `default_timeout` applies to targets without their own
    #[must_use]
    pub fn new(config: &'a BuildConfig, default_timeout: Duration) -> Self {
        Self {
            config,
            default_timeout,
        }
    }

    /// Build the command for a target in the given mode
    pub fn build(
        &self,
        target: &BuildTarget,
        mode: ExecutionMode,
        inputs: &CommandInputs,
    ) -> Result<ReapiCommand> {
        let command = match mode {
            ExecutionMode::Build => self.shell_command(
                &target.command,
                self.build_env(target, inputs),
                build_outputs(target),
            ),
            ExecutionMode::Test { coverage } => self.shell_command(
                &target.test_command,
                self.test_env(target, inputs, coverage),
                test_outputs(coverage),
            ),
            ExecutionMode::Fetch => fetch_command(target),
        };
        self.check_hermetic(&command)?;
        Ok(command)
    }

    /// Upper bound on running the target in the given mode
    #[must_use]
    pub fn timeout(&self, target: &BuildTarget, mode: ExecutionMode) -> Duration {
        let own = if mode.is_test() {
            target.test_timeout
        } else {
            target.build_timeout
        };
        let fallback = if mode == ExecutionMode::Fetch {
            FETCH_TIMEOUT
        } else {
            self.default_timeout
        };
        own.filter(|t| !t.is_zero()).unwrap_or(fallback)
    }

    fn shell_command(
        &self,
        script: &str,
        env: BTreeMap<&'static str, String>,
        outputs: Outputs,
    ) -> ReapiCommand {
        let mut arguments: Vec<String> = SHELL.iter().map(|s| (*s).to_string()).collect();
        arguments.push(format!("{}{}", self.preamble(), script));

        ReapiCommand {
            arguments,
            environment_variables: env
                .into_iter()
                .map(|(name, value)| EnvironmentVariable {
                    name: name.to_string(),
                    value,
                })
                .collect(),
            output_paths: outputs.paths(),
            output_files: outputs.files,
            output_directories: outputs.directories,
            platform: Some(Platform {
                properties: vec![Property {
                    name: "OSFamily".to_string(),
                    value: self.config.os.clone(),
                }],
            }),
            working_directory: String::new(),
        }
    }

    /// Exports that point scratch locations at the worker's own directory
    fn preamble(&self) -> String {
        let mut preamble =
            String::from("export TMP_DIR=\"$PWD\"\nexport TMPDIR=\"$PWD\"\nexport HOME=\"$PWD\"\n");
        if !self.config.path.is_empty() {
            preamble.push_str(&format!("export PATH=\"{}\"\n", self.config.path.join(":")));
        }
        preamble
    }

    fn common_env(&self, target: &BuildTarget) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("NAME", target.label.name.clone()),
            ("PKG", target.label.package.clone()),
            ("PKG_DIR", target.label.package_dir().to_string()),
            ("OS", self.config.os.clone()),
            ("ARCH", self.config.arch.clone()),
        ])
    }

    fn build_env(&self, target: &BuildTarget, inputs: &CommandInputs) -> BTreeMap<&'static str, String> {
        let mut env = self.common_env(target);
        let sources: Vec<String> = inputs.sources.iter().map(|f| f.path.clone()).collect();
        insert_list(&mut env, "SRCS", "SRC", &sources);
        insert_list(&mut env, "OUTS", "OUT", &target.full_outputs());
        let tools: Vec<String> = inputs.tools.iter().flat_map(|t| t.names.clone()).collect();
        insert_list(&mut env, "TOOLS", "TOOL", &tools);
        env
    }

    fn test_env(
        &self,
        target: &BuildTarget,
        inputs: &CommandInputs,
        coverage: bool,
    ) -> BTreeMap<&'static str, String> {
        let mut env = self.common_env(target);
        env.insert("TEST", target.full_outputs().join(" "));
        env.insert(
            "DATA",
            inputs
                .data
                .iter()
                .map(|f| f.path.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        );
        env.insert("RESULTS_FILE", TEST_RESULTS_FILE.to_string());
        env.insert(
            "TEST_TIMEOUT",
            self.timeout(target, ExecutionMode::Test { coverage }).as_secs().to_string(),
        );
        if coverage {
            env.insert("COVERAGE", "true".to_string());
            env.insert("COVERAGE_FILE", TEST_COVERAGE_FILE.to_string());
        }
        env
    }

    /// Reject any variable that would leak a local path to the worker
    fn check_hermetic(&self, command: &ReapiCommand) -> Result<()> {
        let markers: Vec<String> = self
            .config
            .local_dir_markers()
            .into_iter()
            .filter(|m| !m.is_empty() && m != "/")
            .collect();
        for var in &command.environment_variables {
            if var.value.starts_with(REPO_MARKER) {
                continue;
            }
            let leaks = var.value.split_whitespace().any(|word| {
                word.starts_with('/') || markers.iter().any(|m| is_under(word, m))
            });
            if leaks {
                return Err(RemoteError::non_hermetic(&var.name, &var.value));
            }
        }
        Ok(())
    }
}

/// Whether `word` is the directory `dir` or a path below it
fn is_under(word: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    word.strip_prefix(dir)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn insert_list(
    env: &mut BTreeMap<&'static str, String>,
    plural: &'static str,
    singular: &'static str,
    values: &[String],
) {
    env.insert(plural, values.join(" "));
    if let [only] = values {
        env.insert(singular, only.clone());
    }
}

/// Declared outputs in both the 2.0 and 2.1 forms
#[derive(Debug, Default)]
struct Outputs {
    files: Vec<String>,
    directories: Vec<String>,
}

impl Outputs {
    fn new(mut files: Vec<String>, mut directories: Vec<String>) -> Self {
        files.sort();
        files.dedup();
        directories.sort();
        directories.dedup();
        Self { files, directories }
    }

    fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.iter().chain(&self.directories).cloned().collect();
        paths.sort();
        paths.dedup();
        paths
    }
}

fn build_outputs(target: &BuildTarget) -> Outputs {
    Outputs::new(
        target.full_outputs(),
        target
            .output_directories()
            .iter()
            .map(|d| target.label.package_path(d))
            .collect(),
    )
}

fn test_outputs(coverage: bool) -> Outputs {
    let mut files = vec![TEST_RESULTS_FILE.to_string()];
    if coverage {
        files.push(TEST_COVERAGE_FILE.to_string());
    }
    Outputs::new(files, Vec::new())
}

/// Name of the single file a fetch produces
#[must_use]
pub fn fetch_output_name(target: &BuildTarget) -> String {
    target.outputs().first().cloned().unwrap_or_else(|| {
        target
            .urls()
            .next()
            .and_then(|url| url.split(['?', '#']).next())
            .and_then(|url| url.trim_end_matches('/').rsplit('/').next())
            .unwrap_or(&target.label.name)
            .to_string()
    })
}

/// Accepted hashes without their algorithm prefix
#[must_use]
pub fn fetch_hashes(target: &BuildTarget) -> Vec<String> {
    target
        .hashes
        .iter()
        .map(|h| h.split_once(':').map_or(h.as_str(), |(_, v)| v).trim().to_string())
        .collect()
}

/// A fetch depends only on its URLs, hashes and output name
fn fetch_command(target: &BuildTarget) -> ReapiCommand {
    let mut arguments = vec!["fetch".to_string()];
    arguments.extend(target.urls().map(str::to_string));
    arguments.push("verify".to_string());
    arguments.extend(fetch_hashes(target));

    let output = target.label.package_path(&fetch_output_name(target));
    ReapiCommand {
        arguments,
        environment_variables: Vec::new(),
        output_files: vec![output.clone()],
        output_directories: Vec::new(),
        platform: None,
        working_directory: String::new(),
        output_paths: vec![output],
    }
}
