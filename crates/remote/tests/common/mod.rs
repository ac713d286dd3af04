//! An in-memory remote execution server for integration tests.
//!
//! Actions run as local processes in a scratch directory populated from the
//! server's own content store; `fetch` actions are served from a URL table.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use prost::Message;
use relay_core::{BuildConfig, BuildState};
use relay_remote::client::{ActionCache, Capabilities, Execution, MemoryContentStore, OperationStream};
use relay_remote::execute::{completed_operation, pending_operation};
use relay_remote::merkle::DirectoryBuilder;
use relay_remote::proto::semver::SemVer;
use relay_remote::reapi::{self, digest_function, execution_stage};
use relay_remote::{Digest, RemoteBackend, RemoteConfig, RemoteError, RemoteServices, Result, RetryConfig};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Worker name reported in execution metadata
pub const WORKER: &str = "fake-worker";

/// The fake server
pub struct FakeServer {
    /// Its content store
    pub cas: MemoryContentStore,
    capabilities: Mutex<reapi::ServerCapabilities>,
    urls: Mutex<HashMap<String, Vec<u8>>>,
    mock_result: Mutex<Option<reapi::ActionResult>>,
    action_cache: Mutex<HashMap<Digest, reapi::ActionResult>>,
    executions: AtomicUsize,
}

impl FakeServer {
    /// A server speaking API 2.0.0 to 2.2.0 with SHA-256
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cas: MemoryContentStore::new(),
            capabilities: Mutex::new(capabilities(
                SemVer::new(2, 0, 0),
                SemVer::new(2, 2, 0),
                &[digest_function::Value::Sha256],
            )),
            urls: Mutex::new(HashMap::new()),
            mock_result: Mutex::new(None),
            action_cache: Mutex::new(HashMap::new()),
            executions: AtomicUsize::new(0),
        })
    }

    /// Advertise a different API version range
    pub fn set_api_versions(&self, low: SemVer, high: SemVer) {
        let mut caps = self.capabilities.lock().unwrap();
        caps.low_api_version = Some(low);
        caps.high_api_version = Some(high);
    }

    /// Advertise different digest functions
    pub fn set_digest_functions(&self, functions: &[digest_function::Value]) {
        let mut caps = self.capabilities.lock().unwrap();
        if let Some(cache) = caps.cache_capabilities.as_mut() {
            cache.digest_functions = functions.iter().map(|f| *f as i32).collect();
        }
    }

    /// Serve `content` for `url` to fetch actions
    pub fn add_url(&self, url: &str, content: &[u8]) {
        self.urls.lock().unwrap().insert(url.to_string(), content.to_vec());
    }

    /// Answer every execution with this result instead of running anything
    pub fn set_mock_result(&self, result: reapi::ActionResult) {
        *self.mock_result.lock().unwrap() = Some(result);
    }

    /// Number of actions executed (cache hits excluded)
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Services backed by this server
    pub fn services(self: &Arc<Self>) -> RemoteServices {
        RemoteServices {
            capabilities: self.clone(),
            cas: Arc::new(self.cas.clone()),
            execution: self.clone(),
            action_cache: self.clone(),
        }
    }

    /// Store `files` as an output directory tree and describe it
    pub fn store_output_directory(&self, path: &str, files: &[(&str, &[u8])]) -> reapi::OutputDirectory {
        let mut builder = DirectoryBuilder::new();
        for (name, content) in files {
            let digest = self.cas.insert(content.to_vec());
            builder.add_file(name, digest, false).unwrap();
        }
        self.output_directory(path, &builder)
    }

    fn output_directory(&self, path: &str, builder: &DirectoryBuilder) -> reapi::OutputDirectory {
        let built = builder.build();
        let mut directories: Vec<reapi::Directory> = built
            .directories
            .into_iter()
            .map(|(_, bytes)| {
                self.cas.insert(bytes.clone());
                reapi::Directory::decode(bytes.as_slice()).unwrap()
            })
            .collect();
        let root = directories.pop();
        let tree = self.cas.insert_message(&reapi::Tree {
            root,
            children: directories,
        });
        reapi::OutputDirectory {
            path: path.to_string(),
            tree_digest: Some(tree.to_proto()),
            is_topologically_sorted: false,
        }
    }

    fn blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.cas
            .get(digest)
            .map(|data| data.as_ref().clone())
            .ok_or_else(|| RemoteError::content_not_found(digest.to_string()))
    }

    fn message<M: Message + Default>(&self, digest: Option<&reapi::Digest>) -> Result<M> {
        let digest = Digest::require(digest, "request")?;
        M::decode(self.blob(&digest)?.as_slice()).map_err(|e| RemoteError::protocol(e.to_string()))
    }

    async fn run(&self, action: &reapi::Action) -> Result<reapi::ActionResult> {
        if let Some(result) = self.mock_result.lock().unwrap().clone() {
            return Ok(result);
        }
        let command: reapi::Command = self.message(action.command_digest.as_ref())?;
        if command.arguments.first().map(String::as_str) == Some("fetch") {
            return self.fetch(&command);
        }

        let dir = TempDir::new().map_err(|e| RemoteError::io(e, "tmp", "create sandbox"))?;
        let root = Digest::require(action.input_root_digest.as_ref(), "input root")?;
        self.populate(dir.path(), &root)?;
        for output in &command.output_paths {
            if let Some(parent) = dir.path().join(output).parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
        }

        let output = tokio::process::Command::new(&command.arguments[0])
            .args(&command.arguments[1..])
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .envs(command.environment_variables.iter().map(|v| (&v.name, &v.value)))
            .current_dir(dir.path())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RemoteError::io(e, dir.path(), "run action"))?;

        let mut result = reapi::ActionResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout_raw: output.stdout,
            stderr_raw: output.stderr,
            execution_metadata: Some(reapi::ExecutedActionMetadata {
                worker: WORKER.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        for path in &command.output_paths {
            let local = dir.path().join(path);
            if local.is_file() {
                let data = std::fs::read(&local).unwrap();
                result.output_files.push(reapi::OutputFile {
                    path: path.clone(),
                    digest: Some(self.cas.insert(data).to_proto()),
                    is_executable: is_executable(&local),
                    contents: Vec::new(),
                });
            } else if local.is_dir() {
                let mut builder = DirectoryBuilder::new();
                self.collect(&local, "", &mut builder);
                result.output_directories.push(self.output_directory(path, &builder));
            }
        }
        Ok(result)
    }

    fn fetch(&self, command: &reapi::Command) -> Result<reapi::ActionResult> {
        let urls = command.arguments[1..]
            .iter()
            .take_while(|arg| *arg != "verify");
        let table = self.urls.lock().unwrap();
        let content = urls
            .filter_map(|url| table.get(url))
            .next()
            .cloned()
            .ok_or_else(|| RemoteError::protocol("no such URL"))?;
        Ok(reapi::ActionResult {
            output_files: vec![reapi::OutputFile {
                path: command.output_paths[0].clone(),
                digest: Some(self.cas.insert(content).to_proto()),
                is_executable: false,
                contents: Vec::new(),
            }],
            ..Default::default()
        })
    }

    /// Write an input root into `dir`
    fn populate(&self, dir: &Path, root: &Digest) -> Result<()> {
        let mut pending = VecDeque::from([(dir.to_path_buf(), root.clone())]);
        while let Some((path, digest)) = pending.pop_front() {
            std::fs::create_dir_all(&path).unwrap();
            let directory = reapi::Directory::decode(self.blob(&digest)?.as_slice())
                .map_err(|e| RemoteError::protocol(e.to_string()))?;
            for file in &directory.files {
                let dest = path.join(&file.name);
                std::fs::write(&dest, self.blob(&Digest::require(file.digest.as_ref(), &file.name)?)?).unwrap();
                if file.is_executable {
                    set_executable(&dest);
                }
            }
            for child in &directory.directories {
                pending.push_back((path.join(&child.name), Digest::require(child.digest.as_ref(), &child.name)?));
            }
        }
        Ok(())
    }

    fn collect(&self, dir: &Path, prefix: &str, builder: &mut DirectoryBuilder) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = if prefix.is_empty() { name } else { format!("{prefix}/{name}") };
            let path = entry.path();
            if path.is_dir() {
                self.collect(&path, &rel, builder);
            } else {
                let digest = self.cas.insert(std::fs::read(&path).unwrap());
                builder.add_file(&rel, digest, is_executable(&path)).unwrap();
            }
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).unwrap().permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_: &Path) -> bool {
    false
}

/// Mark a file executable
pub fn set_executable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Server capabilities for a version range and digest functions
pub fn capabilities(low: SemVer, high: SemVer, functions: &[digest_function::Value]) -> reapi::ServerCapabilities {
    reapi::ServerCapabilities {
        cache_capabilities: Some(reapi::CacheCapabilities {
            digest_functions: functions.iter().map(|f| *f as i32).collect(),
            action_cache_update_capabilities: None,
            max_batch_total_size_bytes: 4096,
        }),
        execution_capabilities: Some(reapi::ExecutionCapabilities {
            digest_function: digest_function::Value::Sha256 as i32,
            exec_enabled: true,
        }),
        deprecated_api_version: None,
        low_api_version: Some(low),
        high_api_version: Some(high),
    }
}

#[async_trait]
impl Capabilities for FakeServer {
    async fn get_capabilities(&self) -> Result<reapi::ServerCapabilities> {
        Ok(self.capabilities.lock().unwrap().clone())
    }
}

#[async_trait]
impl Execution for FakeServer {
    async fn execute(&self, action_digest: &Digest, skip_cache_lookup: bool) -> Result<OperationStream> {
        let name = format!("operations/{}", action_digest.hash);
        let cached = if skip_cache_lookup {
            None
        } else {
            self.action_cache.lock().unwrap().get(action_digest).cloned()
        };
        let (result, cached_result) = match cached {
            Some(result) => (result, true),
            None => {
                self.executions.fetch_add(1, Ordering::SeqCst);
                let action: reapi::Action = self.message(Some(&action_digest.to_proto()))?;
                let result = self.run(&action).await?;
                if result.exit_code == 0 {
                    self.action_cache
                        .lock()
                        .unwrap()
                        .insert(action_digest.clone(), result.clone());
                }
                (result, false)
            }
        };
        let response = reapi::ExecuteResponse {
            result: Some(result),
            cached_result,
            status: None,
            message: String::new(),
        };
        Ok(futures::stream::iter(vec![
            Ok(pending_operation(name.clone(), execution_stage::Value::Queued)),
            Ok(pending_operation(name.clone(), execution_stage::Value::Executing)),
            Ok(completed_operation(name, &response)),
        ])
        .boxed())
    }

    async fn wait_execution(&self, operation_name: &str) -> Result<OperationStream> {
        Err(RemoteError::protocol(format!("unknown operation {operation_name}")))
    }
}

#[async_trait]
impl ActionCache for FakeServer {
    async fn get_action_result(&self, action_digest: &Digest) -> Result<Option<reapi::ActionResult>> {
        Ok(self.action_cache.lock().unwrap().get(action_digest).cloned())
    }
}

/// A scratch repository with `package/src1.txt` and `package/src2.txt`
pub struct Repo {
    /// Keeps the directory alive
    pub dir: TempDir,
    /// Build config rooted at the directory
    pub config: BuildConfig,
}

impl Repo {
    /// Create the repository
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("package")).unwrap();
        std::fs::write(dir.path().join("package/src1.txt"), b"one\n").unwrap();
        std::fs::write(dir.path().join("package/src2.txt"), b"two\n").unwrap();
        let config = BuildConfig::new(dir.path());
        Self { dir, config }
    }

    /// Build state over this repository
    pub fn state(&self) -> BuildState {
        BuildState::new(self.config.clone())
    }
}

/// Client configuration with quick retries
pub fn remote_config() -> RemoteConfig {
    let mut config = RemoteConfig::new("grpc://fake:8980");
    config.retry = RetryConfig {
        max_attempts: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 1,
        backoff_multiplier: 1.0,
    };
    config
}

/// Send client logs to the test output; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A backend talking to `server`
pub fn backend(server: &Arc<FakeServer>, state: BuildState) -> RemoteBackend {
    init_tracing();
    RemoteBackend::with_services(remote_config(), Arc::new(state), server.services())
}
