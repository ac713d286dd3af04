//! Error types for the remote execution client

use miette::Diagnostic;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by the remote execution client.
///
/// A command that runs and exits non-zero is not an error; it comes back as
/// a failed outcome.
#[derive(Error, Debug, Diagnostic)]
pub enum RemoteError {
    /// The server cannot serve this client
    #[error("{message}")]
    #[diagnostic(
        code(relay_remote::incompatible),
        help("Point the client at a server implementing Remote Execution API v2 with SHA256")
    )]
    Incompatible {
        /// What the server advertises versus what is required
        message: String,
    },

    /// A blob could not be written to the content store
    #[error("Failed to upload {digest}: {message}")]
    #[diagnostic(code(relay_remote::upload_failed))]
    UploadFailed {
        /// Digest of the blob (`hash/size`)
        digest: String,
        /// Why it failed
        message: String,
    },

    /// A blob was expected in the content store but is absent
    #[error("Content not found: {digest}")]
    #[diagnostic(code(relay_remote::content_not_found))]
    ContentNotFound {
        /// Digest of the blob (`hash/size`)
        digest: String,
    },

    /// An operation ran past its bound
    #[error("{operation} timed out after {timeout_secs}s")]
    #[diagnostic(
        code(relay_remote::timeout),
        help("Raise the target's timeout or the remote timeout_secs setting")
    )]
    Timeout {
        /// What timed out
        operation: String,
        /// The bound that was exceeded
        timeout_secs: u64,
    },

    /// A declared output was not produced
    #[error("Target {target} did not produce declared output '{output}'")]
    #[diagnostic(
        code(relay_remote::missing_output),
        help("Check that the command writes every declared output")
    )]
    MissingOutput {
        /// Target label
        target: String,
        /// The missing output path
        output: String,
    },

    /// A test report could not be understood
    #[error("Invalid test results: {message}")]
    #[diagnostic(code(relay_remote::test_result_parse))]
    TestResultParse {
        /// What was wrong with it
        message: String,
    },

    /// A passing test run wrote no results
    #[error("Test {target} exited successfully but produced no test results")]
    #[diagnostic(
        code(relay_remote::missing_test_results),
        help("Tests must write their report to $RESULTS_FILE")
    )]
    MissingTestResults {
        /// Target label
        target: String,
    },

    /// A command would leak a local path to the remote worker
    #[error("Environment variable {name} has non-hermetic value '{value}'")]
    #[diagnostic(code(relay_remote::non_hermetic_environment))]
    NonHermeticEnvironment {
        /// Variable name
        name: String,
        /// Offending value
        value: String,
    },

    /// Two inputs claim the same path with different content
    #[error("Conflicting inputs at {path}: {first} vs {second}")]
    #[diagnostic(code(relay_remote::conflicting_input))]
    ConflictingInput {
        /// Path inside the input root
        path: String,
        /// Digest of the first input
        first: String,
        /// Digest of the second input
        second: String,
    },

    /// A downloaded file did not match any accepted hash
    #[error("Hash mismatch for {target}: got {actual}, expected one of [{}]", expected.join(", "))]
    #[diagnostic(code(relay_remote::hash_mismatch))]
    HashMismatch {
        /// Target label
        target: String,
        /// Accepted hashes
        expected: Vec<String>,
        /// Hash of what was fetched
        actual: String,
    },

    /// A digest string or message was malformed
    #[error("Invalid digest: {0}")]
    #[diagnostic(code(relay_remote::invalid_digest))]
    InvalidDigest(String),

    /// The server sent something this client cannot interpret
    #[error("Protocol error: {message}")]
    #[diagnostic(code(relay_remote::protocol))]
    Protocol {
        /// Description of the problem
        message: String,
    },

    /// The channel to the server could not be established
    #[error("Failed to connect to {endpoint}: {message}")]
    #[diagnostic(
        code(relay_remote::connection_failed),
        help("Check the endpoint and that the server is reachable")
    )]
    ConnectionFailed {
        /// Server endpoint
        endpoint: String,
        /// Why it failed
        message: String,
    },

    /// A gRPC call returned a non-OK status
    #[error("gRPC {operation} failed: {source}")]
    #[diagnostic(code(relay_remote::grpc))]
    Grpc {
        /// RPC name
        operation: String,
        /// Status returned by the server
        #[source]
        source: tonic::Status,
    },

    /// Retries ran out
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    #[diagnostic(code(relay_remote::retry_exhausted))]
    RetryExhausted {
        /// Operation being retried
        operation: String,
        /// Attempts made
        attempts: usize,
        /// The final error
        #[source]
        last_error: Box<RemoteError>,
    },

    /// Invalid client configuration
    #[error("Configuration error: {0}")]
    #[diagnostic(code(relay_remote::config))]
    Config(String),

    /// Local filesystem failure
    #[error("I/O error during {operation} on {}: {source}", path.display())]
    #[diagnostic(code(relay_remote::io))]
    Io {
        /// What was being done
        operation: String,
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Error from the build-tool collaborators
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] relay_core::Error),
}

impl RemoteError {
    /// Create an initialization error
    pub fn incompatible(message: impl Into<String>) -> Self {
        Self::Incompatible {
            message: message.into(),
        }
    }

    /// Create an upload error
    pub fn upload_failed(digest: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UploadFailed {
            digest: digest.into(),
            message: message.into(),
        }
    }

    /// Create a missing-content error
    pub fn content_not_found(digest: impl Into<String>) -> Self {
        Self::ContentNotFound {
            digest: digest.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_secs,
        }
    }

    /// Create a missing-output error
    pub fn missing_output(target: impl Into<String>, output: impl Into<String>) -> Self {
        Self::MissingOutput {
            target: target.into(),
            output: output.into(),
        }
    }

    /// Create a test-report parse error
    pub fn test_result_parse(message: impl Into<String>) -> Self {
        Self::TestResultParse {
            message: message.into(),
        }
    }

    /// Create a missing-results error
    pub fn missing_test_results(target: impl Into<String>) -> Self {
        Self::MissingTestResults {
            target: target.into(),
        }
    }

    /// Create a hermeticity error
    pub fn non_hermetic(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::NonHermeticEnvironment {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Create an invalid-digest error
    pub fn invalid_digest(message: impl Into<String>) -> Self {
        Self::InvalidDigest(message.into())
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Wrap a gRPC status
    pub fn grpc(operation: impl Into<String>, source: tonic::Status) -> Self {
        Self::Grpc {
            operation: operation.into(),
            source,
        }
    }

    /// Create a retry-exhausted error
    pub fn retry_exhausted(
        operation: impl Into<String>,
        attempts: usize,
        last_error: Self,
    ) -> Self {
        Self::RetryExhausted {
            operation: operation.into(),
            attempts,
            last_error: Box::new(last_error),
        }
    }

    /// The error behind any exhausted retries
    #[must_use]
    pub fn last_attempt(&self) -> &Self {
        match self {
            Self::RetryExhausted { last_error, .. } => last_error.last_attempt(),
            other => other,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Wrap an I/O error with the path and operation involved
    pub fn io(source: std::io::Error, path: impl AsRef<Path>, operation: impl Into<String>) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether retrying the same call might succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } | Self::UploadFailed { .. } | Self::Io { .. } => true,
            Self::Grpc { source, .. } => matches!(
                source.code(),
                tonic::Code::Unavailable
                    | tonic::Code::ResourceExhausted
                    | tonic::Code::DeadlineExceeded
                    | tonic::Code::Aborted
                    | tonic::Code::Internal
                    | tonic::Code::Unknown
            ),
            Self::Incompatible { .. }
            | Self::ContentNotFound { .. }
            | Self::Timeout { .. }
            | Self::MissingOutput { .. }
            | Self::TestResultParse { .. }
            | Self::MissingTestResults { .. }
            | Self::NonHermeticEnvironment { .. }
            | Self::ConflictingInput { .. }
            | Self::HashMismatch { .. }
            | Self::InvalidDigest(_)
            | Self::Protocol { .. }
            | Self::RetryExhausted { .. }
            | Self::Config(_)
            | Self::Core(_) => false,
        }
    }
}

/// Result type for remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grpc_retry_classification() {
        assert!(RemoteError::grpc("Read", tonic::Status::unavailable("down")).is_retryable());
        assert!(!RemoteError::grpc("Read", tonic::Status::not_found("gone")).is_retryable());
        assert!(
            !RemoteError::grpc("Read", tonic::Status::invalid_argument("bad")).is_retryable()
        );
    }

    #[test]
    fn test_terminal_errors_are_not_retryable() {
        assert!(!RemoteError::incompatible("nope").is_retryable());
        assert!(!RemoteError::timeout("Execute", 10).is_retryable());
        assert!(!RemoteError::missing_output("//p:t", "out").is_retryable());
        assert!(RemoteError::upload_failed("abc/1", "reset").is_retryable());
    }

    #[test]
    fn test_hash_mismatch_message_lists_expected() {
        let err = RemoteError::HashMismatch {
            target: "//p:dl".to_string(),
            expected: vec!["aaa".to_string(), "bbb".to_string()],
            actual: "ccc".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Hash mismatch for //p:dl: got ccc, expected one of [aaa, bbb]"
        );
    }
}
