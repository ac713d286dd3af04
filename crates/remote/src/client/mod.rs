//! The remote services and their gRPC clients.
//!
//! Each service is a trait so the rest of the crate can run against the
//! gRPC clients, the in-memory store, or a test double.

pub mod action_cache;
pub mod bytestream;
pub mod capabilities;
pub mod cas;
pub mod channel;
pub mod execution;
pub mod memory;

pub use action_cache::GrpcActionCache;
pub use bytestream::ByteStreamClient;
pub use capabilities::GrpcCapabilities;
pub use cas::GrpcContentStore;
pub use channel::{AuthInterceptor, GrpcChannel, GrpcTransport};
pub use execution::GrpcExecution;
pub use memory::MemoryContentStore;

use crate::error::Result;
use crate::merkle::Digest;
use crate::proto::google::longrunning::Operation;
use crate::reapi;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::Path;

/// Updates of one execution, as sent by the server
pub type OperationStream = BoxStream<'static, Result<Operation>>;

/// What the server supports
#[async_trait]
pub trait Capabilities: Send + Sync {
    /// Fetch the server's capabilities
    async fn get_capabilities(&self) -> Result<reapi::ServerCapabilities>;
}

/// Content-addressed blob storage.
///
/// Writes are idempotent by digest, so concurrent uploads of the same blob
/// are harmless.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Return the subset of `digests` the store does not hold
    async fn find_missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>>;

    /// Store several small blobs in one call
    async fn batch_update_blobs(&self, blobs: Vec<(Digest, Vec<u8>)>) -> Result<()>;

    /// Fetch several small blobs in one call; any absent blob is an error
    async fn batch_read_blobs(&self, digests: &[Digest]) -> Result<Vec<(Digest, Vec<u8>)>>;

    /// Store one blob of any size
    async fn write_blob(&self, digest: &Digest, data: Vec<u8>) -> Result<()>;

    /// Store one blob of any size, read from a local file
    async fn write_file(&self, digest: &Digest, path: &Path) -> Result<()>;

    /// Fetch one blob of any size
    async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Fetch every directory reachable from `root`, root first
    async fn get_tree(&self, root: &Digest) -> Result<Vec<reapi::Directory>>;
}

/// Action execution
#[async_trait]
pub trait Execution: Send + Sync {
    /// Start executing an action and follow its progress
    async fn execute(&self, action_digest: &Digest, skip_cache_lookup: bool)
    -> Result<OperationStream>;

    /// Re-attach to a running operation
    async fn wait_execution(&self, operation_name: &str) -> Result<OperationStream>;
}

/// Cached action results
#[async_trait]
pub trait ActionCache: Send + Sync {
    /// Look up the result of an action; `None` on a miss
    async fn get_action_result(&self, action_digest: &Digest)
    -> Result<Option<reapi::ActionResult>>;
}
