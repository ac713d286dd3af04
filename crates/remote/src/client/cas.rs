//! Content Addressable Storage (CAS) client

use super::{ByteStreamClient, ContentStore, GrpcChannel, GrpcTransport};
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::reapi::{self, batch_update_blobs_request};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use tracing::{debug, instrument};

const FIND_MISSING_BLOBS: &str =
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/FindMissingBlobs";
const BATCH_UPDATE_BLOBS: &str =
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/BatchUpdateBlobs";
const BATCH_READ_BLOBS: &str =
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/BatchReadBlobs";
const GET_TREE: &str = "/build.bazel.remote.execution.v2.ContentAddressableStorage/GetTree";

/// gRPC client for the ContentAddressableStorage and ByteStream services
#[derive(Clone)]
pub struct GrpcContentStore {
    transport: GrpcTransport,
    bytestream: ByteStreamClient,
    instance_name: String,
}

impl GrpcContentStore {
    /// Create a client on a shared channel
    #[must_use]
    pub fn new(channel: &GrpcChannel) -> Self {
        Self {
            transport: channel.transport(),
            bytestream: ByteStreamClient::new(channel),
            instance_name: channel.instance_name().to_string(),
        }
    }
}

#[async_trait]
impl ContentStore for GrpcContentStore {
    #[instrument(skip(self, digests), fields(count = digests.len()))]
    async fn find_missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        let request = reapi::FindMissingBlobsRequest {
            instance_name: self.instance_name.clone(),
            blob_digests: digests.iter().map(Digest::to_proto).collect(),
        };
        let response: reapi::FindMissingBlobsResponse = self
            .transport
            .unary(FIND_MISSING_BLOBS, request)
            .await
            .map_err(|e| RemoteError::grpc("FindMissingBlobs", e))?;
        response
            .missing_blob_digests
            .iter()
            .map(Digest::from_proto)
            .collect()
    }

    #[instrument(skip(self, blobs), fields(count = blobs.len()))]
    async fn batch_update_blobs(&self, blobs: Vec<(Digest, Vec<u8>)>) -> Result<()> {
        let request = reapi::BatchUpdateBlobsRequest {
            instance_name: self.instance_name.clone(),
            requests: blobs
                .into_iter()
                .map(|(digest, data)| batch_update_blobs_request::Request {
                    digest: Some(digest.to_proto()),
                    data,
                })
                .collect(),
        };
        let response: reapi::BatchUpdateBlobsResponse = self
            .transport
            .unary(BATCH_UPDATE_BLOBS, request)
            .await
            .map_err(|e| RemoteError::grpc("BatchUpdateBlobs", e))?;

        for entry in response.responses {
            if let Some(status) = entry.status.filter(|s| !s.is_ok()) {
                let digest = entry
                    .digest
                    .map(|d| format!("{}/{}", d.hash, d.size_bytes))
                    .unwrap_or_default();
                return Err(RemoteError::upload_failed(digest, status.message));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, digests), fields(count = digests.len()))]
    async fn batch_read_blobs(&self, digests: &[Digest]) -> Result<Vec<(Digest, Vec<u8>)>> {
        let request = reapi::BatchReadBlobsRequest {
            instance_name: self.instance_name.clone(),
            digests: digests.iter().map(Digest::to_proto).collect(),
        };
        let response: reapi::BatchReadBlobsResponse = self
            .transport
            .unary(BATCH_READ_BLOBS, request)
            .await
            .map_err(|e| RemoteError::grpc("BatchReadBlobs", e))?;

        let mut blobs = Vec::with_capacity(response.responses.len());
        for entry in response.responses {
            let digest = Digest::require(entry.digest.as_ref(), "BatchReadBlobs response")?;
            match entry.status {
                Some(status) if status.code == i32::from(tonic::Code::NotFound) => {
                    return Err(RemoteError::content_not_found(digest.to_string()));
                }
                Some(status) if !status.is_ok() => {
                    return Err(RemoteError::grpc(
                        "BatchReadBlobs",
                        tonic::Status::new(tonic::Code::from(status.code), status.message),
                    ));
                }
                _ => blobs.push((digest, entry.data)),
            }
        }
        Ok(blobs)
    }

    async fn write_blob(&self, digest: &Digest, data: Vec<u8>) -> Result<()> {
        self.bytestream.write(digest, data).await
    }

    async fn write_file(&self, digest: &Digest, path: &Path) -> Result<()> {
        self.bytestream.write_file(digest, path).await
    }

    async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.bytestream.read(digest).await
    }

    #[instrument(skip(self), fields(root = %root))]
    async fn get_tree(&self, root: &Digest) -> Result<Vec<reapi::Directory>> {
        let mut directories = Vec::new();
        let mut page_token = String::new();
        loop {
            let request = reapi::GetTreeRequest {
                instance_name: self.instance_name.clone(),
                root_digest: Some(root.to_proto()),
                page_size: 0,
                page_token: page_token.clone(),
            };
            let mut pages = self
                .transport
                .server_streaming::<_, reapi::GetTreeResponse>(GET_TREE, request)
                .await
                .map_err(|e| tree_error(root, e))?;

            let mut next_token = String::new();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| tree_error(root, e))?;
                directories.extend(page.directories);
                next_token = page.next_page_token;
            }

            if next_token.is_empty() {
                break;
            }
            page_token = next_token;
        }
        debug!(directories = directories.len(), "Fetched tree");
        Ok(directories)
    }
}

fn tree_error(root: &Digest, status: tonic::Status) -> RemoteError {
    if status.code() == tonic::Code::NotFound {
        RemoteError::content_not_found(root.to_string())
    } else {
        RemoteError::grpc("GetTree", status)
    }
}
