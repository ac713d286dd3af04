//! ByteStream client for blobs above the batch limit

use super::{GrpcChannel, GrpcTransport};
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::proto::google::bytestream::{ReadRequest, ReadResponse, WriteRequest, WriteResponse};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument};
use uuid::Uuid;

const READ: &str = "/google.bytestream.ByteStream/Read";
const WRITE: &str = "/google.bytestream.ByteStream/Write";

/// Streams blobs in chunks so they never need to fit in one message
#[derive(Clone)]
pub struct ByteStreamClient {
    transport: GrpcTransport,
    instance_name: String,
    chunk_size: usize,
}

impl ByteStreamClient {
    /// Create a client on a shared channel
    #[must_use]
    pub fn new(channel: &GrpcChannel) -> Self {
        Self {
            transport: channel.transport(),
            instance_name: channel.instance_name().to_string(),
            chunk_size: channel.config().chunk_size_bytes.max(1),
        }
    }

    /// `{instance}/uploads/{uuid}/blobs/{hash}/{size}`
    fn upload_resource_name(&self, digest: &Digest) -> String {
        prefixed(
            &self.instance_name,
            &format!("uploads/{}/blobs/{}/{}", Uuid::new_v4(), digest.hash, digest.size_bytes),
        )
    }

    /// `{instance}/blobs/{hash}/{size}`
    fn read_resource_name(&self, digest: &Digest) -> String {
        prefixed(
            &self.instance_name,
            &format!("blobs/{}/{}", digest.hash, digest.size_bytes),
        )
    }

    /// Upload an in-memory blob
    #[instrument(skip(self, data), fields(digest = %digest.hash, size = digest.size_bytes))]
    pub async fn write(&self, digest: &Digest, data: Vec<u8>) -> Result<()> {
        let requests = chunk_requests(self.upload_resource_name(digest), &data, self.chunk_size);
        let response: WriteResponse = self
            .transport
            .client_streaming(WRITE, futures::stream::iter(requests))
            .await
            .map_err(|e| RemoteError::grpc("ByteStream.Write", e))?;
        verify_committed(digest, response.committed_size)
    }

    /// Upload a local file without loading it into memory
    #[instrument(skip(self), fields(digest = %digest.hash, size = digest.size_bytes, path = %path.display()))]
    pub async fn write_file(&self, digest: &Digest, path: &Path) -> Result<()> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| RemoteError::io(e, path, "open for upload"))?;

        let (tx, rx) = tokio::sync::mpsc::channel::<WriteRequest>(16);
        let reader = tokio::spawn(send_file_chunks(
            file,
            path.to_path_buf(),
            self.upload_resource_name(digest),
            digest.size_bytes,
            self.chunk_size,
            tx,
        ));

        let written = self
            .transport
            .client_streaming::<_, _, WriteResponse>(WRITE, ReceiverStream::new(rx))
            .await;

        let sent = reader
            .await
            .map_err(|e| RemoteError::upload_failed(digest.to_string(), e.to_string()))??;
        if sent != digest.size_bytes {
            return Err(RemoteError::upload_failed(
                digest.to_string(),
                format!("{} changed size while uploading ({sent} bytes read)", path.display()),
            ));
        }

        let response = written.map_err(|e| RemoteError::grpc("ByteStream.Write", e))?;
        verify_committed(digest, response.committed_size)
    }

    /// Download a blob
    #[instrument(skip(self), fields(digest = %digest.hash, size = digest.size_bytes))]
    pub async fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        let request = ReadRequest {
            resource_name: self.read_resource_name(digest),
            read_offset: 0,
            read_limit: 0,
        };
        let mut stream = self
            .transport
            .server_streaming::<_, ReadResponse>(READ, request)
            .await
            .map_err(|e| read_error(digest, e))?;

        let mut data = Vec::with_capacity(usize::try_from(digest.size_bytes).unwrap_or(0));
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| read_error(digest, e))?;
            data.extend_from_slice(&chunk.data);
        }

        if data.len() as i64 != digest.size_bytes {
            return Err(RemoteError::protocol(format!(
                "ByteStream.Read returned {} bytes for {digest}",
                data.len()
            )));
        }
        debug!(bytes_read = data.len(), "ByteStream read complete");
        Ok(data)
    }
}

fn prefixed(instance_name: &str, rest: &str) -> String {
    if instance_name.is_empty() {
        rest.to_string()
    } else {
        format!("{instance_name}/{rest}")
    }
}

/// Split a blob into write requests; only the first carries the resource name.
fn chunk_requests(resource_name: String, data: &[u8], chunk_size: usize) -> Vec<WriteRequest> {
    if data.is_empty() {
        return vec![WriteRequest {
            resource_name,
            write_offset: 0,
            finish_write: true,
            data: Vec::new(),
        }];
    }
    let chunk_count = data.len().div_ceil(chunk_size);
    data.chunks(chunk_size)
        .enumerate()
        .map(|(i, chunk)| WriteRequest {
            resource_name: if i == 0 { resource_name.clone() } else { String::new() },
            write_offset: (i * chunk_size) as i64,
            finish_write: i + 1 == chunk_count,
            data: chunk.to_vec(),
        })
        .collect()
}

async fn send_file_chunks(
    mut file: tokio::fs::File,
    path: PathBuf,
    resource_name: String,
    expected_size: i64,
    chunk_size: usize,
    tx: tokio::sync::mpsc::Sender<WriteRequest>,
) -> Result<i64> {
    let mut offset = 0i64;
    let mut buffer = vec![0u8; chunk_size];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| RemoteError::io(e, &path, "read for upload"))?;
        let finish_write = read == 0 || offset + read as i64 >= expected_size;
        let request = WriteRequest {
            resource_name: if offset == 0 { resource_name.clone() } else { String::new() },
            write_offset: offset,
            finish_write,
            data: buffer[..read].to_vec(),
        };
        offset += read as i64;
        if tx.send(request).await.is_err() || finish_write {
            return Ok(offset);
        }
    }
}

fn verify_committed(digest: &Digest, committed_size: i64) -> Result<()> {
    if committed_size == digest.size_bytes {
        Ok(())
    } else {
        Err(RemoteError::upload_failed(
            digest.to_string(),
            format!("server committed {committed_size} bytes"),
        ))
    }
}

fn read_error(digest: &Digest, status: tonic::Status) -> RemoteError {
    if status.code() == tonic::Code::NotFound {
        RemoteError::content_not_found(digest.to_string())
    } else {
        RemoteError::grpc("ByteStream.Read", status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_names() {
        assert_eq!(prefixed("", "blobs/abc/3"), "blobs/abc/3");
        assert_eq!(prefixed("main", "blobs/abc/3"), "main/blobs/abc/3");
    }

    #[test]
    fn test_chunk_requests_offsets() {
        let requests = chunk_requests("r".to_string(), b"abcdefg", 3);
        let offsets: Vec<_> = requests.iter().map(|r| r.write_offset).collect();
        assert_eq!(offsets, [0, 3, 6]);
        assert_eq!(requests[0].resource_name, "r");
        assert!(requests[1].resource_name.is_empty());
        assert!(requests[2].finish_write);
        assert!(!requests[1].finish_write);
        assert_eq!(requests[2].data, b"g");
    }

    #[test]
    fn test_chunk_requests_empty_blob() {
        let requests = chunk_requests("r".to_string(), b"", 3);
        assert_eq!(requests.len(), 1);
        assert!(requests[0].finish_write);
    }

    #[test]
    fn test_not_found_maps_to_content_not_found() {
        let digest = Digest::from_bytes(b"x");
        assert!(matches!(
            read_error(&digest, tonic::Status::not_found("gone")),
            RemoteError::ContentNotFound { .. }
        ));
    }
}
