use super::{Execution, GrpcChannel, GrpcTransport, OperationStream};
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::proto::google::longrunning::Operation;
use crate::reapi;
use async_trait::async_trait;
use futures::StreamExt;

const EXECUTE: &str = "/build.bazel.remote.execution.v2.Execution/Execute";
const WAIT_EXECUTION: &str = "/build.bazel.remote.execution.v2.Execution/WaitExecution";

/// gRPC client for the Execution service
#[derive(Clone)]
pub struct GrpcExecution {
    transport: GrpcTransport,
    instance_name: String,
}

impl GrpcExecution {
    /// Create a client on a shared channel
    #[must_use]
    pub fn new(channel: &GrpcChannel) -> Self {
        Self {
            transport: channel.transport(),
            instance_name: channel.instance_name().to_string(),
        }
    }
}

fn into_operation_stream(
    operation: &'static str,
    stream: tonic::Streaming<Operation>,
) -> OperationStream {
    stream
        .map(move |item| item.map_err(|e| RemoteError::grpc(operation, e)))
        .boxed()
}

#[async_trait]
impl Execution for GrpcExecution {
    async fn execute(
        &self,
        action_digest: &Digest,
        skip_cache_lookup: bool,
    ) -> Result<OperationStream> {
        let request = reapi::ExecuteRequest {
            instance_name: self.instance_name.clone(),
            skip_cache_lookup,
            action_digest: Some(action_digest.to_proto()),
        };
        let stream = self
            .transport
            .server_streaming(EXECUTE, request)
            .await
            .map_err(|e| RemoteError::grpc("Execute", e))?;
        Ok(into_operation_stream("Execute", stream))
    }

    async fn wait_execution(&self, operation_name: &str) -> Result<OperationStream> {
        let request = reapi::WaitExecutionRequest {
            name: operation_name.to_string(),
        };
        let stream = self
            .transport
            .server_streaming(WAIT_EXECUTION, request)
            .await
            .map_err(|e| RemoteError::grpc("WaitExecution", e))?;
        Ok(into_operation_stream("WaitExecution", stream))
    }
}
