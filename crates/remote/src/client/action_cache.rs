//! ActionCache client

use super::{ActionCache, GrpcChannel, GrpcTransport};
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::reapi;
use async_trait::async_trait;
use tracing::debug;

const GET_ACTION_RESULT: &str = "/build.bazel.remote.execution.v2.ActionCache/GetActionResult";

/// gRPC client for the ActionCache service
#[derive(Clone)]
pub struct GrpcActionCache {
    transport: GrpcTransport,
    instance_name: String,
}

impl GrpcActionCache {
    /// Create a client on a shared channel
    #[must_use]
    pub fn new(channel: &GrpcChannel) -> Self {
        Self {
            transport: channel.transport(),
            instance_name: channel.instance_name().to_string(),
        }
    }
}

#[async_trait]
impl ActionCache for GrpcActionCache {
    async fn get_action_result(
        &self,
        action_digest: &Digest,
    ) -> Result<Option<reapi::ActionResult>> {
        let request = reapi::GetActionResultRequest {
            instance_name: self.instance_name.clone(),
            action_digest: Some(action_digest.to_proto()),
            inline_stdout: true,
            inline_stderr: true,
        };
        match self
            .transport
            .unary::<_, reapi::ActionResult>(GET_ACTION_RESULT, request)
            .await
        {
            Ok(result) => Ok(Some(result)),
            Err(status) if status.code() == tonic::Code::NotFound => {
                debug!(action = %action_digest, "Action cache miss");
                Ok(None)
            }
            Err(status) => Err(RemoteError::grpc("GetActionResult", status)),
        }
    }
}
