use super::{Capabilities, GrpcChannel, GrpcTransport};
use crate::error::{RemoteError, Result};
use crate::reapi;
use async_trait::async_trait;

const GET_CAPABILITIES: &str = "/build.bazel.remote.execution.v2.Capabilities/GetCapabilities";

/// gRPC client for the Capabilities service
#[derive(Clone)]
pub struct GrpcCapabilities {
    transport: GrpcTransport,
    instance_name: String,
}

impl GrpcCapabilities {
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
impl Capabilities for GrpcCapabilities {
    async fn get_capabilities(&self) -> Result<reapi::ServerCapabilities> {
        let request = reapi::GetCapabilitiesRequest {
            instance_name: self.instance_name.clone(),
        };
        self.transport
            .unary(GET_CAPABILITIES, request)
            .await
            .map_err(|e| RemoteError::grpc("GetCapabilities", e))
    }
}
