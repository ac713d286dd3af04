//! gRPC channel management and the shared call helpers

use crate::config::{AuthConfig, RemoteConfig};
use crate::error::{RemoteError, Result};
use futures::Stream;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tonic::client::Grpc;
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::InterceptedService;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::service::Interceptor;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info};

/// Shared gRPC channel for all remote services
#[derive(Clone)]
pub struct GrpcChannel {
    inner: Channel,
    config: Arc<RemoteConfig>,
}

impl GrpcChannel {
    /// Connect to the configured endpoint
    pub async fn connect(config: &RemoteConfig) -> Result<Self> {
        let endpoint = create_endpoint(config)?;

        info!(endpoint = %config.endpoint, "Connecting to remote execution server");

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| RemoteError::connection_failed(&config.endpoint, e.to_string()))?;

        debug!("Connected to remote execution server");

        Ok(Self {
            inner: channel,
            config: Arc::new(config.clone()),
        })
    }

    /// Create a channel that connects on first use
    pub fn connect_lazy(config: &RemoteConfig) -> Result<Self> {
        let endpoint = create_endpoint(config)?;
        Ok(Self {
            inner: endpoint.connect_lazy(),
            config: Arc::new(config.clone()),
        })
    }

    /// Call helper with auth headers attached
    #[must_use]
    pub fn transport(&self) -> GrpcTransport {
        let interceptor = AuthInterceptor::new(&self.config);
        let service = InterceptedService::new(self.inner.clone(), interceptor);
        GrpcTransport {
            grpc: Grpc::new(service),
        }
    }

    /// Instance name for requests
    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.config.instance_name
    }

    /// The configuration the channel was created from
    #[must_use]
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }
}

type AuthedGrpc = Grpc<InterceptedService<Channel, AuthInterceptor>>;

/// Issues raw gRPC calls by method path with prost encoding
#[derive(Clone)]
pub struct GrpcTransport {
    grpc: AuthedGrpc,
}

impl GrpcTransport {
    async fn ready(&self) -> std::result::Result<AuthedGrpc, tonic::Status> {
        let mut grpc = self.grpc.clone();
        grpc.ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("service was not ready: {e}")))?;
        Ok(grpc)
    }

    /// Unary call
    pub async fn unary<Req, Resp>(
        &self,
        path: &'static str,
        request: Req,
    ) -> std::result::Result<Resp, tonic::Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.ready().await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .unary(tonic::Request::new(request), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }

    /// Server-streaming call
    pub async fn server_streaming<Req, Resp>(
        &self,
        path: &'static str,
        request: Req,
    ) -> std::result::Result<Streaming<Resp>, tonic::Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.ready().await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .server_streaming(tonic::Request::new(request), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }

    /// Client-streaming call
    pub async fn client_streaming<S, Req, Resp>(
        &self,
        path: &'static str,
        requests: S,
    ) -> std::result::Result<Resp, tonic::Status>
    where
        S: Stream<Item = Req> + Send + 'static,
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.ready().await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .client_streaming(tonic::Request::new(requests), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }
}

#[derive(Clone)]
enum AuthMode {
    Header(AsciiMetadataKey, AsciiMetadataValue),
    None,
}

/// Interceptor that adds authentication headers to requests
#[derive(Clone)]
pub struct AuthInterceptor {
    auth_mode: AuthMode,
}

impl AuthInterceptor {
    /// Create an interceptor from config
    #[must_use]
    pub fn new(config: &RemoteConfig) -> Self {
        let auth_mode = match &config.auth {
            Some(AuthConfig::Bearer { token }) => {
                header("authorization", &format!("Bearer {token}"))
            }
            Some(AuthConfig::Header { name, value }) => header(name, value),
            None => AuthMode::None,
        };
        Self { auth_mode }
    }

    /// Apply auth headers to a metadata map
    pub fn apply_to_metadata(&self, metadata: &mut MetadataMap) {
        if let AuthMode::Header(key, value) = &self.auth_mode {
            metadata.insert(key.clone(), value.clone());
        }
    }
}

fn header(name: &str, value: &str) -> AuthMode {
    let key = AsciiMetadataKey::from_str(&name.to_ascii_lowercase());
    let value = AsciiMetadataValue::try_from(value);
    match (key, value) {
        (Ok(key), Ok(value)) => AuthMode::Header(key, value),
        _ => {
            tracing::error!(
                header = name,
                "Auth header has invalid characters, proceeding without auth"
            );
            AuthMode::None
        }
    }
}

impl Interceptor for AuthInterceptor {
    fn call(
        &mut self,
        mut request: tonic::Request<()>,
    ) -> std::result::Result<tonic::Request<()>, tonic::Status> {
        self.apply_to_metadata(request.metadata_mut());
        Ok(request)
    }
}

/// Rewrite `grpc://`, `grpcs://` and bare endpoints into URIs tonic accepts
fn normalize_endpoint(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("grpcs://") {
        format!("https://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("grpc://") {
        format!("http://{rest}")
    } else if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

fn create_endpoint(config: &RemoteConfig) -> Result<Endpoint> {
    let uri = normalize_endpoint(&config.endpoint);

    debug!(original = %config.endpoint, normalized = %uri, "Normalizing endpoint URL");

    let mut endpoint = Endpoint::from_shared(uri.clone()).map_err(|e| {
        RemoteError::config(format!("Invalid endpoint '{}': {}", config.endpoint, e))
    })?;

    endpoint = endpoint
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(30));

    if uri.starts_with("https://") {
        let tls = ClientTlsConfig::new().with_native_roots();
        endpoint = endpoint
            .tls_config(tls)
            .map_err(|e| RemoteError::config(format!("TLS configuration error: {e}")))?;
    }

    endpoint = endpoint
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true);

    Ok(endpoint)
}
