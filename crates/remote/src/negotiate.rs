//! Capability negotiation
//!
//! Before any action runs, the server must speak API 2.0.0 and hash with
//! SHA-256. The first successful check is remembered; a failed check is not,
//! so checking again queries the server again.

use crate::client::Capabilities;
use crate::error::{RemoteError, Result};
use crate::proto::semver::SemVer;
use crate::reapi::{self, digest_function};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// API version this client speaks
pub const REQUIRED_API_VERSION: (i32, i32, i32) = (2, 0, 0);

/// What was agreed with the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedCapabilities {
    /// Lowest API version the server supports
    pub low_api_version: SemVer,
    /// Highest API version the server supports
    pub high_api_version: SemVer,
    /// Largest total size of a batch call; larger transfers use ByteStream
    pub max_batch_total_size_bytes: i64,
}

/// Check a server's capabilities against what this client needs
pub fn check_capabilities(
    capabilities: &reapi::ServerCapabilities,
    fallback_batch_size: i64,
) -> Result<NegotiatedCapabilities> {
    let (low, high) = api_version_range(capabilities)?;
    let (major, minor, patch) = REQUIRED_API_VERSION;
    let required = SemVer::new(major, minor, patch);
    if required.key() < low.key() || required.key() > high.key() {
        return Err(RemoteError::incompatible(format!(
            "unsupported remote execution API version: client requires {required} but server supports {low} - {high}"
        )));
    }

    let cache = capabilities
        .cache_capabilities
        .as_ref()
        .ok_or_else(|| RemoteError::incompatible("server does not report cache capabilities"))?;
    let sha256 = digest_function::Value::Sha256 as i32;
    if !cache.digest_functions.contains(&sha256) {
        let offered: Vec<&str> = cache
            .digest_functions
            .iter()
            .map(|f| {
                digest_function::Value::try_from(*f)
                    .unwrap_or(digest_function::Value::Unknown)
                    .as_str_name()
            })
            .collect();
        return Err(RemoteError::incompatible(format!(
            "server does not support SHA256 digests; supported digest functions: [{}]",
            offered.join(", ")
        )));
    }

    if let Some(execution) = &capabilities.execution_capabilities
        && !execution.exec_enabled
    {
        return Err(RemoteError::incompatible(
            "remote execution is not enabled on the server",
        ));
    }

    let max_batch_total_size_bytes = if cache.max_batch_total_size_bytes > 0 {
        cache.max_batch_total_size_bytes
    } else {
        fallback_batch_size
    };

    Ok(NegotiatedCapabilities {
        low_api_version: low,
        high_api_version: high,
        max_batch_total_size_bytes,
    })
}

fn api_version_range(capabilities: &reapi::ServerCapabilities) -> Result<(SemVer, SemVer)> {
    let deprecated = capabilities.deprecated_api_version.clone();
    let low = capabilities
        .low_api_version
        .clone()
        .or_else(|| deprecated.clone());
    let high = capabilities
        .high_api_version
        .clone()
        .or_else(|| deprecated.clone())
        .or_else(|| low.clone());
    match (low, high) {
        (Some(low), Some(high)) => Ok((low, high)),
        _ => Err(RemoteError::incompatible(
            "server does not report a supported API version",
        )),
    }
}

/// Queries and caches the server's capabilities
pub struct Negotiator {
    service: Arc<dyn Capabilities>,
    fallback_batch_size: i64,
    negotiated: OnceCell<NegotiatedCapabilities>,
}

impl Negotiator {
    /// Create a negotiator over a capabilities service
    pub fn new(service: Arc<dyn Capabilities>, fallback_batch_size: i64) -> Self {
        Self {
            service,
            fallback_batch_size,
            negotiated: OnceCell::new(),
        }
    }

    /// Negotiate once; later calls return the remembered result
    pub async fn check(&self) -> Result<&NegotiatedCapabilities> {
        self.negotiated
            .get_or_try_init(|| async {
                debug!("Querying server capabilities");
                let capabilities = self.service.get_capabilities().await?;
                let negotiated = check_capabilities(&capabilities, self.fallback_batch_size)?;
                info!(
                    low = %negotiated.low_api_version,
                    high = %negotiated.high_api_version,
                    max_batch_bytes = negotiated.max_batch_total_size_bytes,
                    "Remote execution server is compatible"
                );
                Ok(negotiated)
            })
            .await
    }
}
