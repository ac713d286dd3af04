//! Configuration types for the remote execution client

use crate::error::{RemoteError, Result};
use serde::{Deserialize, Serialize};

/// Environment variable naming the server endpoint
pub const ENV_ENDPOINT: &str = "RELAY_REMOTE_ENDPOINT";
/// Environment variable naming the instance
pub const ENV_INSTANCE: &str = "RELAY_REMOTE_INSTANCE";
/// Environment variable carrying a bearer token
pub const ENV_TOKEN: &str = "RELAY_REMOTE_TOKEN";

/// Configuration for the remote execution client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    /// Server endpoint (e.g., "grpcs://remote.example.com:8980")
    pub endpoint: String,

    /// Instance name for multi-tenant servers
    #[serde(default)]
    pub instance_name: String,

    /// Authentication configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    /// Allow results to be served from the action cache
    #[serde(default = "default_true")]
    pub remote_cache: bool,

    /// Timeout in seconds for targets without their own, and for each RPC
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Batch limit used when the server does not advertise one
    #[serde(default = "default_max_batch_size_bytes")]
    pub max_batch_size_bytes: i64,

    /// Chunk size for streamed uploads
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: usize,

    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            instance_name: String::new(),
            auth: None,
            remote_cache: true,
            timeout_secs: default_timeout_secs(),
            max_batch_size_bytes: default_max_batch_size_bytes(),
            chunk_size_bytes: default_chunk_size_bytes(),
            retry: RetryConfig::default(),
        }
    }
}

impl RemoteConfig {
    /// Create a config for the given endpoint with default settings
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Parse a config from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| RemoteError::config(format!("invalid remote config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from `RELAY_REMOTE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let endpoint = lookup(ENV_ENDPOINT)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| RemoteError::config(format!("{ENV_ENDPOINT} is not set")))?;
        let mut config = Self::new(endpoint);
        if let Some(instance) = lookup(ENV_INSTANCE) {
            config.instance_name = instance;
        }
        if let Some(token) = lookup(ENV_TOKEN).filter(|t| !t.is_empty()) {
            config.auth = Some(AuthConfig::Bearer { token });
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(RemoteError::config("endpoint must not be empty"));
        }
        if self.chunk_size_bytes == 0 {
            return Err(RemoteError::config("chunk_size_bytes must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(RemoteError::config("retry.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Authentication configuration (resolved, ready to use)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    /// Bearer token authentication (`authorization: Bearer <token>`)
    Bearer {
        /// Token value
        token: String,
    },

    /// An arbitrary header, e.g. a vendor API key
    Header {
        /// Header name (lowercase)
        name: String,
        /// Header value
        value: String,
    },
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_max_batch_size_bytes() -> i64 {
    4 * 1024 * 1024
}

fn default_chunk_size_bytes() -> usize {
    1024 * 1024
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_json_defaults() {
        let config = RemoteConfig::from_json(r#"{"endpoint": "grpc://localhost:8980"}"#).unwrap();
        assert_eq!(config.endpoint, "grpc://localhost:8980");
        assert!(config.remote_cache);
        assert_eq!(config.timeout_secs, 600);
        assert_eq!(config.retry, RetryConfig::default());
        assert!(config.auth.is_none());
    }

    #[test]
    fn test_from_json_auth_header() {
        let config = RemoteConfig::from_json(
            r#"{
                "endpoint": "grpcs://remote.example.com",
                "instance_name": "main",
                "remote_cache": false,
                "auth": {"type": "header", "name": "x-api-key", "value": "secret"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.instance_name, "main");
        assert!(!config.remote_cache);
        assert_eq!(
            config.auth,
            Some(AuthConfig::Header {
                name: "x-api-key".to_string(),
                value: "secret".to_string()
            })
        );
    }

    #[test]
    fn test_from_json_rejects_empty_endpoint() {
        assert!(matches!(
            RemoteConfig::from_json(r#"{"endpoint": ""}"#),
            Err(RemoteError::Config(_))
        ));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_ENDPOINT, "grpc://cas:8980"),
            (ENV_INSTANCE, "ci"),
            (ENV_TOKEN, "tok"),
        ]
        .into_iter()
        .collect();
        let config = RemoteConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(config.endpoint, "grpc://cas:8980");
        assert_eq!(config.instance_name, "ci");
        assert_eq!(
            config.auth,
            Some(AuthConfig::Bearer {
                token: "tok".to_string()
            })
        );
    }

    #[test]
    fn test_from_lookup_requires_endpoint() {
        assert!(RemoteConfig::from_lookup(|_| None).is_err());
    }
}
