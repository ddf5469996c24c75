//! Authentication settings

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid auth configuration: {0}")]
pub struct ConfigError(pub String);

/// Where credentials are ultimately checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// Forward over the hub link (edges)
    Hub,
    /// The hub's configured user directory
    Directory,
    /// External HTTP(S) service
    Http(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// `hub`, `directory`, or an http(s) URL
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Bearer token for the HTTP backend
    #[serde(default)]
    pub credential: Option<String>,

    /// Per-attempt backend timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Retries after the first attempt when the backend is unreachable
    #[serde(default = "default_retry")]
    pub retry: u32,

    /// Delay before the first retry; doubles each time
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default)]
    pub tls_insecure: bool,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default)]
    pub user_cache_path: Option<PathBuf>,

    /// ACL snapshot pull period
    #[serde(default = "default_pull_interval_secs")]
    pub pull_interval_secs: u64,

    #[serde(default = "default_true")]
    pub track_sessions: bool,

    #[serde(default = "default_true")]
    pub allow_cache_fallback: bool,

    #[serde(default = "default_server_id")]
    pub server_id: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            credential: None,
            timeout_ms: default_timeout_ms(),
            retry: default_retry(),
            retry_backoff_ms: default_retry_backoff_ms(),
            tls_insecure: false,
            cache_ttl_secs: default_cache_ttl_secs(),
            user_cache_path: None,
            pull_interval_secs: default_pull_interval_secs(),
            track_sessions: true,
            allow_cache_fallback: true,
            server_id: default_server_id(),
        }
    }
}

fn default_backend() -> String {
    "hub".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_retry() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_pull_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_server_id() -> String {
    "chorus".to_string()
}

impl AuthConfig {
    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        match self.backend.as_str() {
            "hub" => Ok(BackendKind::Hub),
            "directory" => Ok(BackendKind::Directory),
            url if url.starts_with("http://") || url.starts_with("https://") => {
                Ok(BackendKind::Http(url.to_string()))
            }
            other => Err(ConfigError(format!(
                "backend must be \"hub\", \"directory\" or an http(s) URL, got {:?}",
                other
            ))),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend_kind()?;
        if self.timeout_ms == 0 {
            return Err(ConfigError("timeout_ms must be positive".into()));
        }
        if self.pull_interval_secs == 0 {
            return Err(ConfigError("pull_interval_secs must be positive".into()));
        }
        if self.server_id.is_empty() {
            return Err(ConfigError("server_id must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: AuthConfig = toml::from_str("").unwrap();
        assert_eq!(config.backend_kind().unwrap(), BackendKind::Hub);
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.retry, 2);
        assert!(config.track_sessions);
        assert!(config.allow_cache_fallback);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_kinds() {
        let mut config = AuthConfig {
            backend: "https://auth.example.com/verify".into(),
            ..AuthConfig::default()
        };
        assert_eq!(
            config.backend_kind().unwrap(),
            BackendKind::Http("https://auth.example.com/verify".into())
        );

        config.backend = "directory".into();
        assert_eq!(config.backend_kind().unwrap(), BackendKind::Directory);

        config.backend = "ldap://nope".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = AuthConfig {
            timeout_ms: 0,
            ..AuthConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
