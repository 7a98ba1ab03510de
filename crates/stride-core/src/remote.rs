use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;

use crate::config::{normalize_base_url, read_env_u64, read_non_empty_env};
use crate::error::{Result, StrideError};
use crate::models::{Goal, Identity, Integration, Task};

/// Authoritative remote store, consulted after hydration and on every
/// refresh. Failures surface only through the sync status machine.
pub trait RemoteDataSource: Send + Sync {
    fn fetch_tasks(&self) -> Result<Vec<Task>>;
    fn fetch_goals(&self) -> Result<Vec<Goal>>;
    fn fetch_integrations(&self) -> Result<Vec<Integration>>;
}

/// Identity provider, consulted once at hydration start.
pub trait AuthCollaborator: Send + Sync {
    fn current_user(&self) -> Result<Option<Identity>>;
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout_ms: u64,
}

impl RemoteConfig {
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let base_url = read_non_empty_env("STRIDE_REMOTE_URL")?;
        Some(Self {
            base_url: normalize_base_url(&base_url),
            auth_token: read_non_empty_env("STRIDE_REMOTE_TOKEN"),
            timeout_ms: read_env_u64("STRIDE_REMOTE_TIMEOUT_MS").unwrap_or(5_000),
        })
    }
}

/// Blocking HTTP adapter implementing both collaborator traits.
#[derive(Clone)]
pub struct HttpRemote {
    config: RemoteConfig,
    http: Client,
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemote")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                StrideError::Validation(format!("invalid STRIDE_REMOTE_TOKEN: {e}"))
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self { config, http })
    }

    #[must_use]
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.config.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .map_err(|e| StrideError::Network(format!("GET {path}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StrideError::Network(format!("GET {path}: HTTP {status}")));
        }
        response
            .json::<T>()
            .map_err(|e| StrideError::Network(format!("GET {path}: invalid body: {e}")))
    }
}

impl RemoteDataSource for HttpRemote {
    fn fetch_tasks(&self) -> Result<Vec<Task>> {
        self.get_json("/api/tasks")
    }

    fn fetch_goals(&self) -> Result<Vec<Goal>> {
        self.get_json("/api/goals")
    }

    fn fetch_integrations(&self) -> Result<Vec<Integration>> {
        self.get_json("/api/integrations")
    }
}

impl AuthCollaborator for HttpRemote {
    fn current_user(&self) -> Result<Option<Identity>> {
        let url = format!("{}/api/me", self.config.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .map_err(|e| StrideError::Network(format!("GET /api/me: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StrideError::Network(format!("GET /api/me: HTTP {status}")));
        }
        let identity = response
            .json::<Identity>()
            .map_err(|e| StrideError::Network(format!("GET /api/me: invalid body: {e}")))?;
        Ok(Some(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_config_reads_env() {
        // Only this test touches the STRIDE_REMOTE_* variables.
        unsafe {
            std::env::set_var("STRIDE_REMOTE_URL", "https://api.stride.app/");
            std::env::set_var("STRIDE_REMOTE_TIMEOUT_MS", "250");
        }
        let config = RemoteConfig::from_env().expect("config");
        assert_eq!(config.base_url, "https://api.stride.app");
        assert_eq!(config.timeout_ms, 250);
        unsafe {
            std::env::remove_var("STRIDE_REMOTE_URL");
            std::env::remove_var("STRIDE_REMOTE_TIMEOUT_MS");
        }
    }

    #[test]
    fn unreachable_remote_fails_with_network_error() {
        let remote = HttpRemote::new(RemoteConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            auth_token: None,
            timeout_ms: 200,
        })
        .expect("client");

        let err = remote.fetch_tasks().expect_err("must fail");
        assert_eq!(err.code(), "NETWORK_ERROR");
    }
}
