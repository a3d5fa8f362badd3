//! Configuration for the visitor identity engine.
//!
//! `org_id` is the only required field. Everything else falls back to the
//! defaults in the crate root.

use crate::{
    AuthState, ConfigError, DEFAULT_MAX_RETRIES, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_SERVICE_URL,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted for the config file path.
pub const CONFIG_PATH_ENV: &str = "VISITOR_ID_CONFIG";

/// Extra request intervals granted to consumers on top of the retry budget.
const CONSUMER_WAIT_BUFFER: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VisitorConfig {
    pub org_id: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default)]
    pub existing_id: Option<String>,
    #[serde(default)]
    pub data_provider_id: Option<i64>,
    #[serde(default)]
    pub auth_state: Option<AuthState>,
    #[serde(default)]
    pub known_identifier: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_service_url")]
    pub service_url: String,
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

/// Known identifier to link on first acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkParams {
    pub known_id: String,
    pub data_provider_id: i64,
    pub auth_state: Option<AuthState>,
}

fn default_max_retries() -> i32 {
    DEFAULT_MAX_RETRIES
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_service_url() -> String {
    DEFAULT_SERVICE_URL.to_string()
}

impl VisitorConfig {
    pub fn new(org_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            existing_id: None,
            data_provider_id: None,
            auth_state: None,
            known_identifier: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            service_url: DEFAULT_SERVICE_URL.to_string(),
            storage_path: None,
        }
    }

    /// Set the maximum number of acquisition attempts.
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set a known visitor id that supersedes any persisted record.
    pub fn with_existing_id(mut self, id: impl Into<String>) -> Self {
        self.existing_id = Some(id.into());
        self
    }

    /// Set the known identifier to link on first launch.
    pub fn with_known_identifier(
        mut self,
        known_id: impl Into<String>,
        data_provider_id: i64,
        auth_state: Option<AuthState>,
    ) -> Self {
        self.known_identifier = Some(known_id.into());
        self.data_provider_id = Some(data_provider_id);
        self.auth_state = auth_state;
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_service_url(mut self, url: impl Into<String>) -> Self {
        self.service_url = url.into();
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Attempts an acquisition cycle will make; zero disables auto-fetch.
    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.max(0) as u32
    }

    /// Upper bound a consumer waits on an in-flight acquisition.
    pub fn consumer_wait(&self) -> Duration {
        self.request_timeout()
            .saturating_mul(self.attempt_budget().saturating_add(CONSUMER_WAIT_BUFFER))
    }

    /// The link pair, only when both the known identifier and the data
    /// provider are configured.
    pub fn link_params(&self) -> Option<LinkParams> {
        match (&self.known_identifier, self.data_provider_id) {
            (Some(known_id), Some(data_provider_id)) if !known_id.is_empty() => Some(LinkParams {
                known_id: known_id.clone(),
                data_provider_id,
                auth_state: self.auth_state,
            }),
            _ => None,
        }
    }

    /// The override id, ignoring empty strings.
    pub fn existing_id(&self) -> Option<&str> {
        self.existing_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Load and validate from `path`, falling back to `VISITOR_ID_CONFIG`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(config_path_from_env)
            .ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - org_id is not blank
    /// - request_timeout_ms > 0
    /// - service_url is not blank
    /// - a known identifier is not configured without a data provider
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.org_id.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "org_id".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms".to_string(),
                value: self.request_timeout_ms.to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        if self.service_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "service_url".to_string(),
                value: self.service_url.clone(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.known_identifier.is_some() && self.data_provider_id.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "data_provider_id".to_string(),
                value: "none".to_string(),
                reason: "required when known_identifier is set".to_string(),
            });
        }
        Ok(())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from)
}
