//! Client configuration.
//!
//! Sources merge in order, later ones winning: built-in defaults, then
//! `marketo.yaml` (or the file given to `load_from`), then `MARKETO_*`
//! environment variables such as `MARKETO_CLIENT_SECRET`. The merged result
//! is checked by `validate` before use.

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::api::{DEFAULT_API_VERSION, MAX_PAGE_SIZE};
use crate::auth::DEFAULT_EXPIRY_BUFFER_SECS;

/// Default configuration file looked up by [`MarketoConfig::load`].
pub const DEFAULT_CONFIG_FILE: &str = "marketo.yaml";

/// Environment variable prefix, e.g. `MARKETO_CLIENT_ID`.
pub const ENV_PREFIX: &str = "MARKETO_";

/// Connection and credential settings for one Marketo instance.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarketoConfig {
    /// Identity service base URL, e.g. `https://123-abc-456.mktorest.com/identity`.
    pub identity_endpoint: String,
    /// REST API base URL, e.g. `https://123-abc-456.mktorest.com/rest`.
    pub api_endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// `batchSize` for change polling. Marketo caps it at 300.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_expiry_buffer")]
    pub token_expiry_buffer_secs: u64,
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

const fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}

const fn default_expiry_buffer() -> u64 {
    DEFAULT_EXPIRY_BUFFER_SECS
}

impl Default for MarketoConfig {
    fn default() -> Self {
        Self {
            identity_endpoint: String::new(),
            api_endpoint: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            api_version: default_api_version(),
            page_size: default_page_size(),
            token_expiry_buffer_secs: default_expiry_buffer(),
        }
    }
}

// Keep the secret out of logs and panic messages.
impl std::fmt::Debug for MarketoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketoConfig")
            .field("identity_endpoint", &self.identity_endpoint)
            .field("api_endpoint", &self.api_endpoint)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("api_version", &self.api_version)
            .field("page_size", &self.page_size)
            .field("token_expiry_buffer_secs", &self.token_expiry_buffer_secs)
            .finish()
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

impl MarketoConfig {
    pub fn new(identity_endpoint: &str, client_id: &str, client_secret: &str, api_endpoint: &str) -> Self {
        Self {
            identity_endpoint: identity_endpoint.to_string(),
            api_endpoint: api_endpoint.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            ..Self::default()
        }
    }

    /// Load configuration from all sources.
    ///
    /// Sources are merged in priority order:
    /// 1. Struct defaults (lowest)
    /// 2. marketo.yaml file (if exists)
    /// 3. Environment variables with MARKETO_ prefix (highest)
    ///
    /// # Errors
    /// Returns an error if configuration cannot be loaded or is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration with a custom YAML file path.
    ///
    /// # Errors
    /// Returns an error if configuration cannot be loaded or is invalid.
    pub fn load_from(yaml_path: &str) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Yaml::file(yaml_path))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    /// Extract and validate from an already assembled figment.
    ///
    /// # Errors
    /// Returns an error if extraction fails or a value is invalid.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("identity_endpoint", &self.identity_endpoint),
            ("api_endpoint", &self.api_endpoint),
        ] {
            if !(value.starts_with("http://") || value.starts_with("https://")) {
                return Err(ConfigError::Validation(format!(
                    "{name} must be an http(s) URL. Set {ENV_PREFIX}{} or configure in {DEFAULT_CONFIG_FILE}.",
                    name.to_uppercase()
                )));
            }
        }

        if self.client_id.is_empty() {
            return Err(ConfigError::Validation(format!(
                "client_id is required. Set {ENV_PREFIX}CLIENT_ID or configure in {DEFAULT_CONFIG_FILE}."
            )));
        }

        if self.client_secret.is_empty() {
            return Err(ConfigError::Validation(format!(
                "client_secret is required. Set {ENV_PREFIX}CLIENT_SECRET or configure in {DEFAULT_CONFIG_FILE}."
            )));
        }

        if self.api_version.trim_matches('/').is_empty() {
            return Err(ConfigError::Validation("api_version cannot be empty".into()));
        }

        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Validation(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }

        Ok(())
    }
}
