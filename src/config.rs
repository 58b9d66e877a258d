//! # Configuration
//!
//! `GateConfig` is read from `scopegate.toml` (by default
//! `<config dir>/scopegate/config.toml`), then `SCOPEGATE_*` environment
//! variables override individual values.
//!
//! ```toml
//! app_origin = "https://chat.example.com"
//! redirect_path = "/oauth/callback"
//! disconnect_policy = "forced"
//! providers_file = "/etc/scopegate/providers.toml"
//!
//! [identity]
//! base_url = "https://id.example.com/api/"
//! timeout_secs = 15
//!
//! [connect]
//! deadline_secs = 300
//! poll_interval_ms = 500
//!
//! [retry]
//! max_attempts = 3
//! initial_backoff_ms = 250
//! max_backoff_ms = 8000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::callback::normalize_origin;
use crate::error::{GateError, Result};
use crate::gate::RetryPolicy;
use crate::provider::ConnectionRegistry;
use crate::store::DisconnectPolicy;

pub const CONFIG_DIR: &str = "scopegate";
pub const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateConfig {
    /// Origin the chat UI is served from; popup messages must match it
    #[serde(default = "default_app_origin")]
    pub app_origin: String,

    #[serde(default = "default_redirect_path")]
    pub redirect_path: String,

    #[serde(default)]
    pub disconnect_policy: DisconnectPolicy,

    /// Provider catalogue (TOML or YAML); the built-in catalogue when unset
    #[serde(default)]
    pub providers_file: Option<PathBuf>,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub connect: ConnectConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_url")]
    pub base_url: String,
    #[serde(default = "default_identity_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectConfig {
    /// Upper bound on one popup flow
    #[serde(default = "default_deadline")]
    pub deadline_secs: u64,
    /// How often popup liveness is polled
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_app_origin() -> String {
    "http://localhost:3000".to_string()
}

fn default_redirect_path() -> String {
    "/oauth/callback".to_string()
}

fn default_identity_url() -> String {
    "http://localhost:8787/".to_string()
}

fn default_identity_timeout() -> u64 {
    15
}

fn default_deadline() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    250
}

fn default_max_backoff() -> u64 {
    8_000
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            base_url: default_identity_url(),
            timeout_secs: default_identity_timeout(),
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            app_origin: default_app_origin(),
            redirect_path: default_redirect_path(),
            disconnect_policy: DisconnectPolicy::default(),
            providers_file: None,
            identity: IdentityConfig::default(),
            connect: ConnectConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl GateConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| GateError::Config(format!("invalid config: {}", e)))?;
        config.validated()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GateError::Config(format!("failed to read {:?}: {}", path.as_ref(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// `<config dir>/scopegate/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| {
            GateError::Config("could not determine config directory".to_string())
        })?;
        Ok(dir.join(CONFIG_DIR).join(CONFIG_FILENAME))
    }

    /// Load the default config file if present, then apply process env.
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path()?;
        let config = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.with_env_overrides(&|key| std::env::var(key).ok())
    }

    /// Apply `SCOPEGATE_*` overrides from the given lookup.
    pub fn with_env_overrides<F>(mut self, env_lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(origin) = env_lookup("SCOPEGATE_APP_ORIGIN") {
            self.app_origin = origin;
        }
        if let Some(url) = env_lookup("SCOPEGATE_IDENTITY_URL") {
            self.identity.base_url = url;
        }
        if let Some(path) = env_lookup("SCOPEGATE_PROVIDERS_FILE") {
            self.providers_file = Some(PathBuf::from(path));
        }
        if let Some(secs) = env_lookup("SCOPEGATE_CONNECT_DEADLINE_SECS") {
            let parsed = secs.parse::<u64>().map_err(|_| {
                GateError::Config(format!(
                    "invalid SCOPEGATE_CONNECT_DEADLINE_SECS value `{}`: expected positive integer seconds",
                    secs
                ))
            })?;
            self.connect.deadline_secs = parsed;
        }
        if let Some(policy) = env_lookup("SCOPEGATE_DISCONNECT_POLICY") {
            self.disconnect_policy = match policy.to_ascii_lowercase().as_str() {
                "forced" => DisconnectPolicy::Forced,
                "strict" => DisconnectPolicy::Strict,
                other => {
                    return Err(GateError::Config(format!(
                        "invalid SCOPEGATE_DISCONNECT_POLICY value `{}`: expected forced or strict",
                        other
                    )))
                }
            };
        }
        self.validated()
    }

    fn validated(mut self) -> Result<Self> {
        self.app_origin = normalize_origin(&self.app_origin)?;
        if !self.redirect_path.starts_with('/') {
            self.redirect_path = format!("/{}", self.redirect_path);
        }
        // A zero deadline would reject every connect.
        self.connect.deadline_secs = self.connect.deadline_secs.max(1);
        self.connect.poll_interval_ms = self.connect.poll_interval_ms.max(10);
        self.retry.max_attempts = self.retry.max_attempts.max(1);
        url::Url::parse(&self.identity.base_url).map_err(|e| {
            GateError::Config(format!(
                "invalid identity base_url '{}': {}",
                self.identity.base_url, e
            ))
        })?;
        Ok(self)
    }

    /// Absolute URL the provider redirects the popup back to.
    pub fn redirect_url(&self) -> String {
        format!("{}{}", self.app_origin, self.redirect_path)
    }

    pub fn connect_deadline(&self) -> Duration {
        Duration::from_secs(self.connect.deadline_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.connect.poll_interval_ms)
    }

    pub fn identity_timeout(&self) -> Duration {
        Duration::from_secs(self.identity.timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    /// Provider catalogue named by `providers_file`, or the built-in one.
    pub fn load_registry(&self) -> Result<ConnectionRegistry> {
        match &self.providers_file {
            Some(path) => ConnectionRegistry::load(path),
            None => Ok(ConnectionRegistry::builtin()),
        }
    }
}
