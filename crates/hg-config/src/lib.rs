//! Hookgate Configuration
//!
//! Configuration is read from an optional TOML file and then overlaid with
//! `HG_*` environment variables. Every field has a default so a minimal file
//! only needs the signing secret.
//!
//! ```toml
//! [slack]
//! signing_secret = "..."
//! client_id = "123.456"
//! client_secret = "..."
//!
//! [dispatch]
//! concurrency = 64
//! ```

use hg_common::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HookgateConfig {
    pub server: ServerConfig,
    pub slack: SlackConfig,
    pub verifier: VerifierConfig,
    pub ledger: LedgerConfig,
    pub cache: CacheConfig,
    pub oauth: OAuthConfig,
    pub dispatch: DispatchConfig,
    pub delayed_response: DelayedResponseConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Port for /metrics and health checks
    pub ops_port: u16,
    pub json_logs: bool,
    /// Grace period for in-flight background work on shutdown
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 3000,
            ops_port: 9090,
            json_logs: false,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub signing_secret: SecretString,
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    pub redirect_uri: Option<String>,
    pub token_url: String,
    pub authorize_url: String,
    pub scopes: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            signing_secret: SecretString::new(""),
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            token_url: "https://slack.com/api/oauth.v2.access".to_string(),
            authorize_url: "https://slack.com/oauth/v2/authorize".to_string(),
            scopes: "commands,chat:write".to_string(),
        }
    }
}

impl SlackConfig {
    /// OAuth install flow is only served when both client credentials are set
    pub fn oauth_enabled(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub tolerance_secs: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self { tolerance_secs: 300 }
    }
}

impl VerifierConfig {
    pub fn tolerance(&self) -> Duration {
        Duration::from_secs(self.tolerance_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub processing_ttl_secs: u64,
    pub completed_ttl_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            processing_ttl_secs: 120,
            completed_ttl_secs: 7200,
        }
    }
}

impl LedgerConfig {
    pub fn processing_ttl(&self) -> Duration {
        Duration::from_secs(self.processing_ttl_secs)
    }

    pub fn completed_ttl(&self) -> Duration {
        Duration::from_secs(self.completed_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub installation_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            installation_ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn installation_ttl(&self) -> Duration {
        Duration::from_secs(self.installation_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub state_ttl_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self { state_ttl_secs: 600 }
    }
}

impl OAuthConfig {
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upstream hard deadline for the acknowledgment
    pub ack_deadline_ms: u64,
    pub concurrency: u32,
    pub queue_capacity: u32,
    pub task_retry_attempts: u32,
    pub task_retry_backoff_ms: u64,
    /// Redeliveries tolerated per tenant per minute before answering 429
    pub retry_limit_per_minute: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ack_deadline_ms: 3000,
            concurrency: 32,
            queue_capacity: 1024,
            task_retry_attempts: 3,
            task_retry_backoff_ms: 200,
            retry_limit_per_minute: 60,
        }
    }
}

impl DispatchConfig {
    pub fn ack_deadline(&self) -> Duration {
        Duration::from_millis(self.ack_deadline_ms)
    }

    /// Time the synchronous path may spend on storage round trips.
    /// Half of the upstream deadline, leaving the rest for the network.
    pub fn ack_budget(&self) -> Duration {
        self.ack_deadline() / 2
    }

    pub fn task_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.task_retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DelayedResponseConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub request_timeout_ms: u64,
    /// Hosts a response URL may point at. Empty allows any host.
    pub allowed_hosts: Vec<String>,
}

impl Default for DelayedResponseConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            request_timeout_ms: 5000,
            allowed_hosts: vec!["hooks.slack.com".to_string()],
        }
    }
}

impl DelayedResponseConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Redis backs the ledger, installation cache and OAuth state tokens
    pub redis_url: Option<String>,
    /// PostgreSQL holds installations durably
    pub database_url: Option<String>,
}

impl HookgateConfig {
    /// Load from an optional TOML file, then apply `HG_*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Overlay values from an environment lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HG_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = parse_env(&lookup, "HG_PORT")? {
            self.server.port = v;
        }
        if let Some(v) = parse_env(&lookup, "HG_OPS_PORT")? {
            self.server.ops_port = v;
        }
        if let Some(v) = parse_env(&lookup, "HG_JSON_LOGS")? {
            self.server.json_logs = v;
        }
        if let Some(v) = lookup("HG_SLACK_SIGNING_SECRET") {
            self.slack.signing_secret = SecretString::new(v);
        }
        if let Some(v) = lookup("HG_SLACK_CLIENT_ID") {
            self.slack.client_id = Some(v);
        }
        if let Some(v) = lookup("HG_SLACK_CLIENT_SECRET") {
            self.slack.client_secret = Some(SecretString::new(v));
        }
        if let Some(v) = lookup("HG_SLACK_REDIRECT_URI") {
            self.slack.redirect_uri = Some(v);
        }
        if let Some(v) = parse_env(&lookup, "HG_VERIFIER_TOLERANCE_SECS")? {
            self.verifier.tolerance_secs = v;
        }
        if let Some(v) = parse_env(&lookup, "HG_DISPATCH_CONCURRENCY")? {
            self.dispatch.concurrency = v;
        }
        if let Some(v) = lookup("HG_REDIS_URL") {
            self.storage.redis_url = Some(v);
        }
        if let Some(v) = lookup("HG_DATABASE_URL") {
            self.storage.database_url = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.slack.signing_secret.is_empty() {
            return Err(ConfigError::Invalid(
                "slack.signing_secret is required".to_string(),
            ));
        }
        if self.verifier.tolerance_secs == 0 {
            return Err(ConfigError::Invalid(
                "verifier.tolerance_secs must be positive".to_string(),
            ));
        }
        if self.ledger.processing_ttl_secs == 0 || self.ledger.completed_ttl_secs == 0 {
            return Err(ConfigError::Invalid("ledger TTLs must be positive".to_string()));
        }
        if self.ledger.processing_ttl_secs >= self.ledger.completed_ttl_secs {
            return Err(ConfigError::Invalid(
                "ledger.processing_ttl_secs must be shorter than ledger.completed_ttl_secs"
                    .to_string(),
            ));
        }
        if self.cache.installation_ttl_secs == 0 || self.oauth.state_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache and state TTLs must be positive".to_string(),
            ));
        }
        if self.dispatch.concurrency == 0 || self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.concurrency and dispatch.queue_capacity must be positive".to_string(),
            ));
        }
        if self.delayed_response.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "delayed_response.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
        None => Ok(None),
    }
}
