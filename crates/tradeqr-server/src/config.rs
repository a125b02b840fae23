//! Configuration management

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tradeqr_core::rate_limit::RateLimitConfig;
use tradeqr_core::SessionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Session storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(ConfigError::Invalid(format!(
                "store must be one of: sqlite, memory (got '{}')",
                other
            ))),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub database_path: PathBuf,
    pub store: StoreBackend,
    pub rate_limit_per_minute: u32,
    pub rate_limit_window_secs: u64,
    pub rate_limit_allowlist: Vec<String>,
    pub sweep_interval_secs: u64,
    pub max_code_attempts: u32,
    /// Take the client origin from `X-Forwarded-For` / `X-Real-IP`.
    /// Only enable behind a proxy that sets these headers.
    pub trust_forwarded_for: bool,
    pub cors_allow_any_origin: bool,
    pub request_timeout_secs: u64,
    /// Bearer token -> user id.
    pub tokens: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_path: PathBuf::from("tradeqr.db"),
            store: StoreBackend::Sqlite,
            rate_limit_per_minute: 10,
            rate_limit_window_secs: 60,
            rate_limit_allowlist: Vec::new(),
            sweep_interval_secs: 60,
            max_code_attempts: 3,
            trust_forwarded_for: false,
            cors_allow_any_origin: true,
            request_timeout_secs: 10,
            tokens: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the TOML file named by `TRADEQR_CONFIG` (if
    /// any), then apply environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("TRADEQR_CONFIG") {
            Ok(path) => Self::from_toml(path)?,
            Err(_) => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Load from TOML config file. Missing keys take their defaults.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = var("TRADEQR_LISTEN_ADDR") {
            self.listen_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid listen_addr: {}", e)))?;
        }

        if let Some(path) = var("TRADEQR_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }

        if let Some(store) = var("TRADEQR_STORE") {
            self.store = store.parse()?;
        }

        if let Some(limit) = var("TRADEQR_RATE_LIMIT_PER_MINUTE") {
            self.rate_limit_per_minute = limit.parse().map_err(|e| {
                ConfigError::Invalid(format!("Invalid rate_limit_per_minute: {}", e))
            })?;
        }

        if let Some(secs) = var("TRADEQR_SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = secs
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid sweep_interval_secs: {}", e)))?;
        }

        if let Some(trust) = var("TRADEQR_TRUST_FORWARDED_FOR") {
            self.trust_forwarded_for = trust.parse().unwrap_or(false);
        }

        if let Some(tokens) = var("TRADEQR_TOKENS") {
            for pair in tokens.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (token, user) = pair.split_once(':').ok_or_else(|| {
                    ConfigError::Invalid("TRADEQR_TOKENS entries must be token:user".to_string())
                })?;
                self.tokens.insert(token.to_string(), user.to_string());
            }
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit_per_minute == 0 {
            return Err(ConfigError::Invalid("rate_limit_per_minute must be > 0".to_string()));
        }

        if self.rate_limit_window_secs == 0 {
            return Err(ConfigError::Invalid("rate_limit_window_secs must be > 0".to_string()));
        }

        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep_interval_secs must be > 0".to_string()));
        }

        if self.max_code_attempts == 0 {
            return Err(ConfigError::Invalid("max_code_attempts must be > 0".to_string()));
        }

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be > 0".to_string()));
        }

        if self.tokens.keys().any(|t| t.is_empty()) || self.tokens.values().any(|u| u.is_empty()) {
            return Err(ConfigError::Invalid("tokens must map non-empty tokens to non-empty user ids".to_string()));
        }

        Ok(())
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            creations_per_window: self.rate_limit_per_minute,
            window: Duration::from_secs(self.rate_limit_window_secs),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_code_attempts: self.max_code_attempts,
            ..SessionConfig::default()
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
