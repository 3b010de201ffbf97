//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/repolens/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/repolens/` (~/.config/repolens/)
//! - Data: `$XDG_DATA_HOME/repolens/` (~/.local/share/repolens/)
//! - State/Logs: `$XDG_STATE_HOME/repolens/` (~/.local/state/repolens/)
//!
//! Deploy-time settings live here. Runtime-mutable settings (provider choice,
//! per-depth models, active prompt templates) live in the `app_settings`
//! table and are resolved per job by [`crate::queue::RuntimeSettings`].

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// AI provider credentials and endpoints
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

/// Which AI backend serves chat completions
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Managed multi-model gateway (OpenRouter-style)
    Gateway,
    /// Direct vendor API (OpenAI-style)
    Direct,
}

impl ProviderKind {
    /// Returns the default endpoint for this backend
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::Gateway => "https://openrouter.ai/api/v1",
            ProviderKind::Direct => "https://api.openai.com/v1",
        }
    }

    /// Returns the provider tag recorded in the usage ledger
    pub fn tag(&self) -> &'static str {
        match self {
            ProviderKind::Gateway => "openrouter",
            ProviderKind::Direct => "openai",
        }
    }
}

/// AI provider configuration
///
/// The configured kind is a preference, not a guarantee: selecting `direct`
/// without a direct credential falls back to the gateway at client-creation
/// time.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Preferred backend
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,

    /// Gateway API key (can also use OPENROUTER_API_KEY)
    pub gateway_api_key: Option<String>,

    /// Gateway endpoint override
    pub gateway_base_url: Option<String>,

    /// Direct vendor API key (can also use OPENAI_API_KEY)
    pub direct_api_key: Option<String>,

    /// Direct vendor endpoint override
    pub direct_base_url: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// Public app URL sent as the gateway's HTTP-Referer attribution header
    pub app_url: Option<String>,

    /// App name sent as the gateway's X-Title attribution header
    pub app_name: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            gateway_api_key: None,
            gateway_base_url: None,
            direct_api_key: None,
            direct_base_url: None,
            timeout_secs: default_provider_timeout(),
            app_url: None,
            app_name: None,
        }
    }
}

impl ProviderConfig {
    /// Gateway key from config or environment
    pub fn gateway_key(&self) -> Option<String> {
        self.gateway_api_key
            .clone()
            .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
    }

    /// Direct vendor key from config or environment
    pub fn direct_key(&self) -> Option<String> {
        self.direct_api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::Gateway
}

fn default_provider_timeout() -> u64 {
    120
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/repolens/config.toml` (~/.config/repolens/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("repolens").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/repolens/` (~/.local/share/repolens/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("repolens")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/repolens/` (~/.local/state/repolens/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("repolens")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/repolens/data.db` (~/.local/share/repolens/data.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("data.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/repolens/repolens.log` (~/.local/state/repolens/repolens.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("repolens.log")
    }
}
