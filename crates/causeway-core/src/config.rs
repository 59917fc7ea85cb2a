//! Configuration system for Causeway.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAUSEWAY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/causeway/config.toml
//!   3. ~/.config/causeway/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CausewayConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub federation: FederationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// This server's own address on the federation network. Verification
    /// requests travel with this as their apparent sender.
    pub server_id: String,
    /// Domains this server is authoritative for. A trust claim naming any
    /// other target is malformed.
    pub domains: Vec<String>,
    /// Shared dialback secret. Empty = generate a random one at startup.
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address for inbound federation streams.
    pub listen_addr: String,
    /// Listen port. Also the default port for outbound connections.
    pub port: u16,
    /// Per-candidate-address connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Accept peers that do not speak the verification protocol,
    /// trusting them on transport connectivity alone.
    pub legacy_allowed: bool,
    /// Close trusted connections idle longer than this, in seconds.
    pub idle_timeout_secs: u64,
    /// Fail queued packets older than this, in seconds.
    pub queue_timeout_secs: u64,
    /// Sweeper period in seconds.
    pub sweep_interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            server_id: "s2s.localdomain".to_string(),
            domains: vec!["localdomain".to_string()],
            secret: String::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: 5269,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            legacy_allowed: false,
            idle_timeout_secs: 900,
            queue_timeout_secs: 90,
            sweep_interval_secs: 30,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("causeway")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CausewayConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CausewayConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAUSEWAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CausewayConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CAUSEWAY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CAUSEWAY_IDENTITY__SERVER_ID") {
            self.identity.server_id = v;
        }
        if let Ok(v) = std::env::var("CAUSEWAY_IDENTITY__DOMAINS") {
            self.identity.domains = v.split(',').map(|d| d.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("CAUSEWAY_IDENTITY__SECRET") {
            self.identity.secret = v;
        }
        if let Ok(v) = std::env::var("CAUSEWAY_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Ok(v) = std::env::var("CAUSEWAY_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("CAUSEWAY_FEDERATION__LEGACY_ALLOWED") {
            self.federation.legacy_allowed = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CAUSEWAY_FEDERATION__IDLE_TIMEOUT_SECS") {
            if let Ok(p) = v.parse() {
                self.federation.idle_timeout_secs = p;
            }
        }
        if let Ok(v) = std::env::var("CAUSEWAY_FEDERATION__QUEUE_TIMEOUT_SECS") {
            if let Ok(p) = v.parse() {
                self.federation.queue_timeout_secs = p;
            }
        }
    }
}
