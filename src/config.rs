//! Configuration management for Codedrop Server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::transfer::{
    GrantPolicy, CHUNK_SIZE, DEFAULT_GRANT_TTL_SECS, DEFAULT_MAX_DOWNLOADS, MAX_FILE_SIZE,
    SESSION_EXPIRY_HOURS,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
    pub share: ShareConfig,
    pub sweep: SweepConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl StorageConfig {
    /// Root for per-session chunk directories
    pub fn chunk_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Fixed at `CHUNK_SIZE` outside of tests
    pub chunk_size: usize,
    pub max_file_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShareConfig {
    pub max_downloads: u32,
    pub ttl_secs: i64,
}

impl ShareConfig {
    pub fn grant_policy(&self) -> GrantPolicy {
        GrantPolicy {
            max_downloads: self.max_downloads,
            ttl: chrono::Duration::seconds(self.ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    pub interval_secs: u64,
    pub session_ttl_hours: i64,
}

impl SweepConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_ttl_hours)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Shared credential required to start uploads; `None` leaves it open
    pub access_token: Option<String>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("./data"),
            },
            transfer: TransferConfig {
                chunk_size: CHUNK_SIZE,
                max_file_size: MAX_FILE_SIZE,
            },
            share: ShareConfig {
                max_downloads: DEFAULT_MAX_DOWNLOADS,
                ttl_secs: DEFAULT_GRANT_TTL_SECS,
            },
            sweep: SweepConfig {
                interval_secs: 300,
                session_ttl_hours: SESSION_EXPIRY_HOURS,
            },
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup, falling back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                host: lookup("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var(&lookup, "SERVER_PORT", defaults.server.port)?,
            },
            storage: StorageConfig {
                data_dir: lookup("DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.data_dir),
            },
            transfer: TransferConfig {
                chunk_size: CHUNK_SIZE,
                max_file_size: parse_var(&lookup, "MAX_FILE_SIZE", defaults.transfer.max_file_size)?,
            },
            share: ShareConfig {
                max_downloads: parse_var(
                    &lookup,
                    "SHARE_MAX_DOWNLOADS",
                    defaults.share.max_downloads,
                )?,
                ttl_secs: parse_var(&lookup, "SHARE_TTL_SECS", defaults.share.ttl_secs)?,
            },
            sweep: SweepConfig {
                interval_secs: parse_var(
                    &lookup,
                    "SWEEP_INTERVAL_SECS",
                    defaults.sweep.interval_secs,
                )?,
                session_ttl_hours: parse_var(
                    &lookup,
                    "SESSION_TTL_HOURS",
                    defaults.sweep.session_ttl_hours,
                )?,
            },
            auth: AuthConfig {
                access_token: lookup("ACCESS_TOKEN").filter(|token| !token.is_empty()),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.share.max_downloads == 0 {
            return Err(invalid("SHARE_MAX_DOWNLOADS", self.share.max_downloads));
        }
        if self.share.ttl_secs <= 0 {
            return Err(invalid("SHARE_TTL_SECS", self.share.ttl_secs));
        }
        if self.sweep.interval_secs == 0 {
            return Err(invalid("SWEEP_INTERVAL_SECS", self.sweep.interval_secs));
        }
        if self.sweep.session_ttl_hours <= 0 {
            return Err(invalid("SESSION_TTL_HOURS", self.sweep.session_ttl_hours));
        }
        if self.transfer.max_file_size == 0 {
            return Err(invalid("MAX_FILE_SIZE", self.transfer.max_file_size));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}
