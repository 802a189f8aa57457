//! Configuration management for Stitch Server

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::upload::DEFAULT_CLEANUP_DELAY_MS;

/// Default request body limit for a single chunk: 16MB
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Staging directory for chunk containers
    pub chunk_dir: PathBuf,
    /// Directory holding completed artifacts
    pub artifact_dir: PathBuf,
    /// URL prefix under which artifacts are served
    pub public_path: String,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub cleanup_delay_ms: u64,
    pub stale_upload_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_chunk_size: usize,
}

impl UploadConfig {
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    pub fn stale_upload_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_upload_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Error raised for a variable that is set but cannot be parsed
#[derive(Debug, thiserror::Error)]
#[error("Invalid value for {name}: {value}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            storage: StorageConfig {
                chunk_dir: PathBuf::from("./data/chunks"),
                artifact_dir: PathBuf::from("./data/files"),
                public_path: "/files".to_string(),
            },
            upload: UploadConfig {
                cleanup_delay_ms: DEFAULT_CLEANUP_DELAY_MS,
                stale_upload_ttl_secs: 24 * 60 * 60,
                sweep_interval_secs: 300,
                max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
            },
            storage: StorageConfig {
                chunk_dir: env::var("CHUNK_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.chunk_dir),
                artifact_dir: env::var("ARTIFACT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.artifact_dir),
                public_path: env::var("PUBLIC_PATH").unwrap_or(defaults.storage.public_path),
            },
            upload: UploadConfig {
                cleanup_delay_ms: parse_var("CLEANUP_DELAY_MS", defaults.upload.cleanup_delay_ms)?,
                stale_upload_ttl_secs: parse_var(
                    "STALE_UPLOAD_TTL_SECS",
                    defaults.upload.stale_upload_ttl_secs,
                )?,
                sweep_interval_secs: parse_var(
                    "SWEEP_INTERVAL_SECS",
                    defaults.upload.sweep_interval_secs,
                )?,
                max_chunk_size: parse_var("MAX_CHUNK_SIZE", defaults.upload.max_chunk_size)?,
            },
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError { name, value }),
        Err(_) => Ok(default),
    }
}
