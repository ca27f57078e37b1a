//! Client Configuration
//!
//! Loads configuration from environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::pipeline::PipelineConfig;

/// Which key store backend to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-lifetime store; everything is lost on shutdown.
    Memory,
    /// Embedded `SQLite` database at the given path.
    Sqlite(PathBuf),
}

/// Logging output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human readable output.
    Pretty,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset (default: "info").
    pub level: String,
    /// Output format (default: JSON).
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Json,
        }
    }
}

/// Client configuration loaded from environment variables.
#[derive(Clone)]
pub struct ClientConfig {
    /// Key store backend (`E2EE_STORE_BACKEND`, `E2EE_STORE_PATH`).
    pub store: StoreBackend,

    /// Passphrase protecting the pickle key (`E2EE_STORE_PASSPHRASE`).
    pub store_passphrase: Option<String>,

    /// Decryption pipeline behaviour.
    pub pipeline: PipelineConfig,

    /// Logging.
    pub log: LogConfig,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("store", &self.store)
            .field(
                "store_passphrase",
                &self.store_passphrase.as_ref().map(|_| "[REDACTED]"),
            )
            .field("pipeline", &self.pipeline)
            .field("log", &self.log)
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Memory,
            store_passphrase: None,
            pipeline: PipelineConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let store = match env::var("E2EE_STORE_BACKEND")
            .unwrap_or_else(|_| "memory".into())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            "sqlite" => StoreBackend::Sqlite(
                env::var("E2EE_STORE_PATH")
                    .context("E2EE_STORE_PATH must be set for the sqlite backend")?
                    .into(),
            ),
            other => bail!("Unknown E2EE_STORE_BACKEND: {other}"),
        };

        let store_passphrase = env::var("E2EE_STORE_PASSPHRASE")
            .ok()
            .filter(|p| !p.is_empty());
        if matches!(store, StoreBackend::Sqlite(_)) && store_passphrase.is_none() {
            bail!("E2EE_STORE_PASSPHRASE must be set for the sqlite backend");
        }

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            decrypt_unknown_devices: parse_bool("E2EE_DECRYPT_UNKNOWN_DEVICES")?
                .unwrap_or(defaults.decrypt_unknown_devices),
            reject_mismatched_sender: parse_bool("E2EE_REJECT_MISMATCHED_SENDER")?
                .unwrap_or(defaults.reject_mismatched_sender),
            max_concurrent_rooms: match env::var("E2EE_MAX_CONCURRENT_ROOMS") {
                Ok(v) => v
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .context("E2EE_MAX_CONCURRENT_ROOMS must be a positive integer")?,
                Err(_) => defaults.max_concurrent_rooms,
            },
        };

        let log = LogConfig {
            level: env::var("E2EE_LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            format: match env::var("E2EE_LOG_FORMAT").as_deref() {
                Ok("pretty") => LogFormat::Pretty,
                _ => LogFormat::Json,
            },
        };

        Ok(Self {
            store,
            store_passphrase,
            pipeline,
            log,
        })
    }
}

fn parse_bool(name: &str) -> Result<Option<bool>> {
    match env::var(name) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => bail!("{name} must be a boolean, got {value:?}"),
        },
        Err(_) => Ok(None),
    }
}
