// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Daemon configuration.
//!
//! Loaded from TOML; every field has a default so a partial file (or no
//! file at all) is valid.
//!
//! ```toml
//! port = 8095
//! database = "watcher.db"
//! read_only = false
//!
//! [replay]
//! buffer_size = 10
//! time_step_ms = 250
//! ```

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use watcher::DEFAULT_MAX_MESSAGE_SIZE;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port to listen on (default: 8095)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Runtime worker threads serving all connections
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Event database: a SQLite path, `:memory:`, or `memory`
    #[serde(default = "default_database")]
    pub database: String,

    /// Serve and replay without persisting incoming events
    #[serde(default)]
    pub read_only: bool,

    /// Maximum frame payload size (bytes)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Batches a connection may have queued before it is dropped
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub replay: ReplayConfig,
}

/// Replay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Events prefetched from the store per fetch
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Events closer than this to the replay clock are sent together (ms)
    #[serde(default = "default_time_step_ms")]
    pub time_step_ms: u64,
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8095
}

fn default_worker_threads() -> usize {
    8
}

fn default_database() -> String {
    "watcher.db".to_string()
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_outbound_queue_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_buffer_size() -> usize {
    10
}

fn default_time_step_ms() -> u64 {
    250
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            time_step_ms: default_time_step_ms(),
        }
    }
}

impl ReplayConfig {
    pub fn time_step(&self) -> Duration {
        Duration::from_millis(self.time_step_ms)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            worker_threads: default_worker_threads(),
            database: default_database(),
            read_only: false,
            max_message_size: default_max_message_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            log_level: default_log_level(),
            replay: ReplayConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load and validate a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads cannot be 0".into()));
        }
        if self.database.is_empty() {
            return Err(ConfigError::Invalid("database cannot be empty".into()));
        }
        if self.max_message_size < watcher::FRAME_HEADER_SIZE
            || self.max_message_size > u32::MAX as usize
        {
            return Err(ConfigError::Invalid(format!(
                "max_message_size must be between {} and {}",
                watcher::FRAME_HEADER_SIZE,
                u32::MAX
            )));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue_capacity cannot be 0".into(),
            ));
        }
        if self.replay.buffer_size == 0 {
            return Err(ConfigError::Invalid("replay.buffer_size cannot be 0".into()));
        }
        if self.replay.time_step_ms == 0 {
            return Err(ConfigError::Invalid(
                "replay.time_step_ms cannot be 0".into(),
            ));
        }
        Ok(())
    }
}
