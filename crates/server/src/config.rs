// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server configuration
//!
//! Built in code with the `with_*` methods, or read from a TOML file:
//!
//! ```toml
//! bind = "0.0.0.0"
//! port = 5300
//! password = "s3cret"
//! encrypt = true
//! heartbeat_interval = "5s"
//! heartbeat_timeout = "15s"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 5300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("encryption requires a non-empty password")]
    EncryptionWithoutPassword,

    #[error("heartbeat interval must be non-zero")]
    ZeroHeartbeat,

    #[error("heartbeat timeout ({timeout:?}) must be larger than the interval ({interval:?})")]
    HeartbeatTimeoutTooShort {
        interval: Duration,
        timeout: Duration,
    },
}

// Env overrides are in milliseconds
fn parse_duration_ms(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Settings of one lock server
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: String,
    /// TCP port; 0 picks a free one
    pub port: u16,
    /// Shared secret; empty disables authentication
    pub password: String,
    /// Seal every frame with a key derived from the password
    pub encrypt: bool,
    /// How often the server sends `HEARTBEAT`
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is considered dead
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// Time a new connection has to authenticate
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            password: String::new(),
            encrypt: false,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("encrypt", &self.encrypt)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_encryption(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Read a TOML config file; missing keys take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `LK_HEARTBEAT_INTERVAL_MS`, `LK_HEARTBEAT_TIMEOUT_MS` and
    /// `LK_TIMEOUT_HANDSHAKE_MS` when set
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(interval) = parse_duration_ms("LK_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval = interval;
        }
        if let Some(timeout) = parse_duration_ms("LK_HEARTBEAT_TIMEOUT_MS") {
            self.heartbeat_timeout = timeout;
        }
        if let Some(timeout) = parse_duration_ms("LK_TIMEOUT_HANDSHAKE_MS") {
            self.handshake_timeout = timeout;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encrypt && self.password.is_empty() {
            return Err(ConfigError::EncryptionWithoutPassword);
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeat);
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::HeartbeatTimeoutTooShort {
                interval: self.heartbeat_interval,
                timeout: self.heartbeat_timeout,
            });
        }
        Ok(())
    }

    /// Whether connections must present the password
    pub fn requires_auth(&self) -> bool {
        !self.password.is_empty()
    }

    /// `bind:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
