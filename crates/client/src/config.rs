// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ClientError;

// Env overrides are in milliseconds
fn parse_duration_ms(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Where the lock server is and how to talk to it
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret sent in `AUTH`
    pub password: String,
    /// Seal every frame; the server must be configured the same way
    pub encrypt: bool,
    /// Limit on TCP connect plus handshake
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Silence from the server after which the connection is dropped
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5300,
            password: String::new(),
            encrypt: false,
            connect_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("encrypt", &self.encrypt)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_encryption(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Apply `LK_TIMEOUT_CONNECT_MS` and `LK_HEARTBEAT_TIMEOUT_MS` when set
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(timeout) = parse_duration_ms("LK_TIMEOUT_CONNECT_MS") {
            self.connect_timeout = timeout;
        }
        if let Some(timeout) = parse_duration_ms("LK_HEARTBEAT_TIMEOUT_MS") {
            self.heartbeat_timeout = timeout;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.encrypt && self.password.is_empty() {
            return Err(ClientError::Config(
                "encryption requires a non-empty password".to_string(),
            ));
        }
        if self.heartbeat_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(ClientError::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
