// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use lk_core::{LockStateError, ProtocolError};
use thiserror::Error;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("not connected to a lock server")]
    NotConnected,

    #[error("connection to the lock server was lost")]
    ConnectionLost,

    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("timed out connecting to {0}")]
    Timeout(String),

    #[error("invalid client config: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    LockState(#[from] LockStateError),
}

impl ClientError {
    /// Whether this error means the transport is unusable
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::NotConnected
                | ClientError::ConnectionLost
                | ClientError::Connect { .. }
                | ClientError::Timeout(_)
                | ClientError::Io(_)
        )
    }
}
