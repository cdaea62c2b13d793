// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Application-facing lock manager

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lk_core::ConnectionId;
use tokio::runtime::Runtime;
use tracing::info;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::remote::RemoteLock;
use crate::session::Session;

/// Owns the runtime and the current session; shared with every [`RemoteLock`]
pub(crate) struct Connector {
    config: ClientConfig,
    runtime: Runtime,
    session: Mutex<Option<Arc<Session>>>,
    epochs: AtomicU64,
}

impl Connector {
    pub(crate) fn session(&self) -> Option<Arc<Session>> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The session to send requests on
    pub(crate) fn current(&self) -> Result<Arc<Session>, ClientError> {
        match self.session() {
            None => Err(ClientError::NotConnected),
            Some(session) if !session.is_open() => Err(ClientError::ConnectionLost),
            Some(session) => Ok(session),
        }
    }
}

/// Hands out one [`RemoteLock`] per name over a single server connection
///
/// The manager runs its network I/O on a private runtime, so it must be
/// created, used and dropped outside of any tokio runtime.
pub struct LockManager {
    connector: Arc<Connector>,
    locks: Mutex<HashMap<String, Arc<RemoteLock>>>,
}

impl LockManager {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("lk-client")
            .enable_all()
            .build()?;

        Ok(Self {
            connector: Arc::new(Connector {
                config,
                runtime,
                session: Mutex::new(None),
                epochs: AtomicU64::new(0),
            }),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.connector.config
    }

    /// Connect and authenticate; a no-op while a session is open
    ///
    /// A wrong password fails with [`ClientError::Authentication`].
    pub fn connect(&self) -> Result<(), ClientError> {
        let connector = &self.connector;
        let mut slot = connector.session.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|s| s.is_open()) {
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            stale.close();
        }

        let epoch = connector.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let session = connector
            .runtime
            .block_on(Session::open(&connector.config, epoch))?;
        *slot = Some(Arc::new(session));
        Ok(())
    }

    /// Close the connection without waiting for anything
    ///
    /// Blocked `lock` calls fail with [`ClientError::ConnectionLost`]; the
    /// server releases everything this connection held.
    pub fn disconnect(&self) {
        let session = self
            .connector
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(session) = session {
            session.close();
            info!(connection = %session.connection_id(), "disconnected from lock server");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connector.session().is_some_and(|s| s.is_open())
    }

    /// Server-assigned id of the open session
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connector
            .session()
            .filter(|s| s.is_open())
            .map(|s| s.connection_id())
    }

    /// The lock proxy for `name`; the same instance for the same name
    pub fn get_lock(&self, name: &str) -> Arc<RemoteLock> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(RemoteLock::new(name, Arc::clone(&self.connector)))),
        )
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
