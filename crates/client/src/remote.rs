// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client-side proxy for one named lock
//!
//! Every call names its holder with a [`LocalId`]. Hold counts are kept
//! locally per `(owner, mode)`: only the first acquire and the release back
//! to zero reach the server, so the server sees one hold per holder no
//! matter how deep the local reentrancy goes.
//!
//! Holds are stamped with the session they were granted on. Once that
//! session is gone the server has already released them, so `lock` asks the
//! server again and `unlock` only clears the local count.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lk_core::{LocalId, LockMode, LockStateError};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::manager::Connector;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Hold {
    /// First acquire sent, no grant yet
    Pending,
    Held { count: u32, epoch: u64 },
}

pub struct RemoteLock {
    name: String,
    connector: Arc<Connector>,
    holds: Mutex<HashMap<(LocalId, LockMode), Hold>>,
}

impl std::fmt::Debug for RemoteLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteLock").field("name", &self.name).finish()
    }
}

impl RemoteLock {
    pub(crate) fn new(name: &str, connector: Arc<Connector>) -> Self {
        Self {
            name: name.to_string(),
            connector,
            holds: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_read(&self, owner: LocalId) -> Result<(), ClientError> {
        self.lock(owner, LockMode::Read)
    }

    pub fn unlock_read(&self, owner: LocalId) -> Result<(), ClientError> {
        self.unlock(owner, LockMode::Read)
    }

    pub fn lock_write(&self, owner: LocalId) -> Result<(), ClientError> {
        self.lock(owner, LockMode::Write)
    }

    pub fn unlock_write(&self, owner: LocalId) -> Result<(), ClientError> {
        self.unlock(owner, LockMode::Write)
    }

    /// Read lock released when the guard drops
    pub fn read(&self, owner: LocalId) -> Result<LockGuard<'_>, ClientError> {
        self.lock(owner, LockMode::Read)?;
        Ok(LockGuard {
            lock: self,
            owner,
            mode: LockMode::Read,
        })
    }

    /// Write lock released when the guard drops
    pub fn write(&self, owner: LocalId) -> Result<LockGuard<'_>, ClientError> {
        self.lock(owner, LockMode::Write)?;
        Ok(LockGuard {
            lock: self,
            owner,
            mode: LockMode::Write,
        })
    }

    /// Local reentrant hold count of `owner` in `mode`
    pub fn hold_count(&self, owner: LocalId, mode: LockMode) -> u32 {
        let holds = self.holds.lock().unwrap_or_else(|e| e.into_inner());
        match holds.get(&(owner, mode)) {
            Some(Hold::Held { count, .. }) => *count,
            _ => 0,
        }
    }

    /// Acquire, blocking the calling thread until granted
    ///
    /// Fails instead of blocking forever when the connection is lost.
    pub fn lock(&self, owner: LocalId, mode: LockMode) -> Result<(), ClientError> {
        let session = self.connector.current()?;
        let key = (owner, mode);

        {
            let mut holds = self.holds.lock().unwrap_or_else(|e| e.into_inner());
            match holds.get_mut(&key) {
                Some(Hold::Held { count, epoch }) if *epoch == session.epoch() => {
                    *count += 1;
                    return Ok(());
                }
                Some(Hold::Pending) => {
                    return Err(LockStateError::AcquireInFlight {
                        name: self.name.clone(),
                        owner: owner.to_string(),
                        mode,
                    }
                    .into());
                }
                // Absent, or granted on a session that is gone
                _ => {
                    holds.insert(key, Hold::Pending);
                }
            }
        }

        let result = session
            .acquire(mode, &self.name, owner)
            .and_then(|grant| {
                grant
                    .blocking_recv()
                    .map_err(|_| ClientError::ConnectionLost)?
            });

        let mut holds = self.holds.lock().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok(()) => {
                holds.insert(
                    key,
                    Hold::Held {
                        count: 1,
                        epoch: session.epoch(),
                    },
                );
                Ok(())
            }
            Err(e) => {
                holds.remove(&key);
                Err(e)
            }
        }
    }

    /// Release one hold; the last one is sent to the server
    ///
    /// If the connection broke while the hold was taken the hold is dropped
    /// and [`ClientError::ConnectionLost`] is returned; the server released
    /// it together with the connection.
    pub fn unlock(&self, owner: LocalId, mode: LockMode) -> Result<(), ClientError> {
        let key = (owner, mode);
        let epoch = {
            let mut holds = self.holds.lock().unwrap_or_else(|e| e.into_inner());
            match holds.get_mut(&key) {
                Some(Hold::Held { count, .. }) if *count > 1 => {
                    *count -= 1;
                    return Ok(());
                }
                Some(Hold::Held { epoch, .. }) => {
                    let epoch = *epoch;
                    holds.remove(&key);
                    epoch
                }
                _ => {
                    return Err(LockStateError::NotHeld {
                        name: self.name.clone(),
                        owner: owner.to_string(),
                        mode,
                    }
                    .into())
                }
            }
        };

        match self.connector.session() {
            Some(session) if session.epoch() == epoch => {
                session.release(mode, &self.name, owner).inspect_err(|e| {
                    debug!(lock = %self.name, %owner, error = %e, "release not sent");
                })
            }
            _ => {
                debug!(lock = %self.name, %owner, %mode, "dropped hold of a closed session");
                Ok(())
            }
        }
    }
}

/// Scoped hold on a [`RemoteLock`]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a RemoteLock,
    owner: LocalId,
    mode: LockMode,
}

impl LockGuard<'_> {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn owner(&self) -> LocalId {
        self.owner
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock(self.owner, self.mode) {
            warn!(lock = %self.lock.name, owner = %self.owner, error = %e, "unlock on drop failed");
        }
    }
}
