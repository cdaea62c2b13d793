// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lock registry: the single authority over every named lock
//!
//! Each lock name owns its own mutex, so independent names never contend.
//! The outer map lock is held only to look up or create an entry.
//!
//! Replies (`GRANTED`/`QUEUED`) are delivered through [`ReplySink`]s while
//! the per-name mutex is still held. That keeps a request's `QUEUED` ahead of
//! its later `GRANTED`, and means connection cleanup, which runs under the
//! same mutex, can never race a grant to the connection being cleaned up.

use crate::id::{ConnectionId, OwnerToken};
use crate::lock::{Holders, LockEffect, LockInput, LockMode, LockStateError, RwLockState};
use crate::protocol::Message;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Where replies for a requester go
pub trait ReplySink: Clone + Send {
    /// Deliver a message; `false` means the receiving connection is gone.
    fn deliver(&self, msg: Message) -> bool;
}

impl ReplySink for tokio::sync::mpsc::UnboundedSender<Message> {
    fn deliver(&self, msg: Message) -> bool {
        self.send(msg).is_ok()
    }
}

/// Synchronous outcome of an acquire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    Granted,
    Queued,
}

/// Point-in-time view of one lock, for inspection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockSnapshot {
    pub name: String,
    pub holders: Holders,
    pub queued: Vec<(OwnerToken, LockMode)>,
}

type Entry<S> = Arc<Mutex<RwLockState<S>>>;

/// All named locks of a server
pub struct LockRegistry<S: ReplySink> {
    locks: Mutex<HashMap<String, Entry<S>>>,
}

impl<S: ReplySink> Default for LockRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ReplySink> LockRegistry<S> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a lock, creating it on first reference
    fn entry(&self, name: &str) -> Entry<S> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(RwLockState::new(name)))),
        )
    }

    fn entries(&self) -> Vec<Entry<S>> {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.values().cloned().collect()
    }

    pub fn acquire_read(
        &self,
        name: &str,
        token: OwnerToken,
        request_id: u64,
        reply: S,
    ) -> Result<Acquired, LockStateError> {
        self.acquire(name, token, LockMode::Read, request_id, reply)
    }

    pub fn acquire_write(
        &self,
        name: &str,
        token: OwnerToken,
        request_id: u64,
        reply: S,
    ) -> Result<Acquired, LockStateError> {
        self.acquire(name, token, LockMode::Write, request_id, reply)
    }

    pub fn release_read(&self, name: &str, token: OwnerToken) -> Result<(), LockStateError> {
        self.release(name, token, LockMode::Read)
    }

    pub fn release_write(&self, name: &str, token: OwnerToken) -> Result<(), LockStateError> {
        self.release(name, token, LockMode::Write)
    }

    /// Acquire `mode`; the requester is told the outcome through `reply`
    pub fn acquire(
        &self,
        name: &str,
        token: OwnerToken,
        mode: LockMode,
        request_id: u64,
        reply: S,
    ) -> Result<Acquired, LockStateError> {
        let entry = self.entry(name);
        let mut lock = entry.lock().unwrap_or_else(|e| e.into_inner());

        let effects = lock.transition(LockInput::Acquire {
            token,
            mode,
            request_id,
            reply,
        })?;
        let granted = effects.iter().any(|e| match e {
            LockEffect::Granted(w) => w.request_id == request_id && w.token == token,
            _ => false,
        });

        dispatch(name, effects);
        Ok(if granted {
            Acquired::Granted
        } else {
            Acquired::Queued
        })
    }

    pub fn release(&self, name: &str, token: OwnerToken, mode: LockMode) -> Result<(), LockStateError> {
        let entry = self.entry(name);
        let mut lock = entry.lock().unwrap_or_else(|e| e.into_inner());
        let effects = lock.transition(LockInput::Release { token, mode })?;
        dispatch(name, effects);
        Ok(())
    }

    /// Withdraw every hold and pending wait of `connection`
    ///
    /// Returns the number of hold counts that were force-released.
    pub fn release_all_for_connection(&self, connection: ConnectionId) -> u32 {
        let mut released = 0;
        for entry in self.entries() {
            let mut lock = entry.lock().unwrap_or_else(|e| e.into_inner());
            let name = lock.name().to_string();
            match lock.transition(LockInput::Withdraw { connection }) {
                Ok(effects) => {
                    released += effects
                        .iter()
                        .map(|e| match e {
                            LockEffect::Withdrawn { holds, .. } => *holds,
                            _ => 0,
                        })
                        .sum::<u32>();
                    dispatch(&name, effects);
                }
                Err(e) => debug!(lock = %name, error = %e, "withdraw rejected"),
            }
        }
        released
    }

    /// Names of every lock referenced so far
    pub fn lock_names(&self) -> Vec<String> {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = locks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn snapshot(&self, name: &str) -> Option<LockSnapshot> {
        let entry = {
            let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.get(name).cloned()
        }?;
        let lock = entry.lock().unwrap_or_else(|e| e.into_inner());
        Some(LockSnapshot {
            name: name.to_string(),
            holders: lock.holders().clone(),
            queued: lock.queued(),
        })
    }
}

/// Push replies for the effects of one transition
fn dispatch<S: ReplySink>(name: &str, effects: Vec<LockEffect<S>>) {
    for effect in effects {
        match effect {
            LockEffect::Granted(waiter) => {
                trace!(lock = %name, owner = %waiter.token, mode = %waiter.mode, "granted");
                let delivered = waiter.reply.deliver(Message::Granted {
                    request_id: waiter.request_id,
                    name: name.to_string(),
                    owner: waiter.token.local.0,
                });
                if !delivered {
                    // The connection's cleanup will withdraw this hold
                    debug!(lock = %name, owner = %waiter.token, "grant for closed connection");
                }
            }
            LockEffect::Queued(waiter) => {
                trace!(lock = %name, owner = %waiter.token, mode = %waiter.mode, "queued");
                waiter.reply.deliver(Message::Queued {
                    request_id: waiter.request_id,
                    name: name.to_string(),
                    owner: waiter.token.local.0,
                });
            }
            LockEffect::Released {
                token,
                mode,
                remaining,
            } => {
                trace!(lock = %name, owner = %token, %mode, remaining, "released");
            }
            LockEffect::Withdrawn {
                connection,
                holds,
                waiters,
            } => {
                debug!(lock = %name, %connection, holds, waiters, "withdrew connection");
            }
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
