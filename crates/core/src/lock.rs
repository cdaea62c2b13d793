// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reentrant read/write lock state machine
//!
//! One [`RwLockState`] exists per lock name. It decides grant vs. queue and
//! services its wait queue whenever the holder set changes. Waiters carry an
//! opaque reply handle `R` so the owner of the state can notify them when a
//! grant is produced later.
//!
//! Queue service is best-effort FIFO: the head is granted while it is
//! compatible with the holders, and a queued writer at the head blocks every
//! waiter behind it. New readers still barge past queued writers while only
//! readers hold the lock.

use crate::id::{ConnectionId, OwnerToken};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;

/// Kind of access requested
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Read,
    Write,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Read => write!(f, "read"),
            LockMode::Write => write!(f, "write"),
        }
    }
}

/// Current holders of a lock
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Holders {
    Free,
    /// Readers and their hold counts; never empty
    Shared(BTreeMap<OwnerToken, u32>),
    /// A single writer, with read holds it took while writing
    Exclusive {
        owner: OwnerToken,
        writes: u32,
        reads: u32,
    },
}

/// A request that could not be granted yet
#[derive(Clone, Debug)]
pub struct Waiter<R> {
    pub token: OwnerToken,
    pub mode: LockMode,
    pub request_id: u64,
    pub reply: R,
}

/// Events that drive lock transitions
#[derive(Clone, Debug)]
pub enum LockInput<R> {
    Acquire {
        token: OwnerToken,
        mode: LockMode,
        request_id: u64,
        reply: R,
    },
    Release {
        token: OwnerToken,
        mode: LockMode,
    },
    /// Drop every hold and pending wait of a connection
    Withdraw { connection: ConnectionId },
}

/// Observable results of a transition
#[derive(Clone, Debug)]
pub enum LockEffect<R> {
    Granted(Waiter<R>),
    Queued(Waiter<R>),
    Released {
        token: OwnerToken,
        mode: LockMode,
        remaining: u32,
    },
    Withdrawn {
        connection: ConnectionId,
        holds: u32,
        waiters: usize,
    },
}

/// Caller released something it does not hold
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockStateError {
    #[error("{owner} does not hold a {mode} lock on '{name}'")]
    NotHeld {
        name: String,
        owner: String,
        mode: LockMode,
    },

    #[error("{owner} already has a {mode} acquire in flight on '{name}'")]
    AcquireInFlight {
        name: String,
        owner: String,
        mode: LockMode,
    },
}

/// State of one named lock
#[derive(Clone, Debug)]
pub struct RwLockState<R> {
    name: String,
    holders: Holders,
    waiters: VecDeque<Waiter<R>>,
}

impl<R> RwLockState<R> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            holders: Holders::Free,
            waiters: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holders(&self) -> &Holders {
        &self.holders
    }

    pub fn is_free(&self) -> bool {
        matches!(self.holders, Holders::Free)
    }

    pub fn queue_len(&self) -> usize {
        self.waiters.len()
    }

    /// Tokens and modes waiting, in service order
    pub fn queued(&self) -> Vec<(OwnerToken, LockMode)> {
        self.waiters.iter().map(|w| (w.token, w.mode)).collect()
    }

    /// Hold count of `token` in `mode`
    pub fn hold_count(&self, token: &OwnerToken, mode: LockMode) -> u32 {
        match (&self.holders, mode) {
            (Holders::Shared(readers), LockMode::Read) => {
                readers.get(token).copied().unwrap_or(0)
            }
            (
                Holders::Exclusive {
                    owner,
                    writes,
                    reads,
                },
                _,
            ) if owner == token => match mode {
                LockMode::Write => *writes,
                LockMode::Read => *reads,
            },
            _ => 0,
        }
    }

    /// Writer token, if exclusively held
    pub fn writer(&self) -> Option<&OwnerToken> {
        match &self.holders {
            Holders::Exclusive { owner, .. } => Some(owner),
            _ => None,
        }
    }

    /// Tokens holding read access (including a writer's own read holds)
    pub fn readers(&self) -> Vec<OwnerToken> {
        match &self.holders {
            Holders::Free => Vec::new(),
            Holders::Shared(readers) => readers.keys().copied().collect(),
            Holders::Exclusive { owner, reads, .. } if *reads > 0 => vec![*owner],
            Holders::Exclusive { .. } => Vec::new(),
        }
    }
}

impl<R: Clone> RwLockState<R> {
    /// Apply an input in place and report what happened
    pub fn transition(
        &mut self,
        input: LockInput<R>,
    ) -> Result<Vec<LockEffect<R>>, LockStateError> {
        let mut effects = Vec::new();

        match input {
            LockInput::Acquire {
                token,
                mode,
                request_id,
                reply,
            } => {
                let waiter = Waiter {
                    token,
                    mode,
                    request_id,
                    reply,
                };
                if self.admits(&token, mode) {
                    self.grant(&token, mode);
                    effects.push(LockEffect::Granted(waiter));
                } else {
                    self.waiters.push_back(waiter.clone());
                    effects.push(LockEffect::Queued(waiter));
                }
            }

            LockInput::Release { token, mode } => {
                let remaining = self.release(&token, mode)?;
                effects.push(LockEffect::Released {
                    token,
                    mode,
                    remaining,
                });
                self.service_queue(&mut effects);
            }

            LockInput::Withdraw { connection } => {
                let before = self.waiters.len();
                self.waiters.retain(|w| !w.token.belongs_to(connection));
                let waiters = before - self.waiters.len();
                let holds = self.drop_holds_of(connection);

                if holds > 0 || waiters > 0 {
                    effects.push(LockEffect::Withdrawn {
                        connection,
                        holds,
                        waiters,
                    });
                }
                self.service_queue(&mut effects);
            }
        }

        Ok(effects)
    }

    /// Whether `token` may take `mode` right now without waiting
    fn admits(&self, token: &OwnerToken, mode: LockMode) -> bool {
        match (&self.holders, mode) {
            (Holders::Free, _) => true,
            (Holders::Shared(_), LockMode::Read) => true,
            (Holders::Shared(_), LockMode::Write) => false,
            (Holders::Exclusive { owner, .. }, _) => owner == token,
        }
    }

    fn grant(&mut self, token: &OwnerToken, mode: LockMode) {
        match (&mut self.holders, mode) {
            (Holders::Free, LockMode::Read) => {
                self.holders = Holders::Shared(BTreeMap::from([(*token, 1)]));
            }
            (Holders::Free, LockMode::Write) => {
                self.holders = Holders::Exclusive {
                    owner: *token,
                    writes: 1,
                    reads: 0,
                };
            }
            (Holders::Shared(readers), LockMode::Read) => {
                *readers.entry(*token).or_insert(0) += 1;
            }
            (Holders::Exclusive { writes, .. }, LockMode::Write) => *writes += 1,
            (Holders::Exclusive { reads, .. }, LockMode::Read) => *reads += 1,
            // Callers check `admits` first
            (Holders::Shared(_), LockMode::Write) => {}
        }
    }

    fn release(&mut self, token: &OwnerToken, mode: LockMode) -> Result<u32, LockStateError> {
        let not_held = || LockStateError::NotHeld {
            name: self.name.clone(),
            owner: token.to_string(),
            mode,
        };

        match (&mut self.holders, mode) {
            (Holders::Shared(readers), LockMode::Read) => {
                let count = readers.get_mut(token).ok_or_else(not_held)?;
                *count -= 1;
                let remaining = *count;
                if remaining == 0 {
                    readers.remove(token);
                    if readers.is_empty() {
                        self.holders = Holders::Free;
                    }
                }
                Ok(remaining)
            }
            (Holders::Exclusive { owner, reads, .. }, LockMode::Read)
                if owner == token && *reads > 0 =>
            {
                *reads -= 1;
                Ok(*reads)
            }
            (
                Holders::Exclusive {
                    owner,
                    writes,
                    reads,
                },
                LockMode::Write,
            ) if owner == token => {
                *writes -= 1;
                let remaining = *writes;
                if remaining == 0 {
                    let (owner, reads) = (*owner, *reads);
                    // Downgrade keeps the writer's own read holds
                    self.holders = if reads > 0 {
                        Holders::Shared(BTreeMap::from([(owner, reads)]))
                    } else {
                        Holders::Free
                    };
                }
                Ok(remaining)
            }
            _ => Err(not_held()),
        }
    }

    fn drop_holds_of(&mut self, connection: ConnectionId) -> u32 {
        match &mut self.holders {
            Holders::Free => 0,
            Holders::Shared(readers) => {
                let mut dropped = 0;
                readers.retain(|token, count| {
                    if token.belongs_to(connection) {
                        dropped += *count;
                        false
                    } else {
                        true
                    }
                });
                if readers.is_empty() {
                    self.holders = Holders::Free;
                }
                dropped
            }
            Holders::Exclusive {
                owner,
                writes,
                reads,
            } if owner.belongs_to(connection) => {
                let dropped = *writes + *reads;
                self.holders = Holders::Free;
                dropped
            }
            Holders::Exclusive { .. } => 0,
        }
    }

    /// Grant waiters from the head while they are compatible
    fn service_queue(&mut self, effects: &mut Vec<LockEffect<R>>) {
        while let Some(head) = self.waiters.front() {
            let compatible = match head.mode {
                LockMode::Write => self.is_free(),
                LockMode::Read => !matches!(self.holders, Holders::Exclusive { .. }),
            };
            if !compatible {
                break;
            }
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            self.grant(&waiter.token, waiter.mode);
            effects.push(LockEffect::Granted(waiter));
        }
    }

    /// Structural invariants; used by tests and debug assertions
    pub fn check_invariants(&self) -> Result<(), String> {
        match &self.holders {
            Holders::Free if !self.waiters.is_empty() => {
                Err(format!("'{}' is free with {} waiters", self.name, self.waiters.len()))
            }
            Holders::Shared(readers) if readers.is_empty() => {
                Err(format!("'{}' is shared with no readers", self.name))
            }
            Holders::Shared(readers) if readers.values().any(|c| *c == 0) => {
                Err(format!("'{}' has a zero read count", self.name))
            }
            Holders::Exclusive { writes: 0, .. } => {
                Err(format!("'{}' is exclusive with zero writes", self.name))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
