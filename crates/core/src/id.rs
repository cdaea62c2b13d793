// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lock holder identities
//!
//! A holder is an [`OwnerToken`]: the server-assigned [`ConnectionId`] of the
//! session plus a client-chosen [`LocalId`]. Reentrancy and ownership checks
//! compare whole tokens, never ambient thread identity.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Server-assigned identifier of an authenticated connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Client-chosen identifier of a logical holder within one connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub u64);

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

impl LocalId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Stable id for the calling thread, allocated on first use.
    pub fn current_thread() -> Self {
        THREAD_ID.with(|slot| {
            if slot.get() == 0 {
                slot.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            Self(slot.get())
        })
    }
}

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one reentrant lock holder across the whole system
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerToken {
    pub connection: ConnectionId,
    pub local: LocalId,
}

impl OwnerToken {
    pub fn new(connection: ConnectionId, local: LocalId) -> Self {
        Self { connection, local }
    }

    pub fn belongs_to(&self, connection: ConnectionId) -> bool {
        self.connection == connection
    }
}

impl std::fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.connection, self.local)
    }
}

/// Hands out connection ids in increasing order, starting at 1
#[derive(Clone, Debug)]
pub struct ConnectionIdGen {
    counter: Arc<AtomicU64>,
}

impl ConnectionIdGen {
    pub fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next(&self) -> ConnectionId {
        ConnectionId(self.counter.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for ConnectionIdGen {
    fn default() -> Self {
        Self::new()
    }
}
