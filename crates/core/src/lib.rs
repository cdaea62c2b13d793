// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! lk-core: shared core of the lk distributed lock service
//!
//! This crate provides:
//! - Holder identities (connection ids, local ids, owner tokens)
//! - The per-name reentrant read/write lock state machine
//! - The lock registry the server drives
//! - The framed wire protocol and its optional frame encryption

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod crypto;
pub mod id;
pub mod lock;
pub mod protocol;
pub mod registry;

pub use crypto::{secrets_match, CryptoError, FrameCipher};
pub use id::{ConnectionId, ConnectionIdGen, LocalId, OwnerToken};
pub use lock::{Holders, LockEffect, LockInput, LockMode, LockStateError, RwLockState, Waiter};
pub use protocol::{Envelope, FrameCodec, Message, ProtocolError, PROTOCOL_VERSION};
pub use registry::{Acquired, LockRegistry, LockSnapshot, ReplySink};
