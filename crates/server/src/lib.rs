// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! lk-server: the authoritative lock server
//!
//! Accepts TCP connections, authenticates them, and routes lock requests to
//! one shared [`lk_core::LockRegistry`].

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod connection;
pub mod server;

pub use config::{ConfigError, ServerConfig, DEFAULT_PORT};
pub use connection::{ConnectionError, Outbox};
pub use server::{LockServer, ServerError, ServerHandle};
