// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! lk-client: blocking client for the lk lock server
//!
//! ```no_run
//! use lk_client::{ClientConfig, LockManager};
//! use lk_core::LocalId;
//!
//! # fn main() -> Result<(), lk_client::ClientError> {
//! let manager = LockManager::new(ClientConfig::new("127.0.0.1", 5300).with_password("s3cret"))?;
//! manager.connect()?;
//!
//! let accounts = manager.get_lock("account");
//! let _guard = accounts.write(LocalId::current_thread())?;
//! // ... mutate the shared store ...
//! # Ok(())
//! # }
//! ```

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod config;
mod error;
mod manager;
mod remote;
mod session;

pub use config::ClientConfig;
pub use error::ClientError;
pub use manager::LockManager;
pub use remote::{LockGuard, RemoteLock};
