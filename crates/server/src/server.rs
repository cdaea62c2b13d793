// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Listener and server lifecycle
//!
//! [`LockServer`] is the async core for callers that already run tokio.
//! [`ServerHandle`] owns a runtime on a background thread for synchronous
//! embedders.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use lk_core::{ConnectionIdGen, LockRegistry};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::connection::{serve_connection, ConnectionContext, Outbox};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct LockServer {
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
}

impl LockServer {
    /// Validate `config` and start listening
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let addr = config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            ctx: Arc::new(ConnectionContext {
                config: Arc::new(config),
                registry: Arc::new(LockRegistry::new()),
                ids: ConnectionIdGen::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<LockRegistry<Outbox>> {
        Arc::clone(&self.ctx.registry)
    }

    /// Accept connections until `shutdown` turns true or its sender is dropped
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let mut connections = JoinSet::new();
        info!(
            addr = %self.local_addr()?,
            auth = self.ctx.config.requires_auth(),
            encrypt = self.ctx.config.encrypt,
            "lock server listening"
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "set_nodelay failed");
                        }
                        connections.spawn(serve_connection(
                            Arc::clone(&self.ctx),
                            stream,
                            peer.to_string(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "connection task failed");
                    }
                }
            }
        }

        info!(open = connections.len(), "lock server shutting down");
        connections.shutdown().await;
        Ok(())
    }
}

/// A lock server running on its own runtime thread
///
/// Must not be started from inside a tokio runtime. Dropping the handle
/// stops the server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<LockRegistry<Outbox>>,
    shutdown: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn start(config: ServerConfig) -> Result<Self, ServerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("lk-server")
            .build()?;
        let server = runtime.block_on(LockServer::bind(config))?;
        let local_addr = server.local_addr()?;
        let registry = server.registry();
        let (shutdown, rx) = watch::channel(false);

        let thread = std::thread::Builder::new()
            .name("lk-server-main".to_string())
            .spawn(move || {
                if let Err(e) = runtime.block_on(server.serve(rx)) {
                    error!(error = %e, "lock server failed");
                }
            })?;

        Ok(Self {
            local_addr,
            registry,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The live registry, for inspection
    pub fn registry(&self) -> &LockRegistry<Outbox> {
        &self.registry
    }

    /// Stop accepting, close every connection and wait for the runtime thread
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("lock server thread panicked");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
