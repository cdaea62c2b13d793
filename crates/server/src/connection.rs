// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-connection handling: handshake, request loop, heartbeats, cleanup.
//!
//! Each connection runs a read loop in its own task plus a writer task that
//! drains the connection's outbox. The registry pushes `GRANTED`/`QUEUED`
//! into the outbox, so the read loop never waits on a grant.

use std::sync::Arc;
use std::time::Duration;

use lk_core::protocol::{read_message, write_message};
use lk_core::{
    secrets_match, ConnectionId, ConnectionIdGen, Envelope, FrameCodec, LocalId, LockMode,
    LockRegistry, LockStateError, Message, OwnerToken, ProtocolError, PROTOCOL_VERSION,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;

/// Outbound queue of one connection
pub type Outbox = mpsc::UnboundedSender<Message>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("no AUTH within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("no frame within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error(transparent)]
    LockState(#[from] LockStateError),

    #[error("writer task failed: {0}")]
    Writer(#[from] tokio::task::JoinError),
}

/// Everything a connection needs from its server
pub struct ConnectionContext {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<LockRegistry<Outbox>>,
    pub ids: ConnectionIdGen,
}

/// Serve one client stream until it closes, times out or misbehaves
///
/// Whatever ends the connection, everything it held or waited for is
/// released before this returns.
pub async fn serve_connection<S>(ctx: Arc<ConnectionContext>, stream: S, peer: String)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let codec = FrameCodec::for_password(&ctx.config.password, ctx.config.encrypt);

    let connection = match authenticate(&ctx, &codec, &mut reader, &mut writer).await {
        Ok(id) => id,
        Err(e) => {
            warn!(%peer, error = %e, "handshake failed");
            return;
        }
    };
    info!(%connection, %peer, "connection authenticated");

    let (outbox, rx) = mpsc::unbounded_channel();
    let mut writer_task = tokio::spawn(write_loop(
        codec.clone(),
        writer,
        rx,
        ctx.config.heartbeat_interval,
    ));

    let result = tokio::select! {
        r = read_loop(&ctx, &codec, &mut reader, connection, &outbox) => r,
        w = &mut writer_task => writer_outcome(w),
    };
    writer_task.abort();
    drop(outbox);

    match &result {
        Ok(()) => debug!(%connection, "peer closed connection"),
        Err(e) => warn!(%connection, error = %e, "closing connection"),
    }

    let released = ctx.registry.release_all_for_connection(connection);
    info!(%connection, released, "connection closed");
}

/// A writer that panicked or was cancelled is an error, not a peer close
fn writer_outcome(
    joined: Result<Result<(), ConnectionError>, tokio::task::JoinError>,
) -> Result<(), ConnectionError> {
    joined.unwrap_or_else(|e| Err(e.into()))
}

/// Expect `AUTH` as the first frame and answer `AUTH_OK` or `AUTH_FAIL`
async fn authenticate<R, W>(
    ctx: &ConnectionContext,
    codec: &FrameCodec,
    reader: &mut R,
    writer: &mut W,
) -> Result<ConnectionId, ConnectionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let limit = ctx.config.handshake_timeout;
    let body = timeout(limit, read_message(reader))
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout(limit))??;

    let msg = match codec.decode_any(&body) {
        Ok((_, Envelope::Plain)) if codec.is_sealed() => {
            return Err(reject(writer, "encryption required").await);
        }
        Ok((msg, _)) => msg,
        Err(ProtocolError::Crypto(_)) => {
            return Err(reject(writer, "could not open sealed frame").await);
        }
        Err(ProtocolError::UnexpectedSealed) => {
            return Err(reject(writer, "encryption not enabled on server").await);
        }
        Err(e) => return Err(e.into()),
    };

    let (secret, version) = match msg {
        Message::Auth { secret, version } => (secret, version),
        other => {
            let reason = format!("expected AUTH, got {}", other.kind());
            return Err(reject(writer, &reason).await);
        }
    };
    if version != PROTOCOL_VERSION {
        let reason = format!("unsupported protocol version {}", version);
        return Err(reject(writer, &reason).await);
    }
    if ctx.config.requires_auth() && !secrets_match(&secret, &ctx.config.password) {
        return Err(reject(writer, "invalid secret").await);
    }

    let connection = ctx.ids.next();
    codec
        .send(
            writer,
            &Message::AuthOk {
                connection_id: connection.0,
                heartbeat_ms: ctx.config.heartbeat_interval.as_millis() as u64,
            },
        )
        .await?;
    Ok(connection)
}

/// Send `AUTH_FAIL` (always plain, the peer may not share our key)
async fn reject<W: AsyncWrite + Unpin>(writer: &mut W, reason: &str) -> ConnectionError {
    let msg = Message::AuthFail {
        reason: reason.to_string(),
    };
    if let Ok(body) = FrameCodec::encode_plain(&msg) {
        if let Err(e) = write_message(writer, &body).await {
            debug!(error = %e, "could not deliver AUTH_FAIL");
        }
    }
    ConnectionError::AuthFailed(reason.to_string())
}

async fn read_loop<R: AsyncRead + Unpin>(
    ctx: &ConnectionContext,
    codec: &FrameCodec,
    reader: &mut R,
    connection: ConnectionId,
    outbox: &Outbox,
) -> Result<(), ConnectionError> {
    let limit = ctx.config.heartbeat_timeout;
    loop {
        let body = match timeout(limit, read_message(reader)).await {
            Err(_) => return Err(ConnectionError::HeartbeatTimeout(limit)),
            Ok(Err(ProtocolError::ConnectionClosed)) => return Ok(()),
            Ok(result) => result?,
        };
        let msg = codec.decode(&body)?;
        trace!(%connection, kind = msg.kind(), "received");

        match msg {
            Message::Heartbeat => {}
            Message::LockRead {
                request_id,
                name,
                owner,
            } => acquire(ctx, connection, outbox, LockMode::Read, request_id, &name, owner)?,
            Message::LockWrite {
                request_id,
                name,
                owner,
            } => acquire(ctx, connection, outbox, LockMode::Write, request_id, &name, owner)?,
            Message::UnlockRead { name, owner, .. } => {
                let token = OwnerToken::new(connection, LocalId(owner));
                ctx.registry.release_read(&name, token)?;
            }
            Message::UnlockWrite { name, owner, .. } => {
                let token = OwnerToken::new(connection, LocalId(owner));
                ctx.registry.release_write(&name, token)?;
            }
            other => return Err(ProtocolError::UnexpectedMessage(other.kind()).into()),
        }
    }
}

fn acquire(
    ctx: &ConnectionContext,
    connection: ConnectionId,
    outbox: &Outbox,
    mode: LockMode,
    request_id: u64,
    name: &str,
    owner: u64,
) -> Result<(), ConnectionError> {
    let token = OwnerToken::new(connection, LocalId(owner));
    let outcome = ctx
        .registry
        .acquire(name, token, mode, request_id, outbox.clone())?;
    debug!(lock = %name, owner = %token, %mode, request_id, ?outcome, "acquire");
    Ok(())
}

/// Drain the outbox and send heartbeats every `interval`
async fn write_loop<W: AsyncWrite + Unpin>(
    codec: FrameCodec,
    mut writer: W,
    mut outbox: mpsc::UnboundedReceiver<Message>,
    interval: Duration,
) -> Result<(), ConnectionError> {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = outbox.recv() => match msg {
                Some(msg) => codec.send(&mut writer, &msg).await?,
                None => return Ok(()),
            },
            _ = ticker.tick() => codec.send(&mut writer, &Message::Heartbeat).await?,
        }
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
