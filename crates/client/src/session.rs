// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One authenticated connection to the lock server
//!
//! A session runs two tasks on the manager's runtime: a reader that resolves
//! pending acquires from `GRANTED` frames, and a writer that drains the
//! outbox and sends heartbeats. When either task ends the session is closed,
//! every pending acquire fails with [`ClientError::ConnectionLost`], the other
//! task stops and the write half is shut down so the server sees the
//! disconnect and releases this connection's holds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lk_core::protocol::read_message;
use lk_core::{
    ConnectionId, FrameCodec, LocalId, LockMode, Message, ProtocolError, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;

/// Completion of one acquire request
pub(crate) type Grant = oneshot::Receiver<Result<(), ClientError>>;

#[derive(Default)]
struct PendingState {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<Result<(), ClientError>>>,
}

/// State shared between the session and its tasks
struct Pending {
    state: Mutex<PendingState>,
    shutdown: watch::Sender<bool>,
}

impl Pending {
    fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Mutex::new(PendingState::default()),
            shutdown,
        }
    }

    fn closing(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    fn insert(&self, request_id: u64) -> Result<Grant, ClientError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(ClientError::ConnectionLost);
        }
        state.waiters.insert(request_id, tx);
        Ok(rx)
    }

    fn remove(&self, request_id: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.waiters.remove(&request_id);
    }

    fn contains(&self, request_id: u64) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.waiters.contains_key(&request_id)
    }

    fn complete(&self, request_id: u64) -> bool {
        let waiter = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.waiters.remove(&request_id)
        };
        match waiter {
            Some(tx) => {
                // The caller may have given up; the hold is still ours
                let _ = tx.send(Ok(()));
                true
            }
            None => false,
        }
    }

    /// Mark closed and fail every pending acquire; returns how many failed
    fn close(&self) -> usize {
        let waiters = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };
        self.shutdown.send_replace(true);
        let failed = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(Err(ClientError::ConnectionLost));
        }
        failed
    }
}

pub(crate) struct Session {
    epoch: u64,
    connection: ConnectionId,
    next_request: AtomicU64,
    outbox: mpsc::UnboundedSender<Message>,
    pending: Arc<Pending>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Connect, authenticate and start the session tasks
    ///
    /// Must run inside the runtime that will own the tasks.
    pub(crate) async fn open(config: &ClientConfig, epoch: u64) -> Result<Self, ClientError> {
        let addr = config.addr();
        let stream = timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::Timeout(addr.clone()))?
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        let codec = FrameCodec::for_password(&config.password, config.encrypt);

        let (connection, heartbeat_ms) = timeout(
            config.connect_timeout,
            handshake(&codec, &config.password, &mut reader, &mut writer),
        )
        .await
        .map_err(|_| ClientError::Timeout(addr.clone()))??;
        let heartbeat = Duration::from_millis(heartbeat_ms.max(1));
        if config.heartbeat_timeout <= heartbeat {
            return Err(ClientError::Config(format!(
                "heartbeat timeout ({:?}) must be larger than the server's heartbeat interval ({:?})",
                config.heartbeat_timeout, heartbeat
            )));
        }
        info!(%connection, %addr, "connected to lock server");

        let pending = Arc::new(Pending::new());
        let (outbox, rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_loop(
            codec.clone(),
            reader,
            Arc::clone(&pending),
            config.heartbeat_timeout,
            connection,
        ));
        let writer_task = tokio::spawn(write_loop(
            codec,
            writer,
            rx,
            Arc::clone(&pending),
            heartbeat,
            connection,
        ));

        Ok(Self {
            epoch,
            connection,
            next_request: AtomicU64::new(1),
            outbox,
            pending,
            tasks: vec![reader_task, writer_task],
        })
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.pending.is_closed()
    }

    /// Send an acquire; the returned receiver completes on `GRANTED`
    pub(crate) fn acquire(
        &self,
        mode: LockMode,
        name: &str,
        owner: LocalId,
    ) -> Result<Grant, ClientError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        // Registered before sending so a fast GRANTED always finds it
        let grant = self.pending.insert(request_id)?;
        if self
            .outbox
            .send(Message::lock(mode, request_id, name, owner.0))
            .is_err()
        {
            self.pending.remove(request_id);
            return Err(ClientError::ConnectionLost);
        }
        trace!(connection = %self.connection, lock = %name, %mode, request_id, "acquire sent");
        Ok(grant)
    }

    /// Send a release; the server does not answer it
    pub(crate) fn release(
        &self,
        mode: LockMode,
        name: &str,
        owner: LocalId,
    ) -> Result<(), ClientError> {
        if self.pending.is_closed() {
            return Err(ClientError::ConnectionLost);
        }
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.outbox
            .send(Message::unlock(mode, request_id, name, owner.0))
            .map_err(|_| ClientError::ConnectionLost)
    }

    /// Drop the connection without waiting for anything
    pub(crate) fn close(&self) {
        let failed = self.pending.close();
        for task in &self.tasks {
            task.abort();
        }
        debug!(connection = %self.connection, failed, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Send `AUTH` and wait for the verdict
async fn handshake<R, W>(
    codec: &FrameCodec,
    password: &str,
    reader: &mut R,
    writer: &mut W,
) -> Result<(ConnectionId, u64), ClientError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let auth = Message::Auth {
        secret: password.to_string(),
        version: PROTOCOL_VERSION.to_string(),
    };
    codec.send(writer, &auth).await?;

    let body = match read_message(reader).await {
        Ok(body) => body,
        Err(ProtocolError::ConnectionClosed) => {
            return Err(ClientError::Authentication(
                "server closed the connection during the handshake".to_string(),
            ))
        }
        Err(e) => return Err(e.into()),
    };
    // AUTH_FAIL is always plain, so accept either envelope here
    let (msg, _) = codec.decode_any(&body)?;
    match msg {
        Message::AuthOk {
            connection_id,
            heartbeat_ms,
        } => Ok((ConnectionId(connection_id), heartbeat_ms)),
        Message::AuthFail { reason } => Err(ClientError::Authentication(reason)),
        other => Err(ProtocolError::UnexpectedMessage(other.kind()).into()),
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    codec: FrameCodec,
    mut reader: R,
    pending: Arc<Pending>,
    limit: Duration,
    connection: ConnectionId,
) {
    let result = tokio::select! {
        r = read_frames(&codec, &mut reader, &pending, limit, connection) => r,
        _ = until_closed(pending.closing()) => Ok(()),
    };
    match result {
        Err(ProtocolError::ConnectionClosed) => info!(%connection, "server closed connection"),
        Err(ProtocolError::Timeout) => warn!(%connection, ?limit, "no heartbeat from server"),
        Err(e) => warn!(%connection, error = %e, "dropping connection"),
        Ok(()) => {}
    }
    pending.close();
}

async fn read_frames<R: AsyncRead + Unpin>(
    codec: &FrameCodec,
    reader: &mut R,
    pending: &Pending,
    limit: Duration,
    connection: ConnectionId,
) -> Result<(), ProtocolError> {
    loop {
        let body = timeout(limit, read_message(reader))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        match codec.decode(&body)? {
            Message::Heartbeat => {}
            Message::Granted { request_id, .. } => {
                if !pending.complete(request_id) {
                    return Err(ProtocolError::UnknownRequest(request_id));
                }
            }
            Message::Queued {
                request_id, name, ..
            } => {
                if !pending.contains(request_id) {
                    return Err(ProtocolError::UnknownRequest(request_id));
                }
                debug!(%connection, lock = %name, request_id, "queued");
            }
            other => return Err(ProtocolError::UnexpectedMessage(other.kind())),
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    codec: FrameCodec,
    mut writer: W,
    mut outbox: mpsc::UnboundedReceiver<Message>,
    pending: Arc<Pending>,
    interval: Duration,
    connection: ConnectionId,
) {
    let result = tokio::select! {
        r = write_frames(&codec, &mut writer, &mut outbox, interval) => r,
        _ = until_closed(pending.closing()) => Ok(()),
    };
    if let Err(e) = result {
        warn!(%connection, error = %e, "write failed");
    }
    pending.close();
    // EOF tells the server to release everything this connection held
    if let Err(e) = writer.shutdown().await {
        debug!(%connection, error = %e, "shutdown of write half failed");
    }
}

/// Resolves once the session is closed or dropped
async fn until_closed(mut closing: watch::Receiver<bool>) {
    loop {
        let closed = *closing.borrow_and_update();
        if closed || closing.changed().await.is_err() {
            return;
        }
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(
    codec: &FrameCodec,
    writer: &mut W,
    outbox: &mut mpsc::UnboundedReceiver<Message>,
    interval: Duration,
) -> Result<(), ProtocolError> {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = outbox.recv() => match msg {
                Some(msg) => codec.send(writer, &msg).await?,
                None => return Ok(()),
            },
            _ = ticker.tick() => codec.send(writer, &Message::Heartbeat).await?,
        }
    }
}
