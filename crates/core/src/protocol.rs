// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol shared by the lock server and its clients
//!
//! Every frame is a 4-byte big-endian length followed by a body. The body
//! starts with an envelope byte: [`PLAIN`] means JSON follows, [`SEALED`]
//! means an encrypted JSON message follows (see [`crate::crypto`]).

use crate::crypto::{CryptoError, FrameCipher};
use crate::lock::LockMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version exchanged during authentication
pub const PROTOCOL_VERSION: &str = "1";

/// Upper bound on a frame body
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Envelope byte for an unencrypted body
pub const PLAIN: u8 = 0;
/// Envelope byte for an encrypted body
pub const SEALED: u8 = 1;

/// Protocol messages in both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// First frame of every connection
    Auth { secret: String, version: String },
    AuthOk {
        connection_id: u64,
        heartbeat_ms: u64,
    },
    AuthFail { reason: String },
    LockRead {
        request_id: u64,
        name: String,
        owner: u64,
    },
    LockWrite {
        request_id: u64,
        name: String,
        owner: u64,
    },
    UnlockRead {
        request_id: u64,
        name: String,
        owner: u64,
    },
    UnlockWrite {
        request_id: u64,
        name: String,
        owner: u64,
    },
    /// The request holds the lock now (immediately or after queueing)
    Granted {
        request_id: u64,
        name: String,
        owner: u64,
    },
    /// The request is waiting; a `Granted` with the same id follows later
    Queued {
        request_id: u64,
        name: String,
        owner: u64,
    },
    Heartbeat,
}

impl Message {
    pub fn lock(mode: LockMode, request_id: u64, name: impl Into<String>, owner: u64) -> Self {
        let name = name.into();
        match mode {
            LockMode::Read => Message::LockRead {
                request_id,
                name,
                owner,
            },
            LockMode::Write => Message::LockWrite {
                request_id,
                name,
                owner,
            },
        }
    }

    pub fn unlock(mode: LockMode, request_id: u64, name: impl Into<String>, owner: u64) -> Self {
        let name = name.into();
        match mode {
            LockMode::Read => Message::UnlockRead {
                request_id,
                name,
                owner,
            },
            LockMode::Write => Message::UnlockWrite {
                request_id,
                name,
                owner,
            },
        }
    }

    /// Short wire name, for logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "AUTH",
            Message::AuthOk { .. } => "AUTH_OK",
            Message::AuthFail { .. } => "AUTH_FAIL",
            Message::LockRead { .. } => "LOCK_READ",
            Message::LockWrite { .. } => "LOCK_WRITE",
            Message::UnlockRead { .. } => "UNLOCK_READ",
            Message::UnlockWrite { .. } => "UNLOCK_WRITE",
            Message::Granted { .. } => "GRANTED",
            Message::Queued { .. } => "QUEUED",
            Message::Heartbeat => "HEARTBEAT",
        }
    }
}

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Unknown envelope byte: {0}")]
    UnknownEnvelope(u8),

    #[error("Sealed frame received but encryption is not enabled")]
    UnexpectedSealed,

    #[error("Plain frame received on an encrypted connection")]
    UnexpectedPlain,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Unexpected {0} message")]
    UnexpectedMessage(&'static str),

    #[error("Unknown request id: {0}")]
    UnknownRequest(u64),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

/// Encode a message as raw JSON (no envelope, no length prefix)
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode raw JSON
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Read one length-prefixed frame
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::ConnectionClosed
        } else {
            e.into()
        }
    })?;
    Ok(buf)
}

/// Write one length-prefixed frame
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ProtocolError> {
    if data.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }
    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// How a received frame was wrapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
    Plain,
    Sealed,
}

/// Turns messages into frame bodies and back, sealing when a cipher is set
#[derive(Clone, Debug, Default)]
pub struct FrameCodec {
    cipher: Option<FrameCipher>,
}

impl FrameCodec {
    pub fn plain() -> Self {
        Self { cipher: None }
    }

    pub fn sealed(cipher: FrameCipher) -> Self {
        Self {
            cipher: Some(cipher),
        }
    }

    /// Sealed codec keyed by `password` when `encrypt` is set, plain otherwise
    pub fn for_password(password: &str, encrypt: bool) -> Self {
        if encrypt {
            Self::sealed(FrameCipher::from_password(password))
        } else {
            Self::plain()
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.cipher.is_some()
    }

    /// Frame body for `msg`, sealed if this codec has a cipher
    pub fn encode(&self, msg: &Message) -> Result<Vec<u8>, ProtocolError> {
        let json = encode(msg)?;
        let mut body = Vec::with_capacity(json.len() + 29);
        match &self.cipher {
            Some(cipher) => {
                body.push(SEALED);
                body.extend_from_slice(&cipher.seal(&json)?);
            }
            None => {
                body.push(PLAIN);
                body.extend_from_slice(&json);
            }
        }
        Ok(body)
    }

    /// Frame body for `msg`, never sealed
    pub fn encode_plain(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
        Self::plain().encode(msg)
    }

    /// Decode a frame of an established session
    ///
    /// An encrypted session rejects plain frames.
    pub fn decode(&self, body: &[u8]) -> Result<Message, ProtocolError> {
        let (msg, envelope) = self.decode_any(body)?;
        if self.is_sealed() && envelope == Envelope::Plain {
            return Err(ProtocolError::UnexpectedPlain);
        }
        Ok(msg)
    }

    /// Decode a handshake frame, accepting either envelope
    pub fn decode_any(&self, body: &[u8]) -> Result<(Message, Envelope), ProtocolError> {
        let (&tag, rest) = body.split_first().ok_or(ProtocolError::EmptyFrame)?;
        match tag {
            PLAIN => Ok((decode(rest)?, Envelope::Plain)),
            SEALED => {
                let cipher = self.cipher.as_ref().ok_or(ProtocolError::UnexpectedSealed)?;
                let json = cipher.open(rest)?;
                Ok((decode(&json)?, Envelope::Sealed))
            }
            other => Err(ProtocolError::UnknownEnvelope(other)),
        }
    }

    pub async fn send<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        msg: &Message,
    ) -> Result<(), ProtocolError> {
        let body = self.encode(msg)?;
        write_message(writer, &body).await
    }

    pub async fn recv<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Message, ProtocolError> {
        let body = read_message(reader).await?;
        self.decode(&body)
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
