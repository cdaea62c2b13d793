//! Shared helpers for specs

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpStream;

pub use lk_client::{ClientConfig, ClientError, LockManager};
pub use lk_core::{Holders, LocalId, LockMode, Message, PROTOCOL_VERSION};
pub use lk_server::{ServerConfig, ServerHandle};
pub use std::sync::atomic::{AtomicU32, Ordering};
pub use std::sync::{Arc, Mutex};
pub use std::thread;
pub use std::time::{Duration, Instant};

use lk_core::FrameCodec;
use predicates::prelude::*;

/// Start a server on a free loopback port
pub fn start(config: ServerConfig) -> ServerHandle {
    ServerHandle::start(config.with_bind("127.0.0.1")).unwrap()
}

pub fn client_config(server: &ServerHandle) -> ClientConfig {
    ClientConfig::new("127.0.0.1", server.port())
}

/// A connected manager with the given password
pub fn connect(server: &ServerHandle, password: &str) -> LockManager {
    let manager = LockManager::new(client_config(server).with_password(password)).unwrap();
    manager.connect().unwrap();
    manager
}

/// Poll `check` for up to 5 seconds
pub fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

pub fn is_free(server: &ServerHandle, name: &str) -> bool {
    server
        .registry()
        .snapshot(name)
        .is_some_and(|s| s.holders == Holders::Free)
}

pub fn queued(server: &ServerHandle, name: &str) -> usize {
    server
        .registry()
        .snapshot(name)
        .map_or(0, |s| s.queued.len())
}

/// Blocking socket that speaks the wire protocol by hand
pub struct RawClient {
    stream: TcpStream,
}

impl RawClient {
    pub fn connect(server: &ServerHandle) -> Self {
        let stream = TcpStream::connect(server.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self { stream }
    }

    /// Connect and authenticate; returns the connection id
    pub fn login(server: &ServerHandle, secret: &str) -> (Self, u64) {
        let mut client = Self::connect(server);
        client.send(&Message::Auth {
            secret: secret.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        });
        match client.recv() {
            Message::AuthOk { connection_id, .. } => (client, connection_id),
            other => panic!("expected AUTH_OK, got {:?}", other),
        }
    }

    pub fn send(&mut self, msg: &Message) {
        let body = FrameCodec::encode_plain(msg).unwrap();
        self.send_body(&body);
    }

    pub fn send_body(&mut self, body: &[u8]) {
        self.stream
            .write_all(&(body.len() as u32).to_be_bytes())
            .unwrap();
        self.stream.write_all(body).unwrap();
    }

    /// Next message other than a heartbeat
    pub fn recv(&mut self) -> Message {
        loop {
            let body = self.read_frame().expect("connection closed");
            let msg = FrameCodec::plain().decode(&body).unwrap();
            if msg != Message::Heartbeat {
                return msg;
            }
        }
    }

    /// Whether the server closed the socket, draining any heartbeats
    pub fn closed_by_server(&mut self) -> bool {
        loop {
            match self.read_frame() {
                None => return true,
                Some(body) => match FrameCodec::plain().decode(&body) {
                    Ok(Message::Heartbeat) => continue,
                    _ => return false,
                },
            }
        }
    }

    fn read_frame(&mut self) -> Option<Vec<u8>> {
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len).ok()?;
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        self.stream.read_exact(&mut body).ok()?;
        Some(body)
    }
}

/// Run of the `lkd` binary with chainable assertions
pub struct CliRun {
    output: std::process::Output,
}

pub fn lkd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("lkd").unwrap();
    cmd.env_remove("LK_PASSWORD");
    cmd
}

pub trait CliExt {
    fn passes(&mut self) -> CliRun;
    fn fails(&mut self) -> CliRun;
}

impl CliExt for assert_cmd::Command {
    fn passes(&mut self) -> CliRun {
        let output = self.timeout(Duration::from_secs(10)).output().unwrap();
        assert!(
            output.status.success(),
            "expected success, stderr:\n{}",
            String::from_utf8_lossy(&output.stderr)
        );
        CliRun { output }
    }

    fn fails(&mut self) -> CliRun {
        let output = self.timeout(Duration::from_secs(10)).output().unwrap();
        assert!(
            !output.status.success(),
            "expected failure, stdout:\n{}",
            String::from_utf8_lossy(&output.stdout)
        );
        CliRun { output }
    }
}

impl CliRun {
    pub fn stdout_has(self, needle: &str) -> Self {
        let stdout = String::from_utf8_lossy(&self.output.stdout);
        assert!(
            predicate::str::contains(needle).eval(&*stdout),
            "stdout missing {needle:?}:\n{stdout}"
        );
        self
    }

    pub fn stderr_has(self, needle: &str) -> Self {
        let stderr = String::from_utf8_lossy(&self.output.stderr);
        assert!(
            predicate::str::contains(needle).eval(&*stderr),
            "stderr missing {needle:?}:\n{stderr}"
        );
        self
    }
}
