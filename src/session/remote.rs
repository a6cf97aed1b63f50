//! RemoteSession contract and the telnet TCP adapter

use crate::error::EngineError;
use crate::session::SessionFactory;
use crate::token::Token;
use async_trait::async_trait;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Stateful session to one remote endpoint.
///
/// The engine only ever drives one command at a time through a session; the
/// single-worker queue enforces that, so implementations do not need their
/// own command-level locking.
#[async_trait]
pub trait RemoteSession: Send {
    /// Establish the connection. Ok(true) once the session is usable.
    async fn connect(&mut self) -> Result<bool, EngineError>;

    fn is_connected(&self) -> bool;

    /// Send one command line and await the response within `response_timeout`
    async fn send_command(
        &mut self,
        text: &str,
        response_timeout: Duration,
    ) -> Result<String, EngineError>;

    async fn close(&mut self);
}

/// Idle gap after the first response chunk before the reply is considered
/// complete. The devices have no end-of-response marker.
const RESPONSE_IDLE_MS: u64 = 200;

/// Line-oriented TCP session (telnet-style command/response exchange)
pub struct TelnetSession {
    addr: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TelnetSession {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(5),
            stream: None,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Strip a leading echo of the sent command, which telnet endpoints
    /// commonly reflect before the actual response.
    fn strip_echo<'a>(sent: &str, response: &'a str) -> &'a str {
        let response = response.trim_start();
        match response.strip_prefix(sent.trim_end()) {
            Some(rest) => rest,
            None => response,
        }
    }
}

#[async_trait]
impl RemoteSession for TelnetSession {
    async fn connect(&mut self) -> Result<bool, EngineError> {
        if self.stream.is_some() {
            return Ok(true);
        }

        match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                debug!("Connected to {}", self.addr);
                self.stream = Some(stream);
                Ok(true)
            }
            Ok(Err(e)) => Err(EngineError::Io(e)),
            Err(_) => Err(EngineError::SessionUnavailable(format!(
                "connect to {} timed out",
                self.addr
            ))),
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn send_command(
        &mut self,
        text: &str,
        response_timeout: Duration,
    ) -> Result<String, EngineError> {
        let stream = self.stream.as_mut().ok_or(EngineError::ConnectionClosed)?;

        let line = format!("{}\r\n", text.trim_end());
        if let Err(e) = stream.write_all(line.as_bytes()).await {
            self.stream = None;
            return Err(EngineError::Io(e));
        }

        let mut response = BytesMut::with_capacity(4096);
        let mut chunk = [0u8; 4096];

        // First chunk must arrive within the response timeout
        match timeout(response_timeout, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                self.stream = None;
                return Err(EngineError::ConnectionClosed);
            }
            Ok(Ok(n)) => response.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => {
                self.stream = None;
                return Err(EngineError::Io(e));
            }
            Err(_) => return Err(EngineError::CommandTimeout(response_timeout)),
        }

        // Drain trailing chunks until the endpoint goes idle
        loop {
            match timeout(Duration::from_millis(RESPONSE_IDLE_MS), stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    self.stream = None;
                    break;
                }
                Ok(Ok(n)) => response.extend_from_slice(&chunk[..n]),
                Ok(Err(_)) | Err(_) => break,
            }
        }

        let raw = String::from_utf8_lossy(&response);
        Ok(Self::strip_echo(text, &raw).trim().to_string())
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Closed session to {}", self.addr);
        }
    }
}

/// Factory producing telnet sessions for tokens.
///
/// Tokens carrying any other protocol get a stub session whose connect fails
/// gracefully, so an unsupported record surfaces as one failed task.
pub struct TelnetSessionFactory {
    connect_timeout: Duration,
}

impl TelnetSessionFactory {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for TelnetSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionFactory for TelnetSessionFactory {
    fn create(&self, token: &Token) -> Box<dyn RemoteSession> {
        if token.protocol == "telnet" {
            Box::new(
                TelnetSession::new(token.endpoint.address())
                    .with_connect_timeout(self.connect_timeout),
            )
        } else {
            Box::new(UnsupportedSession {
                protocol: token.protocol.clone(),
            })
        }
    }
}

struct UnsupportedSession {
    protocol: String,
}

#[async_trait]
impl RemoteSession for UnsupportedSession {
    async fn connect(&mut self) -> Result<bool, EngineError> {
        Err(EngineError::UnsupportedProtocol(self.protocol.clone()))
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn send_command(
        &mut self,
        _text: &str,
        _response_timeout: Duration,
    ) -> Result<String, EngineError> {
        Err(EngineError::UnsupportedProtocol(self.protocol.clone()))
    }

    async fn close(&mut self) {}
}
