//! Scripted session and sink fixtures shared by the queue and batch tests

use crate::error::EngineError;
use crate::logsink::TokenLogSink;
use crate::session::{RemoteSession, SessionFactory};
use crate::token::Token;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared script: canned responses, fault injection, and a dispatch-order
/// record spanning every session the factory creates.
pub(crate) struct Script {
    sent: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, String)>>,
    default_response: Mutex<String>,
    refuse_connect: Mutex<Vec<String>>,
    command_delay: Mutex<Duration>,
    created: AtomicUsize,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            default_response: Mutex::new("OK".to_string()),
            refuse_connect: Mutex::new(Vec::new()),
            command_delay: Mutex::new(Duration::ZERO),
            created: AtomicUsize::new(0),
        })
    }

    /// Commands containing `fragment` get `response` instead of the default
    pub fn respond(&self, fragment: &str, response: &str) {
        self.responses
            .lock()
            .unwrap()
            .push((fragment.to_string(), response.to_string()));
    }

    pub fn set_default_response(&self, response: &str) {
        *self.default_response.lock().unwrap() = response.to_string();
    }

    /// Sessions whose address contains `fragment` refuse to connect
    pub fn refuse_connect_to(&self, fragment: &str) {
        self.refuse_connect.lock().unwrap().push(fragment.to_string());
    }

    pub fn set_command_delay(&self, delay: Duration) {
        *self.command_delay.lock().unwrap() = delay;
    }

    pub fn sent_commands(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn response_for(&self, command: &str) -> String {
        for (fragment, response) in self.responses.lock().unwrap().iter() {
            if command.contains(fragment.as_str()) {
                return response.clone();
            }
        }
        self.default_response.lock().unwrap().clone()
    }

    fn refuses(&self, addr: &str) -> bool {
        self.refuse_connect
            .lock()
            .unwrap()
            .iter()
            .any(|fragment| addr.contains(fragment.as_str()))
    }

    fn delay(&self) -> Duration {
        *self.command_delay.lock().unwrap()
    }
}

pub(crate) struct ScriptedFactory {
    script: Arc<Script>,
}

impl ScriptedFactory {
    pub fn new(script: Arc<Script>) -> Self {
        Self { script }
    }
}

impl SessionFactory for ScriptedFactory {
    fn create(&self, token: &Token) -> Box<dyn RemoteSession> {
        self.script.created.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedSession {
            script: self.script.clone(),
            addr: token.endpoint.address(),
            connected: false,
        })
    }
}

pub(crate) struct ScriptedSession {
    script: Arc<Script>,
    addr: String,
    connected: bool,
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn connect(&mut self) -> Result<bool, EngineError> {
        if self.script.refuses(&self.addr) {
            return Err(EngineError::SessionUnavailable(format!(
                "connection refused: {}",
                self.addr
            )));
        }
        self.connected = true;
        Ok(true)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send_command(
        &mut self,
        text: &str,
        _response_timeout: Duration,
    ) -> Result<String, EngineError> {
        let delay = self.script.delay();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        self.script.sent.lock().unwrap().push(text.to_string());
        Ok(self.script.response_for(text))
    }

    async fn close(&mut self) {
        self.connected = false;
    }
}

/// Records every sink call so tests can assert the notification sequence
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub calls: Mutex<Vec<String>>,
    pub lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenLogSink for RecordingSink {
    async fn batch_started(&self, _batch_id: &str, node: &str, token_count: usize) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("started:{}:{}", node, token_count));
    }

    async fn open_token_log(&self, token: &Token, _batch_id: &str) -> Option<PathBuf> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("open:{}:{}", token.token_id, token.kind));
        Some(PathBuf::from(format!("{}.log", token.token_id)))
    }

    async fn log(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }

    async fn batch_finished(&self, _batch_id: &str, node: &str, success: usize, total: usize) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("finished:{}:{}/{}", node, success, total));
    }
}
