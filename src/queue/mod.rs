//! Single-worker command queue
//!
//! Accepts (command, token) pairs and executes them against remote sessions
//! strictly one at a time. The remote endpoints are single-session devices
//! that cannot handle interleaved commands, so execution concurrency is fixed
//! at one: a single dedicated worker task, woken on enqueue.
//!
//! No error ever escapes the worker. Session acquisition and send failures
//! become the task result ("Command failed: ...") with success=false, and
//! every task reaches a terminal status that is reported on the completion
//! channel.

use crate::defaults;
use crate::error::EngineError;
use crate::session::{SessionManager, SharedSession};
use crate::token::Token;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Task lifecycle: Pending -> Processing -> Completed | Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// What happens to a task record once it reaches a terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Drop the record as soon as its completion is emitted
    PurgeOnComplete,
    /// Keep terminal records inspectable until an explicit cleanup pass
    RetainUntilCleanup,
}

/// Queue execution parameters
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Connection verification attempts per task
    pub connect_attempts: u32,
    /// Backoff between connection attempts
    pub connect_backoff: Duration,
    /// Response timeout per command
    pub command_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            connect_attempts: defaults::CONNECT_ATTEMPTS,
            connect_backoff: Duration::from_millis(defaults::CONNECT_BACKOFF_MS),
            command_timeout: Duration::from_millis(defaults::COMMAND_TIMEOUT_MS),
        }
    }
}

/// One enqueued unit of work
struct QueuedTask {
    id: u64,
    command: String,
    token: Token,
    status: TaskStatus,
    /// Caller-supplied session, reused opportunistically when still connected
    session: Option<SharedSession>,
    result: Option<String>,
}

// The session trait object has no Debug; report only whether one is bound
impl std::fmt::Debug for QueuedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedTask")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("token", &self.token)
            .field("status", &self.status)
            .field("session", &self.session.is_some())
            .field("result", &self.result)
            .finish()
    }
}

/// Emitted once per task when it reaches a terminal status
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub task_id: u64,
    pub command: String,
    pub result: String,
    pub success: bool,
    pub token: Token,
}

struct QueueInner {
    tasks: RwLock<Vec<QueuedTask>>,
    notify: Notify,
    sessions: Arc<SessionManager>,
    completion_tx: mpsc::UnboundedSender<TaskCompletion>,
    retention: RetentionPolicy,
    next_id: AtomicU64,
    config: QueueConfig,
}

/// Single-consumer execution queue for remote commands
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl CommandQueue {
    /// Create the queue and spawn its worker. The returned receiver carries
    /// one completion per task.
    pub fn new(
        sessions: Arc<SessionManager>,
        retention: RetentionPolicy,
        config: QueueConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TaskCompletion>) {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(QueueInner {
            tasks: RwLock::new(Vec::new()),
            notify: Notify::new(),
            sessions,
            completion_tx,
            retention,
            next_id: AtomicU64::new(0),
            config,
        });

        let worker_inner = inner.clone();
        tokio::spawn(async move {
            worker_loop(worker_inner).await;
        });

        (Self { inner }, completion_rx)
    }

    /// A task is valid only with a non-empty command and token id
    pub fn validate(command: &str, token: &Token) -> bool {
        !command.trim().is_empty() && !token.token_id.is_empty()
    }

    /// Append a task in pending state and wake the worker. Processing is
    /// edge-triggered: the sole pending task starts immediately.
    pub async fn enqueue(
        &self,
        command: impl Into<String>,
        token: Token,
        session: Option<SharedSession>,
    ) -> Result<u64, EngineError> {
        let command = command.into();
        if !Self::validate(&command, &token) {
            return Err(EngineError::InvalidTask(format!(
                "empty command or token id (token {:?})",
                token.token_id
            )));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.tasks.write().await.push(QueuedTask {
            id,
            command,
            token,
            status: TaskStatus::Pending,
            session,
            result: None,
        });

        self.inner.notify.notify_one();
        Ok(id)
    }

    /// Re-kick the worker for anything still pending
    pub fn start_processing(&self) {
        self.inner.notify.notify_one();
    }

    /// Drop every pending task; the in-flight task is not interrupted.
    /// Returns how many were cleared.
    pub async fn clear_pending(&self) -> usize {
        let mut tasks = self.inner.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|t| t.status != TaskStatus::Pending);
        before - tasks.len()
    }

    /// Manual cleanup pass: drop terminal task records. Returns how many
    /// were purged.
    pub async fn cleanup_completed(&self) -> usize {
        let mut tasks = self.inner.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|t| !t.status.is_terminal());
        before - tasks.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner
            .tasks
            .read()
            .await
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Total task records currently held, including retained terminal ones
    pub async fn task_count(&self) -> usize {
        self.inner.tasks.read().await.len()
    }

    pub async fn task_status(&self, id: u64) -> Option<TaskStatus> {
        self.inner
            .tasks
            .read()
            .await
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.status)
    }

    /// Result text of a retained terminal task, if the record still exists
    pub async fn task_result(&self, id: u64) -> Option<String> {
        self.inner
            .tasks
            .read()
            .await
            .iter()
            .find(|t| t.id == id)
            .and_then(|t| t.result.clone())
    }
}

/// Classify a raw response: empty is success-with-warning, an embedded
/// "error" marker (case-insensitive) is failure, anything else is success.
pub fn classify_response(response: &str) -> (String, bool) {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        warn!("Empty response treated as success");
        ("(empty response)".to_string(), true)
    } else if trimmed.to_ascii_lowercase().contains("error") {
        (trimmed.to_string(), false)
    } else {
        (trimmed.to_string(), true)
    }
}

async fn worker_loop(inner: Arc<QueueInner>) {
    loop {
        let next = {
            let mut tasks = inner.tasks.write().await;
            match tasks.iter_mut().find(|t| t.status == TaskStatus::Pending) {
                Some(task) => {
                    task.status = TaskStatus::Processing;
                    Some((
                        task.id,
                        task.command.clone(),
                        task.token.clone(),
                        task.session.clone(),
                    ))
                }
                None => None,
            }
        };

        let Some((id, command, token, session)) = next else {
            inner.notify.notified().await;
            continue;
        };

        debug!("Executing task {}: {}", id, command);
        let (result, success) = execute_task(&inner, &command, &token, session).await;

        {
            let mut tasks = inner.tasks.write().await;
            if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
                task.status = if success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                task.result = Some(result.clone());
                // Session hold ends with the task
                task.session = None;
            }
            if inner.retention == RetentionPolicy::PurgeOnComplete {
                tasks.retain(|t| t.id != id);
            }
        }

        let completion = TaskCompletion {
            task_id: id,
            command,
            result,
            success,
            token,
        };
        if inner.completion_tx.send(completion).is_err() {
            debug!("Completion receiver dropped, queue worker exiting");
            break;
        }
    }
}

/// Run one task to a terminal result. Never returns an error: failures are
/// folded into the (result, success=false) pair.
async fn execute_task(
    inner: &QueueInner,
    command: &str,
    token: &Token,
    prebound: Option<SharedSession>,
) -> (String, bool) {
    match run_command(inner, command, token, prebound).await {
        Ok(response) => classify_response(&response),
        Err(e) => (format!("Command failed: {}", e), false),
    }
}

async fn run_command(
    inner: &QueueInner,
    command: &str,
    token: &Token,
    prebound: Option<SharedSession>,
) -> Result<String, EngineError> {
    // Reuse the caller-supplied session only while it is still connected
    let session = match prebound {
        Some(s) => {
            let connected = s.lock().await.is_connected();
            if connected {
                s
            } else {
                inner.sessions.acquire(token).await
            }
        }
        None => inner.sessions.acquire(token).await,
    };

    let mut guard = session.lock().await;

    let mut last_error: Option<EngineError> = None;
    for attempt in 1..=inner.config.connect_attempts {
        if guard.is_connected() {
            last_error = None;
            break;
        }
        match guard.connect().await {
            Ok(true) => {
                last_error = None;
                break;
            }
            Ok(false) => {
                last_error = Some(EngineError::SessionUnavailable(format!(
                    "connect declined by {}",
                    token.endpoint.address()
                )));
            }
            Err(e) => last_error = Some(e),
        }
        if attempt < inner.config.connect_attempts {
            sleep(inner.config.connect_backoff).await;
        }
    }

    if let Some(e) = last_error {
        return Err(EngineError::ConnectFailed {
            addr: token.endpoint.address(),
            attempts: inner.config.connect_attempts,
            reason: e.to_string(),
        });
    }

    guard.send_command(command, inner.config.command_timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Script, ScriptedFactory};
    use crate::token::{Endpoint, TokenKind};

    fn fast_config() -> QueueConfig {
        QueueConfig {
            connect_attempts: 3,
            connect_backoff: Duration::from_millis(1),
            command_timeout: Duration::from_millis(100),
        }
    }

    fn setup(
        retention: RetentionPolicy,
    ) -> (
        Arc<Script>,
        Arc<SessionManager>,
        CommandQueue,
        mpsc::UnboundedReceiver<TaskCompletion>,
    ) {
        let script = Script::new();
        let sessions = Arc::new(SessionManager::new(Box::new(ScriptedFactory::new(
            script.clone(),
        ))));
        let (queue, rx) = CommandQueue::new(sessions.clone(), retention, fast_config());
        (script, sessions, queue, rx)
    }

    fn token(id: &str, kind: TokenKind) -> Token {
        Token::new(id, kind, "N1", Endpoint::new("10.0.0.1", 23))
    }

    #[test]
    fn test_classify_response() {
        assert_eq!(classify_response("BLOCK OK").1, true);
        assert_eq!(classify_response("").1, true);
        assert_eq!(classify_response("   ").1, true);
        assert_eq!(classify_response("ERROR: fault").1, false);
        assert_eq!(classify_response("device error 7").1, false);
    }

    #[test]
    fn test_validate() {
        let ok = token("162", TokenKind::Fbc);
        assert!(CommandQueue::validate("read fbc 1620000", &ok));
        assert!(!CommandQueue::validate("   ", &ok));

        let empty = token("!!!", TokenKind::Rpc);
        assert!(!CommandQueue::validate("print rpc 0000", &empty));
    }

    #[tokio::test]
    async fn test_enqueue_processes_automatically() {
        let (script, _sessions, queue, mut rx) = setup(RetentionPolicy::PurgeOnComplete);

        let id = queue
            .enqueue("read fbc 1620000", token("162", TokenKind::Fbc), None)
            .await
            .unwrap();

        let done = rx.recv().await.unwrap();
        assert_eq!(done.task_id, id);
        assert!(done.success);
        assert_eq!(done.result, "OK");
        assert_eq!(script.sent_commands(), vec!["read fbc 1620000"]);

        // PurgeOnComplete drops the record
        assert_eq!(queue.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_task_rejected() {
        let (_script, _sessions, queue, _rx) = setup(RetentionPolicy::PurgeOnComplete);
        let err = queue
            .enqueue("print rpc 0000", token("!!!", TokenKind::Rpc), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTask(_)));
    }

    #[tokio::test]
    async fn test_tasks_run_in_order() {
        let (script, _sessions, queue, mut rx) = setup(RetentionPolicy::PurgeOnComplete);

        for id in ["007", "042", "162"] {
            queue
                .enqueue(
                    TokenKind::Fbc.command(id, crate::batch::CommandAction::Read),
                    token(id, TokenKind::Fbc),
                    None,
                )
                .await
                .unwrap();
        }

        for _ in 0..3 {
            assert!(rx.recv().await.unwrap().success);
        }
        assert_eq!(
            script.sent_commands(),
            vec!["read fbc 0070000", "read fbc 0420000", "read fbc 1620000"]
        );
    }

    #[tokio::test]
    async fn test_error_response_fails_task() {
        let (script, _sessions, queue, mut rx) = setup(RetentionPolicy::RetainUntilCleanup);
        script.respond("163", "ERROR: device fault");

        let id = queue
            .enqueue("read fbc 1630000", token("163", TokenKind::Fbc), None)
            .await
            .unwrap();

        let done = rx.recv().await.unwrap();
        assert!(!done.success);
        assert_eq!(done.result, "ERROR: device fault");
        assert_eq!(queue.task_status(id).await, Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn test_connect_failure_absorbed_after_retries() {
        let (script, _sessions, queue, mut rx) = setup(RetentionPolicy::PurgeOnComplete);
        script.refuse_connect_to("10.0.0.1");

        queue
            .enqueue("read fbc 1620000", token("162", TokenKind::Fbc), None)
            .await
            .unwrap();

        let done = rx.recv().await.unwrap();
        assert!(!done.success);
        assert!(done.result.starts_with("Command failed:"));
        assert!(done.result.contains("3 attempts"));
        // Nothing was ever sent
        assert!(script.sent_commands().is_empty());
    }

    #[tokio::test]
    async fn test_retention_until_cleanup() {
        let (_script, _sessions, queue, mut rx) = setup(RetentionPolicy::RetainUntilCleanup);

        let id = queue
            .enqueue("read fbc 1620000", token("162", TokenKind::Fbc), None)
            .await
            .unwrap();
        rx.recv().await.unwrap();

        // Terminal record stays inspectable until the explicit pass
        assert_eq!(queue.task_status(id).await, Some(TaskStatus::Completed));
        assert_eq!(queue.task_result(id).await.as_deref(), Some("OK"));
        assert_eq!(queue.cleanup_completed().await, 1);
        assert_eq!(queue.task_status(id).await, None);
    }

    #[tokio::test]
    async fn test_clear_pending_keeps_in_flight() {
        let (script, _sessions, queue, mut rx) = setup(RetentionPolicy::PurgeOnComplete);
        script.set_command_delay(Duration::from_millis(50));

        queue
            .enqueue("read fbc 0010000", token("1", TokenKind::Fbc), None)
            .await
            .unwrap();
        queue
            .enqueue("read fbc 0020000", token("2", TokenKind::Fbc), None)
            .await
            .unwrap();
        queue
            .enqueue("read fbc 0030000", token("3", TokenKind::Fbc), None)
            .await
            .unwrap();

        // Give the worker time to take the first task, then cancel the rest
        tokio::time::sleep(Duration::from_millis(20)).await;
        let cleared = queue.clear_pending().await;
        assert_eq!(cleared, 2);

        let done = rx.recv().await.unwrap();
        assert!(done.command.contains("001"));

        // No further completions
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_task_debug_elides_session() {
        let (_script, sessions, _queue, _rx) = setup(RetentionPolicy::PurgeOnComplete);

        let t = token("162", TokenKind::Fbc);
        let task = QueuedTask {
            id: 1,
            command: "read fbc 1620000".to_string(),
            token: t.clone(),
            status: TaskStatus::Pending,
            session: Some(sessions.acquire(&t).await),
            result: None,
        };

        let text = format!("{:?}", task);
        assert!(text.contains("read fbc 1620000"));
        assert!(text.contains("session: true"));
    }

    #[tokio::test]
    async fn test_prebound_session_reused_when_connected() {
        let (script, sessions, queue, mut rx) = setup(RetentionPolicy::PurgeOnComplete);

        let t = token("162", TokenKind::Fbc);
        let prebound = sessions.acquire(&t).await;
        prebound.lock().await.connect().await.unwrap();
        assert_eq!(script.created_count(), 1);

        queue
            .enqueue("read fbc 1620000", t, Some(prebound))
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().success);
        // No second session was created
        assert_eq!(script.created_count(), 1);
    }
}
