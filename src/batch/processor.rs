//! The sequential batch processor

use super::{
    BatchConfig, BatchSummary, CommandAction, EngineEvent, StatusPriority, TokenOutcome,
    TokenRequest,
};
use crate::breaker::CircuitBreaker;
use crate::error::EngineError;
use crate::logsink::TokenLogSink;
use crate::now_ms;
use crate::queue::{CommandQueue, RetentionPolicy, TaskCompletion};
use crate::session::SessionManager;
use crate::token::TokenCatalog;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Correlation id for one batch: random 8-char token
fn batch_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// State of one batch invocation. Created at batch start, discarded at
/// completion. current_index only increases and equals completed_count at
/// every observation point between tasks.
struct BatchContext {
    batch_id: String,
    node_name: String,
    requests: Vec<TokenRequest>,
    current_index: usize,
    completed_count: usize,
    success_count: usize,
    failures: Vec<String>,
    started: Instant,
    stopped: bool,
}

impl BatchContext {
    fn new(node: &str, requests: Vec<TokenRequest>) -> Self {
        Self {
            batch_id: batch_id(),
            node_name: node.to_string(),
            requests,
            current_index: 0,
            completed_count: 0,
            success_count: 0,
            failures: Vec::new(),
            started: Instant::now(),
            stopped: false,
        }
    }

    fn total(&self) -> usize {
        self.requests.len()
    }
}

/// Drives an ordered token list through the command queue one token at a
/// time. At most one batch runs per processor instance; the next token is
/// never prepared before the previous token's completion has been handled.
pub struct SequentialBatchProcessor {
    queue: CommandQueue,
    completion_rx: Mutex<mpsc::UnboundedReceiver<TaskCompletion>>,
    sessions: Arc<SessionManager>,
    sink: Arc<dyn TokenLogSink>,
    breaker: Arc<CircuitBreaker>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    is_processing: AtomicBool,
    stop_requested: AtomicBool,
    config: BatchConfig,
}

impl SequentialBatchProcessor {
    /// Create a processor and the event receiver its caller consumes.
    ///
    /// The queue is built with RetainUntilCleanup: completed tasks remain
    /// inspectable until the batch's explicit cleanup pass at finalization.
    pub fn new(
        sessions: Arc<SessionManager>,
        sink: Arc<dyn TokenLogSink>,
        breaker: Arc<CircuitBreaker>,
        config: BatchConfig,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (queue, completion_rx) = CommandQueue::new(
            sessions.clone(),
            RetentionPolicy::RetainUntilCleanup,
            config.queue.clone(),
        );
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                queue,
                completion_rx: Mutex::new(completion_rx),
                sessions,
                sink,
                breaker,
                event_tx,
                is_processing: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                config,
            },
            event_rx,
        )
    }

    /// Process an ordered token list against a node. Progress is signaled
    /// through the event channel; the summary is also returned.
    pub async fn process_tokens(
        &self,
        catalog: &TokenCatalog,
        node: &str,
        requests: Vec<TokenRequest>,
        action: CommandAction,
    ) -> Result<BatchSummary, EngineError> {
        self.run(catalog, node, requests, action, false)
            .await
            .map(|(summary, _)| summary)
    }

    /// Convenience entry point: read every listed Fbc token
    pub async fn process_fbc(
        &self,
        catalog: &TokenCatalog,
        node: &str,
        ids: Vec<String>,
    ) -> Result<BatchSummary, EngineError> {
        let requests = ids.into_iter().map(TokenRequest::fbc).collect();
        self.process_tokens(catalog, node, requests, CommandAction::Read)
            .await
    }

    /// Convenience entry point: print or clear every listed Rpc token
    pub async fn process_rpc(
        &self,
        catalog: &TokenCatalog,
        node: &str,
        ids: Vec<String>,
        action: CommandAction,
    ) -> Result<BatchSummary, EngineError> {
        let requests = ids.into_iter().map(TokenRequest::rpc).collect();
        self.process_tokens(catalog, node, requests, action).await
    }

    /// Bulk variant: same sequential loop, but returns the full per-token
    /// outcome set as a single value. Every `bulk_cleanup_interval` completed
    /// tasks it runs a cleanup pass and yields briefly.
    pub async fn process_batch_collect(
        &self,
        catalog: &TokenCatalog,
        node: &str,
        requests: Vec<TokenRequest>,
        action: CommandAction,
    ) -> Result<Vec<TokenOutcome>, EngineError> {
        self.run(catalog, node, requests, action, true)
            .await
            .map(|(_, outcomes)| outcomes)
    }

    /// Cooperative cancellation: clears the pending queue and lets the batch
    /// finalize in the stopped state. The command already in flight is not
    /// forcibly aborted.
    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let cleared = self.queue.clear_pending().await;
        if cleared > 0 {
            debug!("Stop cleared {} pending tasks", cleared);
        }
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::SeqCst)
    }

    async fn run(
        &self,
        catalog: &TokenCatalog,
        node: &str,
        requests: Vec<TokenRequest>,
        action: CommandAction,
        bulk: bool,
    ) -> Result<(BatchSummary, Vec<TokenOutcome>), EngineError> {
        // At most one batch per processor instance; rejection mutates nothing
        if self
            .is_processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.emit_status("Batch rejected: already processing", StatusPriority::Error);
            return Err(EngineError::AlreadyProcessing);
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        let mut ctx = BatchContext::new(node, requests);
        let total = ctx.total();
        info!(
            "Batch {} started on {} ({} tokens)",
            ctx.batch_id, ctx.node_name, total
        );
        self.sink.batch_started(&ctx.batch_id, node, total).await;

        let budget = self.config.per_task_timeout * total as u32;
        let mut outcomes = Vec::new();

        while ctx.current_index < total {
            if self.stop_requested.load(Ordering::SeqCst) {
                ctx.stopped = true;
                self.queue.clear_pending().await;
                self.emit_status(
                    format!(
                        "Batch {} stopped after {}/{} tokens",
                        ctx.batch_id, ctx.completed_count, total
                    ),
                    StatusPriority::Warning,
                );
                break;
            }
            if !self.breaker.allow() {
                self.emit_status(
                    format!(
                        "Circuit breaker open after {} consecutive failures, aborting remaining tokens",
                        self.breaker.failure_count()
                    ),
                    StatusPriority::Error,
                );
                break;
            }
            if ctx.started.elapsed() > budget {
                self.emit_status(
                    format!(
                        "Batch {} exceeded time budget, aborting remaining tokens",
                        ctx.batch_id
                    ),
                    StatusPriority::Error,
                );
                break;
            }

            let request = ctx.requests[ctx.current_index].clone();
            match self.dispatch(catalog, &ctx, &request, action).await {
                Ok((task_id, session_key)) => match self.await_completion(task_id).await {
                    Some(done) => {
                        ctx.completed_count += 1;
                        if done.success {
                            ctx.success_count += 1;
                            self.breaker.record_success();
                        } else {
                            ctx.failures.push(format!(
                                "{} {}: {}",
                                done.token.kind, done.token.token_id, done.result
                            ));
                            self.breaker.record_failure();
                        }
                        self.sink.log(&format!("result: {}", done.result)).await;
                        self.sink
                            .log(&format!(
                                "status: {}",
                                if done.success { "success" } else { "failed" }
                            ))
                            .await;
                        // Exactly one release per dispatched token
                        self.sessions.release(&session_key).await;

                        if bulk {
                            outcomes.push(TokenOutcome {
                                token_id: done.token.token_id.clone(),
                                kind: done.token.kind,
                                command: done.command.clone(),
                                result: done.result.clone(),
                                success: done.success,
                            });
                        }
                        self.emit(EngineEvent::Progress {
                            completed: ctx.completed_count,
                            total,
                        });
                    }
                    None => {
                        ctx.failures.push(EngineError::QueueClosed.to_string());
                        self.emit_status(
                            "Command queue closed, aborting batch",
                            StatusPriority::Error,
                        );
                        break;
                    }
                },
                Err(e) => {
                    // A preparation failure for one token never aborts the batch
                    warn!(
                        "Preparation failed for {} {} on {}: {}",
                        request.kind, request.id, ctx.node_name, e
                    );
                    ctx.completed_count += 1;
                    ctx.failures.push(format!(
                        "{} {}: preparation failed: {}",
                        request.kind, request.id, e
                    ));
                    // The breaker admitted this token; an outstanding
                    // half-open trial must settle even when nothing dispatched
                    self.breaker.record_failure();
                    if bulk {
                        outcomes.push(TokenOutcome {
                            token_id: request.kind.normalize_id(&request.id),
                            kind: request.kind,
                            command: String::new(),
                            result: format!("preparation failed: {}", e),
                            success: false,
                        });
                    }
                    self.emit(EngineEvent::Progress {
                        completed: ctx.completed_count,
                        total,
                    });
                }
            }
            ctx.current_index += 1;

            // Periodic cleanup pause in bulk mode
            if bulk
                && ctx.completed_count > 0
                && ctx.completed_count % self.config.bulk_cleanup_interval == 0
            {
                self.queue.cleanup_completed().await;
                sleep(self.config.bulk_cleanup_pause).await;
            }
        }

        let summary = self.finalize(ctx).await;
        Ok((summary, outcomes))
    }

    /// Prepare one token and hand it to the queue: catalog resolution,
    /// isolated log stream with its header block, command build, enqueue.
    async fn dispatch(
        &self,
        catalog: &TokenCatalog,
        ctx: &BatchContext,
        request: &TokenRequest,
        action: CommandAction,
    ) -> Result<(u64, String), EngineError> {
        let mut token = catalog.resolve(&ctx.node_name, &request.id, request.kind);
        if let Some(path) = self.sink.open_token_log(&token, &ctx.batch_id).await {
            token.log_path = Some(path);
        }

        self.sink.log(&format!("token: {}", token.token_id)).await;
        self.sink.log(&format!("node: {}", token.owning_node)).await;
        self.sink.log(&format!("timestamp: {}", now_ms())).await;
        self.sink.log(&format!("kind: {}", token.kind)).await;
        self.sink.log(&format!("batch: {}", ctx.batch_id)).await;

        let command = token.kind.command(&token.token_id, action);
        self.sink.log(&format!("command: {}", command)).await;

        let session_key = token.session_key();
        let task_id = self.queue.enqueue(command, token, None).await?;
        debug!(
            "Dispatched task {} ({} {} on {})",
            task_id, request.kind, request.id, ctx.node_name
        );
        Ok((task_id, session_key))
    }

    /// Await the completion of the given task, draining anything stale
    /// (e.g. the tail of a stopped batch).
    async fn await_completion(&self, task_id: u64) -> Option<TaskCompletion> {
        let mut rx = self.completion_rx.lock().await;
        while let Some(done) = rx.recv().await {
            if done.task_id == task_id {
                return Some(done);
            }
            debug!("Draining stale completion for task {}", done.task_id);
        }
        None
    }

    async fn finalize(&self, ctx: BatchContext) -> BatchSummary {
        let purged = self.queue.cleanup_completed().await;
        debug!("Batch {} cleanup purged {} task records", ctx.batch_id, purged);

        self.sink
            .batch_finished(&ctx.batch_id, &ctx.node_name, ctx.success_count, ctx.total())
            .await;

        let total = ctx.total();
        let summary = BatchSummary {
            batch_id: ctx.batch_id,
            node: ctx.node_name,
            total,
            completed: ctx.completed_count,
            success: ctx.success_count,
            failures: ctx.failures,
            stopped: ctx.stopped,
        };

        let priority = if summary.stopped || !summary.failures.is_empty() {
            StatusPriority::Warning
        } else {
            StatusPriority::Info
        };
        self.emit_status(
            format!(
                "Batch {} on {} finished: {}/{} succeeded{}",
                summary.batch_id,
                summary.node,
                summary.success,
                summary.total,
                if summary.stopped { " (stopped)" } else { "" }
            ),
            priority,
        );
        self.emit(EngineEvent::BatchFinished {
            success: summary.success,
            total: summary.total,
        });

        info!(
            "Batch {} finished: completed={} success={} total={} stopped={}",
            summary.batch_id, summary.completed, summary.success, summary.total, summary.stopped
        );
        self.is_processing.store(false, Ordering::SeqCst);
        summary
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_status(&self, text: impl Into<String>, priority: StatusPriority) {
        self.emit(EngineEvent::Status {
            text: text.into(),
            priority,
        });
    }
}
