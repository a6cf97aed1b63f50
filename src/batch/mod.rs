//! Sequential batch orchestration
//!
//! The batch processor drives an ordered token list through the command
//! queue one token at a time, consulting the circuit breaker, isolating
//! failures, delegating per-token logging, and reporting aggregate progress
//! through an event channel.

mod processor;

pub use processor::SequentialBatchProcessor;

use crate::defaults;
use crate::queue::QueueConfig;
use crate::token::TokenKind;
use std::time::Duration;

/// What to do with each token. Fbc tokens only support the read exchange;
/// the explicit print/clear choice applies to Rpc tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandAction {
    #[default]
    Read,
    Print,
    Clear,
}

/// One requested token: raw id plus kind, resolved against the catalog at
/// dispatch time
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub id: String,
    pub kind: TokenKind,
}

impl TokenRequest {
    pub fn new(id: impl Into<String>, kind: TokenKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    pub fn fbc(id: impl Into<String>) -> Self {
        Self::new(id, TokenKind::Fbc)
    }

    pub fn rpc(id: impl Into<String>) -> Self {
        Self::new(id, TokenKind::Rpc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPriority {
    Info,
    Warning,
    Error,
}

/// Events the engine exposes to its caller
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Human-readable status line
    Status {
        text: String,
        priority: StatusPriority,
    },
    /// A token reached a terminal state
    Progress { completed: usize, total: usize },
    /// Terminal summary of the batch
    BatchFinished { success: usize, total: usize },
}

/// Batch processor parameters
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Wall-clock budget per token; the batch aborts early once elapsed time
    /// exceeds this times the token count
    pub per_task_timeout: Duration,
    /// Bulk mode runs a cleanup pause after this many completed tasks
    pub bulk_cleanup_interval: usize,
    /// Length of the bulk cleanup pause
    pub bulk_cleanup_pause: Duration,
    /// Parameters for the underlying command queue
    pub queue: QueueConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            per_task_timeout: Duration::from_millis(defaults::PER_TASK_TIMEOUT_MS),
            bulk_cleanup_interval: defaults::BULK_CLEANUP_INTERVAL,
            bulk_cleanup_pause: Duration::from_millis(100),
            queue: QueueConfig::default(),
        }
    }
}

/// Terminal result of one batch
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub batch_id: String,
    pub node: String,
    /// Tokens requested
    pub total: usize,
    /// Tokens that reached a terminal state (dispatched or skipped)
    pub completed: usize,
    pub success: usize,
    pub failures: Vec<String>,
    /// True when the batch ended via stop() rather than exhaustion
    pub stopped: bool,
}

impl BatchSummary {
    pub fn all_succeeded(&self) -> bool {
        !self.stopped && self.success == self.total
    }
}

/// Per-token outcome record returned by the bulk variant
#[derive(Debug, Clone)]
pub struct TokenOutcome {
    pub token_id: String,
    pub kind: TokenKind,
    pub command: String,
    pub result: String,
    pub success: bool,
}
