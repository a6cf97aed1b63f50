//! Engine error taxonomy
//!
//! Per-task failures (connection, protocol) are absorbed into the task result
//! by the queue worker and never cross the engine boundary; these variants
//! cover the places where a Result is the right shape: preparation, session
//! plumbing, and caller misuse.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A batch is already running on this processor instance
    #[error("batch already in progress")]
    AlreadyProcessing,

    /// Task rejected before enqueue (empty id or command)
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// No session could be resolved for a token
    #[error("session unavailable: {0}")]
    SessionUnavailable(String),

    /// Connection verification gave up
    #[error("connect to {addr} failed after {attempts} attempts: {reason}")]
    ConnectFailed {
        addr: String,
        attempts: u32,
        reason: String,
    },

    /// No response within the command timeout
    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// Remote endpoint closed the connection mid-exchange
    #[error("connection closed by remote endpoint")]
    ConnectionClosed,

    /// Token carries a protocol this engine does not speak
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// The queue worker is gone
    #[error("command queue closed")]
    QueueClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
