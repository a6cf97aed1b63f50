//! nodecmd: sequential command execution engine for networked industrial nodes
//!
//! Takes an ordered list of addressable tokens (remote sub-devices reachable
//! over a line-oriented TCP session) and drives them through a remote session
//! strictly one at a time: connection retries with backoff, a fail-fast
//! circuit breaker, per-token log isolation, and aggregate progress events.

pub mod batch;
pub mod breaker;
pub mod error;
pub mod logsink;
pub mod queue;
pub mod session;
pub mod token;

#[cfg(test)]
pub(crate) mod test_support;

pub use batch::{
    BatchConfig, BatchSummary, CommandAction, EngineEvent, SequentialBatchProcessor,
    StatusPriority, TokenOutcome, TokenRequest,
};
pub use breaker::{BreakerState, CircuitBreaker};
pub use error::EngineError;
pub use logsink::{FileLogSink, NullLogSink, TokenLogSink};
pub use queue::{CommandQueue, QueueConfig, RetentionPolicy, TaskCompletion, TaskStatus};
pub use session::{
    RemoteSession, SessionFactory, SessionManager, TelnetSession, TelnetSessionFactory,
};
pub use token::{Endpoint, Token, TokenCatalog, TokenKind, TokenRecord};

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Engine-wide default parameters
pub mod defaults {
    /// Connection verification attempts before a task is failed
    pub const CONNECT_ATTEMPTS: u32 = 3;

    /// Backoff between connection attempts, in milliseconds
    pub const CONNECT_BACKOFF_MS: u64 = 1000;

    /// Response timeout for a single command, in milliseconds
    pub const COMMAND_TIMEOUT_MS: u64 = 5000;

    /// Consecutive failures before the circuit breaker opens
    pub const FAILURE_THRESHOLD: u32 = 3;

    /// Cooldown before an open breaker admits a trial call, in seconds
    pub const BREAKER_COOLDOWN_SECS: u64 = 60;

    /// Wall-clock budget per token; the batch aborts once elapsed time
    /// exceeds this times the token count (milliseconds)
    pub const PER_TASK_TIMEOUT_MS: u64 = 30_000;

    /// Bulk mode runs a cleanup pause after this many completed tasks
    pub const BULK_CLEANUP_INTERVAL: usize = 10;

    /// Default remote port for token endpoints
    pub const DEFAULT_PORT: u16 = 23;

    /// Default session protocol
    pub const DEFAULT_PROTOCOL: &str = "telnet";

    /// Sentinel address substituted for malformed or missing endpoints
    pub const FALLBACK_ADDRESS: &str = "0.0.0.0";
}
