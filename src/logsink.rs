//! Per-token log sink
//!
//! Each token's interaction is logged to an isolated stream scoped by batch
//! id. The engine only drives the contract; sink I/O failures are logged and
//! swallowed so logging can never fail a batch.

use crate::token::Token;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[async_trait]
pub trait TokenLogSink: Send + Sync {
    /// A batch is starting
    async fn batch_started(&self, batch_id: &str, node: &str, token_count: usize);

    /// Open the isolated log stream for one token; subsequent `log` calls
    /// land there. Returns the resolved path when the sink persists to disk.
    async fn open_token_log(&self, token: &Token, batch_id: &str) -> Option<PathBuf>;

    /// Write one line to the currently open token stream
    async fn log(&self, line: &str);

    /// The batch finished with the given counts
    async fn batch_finished(&self, batch_id: &str, node: &str, success: usize, total: usize);
}

/// Sink for callers that do not persist per-token logs
pub struct NullLogSink;

#[async_trait]
impl TokenLogSink for NullLogSink {
    async fn batch_started(&self, _batch_id: &str, _node: &str, _token_count: usize) {}

    async fn open_token_log(&self, _token: &Token, _batch_id: &str) -> Option<PathBuf> {
        None
    }

    async fn log(&self, _line: &str) {}

    async fn batch_finished(&self, _batch_id: &str, _node: &str, _success: usize, _total: usize) {}
}

/// File-backed sink: one directory per batch, one file per token
pub struct FileLogSink {
    root: PathBuf,
    current: Mutex<Option<fs::File>>,
}

impl FileLogSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            current: Mutex::new(None),
        }
    }

    fn batch_dir(&self, batch_id: &str) -> PathBuf {
        self.root.join(batch_id)
    }
}

#[async_trait]
impl TokenLogSink for FileLogSink {
    async fn batch_started(&self, batch_id: &str, node: &str, token_count: usize) {
        let dir = self.batch_dir(batch_id);
        if let Err(e) = fs::create_dir_all(&dir).await {
            warn!("Failed to create batch log dir {}: {}", dir.display(), e);
            return;
        }
        tracing::info!(
            "Batch {} started on {} ({} tokens), logs under {}",
            batch_id,
            node,
            token_count,
            dir.display()
        );
    }

    async fn open_token_log(&self, token: &Token, batch_id: &str) -> Option<PathBuf> {
        let path = self
            .batch_dir(batch_id)
            .join(format!("{}_{}.log", token.token_id, token.kind));

        match fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => {
                *self.current.lock().await = Some(file);
                Some(path)
            }
            Err(e) => {
                warn!("Failed to open token log {}: {}", path.display(), e);
                *self.current.lock().await = None;
                None
            }
        }
    }

    async fn log(&self, line: &str) {
        let mut current = self.current.lock().await;
        if let Some(file) = current.as_mut() {
            if let Err(e) = file.write_all(format!("{}\n", line).as_bytes()).await {
                warn!("Failed to write token log line: {}", e);
                *current = None;
            }
        }
    }

    async fn batch_finished(&self, batch_id: &str, node: &str, success: usize, total: usize) {
        // Drop the last open stream; flush happens on drop
        *self.current.lock().await = None;
        tracing::info!(
            "Batch {} finished on {}: {}/{} succeeded",
            batch_id,
            node,
            success,
            total
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Endpoint, TokenKind};

    #[tokio::test]
    async fn test_file_sink_writes_isolated_streams() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileLogSink::new(dir.path());

        sink.batch_started("b1", "N1", 2).await;

        let a = Token::new("162", TokenKind::Fbc, "N1", Endpoint::default());
        let path_a = sink.open_token_log(&a, "b1").await.unwrap();
        sink.log("first token").await;

        let b = Token::new("abc", TokenKind::Rpc, "N1", Endpoint::default());
        let path_b = sink.open_token_log(&b, "b1").await.unwrap();
        sink.log("second token").await;

        sink.batch_finished("b1", "N1", 2, 2).await;

        assert_ne!(path_a, path_b);
        let a_text = std::fs::read_to_string(&path_a).unwrap();
        let b_text = std::fs::read_to_string(&path_b).unwrap();
        assert_eq!(a_text, "first token\n");
        assert_eq!(b_text, "second token\n");
    }

    #[tokio::test]
    async fn test_null_sink_is_silent() {
        let sink = NullLogSink;
        let token = Token::new("1", TokenKind::Fbc, "N1", Endpoint::default());
        sink.batch_started("b1", "N1", 1).await;
        assert!(sink.open_token_log(&token, "b1").await.is_none());
        sink.log("nothing").await;
        sink.batch_finished("b1", "N1", 1, 1).await;
    }
}
