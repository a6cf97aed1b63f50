//! Session registry keyed by (node, token kind)

use crate::session::RemoteSession;
use crate::token::Token;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// A session shared between the registry and the task that holds it.
///
/// Exclusivity is enforced by the single-worker queue, not by this mutex; the
/// mutex only guards the connect/send/close critical sections.
pub type SharedSession = Arc<Mutex<Box<dyn RemoteSession>>>;

/// Creates sessions for tokens. The seam the tests script against.
pub trait SessionFactory: Send + Sync {
    fn create(&self, token: &Token) -> Box<dyn RemoteSession>;
}

/// Tracks one shared session per "<node>_<kind>" key
pub struct SessionManager {
    factory: Box<dyn SessionFactory>,
    sessions: RwLock<HashMap<String, SharedSession>>,
    released: AtomicU64,
}

impl SessionManager {
    pub fn new(factory: Box<dyn SessionFactory>) -> Self {
        Self {
            factory,
            sessions: RwLock::new(HashMap::new()),
            released: AtomicU64::new(0),
        }
    }

    /// Get the cached session for the token's key, creating one on first use
    pub async fn acquire(&self, token: &Token) -> SharedSession {
        let key = token.session_key();

        if let Some(session) = self.sessions.read().await.get(&key) {
            return session.clone();
        }

        let mut sessions = self.sessions.write().await;
        // Double-check under the write lock
        if let Some(session) = sessions.get(&key) {
            return session.clone();
        }

        debug!("Creating session {} for {}", key, token.endpoint.address());
        let session: SharedSession = Arc::new(Mutex::new(self.factory.create(token)));
        sessions.insert(key, session.clone());
        session
    }

    /// Release a task's hold on its session. Called exactly once per
    /// dispatched task; sessions that are no longer connected are dropped
    /// from the registry so the next task reconnects fresh.
    pub async fn release(&self, key: &str) {
        self.released.fetch_add(1, Ordering::SeqCst);

        let dead = match self.sessions.read().await.get(key) {
            Some(session) => !session.lock().await.is_connected(),
            None => false,
        };

        if dead {
            debug!("Dropping disconnected session {}", key);
            self.sessions.write().await.remove(key);
        }
    }

    /// Close and drop every cached session
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (key, session) in sessions.drain() {
            session.lock().await.close().await;
            debug!("Closed session {}", key);
        }
    }

    /// Number of cached sessions
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// How many times release() has run, one per dispatched task
    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }
}
