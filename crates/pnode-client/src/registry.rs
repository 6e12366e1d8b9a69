//! Registry of live session channels

use pnode_proto::SessionId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// A session channel that is currently open
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Gateway-issued id this channel was opened for
    pub session_id: SessionId,
    /// Gateway host the channel is connected to
    pub host: String,
    /// Whether the channel answers with the diagnostic page
    pub test_mode: bool,
    pub established_at: Instant,
}

/// Tracks session channels for their lifetime
///
/// Entries are keyed by a local handle rather than the session id, since the
/// gateway gives no guarantee that ids are never reused.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<u64, SessionInfo>>>,
    next_handle: Arc<AtomicU64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and return its handle
    pub async fn register(&self, info: SessionInfo) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            handle,
            session_id = %info.session_id,
            host = %info.host,
            "Registering session"
        );

        let mut sessions = self.sessions.write().await;
        sessions.insert(handle, info);

        tracing::debug!(active_sessions = sessions.len(), "Session registered");
        handle
    }

    pub async fn unregister(&self, handle: u64) {
        let mut sessions = self.sessions.write().await;

        match sessions.remove(&handle) {
            Some(info) => {
                tracing::info!(
                    session_id = %info.session_id,
                    host = %info.host,
                    duration_ms = info.established_at.elapsed().as_millis() as u64,
                    active_sessions = sessions.len(),
                    "Session closed"
                );
            }
            None => {
                tracing::warn!(handle, "Attempted to unregister unknown session");
            }
        }
    }

    pub async fn get(&self, handle: u64) -> Option<SessionInfo> {
        self.sessions.read().await.get(&handle).cloned()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().cloned().collect()
    }
}
