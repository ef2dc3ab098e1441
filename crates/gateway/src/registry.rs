//! Registry of live client sessions.
//!
//! Pure bookkeeping over a lock-free `DashMap`: sessions add themselves when
//! they become active and remove themselves on termination, so churned
//! clients are never retained.

use crate::auth::Identity;
use chrono::Utc;
use dashmap::DashMap;
use metrics::gauge;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique session identifier.
pub type SessionId = Uuid;

/// Registry-side view of one session.
pub struct SessionHandle {
    /// Unique session identifier.
    pub id: SessionId,
    /// Verified identity of the client.
    pub identity: Identity,
    /// Timestamp when the session became active (ms).
    pub connected_at: i64,
    /// Size of the session's subscription set, published by the session.
    subscription_count: AtomicUsize,
    /// Asks the session task to terminate.
    shutdown_tx: mpsc::Sender<()>,
}

impl SessionHandle {
    pub fn new(id: SessionId, identity: Identity, shutdown_tx: mpsc::Sender<()>) -> Self {
        Self {
            id,
            identity,
            connected_at: Utc::now().timestamp_millis(),
            subscription_count: AtomicUsize::new(0),
            shutdown_tx,
        }
    }

    pub fn set_subscription_count(&self, count: usize) {
        self.subscription_count.store(count, Ordering::Relaxed);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscription_count.load(Ordering::Relaxed)
    }

    /// Ask the session to terminate. Returns false if it is already gone
    /// or a request is pending.
    pub fn request_shutdown(&self) -> bool {
        self.shutdown_tx.try_send(()).is_ok()
    }
}

/// Lock-free registry of live sessions.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
}

impl SessionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register a session.
    pub fn register(&self, handle: Arc<SessionHandle>) -> SessionId {
        let id = handle.id;
        self.sessions.insert(id, handle);
        gauge!("gateway_active_sessions").set(self.sessions.len() as f64);
        info!("Session {} registered", id);
        id
    }

    /// Remove a session. Unknown ids are ignored.
    pub fn unregister(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        let removed = self.sessions.remove(id).map(|(_, handle)| handle);
        if removed.is_some() {
            gauge!("gateway_active_sessions").set(self.sessions.len() as f64);
            info!("Session {} unregistered", id);
        }
        removed
    }

    /// Get a session by id.
    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|r| r.clone())
    }

    /// Visit every live session.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&SessionHandle),
    {
        for entry in self.sessions.iter() {
            f(entry.value());
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Total subscriptions across live sessions.
    pub fn subscription_count(&self) -> usize {
        self.sessions
            .iter()
            .map(|entry| entry.value().subscription_count())
            .sum()
    }

    /// Ask every live session to terminate. Returns how many were signalled.
    pub fn shutdown_all(&self) -> usize {
        let mut signalled = 0;
        self.for_each(|handle| {
            if handle.request_shutdown() {
                signalled += 1;
            } else {
                debug!("Session {} already shutting down", handle.id);
            }
        });
        signalled
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
