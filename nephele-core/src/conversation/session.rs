//! Conversation sessions and the session-keyed registry

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;

use super::turn::Turn;

/// Per-session short-term state.
///
/// Holds the turns currently inside the context window; the full record
/// lives in the conversation store.
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    pub(crate) turns: VecDeque<Turn>,
    pub(crate) used_tokens: usize,
    pub(crate) evicted_turns: usize,
    pub(crate) total_turns: usize,
    pub(crate) hydrated: bool,
    /// Latest long-term summary, loaded with the history
    pub(crate) summary: Option<String>,
    /// Last background persistence task, awaited before the next one starts
    pub(crate) persist_tail: Option<JoinHandle<()>>,
    /// Removed from the registry; queries must fetch a fresh handle
    pub(crate) evicted: bool,
}

impl Session {
    /// Create an empty session
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            turns: VecDeque::new(),
            used_tokens: 0,
            evicted_turns: 0,
            total_turns: 0,
            hydrated: false,
            summary: None,
            persist_tail: None,
            evicted: false,
        }
    }

    /// Get the session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Turns appended during this process lifetime, evicted ones included
    pub fn total_turns(&self) -> usize {
        self.total_turns
    }

    /// Whether persisted history has been loaded into the window
    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    /// Latest long-term summary known to this process
    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Generate a fresh random session id
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Shared handle to one session; holding the lock serializes that session's queries
pub type SessionHandle = Arc<Mutex<Session>>;

/// Session-keyed store of live sessions.
///
/// Sessions are created on first use and live until [`evict`](Self::evict)
/// is called by whatever expiry policy the host runs. Background writes an
/// evicted session left unfinished are handed to the next session created
/// under the same id, so its history and appends stay behind them.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: RwLock<Entries>,
}

#[derive(Debug, Default)]
struct Entries {
    live: HashMap<String, SessionHandle>,
    pending_writes: HashMap<String, JoinHandle<()>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the session for `session_id`, creating it if needed
    pub async fn session(&self, session_id: &str) -> SessionHandle {
        if let Some(handle) = self.entries.read().await.live.get(session_id) {
            return handle.clone();
        }

        let mut entries = self.entries.write().await;
        let Entries { live, pending_writes } = &mut *entries;
        live.entry(session_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(session_id, "creating session");
                let mut session = Session::new(session_id);
                session.persist_tail = pending_writes.remove(session_id);
                Arc::new(Mutex::new(session))
            })
            .clone()
    }

    /// Lock the live session for `session_id`, creating it if needed.
    ///
    /// A handle evicted while this call waited for it is skipped.
    pub async fn lock(&self, session_id: &str) -> OwnedMutexGuard<Session> {
        loop {
            let session = self.session(session_id).await.lock_owned().await;
            if !session.evicted {
                return session;
            }
        }
    }

    /// Get an existing session without creating one
    pub async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.entries.read().await.live.get(session_id).cloned()
    }

    /// Drop a session from the registry.
    ///
    /// Waits for a query already running on the session to finish. Its
    /// unfinished background write is kept for the session's successor.
    pub async fn evict(&self, session_id: &str) -> bool {
        let Some(handle) = self.get(session_id).await else {
            return false;
        };
        let mut session = handle.lock().await;
        let mut entries = self.entries.write().await;

        let current = entries
            .live
            .get(session_id)
            .is_some_and(|live| Arc::ptr_eq(live, &handle));
        if !current {
            return false;
        }

        entries.live.remove(session_id);
        session.evicted = true;
        if let Some(tail) = session.persist_tail.take() {
            if !tail.is_finished() {
                entries.pending_writes.insert(session_id.to_string(), tail);
            }
        }
        tracing::debug!(session_id, "evicted session");
        true
    }

    /// Take the unfinished background write of an evicted session
    pub(crate) async fn take_pending_write(&self, session_id: &str) -> Option<JoinHandle<()>> {
        self.entries.write().await.pending_writes.remove(session_id)
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        self.entries.read().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.live.is_empty()
    }

    /// IDs of live sessions
    pub async fn session_ids(&self) -> Vec<String> {
        self.entries.read().await.live.keys().cloned().collect()
    }
}
