//! Per-character presence and reconnect cursors.
//!
//! A session outlives its connections: characters drop to zero connections
//! on a flaky link and pick their cursors back up on reconnect. Only
//! [`SessionManager::end_session`] destroys a session.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::event::EventId;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no session for character {0:?}")]
    NotFound(String),
}

/// Presence of one character across zero or more live connections.
#[derive(Debug, Clone)]
pub struct Session {
    pub character_id: String,
    pub connections: Vec<String>,
    /// Last event delivered to this character, per stream.
    pub event_cursors: HashMap<String, EventId>,
    pub last_activity: DateTime<Utc>,
}

/// Process-local session registry.
///
/// Every accessor returns a defensive copy; nothing handed out aliases the
/// internal maps, so callers can mutate their copies freely.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection, creating the session on first contact. Adding a
    /// connection id the session already holds is a no-op.
    pub fn connect(&self, character_id: &str, connection_id: &str) -> Session {
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(character_id.to_string())
            .or_insert_with(|| Session {
                character_id: character_id.to_string(),
                connections: Vec::new(),
                event_cursors: HashMap::new(),
                last_activity: Utc::now(),
            });
        if !session.connections.iter().any(|c| c == connection_id) {
            session.connections.push(connection_id.to_string());
        }
        session.last_activity = Utc::now();
        session.clone()
    }

    /// Detach one connection. Unknown characters and unknown connections are
    /// silent no-ops; the session itself survives at zero connections.
    pub fn disconnect(&self, character_id: &str, connection_id: &str) {
        if let Some(session) = self.sessions.write().get_mut(character_id) {
            if let Some(pos) = session
                .connections
                .iter()
                .position(|c| c == connection_id)
            {
                session.connections.remove(pos);
            }
        }
    }

    /// Record the last event delivered to `character_id` on `stream`.
    /// Last-writer-wins; no-op without a session.
    pub fn update_cursor(&self, character_id: &str, stream: &str, event_id: EventId) {
        if let Some(session) = self.sessions.write().get_mut(character_id) {
            session
                .event_cursors
                .insert(stream.to_string(), event_id);
        }
    }

    /// Refresh `last_activity`. No-op without a session.
    pub fn update_activity(&self, character_id: &str) {
        if let Some(session) = self.sessions.write().get_mut(character_id) {
            session.last_activity = Utc::now();
        }
    }

    pub fn get_session(&self, character_id: &str) -> Option<Session> {
        self.sessions.read().get(character_id).cloned()
    }

    pub fn get_connections(&self, character_id: &str) -> Option<Vec<String>> {
        self.sessions
            .read()
            .get(character_id)
            .map(|session| session.connections.clone())
    }

    /// Copies of every live session, in no particular order.
    pub fn list_active_sessions(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    /// Destroy the session along with its connections and cursors.
    pub fn end_session(&self, character_id: &str) -> Result<(), SessionError> {
        self.sessions
            .write()
            .remove(character_id)
            .map(|_| ())
            .ok_or_else(|| SessionError::NotFound(character_id.to_string()))
    }
}
