//! Facade turning parsed commands into durable, observable events.
//!
//! The engine is pure composition: it owns no state, holds shared handles to
//! the store, the broadcaster, and the session manager, and sequences
//! persist-then-broadcast so that by the time anyone sees an event it is
//! already durable.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broadcast::Broadcaster;
use crate::event::{location_stream, Actor, Event, EventId, EventType, IdError};
use crate::session::SessionManager;
use crate::store::{EventStore, StoreError};

/// Conventional payload for `say` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SayPayload {
    pub message: String,
}

/// Conventional payload for `pose` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosePayload {
    pub action: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("issue event id: {0}")]
    Id(#[from] IdError),
    #[error("encode event payload: {0}")]
    EncodePayload(#[from] serde_json::Error),
    #[error("append {event_type} event to {stream:?}: {source}")]
    Append {
        event_type: EventType,
        stream: String,
        #[source]
        source: StoreError,
    },
    #[error("replay {stream:?}: {source}")]
    Replay {
        stream: String,
        #[source]
        source: StoreError,
    },
}

/// Glue between command parsing and the event substrate.
pub struct Engine {
    store: Arc<dyn EventStore>,
    broadcaster: Option<Arc<Broadcaster>>,
    sessions: Arc<SessionManager>,
}

impl Engine {
    /// A `None` broadcaster disables in-process delivery; appends still
    /// reach the durable log and its notification channel.
    pub fn new(
        store: Arc<dyn EventStore>,
        broadcaster: Option<Arc<Broadcaster>>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            store,
            broadcaster,
            sessions,
        }
    }

    /// Speak in a location: everyone on `location:<id>` observes the line.
    pub async fn handle_say(
        &self,
        character_id: &str,
        location_id: &str,
        message: &str,
    ) -> Result<Event, EngineError> {
        let payload = serde_json::to_vec(&SayPayload {
            message: message.to_string(),
        })?;
        self.emit(EventType::Say, character_id, location_id, payload)
            .await
    }

    /// Emote in a location, e.g. "waves" rendered as "<name> waves".
    pub async fn handle_pose(
        &self,
        character_id: &str,
        location_id: &str,
        action: &str,
    ) -> Result<Event, EngineError> {
        let payload = serde_json::to_vec(&PosePayload {
            action: action.to_string(),
        })?;
        self.emit(EventType::Pose, character_id, location_id, payload)
            .await
    }

    /// Events the character has not yet seen on `stream`, oldest first.
    /// Without a session (or a cursor for this stream) the replay starts
    /// from the beginning.
    pub async fn replay_events(
        &self,
        character_id: &str,
        stream: &str,
        limit: i64,
    ) -> Result<Vec<Event>, EngineError> {
        let after = self
            .sessions
            .get_session(character_id)
            .and_then(|session| session.event_cursors.get(stream).copied())
            .unwrap_or(EventId::ZERO);
        self.store
            .replay(stream, after, limit)
            .await
            .map_err(|source| EngineError::Replay {
                stream: stream.to_string(),
                source,
            })
    }

    async fn emit(
        &self,
        event_type: EventType,
        character_id: &str,
        location_id: &str,
        payload: Vec<u8>,
    ) -> Result<Event, EngineError> {
        let event = Event::new(
            location_stream(location_id),
            event_type,
            Actor::character(character_id),
            payload,
        )?;

        self.store
            .append(&event)
            .await
            .map_err(|source| EngineError::Append {
                event_type,
                stream: event.stream.clone(),
                source,
            })?;

        debug!(
            stream = %event.stream,
            event_id = %event.id,
            event_type = %event.event_type,
            "event appended"
        );

        // In-process delivery; remote processes pick the event up from the
        // store's notification channel. Broadcast cannot fail the command.
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.broadcast(&event);
        }
        Ok(event)
    }
}
