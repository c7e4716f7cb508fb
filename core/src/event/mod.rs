//! Immutable event records and their identifiers.

pub mod id;

pub use id::{next_id, EventId, IdError};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tag describing what an event represents.
///
/// Stored as lowercase text in the durable log; adding a tag never requires
/// a schema migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Say,
    Pose,
    Arrive,
    Leave,
    System,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown event type {0:?}")]
pub struct UnknownEventType(pub String);

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Say => "say",
            EventType::Pose => "pose",
            EventType::Arrive => "arrive",
            EventType::Leave => "leave",
            EventType::System => "system",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "say" => Ok(EventType::Say),
            "pose" => Ok(EventType::Pose),
            "arrive" => Ok(EventType::Arrive),
            "leave" => Ok(EventType::Leave),
            "system" => Ok(EventType::System),
            other => Err(UnknownEventType(other.to_string())),
        }
    }
}

/// Who performed an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    Character,
    System,
    Plugin,
}

impl ActorKind {
    /// Smallint code used in the event row.
    pub fn code(self) -> i16 {
        match self {
            ActorKind::Character => 0,
            ActorKind::System => 1,
            ActorKind::Plugin => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(ActorKind::Character),
            1 => Some(ActorKind::System),
            2 => Some(ActorKind::Plugin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub kind: ActorKind,
    pub id: String,
}

impl Actor {
    pub fn character(id: impl Into<String>) -> Self {
        Actor {
            kind: ActorKind::Character,
            id: id.into(),
        }
    }

    pub fn system(id: impl Into<String>) -> Self {
        Actor {
            kind: ActorKind::System,
            id: id.into(),
        }
    }

    pub fn plugin(id: impl Into<String>) -> Self {
        Actor {
            kind: ActorKind::Plugin,
            id: id.into(),
        }
    }
}

/// An immutable record of something that happened on a stream.
///
/// The payload is opaque bytes at this boundary; by convention it is a JSON
/// object whose shape is fixed by `event_type`. Typed decoders live with the
/// consumers, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub stream: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Event {
    /// Build an event with a freshly issued id and the current wall clock.
    pub fn new(
        stream: impl Into<String>,
        event_type: EventType,
        actor: Actor,
        payload: Vec<u8>,
    ) -> Result<Self, IdError> {
        Ok(Event {
            id: next_id()?,
            stream: stream.into(),
            event_type,
            timestamp: Utc::now(),
            actor,
            payload,
        })
    }
}

/// Stream shared by everyone present at a location.
pub fn location_stream(location_id: &str) -> String {
    format!("location:{}", location_id)
}

/// Stream private to a single character.
pub fn char_stream(character_id: &str) -> String {
    format!("char:{}", character_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_text_round_trip() {
        for event_type in [
            EventType::Say,
            EventType::Pose,
            EventType::Arrive,
            EventType::Leave,
            EventType::System,
        ] {
            assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), event_type);
        }
        assert!("shout".parse::<EventType>().is_err());
    }

    #[test]
    fn actor_kind_codes_round_trip() {
        for kind in [ActorKind::Character, ActorKind::System, ActorKind::Plugin] {
            assert_eq!(ActorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ActorKind::from_code(7), None);
    }

    #[test]
    fn stream_naming() {
        assert_eq!(location_stream("great-hall"), "location:great-hall");
        assert_eq!(char_stream("c42"), "char:c42");
    }

    #[test]
    fn new_event_stamps_id_and_time() {
        let before = Utc::now();
        let event = Event::new(
            location_stream("great-hall"),
            EventType::Say,
            Actor::character("c42"),
            b"{}".to_vec(),
        )
        .unwrap();
        assert!(!event.id.is_zero());
        assert!(event.timestamp >= before);
        assert_eq!(event.actor.kind, ActorKind::Character);
    }
}
