use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Errors from identifier generation and parsing.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    /// Not a 26-character Crockford base-32 string.
    #[error("malformed event id {0:?}")]
    Malformed(String),
    /// The entropy counter wrapped within a single millisecond.
    #[error("id entropy exhausted within one millisecond")]
    EntropyExhausted,
}

/// 128-bit time-sortable event identifier (ULID).
///
/// Encodes as 26 upper-case Crockford base-32 characters: 48 bits of
/// millisecond timestamp followed by 80 bits of entropy. Lexicographic
/// order of the encoded form equals issue order within one process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "String", try_from = "String")]
pub struct EventId(Ulid);

impl EventId {
    /// The nil identifier, used as the "from the beginning" replay cursor.
    pub const ZERO: EventId = EventId(Ulid(0));

    pub fn is_zero(&self) -> bool {
        self.0.is_nil()
    }

    /// Milliseconds since the Unix epoch baked into the identifier.
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ulid::ULID_LEN {
            return Err(IdError::Malformed(s.to_string()));
        }
        Ulid::from_string(s)
            .map(EventId)
            .map_err(|_| IdError::Malformed(s.to_string()))
    }
}

impl From<EventId> for String {
    fn from(id: EventId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for EventId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Monotonic generator state. One instance serves the whole process; the
/// lock is what guarantees a single total order across concurrent callers.
struct Generator {
    last: Option<Ulid>,
}

impl Generator {
    fn next(&mut self) -> Result<EventId, IdError> {
        let candidate = Ulid::new();
        let next = match self.last {
            // Same millisecond (or the clock stepped backwards): advance the
            // previous entropy instead of rolling fresh bits, so issue order
            // stays encoded in the id.
            Some(last) if candidate.timestamp_ms() <= last.timestamp_ms() => {
                last.increment().ok_or(IdError::EntropyExhausted)?
            }
            _ => candidate,
        };
        self.last = Some(next);
        Ok(EventId(next))
    }
}

static GENERATOR: Lazy<Mutex<Generator>> = Lazy::new(|| Mutex::new(Generator { last: None }));

/// Issue the next identifier in the process-wide total order.
pub fn next_id() -> Result<EventId, IdError> {
    GENERATOR.lock().next()
}
