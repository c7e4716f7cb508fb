//! Durable, ordered event storage.
//!
//! The store is a capability with two implementations: [`postgres::PgEventStore`]
//! over the relational log (with a LISTEN/NOTIFY push side-channel) and
//! [`memory::MemoryEventStore`] for tests. Consumers treat pushed ids as a
//! hint only and reconcile through [`EventStore::replay`] with their cursor.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::{Event, EventId};

/// Failures surfaced by an event store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend hiccuped; the caller may retry the same call.
    #[error("transient backend error: {0}")]
    Transient(#[source] sqlx::Error),
    /// The backend rejected the operation for good.
    #[error("permanent backend error: {0}")]
    Permanent(#[source] sqlx::Error),
    /// The event (or a stored row) violates the event contract. Never
    /// retryable.
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    /// `last_event_id` on a stream with no events. A sentinel, not a bug.
    #[error("stream {stream:?} has no events")]
    StreamEmpty { stream: String },
}

impl StoreError {
    /// True when the caller may retry the same call.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Sort a driver error into the retryable / non-retryable buckets.
    /// Connection trouble (class 08), resource exhaustion (53) and operator
    /// intervention / shutdown (57) are worth retrying; everything else is
    /// a bug in the statement or the data.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => db
                .code()
                .map(|code| {
                    code.starts_with("08") || code.starts_with("53") || code.starts_with("57")
                })
                .unwrap_or(false),
            _ => false,
        };
        if transient {
            StoreError::Transient(err)
        } else {
            StoreError::Permanent(err)
        }
    }
}

/// Live push feed of event ids for one stream.
///
/// `ids` yields ids as the backend announces them and closes when the
/// subscription ends. A value on `errors` means the subscription is dead;
/// the consumer catches up through `replay` and resubscribes.
pub struct EventSubscription {
    pub ids: mpsc::Receiver<EventId>,
    pub errors: mpsc::Receiver<StoreError>,
}

/// Capability set shared by the durable and in-memory stores.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist `event` and announce it on the stream's notification channel.
    /// The announcement is best-effort: once the row is durable, a failed
    /// notify is logged and swallowed.
    async fn append(&self, event: &Event) -> Result<(), StoreError>;

    /// Events with id strictly greater than `after`, ascending, at most
    /// `limit`. `EventId::ZERO` means from the beginning; so does an `after`
    /// that is no longer present on the stream (tolerates pruning).
    async fn replay(
        &self,
        stream: &str,
        after: EventId,
        limit: i64,
    ) -> Result<Vec<Event>, StoreError>;

    /// Greatest id on the stream, or [`StoreError::StreamEmpty`].
    async fn last_event_id(&self, stream: &str) -> Result<EventId, StoreError>;

    /// Open a push subscription on `stream`. The feed stops when `cancel`
    /// fires; the id channel closes first, then the error channel.
    async fn subscribe(
        &self,
        stream: &str,
        cancel: CancellationToken,
    ) -> Result<EventSubscription, StoreError>;
}

/// Notification channel bound to a stream: `:` and `-` become `_`, with an
/// `events_` prefix.
pub fn notify_channel(stream: &str) -> String {
    let mut name = String::with_capacity(stream.len() + 7);
    name.push_str("events_");
    for c in stream.chars() {
        name.push(match c {
            ':' | '-' => '_',
            other => other,
        });
    }
    name
}
