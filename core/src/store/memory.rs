//! In-memory event store.
//!
//! Serves tests that need append/replay semantics without a database. The
//! push side is intentionally inert: `subscribe` hands back channels that
//! are already closed, so anything exercising the notification path belongs
//! against the durable store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{EventStore, EventSubscription, StoreError};
use crate::event::{Event, EventId};

#[derive(Default)]
pub struct MemoryEventStore {
    streams: RwLock<HashMap<String, Vec<Event>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: &Event) -> Result<(), StoreError> {
        if event.stream.is_empty() {
            return Err(StoreError::InvalidEvent("empty stream name".to_string()));
        }
        let mut streams = self.streams.write();
        let entries = streams.entry(event.stream.clone()).or_default();
        // Kept sorted by id so replay can slice; appends from the process-wide
        // generator arrive in order already.
        match entries.binary_search_by(|existing| existing.id.cmp(&event.id)) {
            Ok(_) => Err(StoreError::InvalidEvent(format!(
                "duplicate event id {}",
                event.id
            ))),
            Err(pos) => {
                entries.insert(pos, event.clone());
                Ok(())
            }
        }
    }

    async fn replay(
        &self,
        stream: &str,
        after: EventId,
        limit: i64,
    ) -> Result<Vec<Event>, StoreError> {
        let streams = self.streams.read();
        let Some(entries) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        let start = if after.is_zero() {
            0
        } else {
            match entries.binary_search_by(|existing| existing.id.cmp(&after)) {
                Ok(pos) => pos + 1,
                // Unknown cursor: the stream may have been pruned past it, or
                // the caller never saw this stream. Start over from the top.
                Err(_) => 0,
            }
        };
        let limit = limit.max(0) as usize;
        Ok(entries[start..].iter().take(limit).cloned().collect())
    }

    async fn last_event_id(&self, stream: &str) -> Result<EventId, StoreError> {
        self.streams
            .read()
            .get(stream)
            .and_then(|entries| entries.last())
            .map(|event| event.id)
            .ok_or_else(|| StoreError::StreamEmpty {
                stream: stream.to_string(),
            })
    }

    async fn subscribe(
        &self,
        _stream: &str,
        _cancel: CancellationToken,
    ) -> Result<EventSubscription, StoreError> {
        // Both senders drop here; receivers read as immediately closed.
        let (_id_tx, ids) = mpsc::channel(1);
        let (_err_tx, errors) = mpsc::channel(1);
        Ok(EventSubscription { ids, errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{location_stream, Actor, EventType};

    fn say_event(stream: &str, n: u32) -> Event {
        Event::new(
            stream.to_string(),
            EventType::Say,
            Actor::character("c1"),
            format!("{{\"message\":\"line {}\"}}", n).into_bytes(),
        )
        .expect("build event")
    }

    #[tokio::test]
    async fn replay_from_beginning_is_ascending() {
        let store = MemoryEventStore::new();
        let stream = location_stream("hall");
        for n in 0..5 {
            store.append(&say_event(&stream, n)).await.unwrap();
        }

        let events = store.replay(&stream, EventId::ZERO, 10).await.unwrap();
        assert_eq!(events.len(), 5);
        for pair in events.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
    }

    #[tokio::test]
    async fn replay_after_cursor_and_limit() {
        let store = MemoryEventStore::new();
        let stream = location_stream("hall");
        let mut appended = Vec::new();
        for n in 0..5 {
            let event = say_event(&stream, n);
            store.append(&event).await.unwrap();
            appended.push(event);
        }

        let events = store.replay(&stream, appended[2].id, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, appended[3].id);
        assert_eq!(events[1].id, appended[4].id);

        let limited = store.replay(&stream, EventId::ZERO, 3).await.unwrap();
        assert_eq!(limited.len(), 3);
    }

    #[tokio::test]
    async fn unknown_cursor_restarts_from_the_top() {
        let store = MemoryEventStore::new();
        let stream = location_stream("hall");
        // An id from a different stream is not present here.
        let foreign = say_event("location:elsewhere", 0);
        for n in 0..3 {
            store.append(&say_event(&stream, n)).await.unwrap();
        }

        let events = store.replay(&stream, foreign.id, 10).await.unwrap();
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn empty_stream_replays_empty() {
        let store = MemoryEventStore::new();
        let events = store
            .replay("location:nowhere", EventId::ZERO, 10)
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn last_event_id_tracks_appends() {
        let store = MemoryEventStore::new();
        let stream = location_stream("hall");
        assert!(matches!(
            store.last_event_id(&stream).await,
            Err(StoreError::StreamEmpty { .. })
        ));

        let mut last = EventId::ZERO;
        for n in 0..3 {
            let event = say_event(&stream, n);
            store.append(&event).await.unwrap();
            last = event.id;
        }
        assert_eq!(store.last_event_id(&stream).await.unwrap(), last);
    }

    #[tokio::test]
    async fn rejects_duplicates_and_empty_streams() {
        let store = MemoryEventStore::new();
        let event = say_event("location:hall", 0);
        store.append(&event).await.unwrap();
        assert!(matches!(
            store.append(&event).await,
            Err(StoreError::InvalidEvent(_))
        ));

        let mut nameless = say_event("location:hall", 1);
        nameless.stream = String::new();
        assert!(matches!(
            store.append(&nameless).await,
            Err(StoreError::InvalidEvent(_))
        ));
    }

    #[tokio::test]
    async fn subscribe_channels_are_closed() {
        let store = MemoryEventStore::new();
        let mut subscription = store
            .subscribe("location:hall", CancellationToken::new())
            .await
            .unwrap();
        assert!(subscription.ids.recv().await.is_none());
        assert!(subscription.errors.recv().await.is_none());
    }
}
