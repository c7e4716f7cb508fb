//! In-process fan-out from the event log to live subscribers.
//!
//! Producers never block here: delivery to each subscriber is a non-blocking
//! enqueue into that subscriber's bounded buffer, and a full buffer drops the
//! event for that subscriber only. The event is already durable by the time
//! it is broadcast, so a dropped delivery is recoverable through replay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, warn};

use crate::event::Event;

/// Undelivered events buffered per subscriber.
pub const SUBSCRIBER_BUFFER: usize = 100;

/// Reader endpoint handed out by [`Broadcaster::subscribe`].
///
/// Single reader; the broadcaster is the single writer. Return it to
/// [`Broadcaster::unsubscribe`] to close the endpoint.
pub struct Subscription {
    id: u64,
    stream: String,
    receiver: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Next buffered event; `None` once the subscription is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Event, TryRecvError> {
        self.receiver.try_recv()
    }
}

struct SubscriberSlot {
    id: u64,
    sender: mpsc::Sender<Event>,
}

/// Topic router keyed by stream name.
///
/// `broadcast` takes the read lock; `subscribe` and `unsubscribe` take the
/// write lock. The per-subscriber channels are the only producer/consumer
/// synchronization point.
#[derive(Default)]
pub struct Broadcaster {
    topics: RwLock<HashMap<String, Vec<SubscriberSlot>>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber on `stream` with a fresh 100-event buffer.
    pub fn subscribe(&self, stream: &str) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .write()
            .entry(stream.to_string())
            .or_default()
            .push(SubscriberSlot { id, sender });
        debug!(stream, subscription = id, "subscribed");
        Subscription {
            id,
            stream: stream.to_string(),
            receiver,
        }
    }

    /// Remove the subscription and close its endpoint. Consuming the
    /// [`Subscription`] makes a second close unrepresentable.
    pub fn unsubscribe(&self, stream: &str, subscription: Subscription) {
        let mut topics = self.topics.write();
        if let Some(slots) = topics.get_mut(stream) {
            slots.retain(|slot| slot.id != subscription.id);
            if slots.is_empty() {
                topics.remove(stream);
            }
        }
        debug!(stream, subscription = subscription.id, "unsubscribed");
        // Dropping `subscription` here closes the reader endpoint.
    }

    /// Hand `event` to every subscriber of its stream without blocking.
    pub fn broadcast(&self, event: &Event) {
        let topics = self.topics.read();
        let Some(slots) = topics.get(&event.stream) else {
            return;
        };
        for slot in slots {
            match slot.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        stream = %event.stream,
                        event_id = %event.id,
                        event_type = %event.event_type,
                        subscription = slot.id,
                        "subscriber buffer full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        stream = %event.stream,
                        subscription = slot.id,
                        "subscriber endpoint dropped without unsubscribe"
                    );
                }
            }
        }
    }
}
