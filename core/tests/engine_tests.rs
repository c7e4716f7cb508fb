//! Cross-component scenarios: engine + in-memory store + broadcaster +
//! session manager. The durable backend has its own suite in `pg_tests.rs`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use thornwood_core::broadcast::Broadcaster;
use thornwood_core::engine::{Engine, EngineError, SayPayload};
use thornwood_core::event::{location_stream, Event, EventId, EventType};
use thornwood_core::session::SessionManager;
use thornwood_core::store::memory::MemoryEventStore;
use thornwood_core::store::{EventStore, EventSubscription, StoreError};

fn harness() -> (Engine, Arc<Broadcaster>, Arc<SessionManager>) {
    let store = Arc::new(MemoryEventStore::new());
    let broadcaster = Arc::new(Broadcaster::new());
    let sessions = Arc::new(SessionManager::new());
    let engine = Engine::new(store, Some(broadcaster.clone()), sessions.clone());
    (engine, broadcaster, sessions)
}

#[tokio::test]
async fn say_persists_and_broadcasts() {
    let (engine, broadcaster, sessions) = harness();
    let stream = location_stream("great-hall");

    sessions.connect("c1", "k1");
    let mut subscription = broadcaster.subscribe(&stream);

    engine
        .handle_say("c1", "great-hall", "Hello, world!")
        .await
        .expect("say succeeds");

    let event = subscription.recv().await.expect("delivered in-process");
    assert_eq!(event.stream, stream);
    assert_eq!(event.event_type, EventType::Say);
    assert_eq!(event.actor.id, "c1");
    let payload: SayPayload = serde_json::from_slice(&event.payload).expect("payload shape");
    assert_eq!(payload.message, "Hello, world!");
    // Exactly once.
    assert!(subscription.try_recv().is_err());

    // The same event is durable and replayable.
    let replayed = engine
        .replay_events("c1", &stream, 10)
        .await
        .expect("replay succeeds");
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].id, event.id);
    assert_eq!(replayed[0].payload, event.payload);
}

#[tokio::test]
async fn pose_payload_convention() {
    let (engine, broadcaster, _sessions) = harness();
    let stream = location_stream("great-hall");
    let mut subscription = broadcaster.subscribe(&stream);

    engine
        .handle_pose("c1", "great-hall", "waves")
        .await
        .expect("pose succeeds");

    let event = subscription.recv().await.expect("delivered");
    assert_eq!(event.event_type, EventType::Pose);
    let value: serde_json::Value = serde_json::from_slice(&event.payload).expect("json payload");
    assert_eq!(value, serde_json::json!({ "action": "waves" }));
}

#[tokio::test]
async fn replay_resumes_after_cursor() {
    let (engine, _broadcaster, sessions) = harness();
    let stream = location_stream("great-hall");

    sessions.connect("c1", "k1");
    let mut appended = Vec::new();
    for n in 0..5 {
        let event = engine
            .handle_say("c1", "great-hall", &format!("line {}", n))
            .await
            .expect("say succeeds");
        appended.push(event);
    }

    sessions.update_cursor("c1", &stream, appended[2].id);

    let replayed = engine
        .replay_events("c1", &stream, 10)
        .await
        .expect("replay succeeds");
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].id, appended[3].id);
    assert_eq!(replayed[1].id, appended[4].id);
    assert!(replayed[0].id < replayed[1].id);
}

#[tokio::test]
async fn replay_without_session_starts_from_the_beginning() {
    let (engine, _broadcaster, _sessions) = harness();

    for n in 0..3 {
        engine
            .handle_say("c1", "great-hall", &format!("line {}", n))
            .await
            .expect("say succeeds");
    }

    // "c2" never connected; no cursor means full history.
    let replayed = engine
        .replay_events("c2", &location_stream("great-hall"), 10)
        .await
        .expect("replay succeeds");
    assert_eq!(replayed.len(), 3);
}

#[tokio::test]
async fn missing_broadcaster_is_not_an_error() {
    let store = Arc::new(MemoryEventStore::new());
    let sessions = Arc::new(SessionManager::new());
    let engine = Engine::new(store.clone(), None, sessions);

    let event = engine
        .handle_say("c1", "great-hall", "anyone there?")
        .await
        .expect("say succeeds without a broadcaster");

    let replayed = store
        .replay(&location_stream("great-hall"), EventId::ZERO, 10)
        .await
        .expect("replay succeeds");
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].id, event.id);
}

/// Store that refuses every append, for error propagation checks.
struct FailingStore;

#[async_trait]
impl EventStore for FailingStore {
    async fn append(&self, _event: &Event) -> Result<(), StoreError> {
        Err(StoreError::Transient(sqlx::Error::PoolTimedOut))
    }

    async fn replay(
        &self,
        _stream: &str,
        _after: EventId,
        _limit: i64,
    ) -> Result<Vec<Event>, StoreError> {
        Err(StoreError::Transient(sqlx::Error::PoolTimedOut))
    }

    async fn last_event_id(&self, stream: &str) -> Result<EventId, StoreError> {
        Err(StoreError::StreamEmpty {
            stream: stream.to_string(),
        })
    }

    async fn subscribe(
        &self,
        _stream: &str,
        _cancel: CancellationToken,
    ) -> Result<EventSubscription, StoreError> {
        Err(StoreError::Transient(sqlx::Error::PoolTimedOut))
    }
}

#[tokio::test]
async fn append_failure_surfaces_with_context() {
    let broadcaster = Arc::new(Broadcaster::new());
    let sessions = Arc::new(SessionManager::new());
    let engine = Engine::new(
        Arc::new(FailingStore),
        Some(broadcaster.clone()),
        sessions,
    );

    let mut subscription = broadcaster.subscribe(&location_stream("great-hall"));

    let err = engine
        .handle_say("c1", "great-hall", "hello?")
        .await
        .expect_err("append failure must surface");
    match err {
        EngineError::Append {
            event_type,
            stream,
            source,
        } => {
            assert_eq!(event_type, EventType::Say);
            assert_eq!(stream, location_stream("great-hall"));
            assert!(source.is_transient());
        }
        other => panic!("expected append error, got {:?}", other),
    }

    // Nothing broadcast for a failed append.
    assert!(subscription.try_recv().is_err());
}
