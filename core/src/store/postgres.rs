//! Durable event store over Postgres.
//!
//! Reads and writes go through the shared pool. Each push subscription dials
//! its own connection instead: `LISTEN` is connection-scoped, and a pooled
//! connection could be handed to another task mid-subscription.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{notify_channel, EventStore, EventSubscription, StoreError};
use crate::event::{Actor, ActorKind, Event, EventId, EventType};

/// Ids buffered per live subscription before the listener task waits on the
/// consumer.
const SUBSCRIPTION_BUFFER: usize = 64;

pub struct PgEventStore {
    pool: PgPool,
    database_url: String,
}

impl PgEventStore {
    /// `database_url` is kept for the dedicated listener connections; the
    /// pool serves everything else.
    pub fn new(pool: PgPool, database_url: impl Into<String>) -> Self {
        Self {
            pool,
            database_url: database_url.into(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    stream: String,
    event_type: String,
    actor_kind: i16,
    actor_id: String,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl EventRow {
    fn into_event(self) -> Result<Event, StoreError> {
        let id = self
            .id
            .parse::<EventId>()
            .map_err(|_| StoreError::InvalidEvent(format!("stored id {:?}", self.id)))?;
        let event_type = self
            .event_type
            .parse::<EventType>()
            .map_err(|_| StoreError::InvalidEvent(format!("stored type {:?}", self.event_type)))?;
        let kind = ActorKind::from_code(self.actor_kind).ok_or_else(|| {
            StoreError::InvalidEvent(format!("stored actor kind {}", self.actor_kind))
        })?;
        Ok(Event {
            id,
            stream: self.stream,
            event_type,
            timestamp: self.created_at,
            actor: Actor {
                kind,
                id: self.actor_id,
            },
            payload: self.payload,
        })
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, event: &Event) -> Result<(), StoreError> {
        if event.stream.is_empty() {
            return Err(StoreError::InvalidEvent("empty stream name".to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO events (id, stream, type, actor_kind, actor_id, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id.to_string())
        .bind(&event.stream)
        .bind(event.event_type.as_str())
        .bind(event.actor.kind.code())
        .bind(&event.actor.id)
        .bind(&event.payload)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        // The row is durable from here on. A lost notification only delays
        // remote consumers until their next replay, so it never fails the
        // append.
        let channel = notify_channel(&event.stream);
        if let Err(err) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&channel)
            .bind(event.id.to_string())
            .execute(&self.pool)
            .await
        {
            warn!(
                stream = %event.stream,
                event_id = %event.id,
                error = %err,
                "event notification failed after durable append"
            );
        }
        Ok(())
    }

    async fn replay(
        &self,
        stream: &str,
        after: EventId,
        limit: i64,
    ) -> Result<Vec<Event>, StoreError> {
        let mut after = after;
        if !after.is_zero() {
            let present: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM events WHERE stream = $1 AND id = $2)",
            )
            .bind(stream)
            .bind(after.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
            if !present {
                // The cursor points at a pruned (or never-seen) event; hand
                // the stream back from the top.
                after = EventId::ZERO;
            }
        }

        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, stream, type AS event_type, actor_kind, actor_id, payload, created_at
            FROM events
            WHERE stream = $1 AND id > $2
            ORDER BY id ASC
            LIMIT $3
            "#,
        )
        .bind(stream)
        .bind(after.to_string())
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn last_event_id(&self, stream: &str) -> Result<EventId, StoreError> {
        let last: Option<String> = sqlx::query_scalar("SELECT MAX(id) FROM events WHERE stream = $1")
            .bind(stream)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

        match last {
            Some(id) => id
                .parse()
                .map_err(|_| StoreError::InvalidEvent(format!("stored id {:?}", id))),
            None => Err(StoreError::StreamEmpty {
                stream: stream.to_string(),
            }),
        }
    }

    async fn subscribe(
        &self,
        stream: &str,
        cancel: CancellationToken,
    ) -> Result<EventSubscription, StoreError> {
        let channel = notify_channel(stream);
        let mut listener = PgListener::connect(&self.database_url)
            .await
            .map_err(StoreError::from_sqlx)?;
        // PgListener quotes the channel identifier before issuing LISTEN.
        listener
            .listen(&channel)
            .await
            .map_err(StoreError::from_sqlx)?;

        let (id_tx, ids) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (err_tx, errors) = mpsc::channel(1);
        let stream_name = stream.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(stream = %stream_name, "subscription cancelled");
                        break;
                    }
                    received = listener.recv() => match received {
                        Ok(notification) => {
                            match notification.payload().parse::<EventId>() {
                                Ok(id) => {
                                    // Consumer gone; nothing left to feed.
                                    if id_tx.send(id).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => {
                                    warn!(
                                        stream = %stream_name,
                                        payload = notification.payload(),
                                        "ignoring malformed notification payload"
                                    );
                                }
                            }
                        }
                        Err(err) => {
                            let _ = err_tx.try_send(StoreError::from_sqlx(err));
                            break;
                        }
                    },
                }
            }
            // Release the dedicated connection, then close the id channel,
            // then the error channel.
            drop(listener);
            drop(id_tx);
            drop(err_tx);
        });

        Ok(EventSubscription { ids, errors })
    }
}
