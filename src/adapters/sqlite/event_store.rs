//! SQLite-backed event log.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::services::event_store::{EventStore, EventStoreError};
use crate::services::events::{Event, EventId, EventPayload, SequenceNumber};

#[derive(Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(&self, event: &Event) -> Result<(), EventStoreError> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;
        let (entity_type, entity_id) = event.payload.entity_ref();

        sqlx::query(
            r#"INSERT INTO events (sequence, id, channel, payload, entity_type, entity_id,
               published_at, source_process_id)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(event.sequence.0 as i64)
        .bind(event.id.to_string())
        .bind(event.channel())
        .bind(&payload)
        .bind(entity_type)
        .bind(entity_id)
        .bind(event.published_at.to_rfc3339())
        .bind(event.source_process_id.map(|id| id.to_string()))
        .execute(&self.pool)
        .await
        .map_err(|e| EventStoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn latest_sequence(&self) -> Result<Option<SequenceNumber>, EventStoreError> {
        let (seq,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(sequence), -1) FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EventStoreError::Storage(e.to_string()))?;
        Ok((seq >= 0).then(|| SequenceNumber(seq as u64)))
    }

    async fn tail(&self, channel: Option<&str>, limit: usize) -> Result<Vec<Event>, EventStoreError> {
        let rows: Vec<EventRow> = match channel {
            Some(c) => sqlx::query_as(
                "SELECT * FROM events WHERE channel = ? ORDER BY sequence DESC LIMIT ?",
            )
            .bind(c)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventStoreError::Storage(e.to_string()))?,
            None => sqlx::query_as("SELECT * FROM events ORDER BY sequence DESC LIMIT ?")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| EventStoreError::Storage(e.to_string()))?,
        };

        let mut events = Vec::with_capacity(rows.len());
        for row in rows.into_iter().rev() {
            events.push(row.try_into()?);
        }
        Ok(events)
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    sequence: i64,
    id: String,
    #[allow(dead_code)]
    channel: String,
    payload: String,
    #[allow(dead_code)]
    entity_type: Option<String>,
    #[allow(dead_code)]
    entity_id: Option<String>,
    published_at: String,
    source_process_id: Option<String>,
}

impl TryFrom<EventRow> for Event {
    type Error = EventStoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let payload: EventPayload = serde_json::from_str(&row.payload)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;
        let id = uuid::Uuid::parse_str(&row.id)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;
        let published_at = chrono::DateTime::parse_from_rfc3339(&row.published_at)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?
            .with_timezone(&chrono::Utc);
        let source_process_id = row
            .source_process_id
            .map(|s| uuid::Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

        Ok(Event {
            id: EventId(id),
            sequence: SequenceNumber(row.sequence as u64),
            published_at,
            source_process_id,
            payload,
        })
    }
}
