//! Persistent event log interface.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use super::events::{Event, SequenceNumber};

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Append-only event log. The bus persists every published event here when
/// a store is configured; the CLI tails it.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: &Event) -> Result<(), EventStoreError>;

    async fn latest_sequence(&self) -> Result<Option<SequenceNumber>, EventStoreError>;

    /// Most recent events, newest last, optionally filtered by channel.
    async fn tail(&self, channel: Option<&str>, limit: usize) -> Result<Vec<Event>, EventStoreError>;
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<Event>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: &Event) -> Result<(), EventStoreError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn latest_sequence(&self) -> Result<Option<SequenceNumber>, EventStoreError> {
        Ok(self.events.read().await.iter().map(|e| e.sequence).max())
    }

    async fn tail(&self, channel: Option<&str>, limit: usize) -> Result<Vec<Event>, EventStoreError> {
        let events = self.events.read().await;
        let filtered: Vec<Event> = events
            .iter()
            .filter(|e| channel.is_none_or(|c| e.channel() == c))
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(limit);
        Ok(filtered[start..].to_vec())
    }
}
