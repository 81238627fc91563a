// Storage ports for the memory layer.
//
// The core defines WHAT it needs from storage; `infra/memory` provides the
// SQLite, JSON-file and in-memory implementations. Services wrap these traits
// and turn every `MemoryError` into a logged boolean/empty result, so store
// implementations are free to propagate errors with `?`.

use super::memory_models::{
    ConversationMessage, KnowledgeCollection, ListOrder, NewMessage, NewTrainingEntry,
    TicketContext, TrainingEntry, TrainingStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Malformed import: {0}")]
    MalformedImport(String),
    #[error("Invalid collection name: {0:?}")]
    InvalidName(String),
}

/// Persistence for training entries, keyed uniquely by question text.
#[async_trait]
pub trait TrainingStore: Send + Sync {
    /// Insert, or replace answer/category/tags/metadata of the entry with the
    /// same question. `id`, `created_at` and `usage_count` of an existing
    /// entry are preserved; `updated_at` is always set to `now`.
    async fn upsert_entry(
        &self,
        entry: &NewTrainingEntry,
        now: DateTime<Utc>,
    ) -> Result<(), MemoryError>;

    async fn get_entry(&self, id: i64) -> Result<Option<TrainingEntry>, MemoryError>;

    /// Exact, case-sensitive lookup by question.
    async fn find_by_question(&self, question: &str)
        -> Result<Option<TrainingEntry>, MemoryError>;

    async fn list_entries(
        &self,
        category: Option<&str>,
        order: ListOrder,
    ) -> Result<Vec<TrainingEntry>, MemoryError>;

    /// Returns false if no entry had this id.
    async fn delete_entry(&self, id: i64) -> Result<bool, MemoryError>;

    /// Returns false if no entry had this id.
    async fn increment_usage(&self, id: i64) -> Result<bool, MemoryError>;

    async fn training_stats(&self) -> Result<TrainingStats, MemoryError>;
}

/// Append-only message log per ticket.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append_message(
        &self,
        message: &NewMessage,
        now: DateTime<Utc>,
    ) -> Result<i64, MemoryError>;

    /// The most recent `limit` messages for a ticket, NEWEST FIRST.
    /// Callers that need chronological order reverse the result.
    async fn recent_messages(
        &self,
        ticket_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, MemoryError>;

    async fn count_messages(&self) -> Result<u64, MemoryError>;
}

/// One lifecycle record per ticket.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Returns false when a context for this ticket already exists.
    async fn create_ticket(&self, context: &TicketContext) -> Result<bool, MemoryError>;

    async fn get_ticket(&self, ticket_id: &str) -> Result<Option<TicketContext>, MemoryError>;

    /// Sets status to closed and stamps `closed_at`, even if already closed.
    /// Returns false if the ticket doesn't exist.
    async fn close_ticket(
        &self,
        ticket_id: &str,
        closed_at: DateTime<Utc>,
    ) -> Result<bool, MemoryError>;

    async fn count_open_tickets(&self) -> Result<u64, MemoryError>;
}

/// Whole-document persistence for named knowledge collections.
///
/// Reads and writes always cover the entire collection; there are no partial
/// updates.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<KnowledgeCollection>, MemoryError>;

    /// Create or overwrite the document stored under `collection.name`.
    async fn save(&self, collection: &KnowledgeCollection) -> Result<(), MemoryError>;

    /// Names of every stored collection, sorted.
    async fn list_names(&self) -> Result<Vec<String>, MemoryError>;

    /// Returns false if nothing was stored under `name`.
    async fn remove(&self, name: &str) -> Result<bool, MemoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_descriptive() {
        let err = MemoryError::Storage("disk full".into());
        assert_eq!(err.to_string(), "Storage error: disk full");

        let err = MemoryError::InvalidName("../etc".into());
        assert!(err.to_string().contains("../etc"));
    }
}
