// Conversation history and ticket lifecycle.
//
// History is append-only: there is no update or delete. Ticket contexts move
// open -> closed and never back; reopening is left to the caller.

use super::memory_models::{ConversationMessage, NewMessage, TicketContext, TicketStatus};
use super::memory_store::{ConversationStore, TicketStore};
use chrono::Utc;

pub struct ConversationService<S: ConversationStore + TicketStore> {
    store: S,
}

impl<S: ConversationStore + TicketStore> ConversationService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Append one message to a ticket's history.
    ///
    /// The ticket context doesn't have to exist yet.
    pub async fn append(
        &self,
        ticket_id: &str,
        author_id: &str,
        text: &str,
        machine_generated: bool,
    ) -> bool {
        let message = NewMessage {
            ticket_id: ticket_id.to_string(),
            author_id: author_id.to_string(),
            text: text.to_string(),
            machine_generated,
        };

        match self.store.append_message(&message, Utc::now()).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Error adding conversation message to {}: {}", ticket_id, e);
                false
            }
        }
    }

    /// The last `limit` messages of a ticket, oldest first.
    pub async fn recent(&self, ticket_id: &str, limit: usize) -> Vec<ConversationMessage> {
        if limit == 0 {
            return Vec::new();
        }

        match self.store.recent_messages(ticket_id, limit).await {
            Ok(mut messages) => {
                // Stores hand back newest first.
                messages.reverse();
                messages
            }
            Err(e) => {
                tracing::error!("Failed to load history for {}: {}", ticket_id, e);
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------
    // Ticket lifecycle
    // ------------------------------------------------------------------

    /// Open a new ticket context. Fails if one already exists for the id.
    pub async fn create(&self, ticket_id: &str, owner_id: &str, category: &str) -> bool {
        let context = TicketContext {
            ticket_id: ticket_id.to_string(),
            owner_id: owner_id.to_string(),
            category: category.to_string(),
            status: TicketStatus::Open,
            created_at: Utc::now(),
            closed_at: None,
        };

        match self.store.create_ticket(&context).await {
            Ok(true) => {
                tracing::info!(owner_id, category, "Opened ticket {}", ticket_id);
                true
            }
            Ok(false) => {
                tracing::warn!("Ticket {} already has a context", ticket_id);
                false
            }
            Err(e) => {
                tracing::error!("Error creating ticket context {}: {}", ticket_id, e);
                false
            }
        }
    }

    pub async fn get(&self, ticket_id: &str) -> Option<TicketContext> {
        self.store.get_ticket(ticket_id).await.unwrap_or_else(|e| {
            tracing::error!("Failed to load ticket {}: {}", ticket_id, e);
            None
        })
    }

    /// Close a ticket. Closing again succeeds and re-stamps `closed_at`.
    /// Returns false if the ticket doesn't exist.
    pub async fn close(&self, ticket_id: &str) -> bool {
        match self.store.close_ticket(ticket_id, Utc::now()).await {
            Ok(true) => {
                tracing::info!("Closed ticket {}", ticket_id);
                true
            }
            Ok(false) => {
                tracing::warn!("Cannot close unknown ticket {}", ticket_id);
                false
            }
            Err(e) => {
                tracing::error!("Error closing ticket {}: {}", ticket_id, e);
                false
            }
        }
    }

    /// Move a ticket to `status`.
    ///
    /// `Closed` behaves like [`close`](Self::close). `Open` only succeeds for
    /// a ticket that is still open: closed tickets are never reopened here.
    pub async fn set_status(&self, ticket_id: &str, status: TicketStatus) -> bool {
        match status {
            TicketStatus::Closed => self.close(ticket_id).await,
            TicketStatus::Open => match self.get(ticket_id).await {
                Some(context) if context.is_open() => true,
                Some(_) => {
                    tracing::warn!("Refusing to reopen closed ticket {}", ticket_id);
                    false
                }
                None => false,
            },
        }
    }

    pub async fn message_count(&self) -> u64 {
        self.store.count_messages().await.unwrap_or_else(|e| {
            tracing::error!("Failed to count messages: {}", e);
            0
        })
    }

    pub async fn open_ticket_count(&self) -> u64 {
        self.store.count_open_tickets().await.unwrap_or_else(|e| {
            tracing::error!("Failed to count open tickets: {}", e);
            0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::memory_store::MemoryError;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;

    // Simple in-memory store for testing
    #[derive(Default)]
    struct InMemoryStore {
        messages: Mutex<Vec<ConversationMessage>>,
        tickets: Mutex<HashMap<String, TicketContext>>,
    }

    #[async_trait]
    impl ConversationStore for InMemoryStore {
        async fn append_message(
            &self,
            message: &NewMessage,
            now: DateTime<Utc>,
        ) -> Result<i64, MemoryError> {
            let mut messages = self.messages.lock().unwrap();
            let id = messages.len() as i64 + 1;
            messages.push(ConversationMessage {
                id,
                ticket_id: message.ticket_id.clone(),
                author_id: message.author_id.clone(),
                text: message.text.clone(),
                machine_generated: message.machine_generated,
                created_at: now,
            });
            Ok(id)
        }

        async fn recent_messages(
            &self,
            ticket_id: &str,
            limit: usize,
        ) -> Result<Vec<ConversationMessage>, MemoryError> {
            let messages = self.messages.lock().unwrap();
            Ok(messages
                .iter()
                .filter(|m| m.ticket_id == ticket_id)
                .rev()
                .take(limit)
                .cloned()
                .collect())
        }

        async fn count_messages(&self) -> Result<u64, MemoryError> {
            Ok(self.messages.lock().unwrap().len() as u64)
        }
    }

    #[async_trait]
    impl TicketStore for InMemoryStore {
        async fn create_ticket(&self, context: &TicketContext) -> Result<bool, MemoryError> {
            let mut tickets = self.tickets.lock().unwrap();
            if tickets.contains_key(&context.ticket_id) {
                return Ok(false);
            }
            tickets.insert(context.ticket_id.clone(), context.clone());
            Ok(true)
        }

        async fn get_ticket(&self, ticket_id: &str) -> Result<Option<TicketContext>, MemoryError> {
            Ok(self.tickets.lock().unwrap().get(ticket_id).cloned())
        }

        async fn close_ticket(
            &self,
            ticket_id: &str,
            closed_at: DateTime<Utc>,
        ) -> Result<bool, MemoryError> {
            let mut tickets = self.tickets.lock().unwrap();
            match tickets.get_mut(ticket_id) {
                Some(context) => {
                    context.status = TicketStatus::Closed;
                    context.closed_at = Some(closed_at);
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn count_open_tickets(&self) -> Result<u64, MemoryError> {
            let tickets = self.tickets.lock().unwrap();
            Ok(tickets.values().filter(|t| t.is_open()).count() as u64)
        }
    }

    fn service() -> ConversationService<InMemoryStore> {
        ConversationService::new(InMemoryStore::default())
    }

    #[tokio::test]
    async fn recent_returns_last_messages_in_chronological_order() {
        let service = service();
        for i in 1..=5 {
            assert!(service.append("ticket-0001", "user", &format!("msg {i}"), false).await);
        }
        service.append("ticket-0002", "user", "other ticket", false).await;

        let recent = service.recent("ticket-0001", 3).await;
        let texts: Vec<&str> = recent.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["msg 3", "msg 4", "msg 5"]);

        let all = service.recent("ticket-0001", 50).await;
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].text, "msg 1");

        assert!(service.recent("ticket-0001", 0).await.is_empty());
        assert!(service.recent("ticket-9999", 10).await.is_empty());
    }

    #[tokio::test]
    async fn create_is_unique_per_ticket() {
        let service = service();
        assert!(service.create("ticket-0001", "42", "billing").await);
        assert!(!service.create("ticket-0001", "43", "technical").await);

        let context = service.get("ticket-0001").await.unwrap();
        assert_eq!(context.owner_id, "42");
        assert_eq!(context.status, TicketStatus::Open);
        assert!(context.closed_at.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let service = service();
        service.create("ticket-0001", "42", "billing").await;

        assert!(service.close("ticket-0001").await);
        let first = service.get("ticket-0001").await.unwrap();
        assert_eq!(first.status, TicketStatus::Closed);
        assert!(first.closed_at.is_some());

        assert!(service.close("ticket-0001").await);
        let second = service.get("ticket-0001").await.unwrap();
        assert_eq!(second.status, TicketStatus::Closed);
        assert!(second.closed_at >= first.closed_at);
    }

    #[tokio::test]
    async fn close_unknown_ticket_fails() {
        let service = service();
        assert!(!service.close("ticket-9999").await);
    }

    #[tokio::test]
    async fn set_status_never_reopens() {
        let service = service();
        service.create("ticket-0001", "42", "general").await;

        assert!(service.set_status("ticket-0001", TicketStatus::Open).await);
        assert!(service.set_status("ticket-0001", TicketStatus::Closed).await);
        assert!(!service.set_status("ticket-0001", TicketStatus::Open).await);
        assert_eq!(
            service.get("ticket-0001").await.unwrap().status,
            TicketStatus::Closed
        );
        assert!(!service.set_status("missing", TicketStatus::Open).await);
    }

    #[tokio::test]
    async fn counts_messages_and_open_tickets() {
        let service = service();
        service.create("a", "1", "general").await;
        service.create("b", "2", "general").await;
        service.close("b").await;
        service.append("a", "1", "hi", false).await;
        service.append("a", "bot", "hello", true).await;

        assert_eq!(service.message_count().await, 2);
        assert_eq!(service.open_ticket_count().await, 1);
    }
}
