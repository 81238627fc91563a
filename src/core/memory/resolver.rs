// Query resolution: the single entry point a ticket handler calls per message.
//
// Either a stored answer is confident enough to send as-is, or the caller
// gets everything an external generator needs (ticket, recent history,
// near-miss training entries). Nothing is written to history until an answer
// actually exists, so abandoning a resolution midway leaves no partial state.

use super::conversation_service::ConversationService;
use super::memory_config::MemoryConfig;
use super::memory_models::{
    ConversationMessage, MemoryStats, ScoredEntry, TicketContext, TrainingEntry,
};
use super::memory_store::{ConversationStore, TicketStore, TrainingStore};
use super::training_service::TrainingService;
use async_trait::async_trait;
use std::sync::Arc;

/// How many similar entries are fetched per query.
pub const SIMILAR_LIMIT: usize = 3;

/// External text generator, invoked only when no stored answer is confident
/// enough. Implementations own any network transport.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Returns `None` when no answer could be produced.
    async fn generate(&self, prompt: &str, context: &GenerationContext) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolveOptions {
    pub match_threshold: f64,
    pub high_confidence_threshold: f64,
    pub history_limit: usize,
}

impl From<&MemoryConfig> for ResolveOptions {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            match_threshold: config.similarity_threshold,
            high_confidence_threshold: config.high_confidence_threshold,
            history_limit: config.history_limit,
        }
    }
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self::from(&MemoryConfig::default())
    }
}

/// Material for an external generator when no direct answer exists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationContext {
    /// The inbound message that needs an answer.
    pub query: String,
    pub ticket: Option<TicketContext>,
    /// Oldest first.
    pub history: Vec<ConversationMessage>,
    /// Best first. Empty when nothing cleared the match threshold.
    pub similar: Vec<ScoredEntry>,
}

const SIMILAR_HEADER: &str = "Related answers:\n";
const HISTORY_HEADER: &str = "Conversation:\n";

/// Accept lines while they fit in `budget`. The header is charged together
/// with the first accepted line, so an empty section costs nothing.
fn fill_section(
    budget: &mut usize,
    header: &str,
    lines: impl IntoIterator<Item = String>,
    stop_at_first_miss: bool,
) -> Vec<String> {
    let header_len = header.chars().count();
    let mut accepted = Vec::new();
    for line in lines {
        let mut cost = line.chars().count();
        if accepted.is_empty() {
            cost += header_len;
        }
        if cost <= *budget {
            *budget -= cost;
            accepted.push(line);
        } else if stop_at_first_miss {
            break;
        }
    }
    accepted
}

impl GenerationContext {
    /// Render as plain text for a generator prompt.
    ///
    /// The question line always closes the prompt. Everything before it fits
    /// in whatever of `max_chars` the question leaves over: similar entries
    /// first, best match first, then history in chronological order. When
    /// the budget runs out the oldest messages are the ones dropped. Items
    /// that don't fit whole are skipped, never cut.
    pub fn render(&self, max_chars: usize) -> String {
        let question = if self.query.trim().is_empty() {
            String::new()
        } else {
            format!("Question: {}\n", self.query.trim())
        };
        let mut budget = max_chars.saturating_sub(question.chars().count());

        let mut out = String::new();

        if let Some(ticket) = &self.ticket {
            let line = format!("Ticket category: {}\n", ticket.category);
            let len = line.chars().count();
            if len <= budget {
                budget -= len;
                out.push_str(&line);
            }
        }

        let similar_lines = fill_section(
            &mut budget,
            SIMILAR_HEADER,
            self.similar.iter().map(|scored| {
                format!("- Q: {}\n  A: {}\n", scored.entry.question, scored.entry.answer)
            }),
            false,
        );
        if !similar_lines.is_empty() {
            out.push_str(SIMILAR_HEADER);
            out.extend(similar_lines);
        }

        // Newest first while filling, then flipped back.
        let mut history_lines = fill_section(
            &mut budget,
            HISTORY_HEADER,
            self.history.iter().rev().map(|message| {
                let author = if message.machine_generated {
                    "assistant"
                } else {
                    message.author_id.as_str()
                };
                format!("{}: {}\n", author, message.text)
            }),
            true,
        );
        if !history_lines.is_empty() {
            history_lines.reverse();
            out.push_str(HISTORY_HEADER);
            out.extend(history_lines);
        }

        out.push_str(&question);
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A stored answer scored at or above the high-confidence threshold. Its
    /// usage counter has already been incremented.
    Direct { entry: TrainingEntry, score: f64 },
    /// No confident match; hand this to an [`AnswerGenerator`].
    NeedsGeneration(GenerationContext),
}

/// Where a [`Reply`] came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplySource {
    Trained { entry_id: i64, score: f64 },
    Generated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub source: ReplySource,
}

pub struct QueryResolver<T: TrainingStore, S: ConversationStore + TicketStore> {
    training: Arc<TrainingService<T>>,
    conversations: Arc<ConversationService<S>>,
    options: ResolveOptions,
    max_context_length: usize,
}

impl<T: TrainingStore, S: ConversationStore + TicketStore> QueryResolver<T, S> {
    pub fn new(
        training: Arc<TrainingService<T>>,
        conversations: Arc<ConversationService<S>>,
        config: &MemoryConfig,
    ) -> Self {
        Self {
            training,
            conversations,
            options: ResolveOptions::from(config),
            max_context_length: config.max_context_length,
        }
    }

    pub fn options(&self) -> ResolveOptions {
        self.options
    }

    pub async fn resolve(&self, ticket_id: &str, query: &str) -> Resolution {
        self.resolve_with(ticket_id, query, self.options).await
    }

    /// [`resolve`](Self::resolve) with per-call thresholds.
    pub async fn resolve_with(
        &self,
        ticket_id: &str,
        query: &str,
        options: ResolveOptions,
    ) -> Resolution {
        let (ticket, history) = tokio::join!(
            self.conversations.get(ticket_id),
            self.conversations.recent(ticket_id, options.history_limit),
        );

        let similar = self
            .training
            .find_similar(query, options.match_threshold, SIMILAR_LIMIT)
            .await;

        if let Some(best) = similar.first() {
            if best.score >= options.high_confidence_threshold {
                // A concurrent delete makes this a no-op; the answer still stands.
                self.training.increment_usage(best.entry.id).await;
                tracing::info!(
                    score = best.score,
                    entry_id = best.entry.id,
                    "Answering ticket {} from training data",
                    ticket_id
                );
                let best = best.clone();
                return Resolution::Direct {
                    entry: best.entry,
                    score: best.score,
                };
            }
        }

        tracing::debug!(
            similar = similar.len(),
            history = history.len(),
            "No confident match for ticket {}",
            ticket_id
        );

        Resolution::NeedsGeneration(GenerationContext {
            query: query.to_string(),
            ticket,
            history,
            similar,
        })
    }

    /// Persist one inbound query and the answer sent back for it.
    ///
    /// The answer is only written if the query was.
    pub async fn record_exchange(
        &self,
        ticket_id: &str,
        author_id: &str,
        query: &str,
        responder_id: &str,
        answer: &str,
    ) -> bool {
        self.conversations
            .append(ticket_id, author_id, query, false)
            .await
            && self
                .conversations
                .append(ticket_id, responder_id, answer, true)
                .await
    }

    /// Resolve `query`, fall back to `generator` when needed, and record the
    /// exchange.
    ///
    /// Returns `None` (and records nothing) when there was no confident match
    /// and the generator produced no answer.
    pub async fn respond<G>(
        &self,
        ticket_id: &str,
        author_id: &str,
        query: &str,
        responder_id: &str,
        generator: &G,
    ) -> Option<Reply>
    where
        G: AnswerGenerator + ?Sized,
    {
        let reply = match self.resolve(ticket_id, query).await {
            Resolution::Direct { entry, score } => Reply {
                text: entry.answer,
                source: ReplySource::Trained {
                    entry_id: entry.id,
                    score,
                },
            },
            Resolution::NeedsGeneration(context) => {
                let prompt = context.render(self.max_context_length);
                let text = generator.generate(&prompt, &context).await?;
                if text.trim().is_empty() {
                    tracing::warn!("Generator returned an empty answer for {}", ticket_id);
                    return None;
                }
                Reply {
                    text,
                    source: ReplySource::Generated,
                }
            }
        };

        if !self
            .record_exchange(ticket_id, author_id, query, responder_id, &reply.text)
            .await
        {
            tracing::warn!("Answered ticket {} but failed to record the exchange", ticket_id);
        }

        Some(reply)
    }

    pub async fn stats(&self) -> MemoryStats {
        let (training, total_conversations, open_tickets) = tokio::join!(
            self.training.stats(),
            self.conversations.message_count(),
            self.conversations.open_ticket_count(),
        );

        MemoryStats {
            total_training_entries: training.total_entries,
            total_conversations,
            open_tickets,
            total_usage: training.total_usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::memory_models::{
        ListOrder, NewTrainingEntry, TicketStatus, TrainingStats,
    };
    use crate::core::memory::MemoryError;
    use crate::infra::memory::SqliteMemoryStore;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    struct CannedGenerator {
        answer: Option<String>,
        prompts: Mutex<Vec<String>>,
    }

    impl CannedGenerator {
        fn new(answer: Option<&str>) -> Self {
            Self {
                answer: answer.map(str::to_string),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AnswerGenerator for CannedGenerator {
        async fn generate(&self, prompt: &str, _: &GenerationContext) -> Option<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.answer.clone()
        }
    }

    async fn resolver() -> (
        QueryResolver<SqliteMemoryStore, SqliteMemoryStore>,
        Arc<TrainingService<SqliteMemoryStore>>,
        Arc<ConversationService<SqliteMemoryStore>>,
    ) {
        let store = SqliteMemoryStore::in_memory().await.unwrap();
        let training = Arc::new(TrainingService::new(store.clone()));
        let conversations = Arc::new(ConversationService::new(store));
        let resolver = QueryResolver::new(
            Arc::clone(&training),
            Arc::clone(&conversations),
            &MemoryConfig::default(),
        );
        (resolver, training, conversations)
    }

    fn message(author: &str, text: &str, machine_generated: bool) -> ConversationMessage {
        ConversationMessage {
            id: 0,
            ticket_id: "t".to_string(),
            author_id: author.to_string(),
            text: text.to_string(),
            machine_generated,
            created_at: Utc::now(),
        }
    }

    fn scored(question: &str, answer: &str, score: f64) -> ScoredEntry {
        ScoredEntry {
            entry: TrainingEntry {
                id: 1,
                question: question.to_string(),
                answer: answer.to_string(),
                category: "general".to_string(),
                tags: Vec::new(),
                metadata: None,
                usage_count: 0,
                confidence: 0.0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            score,
        }
    }

    /// Deletes the entry right before counting a use of it, the way a
    /// concurrent `!forget` would between lookup and increment.
    struct DeletedBeforeIncrement(SqliteMemoryStore);

    #[async_trait]
    impl TrainingStore for DeletedBeforeIncrement {
        async fn upsert_entry(
            &self,
            entry: &NewTrainingEntry,
            now: DateTime<Utc>,
        ) -> Result<(), MemoryError> {
            self.0.upsert_entry(entry, now).await
        }

        async fn get_entry(&self, id: i64) -> Result<Option<TrainingEntry>, MemoryError> {
            self.0.get_entry(id).await
        }

        async fn find_by_question(
            &self,
            question: &str,
        ) -> Result<Option<TrainingEntry>, MemoryError> {
            self.0.find_by_question(question).await
        }

        async fn list_entries(
            &self,
            category: Option<&str>,
            order: ListOrder,
        ) -> Result<Vec<TrainingEntry>, MemoryError> {
            self.0.list_entries(category, order).await
        }

        async fn delete_entry(&self, id: i64) -> Result<bool, MemoryError> {
            self.0.delete_entry(id).await
        }

        async fn increment_usage(&self, id: i64) -> Result<bool, MemoryError> {
            self.0.delete_entry(id).await?;
            self.0.increment_usage(id).await
        }

        async fn training_stats(&self) -> Result<TrainingStats, MemoryError> {
            self.0.training_stats().await
        }
    }

    #[tokio::test]
    async fn confident_match_is_answered_directly() {
        let (resolver, training, _) = resolver().await;
        training
            .train(
                "How do I reset my password?",
                "Click Forgot Password on the login page.",
                "account",
            )
            .await;

        match resolver
            .resolve("ticket-0001", "how do i reset my password")
            .await
        {
            Resolution::Direct { entry, score } => {
                assert_eq!(entry.answer, "Click Forgot Password on the login page.");
                assert!(score >= 0.85);
                let stored = training.get(entry.id).await.unwrap();
                assert_eq!(stored.usage_count, 1);
            }
            other => panic!("expected a direct answer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_match_needs_generation_with_empty_similar_list() {
        let (resolver, _, conversations) = resolver().await;
        conversations.create("ticket-0001", "42", "billing").await;
        conversations
            .append("ticket-0001", "42", "hello", false)
            .await;

        match resolver.resolve("ticket-0001", "anything at all").await {
            Resolution::NeedsGeneration(context) => {
                assert!(context.similar.is_empty());
                assert_eq!(context.history.len(), 1);
                assert_eq!(context.ticket.unwrap().status, TicketStatus::Open);
            }
            other => panic!("expected generation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn near_miss_is_passed_as_context() {
        let (resolver, training, _) = resolver().await;
        training
            .train("What are your opening hours?", "9-5", "general")
            .await;

        let options = ResolveOptions {
            match_threshold: 0.5,
            high_confidence_threshold: 0.99,
            history_limit: 10,
        };
        match resolver
            .resolve_with("ticket-0001", "what are your hours", options)
            .await
        {
            Resolution::NeedsGeneration(context) => {
                assert_eq!(context.similar.len(), 1);
                assert!(context.ticket.is_none());
                // usage untouched on the generation path
                assert_eq!(context.similar[0].entry.usage_count, 0);
            }
            other => panic!("expected generation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn respond_records_generated_answers() {
        let (resolver, _, conversations) = resolver().await;
        let generator = CannedGenerator::new(Some("Let me check that for you."));

        let reply = resolver
            .respond("ticket-0001", "42", "where is my order", "bot", &generator)
            .await
            .unwrap();
        assert_eq!(reply.source, ReplySource::Generated);

        let history = conversations.recent("ticket-0001", 10).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text, "where is my order");
        assert!(!history[0].machine_generated);
        assert_eq!(history[1].text, "Let me check that for you.");
        assert!(history[1].machine_generated);
        assert_eq!(generator.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn respond_uses_training_without_calling_generator() {
        let (resolver, training, conversations) = resolver().await;
        training.train("Refund policy?", "30 days.", "billing").await;
        let generator = CannedGenerator::new(Some("unused"));

        let reply = resolver
            .respond("ticket-0001", "42", "refund policy?", "bot", &generator)
            .await
            .unwrap();
        assert_eq!(reply.text, "30 days.");
        assert!(matches!(reply.source, ReplySource::Trained { .. }));
        assert!(generator.prompts.lock().unwrap().is_empty());
        assert_eq!(conversations.recent("ticket-0001", 10).await.len(), 2);
    }

    #[tokio::test]
    async fn respond_without_answer_writes_nothing() {
        let (resolver, _, conversations) = resolver().await;
        let generator = CannedGenerator::new(None);

        assert!(resolver
            .respond("ticket-0001", "42", "hello?", "bot", &generator)
            .await
            .is_none());
        assert!(conversations.recent("ticket-0001", 10).await.is_empty());
    }

    #[tokio::test]
    async fn generator_prompt_carries_the_query() {
        let (resolver, training, conversations) = resolver().await;
        training
            .train("What are your opening hours?", "9-5", "general")
            .await;
        conversations.create("ticket-0001", "42", "orders").await;
        conversations
            .append("ticket-0001", "42", "hi there", false)
            .await;
        let generator = CannedGenerator::new(Some("Checking now."));

        resolver
            .respond("ticket-0001", "42", "where is my order #991", "bot", &generator)
            .await
            .unwrap();

        let prompts = generator.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("where is my order #991"));
        assert!(prompts[0].contains("42: hi there"));
        assert!(prompts[0].ends_with("Question: where is my order #991\n"));
    }

    #[tokio::test]
    async fn direct_match_deleted_before_increment_still_answers() {
        let store = SqliteMemoryStore::in_memory().await.unwrap();
        let training = Arc::new(TrainingService::new(DeletedBeforeIncrement(store.clone())));
        let conversations = Arc::new(ConversationService::new(store));
        let resolver = QueryResolver::new(
            Arc::clone(&training),
            Arc::clone(&conversations),
            &MemoryConfig::default(),
        );
        training.train("Refund policy?", "30 days.", "billing").await;

        match resolver.resolve("ticket-0001", "refund policy?").await {
            Resolution::Direct { entry, .. } => {
                assert_eq!(entry.answer, "30 days.");
                assert_eq!(entry.usage_count, 0);
                assert!(training.get(entry.id).await.is_none());
            }
            other => panic!("expected a direct answer, got {other:?}"),
        }
        assert_eq!(resolver.stats().await.total_usage, 0);
    }

    #[tokio::test]
    async fn stats_combine_all_stores() {
        let (resolver, training, conversations) = resolver().await;
        training.train("a question", "an answer", "general").await;
        conversations.create("t1", "1", "general").await;
        conversations.create("t2", "2", "general").await;
        conversations.close("t2").await;
        resolver
            .record_exchange("t1", "1", "a question", "bot", "an answer")
            .await;

        let stats = resolver.stats().await;
        assert_eq!(stats.total_training_entries, 1);
        assert_eq!(stats.total_conversations, 2);
        assert_eq!(stats.open_tickets, 1);
    }

    #[test]
    fn render_lists_similar_then_history() {
        let context = GenerationContext {
            history: vec![message("42", "first", false), message("bot", "second", true)],
            ..Default::default()
        };

        let rendered = context.render(1000);
        assert_eq!(rendered, "Conversation:\n42: first\nassistant: second\n");
    }

    #[test]
    fn render_drops_oldest_history_first() {
        let context = GenerationContext {
            history: vec![
                message("42", "old message that is long", false),
                message("42", "new", false),
            ],
            ..Default::default()
        };

        let rendered = context.render(25);
        assert!(rendered.chars().count() <= 25);
        assert!(rendered.contains("42: new"));
        assert!(!rendered.contains("old message"));
    }

    #[test]
    fn render_of_empty_context_is_empty() {
        assert_eq!(GenerationContext::default().render(100), "");
        let context = GenerationContext {
            history: vec![message("42", "hi", false)],
            ..Default::default()
        };
        assert_eq!(context.render(0), "");
    }

    #[test]
    fn render_skips_header_of_section_with_nothing_that_fits() {
        let context = GenerationContext {
            history: vec![message("42", "hi", false)],
            similar: vec![scored(&"long question ".repeat(10), "long answer", 0.7)],
            ..Default::default()
        };

        // Exactly enough for the history section alone.
        let budget = "Conversation:\n42: hi\n".chars().count();
        assert_eq!(context.render(budget), "Conversation:\n42: hi\n");
    }

    #[test]
    fn render_keeps_question_when_budget_is_spent() {
        let context = GenerationContext {
            query: "  where is my order?  ".to_string(),
            history: vec![message("42", "hi", false)],
            ..Default::default()
        };

        assert_eq!(context.render(0), "Question: where is my order?\n");
        assert_eq!(
            context.render(1000),
            "Conversation:\n42: hi\nQuestion: where is my order?\n"
        );
    }
}
