// Training store service - the question/answer memory the bot answers from.
//
// Every operation here swallows storage errors: they are logged and turned
// into `false`/`None`/empty results. A broken training store must never stop
// a ticket from getting an answer through the generator fallback.

use super::memory_models::{
    ImportDocument, ListOrder, NewTrainingEntry, ScoredEntry, TrainingEntry, TrainingStats,
};
use super::memory_store::TrainingStore;
use super::similarity::similarity;
use chrono::Utc;
use serde::Serialize;

/// Default cap on distinct training questions.
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Shape of one item in a training export.
#[derive(Debug, Serialize)]
struct ExportedEntry<'a> {
    query: &'a str,
    response: &'a str,
    category: &'a str,
    tags: &'a [String],
    usage_count: u64,
}

pub struct TrainingService<S: TrainingStore> {
    store: S,
    max_entries: u64,
}

impl<S: TrainingStore> TrainingService<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    pub fn with_max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Insert a new entry or replace the answer/category/tags/metadata of the
    /// entry with the same question. Usage count is preserved on replace.
    ///
    /// Returns false when nothing was persisted: blank question or answer,
    /// the entry cap is reached for a new question, or a storage failure.
    /// Duplicates are never rejected.
    pub async fn upsert(&self, entry: NewTrainingEntry) -> bool {
        if entry.question.trim().is_empty() || entry.answer.trim().is_empty() {
            tracing::warn!("Refusing to train an empty question or answer");
            return false;
        }

        match self.store.find_by_question(&entry.question).await {
            Ok(Some(_)) => {}
            Ok(None) => match self.store.training_stats().await {
                Ok(stats) if stats.total_entries >= self.max_entries => {
                    tracing::warn!(
                        max_entries = self.max_entries,
                        "Training store is full, not adding {:?}",
                        entry.question
                    );
                    return false;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("Failed to count training entries: {}", e);
                    return false;
                }
            },
            Err(e) => {
                tracing::error!("Failed to look up training entry: {}", e);
                return false;
            }
        }

        match self.store.upsert_entry(&entry, Utc::now()).await {
            Ok(()) => {
                tracing::info!(category = %entry.category, "Trained: {}", entry.question);
                true
            }
            Err(e) => {
                tracing::error!("Error adding training data: {}", e);
                false
            }
        }
    }

    /// Convenience wrapper around [`upsert`](Self::upsert).
    pub async fn train(&self, question: &str, answer: &str, category: &str) -> bool {
        self.upsert(NewTrainingEntry::new(question, answer).with_category(category))
            .await
    }

    pub async fn get(&self, id: i64) -> Option<TrainingEntry> {
        self.store.get_entry(id).await.unwrap_or_else(|e| {
            tracing::error!("Failed to load training entry {}: {}", id, e);
            None
        })
    }

    /// Exact, case-sensitive lookup.
    pub async fn find_by_question(&self, question: &str) -> Option<TrainingEntry> {
        self.store
            .find_by_question(question)
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Failed to look up training entry: {}", e);
                None
            })
    }

    pub async fn list(&self, category: Option<&str>, order: ListOrder) -> Vec<TrainingEntry> {
        self.store
            .list_entries(category, order)
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Failed to list training entries: {}", e);
                Vec::new()
            })
    }

    /// Returns false if the id doesn't exist or the delete failed.
    pub async fn delete(&self, id: i64) -> bool {
        match self.store.delete_entry(id).await {
            Ok(true) => {
                tracing::info!("Deleted training entry {}", id);
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::error!("Error deleting training entry {}: {}", id, e);
                false
            }
        }
    }

    /// Silent no-op for an unknown id (it may have been deleted concurrently).
    pub async fn increment_usage(&self, id: i64) {
        match self.store.increment_usage(id).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("Usage increment for missing entry {}", id),
            Err(e) => tracing::error!("Failed to increment usage for {}: {}", id, e),
        }
    }

    /// Entries whose question scores at least `threshold` against `query`,
    /// best first, at most `limit`.
    ///
    /// This is a linear scan over every entry. Equal scores keep the
    /// more-used entry first.
    pub async fn find_similar(&self, query: &str, threshold: f64, limit: usize) -> Vec<ScoredEntry> {
        if limit == 0 {
            return Vec::new();
        }

        let entries = self.list(None, ListOrder::MostUsed).await;

        let mut matches: Vec<ScoredEntry> = entries
            .into_iter()
            .filter_map(|entry| {
                let score = similarity(query, &entry.question);
                (score >= threshold).then_some(ScoredEntry { entry, score })
            })
            .collect();

        // Stable sort, so the usage ordering survives among ties.
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(limit);

        if let Some(best) = matches.first() {
            tracing::debug!(score = best.score, "Best training match: {}", best.entry.question);
        }

        matches
    }

    pub async fn stats(&self) -> TrainingStats {
        self.store.training_stats().await.unwrap_or_else(|e| {
            tracing::error!("Failed to load training stats: {}", e);
            TrainingStats::default()
        })
    }

    /// Every entry as a pretty JSON array, most used first.
    pub async fn export_training(&self) -> Option<String> {
        let entries = match self.store.list_entries(None, ListOrder::MostUsed).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!("Failed to export training data: {}", e);
                return None;
            }
        };

        let exported: Vec<ExportedEntry<'_>> = entries
            .iter()
            .map(|e| ExportedEntry {
                query: &e.question,
                response: &e.answer,
                category: &e.category,
                tags: &e.tags,
                usage_count: e.usage_count,
            })
            .collect();

        match serde_json::to_string_pretty(&exported) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!("Failed to serialize training export: {}", e);
                None
            }
        }
    }

    /// Re-apply every entry of `document` through [`upsert`](Self::upsert).
    ///
    /// The whole document is validated first; a malformed one returns `None`
    /// without writing anything. Otherwise returns how many entries were
    /// persisted.
    pub async fn import_training(&self, document: &str) -> Option<usize> {
        let document = match ImportDocument::parse(document) {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!("Rejected training import: {}", e);
                return None;
            }
        };

        let mut imported = 0;
        for entry in &document.entries {
            if self.upsert(entry.to_training_entry()).await {
                imported += 1;
            }
        }

        tracing::info!("Imported {} training entries", imported);
        Some(imported)
    }
}
