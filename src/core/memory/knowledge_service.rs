// Named knowledge collections.
//
// A collection is an independently named bundle of Q&A entries that can be
// exported and imported as one JSON document. Everything added to a
// collection is mirrored into the global training store, so the normal
// query path finds it too.
//
// Every mutation is a whole-document read-modify-write, serialized per
// collection name.

use super::memory_models::{
    CollectionEntry, CollectionMatch, CollectionStats, ImportDocument, KnowledgeCollection,
    NewTrainingEntry,
};
use super::memory_store::{CollectionStore, MemoryError, TrainingStore};
use super::similarity::similarity;
use super::training_service::TrainingService;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Minimum similarity for a collection search hit.
pub const COLLECTION_MATCH_THRESHOLD: f64 = 0.5;

/// Collection names double as storage keys (file stems), so keep them to
/// something that can't escape the collection directory.
pub fn validate_collection_name(name: &str) -> Result<(), MemoryError> {
    let invalid = name.trim().is_empty()
        || name.starts_with('.')
        || name.contains("..")
        || name.contains(['/', '\\', ':'])
        || name.chars().any(char::is_control);

    if invalid {
        Err(MemoryError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

pub struct KnowledgeService<C: CollectionStore, T: TrainingStore> {
    store: C,
    training: Arc<TrainingService<T>>,
    // Collection name -> writer lock for its document
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<C: CollectionStore, T: TrainingStore> KnowledgeService<C, T> {
    pub fn new(store: C, training: Arc<TrainingService<T>>) -> Self {
        Self {
            store,
            training,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn check_name(name: &str) -> bool {
        match validate_collection_name(name) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("{}", e);
                false
            }
        }
    }

    /// Create an empty collection. Fails if the name is taken.
    pub async fn create(&self, name: &str, description: &str) -> bool {
        if !Self::check_name(name) {
            return false;
        }

        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        match self.store.load(name).await {
            Ok(Some(_)) => {
                tracing::warn!("Knowledge base {} already exists", name);
                return false;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Error creating knowledge base {}: {}", name, e);
                return false;
            }
        }

        match self
            .store
            .save(&KnowledgeCollection::new(name, description))
            .await
        {
            Ok(()) => {
                tracing::info!("Created knowledge base: {}", name);
                true
            }
            Err(e) => {
                tracing::error!("Error creating knowledge base {}: {}", name, e);
                false
            }
        }
    }

    /// Add one entry to an existing collection and mirror it into the
    /// training store.
    ///
    /// Fails if the collection is missing or already holds the question
    /// (compared case-insensitively).
    pub async fn add_entry(
        &self,
        name: &str,
        question: &str,
        answer: &str,
        category: &str,
        tags: Vec<String>,
    ) -> bool {
        if !Self::check_name(name) {
            return false;
        }
        if question.trim().is_empty() || answer.trim().is_empty() {
            tracing::warn!("Refusing empty entry for knowledge base {}", name);
            return false;
        }

        let training_entry = NewTrainingEntry::new(question, answer)
            .with_category(category)
            .with_tags(tags);

        {
            let lock = self.lock_for(name);
            let _guard = lock.lock().await;

            let mut collection = match self.store.load(name).await {
                Ok(Some(collection)) => collection,
                Ok(None) => {
                    tracing::warn!("Knowledge base {} not found", name);
                    return false;
                }
                Err(e) => {
                    tracing::error!("Error adding to knowledge base {}: {}", name, e);
                    return false;
                }
            };

            if collection.contains_question(question) {
                tracing::warn!("Duplicate entry in {}: {}", name, question);
                return false;
            }

            collection.entries.push(CollectionEntry {
                id: collection.next_id(),
                question: training_entry.question.clone(),
                answer: training_entry.answer.clone(),
                category: training_entry.category.clone(),
                tags: training_entry.tags.clone(),
                created_at: Utc::now(),
                usage_count: 0,
            });

            if let Err(e) = self.store.save(&collection).await {
                tracing::error!("Error adding to knowledge base {}: {}", name, e);
                return false;
            }
        }

        if !self.training.upsert(training_entry).await {
            tracing::warn!("Entry added to {} but not mirrored into training data", name);
        }

        tracing::info!("Added entry to {}: {}", name, question);
        true
    }

    pub async fn get(&self, name: &str) -> Option<KnowledgeCollection> {
        if validate_collection_name(name).is_err() {
            return None;
        }

        self.store.load(name).await.unwrap_or_else(|e| {
            tracing::error!("Error reading knowledge base {}: {}", name, e);
            None
        })
    }

    /// Names of all collections, sorted.
    pub async fn list(&self) -> Vec<String> {
        self.store.list_names().await.unwrap_or_else(|e| {
            tracing::error!("Error listing knowledge bases: {}", e);
            Vec::new()
        })
    }

    /// Entries of one collection scoring at least
    /// [`COLLECTION_MATCH_THRESHOLD`] against `query`, best first.
    pub async fn search(&self, name: &str, query: &str, limit: usize) -> Vec<CollectionMatch> {
        let Some(collection) = self.get(name).await else {
            return Vec::new();
        };

        let mut matches: Vec<CollectionMatch> = collection
            .entries
            .into_iter()
            .filter_map(|entry| {
                let score = similarity(query, &entry.question);
                (score >= COLLECTION_MATCH_THRESHOLD).then_some(CollectionMatch { entry, score })
            })
            .collect();

        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(limit);
        matches
    }

    /// The collection as a self-contained JSON document.
    pub async fn export(&self, name: &str) -> Option<String> {
        let collection = self.get(name).await?;
        match serde_json::to_string_pretty(&collection) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!("Error exporting knowledge base {}: {}", name, e);
                None
            }
        }
    }

    /// Store `document` as the collection `name`, replacing any existing
    /// collection of that name, and upsert every entry into training data.
    ///
    /// The document needs an `entries` array whose items carry `query` and
    /// `response`; anything else is rejected before writing. Entry ids are
    /// renumbered, and entries repeating a question (ignoring case) collapse
    /// into the last one.
    pub async fn import(&self, name: &str, document: &str) -> bool {
        if !Self::check_name(name) {
            return false;
        }

        let document = match ImportDocument::parse(document) {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!("Rejected import into {}: {}", name, e);
                return false;
            }
        };

        let now = Utc::now();
        let mut collection = KnowledgeCollection {
            name: name.to_string(),
            description: document.description.clone().unwrap_or_default(),
            created_at: document.created_at.unwrap_or(now),
            entries: Vec::with_capacity(document.entries.len()),
        };

        for imported in &document.entries {
            let entry = CollectionEntry {
                id: 0,
                question: imported.question.clone(),
                answer: imported.answer.clone(),
                category: imported.category.clone(),
                tags: imported.tags.clone(),
                created_at: imported.created_at.unwrap_or(now),
                usage_count: imported.usage_count,
            };

            let needle = entry.question.to_lowercase();
            match collection
                .entries
                .iter_mut()
                .find(|e| e.question.to_lowercase() == needle)
            {
                Some(existing) => *existing = entry,
                None => collection.entries.push(entry),
            }
        }

        for (idx, entry) in collection.entries.iter_mut().enumerate() {
            entry.id = idx as u64 + 1;
        }

        {
            let lock = self.lock_for(name);
            let _guard = lock.lock().await;

            if let Err(e) = self.store.save(&collection).await {
                tracing::error!("Error importing knowledge base {}: {}", name, e);
                return false;
            }
        }

        // Mirror what was stored, after duplicates collapsed, so training
        // data never keeps an answer the collection replaced.
        let mut mirrored = 0;
        for entry in &collection.entries {
            if self.training.upsert(entry.to_training_entry()).await {
                mirrored += 1;
            }
        }
        if mirrored < collection.entries.len() {
            tracing::warn!(
                "Imported {} but only {} of {} entries reached training data",
                name,
                mirrored,
                collection.entries.len()
            );
        }

        tracing::info!(
            entries = collection.entries.len(),
            "Imported knowledge base {}",
            name
        );
        true
    }

    /// Write the export of `name` to `path`, creating parent directories.
    pub async fn export_to_file(&self, name: &str, path: impl AsRef<Path>) -> Option<PathBuf> {
        let path = path.as_ref();
        let json = self.export(name).await?;

        let written: Result<(), MemoryError> = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, json).await?;
            Ok::<(), MemoryError>(())
        }
        .await;

        match written {
            Ok(()) => {
                tracing::info!("Exported knowledge base {} to {}", name, path.display());
                Some(path.to_path_buf())
            }
            Err(e) => {
                tracing::error!("Error exporting knowledge base {}: {}", name, e);
                None
            }
        }
    }

    /// [`import`](Self::import) from a file on disk.
    pub async fn import_from_file(&self, name: &str, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(document) => self.import(name, &document).await,
            Err(e) => {
                tracing::warn!("Import file {} unreadable: {}", path.display(), e);
                false
            }
        }
    }

    pub async fn stats(&self, name: &str) -> Option<CollectionStats> {
        let collection = self.get(name).await?;

        let mut categories = BTreeMap::new();
        let mut total_usage = 0;
        for entry in &collection.entries {
            *categories.entry(entry.category.clone()).or_insert(0) += 1;
            total_usage += entry.usage_count;
        }

        Some(CollectionStats {
            name: collection.name,
            total_entries: collection.entries.len(),
            categories,
            total_usage,
            created_at: collection.created_at,
        })
    }

    /// Returns false if the collection doesn't exist.
    ///
    /// Entries already mirrored into training data stay there.
    pub async fn delete(&self, name: &str) -> bool {
        if !Self::check_name(name) {
            return false;
        }

        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        match self.store.remove(name).await {
            Ok(true) => {
                tracing::info!("Deleted knowledge base: {}", name);
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::error!("Error deleting knowledge base {}: {}", name, e);
                false
            }
        }
    }
}
