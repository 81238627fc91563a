// In-memory collection store, for tests and deployments that don't need
// collections to survive a restart.

use crate::core::memory::{CollectionStore, KnowledgeCollection, MemoryError};
use async_trait::async_trait;
use dashmap::DashMap;

/// DashMap-backed [`CollectionStore`]. Documents are cloned in and out, so
/// callers never hold a reference into the map.
#[derive(Default)]
pub struct InMemoryCollectionStore {
    /// Collection name -> document
    collections: DashMap<String, KnowledgeCollection>,
}

impl InMemoryCollectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CollectionStore for InMemoryCollectionStore {
    async fn load(&self, name: &str) -> Result<Option<KnowledgeCollection>, MemoryError> {
        Ok(self.collections.get(name).map(|c| c.value().clone()))
    }

    async fn save(&self, collection: &KnowledgeCollection) -> Result<(), MemoryError> {
        self.collections
            .insert(collection.name.clone(), collection.clone());
        Ok(())
    }

    async fn list_names(&self) -> Result<Vec<String>, MemoryError> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn remove(&self, name: &str) -> Result<bool, MemoryError> {
        Ok(self.collections.remove(name).is_some())
    }
}
