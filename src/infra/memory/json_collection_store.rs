use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::core::memory::{
    validate_collection_name, CollectionStore, KnowledgeCollection, MemoryError,
};

/// One pretty-printed JSON document per collection, `<dir>/<name>.json`.
///
/// Saves go through a temporary file and a rename, so a reader sees either
/// the old document or the new one.
pub struct JsonCollectionStore {
    dir: PathBuf,
}

impl JsonCollectionStore {
    pub async fn new(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        tracing::info!("Knowledge collections stored in {}", dir.display());
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, MemoryError> {
        validate_collection_name(name)?;
        Ok(self.dir.join(format!("{name}.json")))
    }
}

#[async_trait]
impl CollectionStore for JsonCollectionStore {
    async fn load(&self, name: &str) -> Result<Option<KnowledgeCollection>, MemoryError> {
        let path = self.path_for(name)?;

        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut collection: KnowledgeCollection = serde_json::from_str(&text)?;
        // The file name is the key, whatever the document says.
        collection.name = name.to_string();
        Ok(Some(collection))
    }

    async fn save(&self, collection: &KnowledgeCollection) -> Result<(), MemoryError> {
        let path = self.path_for(&collection.name)?;
        // Leading dot: never a valid collection name, so never listed.
        let tmp = self.dir.join(format!(".{}.json.tmp", collection.name));

        let text = serde_json::to_string_pretty(collection)?;
        fs::create_dir_all(&self.dir).await?;
        fs::write(&tmp, text).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list_names(&self) -> Result<Vec<String>, MemoryError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_collection_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    async fn remove(&self, name: &str) -> Result<bool, MemoryError> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
