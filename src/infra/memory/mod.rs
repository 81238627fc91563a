pub mod in_memory;
pub mod json_collection_store;
pub mod sqlite_store;

pub use in_memory::InMemoryCollectionStore;
pub use json_collection_store::JsonCollectionStore;
pub use sqlite_store::SqliteMemoryStore;
