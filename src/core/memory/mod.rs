pub mod conversation_service;
pub mod knowledge_service;
pub mod memory_config;
pub mod memory_models;
pub mod memory_store;
pub mod resolver;
pub mod similarity;
pub mod training_service;

pub use conversation_service::ConversationService;
pub use knowledge_service::{validate_collection_name, KnowledgeService, COLLECTION_MATCH_THRESHOLD};
pub use memory_config::MemoryConfig;
pub use memory_models::{
    CollectionEntry, CollectionMatch, CollectionStats, ConversationMessage, ImportDocument,
    ImportedEntry, KnowledgeCollection, ListOrder, MemoryStats, NewMessage, NewTrainingEntry,
    ScoredEntry, TicketContext, TicketStatus, TrainingEntry, TrainingStats, DEFAULT_CATEGORY,
};
pub use memory_store::{
    CollectionStore, ConversationStore, MemoryError, TicketStore, TrainingStore,
};
pub use resolver::{
    AnswerGenerator, GenerationContext, QueryResolver, Reply, ReplySource, Resolution,
    ResolveOptions,
};
pub use similarity::similarity;
pub use training_service::TrainingService;
