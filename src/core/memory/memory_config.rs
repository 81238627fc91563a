use super::memory_store::MemoryError;
use std::path::PathBuf;
use std::str::FromStr;

/// Tunables for the memory layer.
///
/// Read once at startup (after `.env` is loaded) and passed to the services
/// that need it.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    /// SQLite file holding training data, history and ticket contexts.
    pub database_path: PathBuf,
    /// Directory with one JSON document per named collection.
    pub knowledge_dir: PathBuf,
    /// Minimum similarity for a training entry to count as a match.
    pub similarity_threshold: f64,
    /// Minimum similarity for a stored answer to be used without generation.
    pub high_confidence_threshold: f64,
    /// How many history messages the resolver hands to the generator.
    pub history_limit: usize,
    /// Cap on distinct training questions.
    pub max_training_entries: u64,
    /// Character budget for rendered generation context.
    pub max_context_length: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/training.db"),
            knowledge_dir: PathBuf::from("data/knowledge"),
            similarity_threshold: 0.7,
            high_confidence_threshold: 0.85,
            history_limit: 10,
            max_training_entries: 10_000,
            max_context_length: 2000,
        }
    }
}

impl MemoryConfig {
    /// Build a config from environment variables, falling back to defaults
    /// for anything missing or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_path: std::env::var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            knowledge_dir: std::env::var("KNOWLEDGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.knowledge_dir),
            similarity_threshold: env_or("SIMILARITY_THRESHOLD", defaults.similarity_threshold),
            high_confidence_threshold: env_or(
                "HIGH_CONFIDENCE_THRESHOLD",
                defaults.high_confidence_threshold,
            ),
            history_limit: env_or("MAX_HISTORY", defaults.history_limit),
            max_training_entries: env_or("MAX_TRAINING_ENTRIES", defaults.max_training_entries),
            max_context_length: env_or("MAX_CONTEXT_LENGTH", defaults.max_context_length),
        }
    }

    pub fn validate(&self) -> Result<(), MemoryError> {
        for (name, value) in [
            ("similarity_threshold", self.similarity_threshold),
            ("high_confidence_threshold", self.high_confidence_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MemoryError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }

        if self.similarity_threshold > self.high_confidence_threshold {
            return Err(MemoryError::InvalidConfig(format!(
                "similarity_threshold ({}) exceeds high_confidence_threshold ({})",
                self.similarity_threshold, self.high_confidence_threshold
            )));
        }

        if self.max_training_entries == 0 {
            return Err(MemoryError::InvalidConfig(
                "max_training_entries must be at least 1".to_string(),
            ));
        }

        if self.history_limit == 0 {
            return Err(MemoryError::InvalidConfig(
                "history_limit must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring unparseable {}={:?}, using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}
