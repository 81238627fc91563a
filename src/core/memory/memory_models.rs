use super::memory_store::MemoryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Category used when the caller doesn't supply one.
pub const DEFAULT_CATEGORY: &str = "general";

pub(crate) fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

// ============================================================================
// TRAINING DATA
// ============================================================================

/// One stored question -> answer pair usable as a direct response.
///
/// The question text is the uniqueness key (case-sensitive). Serialized field
/// names follow the `training_data` table (`query`/`response`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingEntry {
    pub id: i64,
    #[serde(rename = "query")]
    pub question: String,
    #[serde(rename = "response")]
    pub answer: String,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub usage_count: u64,
    /// Reserved for future weighting. Never computed.
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a caller provides when training. Everything else is owned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrainingEntry {
    pub question: String,
    pub answer: String,
    pub category: String,
    pub tags: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

impl NewTrainingEntry {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            category: default_category(),
            tags: Vec::new(),
            metadata: None,
        }
    }

    /// Blank categories fall back to [`DEFAULT_CATEGORY`].
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        let category = category.into();
        self.category = if category.trim().is_empty() {
            default_category()
        } else {
            category
        };
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Which ordering a listing should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOrder {
    /// `created_at` descending, for browsing.
    Newest,
    /// `usage_count` descending, for ranking.
    MostUsed,
}

/// A training entry paired with its similarity to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub entry: TrainingEntry,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainingStats {
    pub total_entries: u64,
    pub total_usage: u64,
}

// ============================================================================
// CONVERSATIONS / TICKETS
// ============================================================================

/// One message in a ticket's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: i64,
    pub ticket_id: String,
    pub author_id: String,
    pub text: String,
    pub machine_generated: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub ticket_id: String,
    pub author_id: String,
    pub text: String,
    pub machine_generated: bool,
}

/// Lifecycle state of a ticket. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Open,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(TicketStatus::Open),
            "closed" => Ok(TicketStatus::Closed),
            other => Err(format!("unknown ticket status: {other}")),
        }
    }
}

/// Lifecycle record for a ticket, distinct from its message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketContext {
    pub ticket_id: String,
    pub owner_id: String,
    pub category: String,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
    /// `None` while the ticket is open.
    pub closed_at: Option<DateTime<Utc>>,
}

impl TicketContext {
    pub fn is_open(&self) -> bool {
        self.status == TicketStatus::Open
    }
}

// ============================================================================
// NAMED KNOWLEDGE COLLECTIONS
// ============================================================================

/// A named, self-contained bundle of question/answer entries.
///
/// Persisted as one JSON document:
/// `{name, description, created_at, entries: [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeCollection {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: Vec<CollectionEntry>,
}

impl KnowledgeCollection {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            created_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    /// Case-insensitive lookup, matching the collection's uniqueness rule.
    pub fn contains_question(&self, question: &str) -> bool {
        let needle = question.to_lowercase();
        self.entries
            .iter()
            .any(|e| e.question.to_lowercase() == needle)
    }

    /// Next local id. Ids are only unique within one collection.
    pub fn next_id(&self) -> u64 {
        self.entries.iter().map(|e| e.id).max().unwrap_or(0) + 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub id: u64,
    #[serde(rename = "query")]
    pub question: String,
    #[serde(rename = "response")]
    pub answer: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
}

impl CollectionEntry {
    pub fn to_training_entry(&self) -> NewTrainingEntry {
        NewTrainingEntry::new(self.question.clone(), self.answer.clone())
            .with_category(self.category.clone())
            .with_tags(self.tags.clone())
    }
}

/// A collection entry paired with its similarity to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMatch {
    pub entry: CollectionEntry,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionStats {
    pub name: String,
    pub total_entries: usize,
    /// Entry count per category, sorted by category name.
    pub categories: BTreeMap<String, usize>,
    pub total_usage: u64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// IMPORT DOCUMENTS
// ============================================================================

/// One entry of an imported document. Only `query` and `response` are
/// required; ids are ignored and reassigned on import.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImportedEntry {
    #[serde(rename = "query")]
    pub question: String,
    #[serde(rename = "response")]
    pub answer: String,
    #[serde(default = "default_category", deserialize_with = "category_or_default")]
    pub category: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub usage_count: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

// Hand-edited documents often carry `null` for optional fields.
fn category_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let category: Option<String> = Option::deserialize(deserializer)?;
    Ok(category
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(default_category))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl ImportedEntry {
    pub fn to_training_entry(&self) -> NewTrainingEntry {
        NewTrainingEntry::new(self.question.clone(), self.answer.clone())
            .with_category(self.category.clone())
            .with_tags(self.tags.clone())
    }
}

/// A validated import: either a bare JSON array of entries or an object with
/// an `entries` array (optionally carrying `description`/`created_at`).
#[derive(Debug, Clone, PartialEq)]
pub struct ImportDocument {
    pub description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub entries: Vec<ImportedEntry>,
}

impl ImportDocument {
    /// Parse and validate the whole document up front so a bad entry
    /// rejects the import before anything is written.
    pub fn parse(raw: &str) -> Result<Self, MemoryError> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| MemoryError::MalformedImport(format!("not valid JSON: {e}")))?;

        let (entries, description, created_at) = match value {
            serde_json::Value::Array(_) => (value, None, None),
            serde_json::Value::Object(mut map) => {
                let entries = match map.remove("entries") {
                    Some(entries @ serde_json::Value::Array(_)) => entries,
                    _ => {
                        return Err(MemoryError::MalformedImport(
                            "document has no `entries` array".to_string(),
                        ))
                    }
                };
                let description = map
                    .get("description")
                    .and_then(|d| d.as_str())
                    .map(str::to_string);
                let created_at = map
                    .get("created_at")
                    .and_then(|c| c.as_str())
                    .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
                    .map(|c| c.with_timezone(&Utc));
                (entries, description, created_at)
            }
            _ => {
                return Err(MemoryError::MalformedImport(
                    "expected a JSON array or object".to_string(),
                ))
            }
        };

        let entries: Vec<ImportedEntry> = serde_json::from_value(entries)
            .map_err(|e| MemoryError::MalformedImport(format!("invalid entry: {e}")))?;

        if let Some(pos) = entries
            .iter()
            .position(|e| e.question.trim().is_empty() || e.answer.trim().is_empty())
        {
            return Err(MemoryError::MalformedImport(format!(
                "entry {pos} has an empty query or response"
            )));
        }

        Ok(Self {
            description,
            created_at,
            entries,
        })
    }
}

// ============================================================================
// OVERALL
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_training_entries: u64,
    pub total_conversations: u64,
    pub open_tickets: u64,
    pub total_usage: u64,
}
