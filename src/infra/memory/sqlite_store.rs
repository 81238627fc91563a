use crate::core::memory::{
    ConversationMessage, ConversationStore, ListOrder, MemoryError, NewMessage,
    NewTrainingEntry, TicketContext, TicketStatus, TicketStore, TrainingEntry, TrainingStats,
    TrainingStore,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// One writer at a time per logical store. Reads bypass these.
#[derive(Default)]
struct WriteLocks {
    training: Mutex<()>,
    history: Mutex<()>,
    tickets: Mutex<()>,
}

/// SQLite backing for training data, conversation history and ticket
/// contexts. Cheap to clone; clones share the pool and write locks.
#[derive(Clone)]
pub struct SqliteMemoryStore {
    pool: Pool<Sqlite>,
    locks: Arc<WriteLocks>,
}

impl SqliteMemoryStore {
    /// Open (creating if needed) the database file at `path` and run migrations.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        tracing::info!("Opened training database at {}", path.display());
        Self::with_pool(pool).await
    }

    /// A private in-memory database. Pinned to one connection, since every
    /// new connection to `:memory:` would see an empty database.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: Pool<Sqlite>) -> anyhow::Result<Self> {
        let store = Self {
            pool,
            locks: Arc::new(WriteLocks::default()),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS training_data (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                query TEXT NOT NULL UNIQUE,
                response TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'general',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 0,
                confidence REAL NOT NULL DEFAULT 1.0,
                tags TEXT NOT NULL DEFAULT '[]',
                metadata TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                message TEXT NOT NULL,
                response TEXT,
                is_ai_generated BOOLEAN NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                metadata TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ticket_context (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                category TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                created_at TEXT NOT NULL,
                closed_at TEXT,
                context TEXT,
                metadata TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_training_category ON training_data(category)",
            "CREATE INDEX IF NOT EXISTS idx_training_usage ON training_data(usage_count)",
            "CREATE INDEX IF NOT EXISTS idx_history_ticket ON conversation_history(ticket_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_ticket_status ON ticket_context(status)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Close the pool. Pending operations finish first.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Training database closed");
    }
}

fn storage(e: sqlx::Error) -> MemoryError {
    MemoryError::Storage(e.to_string())
}

// Fixed-width UTC text, so string order is time order.
fn to_db_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_db_time(raw: &str) -> Result<DateTime<Utc>, MemoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| MemoryError::Storage(format!("bad timestamp {raw:?}: {e}")))
}

fn training_entry_from_row(row: &SqliteRow) -> Result<TrainingEntry, MemoryError> {
    let tags: String = row.try_get("tags").map_err(storage)?;
    let metadata: Option<String> = row.try_get("metadata").map_err(storage)?;
    let created_at: String = row.try_get("created_at").map_err(storage)?;
    let updated_at: String = row.try_get("updated_at").map_err(storage)?;

    Ok(TrainingEntry {
        id: row.try_get("id").map_err(storage)?,
        question: row.try_get("query").map_err(storage)?,
        answer: row.try_get("response").map_err(storage)?,
        category: row.try_get("category").map_err(storage)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        usage_count: row.try_get::<i64, _>("usage_count").map_err(storage)?.max(0) as u64,
        confidence: row.try_get("confidence").map_err(storage)?,
        created_at: from_db_time(&created_at)?,
        updated_at: from_db_time(&updated_at)?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ConversationMessage, MemoryError> {
    let created_at: String = row.try_get("created_at").map_err(storage)?;

    Ok(ConversationMessage {
        id: row.try_get("id").map_err(storage)?,
        ticket_id: row.try_get("ticket_id").map_err(storage)?,
        author_id: row.try_get("user_id").map_err(storage)?,
        text: row.try_get("message").map_err(storage)?,
        machine_generated: row.try_get("is_ai_generated").map_err(storage)?,
        created_at: from_db_time(&created_at)?,
    })
}

fn ticket_from_row(row: &SqliteRow) -> Result<TicketContext, MemoryError> {
    let status: String = row.try_get("status").map_err(storage)?;
    let created_at: String = row.try_get("created_at").map_err(storage)?;
    let closed_at: Option<String> = row.try_get("closed_at").map_err(storage)?;

    Ok(TicketContext {
        ticket_id: row.try_get("ticket_id").map_err(storage)?,
        owner_id: row.try_get("user_id").map_err(storage)?,
        category: row.try_get("category").map_err(storage)?,
        status: TicketStatus::from_str(&status).map_err(MemoryError::Storage)?,
        created_at: from_db_time(&created_at)?,
        closed_at: closed_at.as_deref().map(from_db_time).transpose()?,
    })
}

const TRAINING_COLUMNS: &str = "id, query, response, category, created_at, updated_at, \
                                usage_count, confidence, tags, metadata";

#[async_trait]
impl TrainingStore for SqliteMemoryStore {
    async fn upsert_entry(
        &self,
        entry: &NewTrainingEntry,
        now: DateTime<Utc>,
    ) -> Result<(), MemoryError> {
        let tags = serde_json::to_string(&entry.tags)?;
        let metadata = entry
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = to_db_time(now);

        let _guard = self.locks.training.lock().await;

        // usage_count, id and created_at survive a replace
        sqlx::query(
            r#"
            INSERT INTO training_data (query, response, category, tags, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(query) DO UPDATE SET
                response = excluded.response,
                category = excluded.category,
                tags = excluded.tags,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.question)
        .bind(&entry.answer)
        .bind(&entry.category)
        .bind(tags)
        .bind(metadata)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn get_entry(&self, id: i64) -> Result<Option<TrainingEntry>, MemoryError> {
        let row = sqlx::query(&format!(
            "SELECT {TRAINING_COLUMNS} FROM training_data WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.as_ref().map(training_entry_from_row).transpose()
    }

    async fn find_by_question(
        &self,
        question: &str,
    ) -> Result<Option<TrainingEntry>, MemoryError> {
        let row = sqlx::query(&format!(
            "SELECT {TRAINING_COLUMNS} FROM training_data WHERE query = ?"
        ))
        .bind(question)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.as_ref().map(training_entry_from_row).transpose()
    }

    async fn list_entries(
        &self,
        category: Option<&str>,
        order: ListOrder,
    ) -> Result<Vec<TrainingEntry>, MemoryError> {
        let order_by = match order {
            ListOrder::Newest => "created_at DESC, id DESC",
            ListOrder::MostUsed => "usage_count DESC, id ASC",
        };

        let sql = match category {
            Some(_) => format!(
                "SELECT {TRAINING_COLUMNS} FROM training_data WHERE category = ? ORDER BY {order_by}"
            ),
            None => format!("SELECT {TRAINING_COLUMNS} FROM training_data ORDER BY {order_by}"),
        };

        let mut query = sqlx::query(&sql);
        if let Some(category) = category {
            query = query.bind(category);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(storage)?;

        rows.iter().map(training_entry_from_row).collect()
    }

    async fn delete_entry(&self, id: i64) -> Result<bool, MemoryError> {
        let _guard = self.locks.training.lock().await;

        let result = sqlx::query("DELETE FROM training_data WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        Ok(result.rows_affected() > 0)
    }

    async fn increment_usage(&self, id: i64) -> Result<bool, MemoryError> {
        let _guard = self.locks.training.lock().await;

        let result =
            sqlx::query("UPDATE training_data SET usage_count = usage_count + 1 WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(storage)?;

        Ok(result.rows_affected() > 0)
    }

    async fn training_stats(&self) -> Result<TrainingStats, MemoryError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(usage_count), 0) AS usage FROM training_data",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;

        let total: i64 = row.try_get("total").map_err(storage)?;
        let usage: i64 = row.try_get("usage").map_err(storage)?;

        Ok(TrainingStats {
            total_entries: total.max(0) as u64,
            total_usage: usage.max(0) as u64,
        })
    }
}

#[async_trait]
impl ConversationStore for SqliteMemoryStore {
    async fn append_message(
        &self,
        message: &NewMessage,
        now: DateTime<Utc>,
    ) -> Result<i64, MemoryError> {
        let _guard = self.locks.history.lock().await;

        let result = sqlx::query(
            r#"
            INSERT INTO conversation_history (ticket_id, user_id, message, is_ai_generated, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.ticket_id)
        .bind(&message.author_id)
        .bind(&message.text)
        .bind(message.machine_generated)
        .bind(to_db_time(now))
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.last_insert_rowid())
    }

    async fn recent_messages(
        &self,
        ticket_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, MemoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, ticket_id, user_id, message, is_ai_generated, created_at
            FROM conversation_history
            WHERE ticket_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(ticket_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(message_from_row).collect()
    }

    async fn count_messages(&self) -> Result<u64, MemoryError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversation_history")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;

        Ok(total.max(0) as u64)
    }
}

#[async_trait]
impl TicketStore for SqliteMemoryStore {
    async fn create_ticket(&self, context: &TicketContext) -> Result<bool, MemoryError> {
        let _guard = self.locks.tickets.lock().await;

        let result = sqlx::query(
            r#"
            INSERT INTO ticket_context (ticket_id, user_id, category, status, created_at, closed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(ticket_id) DO NOTHING
            "#,
        )
        .bind(&context.ticket_id)
        .bind(&context.owner_id)
        .bind(&context.category)
        .bind(context.status.as_str())
        .bind(to_db_time(context.created_at))
        .bind(context.closed_at.map(to_db_time))
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_ticket(&self, ticket_id: &str) -> Result<Option<TicketContext>, MemoryError> {
        let row = sqlx::query(
            r#"
            SELECT ticket_id, user_id, category, status, created_at, closed_at
            FROM ticket_context
            WHERE ticket_id = ?
            "#,
        )
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.as_ref().map(ticket_from_row).transpose()
    }

    async fn close_ticket(
        &self,
        ticket_id: &str,
        closed_at: DateTime<Utc>,
    ) -> Result<bool, MemoryError> {
        let _guard = self.locks.tickets.lock().await;

        let result = sqlx::query(
            "UPDATE ticket_context SET status = ?, closed_at = ? WHERE ticket_id = ?",
        )
        .bind(TicketStatus::Closed.as_str())
        .bind(to_db_time(closed_at))
        .bind(ticket_id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_open_tickets(&self) -> Result<u64, MemoryError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ticket_context WHERE status = ?")
            .bind(TicketStatus::Open.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;

        Ok(total.max(0) as u64)
    }
}
