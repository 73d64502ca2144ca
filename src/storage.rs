use crate::error::ChatError;
use crate::models::{Conversation, Message, Role, ASSISTANT_STUB, DEFAULT_TITLE};
use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Longest message body the store accepts, in characters.
pub const MAX_CONTENT_CHARS: usize = 32_000;
/// Longest conversation title the store accepts, in characters.
pub const MAX_TITLE_CHARS: usize = 200;

const INTERRUPTED_SUFFIX: &str = "\n\n[Response interrupted]";
const INTERRUPTED_EMPTY: &str = "[Response interrupted before any content was generated]";

// Define the database schema using CREATE TABLE IF NOT EXISTS statements
const MIGRATIONS_SQL: &str = "
-- Conversations Table
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    owner TEXT NOT NULL,
    title TEXT NOT NULL,
    created_at INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
    updated_at INTEGER NOT NULL -- Unix Timestamp (milliseconds)
);
CREATE INDEX IF NOT EXISTS idx_conversations_owner ON conversations(owner, updated_at);

-- Messages Table
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL, -- 'user' or 'assistant'
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
    is_complete INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts ON messages(conversation_id, timestamp);
";

/// Result of `update_message_content`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The stored message already had exactly this content and completion.
    Unchanged,
}

#[derive(Debug)]
pub struct StorageManager {
    pool: SqlitePool,
    // Serializes writes per message id (updates) and per conversation id (appends)
    write_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl StorageManager {
    /// Opens (creating if needed) the database file at `db_path` and runs migrations.
    pub async fn new(db_path: &Path) -> Result<Self, anyhow::Error> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        log::info!("Connecting to database: {}", db_url);

        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(&db_url)
                .await
                .context("Failed to create database")?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::from_pool(pool).await
    }

    /// A private in-memory database. The pool is pinned to one connection
    /// that never expires, since the data lives and dies with it.
    pub async fn in_memory() -> Result<Self, anyhow::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, anyhow::Error> {
        Self::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            write_locks: DashMap::new(),
        })
    }

    /// Applies the database schema migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    /// Creates a conversation owned by `owner`. A blank title becomes the default one.
    pub async fn create_conversation(
        &self,
        owner: &str,
        title: Option<&str>,
    ) -> Result<Conversation, ChatError> {
        validate_owner(owner)?;
        let title = match title.map(str::trim) {
            Some(t) if !t.is_empty() => validate_title(t)?.to_string(),
            _ => DEFAULT_TITLE.to_string(),
        };
        log::info!("Creating new conversation for {}", owner);

        let now = now_millis();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            title,
            created_at: millis_to_datetime(now)?,
            updated_at: millis_to_datetime(now)?,
        };

        sqlx::query(
            r#"
            INSERT INTO conversations (id, owner, title, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(conversation.id.to_string())
        .bind(&conversation.owner)
        .bind(&conversation.title)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        log::info!("Successfully created conversation with ID: {}", conversation.id);
        Ok(conversation)
    }

    /// Conversations of `owner`, most recently updated first. Unknown owners get an empty list.
    pub async fn list_conversations(&self, owner: &str) -> Result<Vec<Conversation>, ChatError> {
        log::debug!("Fetching conversations for {}", owner);
        let rows = sqlx::query(
            r#"
            SELECT id, owner, title, created_at, updated_at
            FROM conversations
            WHERE owner = ?
            ORDER BY updated_at DESC, created_at DESC
            "#,
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        let conversations = rows
            .iter()
            .map(conversation_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        log::info!("Fetched {} conversations for {}", conversations.len(), owner);
        Ok(conversations)
    }

    /// Fetches one conversation, failing with `NotFound` unless `owner` owns it.
    pub async fn get_conversation(
        &self,
        owner: &str,
        conversation_id: Uuid,
    ) -> Result<Conversation, ChatError> {
        let row = sqlx::query(
            r#"
            SELECT id, owner, title, created_at, updated_at
            FROM conversations
            WHERE id = ? AND owner = ?
            "#,
        )
        .bind(conversation_id.to_string())
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => conversation_from_row(&r),
            None => Err(ChatError::conversation_not_found(conversation_id)),
        }
    }

    /// Appends a message. User messages are stored complete; assistant messages
    /// start incomplete, with the stub text when `content` is blank.
    /// Timestamps strictly increase within a conversation.
    pub async fn append_message(
        &self,
        owner: &str,
        conversation_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<Message, ChatError> {
        let (content, is_complete) = match role {
            Role::User => {
                if content.trim().is_empty() {
                    return Err(ChatError::Validation("message content is empty".into()));
                }
                (content.to_string(), true)
            }
            Role::Assistant if content.trim().is_empty() => (ASSISTANT_STUB.to_string(), false),
            Role::Assistant => (content.to_string(), false),
        };
        validate_content_len(&content)?;
        self.get_conversation(owner, conversation_id).await?;

        let lock = self.write_lock(conversation_id);
        let guard = lock.lock().await;
        let result = self
            .insert_message(conversation_id, role, content, is_complete)
            .await;
        drop(guard);
        self.release_write_lock(conversation_id, lock);

        let message = result?;
        log::info!(
            "Saved {} message {} in conversation {}",
            message.role,
            message.id,
            conversation_id
        );
        Ok(message)
    }

    async fn insert_message(
        &self,
        conversation_id: Uuid,
        role: Role,
        content: String,
        is_complete: bool,
    ) -> Result<Message, ChatError> {
        let conversation_id_text = conversation_id.to_string();
        let last: Option<i64> =
            sqlx::query_scalar("SELECT MAX(timestamp) FROM messages WHERE conversation_id = ?")
                .bind(&conversation_id_text)
                .fetch_one(&self.pool)
                .await?;
        let ts = match last {
            Some(last) => now_millis().max(last + 1),
            None => now_millis(),
        };

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            role,
            content,
            timestamp: millis_to_datetime(ts)?,
            is_complete,
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, timestamp, is_complete)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.id.to_string())
        .bind(&conversation_id_text)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(ts)
        .bind(message.is_complete)
        .execute(&self.pool)
        .await?;

        self.touch_conversation(&conversation_id_text, ts).await?;
        Ok(message)
    }

    /// Overwrites a message's content and completion flag.
    ///
    /// Re-applying the stored `(content, is_complete)` pair is a no-op reported
    /// as `Unchanged`. Once a message is complete it is frozen: any further
    /// change (including `is_complete = false`) fails with `Conflict` and the
    /// stored state is kept. Unknown messages are a `Conflict` as well.
    pub async fn update_message_content(
        &self,
        owner: &str,
        message_id: Uuid,
        conversation_id: Uuid,
        content: &str,
        is_complete: bool,
    ) -> Result<UpdateOutcome, ChatError> {
        validate_content_len(content)?;
        self.get_conversation(owner, conversation_id).await?;

        let lock = self.write_lock(message_id);
        let guard = lock.lock().await;
        let result = self
            .apply_content_update(message_id, conversation_id, content, is_complete)
            .await;
        drop(guard);
        self.release_write_lock(message_id, lock);
        result
    }

    async fn apply_content_update(
        &self,
        message_id: Uuid,
        conversation_id: Uuid,
        content: &str,
        is_complete: bool,
    ) -> Result<UpdateOutcome, ChatError> {
        let message_id_text = message_id.to_string();
        let conversation_id_text = conversation_id.to_string();

        let current = sqlx::query(
            "SELECT content, is_complete FROM messages WHERE id = ? AND conversation_id = ?",
        )
        .bind(&message_id_text)
        .bind(&conversation_id_text)
        .fetch_optional(&self.pool)
        .await?;

        let Some(current) = current else {
            return Err(ChatError::Conflict(format!(
                "message {} does not exist in conversation {}",
                message_id, conversation_id
            )));
        };
        let stored_content: String = current.try_get("content")?;
        let stored_complete: bool = current.try_get("is_complete")?;

        if stored_content == content && stored_complete == is_complete {
            log::debug!("Update for message {} is a no-op", message_id);
            return Ok(UpdateOutcome::Unchanged);
        }
        if stored_complete {
            log::warn!("Rejected update to completed message {}", message_id);
            return Err(ChatError::Conflict(format!(
                "message {} is already complete",
                message_id
            )));
        }

        sqlx::query("UPDATE messages SET content = ?, is_complete = ? WHERE id = ?")
            .bind(content)
            .bind(is_complete)
            .bind(&message_id_text)
            .execute(&self.pool)
            .await?;
        self.touch_conversation(&conversation_id_text, now_millis())
            .await?;

        log::debug!(
            "Updated message {} ({} chars, complete: {})",
            message_id,
            content.len(),
            is_complete
        );
        Ok(UpdateOutcome::Applied)
    }

    /// Fetches all messages for a conversation, ordered by timestamp ascending.
    pub async fn get_messages(
        &self,
        owner: &str,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, ChatError> {
        self.get_conversation(owner, conversation_id).await?;
        log::debug!("Fetching messages for conversation ID: {}", conversation_id);

        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, role, content, timestamp, is_complete
            FROM messages
            WHERE conversation_id = ?
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!(
            "Fetched {} messages for conversation {}",
            messages.len(),
            conversation_id
        );
        Ok(messages)
    }

    /// Renames a conversation.
    pub async fn rename_conversation(
        &self,
        owner: &str,
        conversation_id: Uuid,
        new_title: &str,
    ) -> Result<(), ChatError> {
        let new_title = new_title.trim();
        if new_title.is_empty() {
            return Err(ChatError::Validation("title cannot be empty".into()));
        }
        validate_title(new_title)?;
        log::info!("Renaming conversation {} to: {}", conversation_id, new_title);

        let result = sqlx::query(
            "UPDATE conversations SET title = ?, updated_at = MAX(updated_at, ?) WHERE id = ? AND owner = ?",
        )
        .bind(new_title)
        .bind(now_millis())
        .bind(conversation_id.to_string())
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to rename unknown conversation: {}", conversation_id);
            return Err(ChatError::conversation_not_found(conversation_id));
        }
        Ok(())
    }

    /// Deletes a conversation and, through the cascade, its messages.
    pub async fn delete_conversation(
        &self,
        owner: &str,
        conversation_id: Uuid,
    ) -> Result<(), ChatError> {
        log::warn!("Deleting conversation with ID: {}", conversation_id);
        let result = sqlx::query("DELETE FROM conversations WHERE id = ? AND owner = ?")
            .bind(conversation_id.to_string())
            .bind(owner)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to delete unknown conversation: {}", conversation_id);
            return Err(ChatError::conversation_not_found(conversation_id));
        }
        // Messages may be left behind if foreign keys are disabled on the connection
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Moves every assistant message still marked incomplete into a terminal,
    /// annotated state. Meant to run at startup, when no stream can be live.
    pub async fn recover_interrupted_messages(&self) -> Result<usize, ChatError> {
        let rows = sqlx::query(
            "SELECT id, content FROM messages WHERE is_complete = 0 AND role = 'assistant'",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let id: String = row.try_get("id")?;
            let content: String = row.try_get("content")?;
            let recovered = if content.trim().is_empty() || content == ASSISTANT_STUB {
                INTERRUPTED_EMPTY.to_string()
            } else {
                format!("{}{}", content, INTERRUPTED_SUFFIX)
            };
            sqlx::query("UPDATE messages SET content = ?, is_complete = 1 WHERE id = ? AND is_complete = 0")
                .bind(recovered)
                .bind(&id)
                .execute(&self.pool)
                .await?;
        }

        if !rows.is_empty() {
            log::warn!("Recovered {} interrupted assistant messages", rows.len());
        }
        Ok(rows.len())
    }

    async fn touch_conversation(&self, conversation_id: &str, ts: i64) -> Result<(), ChatError> {
        sqlx::query("UPDATE conversations SET updated_at = MAX(updated_at, ?) WHERE id = ?")
            .bind(ts)
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn write_lock(&self, key: Uuid) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_write_lock(&self, key: Uuid, lock: Arc<Mutex<()>>) {
        drop(lock);
        // Only the map still holds it: nobody is waiting
        self.write_locks
            .remove_if(&key, |_, l| Arc::strong_count(l) == 1);
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn validate_owner(owner: &str) -> Result<(), ChatError> {
    if owner.trim().is_empty() {
        return Err(ChatError::Validation("owner identity is empty".into()));
    }
    Ok(())
}

fn validate_title(title: &str) -> Result<&str, ChatError> {
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ChatError::Validation(format!(
            "title longer than {} characters",
            MAX_TITLE_CHARS
        )));
    }
    Ok(title)
}

fn validate_content_len(content: &str) -> Result<(), ChatError> {
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ChatError::Validation(format!(
            "content longer than {} characters",
            MAX_CONTENT_CHARS
        )));
    }
    Ok(())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, ChatError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| ChatError::Database(sqlx::Error::Decode(format!("invalid timestamp {}", ms).into())))
}

fn parse_uuid(text: &str) -> Result<Uuid, ChatError> {
    Uuid::parse_str(text).map_err(|e| ChatError::Database(sqlx::Error::Decode(Box::new(e))))
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation, ChatError> {
    let id: String = row.try_get("id")?;
    Ok(Conversation {
        id: parse_uuid(&id)?,
        owner: row.try_get("owner")?,
        title: row.try_get("title")?,
        created_at: millis_to_datetime(row.try_get("created_at")?)?,
        updated_at: millis_to_datetime(row.try_get("updated_at")?)?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message, ChatError> {
    let id: String = row.try_get("id")?;
    let conversation_id: String = row.try_get("conversation_id")?;
    let role: String = row.try_get("role")?;
    Ok(Message {
        id: parse_uuid(&id)?,
        conversation_id: parse_uuid(&conversation_id)?,
        role: role
            .parse()
            .map_err(|e: String| ChatError::Database(sqlx::Error::Decode(e.into())))?,
        content: row.try_get("content")?,
        timestamp: millis_to_datetime(row.try_get("timestamp")?)?,
        is_complete: row.try_get("is_complete")?,
    })
}
