//! SQLite-backed chat store.

use super::traits::{ChatConfig, ChatMessage, ChatStore, ModelRecord, Role, SemanticSpaceConfig};
use crate::error::{Error, Result};
use crate::runtime::ModelType;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS chats (
    chat_id     TEXT PRIMARY KEY,
    title       TEXT,
    chat_config TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chat_messages (
    message_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id          TEXT NOT NULL REFERENCES chats(chat_id) ON DELETE CASCADE,
    role             TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
    content          TEXT NOT NULL,
    message_metadata TEXT NOT NULL DEFAULT '{}',
    created_at       TEXT NOT NULL,
    sequence_index   INTEGER NOT NULL,
    UNIQUE (chat_id, sequence_index)
);

CREATE INDEX IF NOT EXISTS idx_chat_messages_chat_seq
    ON chat_messages(chat_id, sequence_index);

CREATE TABLE IF NOT EXISTS semantic_spaces (
    name       TEXT PRIMARY KEY,
    config     TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS models (
    name     TEXT PRIMARY KEY,
    path     TEXT NOT NULL,
    checksum TEXT NOT NULL,
    type     INTEGER NOT NULL
);
";

const INSERT_MESSAGE: &str = "
INSERT INTO chat_messages (chat_id, role, content, message_metadata, created_at, sequence_index)
VALUES (?1, ?2, ?3, ?4, ?5,
        COALESCE((SELECT MAX(sequence_index) + 1 FROM chat_messages WHERE chat_id = ?1), 0))";

struct Inner {
    conn: Connection,
    depth: u32,
}

/// Chat store on a single SQLite connection.
///
/// The connection sits behind a mutex so the store is `Send + Sync`; the lock
/// is never held across a nested `begin`/`commit` call.
pub struct SqliteChatStore {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
}

impl SqliteChatStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn, Some(path.to_path_buf()))?;
        tracing::info!(path = %path.display(), "Chat store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            inner: Mutex::new(Inner { conn, depth: 0 }),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let inner = self.inner.lock();
        f(&inner.conn)
    }

    /// Run `f` inside a transaction scope, rolling back on failure.
    fn transactional<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.begin()?;
        match f() {
            Ok(value) => match self.commit() {
                Ok(()) => Ok(value),
                Err(err) => {
                    if let Err(rollback_err) = self.rollback() {
                        tracing::warn!(error = %rollback_err, "Rollback after failed commit also failed");
                    }
                    Err(err)
                }
            },
            Err(err) => {
                if let Err(rollback_err) = self.rollback() {
                    tracing::warn!(error = %rollback_err, "Rollback after failed write also failed");
                }
                Err(err)
            }
        }
    }

    fn chat_exists_on(conn: &Connection, chat_id: &str) -> Result<bool> {
        let found = conn
            .query_row(
                "SELECT 1 FROM chats WHERE chat_id = ?1",
                params![chat_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn insert_message_on(conn: &Connection, chat_id: &str, message: &ChatMessage) -> Result<()> {
        message.validate()?;
        let metadata = serde_json::to_string(&message.metadata)?;
        conn.execute(
            INSERT_MESSAGE,
            params![
                chat_id,
                message.role.as_str(),
                message.content,
                metadata,
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

impl ChatStore for SqliteChatStore {
    fn begin(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.depth == 0 {
            inner.conn.execute_batch("BEGIN")?;
            tracing::trace!("Transaction opened");
        }
        inner.depth += 1;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.depth == 0 {
            tracing::warn!("Commit called with no active transaction");
            return Err(Error::NoActiveTransaction);
        }
        if inner.depth == 1 {
            if let Err(err) = inner.conn.execute_batch("COMMIT") {
                // A failed COMMIT can leave the transaction open; close it so
                // depth 0 always means no physical transaction.
                inner.depth = 0;
                if !inner.conn.is_autocommit() {
                    if let Err(rollback_err) = inner.conn.execute_batch("ROLLBACK") {
                        tracing::warn!(error = %rollback_err, "Rollback after failed commit also failed");
                    }
                }
                tracing::error!(error = %err, "Commit failed; transaction rolled back");
                return Err(err.into());
            }
            tracing::trace!("Transaction committed");
        }
        inner.depth -= 1;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let depth = inner.depth;
        inner.depth = 0;
        if !inner.conn.is_autocommit() {
            inner.conn.execute_batch("ROLLBACK")?;
            tracing::debug!(depth, "Transaction rolled back");
        }
        Ok(())
    }

    fn transaction_depth(&self) -> u32 {
        self.inner.lock().depth
    }

    fn create_chat(&self, chat_id: &str, config: &ChatConfig) -> Result<()> {
        config.validate()?;
        let config_json = serde_json::to_string(config)?;
        self.transactional(|| {
            self.with_conn(|conn| {
                if Self::chat_exists_on(conn, chat_id)? {
                    return Err(Error::ChatExists(chat_id.to_string()));
                }
                conn.execute(
                    "INSERT INTO chats (chat_id, title, chat_config) VALUES (?1, NULL, ?2)",
                    params![chat_id, config_json],
                )?;
                Self::insert_message_on(conn, chat_id, &ChatMessage::system(&config.system_prompt))
            })
        })
    }

    fn chat_exists(&self, chat_id: &str) -> Result<bool> {
        self.with_conn(|conn| Self::chat_exists_on(conn, chat_id))
    }

    fn get_chat_config(&self, chat_id: &str) -> Result<ChatConfig> {
        let raw: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT chat_config FROM chats WHERE chat_id = ?1",
                    params![chat_id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        let raw = raw.ok_or_else(|| Error::ChatNotFound(chat_id.to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn get_chat_history(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        let rows = self.with_conn(|conn| {
            if !Self::chat_exists_on(conn, chat_id)? {
                return Err(Error::ChatNotFound(chat_id.to_string()));
            }
            let mut stmt = conn.prepare(
                "SELECT role, content, message_metadata, created_at, sequence_index
                 FROM chat_messages
                 WHERE chat_id = ?1
                 ORDER BY sequence_index ASC",
            )?;
            let rows = stmt
                .query_map(params![chat_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(role, content, metadata, created_at, sequence_index)| -> Result<ChatMessage> {
                Ok(ChatMessage {
                    role: role.parse::<Role>()?,
                    content,
                    metadata: serde_json::from_str(&metadata)?,
                    created_at: parse_timestamp(&created_at)?,
                    sequence_index,
                })
            })
            .collect()
    }

    fn insert_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.transactional(|| {
            self.with_conn(|conn| {
                if !Self::chat_exists_on(conn, chat_id)? {
                    return Err(Error::ChatNotFound(chat_id.to_string()));
                }
                for message in messages {
                    Self::insert_message_on(conn, chat_id, message)?;
                }
                Ok(())
            })
        })?;
        tracing::debug!(chat_id, count = messages.len(), "Messages persisted");
        Ok(())
    }

    fn insert_model(&self, record: &ModelRecord) -> Result<()> {
        self.with_conn(|conn| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM models WHERE name = ?1",
                    params![record.name],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Err(Error::ModelExists(record.name.clone()));
            }
            conn.execute(
                "INSERT INTO models (name, path, checksum, type) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.name,
                    record.path.to_string_lossy(),
                    record.checksum,
                    record.model_type.ordinal(),
                ],
            )?;
            Ok(())
        })
    }

    fn get_model(&self, name: &str) -> Result<Option<ModelRecord>> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT name, path, checksum, type FROM models WHERE name = ?1",
                    params![name],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?)
        })?;
        row.map(model_from_row).transpose()
    }

    fn update_model_path(&self, name: &str, path: &Path) -> Result<()> {
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE models SET path = ?2 WHERE name = ?1",
                params![name, path.to_string_lossy()],
            )?)
        })?;
        if changed == 0 {
            return Err(Error::ModelNotFound(name.to_string()));
        }
        Ok(())
    }

    fn list_models(&self) -> Result<Vec<ModelRecord>> {
        let rows = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name, path, checksum, type FROM models ORDER BY name ASC")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(model_from_row).collect()
    }

    fn create_semantic_space(&self, config: &SemanticSpaceConfig) -> Result<()> {
        config.validate()?;
        let json = serde_json::to_string(config)?;
        self.with_conn(|conn| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM semantic_spaces WHERE name = ?1",
                    params![config.name],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Err(Error::invalid(format!(
                    "semantic space already exists: {}",
                    config.name
                )));
            }
            conn.execute(
                "INSERT INTO semantic_spaces (name, config, created_at) VALUES (?1, ?2, ?3)",
                params![config.name, json, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn get_semantic_space(&self, name: &str) -> Result<Option<SemanticSpaceConfig>> {
        let raw: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT config FROM semantic_spaces WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        raw.map(|json| serde_json::from_str(&json).map_err(Error::from))
            .transpose()
    }

    fn list_semantic_spaces(&self) -> Result<Vec<SemanticSpaceConfig>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT config FROM semantic_spaces ORDER BY name ASC")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(Error::from))
            .collect()
    }

    fn delete_semantic_space(&self, name: &str) -> Result<bool> {
        let removed = self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM semantic_spaces WHERE name = ?1", params![name])?)
        })?;
        Ok(removed > 0)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

type ModelRow = (String, String, String, i64);

fn model_from_row((name, path, checksum, ordinal): ModelRow) -> Result<ModelRecord> {
    Ok(ModelRecord {
        name,
        path: PathBuf::from(path),
        checksum,
        model_type: ModelType::from_ordinal(ordinal)?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::invalid(format!("bad stored timestamp '{raw}': {e}")))
}
