//! Chat storage traits and types.

use crate::error::{Error, Result};
use crate::runtime::ModelType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(Error::invalid(format!("unknown message role '{other}'"))),
        }
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Opaque JSON object carried alongside the message.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Assigned by the store on insert; ignored on input.
    pub sequence_index: i64,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            created_at: Utc::now(),
            sequence_index: 0,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// User and system turns must carry text; an assistant turn may be empty
    /// when the reply was cancelled before producing output.
    pub fn validate(&self) -> Result<()> {
        if self.role != Role::Assistant && self.content.is_empty() {
            return Err(Error::invalid(format!("{} message content is empty", self.role)));
        }
        if !self.metadata.is_object() {
            return Err(Error::invalid("message metadata must be a JSON object"));
        }
        Ok(())
    }
}

/// Immutable per-chat settings, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Whether finished turns are written to the store.
    #[serde(default = "default_persistence")]
    pub persistence: bool,
    pub system_prompt: String,
    /// Registered name of the language model this chat runs on.
    pub llm_model: String,
}

fn default_persistence() -> bool {
    true
}

impl ChatConfig {
    pub fn new(system_prompt: impl Into<String>, llm_model: impl Into<String>) -> Self {
        Self {
            persistence: true,
            system_prompt: system_prompt.into(),
            llm_model: llm_model.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.system_prompt.trim().is_empty() {
            return Err(Error::invalid("chat system_prompt cannot be empty"));
        }
        if self.llm_model.trim().is_empty() {
            return Err(Error::invalid("chat llm_model cannot be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub name: String,
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the model file.
    pub checksum: String,
    pub model_type: ModelType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: u32,
    pub chunk_overlap: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 64,
        }
    }
}

/// Named embedding space documents are indexed into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticSpaceConfig {
    pub name: String,
    pub embedding_model: String,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub dimensions: u32,
}

impl SemanticSpaceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid("semantic space name cannot be empty"));
        }
        if self.embedding_model.trim().is_empty() {
            return Err(Error::invalid("semantic space embedding_model cannot be empty"));
        }
        if self.chunking.chunk_size == 0 {
            return Err(Error::invalid("chunking.chunk_size must be greater than 0"));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(Error::invalid(
                "chunking.chunk_overlap must be smaller than chunk_size",
            ));
        }
        Ok(())
    }
}

/// Durable storage for chats, models and semantic spaces.
///
/// Transactions nest: only the outermost `begin`/`commit` pair touches the
/// database, and `rollback` at any depth discards the whole transaction.
pub trait ChatStore: Send + Sync {
    fn begin(&self) -> Result<()>;

    /// Close one transaction scope. Fails with [`Error::NoActiveTransaction`]
    /// when no scope is open.
    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    /// Current transaction nesting depth.
    fn transaction_depth(&self) -> u32;

    /// Store `config` and insert its system prompt as message 0.
    fn create_chat(&self, chat_id: &str, config: &ChatConfig) -> Result<()>;

    fn chat_exists(&self, chat_id: &str) -> Result<bool>;

    fn get_chat_config(&self, chat_id: &str) -> Result<ChatConfig>;

    /// Messages ordered by sequence index.
    fn get_chat_history(&self, chat_id: &str) -> Result<Vec<ChatMessage>>;

    /// Append messages atomically; either all are stored or none.
    fn insert_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<()>;

    fn insert_model(&self, record: &ModelRecord) -> Result<()>;

    fn get_model(&self, name: &str) -> Result<Option<ModelRecord>>;

    fn update_model_path(&self, name: &str, path: &std::path::Path) -> Result<()>;

    fn list_models(&self) -> Result<Vec<ModelRecord>>;

    fn create_semantic_space(&self, config: &SemanticSpaceConfig) -> Result<()>;

    fn get_semantic_space(&self, name: &str) -> Result<Option<SemanticSpaceConfig>>;

    fn list_semantic_spaces(&self) -> Result<Vec<SemanticSpaceConfig>>;

    /// Returns whether a space was removed.
    fn delete_semantic_space(&self, name: &str) -> Result<bool>;

    /// The name of this store implementation.
    fn name(&self) -> &str;
}
