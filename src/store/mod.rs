//! Durable chat storage: chat configs, message history, model records and
//! semantic spaces.

pub mod sqlite;
pub mod traits;

pub use sqlite::SqliteChatStore;
pub use traits::{
    ChatConfig, ChatMessage, ChatStore, ChunkingConfig, ModelRecord, Role, SemanticSpaceConfig,
};

use crate::error::Result;
use std::path::Path;

/// Open the SQLite chat store at `path`.
pub fn open_chat_store(path: &Path) -> Result<SqliteChatStore> {
    SqliteChatStore::open(path)
}
