//! Session management: warm per-chat decode contexts for the active model.

pub mod cache;

pub use cache::{template_messages, LoadedSession, ModelBinding, SessionContextCache, SessionEntry};
