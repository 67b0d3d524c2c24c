//! Error type shared by every layer of the engine.
//!
//! Lower layers return the specific variant for what went wrong; the engine
//! logs the failing stage and hands the same value back to the caller, so a
//! "model failed to load" can be told apart from "database write failed".

use std::path::PathBuf;

/// A specialized Result type for hearth operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ── configuration ─────────────────────────────────────────────
    /// A caller-supplied argument or config value is missing or out of range.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Retrieval-augmented generation was requested but cannot be satisfied.
    #[error("retrieval configuration error: {0}")]
    Retrieval(String),

    // ── model registry / runtime ──────────────────────────────────
    #[error("model not registered: {0}")]
    ModelNotFound(String),

    #[error("model already registered: {0}")]
    ModelExists(String),

    #[error("checksum of {path} does not match the one registered for model '{name}'")]
    ChecksumMismatch { name: String, path: PathBuf },

    #[error("model '{name}' is a {actual} model, expected {expected}")]
    ModelTypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("failed to load model from {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    /// No language model is active although an operation needs one.
    #[error("no language model loaded")]
    NoModelLoaded,

    #[error("token sequence of length {requested} exceeds context window (used {used}/{window})")]
    ContextOverflow {
        requested: usize,
        used: u32,
        window: u32,
    },

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("chat template failed: {0}")]
    Template(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("sampling failed: {0}")]
    Sample(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── persistence ───────────────────────────────────────────────
    #[error("chat not found: {0}")]
    ChatNotFound(String),

    #[error("chat already exists: {0}")]
    ChatExists(String),

    #[error("semantic space not found: {0}")]
    SemanticSpaceNotFound(String),

    #[error("commit called with no active transaction")]
    NoActiveTransaction,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_overflow_message_names_window() {
        let err = Error::ContextOverflow {
            requested: 10,
            used: 2040,
            window: 2048,
        };
        assert_eq!(
            err.to_string(),
            "token sequence of length 10 exceeds context window (used 2040/2048)"
        );
    }
}
