//! Inference runtime abstraction.
//!
//! This module defines the [`InferenceRuntime`] trait, the seam between the
//! engine and whatever native library actually owns model weights. The engine
//! never looks inside a model, context or sampler: it only asks the runtime to
//! tokenize, decode, sample and render chat templates, and it keeps the
//! bookkeeping (positions, context window, UTF-8 buffering) on its side.
//!
//! Handles are associated types. Each one owns exactly one native resource and
//! releases it in `Drop`, so evicting a session or returning early from a
//! one-shot completion frees the matching context and sampler exactly once.

use crate::error::{Error, Result};
use crate::generation::SamplerConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Token id as produced by the runtime's vocabulary.
pub type Token = u32;

/// What a model file is used for.
///
/// The stored ordinal is fixed by [`ModelType::ordinal`] and checked by
/// [`ModelType::from_ordinal`] instead of relying on declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Embedding,
    Llm,
}

impl ModelType {
    pub const fn ordinal(self) -> i64 {
        match self {
            Self::Embedding => 0,
            Self::Llm => 1,
        }
    }

    pub fn from_ordinal(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Embedding),
            1 => Ok(Self::Llm),
            other => Err(Error::invalid(format!("unknown model type ordinal {other}"))),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Llm => "llm",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "llm" => Ok(Self::Llm),
            "embedding" => Ok(Self::Embedding),
            other => Err(Error::invalid(format!(
                "unknown model type '{other}'. Supported values: llm, embedding"
            ))),
        }
    }
}

/// Parameters for a new decode context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextParams {
    /// Context window in tokens.
    pub context_size: u32,
    pub threads: u32,
    /// Embedding mode (pooled outputs instead of logits).
    pub embeddings: bool,
}

/// A run of tokens to push through the model in one decode call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<'a> {
    pub tokens: &'a [Token],
    /// Position of `tokens[0]`; the rest follow contiguously.
    pub start_position: u32,
    /// Request logits for the last token so it can be sampled from.
    pub logits_for_last: bool,
}

/// Role/content pair handed to the chat template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateMessage {
    pub role: String,
    pub content: String,
}

impl TemplateMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Native inference backend.
///
/// Implementations are not required to be reentrant; the engine serializes
/// every call through `&mut` access to itself.
pub trait InferenceRuntime {
    /// Loaded model weights plus vocabulary.
    type Model;
    /// Incremental decode state (KV cache) bound to one model.
    type Context;
    /// Sampler chain producing one token per call.
    type Sampler;

    /// Return the human-readable name of this runtime backend.
    fn name(&self) -> &str;

    /// Load model weights from `path`.
    fn load_model(&self, path: &Path, model_type: ModelType) -> Result<Self::Model>;

    fn create_context(&self, model: &Self::Model, params: &ContextParams) -> Result<Self::Context>;

    fn create_sampler(&self, model: &Self::Model, config: &SamplerConfig) -> Result<Self::Sampler>;

    /// Tokenize `text`. `is_first_segment` adds the beginning-of-sequence token.
    fn tokenize(&self, model: &Self::Model, text: &str, is_first_segment: bool)
        -> Result<Vec<Token>>;

    /// Raw bytes for `tokens`. A single token may end in the middle of a
    /// multi-byte character, so this is not guaranteed to be valid UTF-8.
    fn detokenize(&self, model: &Self::Model, tokens: &[Token]) -> Result<Vec<u8>>;

    fn decode(&self, context: &mut Self::Context, batch: &Batch<'_>) -> Result<()>;

    fn sample(&self, sampler: &mut Self::Sampler, context: &mut Self::Context) -> Result<Token>;

    /// Render `messages` with the model's chat template.
    fn apply_chat_template(
        &self,
        model: &Self::Model,
        messages: &[TemplateMessage],
        add_generation_prompt: bool,
    ) -> Result<String>;

    fn is_end_of_generation(&self, model: &Self::Model, token: Token) -> bool;
}
