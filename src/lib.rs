#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::doc_markdown,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unused_self
)]

//! hearth: an on-device chat runtime.
//!
//! Chats keep a warm decode context per conversation, replies stream as
//! UTF-8-safe chunks, and history plus the model registry live in SQLite.

pub mod config;
pub mod engine;
pub mod error;
pub mod generation;
pub mod registry;
pub mod retrieval;
pub mod runtime;
pub mod session;
pub mod store;

pub use config::Config;
pub use engine::{build_engine, status_code, Engine};
pub use error::{Error, Result};
pub use generation::{FinishReason, GeneratorConfig, RagMode, SamplerConfig};
pub use registry::ModelRegistry;
pub use runtime::{EchoRuntime, InferenceRuntime, ModelType};
pub use store::{ChatConfig, ChatMessage, ChatStore, Role, SqliteChatStore};
