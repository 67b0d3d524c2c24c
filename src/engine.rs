//! The chat engine: model registry, warm sessions, streaming and persistence
//! composed behind one owner.
//!
//! Every operation runs synchronously on the caller's thread. Operations that
//! can load or swap models take `&mut self`, so a model swap can never race a
//! generation in flight.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::generation::{
    DecodeContext, FinishReason, GenerationOutcome, GeneratorConfig, SamplerConfig,
    StreamingGenerator,
};
use crate::registry::ModelRegistry;
use crate::retrieval;
use crate::runtime::{self, ContextParams, EchoRuntime, InferenceRuntime, ModelType, TemplateMessage};
use crate::session::{ModelBinding, SessionContextCache};
use crate::store::{
    self, ChatConfig, ChatMessage, ChatStore, ModelRecord, Role, SemanticSpaceConfig,
    SqliteChatStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Map an operation result to a C-style status: the token count, or `-1`.
pub fn status_code(result: &Result<u32>) -> i32 {
    match result {
        Ok(tokens) => i32::try_from(*tokens).unwrap_or(i32::MAX),
        Err(_) => -1,
    }
}

/// Engine over the loopback runtime and the SQLite store, as configured.
pub fn build_engine(config: &Config) -> anyhow::Result<Engine<EchoRuntime, SqliteChatStore>> {
    let runtime = runtime::create_runtime(&config.runtime)?;
    let store = store::open_chat_store(&config.resolved_database_path())?;
    Ok(Engine::new(runtime, Arc::new(store), config))
}

pub struct Engine<R: InferenceRuntime, S: ChatStore> {
    runtime: R,
    store: Arc<S>,
    registry: ModelRegistry<S>,
    sessions: SessionContextCache<R>,
    generator: StreamingGenerator,
    llm_params: ContextParams,
    embedding_params: ContextParams,
    default_sampler: SamplerConfig,
}

impl<R: InferenceRuntime, S: ChatStore> Engine<R, S> {
    pub fn new(runtime: R, store: Arc<S>, config: &Config) -> Self {
        let llm_params = ContextParams {
            context_size: config.runtime.llm_context_size,
            threads: config.runtime.threads,
            embeddings: false,
        };
        let embedding_params = ContextParams {
            context_size: config.runtime.embedding_context_size,
            threads: config.runtime.threads,
            embeddings: true,
        };
        let default_sampler = config.generation.sampler();
        Self {
            registry: ModelRegistry::new(Arc::clone(&store)),
            sessions: SessionContextCache::new(
                llm_params.clone(),
                default_sampler.clone(),
                config.sessions.max_loaded,
            ),
            generator: StreamingGenerator::new(config.generation.flush_every),
            runtime,
            store,
            llm_params,
            embedding_params,
            default_sampler,
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &ModelRegistry<S> {
        &self.registry
    }

    /// Sampler settings from `[generation]`, for callers without their own.
    pub fn default_sampler(&self) -> &SamplerConfig {
        &self.default_sampler
    }

    /// Name of the language model currently loaded, if any.
    pub fn active_model(&self) -> Option<&str> {
        self.sessions.active_model()
    }

    // ── Chats ─────────────────────────────────────────────────────

    /// Create a chat, generating `chat_<uuid>` when no id is given.
    pub fn create_chat(&self, chat_id: Option<&str>, config: &ChatConfig) -> Result<String> {
        config.validate()?;
        self.registry.expect_type(&config.llm_model, ModelType::Llm)?;

        let chat_id = match chat_id {
            Some(id) if id.trim().is_empty() => {
                return Err(Error::invalid("chat id cannot be empty"));
            }
            Some(id) => id.to_string(),
            None => format!("chat_{}", uuid::Uuid::new_v4().simple()),
        };
        self.store.create_chat(&chat_id, config)?;
        tracing::info!(
            chat_id = %chat_id,
            model = %config.llm_model,
            persistence = config.persistence,
            "Chat created"
        );
        Ok(chat_id)
    }

    /// Make sure the chat's decode context is warm.
    pub fn load_chat(&mut self, chat_id: &str) -> Result<()> {
        require_id(chat_id)?;
        let chat_config = self.store.get_chat_config(chat_id)?;
        self.ensure_session_loaded(chat_id, &chat_config)
            .inspect_err(|e| tracing::error!(chat_id, error = %e, "Failed to load chat"))
    }

    pub fn get_chat_history(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        require_id(chat_id)?;
        self.store.get_chat_history(chat_id)
    }

    pub fn unload_chat(&mut self, chat_id: &str) -> bool {
        self.sessions.unload(chat_id)
    }

    pub fn is_chat_loaded(&self, chat_id: &str) -> bool {
        self.sessions.is_loaded(chat_id)
    }

    /// Tokens held in the chat's warm context, if it is loaded.
    pub fn chat_context_tokens(&self, chat_id: &str) -> Option<u32> {
        self.sessions.context_tokens(chat_id)
    }

    fn ensure_session_loaded(&mut self, chat_id: &str, chat_config: &ChatConfig) -> Result<()> {
        let record = self
            .registry
            .expect_type(&chat_config.llm_model, ModelType::Llm)?;
        let binding = ModelBinding {
            name: &record.name,
            path: &record.path,
        };
        let store = &self.store;
        self.sessions
            .ensure_loaded(&self.runtime, chat_id, binding, || {
                store.get_chat_history(chat_id)
            })?;
        Ok(())
    }

    /// Run one chat turn: stream the reply through `callback` and persist the
    /// exchange. Returns the number of generated tokens.
    ///
    /// `callback` receives non-empty UTF-8 chunks in order; returning `false`
    /// stops generation, and the partial reply is still persisted.
    pub fn generate_turn<F>(
        &mut self,
        chat_id: &str,
        user_text: &str,
        config: &GeneratorConfig,
        mut callback: F,
    ) -> Result<u32>
    where
        F: FnMut(&str) -> bool,
    {
        require_id(chat_id)?;
        if user_text.is_empty() {
            return Err(Error::invalid("user message cannot be empty"));
        }
        config.validate()?;

        let chat_config = self.store.get_chat_config(chat_id)?;
        let plan = retrieval::plan(config, self.store.as_ref(), &self.registry)
            .inspect_err(|e| tracing::error!(chat_id, error = %e, "Retrieval setup failed"))?;
        let prompt = match &plan {
            Some(plan) => {
                retrieval::embed_query(&self.runtime, plan, &self.embedding_params, user_text)
                    .inspect_err(|e| tracing::error!(chat_id, error = %e, "Query embedding failed"))?;
                retrieval::retrieve(plan, user_text).augment(user_text)
            }
            None => user_text.to_string(),
        };

        let record = self
            .registry
            .expect_type(&chat_config.llm_model, ModelType::Llm)?;
        let binding = ModelBinding {
            name: &record.name,
            path: &record.path,
        };
        let runtime = &self.runtime;
        let store = &self.store;
        let generator = self.generator;
        let session = self
            .sessions
            .ensure_loaded(runtime, chat_id, binding, || store.get_chat_history(chat_id))
            .inspect_err(|e| tracing::error!(chat_id, error = %e, "Failed to load chat context"))?;
        let (model, entry) = (session.model, session.entry);

        let mut response = String::new();
        let streamed = entry
            .ensure_sampler(runtime, model, &config.sampler)
            .and_then(|()| {
                stream_reply(
                    runtime,
                    model,
                    &mut entry.context,
                    &mut entry.sampler,
                    generator,
                    &prompt,
                    config.sampler.max_tokens,
                    |chunk: &str| {
                        response.push_str(chunk);
                        callback(chunk)
                    },
                )
            });

        let outcome = match streamed {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(chat_id, error = %e, "Generation failed; dropping chat context");
                self.sessions.unload(chat_id);
                return Err(e);
            }
        };

        if outcome.finish == FinishReason::Cancelled {
            tracing::info!(chat_id, tokens = outcome.tokens, "Turn cancelled by caller");
        }

        if chat_config.persistence {
            let exchange = [ChatMessage::user(user_text), ChatMessage::assistant(response)];
            if let Err(e) = self.persist_exchange(chat_id, &exchange) {
                tracing::error!(
                    chat_id,
                    error = %e,
                    "Failed to persist turn; dropping chat context so it rebuilds from storage"
                );
                self.sessions.unload(chat_id);
                return Err(e);
            }
        }

        tracing::debug!(chat_id, tokens = outcome.tokens, finish = ?outcome.finish, "Turn complete");
        Ok(outcome.tokens)
    }

    fn persist_exchange(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<()> {
        self.store.begin()?;
        let written = self
            .store
            .insert_messages(chat_id, messages)
            .and_then(|()| self.store.commit());
        if let Err(e) = written {
            if let Err(rollback_err) = self.store.rollback() {
                tracing::warn!(chat_id, error = %rollback_err, "Rollback failed");
            }
            return Err(e);
        }
        Ok(())
    }

    /// One-shot completion on `model_name` with a context that lives only for
    /// this call. Returns the number of generated tokens.
    pub fn generate_completion<F>(
        &mut self,
        model_name: &str,
        prompt: &str,
        sampler: &SamplerConfig,
        callback: F,
    ) -> Result<u32>
    where
        F: FnMut(&str) -> bool,
    {
        if model_name.trim().is_empty() {
            return Err(Error::invalid("model name cannot be empty"));
        }
        if prompt.is_empty() {
            return Err(Error::invalid("prompt cannot be empty"));
        }
        sampler.validate()?;

        let record = self.registry.expect_type(model_name, ModelType::Llm)?;
        let binding = ModelBinding {
            name: &record.name,
            path: &record.path,
        };
        let runtime = &self.runtime;
        let params = &self.llm_params;
        let generator = self.generator;
        let model = self.sessions.ensure_model(runtime, binding)?;

        // Context and sampler drop at the end of this call on every path.
        let handle = runtime.create_context(model, params)?;
        let mut context = DecodeContext::new(handle, params.context_size);
        let mut chain = runtime.create_sampler(model, sampler)?;
        stream_reply(
            runtime,
            model,
            &mut context,
            &mut chain,
            generator,
            prompt,
            sampler.max_tokens,
            callback,
        )
        .map(|outcome| outcome.tokens)
        .inspect_err(|e| tracing::error!(model = model_name, error = %e, "Completion failed"))
    }

    // ── Models ────────────────────────────────────────────────────

    pub fn register_model(
        &self,
        name: &str,
        path: &Path,
        model_type: ModelType,
    ) -> Result<ModelRecord> {
        self.registry.register(name, path, model_type)
    }

    pub fn update_model_path(&self, name: &str, path: &Path) -> Result<()> {
        self.registry.update_path(name, path)
    }

    pub fn resolve_model_path(&self, name: &str) -> Result<PathBuf> {
        self.registry.resolve(name)
    }

    pub fn list_models(&self) -> Result<Vec<ModelRecord>> {
        self.registry.list()
    }

    // ── Semantic spaces ───────────────────────────────────────────

    pub fn create_semantic_space(&self, config: &SemanticSpaceConfig) -> Result<()> {
        config.validate()?;
        self.registry
            .expect_type(&config.embedding_model, ModelType::Embedding)?;
        self.store.create_semantic_space(config)?;
        tracing::info!(space = %config.name, model = %config.embedding_model, "Semantic space created");
        Ok(())
    }

    pub fn get_semantic_space(&self, name: &str) -> Result<SemanticSpaceConfig> {
        self.store
            .get_semantic_space(name)?
            .ok_or_else(|| Error::SemanticSpaceNotFound(name.to_string()))
    }

    pub fn list_semantic_spaces(&self) -> Result<Vec<SemanticSpaceConfig>> {
        self.store.list_semantic_spaces()
    }

    pub fn delete_semantic_space(&self, name: &str) -> Result<bool> {
        self.store.delete_semantic_space(name)
    }
}

/// Template `prompt` as a user turn, decode it, and stream the reply.
#[allow(clippy::too_many_arguments)]
fn stream_reply<R, F>(
    runtime: &R,
    model: &R::Model,
    context: &mut DecodeContext<R::Context>,
    sampler: &mut R::Sampler,
    generator: StreamingGenerator,
    prompt: &str,
    max_tokens: u32,
    callback: F,
) -> Result<GenerationOutcome>
where
    R: InferenceRuntime,
    F: FnMut(&str) -> bool,
{
    let formatted = runtime.apply_chat_template(
        model,
        &[TemplateMessage::new(Role::User.as_str(), prompt)],
        true,
    )?;
    let tokens = runtime.tokenize(model, &formatted, context.is_empty())?;
    context.prefill(runtime, &tokens, true)?;
    generator.run(runtime, model, context, sampler, max_tokens, callback)
}

fn require_id(chat_id: &str) -> Result<()> {
    if chat_id.trim().is_empty() {
        return Err(Error::invalid("chat id cannot be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> Engine<EchoRuntime, SqliteChatStore> {
        let store = SqliteChatStore::open(&dir.path().join("hearth.db")).unwrap();
        let engine = Engine::new(EchoRuntime::new(), Arc::new(store), &Config::default());
        let weights = dir.path().join("m1.bin");
        std::fs::write(&weights, b"weights").unwrap();
        engine.register_model("m1", &weights, ModelType::Llm).unwrap();
        engine
    }

    #[test]
    fn status_code_maps_failure_to_sentinel() {
        assert_eq!(status_code(&Ok(12)), 12);
        assert_eq!(status_code(&Err(Error::NoModelLoaded)), -1);
        assert_eq!(status_code(&Ok(u32::MAX)), i32::MAX);
    }

    #[test]
    fn create_chat_generates_prefixed_id() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let id = engine
            .create_chat(None, &ChatConfig::new("You are concise.", "m1"))
            .unwrap();
        assert!(id.starts_with("chat_"));
        assert!(engine.store().chat_exists(&id).unwrap());
    }

    #[test]
    fn create_chat_rejects_unknown_model_and_duplicates() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        assert!(matches!(
            engine.create_chat(Some("c1"), &ChatConfig::new("s", "nope")),
            Err(Error::ModelNotFound(_))
        ));
        engine
            .create_chat(Some("c1"), &ChatConfig::new("s", "m1"))
            .unwrap();
        assert!(matches!(
            engine.create_chat(Some("c1"), &ChatConfig::new("s", "m1")),
            Err(Error::ChatExists(_))
        ));
        assert!(engine
            .create_chat(Some(" "), &ChatConfig::new("s", "m1"))
            .is_err());
    }

    #[test]
    fn turn_streams_and_persists_exchange() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp);
        engine
            .create_chat(Some("c1"), &ChatConfig::new("You are concise.", "m1"))
            .unwrap();

        let mut streamed = String::new();
        let tokens = engine
            .generate_turn("c1", "hello there", &GeneratorConfig::default(), |c: &str| {
                streamed.push_str(c);
                true
            })
            .unwrap();

        assert_eq!(streamed, "hello there");
        assert_eq!(tokens, 11);
        let history = engine.get_chat_history("c1").unwrap();
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(history[2].content, "hello there");
        assert!(engine.is_chat_loaded("c1"));
    }

    #[test]
    fn non_persistent_chat_keeps_history_untouched() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp);
        let mut cfg = ChatConfig::new("s", "m1");
        cfg.persistence = false;
        engine.create_chat(Some("c1"), &cfg).unwrap();
        engine
            .generate_turn("c1", "hi", &GeneratorConfig::default(), |_: &str| true)
            .unwrap();
        assert_eq!(engine.get_chat_history("c1").unwrap().len(), 1);
    }

    #[test]
    fn empty_inputs_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp);
        engine
            .create_chat(Some("c1"), &ChatConfig::new("s", "m1"))
            .unwrap();
        assert!(engine
            .generate_turn("", "hi", &GeneratorConfig::default(), |_: &str| true)
            .is_err());
        assert!(engine
            .generate_turn("c1", "", &GeneratorConfig::default(), |_: &str| true)
            .is_err());
        assert!(engine.load_chat("").is_err());
    }

    #[test]
    fn completion_releases_its_handles() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp);
        let mut out = String::new();
        let tokens = engine
            .generate_completion("m1", "ping", &SamplerConfig::default(), |c: &str| {
                out.push_str(c);
                true
            })
            .unwrap();
        assert_eq!(out, "ping");
        assert_eq!(tokens, 4);
        let stats = engine.runtime().stats();
        assert_eq!(stats.live_contexts(), 0);
        assert_eq!(stats.live_samplers(), 0);
        assert_eq!(engine.active_model(), Some("m1"));
    }

    #[test]
    fn semantic_space_requires_embedding_model() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let space = SemanticSpaceConfig {
            name: "notes".into(),
            embedding_model: "m1".into(),
            chunking: crate::store::ChunkingConfig::default(),
            dimensions: 384,
        };
        assert!(matches!(
            engine.create_semantic_space(&space),
            Err(Error::ModelTypeMismatch { .. })
        ));

        let weights = tmp.path().join("e5.bin");
        std::fs::write(&weights, b"embed").unwrap();
        engine
            .register_model("e5", &weights, ModelType::Embedding)
            .unwrap();
        let space = SemanticSpaceConfig {
            embedding_model: "e5".into(),
            ..space
        };
        engine.create_semantic_space(&space).unwrap();
        assert_eq!(engine.get_semantic_space("notes").unwrap(), space);
        assert_eq!(engine.list_semantic_spaces().unwrap().len(), 1);
        assert!(engine.delete_semantic_space("notes").unwrap());
        assert!(matches!(
            engine.get_semantic_space("notes"),
            Err(Error::SemanticSpaceNotFound(_))
        ));
    }
}
