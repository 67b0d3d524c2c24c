//! Warm decode contexts keyed by chat id, bound to the active language model.

use crate::error::{Error, Result};
use crate::generation::{DecodeContext, SamplerConfig};
use crate::runtime::{ContextParams, InferenceRuntime, ModelType, TemplateMessage};
use crate::store::{ChatMessage, Role};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;

/// The language model a chat runs on, already resolved to a file.
#[derive(Debug, Clone, Copy)]
pub struct ModelBinding<'a> {
    pub name: &'a str,
    pub path: &'a Path,
}

struct ActiveModel<M> {
    name: String,
    handle: M,
}

/// Decode state and sampler kept alive for one chat.
pub struct SessionEntry<R: InferenceRuntime> {
    pub(crate) context: DecodeContext<R::Context>,
    pub(crate) sampler: R::Sampler,
    pub(crate) sampler_config: SamplerConfig,
    model: String,
    last_used: u64,
}

impl<R: InferenceRuntime> SessionEntry<R> {
    pub fn context(&self) -> &DecodeContext<R::Context> {
        &self.context
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Rebuild the sampler when a turn asks for different sampling settings.
    pub(crate) fn ensure_sampler(
        &mut self,
        runtime: &R,
        model: &R::Model,
        config: &SamplerConfig,
    ) -> Result<()> {
        if self.sampler_config.top_k != config.top_k || self.sampler_config.top_p != config.top_p {
            self.sampler = runtime.create_sampler(model, config)?;
            self.sampler_config = config.clone();
        }
        Ok(())
    }
}

/// A cached session together with the model it is bound to.
pub struct LoadedSession<'a, R: InferenceRuntime> {
    pub model: &'a R::Model,
    pub entry: &'a mut SessionEntry<R>,
}

/// Per-chat decode contexts for the active language model.
///
/// Entries exist only while their model is the active one: switching to a
/// different model drops every entry before the old model goes away. At
/// capacity the least recently used entry is released.
pub struct SessionContextCache<R: InferenceRuntime> {
    // Declared before `active_model` so contexts drop before their model.
    entries: HashMap<String, SessionEntry<R>>,
    active_model: Option<ActiveModel<R::Model>>,
    params: ContextParams,
    sampler_defaults: SamplerConfig,
    capacity: usize,
    tick: u64,
}

impl<R: InferenceRuntime> SessionContextCache<R> {
    pub fn new(params: ContextParams, sampler_defaults: SamplerConfig, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            active_model: None,
            params,
            sampler_defaults,
            capacity: capacity.max(1),
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Name of the loaded language model, if any.
    pub fn active_model(&self) -> Option<&str> {
        self.active_model.as_ref().map(|m| m.name.as_str())
    }

    /// Make `binding` the active language model, dropping every cached session
    /// when it replaces a different one.
    pub fn ensure_model(&mut self, runtime: &R, binding: ModelBinding<'_>) -> Result<&R::Model> {
        let current = self
            .active_model
            .as_ref()
            .is_some_and(|m| m.name == binding.name);

        if !current {
            if let Some(previous) = self.active_model.as_ref() {
                tracing::info!(
                    from = %previous.name,
                    to = binding.name,
                    dropped_sessions = self.entries.len(),
                    "Switching language model"
                );
            }
            self.entries.clear();
            self.active_model = None;

            let handle = runtime.load_model(binding.path, ModelType::Llm)?;
            tracing::info!(
                model = binding.name,
                path = %binding.path.display(),
                runtime = runtime.name(),
                "Language model loaded"
            );
            self.active_model = Some(ActiveModel {
                name: binding.name.to_string(),
                handle,
            });
        }

        self.active_model
            .as_ref()
            .map(|m| &m.handle)
            .ok_or(Error::NoModelLoaded)
    }

    /// Return the warm session for `chat_id`, rebuilding it from history when
    /// it is missing or bound to another model.
    pub fn ensure_loaded<F>(
        &mut self,
        runtime: &R,
        chat_id: &str,
        binding: ModelBinding<'_>,
        load_history: F,
    ) -> Result<LoadedSession<'_, R>>
    where
        F: FnOnce() -> Result<Vec<ChatMessage>>,
    {
        self.tick += 1;
        let tick = self.tick;

        let bound = self
            .active_model
            .as_ref()
            .is_some_and(|m| m.name == binding.name);
        if bound && self.entries.contains_key(chat_id) {
            let model = self
                .active_model
                .as_ref()
                .map(|m| &m.handle)
                .ok_or(Error::NoModelLoaded)?;
            let entry = self
                .entries
                .get_mut(chat_id)
                .ok_or_else(|| Error::ChatNotFound(chat_id.to_string()))?;
            entry.last_used = tick;
            tracing::trace!(chat_id, "Session cache hit");
            return Ok(LoadedSession { model, entry });
        }

        self.ensure_model(runtime, binding)?;
        let model = self
            .active_model
            .as_ref()
            .map(|m| &m.handle)
            .ok_or(Error::NoModelLoaded)?;

        let history = load_history()?;
        let messages = template_messages(&history);
        let prompt = runtime.apply_chat_template(model, &messages, false)?;
        if prompt.is_empty() {
            return Err(Error::Template(format!(
                "chat template produced an empty prompt for chat '{chat_id}'"
            )));
        }

        let handle = runtime.create_context(model, &self.params)?;
        let mut context = DecodeContext::new(handle, self.params.context_size);
        let sampler = runtime.create_sampler(model, &self.sampler_defaults)?;
        let tokens = runtime.tokenize(model, &prompt, context.is_empty())?;
        context.prefill(runtime, &tokens, false)?;

        if !self.entries.contains_key(chat_id) && self.entries.len() >= self.capacity {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(id, _)| id.clone())
            {
                self.entries.remove(&oldest);
                tracing::debug!(evicted = %oldest, "Session cache at capacity; evicted least recently used");
            }
        }

        tracing::debug!(
            chat_id,
            messages = history.len(),
            tokens = context.next_position(),
            "Session context built from history"
        );

        let entry = SessionEntry {
            context,
            sampler,
            sampler_config: self.sampler_defaults.clone(),
            model: binding.name.to_string(),
            last_used: tick,
        };
        let entry = match self.entries.entry(chat_id.to_string()) {
            Entry::Occupied(mut slot) => {
                slot.insert(entry);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(entry),
        };
        Ok(LoadedSession { model, entry })
    }

    /// Release the session for `chat_id`. Returns whether one was cached.
    pub fn unload(&mut self, chat_id: &str) -> bool {
        let removed = self.entries.remove(chat_id).is_some();
        if removed {
            tracing::debug!(chat_id, "Session unloaded");
        }
        removed
    }

    pub fn is_loaded(&self, chat_id: &str) -> bool {
        self.entries.contains_key(chat_id)
    }

    /// Tokens held by the session's decode context.
    pub fn context_tokens(&self, chat_id: &str) -> Option<u32> {
        self.entries.get(chat_id).map(|e| e.context.next_position())
    }
}

/// Convert stored history into template input. A history holding only the
/// system prompt gets an empty user turn so templates that require one render.
pub fn template_messages(history: &[ChatMessage]) -> Vec<TemplateMessage> {
    let mut messages: Vec<TemplateMessage> = history
        .iter()
        .map(|m| TemplateMessage::new(m.role.as_str(), m.content.clone()))
        .collect();
    if history.len() == 1 && history[0].role == Role::System {
        messages.push(TemplateMessage::new(Role::User.as_str(), ""));
    }
    messages
}
