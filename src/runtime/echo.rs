//! Loopback runtime: byte-level vocabulary, ChatML template, echo sampler.
//!
//! Every byte is its own token, so token counts are byte counts and a
//! multi-byte character spans several tokens. The sampler replays scripted
//! replies first and otherwise repeats the most recent user turn found in the
//! decode context, followed by the end-of-generation token.

use super::traits::{
    Batch, ContextParams, InferenceRuntime, ModelType, TemplateMessage, Token,
};
use crate::error::{Error, Result};
use crate::generation::SamplerConfig;
use minijinja::{context, Environment};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// End-of-generation token.
pub const EOG_TOKEN: Token = 256;
/// Beginning-of-sequence token, prepended to the first segment.
pub const BOS_TOKEN: Token = 257;

const CHATML_TEMPLATE: &str = "{% for message in messages %}<|im_start|>{{ message.role }}\n\
{{ message.content }}<|im_end|>\n{% endfor %}\
{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

const USER_TURN_OPEN: &[u8] = b"<|im_start|>user\n";
const TURN_CLOSE: &[u8] = b"<|im_end|>";

/// Allocation/release counters for every handle the runtime hands out.
#[derive(Debug, Default)]
pub struct HandleStats {
    models_loaded: AtomicUsize,
    models_released: AtomicUsize,
    contexts_created: AtomicUsize,
    contexts_released: AtomicUsize,
    samplers_created: AtomicUsize,
    samplers_released: AtomicUsize,
}

/// Point-in-time copy of [`HandleStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleSnapshot {
    pub models_loaded: usize,
    pub models_released: usize,
    pub contexts_created: usize,
    pub contexts_released: usize,
    pub samplers_created: usize,
    pub samplers_released: usize,
}

impl HandleSnapshot {
    pub fn live_contexts(&self) -> usize {
        self.contexts_created - self.contexts_released
    }

    pub fn live_samplers(&self) -> usize {
        self.samplers_created - self.samplers_released
    }

    pub fn live_models(&self) -> usize {
        self.models_loaded - self.models_released
    }
}

impl HandleStats {
    pub fn snapshot(&self) -> HandleSnapshot {
        HandleSnapshot {
            models_loaded: self.models_loaded.load(Ordering::SeqCst),
            models_released: self.models_released.load(Ordering::SeqCst),
            contexts_created: self.contexts_created.load(Ordering::SeqCst),
            contexts_released: self.contexts_released.load(Ordering::SeqCst),
            samplers_created: self.samplers_created.load(Ordering::SeqCst),
            samplers_released: self.samplers_released.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug)]
pub struct EchoModel {
    path: PathBuf,
    model_type: ModelType,
    stats: Arc<HandleStats>,
}

impl EchoModel {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }
}

impl Drop for EchoModel {
    fn drop(&mut self) {
        self.stats.models_released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct EchoContext {
    tokens: Vec<Token>,
    window: u32,
    embeddings: bool,
    stats: Arc<HandleStats>,
}

impl EchoContext {
    /// Tokens decoded so far, specials included.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Content of the most recent user turn visible in the context.
    fn last_user_turn(&self) -> Vec<u8> {
        let bytes: Vec<u8> = self
            .tokens
            .iter()
            .filter_map(|&t| u8::try_from(t).ok())
            .collect();
        let Some(start) = rfind(&bytes, USER_TURN_OPEN) else {
            return Vec::new();
        };
        let body = &bytes[start + USER_TURN_OPEN.len()..];
        let end = find(body, TURN_CLOSE).unwrap_or(body.len());
        body[..end].to_vec()
    }
}

impl Drop for EchoContext {
    fn drop(&mut self) {
        self.stats.contexts_released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct EchoSampler {
    config: SamplerConfig,
    pending: VecDeque<Token>,
    /// Context length at which `pending` continues; anything else means the
    /// context moved on and the queued reply is stale.
    resume_at: Option<usize>,
    stats: Arc<HandleStats>,
}

impl EchoSampler {
    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }
}

impl Drop for EchoSampler {
    fn drop(&mut self) {
        self.stats.samplers_released.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-process runtime that needs no model weights.
pub struct EchoRuntime {
    env: Environment<'static>,
    stats: Arc<HandleStats>,
    scripted: Mutex<VecDeque<String>>,
    fail_next_sample: AtomicBool,
}

impl std::fmt::Debug for EchoRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchoRuntime")
            .field("stats", &self.stats.snapshot())
            .field("scripted", &self.scripted.lock().len())
            .finish_non_exhaustive()
    }
}

impl EchoRuntime {
    pub fn new() -> Self {
        let mut env = Environment::new();
        // Constant template; rendering is covered by the tests below.
        if let Err(e) = env.add_template("chatml", CHATML_TEMPLATE) {
            tracing::error!(error = %e, "ChatML template failed to parse");
        }
        Self {
            env,
            stats: Arc::new(HandleStats::default()),
            scripted: Mutex::new(VecDeque::new()),
            fail_next_sample: AtomicBool::new(false),
        }
    }

    /// Queue a reply; queued replies are produced in order before echoing.
    pub fn script_reply(&self, reply: impl Into<String>) {
        self.scripted.lock().push_back(reply.into());
    }

    /// Make the next `sample` call fail once.
    pub fn fail_next_sample(&self) {
        self.fail_next_sample.store(true, Ordering::SeqCst);
    }

    pub fn stats(&self) -> HandleSnapshot {
        self.stats.snapshot()
    }

    fn next_reply(&self, context: &EchoContext) -> Vec<u8> {
        match self.scripted.lock().pop_front() {
            Some(reply) => reply.into_bytes(),
            None => context.last_user_turn(),
        }
    }
}

impl Default for EchoRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceRuntime for EchoRuntime {
    type Model = EchoModel;
    type Context = EchoContext;
    type Sampler = EchoSampler;

    fn name(&self) -> &str {
        "echo"
    }

    fn load_model(&self, path: &Path, model_type: ModelType) -> Result<EchoModel> {
        let meta = std::fs::metadata(path).map_err(|e| Error::ModelLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !meta.is_file() {
            return Err(Error::ModelLoad {
                path: path.to_path_buf(),
                reason: "not a regular file".into(),
            });
        }
        self.stats.models_loaded.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(path = %path.display(), %model_type, "Echo model loaded");
        Ok(EchoModel {
            path: path.to_path_buf(),
            model_type,
            stats: Arc::clone(&self.stats),
        })
    }

    fn create_context(&self, _model: &EchoModel, params: &ContextParams) -> Result<EchoContext> {
        if params.context_size == 0 {
            return Err(Error::invalid("context_size must be greater than 0"));
        }
        self.stats.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(EchoContext {
            tokens: Vec::new(),
            window: params.context_size,
            embeddings: params.embeddings,
            stats: Arc::clone(&self.stats),
        })
    }

    fn create_sampler(&self, _model: &EchoModel, config: &SamplerConfig) -> Result<EchoSampler> {
        config.validate()?;
        self.stats.samplers_created.fetch_add(1, Ordering::SeqCst);
        Ok(EchoSampler {
            config: config.clone(),
            pending: VecDeque::new(),
            resume_at: None,
            stats: Arc::clone(&self.stats),
        })
    }

    fn tokenize(&self, _model: &EchoModel, text: &str, is_first_segment: bool) -> Result<Vec<Token>> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if is_first_segment {
            tokens.push(BOS_TOKEN);
        }
        tokens.extend(text.bytes().map(Token::from));
        Ok(tokens)
    }

    fn detokenize(&self, _model: &EchoModel, tokens: &[Token]) -> Result<Vec<u8>> {
        tokens
            .iter()
            .filter(|&&t| t != EOG_TOKEN && t != BOS_TOKEN)
            .map(|&t| u8::try_from(t).map_err(|_| Error::Tokenize(format!("unknown token id {t}"))))
            .collect()
    }

    fn decode(&self, context: &mut EchoContext, batch: &Batch<'_>) -> Result<()> {
        if context.embeddings && batch.logits_for_last {
            return Err(Error::Decode("embedding context cannot produce logits".into()));
        }
        let used = context.tokens.len();
        if batch.start_position as usize != used {
            return Err(Error::Decode(format!(
                "batch starts at position {} but context holds {used} tokens",
                batch.start_position
            )));
        }
        if used + batch.tokens.len() > context.window as usize {
            return Err(Error::Decode(format!(
                "batch of {} tokens does not fit in window {}",
                batch.tokens.len(),
                context.window
            )));
        }
        context.tokens.extend_from_slice(batch.tokens);
        Ok(())
    }

    fn sample(&self, sampler: &mut EchoSampler, context: &mut EchoContext) -> Result<Token> {
        if self.fail_next_sample.swap(false, Ordering::SeqCst) {
            return Err(Error::Sample("injected sampler failure".into()));
        }
        let position = context.tokens.len();
        if sampler.resume_at != Some(position) && !sampler.pending.is_empty() {
            tracing::trace!(dropped = sampler.pending.len(), "Discarding stale reply tail");
            sampler.pending.clear();
        }
        if sampler.pending.is_empty() {
            let reply = self.next_reply(context);
            sampler.pending.extend(reply.into_iter().map(Token::from));
            sampler.pending.push_back(EOG_TOKEN);
        }
        let token = sampler
            .pending
            .pop_front()
            .ok_or_else(|| Error::Sample("sampler produced no token".into()))?;
        // The caller feeds `token` back before sampling again.
        sampler.resume_at = Some(position + 1);
        Ok(token)
    }

    fn apply_chat_template(
        &self,
        _model: &EchoModel,
        messages: &[TemplateMessage],
        add_generation_prompt: bool,
    ) -> Result<String> {
        let tmpl = self
            .env
            .get_template("chatml")
            .map_err(|e| Error::Template(e.to_string()))?;
        tmpl.render(context!(
            messages => messages,
            add_generation_prompt => add_generation_prompt
        ))
        .map_err(|e| Error::Template(e.to_string()))
    }

    fn is_end_of_generation(&self, _model: &EchoModel, token: Token) -> bool {
        token == EOG_TOKEN
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
