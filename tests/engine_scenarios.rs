//! End-to-end chat scenarios over the loopback runtime and SQLite.

use hearth::generation::{GeneratorRagConfig, RetrievalConfig};
use hearth::session::template_messages;
use hearth::store::{ModelRecord, SemanticSpaceConfig};
use hearth::{
    status_code, ChatConfig, ChatMessage, ChatStore, Config, EchoRuntime, Engine, Error,
    GeneratorConfig, InferenceRuntime, ModelType, RagMode, Role, SqliteChatStore,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const SYSTEM_PROMPT: &str = "You are concise.";

fn write_model(dir: &TempDir, file: &str, contents: &[u8]) -> PathBuf {
    let path = dir.path().join(file);
    std::fs::write(&path, contents).unwrap();
    path
}

fn engine_with(dir: &TempDir, config: &Config) -> Engine<EchoRuntime, SqliteChatStore> {
    let store = SqliteChatStore::open(&dir.path().join("hearth.db")).unwrap();
    let engine = Engine::new(EchoRuntime::new(), Arc::new(store), config);
    let weights = write_model(dir, "m1.bin", b"model one");
    engine.register_model("m1", &weights, ModelType::Llm).unwrap();
    engine
}

fn engine(dir: &TempDir) -> Engine<EchoRuntime, SqliteChatStore> {
    engine_with(dir, &Config::default())
}

fn collect(chunks: &mut Vec<String>) -> impl FnMut(&str) -> bool + '_ {
    move |chunk: &str| {
        chunks.push(chunk.to_string());
        true
    }
}

#[test]
fn system_only_chat_loads_templated_prompt() {
    let tmp = TempDir::new().unwrap();
    let mut engine = engine(&tmp);
    engine
        .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();

    engine.load_chat("c1").unwrap();

    // System turn plus the empty user turn, one token per byte, plus BOS.
    let prompt = format!(
        "<|im_start|>system\n{SYSTEM_PROMPT}<|im_end|>\n<|im_start|>user\n<|im_end|>\n"
    );
    let expected = u32::try_from(prompt.len()).unwrap() + 1;
    assert!(engine.is_chat_loaded("c1"));
    assert_eq!(engine.chat_context_tokens("c1"), Some(expected));
}

#[test]
fn forty_five_tokens_arrive_in_three_chunks() {
    let tmp = TempDir::new().unwrap();
    let mut engine = engine(&tmp);
    engine
        .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();
    engine.runtime().script_reply("a".repeat(45));

    let mut chunks = Vec::new();
    let tokens = engine
        .generate_turn("c1", "count", &GeneratorConfig::default(), collect(&mut chunks))
        .unwrap();

    assert_eq!(tokens, 45);
    let sizes: Vec<usize> = chunks.iter().map(String::len).collect();
    assert_eq!(sizes, vec![20, 20, 5]);
}

#[test]
fn multibyte_reply_is_never_split() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.generation.flush_every = 3;
    let mut engine = engine_with(&tmp, &config);
    engine
        .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();
    let reply = "héllo wörld 😀 ünïcödé ✓";
    engine.runtime().script_reply(reply);

    let mut chunks = Vec::new();
    engine
        .generate_turn("c1", "go", &GeneratorConfig::default(), collect(&mut chunks))
        .unwrap();

    assert!(chunks.len() > 1);
    assert!(chunks.iter().all(|c| !c.is_empty() && !c.contains('\u{FFFD}')));
    assert_eq!(chunks.concat(), reply);
    let history = engine.get_chat_history("c1").unwrap();
    assert_eq!(history.last().unwrap().content, reply);
}

#[test]
fn turns_accumulate_in_order() {
    let tmp = TempDir::new().unwrap();
    let mut engine = engine(&tmp);
    engine
        .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();

    for text in ["first", "second"] {
        let mut chunks = Vec::new();
        engine
            .generate_turn("c1", text, &GeneratorConfig::default(), collect(&mut chunks))
            .unwrap();
        assert_eq!(chunks.concat(), text);
    }

    let history = engine.get_chat_history("c1").unwrap();
    let indices: Vec<i64> = history.iter().map(|m| m.sequence_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec![SYSTEM_PROMPT, "first", "first", "second", "second"]
    );
}

#[test]
fn update_path_with_different_content_keeps_old_location() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    let a = engine.resolve_model_path("m1").unwrap();
    let b = write_model(&tmp, "b.bin", b"something else");

    let err = engine.update_model_path("m1", &b).unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch { .. }));
    assert_eq!(engine.resolve_model_path("m1").unwrap(), a);

    let moved = write_model(&tmp, "moved.bin", b"model one");
    engine.update_model_path("m1", &moved).unwrap();
    assert_eq!(engine.resolve_model_path("m1").unwrap(), moved);
}

#[test]
fn failing_batch_leaves_no_partial_rows() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    engine
        .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();

    let batch = [ChatMessage::user("first"), ChatMessage::user("")];
    assert!(engine.store().insert_messages("c1", &batch).is_err());
    assert_eq!(engine.get_chat_history("c1").unwrap().len(), 1);
    assert_eq!(engine.store().transaction_depth(), 0);
}

#[test]
fn nested_transactions_commit_once_and_roll_back_fully() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    engine
        .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();
    let store = engine.store();

    store.begin().unwrap();
    store.begin().unwrap();
    store
        .insert_messages("c1", &[ChatMessage::user("kept")])
        .unwrap();
    store.commit().unwrap();
    store.commit().unwrap();
    assert_eq!(engine.get_chat_history("c1").unwrap().len(), 2);

    store.begin().unwrap();
    store
        .insert_messages("c1", &[ChatMessage::user("dropped")])
        .unwrap();
    store.begin().unwrap();
    store.rollback().unwrap();
    assert_eq!(store.transaction_depth(), 0);
    assert_eq!(engine.get_chat_history("c1").unwrap().len(), 2);
}

#[test]
fn switching_models_clears_every_session() {
    let tmp = TempDir::new().unwrap();
    let mut engine = engine(&tmp);
    let m2 = write_model(&tmp, "m2.bin", b"model two");
    engine.register_model("m2", &m2, ModelType::Llm).unwrap();
    engine
        .create_chat(Some("a"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();
    engine
        .create_chat(Some("b"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();
    engine
        .create_chat(Some("c"), &ChatConfig::new(SYSTEM_PROMPT, "m2"))
        .unwrap();

    engine.load_chat("a").unwrap();
    engine.load_chat("b").unwrap();
    assert_eq!(engine.active_model(), Some("m1"));

    engine.load_chat("c").unwrap();
    assert_eq!(engine.active_model(), Some("m2"));
    assert!(!engine.is_chat_loaded("a"));
    assert!(!engine.is_chat_loaded("b"));
    assert!(engine.is_chat_loaded("c"));

    let stats = engine.runtime().stats();
    assert_eq!(stats.live_models(), 1);
    assert_eq!(stats.live_contexts(), 1);
    assert_eq!(stats.live_samplers(), 1);
}

#[test]
fn lru_eviction_releases_handles() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.sessions.max_loaded = 2;
    let mut engine = engine_with(&tmp, &config);
    for id in ["a", "b", "c"] {
        engine
            .create_chat(Some(id), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
            .unwrap();
    }

    engine.load_chat("a").unwrap();
    engine.load_chat("b").unwrap();
    engine.load_chat("a").unwrap();
    engine.load_chat("c").unwrap();

    assert!(engine.is_chat_loaded("a"));
    assert!(!engine.is_chat_loaded("b"));
    assert!(engine.is_chat_loaded("c"));
    let stats = engine.runtime().stats();
    assert_eq!(stats.live_contexts(), 2);
    assert_eq!(stats.live_samplers(), 2);
}

#[test]
fn cancelled_turn_persists_partial_reply() {
    let tmp = TempDir::new().unwrap();
    let mut engine = engine(&tmp);
    engine
        .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();
    engine.runtime().script_reply("x".repeat(45));

    let mut seen = String::new();
    let result = engine.generate_turn("c1", "stop early", &GeneratorConfig::default(), |c: &str| {
        seen.push_str(c);
        false
    });

    assert_eq!(status_code(&result), 20);
    assert_eq!(seen, "x".repeat(20));
    let history = engine.get_chat_history("c1").unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[1].content, "stop early");
    assert_eq!(history[2].role, Role::Assistant);
    assert_eq!(history[2].content, "x".repeat(20));
}

#[test]
fn turn_after_cancellation_answers_its_own_prompt() {
    let tmp = TempDir::new().unwrap();
    let mut engine = engine(&tmp);
    engine
        .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();
    engine.runtime().script_reply("x".repeat(45));
    engine
        .generate_turn("c1", "stop early", &GeneratorConfig::default(), |_: &str| false)
        .unwrap();
    assert!(engine.is_chat_loaded("c1"));

    let mut chunks = Vec::new();
    engine
        .generate_turn("c1", "hello", &GeneratorConfig::default(), collect(&mut chunks))
        .unwrap();
    assert_eq!(chunks.concat(), "hello");
}

#[test]
fn max_tokens_cut_does_not_leak_into_next_turn() {
    let tmp = TempDir::new().unwrap();
    let mut engine = engine(&tmp);
    engine
        .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();
    let mut short = GeneratorConfig::default();
    short.sampler.max_tokens = 3;

    let mut first = Vec::new();
    engine
        .generate_turn("c1", "abcdef", &short, collect(&mut first))
        .unwrap();
    assert_eq!(first.concat(), "abc");

    let mut second = Vec::new();
    engine
        .generate_turn("c1", "xyz", &GeneratorConfig::default(), collect(&mut second))
        .unwrap();
    assert_eq!(second.concat(), "xyz");
}

#[test]
fn sampler_failure_drops_the_session() {
    let tmp = TempDir::new().unwrap();
    let mut engine = engine(&tmp);
    engine
        .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();
    engine.load_chat("c1").unwrap();
    engine.runtime().fail_next_sample();

    let result = engine.generate_turn("c1", "hi", &GeneratorConfig::default(), |_: &str| true);

    assert!(matches!(result, Err(Error::Sample(_))));
    assert_eq!(status_code(&result), -1);
    assert!(!engine.is_chat_loaded("c1"));
    assert_eq!(engine.get_chat_history("c1").unwrap().len(), 1);
}

fn rag_config() -> GeneratorConfig {
    GeneratorConfig {
        rag_mode: RagMode::Always,
        rag: Some(GeneratorRagConfig {
            retrieval: RetrievalConfig::default(),
            semantic_space: "notes".into(),
            scope_id: "user-1".into(),
        }),
        ..GeneratorConfig::default()
    }
}

fn register_space(engine: &Engine<EchoRuntime, SqliteChatStore>, dir: &TempDir) {
    let weights = write_model(dir, "e5.bin", b"embedder");
    engine
        .register_model("e5", &weights, ModelType::Embedding)
        .unwrap();
    engine
        .create_semantic_space(&SemanticSpaceConfig {
            name: "notes".into(),
            embedding_model: "e5".into(),
            chunking: hearth::store::ChunkingConfig::default(),
            dimensions: 384,
        })
        .unwrap();
}

#[test]
fn rag_turn_embeds_query_and_releases_embedding_model() {
    let tmp = TempDir::new().unwrap();
    let mut engine = engine(&tmp);
    register_space(&engine, &tmp);
    engine
        .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();

    let mut chunks = Vec::new();
    engine
        .generate_turn("c1", "what did I say?", &rag_config(), collect(&mut chunks))
        .unwrap();

    assert_eq!(chunks.concat(), "what did I say?");
    let stats = engine.runtime().stats();
    assert_eq!(stats.models_loaded, 2);
    assert_eq!(stats.live_models(), 1);
    assert_eq!(stats.live_contexts(), 1);
    assert_eq!(engine.active_model(), Some("m1"));
}

#[test]
fn query_longer_than_embedding_window_fails_the_turn() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.runtime.embedding_context_size = 8;
    let mut engine = engine_with(&tmp, &config);
    register_space(&engine, &tmp);
    engine
        .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();

    let err = engine
        .generate_turn("c1", "a question well past eight tokens", &rag_config(), |_: &str| true)
        .unwrap_err();

    assert!(matches!(err, Error::ContextOverflow { window: 8, .. }));
    assert!(!engine.is_chat_loaded("c1"));
    assert_eq!(engine.get_chat_history("c1").unwrap().len(), 1);
}

#[test]
fn rag_misconfiguration_fails_before_loading_a_model() {
    let tmp = TempDir::new().unwrap();
    let mut engine = engine(&tmp);
    engine
        .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();

    let missing_rag = GeneratorConfig {
        rag_mode: RagMode::Always,
        rag: None,
        ..GeneratorConfig::default()
    };
    assert!(engine
        .generate_turn("c1", "hi", &missing_rag, |_: &str| true)
        .is_err());

    let unknown_space = GeneratorConfig {
        rag_mode: RagMode::Dynamic,
        rag: Some(GeneratorRagConfig {
            retrieval: RetrievalConfig::default(),
            semantic_space: "notes".into(),
            scope_id: "user-1".into(),
        }),
        ..GeneratorConfig::default()
    };
    let err = engine
        .generate_turn("c1", "hi", &unknown_space, |_: &str| true)
        .unwrap_err();
    assert!(matches!(err, Error::SemanticSpaceNotFound(_)));

    assert_eq!(engine.runtime().stats().models_loaded, 0);
    assert!(!engine.is_chat_loaded("c1"));
}

#[test]
fn history_survives_reopening_the_database() {
    let tmp = TempDir::new().unwrap();
    {
        let mut engine = engine(&tmp);
        engine
            .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
            .unwrap();
        engine
            .generate_turn("c1", "remember me", &GeneratorConfig::default(), |_: &str| true)
            .unwrap();
    }

    let store = SqliteChatStore::open(&tmp.path().join("hearth.db")).unwrap();
    let mut engine = Engine::new(EchoRuntime::new(), Arc::new(store), &Config::default());
    assert_eq!(engine.list_models().unwrap().len(), 1);
    engine.load_chat("c1").unwrap();
    let history = engine.get_chat_history("c1").unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].content, "remember me");
    assert_eq!(
        engine.chat_context_tokens("c1"),
        Some(history_prompt_tokens(&engine, &history))
    );
}

/// Tokens of `history` rendered without a generation prompt, as a rebuilt
/// context should hold them.
fn history_prompt_tokens(
    engine: &Engine<EchoRuntime, SqliteChatStore>,
    history: &[ChatMessage],
) -> u32 {
    let runtime = engine.runtime();
    let path = engine.resolve_model_path("m1").unwrap();
    let model = runtime.load_model(&path, ModelType::Llm).unwrap();
    let prompt = runtime
        .apply_chat_template(&model, &template_messages(history), false)
        .unwrap();
    u32::try_from(runtime.tokenize(&model, &prompt, true).unwrap().len()).unwrap()
}

#[test]
fn reloaded_multi_turn_history_matches_its_prompt() {
    let tmp = TempDir::new().unwrap();
    let mut engine = engine(&tmp);
    engine
        .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();
    for text in ["first", "second"] {
        engine
            .generate_turn("c1", text, &GeneratorConfig::default(), |_: &str| true)
            .unwrap();
    }
    assert!(engine.unload_chat("c1"));

    engine.load_chat("c1").unwrap();

    let history = engine.get_chat_history("c1").unwrap();
    assert_eq!(history.len(), 5);
    // Only a system-only history gets the synthetic empty user turn.
    assert_eq!(template_messages(&history).len(), history.len());
    let prompt = format!(
        "<|im_start|>system\n{SYSTEM_PROMPT}<|im_end|>\n\
         <|im_start|>user\nfirst<|im_end|>\n<|im_start|>assistant\nfirst<|im_end|>\n\
         <|im_start|>user\nsecond<|im_end|>\n<|im_start|>assistant\nsecond<|im_end|>\n"
    );
    let expected = u32::try_from(prompt.len()).unwrap() + 1;
    assert_eq!(history_prompt_tokens(&engine, &history), expected);
    assert_eq!(engine.chat_context_tokens("c1"), Some(expected));
}

/// Delegates to SQLite but can be told to fail message inserts.
struct FlakyStore {
    inner: SqliteChatStore,
    fail_inserts: AtomicBool,
}

impl ChatStore for FlakyStore {
    fn begin(&self) -> hearth::Result<()> {
        self.inner.begin()
    }
    fn commit(&self) -> hearth::Result<()> {
        self.inner.commit()
    }
    fn rollback(&self) -> hearth::Result<()> {
        self.inner.rollback()
    }
    fn transaction_depth(&self) -> u32 {
        self.inner.transaction_depth()
    }
    fn create_chat(&self, chat_id: &str, config: &ChatConfig) -> hearth::Result<()> {
        self.inner.create_chat(chat_id, config)
    }
    fn chat_exists(&self, chat_id: &str) -> hearth::Result<bool> {
        self.inner.chat_exists(chat_id)
    }
    fn get_chat_config(&self, chat_id: &str) -> hearth::Result<ChatConfig> {
        self.inner.get_chat_config(chat_id)
    }
    fn get_chat_history(&self, chat_id: &str) -> hearth::Result<Vec<ChatMessage>> {
        self.inner.get_chat_history(chat_id)
    }
    fn insert_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> hearth::Result<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Error::InvalidInput("disk full".into()));
        }
        self.inner.insert_messages(chat_id, messages)
    }
    fn insert_model(&self, record: &ModelRecord) -> hearth::Result<()> {
        self.inner.insert_model(record)
    }
    fn get_model(&self, name: &str) -> hearth::Result<Option<ModelRecord>> {
        self.inner.get_model(name)
    }
    fn update_model_path(&self, name: &str, path: &Path) -> hearth::Result<()> {
        self.inner.update_model_path(name, path)
    }
    fn list_models(&self) -> hearth::Result<Vec<ModelRecord>> {
        self.inner.list_models()
    }
    fn create_semantic_space(&self, config: &SemanticSpaceConfig) -> hearth::Result<()> {
        self.inner.create_semantic_space(config)
    }
    fn get_semantic_space(&self, name: &str) -> hearth::Result<Option<SemanticSpaceConfig>> {
        self.inner.get_semantic_space(name)
    }
    fn list_semantic_spaces(&self) -> hearth::Result<Vec<SemanticSpaceConfig>> {
        self.inner.list_semantic_spaces()
    }
    fn delete_semantic_space(&self, name: &str) -> hearth::Result<bool> {
        self.inner.delete_semantic_space(name)
    }
    fn name(&self) -> &str {
        "flaky"
    }
}

#[test]
fn persistence_failure_unloads_the_context() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(FlakyStore {
        inner: SqliteChatStore::open_in_memory().unwrap(),
        fail_inserts: AtomicBool::new(false),
    });
    let mut engine = Engine::new(EchoRuntime::new(), Arc::clone(&store), &Config::default());
    let weights = write_model(&tmp, "m1.bin", b"model one");
    engine.register_model("m1", &weights, ModelType::Llm).unwrap();
    engine
        .create_chat(Some("c1"), &ChatConfig::new(SYSTEM_PROMPT, "m1"))
        .unwrap();
    engine.load_chat("c1").unwrap();

    store.fail_inserts.store(true, Ordering::SeqCst);
    let mut streamed = String::new();
    let result = engine.generate_turn("c1", "hello", &GeneratorConfig::default(), |c: &str| {
        streamed.push_str(c);
        true
    });

    assert!(result.is_err());
    assert_eq!(streamed, "hello");
    assert!(!engine.is_chat_loaded("c1"));
    assert_eq!(store.transaction_depth(), 0);
    assert_eq!(engine.runtime().stats().live_contexts(), 0);

    store.fail_inserts.store(false, Ordering::SeqCst);
    engine.load_chat("c1").unwrap();
    assert_eq!(engine.get_chat_history("c1").unwrap().len(), 1);
}
