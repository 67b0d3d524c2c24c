use crate::generation::SamplerConfig;
use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

const CONFIG_FILE_NAME: &str = "config.toml";
const DEFAULT_DATABASE_FILE: &str = "hearth.db";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level hearth configuration, loaded from `config.toml`.
///
/// Resolution order: `HEARTH_CONFIG_DIR` env → `~/.hearth/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// SQLite database holding chats, messages and the model registry.
    /// Relative paths resolve against the config directory. Default: `hearth.db`.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Inference runtime configuration (`[runtime]`).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Streaming and default sampling settings (`[generation]`).
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Warm session cache settings (`[sessions]`).
    #[serde(default)]
    pub sessions: SessionConfig,
}

fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE_FILE)
}

// ── Runtime ──────────────────────────────────────────────────────

/// Inference runtime configuration (`[runtime]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeConfig {
    /// Runtime kind (currently only `echo`).
    #[serde(default = "default_runtime_kind")]
    pub kind: String,

    /// Worker threads handed to the runtime per context.
    #[serde(default = "default_threads")]
    pub threads: u32,

    /// Context window for chat and completion contexts, in tokens.
    #[serde(default = "default_llm_context_size")]
    pub llm_context_size: u32,

    /// Context window for embedding contexts, in tokens.
    #[serde(default = "default_embedding_context_size")]
    pub embedding_context_size: u32,
}

fn default_runtime_kind() -> String {
    "echo".into()
}

fn default_threads() -> u32 {
    4
}

fn default_llm_context_size() -> u32 {
    2048
}

fn default_embedding_context_size() -> u32 {
    512
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: default_runtime_kind(),
            threads: default_threads(),
            llm_context_size: default_llm_context_size(),
            embedding_context_size: default_embedding_context_size(),
        }
    }
}

// ── Generation ───────────────────────────────────────────────────

/// Streaming and default sampler settings (`[generation]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GenerationConfig {
    /// Tokens buffered before each callback flush. Default: `20`.
    #[serde(default = "default_flush_every")]
    pub flush_every: u32,

    /// Upper bound on generated tokens per turn. Default: `512`.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_top_k")]
    pub top_k: u32,

    /// Nucleus sampling mass (0.0–1.0). Default: `0.9`.
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

fn default_flush_every() -> u32 {
    20
}

fn default_max_tokens() -> u32 {
    512
}

fn default_top_k() -> u32 {
    50
}

fn default_top_p() -> f32 {
    0.9
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            flush_every: default_flush_every(),
            max_tokens: default_max_tokens(),
            top_k: default_top_k(),
            top_p: default_top_p(),
        }
    }
}

impl GenerationConfig {
    /// Sampler settings used when a caller does not pass its own.
    pub fn sampler(&self) -> SamplerConfig {
        SamplerConfig {
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            top_k: self.top_k,
        }
    }
}

// ── Sessions ─────────────────────────────────────────────────────

/// Warm session cache configuration (`[sessions]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionConfig {
    /// Maximum chat contexts kept in memory; the least recently used one is
    /// released when a new chat is loaded at capacity. Default: `8`.
    #[serde(default = "default_max_loaded")]
    pub max_loaded: usize,
}

fn default_max_loaded() -> usize {
    8
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_loaded: default_max_loaded(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let hearth_dir = UserDirs::new()
            .map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf())
            .join(".hearth");

        Self {
            config_path: hearth_dir.join(CONFIG_FILE_NAME),
            database_path: default_database_path(),
            runtime: RuntimeConfig::default(),
            generation: GenerationConfig::default(),
            sessions: SessionConfig::default(),
        }
    }
}

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".hearth"))
}

fn resolve_config_dir() -> Result<PathBuf> {
    match std::env::var("HEARTH_CONFIG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir)),
        _ => default_config_dir(),
    }
}

impl Config {
    pub async fn load_or_init() -> Result<Self> {
        let hearth_dir = resolve_config_dir()?;
        Self::load_or_init_in(&hearth_dir).await
    }

    /// Load `config.toml` from `hearth_dir`, writing a default one first when
    /// it does not exist yet.
    pub async fn load_or_init_in(hearth_dir: &Path) -> Result<Self> {
        let config_path = hearth_dir.join(CONFIG_FILE_NAME);

        fs::create_dir_all(hearth_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                hearth_dir.display()
            )
        })?;

        let initialized = if config_path.exists() {
            false
        } else {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.save().await?;
            true
        };

        let contents = fs::read_to_string(&config_path)
            .await
            .context("Failed to read config file")?;
        let mut config: Config =
            toml::from_str(&contents).context("Failed to parse config file")?;
        config.config_path = config_path;

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            database = %config.resolved_database_path().display(),
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    /// Database path with relative values resolved against the config directory.
    pub fn resolved_database_path(&self) -> PathBuf {
        if self.database_path.is_absolute() {
            return self.database_path.clone();
        }
        self.config_path
            .parent()
            .map_or_else(|| self.database_path.clone(), |dir| dir.join(&self.database_path))
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.runtime.kind.trim().is_empty() {
            anyhow::bail!("runtime.kind must not be empty");
        }
        if self.runtime.threads == 0 {
            anyhow::bail!("runtime.threads must be greater than 0");
        }
        if self.runtime.llm_context_size == 0 {
            anyhow::bail!("runtime.llm_context_size must be greater than 0");
        }
        if self.runtime.embedding_context_size == 0 {
            anyhow::bail!("runtime.embedding_context_size must be greater than 0");
        }

        if self.generation.flush_every == 0 {
            anyhow::bail!("generation.flush_every must be greater than 0");
        }
        self.generation
            .sampler()
            .validate()
            .context("Invalid [generation] sampler settings")?;

        if self.sessions.max_loaded == 0 {
            anyhow::bail!("sessions.max_loaded must be greater than 0");
        }

        if self.database_path.as_os_str().is_empty() {
            anyhow::bail!("database_path must not be empty");
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Database: HEARTH_DB_PATH
        if let Ok(path) = std::env::var("HEARTH_DB_PATH") {
            if !path.is_empty() {
                self.database_path = PathBuf::from(path);
            }
        }

        // Runtime kind: HEARTH_RUNTIME
        if let Ok(kind) = std::env::var("HEARTH_RUNTIME") {
            if !kind.is_empty() {
                self.runtime.kind = kind;
            }
        }

        if let Some(threads) = parse_env_number::<u32>("HEARTH_THREADS") {
            self.runtime.threads = threads;
        }
        if let Some(size) = parse_env_number::<u32>("HEARTH_CONTEXT_SIZE") {
            self.runtime.llm_context_size = size;
        }
        if let Some(flush) = parse_env_number::<u32>("HEARTH_FLUSH_EVERY") {
            self.generation.flush_every = flush;
        }
        if let Some(max) = parse_env_number::<usize>("HEARTH_MAX_LOADED_SESSIONS") {
            self.sessions.max_loaded = max;
        }
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or(CONFIG_FILE_NAME);
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await?;
        Ok(())
    }
}

fn parse_env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring non-numeric environment override");
            None
        }
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
