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
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unused_self
)]

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use hearth::{
    build_engine, ChatConfig, ChatStore, Config, Engine, GeneratorConfig, InferenceRuntime,
    ModelType, SamplerConfig,
};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// `hearth` - a chat runtime that keeps the model warm between turns.
#[derive(Parser, Debug)]
#[command(name = "hearth")]
#[command(version)]
#[command(about = "On-device chat runtime with warm sessions and streaming replies.", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register and inspect model files
    Model {
        #[command(subcommand)]
        model_command: ModelCommands,
    },

    /// Create chats and talk to them
    #[command(long_about = "\
Create chats and talk to them.

Each chat keeps its own history in the database. Replies stream to stdout \
as they are generated and the exchange is saved once the reply finishes.

Examples:
  hearth chat create --model m1 --system \"You are concise.\"
  hearth chat send chat_1f2e... \"What is a KV cache?\"
  hearth chat repl chat_1f2e...")]
    Chat {
        #[command(subcommand)]
        chat_command: ChatCommands,
    },

    /// One-shot completion that keeps no history
    Complete {
        /// Registered language model to use
        #[arg(short, long)]
        model: String,

        /// Prompt text
        prompt: String,

        #[command(flatten)]
        sampling: SamplingArgs,
    },

    /// Manage configuration
    #[command(long_about = "\
Manage hearth configuration.

Examples:
  hearth config schema              # print JSON Schema to stdout
  hearth config schema > schema.json")]
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `hearth`.

The script is printed to stdout so it can be sourced directly:

Examples:
  source <(hearth completions bash)
  hearth completions zsh > ~/.zfunc/_hearth
  hearth completions fish > ~/.config/fish/completions/hearth.fish")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand, Debug)]
enum ModelCommands {
    /// Register a model file under a name, recording its SHA-256
    Register {
        name: String,
        path: PathBuf,
        /// llm or embedding
        #[arg(short = 't', long = "type", default_value = "llm")]
        model_type: ModelType,
    },
    /// Point a registered model at a moved file with identical contents
    UpdatePath { name: String, path: PathBuf },
    /// List registered models
    List,
}

#[derive(Subcommand, Debug)]
enum ChatCommands {
    /// Create a chat and print its id
    Create {
        /// Registered language model for this chat
        #[arg(short, long)]
        model: String,
        #[arg(short, long, default_value = "")]
        system: String,
        /// Use this id instead of a generated one
        #[arg(long)]
        id: Option<String>,
        /// Do not save turns to the database
        #[arg(long)]
        no_persist: bool,
    },
    /// Print a chat's stored history
    History { chat_id: String },
    /// Send one message and stream the reply
    Send {
        chat_id: String,
        message: String,
        #[command(flatten)]
        sampling: SamplingArgs,
    },
    /// Interactive loop over stdin; an empty line or `/exit` quits
    Repl {
        chat_id: String,
        #[command(flatten)]
        sampling: SamplingArgs,
    },
    /// Drop a chat's warm context
    Unload { chat_id: String },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Dump the full configuration JSON Schema to stdout
    Schema,
}

#[derive(clap::Args, Debug, Default, Clone)]
struct SamplingArgs {
    /// Maximum tokens to generate
    #[arg(long)]
    max_tokens: Option<u32>,
    #[arg(long)]
    top_k: Option<u32>,
    #[arg(long)]
    top_p: Option<f32>,
}

impl SamplingArgs {
    fn apply(&self, defaults: &SamplerConfig) -> SamplerConfig {
        SamplerConfig {
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            top_k: self.top_k.unwrap_or(defaults.top_k),
            top_p: self.top_p.unwrap_or(defaults.top_p),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("HEARTH_CONFIG_DIR", config_dir);
    }

    // Completions and the schema dump stay stdout-only: no config, no logging.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout().lock();
            return write_shell_completion(*shell, &mut stdout);
        }
        Commands::Config {
            config_command: ConfigCommands::Schema,
        } => {
            let schema = schemars::schema_for!(Config);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            return Ok(());
        }
        _ => {}
    }

    // Logs go to stderr so streamed replies on stdout stay clean.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load_or_init().await?;
    let mut engine = build_engine(&config)?;

    match cli.command {
        Commands::Completions { .. } | Commands::Config { .. } => unreachable!(),
        Commands::Model { model_command } => handle_model_command(&engine, model_command),
        Commands::Chat { chat_command } => handle_chat_command(&mut engine, chat_command),
        Commands::Complete {
            model,
            prompt,
            sampling,
        } => {
            let sampler = sampling.apply(engine.default_sampler());
            let mut stdout = std::io::stdout().lock();
            let tokens = engine.generate_completion(&model, &prompt, &sampler, |chunk: &str| {
                stream_chunk(&mut stdout, chunk)
            })?;
            writeln!(stdout)?;
            tracing::debug!(tokens, "Completion finished");
            Ok(())
        }
    }
}

fn handle_model_command<R: InferenceRuntime, S: ChatStore>(
    engine: &Engine<R, S>,
    command: ModelCommands,
) -> Result<()> {
    match command {
        ModelCommands::Register {
            name,
            path,
            model_type,
        } => {
            let record = engine.register_model(&name, &path, model_type)?;
            println!("Registered {} ({}) sha256:{}", record.name, record.model_type, record.checksum);
        }
        ModelCommands::UpdatePath { name, path } => {
            engine.update_model_path(&name, &path)?;
            println!("Updated {name} -> {}", path.display());
        }
        ModelCommands::List => {
            let models = engine.list_models()?;
            if models.is_empty() {
                println!("No models registered.");
            }
            for model in models {
                println!(
                    "  {:<20} {:<10} {}",
                    model.name,
                    model.model_type,
                    model.path.display()
                );
            }
        }
    }
    Ok(())
}

fn handle_chat_command<R: InferenceRuntime, S: ChatStore>(
    engine: &mut Engine<R, S>,
    command: ChatCommands,
) -> Result<()> {
    match command {
        ChatCommands::Create {
            model,
            system,
            id,
            no_persist,
        } => {
            let mut chat = ChatConfig::new(system, model);
            chat.persistence = !no_persist;
            let chat_id = engine.create_chat(id.as_deref(), &chat)?;
            println!("{chat_id}");
        }
        ChatCommands::History { chat_id } => {
            for message in engine.get_chat_history(&chat_id)? {
                println!("[{}] {}: {}", message.sequence_index, message.role, message.content);
            }
        }
        ChatCommands::Send {
            chat_id,
            message,
            sampling,
        } => {
            let generator = GeneratorConfig {
                sampler: sampling.apply(engine.default_sampler()),
                ..GeneratorConfig::default()
            };
            send_turn(engine, &chat_id, &message, &generator)?;
        }
        ChatCommands::Repl { chat_id, sampling } => {
            let generator = GeneratorConfig {
                sampler: sampling.apply(engine.default_sampler()),
                ..GeneratorConfig::default()
            };
            engine.load_chat(&chat_id)?;
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = line?;
                let text = line.trim();
                if text.is_empty() || text == "/exit" {
                    break;
                }
                send_turn(engine, &chat_id, text, &generator)?;
            }
        }
        ChatCommands::Unload { chat_id } => {
            // A fresh process holds no warm contexts, so this only reports.
            let unloaded = engine.unload_chat(&chat_id);
            println!("{chat_id}: {}", if unloaded { "unloaded" } else { "not loaded" });
        }
    }
    Ok(())
}

fn send_turn<R: InferenceRuntime, S: ChatStore>(
    engine: &mut Engine<R, S>,
    chat_id: &str,
    text: &str,
    generator: &GeneratorConfig,
) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    let tokens = engine.generate_turn(chat_id, text, generator, |chunk: &str| {
        stream_chunk(&mut stdout, chunk)
    })?;
    writeln!(stdout)?;
    tracing::debug!(chat_id, tokens, "Turn finished");
    Ok(())
}

/// Write one streamed chunk; a closed stdout cancels generation.
fn stream_chunk<W: Write>(writer: &mut W, chunk: &str) -> bool {
    writer
        .write_all(chunk.as_bytes())
        .and_then(|()| writer.flush())
        .is_ok()
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}
