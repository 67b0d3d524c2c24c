pub mod echo;
pub mod traits;

pub use echo::EchoRuntime;
pub use traits::{Batch, ContextParams, InferenceRuntime, ModelType, TemplateMessage, Token};

use crate::config::RuntimeConfig;

/// Factory: create the right runtime from config
pub fn create_runtime(config: &RuntimeConfig) -> anyhow::Result<EchoRuntime> {
    match config.kind.as_str() {
        "echo" => Ok(EchoRuntime::new()),
        other if other.trim().is_empty() => {
            anyhow::bail!("runtime.kind cannot be empty. Supported values: echo")
        }
        other => anyhow::bail!("Unknown runtime kind '{other}'. Supported values: echo"),
    }
}
