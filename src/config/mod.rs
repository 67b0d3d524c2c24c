pub mod schema;

pub use schema::{Config, GenerationConfig, RuntimeConfig, SessionConfig};
