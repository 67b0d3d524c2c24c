//! Streaming generation: sampling policy, the token loop and UTF-8 chunking.

pub mod policy;
pub mod stream;
pub mod utf8;

pub use policy::{
    GeneratorConfig, GeneratorRagConfig, RagMode, RetrievalConfig, SamplerConfig, SearchType,
};
pub use stream::{DecodeContext, FinishReason, GenerationOutcome, StreamingGenerator};
pub use utf8::safe_prefix_len;
