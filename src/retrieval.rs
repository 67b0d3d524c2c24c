//! Retrieval-augmented generation: configuration checks, query embedding and
//! the retrieval hook.
//!
//! No passage index is attached yet, so retrieval returns no passages. The
//! checks still run so a misconfigured request fails before any model work,
//! and the query is embedded so an oversized query fails the same way it will
//! once an index exists.

use crate::error::{Error, Result};
use crate::generation::{DecodeContext, GeneratorConfig, GeneratorRagConfig};
use crate::registry::ModelRegistry;
use crate::runtime::{ContextParams, InferenceRuntime, ModelType};
use crate::store::{ChatStore, ModelRecord, SemanticSpaceConfig};

/// Passages retrieved for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievedContext {
    pub passages: Vec<String>,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Prefix `prompt` with the retrieved passages, if any.
    pub fn augment(&self, prompt: &str) -> String {
        if self.is_empty() {
            return prompt.to_string();
        }
        let mut out = String::from("Context:\n");
        for passage in &self.passages {
            out.push_str(passage);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(prompt);
        out
    }
}

/// A validated retrieval request.
#[derive(Debug, Clone)]
pub struct RetrievalPlan {
    pub rag: GeneratorRagConfig,
    pub space: SemanticSpaceConfig,
    pub embedding_model: ModelRecord,
}

/// Check that `config`'s retrieval settings can be served: the semantic space
/// exists and its embedding model is registered as an embedding model.
/// Returns `None` when retrieval is off.
pub fn plan<S: ChatStore>(
    config: &GeneratorConfig,
    store: &S,
    registry: &ModelRegistry<S>,
) -> Result<Option<RetrievalPlan>> {
    if !config.wants_retrieval() {
        return Ok(None);
    }
    let rag = config
        .rag
        .as_ref()
        .ok_or_else(|| Error::Retrieval("rag_mode requires a rag config".into()))?;
    rag.validate()?;

    let space = store
        .get_semantic_space(&rag.semantic_space)?
        .ok_or_else(|| Error::SemanticSpaceNotFound(rag.semantic_space.clone()))?;

    let embedding_model = match registry.expect_type(&space.embedding_model, ModelType::Embedding) {
        Ok(record) => record,
        Err(Error::ModelNotFound(name)) => {
            return Err(Error::Retrieval(format!(
                "embedding model '{name}' for semantic space '{}' is not registered",
                space.name
            )));
        }
        Err(other) => return Err(other),
    };

    Ok(Some(RetrievalPlan {
        rag: rag.clone(),
        space,
        embedding_model,
    }))
}

/// Run `query` through the plan's embedding model in an embedding context.
/// The model and context live only for this call. Returns the number of
/// tokens embedded.
pub fn embed_query<R: InferenceRuntime>(
    runtime: &R,
    plan: &RetrievalPlan,
    params: &ContextParams,
    query: &str,
) -> Result<u32> {
    let model = runtime.load_model(&plan.embedding_model.path, ModelType::Embedding)?;
    let handle = runtime.create_context(&model, params)?;
    let mut context = DecodeContext::new(handle, params.context_size);
    let tokens = runtime.tokenize(&model, query, true)?;
    context.prefill(runtime, &tokens, false)?;
    tracing::debug!(
        model = %plan.embedding_model.name,
        tokens = context.next_position(),
        "Query embedded"
    );
    Ok(context.next_position())
}

/// Fetch passages for `query`.
pub fn retrieve(plan: &RetrievalPlan, query: &str) -> RetrievedContext {
    tracing::debug!(
        space = %plan.space.name,
        scope = %plan.rag.scope_id,
        top_k = plan.rag.retrieval.top_k,
        query_len = query.len(),
        "Retrieval requested; no index attached"
    );
    RetrievedContext::default()
}
