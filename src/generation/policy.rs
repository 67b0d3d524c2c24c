//! Per-call generation settings: sampling, retrieval mode and retrieval tuning.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Sampler chain settings: top-k, then top-p, then greedy pick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
}

fn default_max_tokens() -> u32 {
    512
}

fn default_top_p() -> f32 {
    0.9
}

fn default_top_k() -> u32 {
    50
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            top_k: default_top_k(),
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(Error::invalid("sampler.max_tokens must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::invalid(format!(
                "sampler.top_p must be within [0, 1], got {}",
                self.top_p
            )));
        }
        if self.top_k == 0 {
            return Err(Error::invalid("sampler.top_k must be greater than 0"));
        }
        Ok(())
    }
}

/// When retrieval-augmented generation runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RagMode {
    #[default]
    Never,
    Always,
    Dynamic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    VectorOnly,
    KeywordOnly,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_retrieval_top_k")]
    pub top_k: u32,
    /// Candidates fetched before reranking.
    #[serde(default = "default_fetch_k")]
    pub fetch_k: u32,
    #[serde(default)]
    pub score_threshold: f32,
    #[serde(default)]
    pub search_type: SearchType,
    #[serde(default)]
    pub use_reranker: bool,
    /// Neighbouring chunks pulled in around each hit.
    #[serde(default)]
    pub context_window: u32,
}

fn default_retrieval_top_k() -> u32 {
    5
}

fn default_fetch_k() -> u32 {
    20
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_retrieval_top_k(),
            fetch_k: default_fetch_k(),
            score_threshold: 0.0,
            search_type: SearchType::default(),
            use_reranker: false,
            context_window: 0,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(Error::Retrieval("retrieval.top_k must be greater than 0".into()));
        }
        if !(0.0..=1.0).contains(&self.score_threshold) {
            return Err(Error::Retrieval(format!(
                "retrieval.score_threshold must be within [0, 1], got {}",
                self.score_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorRagConfig {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub semantic_space: String,
    /// Restricts retrieval to documents tagged with this scope.
    pub scope_id: String,
}

impl GeneratorRagConfig {
    pub fn validate(&self) -> Result<()> {
        self.retrieval.validate()?;
        if self.semantic_space.trim().is_empty() {
            return Err(Error::Retrieval("rag.semantic_space cannot be empty".into()));
        }
        if self.scope_id.trim().is_empty() {
            return Err(Error::Retrieval("rag.scope_id cannot be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub rag_mode: RagMode,
    #[serde(default)]
    pub rag: Option<GeneratorRagConfig>,
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        self.sampler.validate()?;
        match (self.rag_mode, &self.rag) {
            (RagMode::Never, None) => Ok(()),
            (RagMode::Never, Some(_)) => Err(Error::Retrieval(
                "rag config given but rag_mode is 'never'".into(),
            )),
            (_, None) => Err(Error::Retrieval(
                "rag_mode requires a rag config".into(),
            )),
            (_, Some(rag)) => rag.validate(),
        }
    }

    pub fn wants_retrieval(&self) -> bool {
        self.rag_mode != RagMode::Never
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rag() -> GeneratorRagConfig {
        GeneratorRagConfig {
            retrieval: RetrievalConfig::default(),
            semantic_space: "notes".into(),
            scope_id: "user-1".into(),
        }
    }

    #[test]
    fn default_sampler_matches_runtime_chain() {
        let s = SamplerConfig::default();
        assert_eq!(s.top_k, 50);
        assert!((s.top_p - 0.9).abs() < f32::EPSILON);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn sampler_bounds() {
        let mut s = SamplerConfig::default();
        s.max_tokens = 0;
        assert!(s.validate().is_err());

        let mut s = SamplerConfig::default();
        s.top_p = 1.5;
        assert!(s.validate().is_err());

        let mut s = SamplerConfig::default();
        s.top_p = 1.0;
        assert!(s.validate().is_ok());

        let mut s = SamplerConfig::default();
        s.top_k = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn never_mode_rejects_rag_config() {
        let cfg = GeneratorConfig {
            rag: Some(rag()),
            ..GeneratorConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, Error::Retrieval(_)));
    }

    #[test]
    fn always_and_dynamic_require_sane_rag() {
        for mode in [RagMode::Always, RagMode::Dynamic] {
            let missing = GeneratorConfig {
                rag_mode: mode,
                ..GeneratorConfig::default()
            };
            assert!(missing.validate().is_err());

            let ok = GeneratorConfig {
                rag_mode: mode,
                rag: Some(rag()),
                ..GeneratorConfig::default()
            };
            assert!(ok.validate().is_ok());

            let mut bad = rag();
            bad.scope_id = String::new();
            let bad = GeneratorConfig {
                rag_mode: mode,
                rag: Some(bad),
                ..GeneratorConfig::default()
            };
            assert!(bad.validate().is_err());
        }
    }

    #[test]
    fn retrieval_threshold_bounds() {
        let mut r = RetrievalConfig::default();
        r.score_threshold = -0.1;
        assert!(r.validate().is_err());
        r.score_threshold = 1.0;
        assert!(r.validate().is_ok());
        r.top_k = 0;
        assert!(r.validate().is_err());
    }

    #[test]
    fn generator_config_deserializes_with_defaults() {
        let cfg: GeneratorConfig = serde_json::from_str(
            r#"{"rag_mode":"always","rag":{"semantic_space":"notes","scope_id":"s"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.rag_mode, RagMode::Always);
        assert_eq!(cfg.sampler, SamplerConfig::default());
        assert_eq!(cfg.rag.unwrap().retrieval.search_type, SearchType::Hybrid);
    }
}
