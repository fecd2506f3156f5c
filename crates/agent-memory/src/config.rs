//! Engine configuration
//!
//! Plain structs with `Default` impls. The engine is a library: nothing
//! here is read from the environment, hosts construct and pass these in.

use serde::{Deserialize, Serialize};

/// Top-level configuration handed to [`crate::MemoryDatabase`] at open.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub embedding: EmbeddingConfig,
    pub summaries: SummaryConfig,
}

/// Tuning for the semantic index.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Expected vector dimension of the configured embedding model.
    pub dimension: usize,
    /// Default result count for semantic block search.
    pub search_limit: usize,
    /// Minimum cosine similarity for a result to be kept.
    pub similarity_threshold: f32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: 768,
            search_limit: 5,
            similarity_threshold: 0.5,
        }
    }
}

/// Tuning for the hierarchical summary ladder.
#[derive(Debug, Clone)]
pub struct SummaryConfig {
    /// Minimum messages buffered before a base summary is worth creating.
    /// Advisory: the host decides when to call, the engine does not enforce.
    pub base_threshold: usize,
    /// Unconsolidated summaries at one level that trigger a promotion.
    pub recursive_threshold: usize,
    /// Highest level the ladder may produce.
    pub max_level: i64,
    /// Base summaries loaded into the prompt fragment.
    pub recent_count: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            base_threshold: 20,
            recursive_threshold: 10,
            max_level: 3,
            recent_count: 3,
        }
    }
}

/// The persona on whose behalf summaries are generated. Its `model` is the
/// model id handed to the text generator for every summarization call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            name: "assistant".to_string(),
            model: "local-chat".to_string(),
            system_prompt: String::new(),
        }
    }
}
