//! Text-generation gateway used by summarization
//!
//! The LLM is an external collaborator; the engine only needs a narrow
//! "generate text for this prompt" capability and the two fixed
//! summarization instructions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// System instruction for condensing raw messages into a base summary.
pub(crate) const BASE_SUMMARY_INSTRUCTION: &str = "You summarize conversations \
for an agent's long-term memory. Condense the conversation below into 2-3 \
sentences. Keep decisions, facts about the user, and open commitments; drop \
small talk.";

/// System instruction for consolidating summaries one level up the ladder.
pub(crate) const RECURSIVE_SUMMARY_INSTRUCTION: &str = "You consolidate \
conversation summaries for an agent's long-term memory. Merge the summaries \
below into a single 3-4 sentence summary. Preserve durable facts and \
decisions; collapse repetition.";

pub(crate) const SUMMARY_TEMPERATURE: f32 = 0.3;

/// One generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            prompt: prompt.into(),
            temperature: 0.7,
            max_tokens: 512,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Trait for the text-generation capability behind summarization.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a completion. Failures surface as [`EngineError::Llm`];
    /// the summary ladder inserts nothing on failure.
    async fn generate(&self, request: GenerationRequest) -> EngineResult<String>;
}

/// Generator that returns a fixed response, or fails. For tests.
#[derive(Debug, Clone)]
pub struct CannedGenerator {
    response: Option<String>,
}

impl CannedGenerator {
    pub fn replying(response: impl Into<String>) -> Self {
        Self {
            response: Some(response.into()),
        }
    }

    pub fn failing() -> Self {
        Self { response: None }
    }
}

#[async_trait]
impl TextGenerator for CannedGenerator {
    async fn generate(&self, _request: GenerationRequest) -> EngineResult<String> {
        match &self.response {
            Some(text) => Ok(text.clone()),
            None => Err(EngineError::llm("canned generator configured to fail")),
        }
    }
}
