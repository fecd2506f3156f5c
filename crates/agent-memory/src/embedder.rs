//! Embedding gateway: text → fixed-dimension vector
//!
//! The engine treats the embedding model as an optional external
//! collaborator. Absence or failure degrades semantic search to substring
//! search and never blocks a content write.

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};

/// Common embedding dimensions for popular models
pub const EMBEDDING_DIM_384: usize = 384; // all-MiniLM-L6-v2
pub const EMBEDDING_DIM_768: usize = 768; // all-mpnet-base-v2
pub const EMBEDDING_DIM_1536: usize = 1536; // text-embedding-ada-002

/// Trait for generating text embeddings.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Dimension of every vector this embedder produces.
    fn dimension(&self) -> usize;

    /// Model name or identifier.
    fn model_name(&self) -> &str;

    /// Embed a single text. Implementations fail with
    /// [`EngineError::EmbeddingUnavailable`] when the model cannot be
    /// reached or returns no vector.
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;
}

/// Deterministic embedder for tests and hosts without a real model.
///
/// Maps text to a unit vector seeded from its bytes. Not suitable for real
/// semantic search.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        assert!(dimension > 0, "embedding dimension must be positive");
        Self { dimension }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIM_384)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embedder"
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let mut seed: u64 = 0;
        for (i, &byte) in text.as_bytes().iter().enumerate() {
            seed = seed.wrapping_add(u64::from(byte) * (i as u64 + 1));
            seed = seed.wrapping_mul(31);
        }

        let mut embedding = vec![0.0f32; self.dimension];
        for (i, value) in embedding.iter_mut().enumerate() {
            let hash = seed.wrapping_add(i as u64).wrapping_mul(0x517c_c1b7_2722_0a95);
            *value = (hash as i64) as f32 / i64::MAX as f32;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        Ok(embedding)
    }
}

/// Embedder that always fails. Exercises the degradation paths in tests.
#[derive(Debug, Clone, Default)]
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn dimension(&self) -> usize {
        EMBEDDING_DIM_384
    }

    fn model_name(&self) -> &str {
        "failing-embedder"
    }

    async fn embed(&self, _text: &str) -> EngineResult<Vec<f32>> {
        Err(EngineError::embedding("model endpoint unreachable"))
    }
}
