//! Error types for the memory engine

use thiserror::Error;

/// Result type for all engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine errors, distinguishable by callers.
///
/// `BlockNotFound`, `ContentNotFound` and `BlockConflict` are logical
/// failures: the tool layer turns them into `success: false` responses
/// instead of surfacing them as fatal errors. `EmbeddingUnavailable` is
/// swallowed inside content-mutating operations and only reaches callers
/// of semantic search, who fall back to substring matching.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Any SQL or connection-pool error. Fatal to the operation.
    #[error("storage failure during {operation}: {reason}")]
    Storage { operation: String, reason: String },

    /// Content-layer failure: cache state, metadata parse, bad arguments.
    #[error("memory failure during {operation}: {reason}")]
    Memory { operation: String, reason: String },

    /// The referenced block does not exist.
    #[error("block not found: {id}")]
    BlockNotFound { id: String },

    /// The substring to replace does not occur in the block.
    #[error("content not found in block {id}")]
    ContentNotFound { id: String },

    /// A block with this id already exists.
    #[error("block already exists: {id}")]
    BlockConflict { id: String },

    /// The embedding model is absent, unreachable, or returned a vector of
    /// the wrong length.
    #[error("embedding service unavailable: {reason}")]
    EmbeddingUnavailable { reason: String },

    /// The language model call behind summarization failed.
    #[error("language model call failed: {reason}")]
    Llm { reason: String },

    /// Cosine similarity was asked to compare vectors of unequal length.
    /// This is a programmer error, never a data condition.
    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

impl EngineError {
    pub(crate) fn storage(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn memory(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Memory {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn embedding(reason: impl ToString) -> Self {
        Self::EmbeddingUnavailable {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn llm(reason: impl ToString) -> Self {
        Self::Llm {
            reason: reason.to_string(),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::storage("sql", err)
    }
}

impl From<r2d2::Error> for EngineError {
    fn from(err: r2d2::Error) -> Self {
        Self::storage("pool", err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::memory("json", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = EngineError::storage("insert block", "disk I/O error");
        assert!(err.to_string().contains("insert block"));
        assert!(err.to_string().contains("disk I/O error"));

        let err = EngineError::BlockNotFound {
            id: "persona".to_string(),
        };
        assert!(err.to_string().contains("persona"));
    }

    #[test]
    fn dimension_mismatch_names_both_lengths() {
        let err = EngineError::DimensionMismatch { left: 768, right: 384 };
        let msg = err.to_string();
        assert!(msg.contains("768"));
        assert!(msg.contains("384"));
    }
}
