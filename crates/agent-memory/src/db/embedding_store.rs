//! Semantic index: per-item embeddings and cosine ranking
//!
//! Embedding rows are a lossy cache parallel to `blocks` and `archival`.
//! Absence means "not yet embedded or the model was unavailable"; presence
//! is not a consistency guarantee with the current content. There is no
//! foreign key: stale rows are tolerated and cleaned up opportunistically.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::params;
use tracing::{debug, warn};

use super::schema::{ArchivalEntry, Block, EMBEDDING_SCHEMA_SQL};
use super::SqlitePool;
use crate::embedder::Embedder;
use crate::error::{EngineError, EngineResult};
use crate::util::now_ms;

/// Cosine similarity of two vectors of equal length.
///
/// Returns `0.0` when either norm is zero. Unequal lengths are a
/// programmer error, not a data condition.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> EngineResult<f32> {
    if a.len() != b.len() {
        return Err(EngineError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        Ok(0.0)
    } else {
        Ok(dot / (norm_a * norm_b))
    }
}

/// Counts and shape of the stored embeddings.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EmbeddingStats {
    pub block_embeddings: usize,
    pub archival_embeddings: usize,
    pub dimension: usize,
    pub model: Option<String>,
}

/// Store for the `block_embeddings` / `archival_embeddings` tables.
///
/// Cloneable so the block store can drive refreshes through its own handle.
#[derive(Clone)]
pub struct EmbeddingStore {
    pool: SqlitePool,
    embedder: Option<Arc<dyn Embedder>>,
}

impl EmbeddingStore {
    pub fn new(pool: SqlitePool, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self { pool, embedder }
    }

    pub fn initialize(&self) -> EngineResult<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(EMBEDDING_SCHEMA_SQL)?;
        Ok(())
    }

    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    /// Embed `text` through the configured model, validating the dimension
    /// the model promised.
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| EngineError::embedding("no embedding model configured"))?;
        let vector = embedder.embed(text).await?;
        if vector.is_empty() || vector.len() != embedder.dimension() {
            return Err(EngineError::embedding(format!(
                "model {} returned a vector of length {}, expected {}",
                embedder.model_name(),
                vector.len(),
                embedder.dimension()
            )));
        }
        Ok(vector)
    }

    pub fn store_block_embedding(&self, block_id: &str, vector: &[f32]) -> EngineResult<()> {
        self.store_row("block_embeddings", "block_id", block_id, vector)
    }

    pub fn store_archival_embedding(&self, entry_id: &str, vector: &[f32]) -> EngineResult<()> {
        self.store_row("archival_embeddings", "entry_id", entry_id, vector)
    }

    fn store_row(&self, table: &str, key_column: &str, id: &str, vector: &[f32]) -> EngineResult<()> {
        let encoded = serde_json::to_string(vector)?;
        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} ({}, embedding, updated_at) VALUES (?1, ?2, ?3)",
                table, key_column
            ),
            params![id, encoded, now_ms()],
        )?;
        Ok(())
    }

    pub fn delete_block_embedding(&self, block_id: &str) -> EngineResult<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM block_embeddings WHERE block_id = ?1", [block_id])?;
        Ok(())
    }

    pub fn delete_archival_embedding(&self, entry_id: &str) -> EngineResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM archival_embeddings WHERE entry_id = ?1",
            [entry_id],
        )?;
        Ok(())
    }

    pub fn load_all_block_embeddings(&self) -> EngineResult<HashMap<String, Vec<f32>>> {
        self.load_all("block_embeddings", "block_id")
    }

    pub fn load_all_archival_embeddings(&self) -> EngineResult<HashMap<String, Vec<f32>>> {
        self.load_all("archival_embeddings", "entry_id")
    }

    fn load_all(&self, table: &str, key_column: &str) -> EngineResult<HashMap<String, Vec<f32>>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("SELECT {}, embedding FROM {}", key_column, table))?;
        let mut rows = stmt.query([])?;

        let mut map = HashMap::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let encoded: String = row.get(1)?;
            match serde_json::from_str::<Vec<f32>>(&encoded) {
                Ok(vector) => {
                    map.insert(id, vector);
                }
                Err(e) => warn!("discarding unreadable embedding for {}: {}", id, e),
            }
        }
        Ok(map)
    }

    /// Generate and store the embedding for one block's current content.
    pub async fn refresh_block(&self, block_id: &str, content: &str) -> EngineResult<()> {
        let vector = self.embed(content).await?;
        self.store_block_embedding(block_id, &vector)
    }

    /// Generate and store the embedding for one archival entry.
    pub async fn refresh_archival(&self, entry_id: &str, content: &str) -> EngineResult<()> {
        let vector = self.embed(content).await?;
        self.store_archival_embedding(entry_id, &vector)
    }

    /// Generate embeddings for every block that lacks one. Per-item
    /// failures are logged and skipped; returns the count generated.
    pub async fn ensure_block_embeddings(&self, blocks: &[Block]) -> EngineResult<usize> {
        if self.embedder.is_none() {
            return Err(EngineError::embedding("no embedding model configured"));
        }
        let existing = self.load_all_block_embeddings()?;

        let mut generated = 0;
        for block in blocks {
            if existing.contains_key(&block.id) {
                continue;
            }
            match self.refresh_block(&block.id, &block.content).await {
                Ok(()) => generated += 1,
                Err(e) => warn!("embedding for block {} skipped: {}", block.id, e),
            }
        }
        debug!("ensured embeddings, {} generated", generated);
        Ok(generated)
    }

    /// Rank `blocks` against `query` by cosine similarity.
    ///
    /// Blocks without a stored embedding are silently skipped. Results are
    /// sorted descending by score; ties keep the input order of `blocks`.
    pub async fn search_blocks(
        &self,
        query: &str,
        blocks: &[Block],
        limit: usize,
        threshold: f32,
    ) -> EngineResult<Vec<(Block, f32)>> {
        let query_vector = self.embed(query).await?;
        let stored = self.load_all_block_embeddings()?;

        let mut scored = Vec::new();
        for block in blocks {
            let Some(vector) = stored.get(&block.id) else {
                continue;
            };
            let score = cosine_similarity(&query_vector, vector)?;
            if score >= threshold {
                scored.push((block.clone(), score));
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Rank archival entries against `query`. Same contract as
    /// [`Self::search_blocks`].
    pub async fn search_archival(
        &self,
        query: &str,
        entries: &[ArchivalEntry],
        limit: usize,
        threshold: f32,
    ) -> EngineResult<Vec<(ArchivalEntry, f32)>> {
        let query_vector = self.embed(query).await?;
        let stored = self.load_all_archival_embeddings()?;

        let mut scored = Vec::new();
        for entry in entries {
            let Some(vector) = stored.get(&entry.id) else {
                continue;
            };
            let score = cosine_similarity(&query_vector, vector)?;
            if score >= threshold {
                scored.push((entry.clone(), score));
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    pub fn stats(&self) -> EngineResult<EmbeddingStats> {
        let conn = self.pool.get()?;
        let block_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM block_embeddings", [], |row| row.get(0))?;
        let archival_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM archival_embeddings", [], |row| row.get(0))?;

        let mut stmt = conn.prepare("SELECT embedding FROM block_embeddings LIMIT 1")?;
        let dimension = if let Some(row) = stmt.query([])?.next()? {
            let encoded: String = row.get(0)?;
            serde_json::from_str::<Vec<f32>>(&encoded)
                .map(|v| v.len())
                .unwrap_or(0)
        } else {
            self.embedder.as_ref().map(|e| e.dimension()).unwrap_or(0)
        };

        Ok(EmbeddingStats {
            block_embeddings: block_count as usize,
            archival_embeddings: archival_count as usize,
            dimension,
            model: self.embedder.as_ref().map(|e| e.model_name().to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::schema::BlockType;
    use crate::db::MemoryDatabase;
    use crate::embedder::MockEmbedder;

    fn db_with_embedder() -> MemoryDatabase {
        MemoryDatabase::open_in_memory(
            EngineConfig::default(),
            Some(Arc::new(MockEmbedder::new(16))),
        )
        .unwrap()
    }

    fn block(id: &str, content: &str) -> Block {
        Block {
            id: id.to_string(),
            label: id.to_string(),
            content: content.to_string(),
            block_type: BlockType::Core,
            updated_at: 0,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = [1.0, 0.0, 0.0];
        assert!((cosine_similarity(&v, &v).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn cosine_of_opposite_vectors_is_negative_one() {
        let a = [0.5, -1.5, 2.0];
        let b = [-0.5, 1.5, -2.0];
        assert!((cosine_similarity(&a, &b).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_with_zero_vector_is_zero() {
        let a = [1.0, 2.0, 3.0];
        let zero = [0.0, 0.0, 0.0];
        assert_eq!(cosine_similarity(&a, &zero).unwrap(), 0.0);
    }

    #[test]
    fn cosine_is_symmetric() {
        let a = [0.3, 0.9, -0.1];
        let b = [1.2, 0.0, 0.4];
        assert_eq!(
            cosine_similarity(&a, &b).unwrap(),
            cosine_similarity(&b, &a).unwrap()
        );
    }

    #[test]
    fn cosine_rejects_unequal_lengths() {
        let a = [1.0, 2.0];
        let b = [1.0, 2.0, 3.0];
        assert!(matches!(
            cosine_similarity(&a, &b).unwrap_err(),
            EngineError::DimensionMismatch { left: 2, right: 3 }
        ));
    }

    #[test]
    fn store_and_load_round_trips_json_vectors() {
        let db = db_with_embedder();
        db.embeddings
            .store_block_embedding("b1", &[0.25, -0.5, 1.0])
            .unwrap();

        let map = db.embeddings.load_all_block_embeddings().unwrap();
        assert_eq!(map["b1"], vec![0.25, -0.5, 1.0]);
    }

    #[test]
    fn delete_removes_row() {
        let db = db_with_embedder();
        db.embeddings.store_archival_embedding("e1", &[1.0]).unwrap();
        db.embeddings.delete_archival_embedding("e1").unwrap();
        assert!(db
            .embeddings
            .load_all_archival_embeddings()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn ensure_generates_only_missing() {
        let db = db_with_embedder();
        let blocks = vec![block("a", "first"), block("b", "second")];
        db.embeddings
            .refresh_block("a", "first")
            .await
            .unwrap();

        let generated = db.embeddings.ensure_block_embeddings(&blocks).await.unwrap();
        assert_eq!(generated, 1);
        assert_eq!(db.embeddings.load_all_block_embeddings().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn ensure_without_embedder_is_unavailable() {
        let db = MemoryDatabase::open_in_memory(EngineConfig::default(), None).unwrap();
        let err = db
            .embeddings
            .ensure_block_embeddings(&[block("a", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EmbeddingUnavailable { .. }));
    }

    #[tokio::test]
    async fn search_skips_blocks_without_embeddings() {
        let db = db_with_embedder();
        let indexed = block("indexed", "the weather in lisbon");
        let unindexed = block("unindexed", "the weather in lisbon");
        db.embeddings
            .refresh_block(&indexed.id, &indexed.content)
            .await
            .unwrap();

        let hits = db
            .embeddings
            .search_blocks(
                "the weather in lisbon",
                &[indexed.clone(), unindexed],
                5,
                0.0,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, "indexed");
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn search_respects_threshold_and_limit() {
        let db = db_with_embedder();
        let blocks: Vec<Block> = (0..4)
            .map(|i| block(&format!("b{}", i), &format!("topic number {}", i)))
            .collect();
        for b in &blocks {
            db.embeddings.refresh_block(&b.id, &b.content).await.unwrap();
        }

        // Identical query to b2's content: exact match scores 1.0 and must
        // come first; limit caps the result set.
        let hits = db
            .embeddings
            .search_blocks("topic number 2", &blocks, 2, -1.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.id, "b2");

        let strict = db
            .embeddings
            .search_blocks("topic number 2", &blocks, 10, 0.999)
            .await
            .unwrap();
        assert_eq!(strict.len(), 1);
    }

    #[tokio::test]
    async fn search_without_embedder_fails_for_fallback() {
        let db = MemoryDatabase::open_in_memory(EngineConfig::default(), None).unwrap();
        let err = db
            .embeddings
            .search_blocks("anything", &[block("a", "x")], 5, 0.5)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EmbeddingUnavailable { .. }));
    }

    #[test]
    fn stats_report_counts_and_dimension() {
        let db = db_with_embedder();
        db.embeddings
            .store_block_embedding("b", &[0.0, 1.0, 0.0])
            .unwrap();

        let stats = db.embeddings.stats().unwrap();
        assert_eq!(stats.block_embeddings, 1);
        assert_eq!(stats.archival_embeddings, 0);
        assert_eq!(stats.dimension, 3);
        assert_eq!(stats.model.as_deref(), Some("mock-embedder"));
    }
}
