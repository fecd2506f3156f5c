//! Typed block store and archival memory
//!
//! Blocks are the structured successor to the flat key/value surface:
//! labeled, typed (`core` blocks ride along in every prompt, `archival`
//! blocks are retrieved on demand), and editable through read-before-write
//! operations. Archival entries are append-only records with generated ids.
//!
//! Every content write schedules a best-effort embedding refresh through
//! the semantic index. A content write that succeeds in SQL succeeds, full
//! stop; embedding failures are logged and swallowed so the engine runs in
//! environments without an embedding model.

use std::collections::HashMap;
use std::sync::RwLock;

use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::schema::{parse_metadata, ArchivalEntry, Block, BlockType, BLOCK_SCHEMA_SQL};
use super::SqlitePool;
use crate::db::embedding_store::EmbeddingStore;
use crate::error::{EngineError, EngineResult};
use crate::util::{format_timestamp, now_ms};

/// Where `insert_content` places new text relative to existing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertPosition {
    Start,
    #[default]
    End,
}

impl InsertPosition {
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "start" => Ok(Self::Start),
            "end" => Ok(Self::End),
            other => Err(EngineError::memory(
                "parse insert position",
                format!("expected 'start' or 'end', got '{}'", other),
            )),
        }
    }
}

/// One-line reminder closing the core memory fragment. Contract text:
/// stable verbatim across rebuilds.
pub(crate) const CORE_MEMORY_REMINDER: &str = "Edit these blocks with \
memory_insert, memory_replace, memory_rethink, or memory_create_block.";

/// Store for the `blocks` and `archival` tables, with an in-process cache
/// of blocks keyed by id.
pub struct BlockStore {
    pool: SqlitePool,
    cache: RwLock<HashMap<String, Block>>,
    embeddings: EmbeddingStore,
}

impl BlockStore {
    pub fn new(pool: SqlitePool, embeddings: EmbeddingStore) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
            embeddings,
        }
    }

    /// Create `blocks` and `archival` with their indexes. Idempotent.
    pub fn initialize(&self) -> EngineResult<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(BLOCK_SCHEMA_SQL)?;
        Ok(())
    }

    /// Populate the cache with every core block. Called at open.
    pub fn load_cache(&self) -> EngineResult<usize> {
        let blocks = self.query_blocks(Some(BlockType::Core))?;
        let count = blocks.len();

        let mut cache = self.cache.write().unwrap();
        cache.clear();
        for block in blocks {
            cache.insert(block.id.clone(), block);
        }
        debug!("core block cache loaded with {} blocks", count);
        Ok(count)
    }

    fn row_to_block(row: &Row) -> rusqlite::Result<(Block, String)> {
        let type_raw: String = row.get(3)?;
        let metadata_raw: String = row.get(5)?;
        let block = Block {
            id: row.get(0)?,
            label: row.get(1)?,
            content: row.get(2)?,
            block_type: BlockType::Core, // fixed up by the caller
            updated_at: row.get(4)?,
            metadata: parse_metadata(&metadata_raw),
        };
        Ok((block, type_raw))
    }

    fn query_block(&self, id: &str) -> EngineResult<Option<Block>> {
        let conn = self.pool.get()?;
        let found = conn
            .query_row(
                "SELECT id, label, content, type, updated_at, metadata FROM blocks WHERE id = ?1",
                [id],
                Self::row_to_block,
            )
            .optional()?;
        match found {
            Some((mut block, type_raw)) => {
                block.block_type = BlockType::parse(&type_raw)?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    fn query_blocks(&self, filter: Option<BlockType>) -> EngineResult<Vec<Block>> {
        let conn = self.pool.get()?;
        let sql = match filter {
            Some(_) => {
                "SELECT id, label, content, type, updated_at, metadata FROM blocks \
                 WHERE type = ?1 ORDER BY updated_at DESC"
            }
            None => {
                "SELECT id, label, content, type, updated_at, metadata FROM blocks \
                 ORDER BY updated_at DESC"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let mut rows = match filter {
            Some(t) => stmt.query([t.as_str()])?,
            None => stmt.query([])?,
        };

        let mut blocks = Vec::new();
        while let Some(row) = rows.next()? {
            let (mut block, type_raw) = Self::row_to_block(row)?;
            block.block_type = BlockType::parse(&type_raw)?;
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Cache lookup with row fallback; caches on success.
    pub fn get_block(&self, id: &str) -> EngineResult<Option<Block>> {
        if let Some(block) = self.cache.read().unwrap().get(id) {
            return Ok(Some(block.clone()));
        }

        let block = self.query_block(id)?;
        if let Some(ref block) = block {
            self.cache
                .write()
                .unwrap()
                .insert(block.id.clone(), block.clone());
        }
        Ok(block)
    }

    /// All blocks newest-first, optionally filtered by type. Refreshes the
    /// cache entry for every block returned.
    pub fn get_all_blocks(&self, filter: Option<BlockType>) -> EngineResult<Vec<Block>> {
        let blocks = self.query_blocks(filter)?;
        let mut cache = self.cache.write().unwrap();
        for block in &blocks {
            cache.insert(block.id.clone(), block.clone());
        }
        Ok(blocks)
    }

    /// Create a block with empty metadata. Fails with
    /// [`EngineError::BlockConflict`] when the id is taken.
    pub async fn create_block(
        &self,
        id: &str,
        label: &str,
        content: &str,
        block_type: BlockType,
    ) -> EngineResult<Block> {
        self.create_block_with_metadata(id, label, content, block_type, Value::Object(Default::default()))
            .await
    }

    /// Create a block carrying caller-supplied metadata.
    pub async fn create_block_with_metadata(
        &self,
        id: &str,
        label: &str,
        content: &str,
        block_type: BlockType,
        metadata: Value,
    ) -> EngineResult<Block> {
        if !metadata.is_object() {
            return Err(EngineError::memory(
                "create block",
                "metadata must be a JSON object",
            ));
        }
        if self.query_block(id)?.is_some() {
            return Err(EngineError::BlockConflict { id: id.to_string() });
        }

        let block = Block {
            id: id.to_string(),
            label: label.to_string(),
            content: content.to_string(),
            block_type,
            updated_at: now_ms(),
            metadata,
        };

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO blocks (id, label, content, type, updated_at, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                block.id,
                block.label,
                block.content,
                block.block_type.as_str(),
                block.updated_at,
                serde_json::to_string(&block.metadata)?,
            ],
        )?;
        drop(conn);

        self.cache
            .write()
            .unwrap()
            .insert(block.id.clone(), block.clone());
        self.refresh_block_embedding(&block.id, &block.content).await;

        debug!("created {} block {}", block.block_type, block.id);
        Ok(block)
    }

    /// In-place content update. The block must exist.
    pub async fn update_block(&self, id: &str, content: &str) -> EngineResult<Block> {
        let mut block = self
            .get_block(id)?
            .ok_or_else(|| EngineError::BlockNotFound { id: id.to_string() })?;

        block.content = content.to_string();
        block.updated_at = now_ms();

        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE blocks SET content = ?1, updated_at = ?2 WHERE id = ?3",
            params![block.content, block.updated_at, block.id],
        )?;
        drop(conn);

        self.cache
            .write()
            .unwrap()
            .insert(block.id.clone(), block.clone());
        self.refresh_block_embedding(&block.id, &block.content).await;
        Ok(block)
    }

    /// Remove a block and its cached entry; the stored embedding is
    /// deleted opportunistically.
    pub fn delete_block(&self, id: &str) -> EngineResult<bool> {
        let conn = self.pool.get()?;
        let deleted = conn.execute("DELETE FROM blocks WHERE id = ?1", [id])?;
        drop(conn);

        self.cache.write().unwrap().remove(id);
        if let Err(e) = self.embeddings.delete_block_embedding(id) {
            warn!("embedding cleanup for deleted block {} skipped: {}", id, e);
        }
        Ok(deleted > 0)
    }

    /// Merge `new_text` into an existing block, newline-separated, at the
    /// requested position. The result is trimmed of surrounding
    /// whitespace.
    pub async fn insert_content(
        &self,
        id: &str,
        new_text: &str,
        position: InsertPosition,
    ) -> EngineResult<Block> {
        let block = self
            .get_block(id)?
            .ok_or_else(|| EngineError::BlockNotFound { id: id.to_string() })?;

        let merged = match position {
            InsertPosition::Start => format!("{}\n{}", new_text, block.content),
            InsertPosition::End => format!("{}\n{}", block.content, new_text),
        };
        self.update_block(id, merged.trim()).await
    }

    /// Replace the first occurrence of `old_content`.
    ///
    /// A missing substring is a structured failure
    /// ([`EngineError::ContentNotFound`]), not a storage error: the tool
    /// layer reports it in-band.
    pub async fn replace_content(
        &self,
        id: &str,
        old_content: &str,
        new_content: &str,
    ) -> EngineResult<Block> {
        let block = self
            .get_block(id)?
            .ok_or_else(|| EngineError::BlockNotFound { id: id.to_string() })?;

        if !block.content.contains(old_content) {
            return Err(EngineError::ContentNotFound { id: id.to_string() });
        }

        let replaced = block.content.replacen(old_content, new_content, 1);
        self.update_block(id, &replaced).await
    }

    /// Rewrite a block wholesale. `reason` is logged, never persisted.
    pub async fn rethink_block(
        &self,
        id: &str,
        new_content: &str,
        reason: Option<&str>,
    ) -> EngineResult<Block> {
        if self.get_block(id)?.is_none() {
            return Err(EngineError::BlockNotFound { id: id.to_string() });
        }
        if let Some(reason) = reason {
            info!("rethinking block {}: {}", id, reason);
        }
        self.update_block(id, new_content).await
    }

    /// Append an archival entry. The generated id is
    /// `archival_<ms>_<suffix>` and is returned to the caller.
    pub async fn insert_archival(
        &self,
        content: &str,
        metadata: Option<Value>,
    ) -> EngineResult<ArchivalEntry> {
        let metadata = metadata.unwrap_or_else(|| Value::Object(Default::default()));
        if !metadata.is_object() {
            return Err(EngineError::memory(
                "insert archival",
                "metadata must be a JSON object",
            ));
        }

        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let entry = ArchivalEntry {
            id: format!("archival_{}_{}", now_ms(), suffix),
            content: content.to_string(),
            created_at: now_ms(),
            metadata,
            vector_id: None,
        };

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO archival (id, content, created_at, metadata, vector_id) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id,
                entry.content,
                entry.created_at,
                serde_json::to_string(&entry.metadata)?,
                entry.vector_id,
            ],
        )?;
        drop(conn);

        self.refresh_archival_embedding(&entry.id, &entry.content).await;
        debug!("inserted archival entry {}", entry.id);
        Ok(entry)
    }

    /// Substring search over archival content, newest-first. The fallback
    /// path when semantic search is unavailable.
    pub fn search_archival_text(&self, query: &str, limit: usize) -> EngineResult<Vec<ArchivalEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, content, created_at, metadata, vector_id FROM archival \
             WHERE content LIKE ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let pattern = format!("%{}%", query);
        let mut rows = stmt.query(params![pattern, limit as i64])?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(Self::row_to_archival(row)?);
        }
        Ok(entries)
    }

    /// Full archival scan, newest-first.
    pub fn get_all_archival(&self) -> EngineResult<Vec<ArchivalEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, content, created_at, metadata, vector_id FROM archival \
             ORDER BY created_at DESC",
        )?;
        let mut rows = stmt.query([])?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(Self::row_to_archival(row)?);
        }
        Ok(entries)
    }

    fn row_to_archival(row: &Row) -> rusqlite::Result<ArchivalEntry> {
        let metadata_raw: String = row.get(3)?;
        Ok(ArchivalEntry {
            id: row.get(0)?,
            content: row.get(1)?,
            created_at: row.get(2)?,
            metadata: parse_metadata(&metadata_raw),
            vector_id: row.get(4)?,
        })
    }

    /// Build the `## Core Memory` prompt fragment, or the empty string
    /// when no core blocks exist.
    pub fn build_core_prompt_fragment(&self) -> EngineResult<String> {
        let blocks = self.get_all_blocks(Some(BlockType::Core))?;
        if blocks.is_empty() {
            return Ok(String::new());
        }

        let mut out = String::from("## Core Memory\n\n");
        for block in &blocks {
            out.push_str(&format!(
                "### {} ({})\n*Last updated: {}*\n\n{}\n\n---\n\n",
                block.label,
                block.id,
                format_timestamp(block.updated_at),
                block.content
            ));
        }
        out.push_str(CORE_MEMORY_REMINDER);
        out.push('\n');
        Ok(out)
    }

    async fn refresh_block_embedding(&self, id: &str, content: &str) {
        if !self.embeddings.has_embedder() {
            debug!("no embedding model, skipping refresh for block {}", id);
            return;
        }
        if let Err(e) = self.embeddings.refresh_block(id, content).await {
            warn!("embedding refresh for block {} failed: {}", id, e);
        }
    }

    async fn refresh_archival_embedding(&self, id: &str, content: &str) {
        if !self.embeddings.has_embedder() {
            debug!("no embedding model, skipping refresh for entry {}", id);
            return;
        }
        if let Err(e) = self.embeddings.refresh_archival(id, content).await {
            warn!("embedding refresh for entry {} failed: {}", id, e);
        }
    }
}
