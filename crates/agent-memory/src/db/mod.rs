//! SQLite-backed storage for the memory engine
//!
//! One database file per agent. `MemoryDatabase` owns the connection pool
//! and a store handle per concern: legacy key/value memory, typed blocks
//! plus archival entries, the semantic index, and the summary ladder.
//!
//! The engine assumes a single logical writer per store. Operations issued
//! concurrently from two tasks against the same database have undefined
//! interleaving; hosts hold the `MemoryDatabase` behind one task.

pub mod block_store;
pub mod embedding_store;
pub mod kv_store;
pub mod migration;
pub mod schema;
pub mod summary_store;

pub use block_store::{BlockStore, InsertPosition};
pub use embedding_store::{cosine_similarity, EmbeddingStats, EmbeddingStore};
pub use kv_store::KvMemoryStore;
pub use migration::MigrationReport;
pub use schema::*;
pub use summary_store::{
    ConversationMessage, LoadedSummaries, PendingPromotion, SummaryStore,
};

use std::path::Path;
use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::embedder::Embedder;
use crate::error::{EngineError, EngineResult};

pub(crate) type SqlitePool = Arc<Pool<SqliteConnectionManager>>;

/// Handle to one agent's durable memory.
pub struct MemoryDatabase {
    pub kv: KvMemoryStore,
    pub blocks: BlockStore,
    pub embeddings: EmbeddingStore,
    pub summaries: SummaryStore,
    config: EngineConfig,
    pool: SqlitePool,
}

impl MemoryDatabase {
    /// Open (creating if needed) a file-backed store.
    pub fn open(
        db_path: &Path,
        config: EngineConfig,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> EngineResult<Self> {
        info!("opening memory database at {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::storage("create database directory", e))?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| EngineError::storage("create connection pool", e))?;

        {
            let conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
        }

        Self::from_pool(Arc::new(pool), config, embedder)
    }

    /// Open a private in-memory store. Used by tests and ephemeral agents.
    ///
    /// The pool is clamped to a single connection: every `:memory:`
    /// connection is otherwise its own empty database.
    pub fn open_in_memory(
        config: EngineConfig,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> EngineResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| EngineError::storage("create in-memory pool", e))?;
        Self::from_pool(Arc::new(pool), config, embedder)
    }

    fn from_pool(
        pool: SqlitePool,
        config: EngineConfig,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> EngineResult<Self> {
        let kv = KvMemoryStore::new(Arc::clone(&pool));
        kv.initialize()?;

        let embeddings = EmbeddingStore::new(Arc::clone(&pool), embedder);
        embeddings.initialize()?;

        let blocks = BlockStore::new(Arc::clone(&pool), embeddings.clone());
        blocks.initialize()?;

        let summaries = SummaryStore::new(Arc::clone(&pool), config.summaries.clone());
        summaries.initialize()?;

        // Cache preloads tolerate partially-initialized databases; a store
        // reopened from an older engine version still comes up.
        if let Err(e) = blocks.load_cache() {
            warn!("core block cache preload skipped: {}", e);
        }
        if let Err(e) = kv.load_all() {
            warn!("kv memory cache preload skipped: {}", e);
        }

        info!("memory database initialized");
        Ok(Self {
            kv,
            blocks,
            embeddings,
            summaries,
            config,
            pool,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Row counts per logical table plus the database's on-disk size.
    /// Missing tables count as zero.
    pub fn stats(&self) -> EngineResult<DatabaseStats> {
        let conn = self.pool.get()?;

        fn table_count(conn: &Connection, table: &str) -> i64 {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })
            .unwrap_or_else(|e| {
                warn!("count for table {} unavailable: {}", table, e);
                0
            })
        }

        let database_size_bytes: i64 = conn
            .query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        Ok(DatabaseStats {
            kv_entries: table_count(&conn, "kv_memory"),
            blocks: table_count(&conn, "blocks"),
            archival_entries: table_count(&conn, "archival"),
            block_embeddings: table_count(&conn, "block_embeddings"),
            archival_embeddings: table_count(&conn, "archival_embeddings"),
            summaries: table_count(&conn, "summaries"),
            database_size_bytes,
        })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_db() -> MemoryDatabase {
        MemoryDatabase::open_in_memory(EngineConfig::default(), None).unwrap()
    }

    #[test]
    fn open_in_memory_initializes_all_tables() {
        let db = open_test_db();
        let stats = db.stats().unwrap();
        assert_eq!(stats.blocks, 0);
        assert_eq!(stats.kv_entries, 0);
        assert_eq!(stats.summaries, 0);
        assert_eq!(stats.block_embeddings, 0);
    }

    #[test]
    fn stats_survive_missing_tables() {
        let db = open_test_db();
        {
            let conn = db.pool().get().unwrap();
            conn.execute_batch("DROP TABLE summaries;").unwrap();
        }
        let stats = db.stats().unwrap();
        assert_eq!(stats.summaries, 0);
    }
}
