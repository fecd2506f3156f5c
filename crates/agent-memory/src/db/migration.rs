//! One-shot migration from legacy key/value memory to typed blocks
//!
//! Legacy rows are classified by purpose into the standard `human`,
//! `persona` and `context` blocks and appended oldest-first, so each
//! block reads chronologically. The source table is renamed to
//! `kv_memory_backup` on success and can be restored row-for-row by
//! [`MemoryDatabase::rollback_migration`].

use rusqlite::OptionalExtension;
use serde::Serialize;
use tracing::{info, warn};

use super::block_store::InsertPosition;
use super::schema::{BlockType, KvEntry};
use super::MemoryDatabase;
use crate::error::{EngineError, EngineResult};

/// Standard blocks the migration targets, created empty when absent.
const STANDARD_BLOCKS: [(&str, &str); 3] =
    [("human", "Human"), ("persona", "Persona"), ("context", "Context")];

const HUMAN_KEYWORDS: [&str; 6] = ["user", "customer", "person", "human", "client", "people"];
const PERSONA_KEYWORDS: [&str; 5] = ["agent", "persona", "identity", "role", "assistant"];

/// Outcome of one migration run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub total: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Pick the standard block a legacy purpose belongs to.
fn classify_purpose(purpose: &str) -> &'static str {
    let lower = purpose.to_lowercase();
    if HUMAN_KEYWORDS.iter().any(|k| lower.contains(k)) {
        "human"
    } else if PERSONA_KEYWORDS.iter().any(|k| lower.contains(k)) {
        "persona"
    } else {
        "context"
    }
}

impl MemoryDatabase {
    fn table_exists(&self, name: &str) -> EngineResult<bool> {
        let conn = self.pool().get()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn count_rows(&self, table: &str) -> EngineResult<i64> {
        let conn = self.pool().get()?;
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })?)
    }

    /// True iff legacy rows exist and no block has been created yet.
    /// Missing tables on either side resolve to a definitive answer, not
    /// an error.
    pub fn migration_needed(&self) -> EngineResult<bool> {
        if !self.table_exists("kv_memory")? {
            return Ok(false);
        }
        if self.count_rows("kv_memory")? == 0 {
            return Ok(false);
        }
        if !self.table_exists("blocks")? {
            return Ok(true);
        }
        Ok(self.count_rows("blocks")? == 0)
    }

    /// Move every legacy row into the standard blocks.
    ///
    /// Per-row failures are counted and the migration continues. When at
    /// least one row migrated, the source table is renamed to
    /// `kv_memory_backup`; a failed rename is logged and non-fatal.
    pub async fn migrate_kv_to_blocks(&self) -> EngineResult<MigrationReport> {
        for (id, label) in STANDARD_BLOCKS {
            if self.blocks.get_block(id)?.is_none() {
                self.blocks.create_block(id, label, "", BlockType::Core).await?;
            }
        }

        let rows: Vec<KvEntry> = {
            let conn = self.pool().get()?;
            let mut stmt = conn.prepare(
                "SELECT purpose, text, updated_at FROM kv_memory ORDER BY updated_at ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(KvEntry {
                    purpose: row.get(0)?,
                    text: row.get(1)?,
                    updated_at: row.get(2)?,
                });
            }
            out
        };

        let mut report = MigrationReport {
            total: rows.len(),
            ..Default::default()
        };

        for entry in &rows {
            if entry.text.trim().is_empty() {
                report.skipped += 1;
                continue;
            }
            let target = classify_purpose(&entry.purpose);
            let addition = format!("**{}**\n{}", entry.purpose, entry.text);
            match self
                .blocks
                .insert_content(target, &addition, InsertPosition::End)
                .await
            {
                Ok(_) => report.migrated += 1,
                Err(e) => report
                    .errors
                    .push(format!("{}: {}", entry.purpose, e)),
            }
        }

        if report.migrated > 0 {
            let conn = self.pool().get()?;
            match conn.execute("ALTER TABLE kv_memory RENAME TO kv_memory_backup", []) {
                Ok(_) => {
                    drop(conn);
                    self.kv.invalidate_cache();
                    info!("kv_memory renamed to kv_memory_backup");
                }
                Err(e) => warn!("backup rename failed, kv_memory left in place: {}", e),
            }
        }

        info!(
            "migration finished: {}/{} rows migrated, {} skipped, {} errors",
            report.migrated,
            report.total,
            report.skipped,
            report.errors.len()
        );
        Ok(report)
    }

    /// Restore the legacy table from the migration backup.
    pub fn rollback_migration(&self) -> EngineResult<()> {
        if !self.table_exists("kv_memory_backup")? {
            return Err(EngineError::memory(
                "rollback migration",
                "no kv_memory_backup table to restore",
            ));
        }

        {
            let conn = self.pool().get()?;
            conn.execute_batch(
                "DROP TABLE IF EXISTS kv_memory;
                 ALTER TABLE kv_memory_backup RENAME TO kv_memory;",
            )?;
        }

        self.kv.load_all()?;
        info!("kv_memory restored from backup");
        Ok(())
    }

    /// Mirror every core block back into the legacy table, preserving the
    /// block timestamps. Returns the number of entries written.
    pub fn export_blocks_to_kv(&self) -> EngineResult<usize> {
        self.kv.initialize()?;
        let core = self.blocks.get_all_blocks(Some(BlockType::Core))?;

        let count = core.len();
        {
            let conn = self.pool().get()?;
            for block in &core {
                let purpose = block.label.to_lowercase().replace(' ', "_");
                conn.execute(
                    "INSERT OR REPLACE INTO kv_memory (purpose, text, updated_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params![purpose, block.content, block.updated_at],
                )?;
            }
        }

        self.kv.load_all()?;
        info!("exported {} core blocks to kv_memory", count);
        Ok(count)
    }
}
