//! Legacy key/value memory store
//!
//! The flat `purpose → text` surface that predates typed blocks. Kept for
//! backward compatibility and as the migration source; also emits the
//! instructional prompt fragment the agent sees every turn.

use std::collections::HashMap;
use std::sync::RwLock;

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use super::schema::{KvEntry, KV_SCHEMA_SQL};
use super::SqlitePool;
use crate::error::EngineResult;
use crate::util::{format_timestamp, now_ms, preview};

/// Markers that flag an entry as sensitive in the prompt directory.
const PRIVACY_MARKERS: [&str; 4] = ["[PRIVATE]", "[CONFIDENTIAL]", "[DO NOT SHARE]", "[PERSONAL]"];

/// Fixed policy text appended to every rebuilt fragment. Part of the
/// external contract: stable verbatim across rebuilds.
pub(crate) const MEMORY_POLICY: &str = "\
### Memory Policy
- Write a memory whenever the user shares a lasting fact, preference, decision, or correction.
- Store compact declarative statements, one purpose per entry; prefer updating an existing purpose over inventing a near-duplicate.
- Always read an entry before overwriting it so existing detail is preserved.
- Organize durable knowledge into core blocks: `human` for facts about the user, `persona` for your own identity, `context` for the ongoing situation.";

/// Flat key/value store over `kv_memory`, with an in-process cache of all
/// rows.
pub struct KvMemoryStore {
    pool: SqlitePool,
    cache: RwLock<HashMap<String, KvEntry>>,
}

impl KvMemoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Create the table and its recency index. Idempotent.
    pub fn initialize(&self) -> EngineResult<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(KV_SCHEMA_SQL)?;
        Ok(())
    }

    /// Load every row newest-first, rebuilding the cache.
    ///
    /// A missing table (the window between migration and rollback) reads
    /// as an empty store, not an error.
    pub fn load_all(&self) -> EngineResult<Vec<KvEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = match conn.prepare(
            "SELECT purpose, text, updated_at FROM kv_memory ORDER BY updated_at DESC",
        ) {
            Ok(stmt) => stmt,
            Err(e) if is_missing_table(&e) => {
                self.cache.write().unwrap().clear();
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let mut rows = stmt.query([])?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(KvEntry {
                purpose: row.get(0)?,
                text: row.get(1)?,
                updated_at: row.get(2)?,
            });
        }

        let mut cache = self.cache.write().unwrap();
        cache.clear();
        for entry in &entries {
            cache.insert(entry.purpose.clone(), entry.clone());
        }

        debug!("loaded {} kv memory entries", entries.len());
        Ok(entries)
    }

    /// Upsert one entry with a fresh timestamp.
    pub fn write(&self, purpose: &str, text: &str) -> EngineResult<KvEntry> {
        let entry = KvEntry {
            purpose: purpose.to_string(),
            text: text.to_string(),
            updated_at: now_ms(),
        };

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv_memory (purpose, text, updated_at) VALUES (?1, ?2, ?3)",
            params![entry.purpose, entry.text, entry.updated_at],
        )?;
        drop(conn);

        self.cache
            .write()
            .unwrap()
            .insert(entry.purpose.clone(), entry.clone());
        Ok(entry)
    }

    /// Cache lookup with row fallback.
    pub fn read(&self, purpose: &str) -> EngineResult<Option<KvEntry>> {
        if let Some(entry) = self.cache.read().unwrap().get(purpose) {
            return Ok(Some(entry.clone()));
        }

        let conn = self.pool.get()?;
        let entry = match conn
            .query_row(
                "SELECT purpose, text, updated_at FROM kv_memory WHERE purpose = ?1",
                [purpose],
                |row| {
                    Ok(KvEntry {
                        purpose: row.get(0)?,
                        text: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()
        {
            Ok(entry) => entry,
            Err(e) if is_missing_table(&e) => None,
            Err(e) => return Err(e.into()),
        };
        drop(conn);

        if let Some(ref entry) = entry {
            self.cache
                .write()
                .unwrap()
                .insert(entry.purpose.clone(), entry.clone());
        }
        Ok(entry)
    }

    /// Remove an entry. Returns whether a row was deleted.
    pub fn delete(&self, purpose: &str) -> EngineResult<bool> {
        let conn = self.pool.get()?;
        let deleted = match conn.execute("DELETE FROM kv_memory WHERE purpose = ?1", [purpose]) {
            Ok(n) => n,
            Err(e) if is_missing_table(&e) => 0,
            Err(e) => return Err(e.into()),
        };
        drop(conn);

        self.cache.write().unwrap().remove(purpose);
        Ok(deleted > 0)
    }

    /// Drop the cache. Called after migration renames the table away.
    pub(crate) fn invalidate_cache(&self) {
        self.cache.write().unwrap().clear();
    }

    /// Build the instructional prompt fragment from the cache. Never fails.
    ///
    /// Each entry appears twice: once in a directory of one-line previews
    /// (locked when privacy markers occur in the text) and once in full
    /// with a human-readable timestamp. The policy section is appended
    /// verbatim on every rebuild.
    pub fn build_prompt_fragment(&self) -> String {
        let mut entries: Vec<KvEntry> = self.cache.read().unwrap().values().cloned().collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let mut out = String::from("## Memory\n\n");

        if !entries.is_empty() {
            out.push_str("### Stored Entries\n");
            for entry in &entries {
                let lock = if is_sensitive(&entry.text) { "🔒 " } else { "" };
                out.push_str(&format!(
                    "- {}{}: {}\n",
                    lock,
                    entry.purpose,
                    preview(&entry.text, 60)
                ));
            }
            out.push('\n');

            out.push_str("### Entry Details\n");
            for entry in &entries {
                out.push_str(&format!(
                    "#### {}\n*Updated: {}*\n\n{}\n\n",
                    entry.purpose,
                    format_timestamp(entry.updated_at),
                    entry.text
                ));
            }
        }

        out.push_str(MEMORY_POLICY);
        out.push('\n');
        out
    }
}

fn is_missing_table(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(_, Some(message)) if message.contains("no such table"))
}

fn is_sensitive(text: &str) -> bool {
    let upper = text.to_uppercase();
    PRIVACY_MARKERS.iter().any(|marker| upper.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::MemoryDatabase;

    fn store() -> MemoryDatabase {
        MemoryDatabase::open_in_memory(EngineConfig::default(), None).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let db = store();
        db.kv.write("user_preferences", "likes terse answers").unwrap();

        let entry = db.kv.read("user_preferences").unwrap().unwrap();
        assert_eq!(entry.text, "likes terse answers");
        assert!(entry.updated_at <= now_ms());
    }

    #[test]
    fn write_is_upsert() {
        let db = store();
        db.kv.write("topic", "first").unwrap();
        db.kv.write("topic", "second").unwrap();

        assert_eq!(db.kv.load_all().unwrap().len(), 1);
        assert_eq!(db.kv.read("topic").unwrap().unwrap().text, "second");
    }

    #[test]
    fn read_missing_is_none() {
        let db = store();
        assert!(db.kv.read("nothing_here").unwrap().is_none());
    }

    #[test]
    fn delete_removes_row_and_cache() {
        let db = store();
        db.kv.write("stale", "to be removed").unwrap();
        assert!(db.kv.delete("stale").unwrap());
        assert!(!db.kv.delete("stale").unwrap());
        assert!(db.kv.read("stale").unwrap().is_none());
    }

    #[test]
    fn load_all_orders_newest_first() {
        let db = store();
        db.kv.write("older", "a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        db.kv.write("newer", "b").unwrap();

        let all = db.kv.load_all().unwrap();
        assert_eq!(all[0].purpose, "newer");
        assert_eq!(all[1].purpose, "older");
    }

    #[test]
    fn fragment_lists_entries_twice_and_appends_policy() {
        let db = store();
        db.kv.write("user_name", "Ada").unwrap();

        let fragment = db.kv.build_prompt_fragment();
        assert_eq!(fragment.matches("user_name").count(), 2);
        assert!(fragment.contains("### Memory Policy"));
        assert!(fragment.contains("Ada"));
    }

    #[test]
    fn fragment_locks_sensitive_entries() {
        let db = store();
        db.kv
            .write("health", "[private] allergy to penicillin")
            .unwrap();

        let fragment = db.kv.build_prompt_fragment();
        assert!(fragment.contains("🔒 health"));
    }

    #[test]
    fn fragment_without_entries_is_policy_only() {
        let db = store();
        let fragment = db.kv.build_prompt_fragment();
        assert!(!fragment.contains("### Stored Entries"));
        assert!(fragment.contains("### Memory Policy"));
    }

    #[test]
    fn fragment_is_stable_across_rebuilds() {
        let db = store();
        db.kv.write("a", "alpha").unwrap();
        assert_eq!(db.kv.build_prompt_fragment(), db.kv.build_prompt_fragment());
    }
}
