//! Database schema: row structs and table definitions
//!
//! Column names and types are a persistence contract: databases written by
//! this engine must stay readable by any reimplementation. All timestamps
//! are stored as INTEGER milliseconds since the Unix epoch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

/// A legacy key/value memory row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvEntry {
    pub purpose: String,
    pub text: String,
    pub updated_at: i64,
}

/// Block kind. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    /// Always included in the assembled prompt.
    Core,
    /// Retrieved on demand.
    Archival,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Archival => "archival",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "core" => Ok(Self::Core),
            "archival" => Ok(Self::Archival),
            other => Err(EngineError::memory(
                "parse block type",
                format!("unknown block type '{}'", other),
            )),
        }
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, labeled, typed container of free-form text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    pub label: String,
    pub content: String,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub updated_at: i64,
    pub metadata: Value,
}

/// An append-only archival record with an auto-generated id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivalEntry {
    pub id: String,
    pub content: String,
    pub created_at: i64,
    pub metadata: Value,
    pub vector_id: Option<String>,
}

/// One rung of the summary ladder.
///
/// `parent_summary_id` is the consolidation marker: NULL means the row is
/// still eligible for promotion; once set it never changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRow {
    pub id: i64,
    pub summary: String,
    pub level: i64,
    pub message_count: i64,
    pub parent_summary_id: Option<i64>,
    pub created_at: i64,
}

impl SummaryRow {
    pub fn is_consolidated(&self) -> bool {
        self.parent_summary_id.is_some()
    }
}

/// Row counts per logical table plus on-disk size.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub kv_entries: i64,
    pub blocks: i64,
    pub archival_entries: i64,
    pub block_embeddings: i64,
    pub archival_embeddings: i64,
    pub summaries: i64,
    pub database_size_bytes: i64,
}

pub const KV_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS kv_memory (
    purpose TEXT PRIMARY KEY,
    text TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_kv_memory_updated ON kv_memory (updated_at DESC);
";

pub const BLOCK_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS blocks (
    id TEXT PRIMARY KEY,
    label TEXT NOT NULL,
    content TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'core',
    updated_at INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_blocks_type_updated ON blocks (type, updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_blocks_label ON blocks (label);
CREATE TABLE IF NOT EXISTS archival (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    vector_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_archival_created ON archival (created_at DESC);
";

pub const EMBEDDING_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS block_embeddings (
    block_id TEXT PRIMARY KEY,
    embedding TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS archival_embeddings (
    entry_id TEXT PRIMARY KEY,
    embedding TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

pub const SUMMARY_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    summary TEXT NOT NULL,
    summary_level INTEGER NOT NULL DEFAULT 0,
    message_count INTEGER NOT NULL,
    parent_summary_id INTEGER,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_summaries_level_created ON summaries (summary_level, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_summaries_parent ON summaries (parent_summary_id);
";

/// Parse a metadata column. A malformed or non-object value degrades to an
/// empty object rather than poisoning the row.
pub(crate) fn parse_metadata(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v) if v.is_object() => v,
        _ => Value::Object(serde_json::Map::new()),
    }
}
