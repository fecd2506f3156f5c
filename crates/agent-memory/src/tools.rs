//! Tool surface exposed to the LLM
//!
//! Ten recognized tools dispatched by name over `serde_json::Value`
//! arguments. Logical failures (missing block, absent substring, id
//! conflict) come back in-band as `success: false` responses; they are
//! never errors the host has to catch. Semantic search degrades to
//! case-insensitive substring matching whenever the embedding model is
//! absent or failing.

use serde_json::{json, Value};
use tracing::warn;

use crate::db::schema::{Block, BlockType};
use crate::db::{InsertPosition, MemoryDatabase};
use crate::error::EngineError;
use crate::util::{format_timestamp, preview, round_score};

/// Tool names the dispatcher recognizes, in the order hosts usually
/// advertise them.
pub const RECOGNIZED_TOOLS: [&str; 11] = [
    "memory_get_block",
    "memory_insert",
    "memory_replace",
    "memory_rethink",
    "memory_create_block",
    "memory_list_blocks",
    "memory_search",
    "archival_insert",
    "archival_search",
    "memory_read",
    "memory_write",
];

/// Execute one tool call against `db`. Always returns a JSON value; the
/// `success` field distinguishes outcomes for structured responses.
pub async fn execute_tool(db: &MemoryDatabase, name: &str, args: &Value) -> Value {
    match name {
        "memory_get_block" => memory_get_block(db, args),
        "memory_insert" => memory_insert(db, args).await,
        "memory_replace" => memory_replace(db, args).await,
        "memory_rethink" => memory_rethink(db, args).await,
        "memory_create_block" => memory_create_block(db, args).await,
        "memory_list_blocks" => memory_list_blocks(db, args),
        "memory_search" => memory_search(db, args).await,
        "archival_insert" => archival_insert(db, args).await,
        "archival_search" => archival_search(db, args).await,
        "memory_read" => memory_read(db, args),
        "memory_write" => memory_write(db, args),
        other => failure(format!("Unknown tool: {}", other)),
    }
}

fn failure(message: impl Into<String>) -> Value {
    json!({ "success": false, "message": message.into() })
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, Value> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| failure(format!("Missing required parameter '{}'", key)))
}

fn memory_get_block(db: &MemoryDatabase, args: &Value) -> Value {
    let block_id = match required_str(args, "block_id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db.blocks.get_block(block_id) {
        Ok(Some(block)) => json!({
            "block_id": block.id,
            "label": block.label,
            "content": block.content,
            "updated_at": format_timestamp(block.updated_at),
        }),
        Ok(None) => failure(format!("Block '{}' does not exist", block_id)),
        Err(e) => failure(e.to_string()),
    }
}

async fn memory_insert(db: &MemoryDatabase, args: &Value) -> Value {
    let block_id = match required_str(args, "block_id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let content = match required_str(args, "content") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let position = match args.get("position").and_then(|v| v.as_str()) {
        Some(raw) => match InsertPosition::parse(raw) {
            Ok(p) => p,
            Err(e) => return failure(e.to_string()),
        },
        None => InsertPosition::default(),
    };

    match db.blocks.insert_content(block_id, content, position).await {
        Ok(_) => {
            let place = if position == InsertPosition::Start { "start" } else { "end" };
            json!({
                "success": true,
                "message": format!("Inserted content at the {} of block '{}'", place, block_id),
            })
        }
        Err(EngineError::BlockNotFound { id }) => failure(format!("Block '{}' does not exist", id)),
        Err(e) => failure(e.to_string()),
    }
}

async fn memory_replace(db: &MemoryDatabase, args: &Value) -> Value {
    let block_id = match required_str(args, "block_id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let old_content = match required_str(args, "old_content") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let new_content = args
        .get("new_content")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    match db.blocks.replace_content(block_id, old_content, new_content).await {
        Ok(_) => json!({
            "success": true,
            "message": format!("Replaced content in block '{}'", block_id),
        }),
        Err(EngineError::ContentNotFound { id }) => {
            failure(format!("Content not found in block '{}'", id))
        }
        Err(EngineError::BlockNotFound { id }) => failure(format!("Block '{}' does not exist", id)),
        Err(e) => failure(e.to_string()),
    }
}

async fn memory_rethink(db: &MemoryDatabase, args: &Value) -> Value {
    let block_id = match required_str(args, "block_id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let new_content = match required_str(args, "new_content") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let reason = args.get("reason").and_then(|v| v.as_str());

    match db.blocks.rethink_block(block_id, new_content, reason).await {
        Ok(_) => json!({
            "success": true,
            "message": format!("Rewrote block '{}'", block_id),
        }),
        Err(EngineError::BlockNotFound { id }) => failure(format!("Block '{}' does not exist", id)),
        Err(e) => failure(e.to_string()),
    }
}

async fn memory_create_block(db: &MemoryDatabase, args: &Value) -> Value {
    let block_id = match required_str(args, "block_id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let label = match required_str(args, "label") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let content = match required_str(args, "content") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let block_type = match args.get("type").and_then(|v| v.as_str()) {
        Some(raw) => match BlockType::parse(raw) {
            Ok(t) => t,
            Err(e) => return failure(e.to_string()),
        },
        None => BlockType::Core,
    };

    match db.blocks.create_block(block_id, label, content, block_type).await {
        Ok(block) => json!({
            "success": true,
            "message": format!("Created {} block '{}'", block.block_type, block.id),
            "block_id": block.id,
        }),
        Err(EngineError::BlockConflict { id }) => {
            failure(format!("Block '{}' already exists", id))
        }
        Err(e) => failure(e.to_string()),
    }
}

fn memory_list_blocks(db: &MemoryDatabase, args: &Value) -> Value {
    let filter = match args.get("type").and_then(|v| v.as_str()) {
        Some(raw) => match BlockType::parse(raw) {
            Ok(t) => Some(t),
            Err(e) => return failure(e.to_string()),
        },
        None => None,
    };

    match db.blocks.get_all_blocks(filter) {
        Ok(blocks) => {
            let listed: Vec<Value> = blocks
                .iter()
                .map(|b| {
                    json!({
                        "id": b.id,
                        "label": b.label,
                        "type": b.block_type.as_str(),
                        "preview": preview(&b.content, 100),
                        "updated_at": format_timestamp(b.updated_at),
                    })
                })
                .collect();
            json!({ "blocks": listed })
        }
        Err(e) => failure(e.to_string()),
    }
}

async fn memory_search(db: &MemoryDatabase, args: &Value) -> Value {
    let query = match required_str(args, "query") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let limit = args
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(db.config().embedding.search_limit);
    let semantic = args
        .get("useSemanticSearch")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let mut candidates = match db.blocks.get_all_blocks(None) {
        Ok(blocks) => blocks,
        Err(e) => return failure(e.to_string()),
    };
    if let Some(ids) = args.get("blocks").and_then(|v| v.as_array()) {
        let wanted: Vec<&str> = ids.iter().filter_map(|v| v.as_str()).collect();
        candidates.retain(|b| wanted.contains(&b.id.as_str()));
    }

    if semantic {
        let threshold = db.config().embedding.similarity_threshold;
        match db
            .embeddings
            .search_blocks(query, &candidates, limit, threshold)
            .await
        {
            Ok(hits) => {
                let results: Vec<Value> = hits
                    .iter()
                    .map(|(block, score)| scored_block(block, round_score(*score)))
                    .collect();
                return json!({ "results": results });
            }
            Err(e) => warn!("semantic search unavailable, using substring match: {}", e),
        }
    }

    let query_lower = query.to_lowercase();
    let results: Vec<Value> = candidates
        .iter()
        .filter(|b| b.content.to_lowercase().contains(&query_lower))
        .take(limit)
        .map(|b| scored_block(b, 1.0))
        .collect();
    json!({ "results": results })
}

fn scored_block(block: &Block, score: f64) -> Value {
    json!({
        "block_id": block.id,
        "label": block.label,
        "content": block.content,
        "score": score,
    })
}

async fn archival_insert(db: &MemoryDatabase, args: &Value) -> Value {
    let content = match required_str(args, "content") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let metadata = args.get("metadata").cloned();

    match db.blocks.insert_archival(content, metadata).await {
        Ok(entry) => json!({
            "success": true,
            "message": "Stored in archival memory",
            "id": entry.id,
        }),
        Err(e) => failure(e.to_string()),
    }
}

async fn archival_search(db: &MemoryDatabase, args: &Value) -> Value {
    let query = match required_str(args, "query") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let limit = args
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(10);
    let semantic = args
        .get("useSemanticSearch")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    if semantic {
        let entries = match db.blocks.get_all_archival() {
            Ok(entries) => entries,
            Err(e) => return failure(e.to_string()),
        };
        let threshold = db.config().embedding.similarity_threshold;
        match db
            .embeddings
            .search_archival(query, &entries, limit, threshold)
            .await
        {
            Ok(hits) => {
                let results: Vec<Value> = hits
                    .iter()
                    .map(|(entry, score)| {
                        json!({
                            "id": entry.id,
                            "content": entry.content,
                            "created_at": format_timestamp(entry.created_at),
                            "metadata": entry.metadata,
                            "score": round_score(*score),
                        })
                    })
                    .collect();
                return json!({ "results": results });
            }
            Err(e) => warn!("semantic archival search unavailable, using substring match: {}", e),
        }
    }

    match db.blocks.search_archival_text(query, limit) {
        Ok(entries) => {
            let results: Vec<Value> = entries
                .iter()
                .map(|entry| {
                    json!({
                        "id": entry.id,
                        "content": entry.content,
                        "created_at": format_timestamp(entry.created_at),
                        "metadata": entry.metadata,
                        "score": 1.0,
                    })
                })
                .collect();
            json!({ "results": results })
        }
        Err(e) => failure(e.to_string()),
    }
}

fn memory_read(db: &MemoryDatabase, args: &Value) -> Value {
    let purpose = match required_str(args, "purpose") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db.kv.read(purpose) {
        Ok(Some(entry)) => json!({
            "purpose": entry.purpose,
            "text": entry.text,
            "updated_at": format_timestamp(entry.updated_at),
        }),
        Ok(None) => failure(format!("No memory stored for purpose '{}'", purpose)),
        Err(e) => failure(e.to_string()),
    }
}

fn memory_write(db: &MemoryDatabase, args: &Value) -> Value {
    let purpose = match required_str(args, "purpose") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let text = match required_str(args, "text") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db.kv.write(purpose, text) {
        Ok(entry) => json!({
            "success": true,
            "message": format!("Stored memory for purpose '{}'", purpose),
            "updated_at": format_timestamp(entry.updated_at),
        }),
        Err(e) => failure(e.to_string()),
    }
}
