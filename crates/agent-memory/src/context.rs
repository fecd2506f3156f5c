//! Context assembly: one prompt fragment from every memory source
//!
//! The host concatenates the persona prompt, the legacy memory fragment,
//! the core block fragment and the conversation-history fragment, closed
//! by a fixed tool-instruction suffix. Pure string work; the convenience
//! builder gathers the fragments from a database handle.

use crate::db::MemoryDatabase;
use crate::error::EngineResult;

/// Fixed suffix appended to every assembled prompt. Contract text: stable
/// verbatim across rebuilds.
pub const TOOL_INSTRUCTIONS: &str = "\
## Memory Tools
Read a block before editing it (memory_get_block). Add to blocks with \
memory_insert, correct them with memory_replace, rewrite them with \
memory_rethink, and create new ones with memory_create_block. Store \
long-term facts with archival_insert; recall them with archival_search or \
memory_search. The legacy memory_read and memory_write tools remain \
available for flat entries.";

/// Concatenate prompt parts in their fixed order, skipping empty ones.
pub fn assemble_prompt(
    persona_prompt: &str,
    kv_fragment: &str,
    core_fragment: &str,
    summary_fragment: &str,
) -> String {
    let parts = [
        persona_prompt,
        kv_fragment,
        core_fragment,
        summary_fragment,
        TOOL_INSTRUCTIONS,
    ];
    parts
        .iter()
        .map(|p| p.trim_end())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Gather every fragment from `db` and assemble the system prompt.
pub fn build_system_prompt(db: &MemoryDatabase, persona_prompt: &str) -> EngineResult<String> {
    let kv_fragment = db.kv.build_prompt_fragment();
    let core_fragment = db.blocks.build_core_prompt_fragment()?;
    let loaded = db.summaries.load_for_context()?;
    let summary_fragment = db.summaries.build_prompt_fragment(&loaded);
    Ok(assemble_prompt(
        persona_prompt,
        &kv_fragment,
        &core_fragment,
        &summary_fragment,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::schema::BlockType;

    #[test]
    fn empty_fragments_are_skipped() {
        let prompt = assemble_prompt("You are a scheduler.", "", "", "");
        assert!(prompt.starts_with("You are a scheduler."));
        assert!(prompt.ends_with(TOOL_INSTRUCTIONS));
        assert!(!prompt.contains("\n\n\n"));
    }

    #[test]
    fn parts_keep_their_order() {
        let prompt = assemble_prompt("PERSONA", "KV", "CORE", "SUMMARIES");
        let persona = prompt.find("PERSONA").unwrap();
        let kv = prompt.find("KV").unwrap();
        let core = prompt.find("CORE").unwrap();
        let summaries = prompt.find("SUMMARIES").unwrap();
        let tools = prompt.find("## Memory Tools").unwrap();
        assert!(persona < kv && kv < core && core < summaries && summaries < tools);
    }

    #[tokio::test]
    async fn build_system_prompt_pulls_every_source() {
        let db = MemoryDatabase::open_in_memory(EngineConfig::default(), None).unwrap();
        db.kv.write("user_name", "Ada").unwrap();
        db.blocks
            .create_block("human", "Human", "Ada, engineer", BlockType::Core)
            .await
            .unwrap();

        let prompt = build_system_prompt(&db, "You are an archivist.").unwrap();
        assert!(prompt.contains("You are an archivist."));
        assert!(prompt.contains("## Memory"));
        assert!(prompt.contains("## Core Memory"));
        assert!(prompt.contains("## Memory Tools"));
    }
}
