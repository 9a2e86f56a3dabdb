//! System prompts and tool schemas for every judge call.

use serde_json::{json, Value};

pub const DEDUP_SYSTEM: &str = "You arbitrate whether a new memory entry duplicates existing ones. \
    You see the NEW entry and its nearest stored neighbors. Decide exactly one action: \
    add — the new entry is genuinely new knowledge; \
    skip — a neighbor already states this, keep the neighbor as-is; \
    update — a neighbor states an older/partial version, rewrite it to include the new information \
    (provide merged_content that preserves every specific detail from both); \
    supersede — the new entry replaces a neighbor that is now wrong or outdated. \
    For skip/update/supersede, target_id must be one of the listed neighbor ids. \
    Prefer add when unsure — a duplicate is cheaper than lost knowledge.";

pub fn dedup_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": {
                "type": "string",
                "enum": ["add", "skip", "update", "supersede"],
                "description": "How to store the new entry"
            },
            "target_id": {
                "type": "string",
                "description": "Neighbor id for skip/update/supersede"
            },
            "merged_content": {
                "type": "string",
                "description": "For update: the rewritten content combining both"
            }
        },
        "required": ["action"]
    })
}

pub const CLAIM_SYSTEM: &str = "Extract the single central claim from a memory entry as a structured \
    tuple. subject_entity is who/what the claim is about (a person, project, tool). \
    subject_attribute is the aspect being claimed (e.g. 'package manager', 'deploy day'). \
    predicate is the verb relation ('prefers', 'is', 'decided'). object is the claimed value. \
    confidence is how unambiguous the claim is, 0.0-1.0. \
    If the entry makes no single clear claim, return empty strings.";

pub fn claim_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "subject_entity": { "type": "string" },
            "subject_attribute": { "type": "string" },
            "predicate": { "type": "string" },
            "object": { "type": "string" },
            "confidence": { "type": "number", "description": "0.0-1.0" }
        },
        "required": ["subject_entity", "subject_attribute", "predicate", "object"]
    })
}

pub const CONFLICT_SYSTEM: &str = "Two memory entries make claims about the same topic. Classify their relationship: \
    supersedes — the NEW entry states a newer value for the same fact; the OLD one is now outdated \
    (e.g. 'deploys on Friday' → 'deploys on Monday'); \
    contradicts — they cannot both be true and it is NOT clear the new one wins \
    (conflicting reports, no temporal ordering); \
    coexists — they are about the same topic but both can hold \
    (different aspects, different scopes); \
    unrelated — the apparent overlap is superficial. \
    Only answer supersedes when you are confident the new entry replaces the old.";

pub fn conflict_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "relation": {
                "type": "string",
                "enum": ["supersedes", "contradicts", "coexists", "unrelated"]
            },
            "confidence": { "type": "number", "description": "0.0-1.0" },
            "explanation": { "type": "string", "description": "One sentence" }
        },
        "required": ["relation", "confidence"]
    })
}

pub const SAME_KNOWLEDGE_SYSTEM: &str = "Decide whether two memory entries encode the same piece of knowledge \
    (same fact, preference, or decision — wording may differ). \
    Entries that merely share a topic are NOT the same knowledge. \
    Answer same=true only when merging them would lose nothing.";

pub fn same_knowledge_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "same": { "type": "boolean" }
        },
        "required": ["same"]
    })
}

pub const MERGE_SYSTEM: &str = "Synthesize one canonical memory entry from a cluster of overlapping entries. \
    Preserve EVERY specific detail: names, versions, dates, numbers, reasons. \
    Drop only exact repetition. The result must be a self-contained statement \
    that could replace all the inputs without losing information. \
    Choose subject/kind/importance/expiry to describe the merged knowledge; \
    kind and expiry must come from the listed enums. \
    Use notes for anything a reviewer should know about the merge.";

pub fn merge_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "content": { "type": "string", "description": "The merged entry text" },
            "subject": { "type": "string" },
            "kind": {
                "type": "string",
                "enum": ["fact", "preference", "decision", "todo", "event"]
            },
            "importance": { "type": "integer", "description": "1-10" },
            "expiry": {
                "type": "string",
                "enum": ["core", "permanent", "temporary"]
            },
            "tags": { "type": "array", "items": { "type": "string" } },
            "notes": { "type": "string" }
        },
        "required": ["content", "subject", "kind", "importance", "expiry"]
    })
}
