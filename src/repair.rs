//! Centralized repair of LLM structured output.
//!
//! Tool-call responses are schema-constrained but never trusted: every field
//! is validated here and corrected to a safe default when invalid, with a
//! warning recorded per repaired field. Callers decide what to do with the
//! warnings (usually log them); nothing in this module is fatal.

use serde_json::Value;

use crate::db::Tier;

pub struct Repaired<T> {
    pub value: T,
    pub warnings: Vec<String>,
}

impl<T> Repaired<T> {
    fn clean(value: T) -> Self {
        Self {
            value,
            warnings: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupAction {
    Add,
    Skip,
    Update,
    Supersede,
}

#[derive(Debug)]
pub struct DedupDecision {
    pub action: DedupAction,
    pub target_id: Option<String>,
    pub merged_content: Option<String>,
}

fn str_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Repair a dedup arbitration result. Anything unusable degrades to ADD —
/// a duplicate row is recoverable, a wrongly-dropped entry is not.
pub fn dedup_decision(raw: &Value, known_targets: &[&str]) -> Repaired<DedupDecision> {
    let mut warnings = Vec::new();
    let action_str = str_field(raw, "action").unwrap_or_default();
    let mut action = match action_str.as_str() {
        "add" => DedupAction::Add,
        "skip" => DedupAction::Skip,
        "update" => DedupAction::Update,
        "supersede" => DedupAction::Supersede,
        other => {
            warnings.push(format!("invalid action '{other}', defaulting to add"));
            DedupAction::Add
        }
    };

    let mut target_id = str_field(raw, "target_id");
    if action != DedupAction::Add {
        match &target_id {
            Some(t) if known_targets.contains(&t.as_str()) => {}
            Some(t) => {
                warnings.push(format!("target_id '{t}' not among candidates, defaulting to add"));
                action = DedupAction::Add;
                target_id = None;
            }
            None => {
                warnings.push(format!("{action_str} without target_id, defaulting to add"));
                action = DedupAction::Add;
            }
        }
    }

    let merged_content = str_field(raw, "merged_content");
    if action == DedupAction::Update && merged_content.is_none() {
        warnings.push("update without merged_content, downgrading to skip".into());
        action = DedupAction::Skip;
    }

    Repaired {
        value: DedupDecision {
            action,
            target_id,
            merged_content,
        },
        warnings,
    }
}

#[derive(Debug, Clone)]
pub struct ClaimDraft {
    pub subject_entity: String,
    pub subject_attribute: String,
    pub predicate: String,
    pub object: String,
    pub confidence: f64,
}

/// Repair an extracted claim. Returns None when the extraction is unusable —
/// the caller continues without claim fields (silent fallback).
pub fn claim(raw: &Value) -> Option<Repaired<ClaimDraft>> {
    let subject_entity = str_field(raw, "subject_entity")?;
    let subject_attribute = str_field(raw, "subject_attribute")?;
    let mut warnings = Vec::new();
    let predicate = str_field(raw, "predicate").unwrap_or_else(|| {
        warnings.push("missing predicate, using 'is'".into());
        "is".into()
    });
    let object = str_field(raw, "object").unwrap_or_else(|| {
        warnings.push("missing object, using empty string".into());
        String::new()
    });
    let confidence = match raw.get("confidence").and_then(Value::as_f64) {
        Some(c) if (0.0..=1.0).contains(&c) => c,
        Some(c) => {
            warnings.push(format!("confidence {c} out of range, clamping"));
            c.clamp(0.0, 1.0)
        }
        None => {
            warnings.push("missing confidence, using 0.5".into());
            0.5
        }
    };
    Some(Repaired {
        value: ClaimDraft {
            subject_entity,
            subject_attribute,
            predicate,
            object,
            confidence,
        },
        warnings,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictRelation {
    Supersedes,
    Contradicts,
    Coexists,
    Unrelated,
}

impl ConflictRelation {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictRelation::Supersedes => "supersedes",
            ConflictRelation::Contradicts => "contradicts",
            ConflictRelation::Coexists => "coexists",
            ConflictRelation::Unrelated => "unrelated",
        }
    }
}

#[derive(Debug)]
pub struct ConflictVerdict {
    pub relation: ConflictRelation,
    pub confidence: f64,
    pub explanation: String,
}

/// Repair a pairwise conflict classification. Invalid relations become
/// `unrelated` — the do-nothing verdict.
pub fn conflict_verdict(raw: &Value) -> Repaired<ConflictVerdict> {
    let mut warnings = Vec::new();
    let relation = match str_field(raw, "relation").as_deref() {
        Some("supersedes") => ConflictRelation::Supersedes,
        Some("contradicts") => ConflictRelation::Contradicts,
        Some("coexists") => ConflictRelation::Coexists,
        Some("unrelated") => ConflictRelation::Unrelated,
        other => {
            warnings.push(format!(
                "invalid relation {:?}, defaulting to unrelated",
                other.unwrap_or("<missing>")
            ));
            ConflictRelation::Unrelated
        }
    };
    let confidence = raw
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);
    let explanation = str_field(raw, "explanation").unwrap_or_default();
    Repaired {
        value: ConflictVerdict {
            relation,
            confidence,
            explanation,
        },
        warnings,
    }
}

/// Repair a same-knowledge check. Anything unclear means "not the same".
pub fn same_knowledge(raw: &Value) -> Repaired<bool> {
    match raw.get("same").and_then(Value::as_bool) {
        Some(b) => Repaired::clean(b),
        None => Repaired {
            value: false,
            warnings: vec!["missing 'same' boolean, defaulting to false".into()],
        },
    }
}

#[derive(Debug, Clone)]
pub struct MergeDraft {
    pub content: String,
    pub subject: String,
    pub kind: String,
    pub importance: i64,
    pub tier: Tier,
    pub tags: Vec<String>,
    pub notes: Option<String>,
}

/// Repair a merge synthesis result. Kind falls back to the cluster majority
/// (and is forced to it by the merge engine regardless), importance to 5,
/// expiry to permanent. An empty content survives repair — the merge engine
/// treats it as a failed synthesis and flags the cluster.
pub fn merge_draft(raw: &Value, majority_kind: &str, default_subject: &str) -> Repaired<MergeDraft> {
    let mut warnings = Vec::new();
    let content = str_field(raw, "content").unwrap_or_else(|| {
        warnings.push("missing content".into());
        String::new()
    });
    let subject = str_field(raw, "subject").unwrap_or_else(|| {
        warnings.push("missing subject, keeping cluster subject".into());
        default_subject.to_string()
    });
    let kind = str_field(raw, "kind").unwrap_or_else(|| {
        warnings.push(format!("missing kind, using majority '{majority_kind}'"));
        majority_kind.to_string()
    });
    let importance = match raw.get("importance").and_then(Value::as_i64) {
        Some(i) if (1..=10).contains(&i) => i,
        Some(i) => {
            warnings.push(format!("importance {i} out of range, using 5"));
            5
        }
        None => {
            warnings.push("missing importance, using 5".into());
            5
        }
    };
    let tier = match str_field(raw, "expiry").as_deref().map(Tier::try_from) {
        Some(Ok(t)) => t,
        Some(Err(_)) | None => {
            warnings.push("invalid expiry tier, using permanent".into());
            Tier::Permanent
        }
    };
    let tags = match raw.get("tags") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .take(20)
            .collect(),
        Some(_) => {
            warnings.push("tags is not an array, dropping".into());
            vec![]
        }
        None => vec![],
    };
    let notes = str_field(raw, "notes");
    Repaired {
        value: MergeDraft {
            content,
            subject,
            kind,
            importance,
            tier,
            tags,
            notes,
        },
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dedup_valid_skip() {
        let r = dedup_decision(&json!({"action": "skip", "target_id": "t1"}), &["t1"]);
        assert_eq!(r.value.action, DedupAction::Skip);
        assert!(r.warnings.is_empty());
    }

    #[test]
    fn dedup_unknown_target_degrades_to_add() {
        let r = dedup_decision(&json!({"action": "supersede", "target_id": "nope"}), &["t1"]);
        assert_eq!(r.value.action, DedupAction::Add);
        assert_eq!(r.warnings.len(), 1);
    }

    #[test]
    fn dedup_update_without_content_downgrades_to_skip() {
        let r = dedup_decision(&json!({"action": "update", "target_id": "t1"}), &["t1"]);
        assert_eq!(r.value.action, DedupAction::Skip);
    }

    #[test]
    fn dedup_garbage_action_is_add() {
        let r = dedup_decision(&json!({"action": "destroy"}), &[]);
        assert_eq!(r.value.action, DedupAction::Add);
    }

    #[test]
    fn claim_requires_entity_and_attribute() {
        assert!(claim(&json!({"predicate": "is"})).is_none());
        let r = claim(&json!({
            "subject_entity": "Jim",
            "subject_attribute": "package manager",
            "predicate": "prefers",
            "object": "pnpm",
            "confidence": 0.9
        }))
        .unwrap();
        assert_eq!(r.value.object, "pnpm");
        assert!(r.warnings.is_empty());
    }

    #[test]
    fn claim_clamps_confidence() {
        let r = claim(&json!({
            "subject_entity": "a", "subject_attribute": "b", "confidence": 3.0
        }))
        .unwrap();
        assert_eq!(r.value.confidence, 1.0);
        assert!(!r.warnings.is_empty());
    }

    #[test]
    fn conflict_invalid_relation_is_unrelated() {
        let r = conflict_verdict(&json!({"relation": "fights"}));
        assert_eq!(r.value.relation, ConflictRelation::Unrelated);
        assert_eq!(r.warnings.len(), 1);
    }

    #[test]
    fn merge_draft_defaults() {
        let r = merge_draft(&json!({"content": "x", "importance": 42}), "decision", "subj");
        assert_eq!(r.value.importance, 5);
        assert_eq!(r.value.tier, Tier::Permanent);
        assert_eq!(r.value.subject, "subj");
        assert!(r.warnings.len() >= 2);
    }
}
