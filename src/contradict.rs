//! Contradiction detection: claim extraction plus pairwise conflict
//! classification, run after a true ADD.
//!
//! Nothing here can fail the ingest — a judge outage just means the entry
//! lands without claim fields and without a conflict pass.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ai::ToolCallClient;
use crate::db::{Entry, Resolution};
use crate::dedup::IngestSession;
use crate::repair::{self, ConflictRelation};
use crate::util::truncate_chars;
use crate::{prompts, SharedStore};

/// At most this many candidates get a pairwise classification per new entry.
const MAX_CANDIDATES: usize = 8;

/// Fallback neighbor count when no subject-key candidates exist.
const NEIGHBOR_FALLBACK: usize = 5;

#[derive(Debug, Default, Clone, Serialize)]
pub struct ContradictionOutcome {
    /// Conflicts auto-resolved by superseding the older entry.
    pub resolved: usize,
    /// Conflicts logged as pending for human review.
    pub flagged: usize,
    pub llm_calls: usize,
    pub relations_created: usize,
}

/// Run the full pass for one freshly-added entry. Degrades on any judge
/// failure; the entry's insert is never rolled back from here.
pub async fn detect(
    store: &SharedStore,
    judge: &Arc<dyn ToolCallClient>,
    mut session: Option<&mut IngestSession>,
    entry: &Entry,
) -> ContradictionOutcome {
    let mut outcome = ContradictionOutcome::default();

    // Step 1: structured claim extraction. Failure falls back silently.
    let start = std::time::Instant::now();
    let raw = judge
        .tool_call(
            "claim",
            prompts::CLAIM_SYSTEM,
            &truncate_chars(&entry.content, 600),
            "extract_claim",
            "Extract the entry's central claim as a structured tuple",
            prompts::claim_schema(),
        )
        .await;
    log_call(store, "claim", start.elapsed().as_millis() as u64).await;
    outcome.llm_calls += 1;

    let claim = match raw {
        Ok(v) => match repair::claim(&v) {
            Some(repaired) => {
                for w in &repaired.warnings {
                    debug!(warning = %w, "claim repaired");
                }
                Some(repaired.value)
            }
            None => None,
        },
        Err(e) => {
            warn!(error = %e, "claim extraction failed, continuing without claim");
            None
        }
    };

    let subject_key = match &claim {
        Some(c) => {
            let key = crate::db::subject_key(&c.subject_entity, &c.subject_attribute);
            let (id, c2) = (entry.id.clone(), c.clone());
            let key2 = key.clone();
            let res = crate::store_call(store, move |s| {
                s.update_claim(
                    &id,
                    &c2.subject_entity,
                    &c2.subject_attribute,
                    &c2.predicate,
                    &c2.object,
                    c2.confidence,
                )
            })
            .await;
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) | Err(e) => warn!(error = %e, "claim persist failed"),
            }
            if let Some(sess) = session.as_deref_mut() {
                sess.index_subject(&key2, &entry.id);
            }
            Some(key)
        }
        None => None,
    };

    // Step 2: candidates sharing the subject key, else embedding neighbors.
    let mut candidate_ids: Vec<String> = Vec::new();
    if let Some(key) = &subject_key {
        if let Some(sess) = session.as_deref() {
            candidate_ids.extend(
                sess.subject_entries(key)
                    .iter()
                    .filter(|id| *id != &entry.id)
                    .cloned(),
            );
        }
        let (key2, id2) = (key.clone(), entry.id.clone());
        let stored = crate::store_call(store, move |s| s.find_by_subject_key(&key2, &id2))
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();
        candidate_ids.extend(stored.into_iter().map(|e| e.id));
    }
    if candidate_ids.is_empty() {
        if let Some(emb) = &entry.embedding {
            let (emb2, id2) = (emb.clone(), entry.id.clone());
            let neighbors = crate::store_call(store, move |s| {
                s.find_similar(&emb2, NEIGHBOR_FALLBACK, Some(&id2))
            })
            .await
            .unwrap_or_default();
            candidate_ids.extend(neighbors.into_iter().map(|(id, _)| id));
        }
    }

    // Dedup, keep order, cap.
    let mut seen = HashSet::new();
    candidate_ids.retain(|id| id != &entry.id && seen.insert(id.clone()));
    candidate_ids.truncate(MAX_CANDIDATES);

    if candidate_ids.is_empty() {
        return outcome;
    }

    // Step 3: pairwise classification. Collect auto-resolutions and apply
    // them in one write at the end.
    let mut to_supersede: Vec<(String, f64)> = Vec::new();
    for cand_id in &candidate_ids {
        let cand = {
            let id = cand_id.clone();
            match crate::store_call(store, move |s| s.get_active(&id)).await {
                Ok(Ok(Some(c))) => c,
                _ => continue,
            }
        };

        let user = format!(
            "OLD (stored {} days ago):\n{}\n\nNEW:\n{}",
            (crate::db::now_ms() - cand.created_at) / 86_400_000,
            truncate_chars(&cand.content, 400),
            truncate_chars(&entry.content, 400),
        );
        let start = std::time::Instant::now();
        let raw = judge
            .tool_call(
                "conflict",
                prompts::CONFLICT_SYSTEM,
                &user,
                "classify_conflict",
                "Classify the relationship between the two entries",
                prompts::conflict_schema(),
            )
            .await;
        log_call(store, "conflict", start.elapsed().as_millis() as u64).await;
        outcome.llm_calls += 1;

        let verdict = match raw {
            Ok(v) => {
                let repaired = repair::conflict_verdict(&v);
                for w in &repaired.warnings {
                    debug!(warning = %w, "conflict verdict repaired");
                }
                repaired.value
            }
            Err(e) => {
                warn!(error = %e, candidate = %crate::util::short_id(cand_id), "conflict classification failed, skipping pair");
                continue;
            }
        };

        match verdict.relation {
            ConflictRelation::Supersedes => {
                to_supersede.push((cand.id.clone(), verdict.confidence));
            }
            ConflictRelation::Contradicts => {
                // No entry mutation — just the audit trail and a typed edge.
                let (a, b, conf) = (entry.id.clone(), cand.id.clone(), verdict.confidence);
                let logged = crate::store_call(store, move |s| {
                    s.insert_relation(&a, &b, crate::db::RelationKind::Contradicts)?;
                    s.log_conflict(&a, &b, "contradicts", conf, Resolution::Pending)
                })
                .await;
                match logged {
                    Ok(Ok(())) => {
                        outcome.flagged += 1;
                        outcome.relations_created += 1;
                        info!(
                            a = %crate::util::short_id(&entry.id),
                            b = %crate::util::short_id(&cand.id),
                            explanation = %truncate_chars(&verdict.explanation, 80),
                            "contradiction flagged for review"
                        );
                    }
                    Ok(Err(e)) | Err(e) => warn!(error = %e, "conflict log failed"),
                }
            }
            ConflictRelation::Coexists | ConflictRelation::Unrelated => {}
        }
    }

    // Step 4: one write resolves every supersedes verdict.
    if !to_supersede.is_empty() {
        let (winner, losers) = (entry.id.clone(), to_supersede.clone());
        match crate::store_call(store, move |s| s.resolve_conflicts(&winner, &losers)).await {
            Ok(Ok(())) => {
                outcome.resolved = to_supersede.len();
                outcome.relations_created += to_supersede.len();
                info!(
                    winner = %crate::util::short_id(&entry.id),
                    resolved = to_supersede.len(),
                    "auto-superseded conflicting entries"
                );
            }
            Ok(Err(e)) | Err(e) => warn!(error = %e, "conflict resolution write failed"),
        }
    }

    outcome
}

async fn log_call(store: &SharedStore, component: &'static str, duration_ms: u64) {
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.log_llm_call(component, duration_ms))
        .await
        .ok();
}
