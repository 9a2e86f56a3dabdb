//! Merge engine: synthesize one canonical entry from a validated cluster,
//! verify fidelity against the sources, commit atomically.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ai::{centroid, cosine_similarity, ToolCallClient};
use crate::db::{now_ms, Entry, EntryStatus};
use crate::embed::BatchEmbedder;
use crate::error::MnemonError;
use crate::fingerprint;
use crate::thresholds::{
    MERGE_CENTROID_FIDELITY, MERGE_SOURCE_FIDELITY, PROMPT_CHAR_BUDGET,
};
use crate::util::{truncate_bytes, truncate_chars};
use crate::{prompts, repair, SharedStore};

use super::cluster::Cluster;
use super::review::{ReviewItem, ReviewQueue};

/// Sentinel id returned by dry runs; never appears in the store.
pub const DRY_RUN_ID: &str = "dry-run";

/// Per-entry content truncation tiers tried until the prompt fits the budget.
const CONTENT_TIERS: [usize; 3] = [usize::MAX, 800, 400];

/// Hard per-entry byte cap when even the smallest tier overflows.
const HARD_BYTE_CAP: usize = 240;

#[derive(Debug)]
pub enum MergeOutcome {
    /// Canonical entry committed, sources superseded.
    Merged { id: String, absorbed: usize },
    /// Fidelity or synthesis failure — queued for review, nothing written.
    Flagged { reason: String },
    /// Dry run: verification passed, nothing written.
    DryRun { id: String },
}

/// Merge one validated cluster. Returns the outcome plus the number of LLM
/// calls made. `dry_run` performs synthesis and verification only and writes
/// nothing — not even the review queue.
pub async fn merge_cluster(
    store: &SharedStore,
    embedder: &BatchEmbedder,
    judge: &Arc<dyn ToolCallClient>,
    review: &ReviewQueue,
    cluster: &Cluster,
    dry_run: bool,
) -> Result<(MergeOutcome, usize), MnemonError> {
    if cluster.len() < 2 {
        return Ok((
            MergeOutcome::Flagged {
                reason: "cluster has fewer than 2 members".into(),
            },
            0,
        ));
    }

    let majority = majority_kind(cluster);
    let user = build_prompt(cluster);

    let start = std::time::Instant::now();
    let raw = judge
        .tool_call(
            "merge",
            prompts::MERGE_SYSTEM,
            &user,
            "merge_entries",
            "Synthesize one canonical entry from the cluster",
            prompts::merge_schema(),
        )
        .await;
    let duration = start.elapsed().as_millis() as u64;
    {
        let store2 = store.clone();
        tokio::task::spawn_blocking(move || store2.log_llm_call("merge", duration))
            .await
            .ok();
    }

    let raw = match raw {
        Ok(v) => v,
        Err(e) => {
            let reason = format!("merge synthesis failed: {e}");
            return Ok((flag(review, cluster, reason, None, None, None, dry_run), 1));
        }
    };

    // The subject of the best-supported member anchors repair fallbacks.
    let anchor_subject = cluster
        .members
        .iter()
        .max_by_key(|(e, _)| crate::scoring::support(e))
        .map(|(e, _)| e.subject.clone())
        .unwrap_or_default();
    let repaired = repair::merge_draft(&raw, &majority, &anchor_subject);
    for w in &repaired.warnings {
        debug!(warning = %w, "merge draft repaired");
    }
    let mut draft = repaired.value;

    if draft.content.trim().is_empty() {
        return Ok((
            flag(review, cluster, "empty synthesis".into(), None, None, None, dry_run),
            1,
        ));
    }

    // The cluster's majority kind wins regardless of what the LLM chose.
    if draft.kind != majority {
        debug!(llm = %draft.kind, majority = %majority, "forcing majority kind");
        draft.kind = majority.clone();
    }

    // Fidelity verification: the merged text must stay close to every source
    // and to their centroid, or nothing is written.
    let merged_emb = embedder.embed_one(None, &draft.content).await?;
    let worst_source = cluster
        .members
        .iter()
        .map(|(_, emb)| cosine_similarity(emb, &merged_emb))
        .fold(f64::MAX, f64::min);
    let source_vecs: Vec<&[f32]> = cluster.members.iter().map(|(_, e)| e.as_slice()).collect();
    let centroid_vec = centroid(&source_vecs);
    let centroid_sim = cosine_similarity(&centroid_vec, &merged_emb);

    if worst_source < MERGE_SOURCE_FIDELITY || centroid_sim < MERGE_CENTROID_FIDELITY {
        let reason = format!(
            "fidelity check failed: worst source {:.3} (floor {}), centroid {:.3} (floor {})",
            worst_source, MERGE_SOURCE_FIDELITY, centroid_sim, MERGE_CENTROID_FIDELITY
        );
        return Ok((
            flag(
                review,
                cluster,
                reason,
                Some(worst_source),
                Some(centroid_sim),
                Some(draft.content.clone()),
                dry_run,
            ),
            1,
        ));
    }

    if dry_run {
        debug!(members = cluster.len(), "dry-run merge verified");
        return Ok((
            MergeOutcome::DryRun {
                id: DRY_RUN_ID.into(),
            },
            1,
        ));
    }

    // Build the canonical entry: counters summed, tags unioned, provenance
    // recorded per source inside one transaction.
    let sources: Vec<Entry> = cluster.members.iter().map(|(e, _)| e.clone()).collect();
    let now = now_ms();
    let tag_slices: Vec<&[String]> = sources.iter().map(|e| e.tags.as_slice()).collect();
    let merged = Entry {
        id: Uuid::new_v4().to_string(),
        kind: draft.kind,
        subject: draft.subject,
        content: draft.content.clone(),
        importance: draft.importance,
        tier: draft.tier,
        tags: merge_tags(&draft.tags, &tag_slices, 20),
        embedding: Some(merged_emb),
        content_hash: fingerprint::content_hash(&draft.content),
        norm_hash: fingerprint::norm_hash(&draft.content),
        minhash: Some(fingerprint::shared().signature(&draft.content)),
        subject_entity: None,
        subject_attribute: None,
        subject_key: None,
        claim_predicate: None,
        claim_object: None,
        claim_confidence: None,
        confirmations: sources.iter().map(|e| e.confirmations).sum(),
        recall_count: sources.iter().map(|e| e.recall_count).sum(),
        created_at: now,
        updated_at: now,
        status: EntryStatus::Active,
        merged_from: sources.len() as i64,
        consolidated_at: Some(now),
    };

    {
        let merged2 = merged.clone();
        let sources2 = sources.clone();
        crate::store_call(store, move |s| s.commit_merge(&merged2, &sources2)).await??;
    }

    if let Some(notes) = &draft.notes {
        debug!(notes = %truncate_chars(notes, 120), "merge notes");
    }
    info!(
        id = %crate::util::short_id(&merged.id),
        absorbed = sources.len(),
        worst_source = format!("{:.3}", worst_source),
        centroid = format!("{:.3}", centroid_sim),
        "cluster merged"
    );

    Ok((
        MergeOutcome::Merged {
            id: merged.id,
            absorbed: sources.len(),
        },
        1,
    ))
}

/// Queue the failure for review (skipped on dry runs) and report it.
fn flag(
    review: &ReviewQueue,
    cluster: &Cluster,
    reason: String,
    worst_source_sim: Option<f64>,
    centroid_sim: Option<f64>,
    draft_content: Option<String>,
    dry_run: bool,
) -> MergeOutcome {
    warn!(reason = %reason, members = cluster.len(), "merge flagged");
    if !dry_run {
        let item = ReviewItem {
            cluster_ids: cluster
                .members
                .iter()
                .map(|(e, _)| e.id.clone())
                .collect(),
            reason: reason.clone(),
            worst_source_sim,
            centroid_sim,
            draft_content,
            created_at: now_ms(),
        };
        if let Err(e) = review.append(&item) {
            // The queue is the durability guarantee for flagged merges; a
            // failed append is itself worth shouting about.
            warn!(error = %e, "review queue append failed");
        }
    }
    MergeOutcome::Flagged { reason }
}

/// Cluster majority kind; ties broken by total confirmations.
fn majority_kind(cluster: &Cluster) -> String {
    let mut by_kind: std::collections::HashMap<&str, (usize, i64)> =
        std::collections::HashMap::new();
    for (e, _) in &cluster.members {
        let slot = by_kind.entry(e.kind.as_str()).or_default();
        slot.0 += 1;
        slot.1 += e.confirmations;
    }
    by_kind
        .into_iter()
        .max_by_key(|(_, (count, confirmations))| (*count, *confirmations))
        .map(|(k, _)| k.to_string())
        .unwrap_or_else(|| "fact".into())
}

/// Render the member list, shrinking per-entry content tier by tier until the
/// prompt fits the character budget, with a hard byte cap as the last resort.
fn build_prompt(cluster: &Cluster) -> String {
    for tier in CONTENT_TIERS {
        let rendered = render_members(cluster, tier, None);
        if rendered.chars().count() <= PROMPT_CHAR_BUDGET {
            return rendered;
        }
    }
    render_members(cluster, CONTENT_TIERS[CONTENT_TIERS.len() - 1], Some(HARD_BYTE_CAP))
}

fn render_members(cluster: &Cluster, char_cap: usize, byte_cap: Option<usize>) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    let _ = writeln!(out, "Merge these {} entries into one:", cluster.len());
    for (i, (e, _)) in cluster.members.iter().enumerate() {
        let content = if char_cap == usize::MAX {
            e.content.clone()
        } else {
            truncate_chars(&e.content, char_cap)
        };
        let content = match byte_cap {
            Some(cap) => truncate_bytes(&content, cap).to_string(),
            None => content,
        };
        let _ = writeln!(
            out,
            "{}. [kind={} subject={} importance={} confirmations={}]\n   {}",
            i + 1,
            e.kind,
            e.subject,
            e.importance,
            e.confirmations,
            content,
        );
    }
    out
}

/// Merge tags from multiple sources, deduplicating and capping at `cap`.
pub fn merge_tags(base: &[String], others: &[&[String]], cap: usize) -> Vec<String> {
    let mut merged: Vec<String> = base.to_vec();
    for tags in others {
        for t in *tags {
            if !merged.contains(t) {
                merged.push(t.clone());
            }
        }
    }
    merged.truncate(cap);
    merged
}
