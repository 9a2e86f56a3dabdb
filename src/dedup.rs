//! Online dedup: the per-entry ingest-time choice among ADD/SKIP/UPDATE/
//! SUPERSEDE.
//!
//! The ladder is cheapest-first: a seen-hash match costs nothing, a clear
//! cosine miss costs one embedding, and only genuinely ambiguous entries pay
//! for an LLM arbitration. Writes commit per entry so a failure mid-batch
//! never takes committed entries with it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ai::ToolCallClient;
use crate::contradict::{self, ContradictionOutcome};
use crate::db::EntryInput;
use crate::embed::BatchEmbedder;
use crate::error::MnemonError;
use crate::fingerprint;
use crate::repair::{self, DedupAction};
use crate::thresholds::{DEDUP_NEIGHBOR_K, DEDUP_SIM};
use crate::util::truncate_chars;
use crate::{prompts, EmbedCache, SharedStore};

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Best-neighbor cosine below this is an unambiguous ADD.
    pub threshold: f64,
    /// Nearest active neighbors fetched per entry.
    pub neighbor_k: usize,
    /// Run the contradiction detector after true ADDs.
    pub detect_contradictions: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: DEDUP_SIM,
            neighbor_k: DEDUP_NEIGHBOR_K,
            detect_contradictions: false,
        }
    }
}

/// Per-run ingest context, passed by ownership through the call chain:
/// hashes seen this run, the subject index the contradiction detector keeps
/// in sync, and the embedding cache.
#[derive(Default)]
pub struct IngestSession {
    /// Ingest content hash → stored entry id, when one exists.
    seen: HashMap<String, Option<String>>,
    /// subject_key → active entry ids, maintained as claims are extracted.
    subject_index: HashMap<String, Vec<String>>,
    pub cache: EmbedCache,
}

impl IngestSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    pub(crate) fn note_seen(&mut self, hash: String, id: Option<String>) {
        self.seen.entry(hash).or_insert(id);
    }

    pub(crate) fn lookup_seen(&self, hash: &str) -> Option<&Option<String>> {
        self.seen.get(hash)
    }

    pub(crate) fn index_subject(&mut self, key: &str, id: &str) {
        let ids = self.subject_index.entry(key.to_string()).or_default();
        if !ids.iter().any(|x| x == id) {
            ids.push(id.to_string());
        }
    }

    pub(crate) fn subject_entries(&self, key: &str) -> &[String] {
        self.subject_index
            .get(key)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
    Added,
    Updated,
    Skipped,
    Superseded,
}

/// What one `store_entry` call did.
#[derive(Debug)]
pub struct WriteOutcome {
    pub action: WriteAction,
    /// The surviving entry: the new id for Added/Superseded, the target id
    /// for Updated, the target for Skipped (None when the duplicate was only
    /// seen earlier in this run and never stored).
    pub id: Option<String>,
    pub llm_calls: usize,
    pub relations_created: usize,
    pub conflicts: Option<ContradictionOutcome>,
}

/// Aggregate counts for callers writing many entries.
#[derive(Debug, Default, Serialize)]
pub struct WriteStats {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub superseded: usize,
    pub llm_dedup_calls: usize,
    pub relations_created: usize,
    pub conflicts_resolved: usize,
    pub conflicts_flagged: usize,
}

impl WriteStats {
    pub fn absorb(&mut self, outcome: &WriteOutcome) {
        match outcome.action {
            WriteAction::Added => self.added += 1,
            WriteAction::Updated => self.updated += 1,
            WriteAction::Skipped => self.skipped += 1,
            WriteAction::Superseded => self.superseded += 1,
        }
        self.llm_dedup_calls += outcome.llm_calls;
        self.relations_created += outcome.relations_created;
        if let Some(c) = &outcome.conflicts {
            self.conflicts_resolved += c.resolved;
            self.conflicts_flagged += c.flagged;
            self.relations_created += c.relations_created;
        }
    }
}

/// Store one entry with online dedup. Commits before returning.
pub async fn store_entry(
    store: &SharedStore,
    embedder: &BatchEmbedder,
    judge: Option<&Arc<dyn ToolCallClient>>,
    cfg: &DedupConfig,
    session: &mut IngestSession,
    input: EntryInput,
    force: bool,
) -> Result<WriteOutcome, MnemonError> {
    let hash = fingerprint::content_hash(&input.content);

    // `force` bypasses every dedup tier unconditionally.
    if force {
        let embedding = embedder.embed_one(Some(&session.cache), &input.content).await?;
        return finish_add(store, judge, cfg, session, input, embedding, hash, 0).await;
    }

    // Tier 0: exact ingest-hash already seen this run — no embedding, no LLM.
    if let Some(known) = session.lookup_seen(&hash).cloned() {
        if let Some(target) = &known {
            let id = target.clone();
            crate::store_call(store, move |s| s.bump_confirmations(&id, 1)).await??;
        }
        debug!(hash = %truncate_chars(&hash, 12), "duplicate ingest hash, skipping");
        return Ok(WriteOutcome {
            action: WriteAction::Skipped,
            id: known,
            llm_calls: 0,
            relations_created: 0,
            conflicts: None,
        });
    }

    let embedding = embedder.embed_one(Some(&session.cache), &input.content).await?;

    // Tier 1: cosine against the K nearest active entries.
    let neighbors = {
        let emb = embedding.clone();
        let k = cfg.neighbor_k;
        crate::store_call(store, move |s| s.find_similar_entries(&emb, k, None)).await??
    };
    let best_sim = neighbors.first().map(|(_, sim)| *sim).unwrap_or(0.0);

    if best_sim < cfg.threshold {
        return finish_add(store, judge, cfg, session, input, embedding, hash, 0).await;
    }

    // Tier 2: LLM arbitration. No judge configured (or a failed call)
    // degrades to ADD — a duplicate row beats lost knowledge.
    let Some(judge) = judge else {
        return finish_add(store, judge, cfg, session, input, embedding, hash, 0).await;
    };

    let mut user = format!(
        "NEW ENTRY (kind={}, subject={}):\n{}\n\nNEIGHBORS:\n",
        input.kind.as_deref().unwrap_or("fact"),
        input.subject.as_deref().unwrap_or(""),
        truncate_chars(&input.content, 600),
    );
    for (i, (e, sim)) in neighbors.iter().enumerate() {
        use std::fmt::Write;
        let _ = writeln!(
            user,
            "{}. id={} sim={:.3} kind={} subject={}\n   {}",
            i + 1,
            e.id,
            sim,
            e.kind,
            e.subject,
            truncate_chars(&e.content, 300),
        );
    }

    let start = std::time::Instant::now();
    let raw = judge
        .tool_call(
            "dedup",
            prompts::DEDUP_SYSTEM,
            &user,
            "dedup_decision",
            "Decide how to store the new entry relative to its neighbors",
            prompts::dedup_schema(),
        )
        .await;
    let duration = start.elapsed().as_millis() as u64;
    {
        let store2 = store.clone();
        tokio::task::spawn_blocking(move || store2.log_llm_call("dedup", duration))
            .await
            .ok();
    }

    let raw = match raw {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "dedup arbitration failed, falling back to add");
            return finish_add(store, Some(judge), cfg, session, input, embedding, hash, 1).await;
        }
    };

    let known_ids: Vec<&str> = neighbors.iter().map(|(e, _)| e.id.as_str()).collect();
    let repaired = repair::dedup_decision(&raw, &known_ids);
    for w in &repaired.warnings {
        warn!(warning = %w, "dedup decision repaired");
    }
    let decision = repaired.value;

    match decision.action {
        DedupAction::Add => {
            finish_add(store, Some(judge), cfg, session, input, embedding, hash, 1).await
        }
        DedupAction::Skip => {
            let Some(target) = decision.target_id else {
                return finish_add(store, Some(judge), cfg, session, input, embedding, hash, 1).await;
            };
            {
                let id = target.clone();
                crate::store_call(store, move |s| s.bump_confirmations(&id, 1)).await??;
            }
            info!(target = %crate::util::short_id(&target), "dedup: skip, confirmed existing");
            session.note_seen(hash, Some(target.clone()));
            Ok(WriteOutcome {
                action: WriteAction::Skipped,
                id: Some(target),
                llm_calls: 1,
                relations_created: 0,
                conflicts: None,
            })
        }
        DedupAction::Update => {
            let (Some(target), Some(merged)) = (decision.target_id, decision.merged_content)
            else {
                return finish_add(store, Some(judge), cfg, session, input, embedding, hash, 1).await;
            };
            let merged_emb = embedder.embed_one(Some(&session.cache), &merged).await?;
            {
                let id = target.clone();
                let content = merged.clone();
                crate::store_call(store, move |s| s.update_content(&id, &content, &merged_emb))
                    .await??;
            }
            info!(target = %crate::util::short_id(&target), "dedup: updated existing in place");
            session.note_seen(hash, Some(target.clone()));
            Ok(WriteOutcome {
                action: WriteAction::Updated,
                id: Some(target),
                llm_calls: 1,
                relations_created: 0,
                conflicts: None,
            })
        }
        DedupAction::Supersede => {
            let Some(target) = decision.target_id else {
                return finish_add(store, Some(judge), cfg, session, input, embedding, hash, 1).await;
            };
            let entry = {
                let emb = embedding.clone();
                crate::store_call(store, move |s| s.insert(input, Some(&emb))).await??
            };
            {
                let old = target.clone();
                let new = entry.id.clone();
                crate::store_call(store, move |s| s.supersede(&old, &new)).await??;
            }
            info!(
                new = %crate::util::short_id(&entry.id),
                old = %crate::util::short_id(&target),
                "dedup: new entry supersedes old"
            );
            session.note_seen(hash, Some(entry.id.clone()));
            Ok(WriteOutcome {
                action: WriteAction::Superseded,
                id: Some(entry.id),
                llm_calls: 1,
                relations_created: 1,
                conflicts: None,
            })
        }
    }
}

/// Insert as an independent entry, then run the contradiction pass if enabled.
#[allow(clippy::too_many_arguments)]
async fn finish_add(
    store: &SharedStore,
    judge: Option<&Arc<dyn ToolCallClient>>,
    cfg: &DedupConfig,
    session: &mut IngestSession,
    input: EntryInput,
    embedding: Vec<f32>,
    hash: String,
    llm_calls: usize,
) -> Result<WriteOutcome, MnemonError> {
    let entry = {
        let emb = embedding.clone();
        crate::store_call(store, move |s| s.insert(input, Some(&emb))).await??
    };
    session.note_seen(hash, Some(entry.id.clone()));
    debug!(id = %crate::util::short_id(&entry.id), "dedup: added");

    let conflicts = match judge {
        Some(judge) if cfg.detect_contradictions => {
            Some(contradict::detect(store, judge, Some(session), &entry).await)
        }
        _ => None,
    };

    Ok(WriteOutcome {
        action: WriteAction::Added,
        id: Some(entry.id),
        llm_calls,
        relations_created: 0,
        conflicts,
    })
}

/// Store many entries with per-entry commits. An error propagates after the
/// entries before it have already committed.
pub async fn store_batch(
    store: &SharedStore,
    embedder: &BatchEmbedder,
    judge: Option<&Arc<dyn ToolCallClient>>,
    cfg: &DedupConfig,
    session: &mut IngestSession,
    inputs: Vec<EntryInput>,
    force: bool,
) -> Result<WriteStats, MnemonError> {
    let mut stats = WriteStats::default();
    for input in inputs {
        let outcome = store_entry(store, embedder, judge, cfg, session, input, force).await?;
        stats.absorb(&outcome);
    }
    info!(
        added = stats.added,
        updated = stats.updated,
        skipped = stats.skipped,
        superseded = stats.superseded,
        llm_calls = stats.llm_dedup_calls,
        "ingest batch complete"
    );
    Ok(stats)
}

#[derive(Debug, Default, Serialize)]
pub struct BulkReport {
    pub written: usize,
    /// MinHash near-duplicate pairs spotted inside the batch. Flagged for a
    /// later consolidation run, never dropped here.
    pub near_duplicates: usize,
}

/// Bulk ingest with dedup disabled: drop indexes, embed in batches, write one
/// all-or-nothing transaction, rebuild. Runs crash recovery for any earlier
/// interrupted bulk import first.
pub async fn bulk_ingest(
    store: &SharedStore,
    embedder: &BatchEmbedder,
    inputs: Vec<EntryInput>,
) -> Result<BulkReport, MnemonError> {
    crate::store_call(store, |s| s.recover_bulk()).await??;

    // MinHash sweep over the incoming batch: O(n²) over fixed-size
    // signatures, cheap next to the embedding calls.
    let near_duplicates = flag_near_duplicates(&inputs);

    let texts: Vec<String> = inputs.iter().map(|i| i.content.clone()).collect();
    let embeddings = embedder.embed_all(&texts).await?;

    crate::store_call(store, |s| s.begin_bulk()).await??;
    let rows: Vec<(EntryInput, Option<Vec<f32>>)> = inputs
        .into_iter()
        .zip(embeddings.into_iter().map(Some))
        .collect();
    let written = crate::store_call(store, move |s| s.bulk_insert(rows)).await??;
    crate::store_call(store, |s| s.finish_bulk()).await??;

    info!(
        written = written.len(),
        near_duplicates, "bulk ingest complete"
    );
    Ok(BulkReport {
        written: written.len(),
        near_duplicates,
    })
}

/// Count MinHash near-duplicate pairs within a batch. A later consolidation
/// run merges them properly; here they only get surfaced.
fn flag_near_duplicates(inputs: &[EntryInput]) -> usize {
    let hasher = fingerprint::shared();
    let sigs: Vec<Vec<u32>> = inputs.iter().map(|i| hasher.signature(&i.content)).collect();
    let mut pairs = 0usize;
    for i in 0..sigs.len() {
        for j in (i + 1)..sigs.len() {
            let est = fingerprint::minhash_jaccard(&sigs[i], &sigs[j]);
            if est >= crate::thresholds::MINHASH_NEAR_DUP {
                debug!(
                    a = %truncate_chars(&inputs[i].content, 40),
                    b = %truncate_chars(&inputs[j].content, 40),
                    estimate = format!("{est:.2}"),
                    "near-duplicate pair in bulk batch"
                );
                pairs += 1;
            }
        }
    }
    if pairs > 0 {
        warn!(pairs, "bulk batch contains near-duplicates; a consolidation run will merge them");
    }
    pairs
}
