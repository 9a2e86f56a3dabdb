//! Rule-based consolidation pass: backup, expire decayed entries, merge
//! near-exact duplicates, clean orphaned relations. One transaction, no LLM.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ai::cosine_similarity;
use crate::db::{now_ms, Entry, EntryStore, RuleMergePlan};
use crate::error::MnemonError;
use crate::fingerprint::normalize;
use crate::scoring::{is_expired, support};
use crate::thresholds::{BACKUP_KEEP, NEAR_EXACT_SIM};
use crate::unionfind::UnionFind;

use super::merge::merge_tags;

#[derive(Debug, Clone)]
pub struct RulesOptions {
    pub dry_run: bool,
    pub near_exact_threshold: f64,
    pub backup_keep: usize,
}

impl Default for RulesOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            near_exact_threshold: NEAR_EXACT_SIM,
            backup_keep: BACKUP_KEEP,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ConsolidationStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
    pub entries_before: usize,
    pub expired: usize,
    pub merged: usize,
    pub relations_pruned: usize,
    pub entries_after: usize,
    pub dry_run: bool,
    /// entries_after == entries_before − expired − merged
    pub invariant_ok: bool,
}

/// One rules pass over the live store. Synchronous — callers in async context
/// go through `store_call`.
pub fn run_rules(store: &EntryStore, opts: &RulesOptions) -> Result<ConsolidationStats, MnemonError> {
    let mut stats = ConsolidationStats {
        dry_run: opts.dry_run,
        ..Default::default()
    };
    stats.entries_before = store.active_count();
    let now = now_ms();

    // Backup before any mutation. A failed WAL checkpoint means the backup
    // would be incomplete — fatal unless this is a dry run.
    match backup(store, opts.backup_keep) {
        Ok(path) => stats.backup_path = path.map(|p| p.display().to_string()),
        Err(e) if opts.dry_run => warn!(error = %e, "backup failed (dry run, continuing)"),
        Err(e) => return Err(e),
    }

    // Expire: temporary-tier entries whose recency score fell below the
    // floor. Core and permanent never expire.
    let active = store.list_active(1_000_000)?;
    let expire_ids: Vec<String> = active
        .iter()
        .filter(|e| is_expired(e, now))
        .map(|e| e.id.clone())
        .collect();

    // Near-exact duplicate merge: same kind + normalized subject, cosine at
    // or above the threshold. Keeper = highest support, ties to the newer.
    let embedded = store.active_embedded(None, now)?;
    let expire_set: std::collections::HashSet<&str> =
        expire_ids.iter().map(|s| s.as_str()).collect();
    let embedded: Vec<&(Entry, Vec<f32>)> = embedded
        .iter()
        .filter(|(e, _)| !expire_set.contains(e.id.as_str()))
        .collect();

    let mut buckets: HashMap<(String, String), Vec<usize>> = HashMap::new();
    for (i, (e, _)) in embedded.iter().enumerate() {
        buckets
            .entry((e.kind.clone(), normalize(&e.subject)))
            .or_default()
            .push(i);
    }

    let mut plans: Vec<RuleMergePlan> = Vec::new();
    for indices in buckets.values() {
        if indices.len() < 2 {
            continue;
        }
        let mut uf = UnionFind::new(indices.len());
        for a in 0..indices.len() {
            for b in (a + 1)..indices.len() {
                let sim = cosine_similarity(
                    &embedded[indices[a]].1,
                    &embedded[indices[b]].1,
                );
                if sim >= opts.near_exact_threshold {
                    uf.union(a, b);
                }
            }
        }
        for group in uf.groups() {
            if group.len() < 2 {
                continue;
            }
            let mut members: Vec<&Entry> =
                group.iter().map(|&i| &embedded[indices[i]].0).collect();
            members.sort_by(|a, b| {
                support(b)
                    .cmp(&support(a))
                    .then_with(|| b.created_at.cmp(&a.created_at))
            });
            let keeper = members[0];
            let absorbed: Vec<Entry> = members[1..].iter().map(|e| (*e).clone()).collect();
            let tag_slices: Vec<&[String]> =
                absorbed.iter().map(|e| e.tags.as_slice()).collect();
            debug!(
                keeper = %crate::util::short_id(&keeper.id),
                absorbed = absorbed.len(),
                "near-exact duplicate group"
            );
            plans.push(RuleMergePlan {
                keeper_id: keeper.id.clone(),
                keeper_tags: merge_tags(&keeper.tags, &tag_slices, 20),
                confirmations_add: absorbed.iter().map(|e| e.confirmations).sum(),
                recall_add: absorbed.iter().map(|e| e.recall_count).sum(),
                absorbed,
            });
        }
    }

    if opts.dry_run {
        stats.expired = expire_ids.len();
        stats.merged = plans.iter().map(|p| p.absorbed.len()).sum();
        stats.relations_pruned = store.count_orphan_relations();
        stats.entries_after = stats.entries_before;
        stats.invariant_ok = true;
        info!(
            expired = stats.expired,
            merged = stats.merged,
            "rules dry run — no writes"
        );
        return Ok(stats);
    }

    let applied = store.apply_rules(&expire_ids, &plans)?;
    stats.expired = applied.expired;
    stats.merged = applied.merged;
    stats.relations_pruned = applied.relations_pruned;

    // Vector index rebuild is best-effort; the store self-heals on reopen.
    store.rebuild_vec_index();

    stats.entries_after = store.active_count();
    stats.invariant_ok =
        stats.entries_after == stats.entries_before - stats.expired - stats.merged;
    if !stats.invariant_ok {
        warn!(
            before = stats.entries_before,
            after = stats.entries_after,
            expired = stats.expired,
            merged = stats.merged,
            "consolidation invariant violated"
        );
    }

    info!(
        expired = stats.expired,
        merged = stats.merged,
        relations_pruned = stats.relations_pruned,
        "rules pass complete"
    );
    Ok(stats)
}

/// WAL-checkpoint then copy the DB file aside. Returns None for in-memory
/// stores, which have nothing to copy.
fn backup(store: &EntryStore, keep: usize) -> Result<Option<PathBuf>, MnemonError> {
    let Some(db_path) = store.path() else {
        debug!("in-memory store, skipping backup");
        return Ok(None);
    };
    store.wal_checkpoint_truncate()?;

    let backup_path = db_path.with_extension(format!("backup.{}", now_ms()));
    std::fs::copy(db_path, &backup_path)?;
    info!(path = %backup_path.display(), "pre-consolidation backup written");

    prune_backups(db_path, keep)?;
    Ok(Some(backup_path))
}

/// Keep only the `keep` most recent backups beside the DB file.
fn prune_backups(db_path: &std::path::Path, keep: usize) -> Result<(), MnemonError> {
    let Some(dir) = db_path.parent() else {
        return Ok(());
    };
    let stem = db_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let prefix = format!("{stem}.backup.");

    let mut backups: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix))
        })
        .collect();
    // Timestamped suffixes sort chronologically.
    backups.sort();
    while backups.len() > keep {
        let oldest = backups.remove(0);
        if let Err(e) = std::fs::remove_file(&oldest) {
            warn!(path = %oldest.display(), error = %e, "backup prune failed");
        } else {
            debug!(path = %oldest.display(), "pruned old backup");
        }
    }
    Ok(())
}
