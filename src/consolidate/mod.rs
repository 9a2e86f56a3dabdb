//! Consolidation orchestrator: rules pass, then clustering phases with batch
//! limits and resumable checkpoints.
//!
//! Phase 1 clusters tightly within each kind, phase 2 casts a cross-kind net
//! at a higher threshold, phase 3 re-clusters the canonical entries the run
//! itself created. A batch cap can stop the run mid-phase; the checkpoint
//! records processed cluster fingerprints so resume never re-merges.

pub mod checkpoint;
pub mod cluster;
pub mod merge;
pub mod review;
pub mod rules;

pub use checkpoint::Checkpoint;
pub use cluster::{build_clusters, validate_cluster, Cluster, ClusterBuild, ClusterParams};
pub use merge::{merge_cluster, MergeOutcome, DRY_RUN_ID};
pub use review::{ReviewItem, ReviewQueue};
pub use rules::{run_rules, ConsolidationStats, RulesOptions};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ai::ToolCallClient;
use crate::db::now_ms;
use crate::embed::BatchEmbedder;
use crate::error::MnemonError;
use crate::SharedStore;

#[derive(Debug, Clone)]
pub struct ConsolidateOptions {
    /// Restrict phase 1 to one kind; also disables phase 2.
    pub kind: Option<String>,
    /// Max clusters processed this invocation; hitting it checkpoints and
    /// stops.
    pub batch_limit: Option<usize>,
    pub dry_run: bool,
    /// Run the rules pass before clustering (skipped automatically on
    /// checkpoint resume).
    pub run_rules_first: bool,
    pub checkpoint_path: PathBuf,
    pub review_path: PathBuf,
}

impl ConsolidateOptions {
    /// Conventional file layout under a state directory.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let dir = state_dir.into();
        Self {
            kind: None,
            batch_limit: None,
            dry_run: false,
            run_rules_first: true,
            checkpoint_path: dir.join("consolidate-checkpoint.json"),
            review_path: dir.join("merge-review.jsonl"),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct PhaseReport {
    pub phase: u8,
    pub clusters_found: usize,
    pub clusters_processed: usize,
    pub merged: usize,
    pub flagged: usize,
    pub llm_calls: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct ConsolidateReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<ConsolidationStats>,
    pub phases: Vec<PhaseReport>,
    /// Canonical entries created by merges this run.
    pub canonical_ids: Vec<String>,
    /// True when the batch cap stopped the run early (checkpoint written).
    pub partial: bool,
}

/// Run a full consolidation: rules pass, then the clustering phases.
pub async fn consolidate(
    store: &SharedStore,
    embedder: &BatchEmbedder,
    judge: Option<&Arc<dyn ToolCallClient>>,
    opts: &ConsolidateOptions,
) -> Result<ConsolidateReport, MnemonError> {
    let mut report = ConsolidateReport::default();

    let resumed = Checkpoint::load(&opts.checkpoint_path)?;
    let resuming = resumed.is_some();
    let mut ckpt = resumed.unwrap_or_else(|| Checkpoint::new(now_ms()));
    if resuming {
        info!(
            processed = ckpt.processed_count(),
            started_at = ckpt.started_at,
            "resuming from checkpoint"
        );
    }

    if opts.run_rules_first && !resuming {
        let rules_opts = RulesOptions {
            dry_run: opts.dry_run,
            ..Default::default()
        };
        let stats =
            crate::store_call(store, move |s| run_rules(s, &rules_opts)).await??;
        report.rules = Some(stats);
    }

    let Some(judge) = judge else {
        warn!("no judge configured, skipping clustering phases");
        return Ok(report);
    };
    let review = ReviewQueue::new(&opts.review_path);

    let mut budget_left = opts.batch_limit;
    let mut canonical: Vec<String> = Vec::new();

    // Phase 1: per-kind tight clustering.
    let kinds: Vec<String> = match &opts.kind {
        Some(k) => vec![k.clone()],
        None => crate::store_call(store, |s| s.active_kinds()).await?,
    };
    let mut phase1 = PhaseReport {
        phase: 1,
        ..Default::default()
    };
    ckpt.phase = 1;
    for (kind_index, kind) in kinds.iter().enumerate() {
        ckpt.kind_index = kind_index;
        let params = ClusterParams::tight(Some(kind.clone()));
        run_scope(
            store, embedder, judge, &review, opts, &mut ckpt, &mut budget_left,
            &params, Some(kind.as_str()), &mut phase1, &mut canonical,
        )
        .await?;
        if report_partial(&budget_left) {
            break;
        }
    }
    report.phases.push(phase1);

    // Phase 2: cross-kind pool at a higher threshold, only without a kind
    // filter.
    if opts.kind.is_none() && !report_partial(&budget_left) {
        let mut phase2 = PhaseReport {
            phase: 2,
            ..Default::default()
        };
        ckpt.phase = 2;
        ckpt.kind_index = 0;
        let params = ClusterParams::cross_kind();
        run_scope(
            store, embedder, judge, &review, opts, &mut ckpt, &mut budget_left,
            &params, None, &mut phase2, &mut canonical,
        )
        .await?;
        report.phases.push(phase2);
    }

    // Phase 3: post-merge cleanup over this run's canonical entries, with
    // idempotency disabled. Skipped when nothing new exists or the cap hit.
    if !canonical.is_empty() && !report_partial(&budget_left) {
        let mut phase3 = PhaseReport {
            phase: 3,
            ..Default::default()
        };
        ckpt.phase = 3;
        ckpt.kind_index = 0;
        let mut params = ClusterParams::tight(None);
        params.idempotency_days = 0;
        params.restrict_ids = Some(canonical.iter().cloned().collect::<HashSet<_>>());
        run_scope(
            store, embedder, judge, &review, opts, &mut ckpt, &mut budget_left,
            &params, None, &mut phase3, &mut canonical,
        )
        .await?;
        report.phases.push(phase3);
    }

    report.partial = report_partial(&budget_left);
    report.canonical_ids = canonical;

    if report.partial {
        if !opts.dry_run {
            ckpt.save(&opts.checkpoint_path)?;
            info!(
                processed = ckpt.processed_count(),
                path = %opts.checkpoint_path.display(),
                "batch cap hit, checkpoint written"
            );
        }
    } else if !opts.dry_run {
        // Clean completion: drop the checkpoint, rebuild the vector index,
        // checkpoint the WAL. Exactly once, never on capped runs.
        Checkpoint::delete(&opts.checkpoint_path)?;
        crate::store_call(store, |s| s.rebuild_vec_index()).await?;
        if let Err(e) = crate::store_call(store, |s| s.wal_checkpoint_truncate()).await? {
            warn!(error = %e, "final WAL checkpoint failed");
        }
    }

    info!(
        phases = report.phases.len(),
        canonical = report.canonical_ids.len(),
        partial = report.partial,
        "consolidation run complete"
    );
    Ok(report)
}

/// Budget exhausted means the run is partial. `Some(0)` is the exhausted
/// state; `None` means uncapped.
fn report_partial(budget_left: &Option<usize>) -> bool {
    matches!(budget_left, Some(0))
}

/// Cluster one scope (a phase × kind slice) and merge its clusters until the
/// budget runs out.
#[allow(clippy::too_many_arguments)]
async fn run_scope(
    store: &SharedStore,
    embedder: &BatchEmbedder,
    judge: &Arc<dyn ToolCallClient>,
    review: &ReviewQueue,
    opts: &ConsolidateOptions,
    ckpt: &mut Checkpoint,
    budget_left: &mut Option<usize>,
    params: &ClusterParams,
    kind: Option<&str>,
    phase: &mut PhaseReport,
    canonical: &mut Vec<String>,
) -> Result<(), MnemonError> {
    let scope = Checkpoint::scope(phase.phase, kind);
    let build = build_clusters(store, Some(judge), params).await?;
    phase.clusters_found += build.clusters.len();
    phase.llm_calls += build.llm_calls;
    debug!(
        scope = %scope,
        pool = build.pool_size,
        clusters = build.clusters.len(),
        "scope clustered"
    );

    for (cluster_index, cluster) in build.clusters.iter().enumerate() {
        let fp = cluster.fingerprint();
        if ckpt.is_processed(&scope, &fp) {
            debug!(scope = %scope, fingerprint = %fp, "cluster already processed, skipping");
            continue;
        }
        if matches!(*budget_left, Some(0)) {
            return Ok(());
        }
        ckpt.cluster_index = cluster_index;

        let (outcome, llm_calls) =
            merge_cluster(store, embedder, judge, review, cluster, opts.dry_run).await?;
        phase.clusters_processed += 1;
        phase.llm_calls += llm_calls;
        match outcome {
            MergeOutcome::Merged { id, .. } => {
                phase.merged += 1;
                canonical.push(id);
            }
            MergeOutcome::Flagged { .. } => phase.flagged += 1,
            MergeOutcome::DryRun { .. } => phase.merged += 1,
        }
        ckpt.mark(&scope, fp);
        if let Some(left) = budget_left {
            *left = left.saturating_sub(1);
        }
    }
    Ok(())
}
