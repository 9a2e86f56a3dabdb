//! Graph clustering of merge candidates: kNN pair harvesting, union rules,
//! diameter validation with low-support eviction.

use std::collections::HashSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::ai::{cosine_similarity, ToolCallClient};
use crate::db::Entry;
use crate::error::MnemonError;
use crate::fingerprint::normalize;
use crate::scoring::support;
use crate::thresholds;
use crate::unionfind::UnionFind;
use crate::util::truncate_chars;
use crate::{prompts, SharedStore};

#[derive(Debug, Clone)]
pub struct ClusterParams {
    /// Restrict the pool to one kind (phase 1).
    pub kind: Option<String>,
    /// Restrict the pool to specific ids (phase 3 re-clustering).
    pub restrict_ids: Option<HashSet<String>>,
    /// Same-kind union threshold.
    pub sim_threshold: f64,
    /// Same normalized subject but different kind needs this stricter bar.
    pub cross_kind_threshold: f64,
    /// Bottom of the loose band where a same-knowledge check can still union.
    pub loose_floor: f64,
    pub min_cluster: usize,
    pub max_cluster: usize,
    /// Neighbor fan-out per candidate.
    pub knn: usize,
    /// Entries consolidated within this many days stay out of the pool.
    pub idempotency_days: i64,
}

impl ClusterParams {
    pub fn tight(kind: Option<String>) -> Self {
        Self::with_threshold(kind, thresholds::TIGHT_CLUSTER_SIM)
    }

    /// Phase 2: cross-kind pool, higher bar.
    pub fn cross_kind() -> Self {
        Self::with_threshold(None, thresholds::CROSS_KIND_CLUSTER_SIM)
    }

    fn with_threshold(kind: Option<String>, sim: f64) -> Self {
        Self {
            kind,
            restrict_ids: None,
            sim_threshold: sim,
            cross_kind_threshold: (sim + thresholds::CROSS_KIND_MARGIN).min(0.97),
            loose_floor: sim - thresholds::LOOSE_BAND_MARGIN,
            min_cluster: thresholds::MIN_CLUSTER_SIZE,
            max_cluster: thresholds::MAX_CLUSTER_SIZE,
            knn: thresholds::CLUSTER_KNN,
            idempotency_days: thresholds::IDEMPOTENCY_DAYS,
        }
    }

    pub fn diameter_floor(&self) -> f64 {
        self.sim_threshold - thresholds::DIAMETER_MARGIN
    }
}

/// A validated set of merge candidates. In-memory only, never persisted.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub members: Vec<(Entry, Vec<f32>)>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Stable fingerprint over the sorted member ids; the checkpoint's unit
    /// of "already processed".
    pub fn fingerprint(&self) -> String {
        let mut ids: Vec<&str> = self.members.iter().map(|(e, _)| e.id.as_str()).collect();
        ids.sort_unstable();
        let mut hasher = Sha256::new();
        for id in ids {
            hasher.update(id.as_bytes());
            hasher.update(b"+");
        }
        format!("{:x}", hasher.finalize())[..16].to_string()
    }
}

pub struct ClusterBuild {
    pub clusters: Vec<Cluster>,
    pub pool_size: usize,
    pub llm_calls: usize,
}

/// Build validated clusters over the active embedded pool.
pub async fn build_clusters(
    store: &SharedStore,
    judge: Option<&Arc<dyn ToolCallClient>>,
    params: &ClusterParams,
) -> Result<ClusterBuild, MnemonError> {
    let cutoff = crate::db::now_ms() - params.idempotency_days * 86_400_000;
    let pool = {
        let kind = params.kind.clone();
        crate::store_call(store, move |s| s.active_embedded(kind.as_deref(), cutoff)).await??
    };
    let pool: Vec<(Entry, Vec<f32>)> = match &params.restrict_ids {
        Some(ids) => pool
            .into_iter()
            .filter(|(e, _)| ids.contains(&e.id))
            .collect(),
        None => pool,
    };

    if pool.len() > thresholds::CLUSTER_POOL_WARN {
        warn!(
            pool = pool.len(),
            "candidate pool is very large; clustering will be slow"
        );
    }
    if pool.len() < params.min_cluster {
        return Ok(ClusterBuild {
            clusters: vec![],
            pool_size: pool.len(),
            llm_calls: 0,
        });
    }

    // kNN pair harvesting: top-k neighbors per candidate, deduped to i<j.
    let n = pool.len();
    let mut pairs: HashSet<(usize, usize)> = HashSet::new();
    for i in 0..n {
        let mut sims: Vec<(usize, f64)> = (0..n)
            .filter(|&j| j != i)
            .map(|j| (j, cosine_similarity(&pool[i].1, &pool[j].1)))
            .collect();
        sims.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        for (j, sim) in sims.into_iter().take(params.knn) {
            if sim >= params.loose_floor {
                pairs.insert((i.min(j), i.max(j)));
            }
        }
    }

    // Union rules. The loose band consults the same-knowledge judge unless
    // the normalized subjects already agree.
    let mut uf = UnionFind::new(n);
    let mut llm_calls = 0usize;
    for &(i, j) in &pairs {
        if uf.same(i, j) {
            continue;
        }
        let (a, b) = (&pool[i].0, &pool[j].0);
        let sim = cosine_similarity(&pool[i].1, &pool[j].1);
        let subjects_match =
            !a.subject.is_empty() && normalize(&a.subject) == normalize(&b.subject);

        let should_union = if a.kind == b.kind && sim >= params.sim_threshold {
            true
        } else if subjects_match && sim >= params.cross_kind_threshold {
            true
        } else if sim >= params.loose_floor && sim < params.sim_threshold {
            if subjects_match {
                true
            } else if let Some(judge) = judge {
                llm_calls += 1;
                same_knowledge(store, judge, a, b).await
            } else {
                false
            }
        } else {
            false
        };

        if should_union {
            uf.union(i, j);
        }
    }

    // Partition, drop undersized groups, validate the rest.
    let mut clusters = Vec::new();
    for group in uf.groups() {
        if group.len() < params.min_cluster {
            continue;
        }
        let members: Vec<(Entry, Vec<f32>)> =
            group.into_iter().map(|i| pool[i].clone()).collect();
        if let Some(cluster) = validate_cluster(members, params) {
            clusters.push(cluster);
        }
    }

    // Largest first, like merge priority.
    clusters.sort_by(|a, b| b.len().cmp(&a.len()));
    debug!(
        pool = n,
        clusters = clusters.len(),
        llm_calls,
        "cluster build complete"
    );

    Ok(ClusterBuild {
        clusters,
        pool_size: n,
        llm_calls,
    })
}

async fn same_knowledge(
    store: &SharedStore,
    judge: &Arc<dyn ToolCallClient>,
    a: &Entry,
    b: &Entry,
) -> bool {
    let user = format!(
        "A (kind={}, subject={}):\n{}\n\nB (kind={}, subject={}):\n{}",
        a.kind,
        a.subject,
        truncate_chars(&a.content, 300),
        b.kind,
        b.subject,
        truncate_chars(&b.content, 300),
    );
    let start = std::time::Instant::now();
    let raw = judge
        .tool_call(
            "cluster",
            prompts::SAME_KNOWLEDGE_SYSTEM,
            &user,
            "same_knowledge",
            "Decide whether the two entries encode the same knowledge",
            prompts::same_knowledge_schema(),
        )
        .await;
    let duration = start.elapsed().as_millis() as u64;
    {
        let store = store.clone();
        tokio::task::spawn_blocking(move || store.log_llm_call("cluster", duration))
            .await
            .ok();
    }
    match raw {
        Ok(v) => {
            let repaired = crate::repair::same_knowledge(&v);
            for w in &repaired.warnings {
                debug!(warning = %w, "same-knowledge verdict repaired");
            }
            repaired.value
        }
        Err(e) => {
            warn!(error = %e, "same-knowledge check failed, not unioning");
            false
        }
    }
}

/// Enforce the size cap and the pairwise-similarity diameter floor.
///
/// Oversized groups first keep only the highest-average-similarity members.
/// Then, while the worst pair sits below the floor, the lower-support member
/// of that pair is evicted — bounded by the group size. Groups that shrink
/// below `min_cluster` are dropped.
pub fn validate_cluster(
    mut members: Vec<(Entry, Vec<f32>)>,
    params: &ClusterParams,
) -> Option<Cluster> {
    let floor = params.diameter_floor();

    if members.len() > params.max_cluster {
        let avg: Vec<f64> = members
            .iter()
            .map(|(_, emb)| {
                let sum: f64 = members
                    .iter()
                    .map(|(_, other)| cosine_similarity(emb, other))
                    .sum();
                (sum - 1.0) / (members.len() - 1) as f64
            })
            .collect();
        let mut order: Vec<usize> = (0..members.len()).collect();
        order.sort_by(|&a, &b| avg[b].partial_cmp(&avg[a]).unwrap_or(std::cmp::Ordering::Equal));
        order.truncate(params.max_cluster);
        order.sort_unstable();
        members = order.into_iter().map(|i| members[i].clone()).collect();
    }

    let max_rounds = members.len();
    for _ in 0..max_rounds {
        if members.len() < params.min_cluster {
            return None;
        }
        let mut worst = (0usize, 0usize, f64::MAX);
        for i in 0..members.len() {
            for j in (i + 1)..members.len() {
                let sim = cosine_similarity(&members[i].1, &members[j].1);
                if sim < worst.2 {
                    worst = (i, j, sim);
                }
            }
        }
        if worst.2 >= floor {
            break;
        }
        // Evict the weaker half of the worst pair.
        let (i, j, sim) = worst;
        let evict = if support(&members[i].0) <= support(&members[j].0) {
            i
        } else {
            j
        };
        debug!(
            id = %crate::util::short_id(&members[evict].0.id),
            worst_sim = format!("{:.3}", sim),
            "evicting low-support member below diameter floor"
        );
        members.remove(evict);
    }

    if members.len() < params.min_cluster {
        return None;
    }
    Some(Cluster { members })
}
