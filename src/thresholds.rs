//! Similarity thresholds and batch limits for the consolidation pipeline.
//!
//! Higher = stricter (only very similar entries match).
//! The hierarchy: loose cluster band < tight clustering < online dedup <
//! near-exact rule merge.

/// Online dedup: best-neighbor cosine below this means a plain ADD, no LLM.
pub const DEDUP_SIM: f64 = 0.85;

/// Online dedup: how many nearest active neighbors to fetch per entry.
pub const DEDUP_NEIGHBOR_K: usize = 20;

/// Rules runner: near-exact duplicate merge, same kind + normalized subject.
pub const NEAR_EXACT_SIM: f64 = 0.95;

/// Phase 1 clustering: same-kind pairs union at this cosine.
pub const TIGHT_CLUSTER_SIM: f64 = 0.82;

/// Phase 2 clustering: cross-kind pools need a higher bar.
pub const CROSS_KIND_CLUSTER_SIM: f64 = 0.88;

/// Same normalized subject but different kind: union threshold plus this.
pub const CROSS_KIND_MARGIN: f64 = 0.04;

/// Loose band: pairs this far below the union threshold may still union
/// if the same-knowledge judge (or a subject match) confirms equivalence.
pub const LOOSE_BAND_MARGIN: f64 = 0.07;

/// Cluster diameter floor sits this far below the union threshold.
pub const DIAMETER_MARGIN: f64 = 0.02;

pub const MIN_CLUSTER_SIZE: usize = 2;
pub const MAX_CLUSTER_SIZE: usize = 8;

/// Neighbor fan-out per candidate during cluster building.
pub const CLUSTER_KNN: usize = 10;

/// Candidate pools past this size log a performance warning and proceed.
pub const CLUSTER_POOL_WARN: usize = 20_000;

/// MinHash Jaccard estimate at or above this flags a near-duplicate.
pub const MINHASH_NEAR_DUP: f64 = 0.65;

/// Merge fidelity: every source must be at least this close to the merged text.
pub const MERGE_SOURCE_FIDELITY: f64 = 0.65;

/// Merge fidelity: the merged text must be at least this close to the centroid.
pub const MERGE_CENTROID_FIDELITY: f64 = 0.75;

/// Temporary-tier entries expire when their recency score drops below this.
pub const EXPIRE_BELOW: f64 = 0.05;

/// Entries consolidated within this many days are left out of new pools.
pub const IDEMPOTENCY_DAYS: i64 = 7;

/// Pre-consolidation backups kept on disk.
pub const BACKUP_KEEP: usize = 3;

/// Character budget for the merge synthesis prompt.
pub const PROMPT_CHAR_BUDGET: usize = 8_000;

/// Embedding batching: texts per request, concurrent requests, retry attempts.
pub const EMBED_BATCH: usize = 64;
pub const EMBED_MAX_IN_FLIGHT: usize = 3;
pub const EMBED_MAX_ATTEMPTS: u32 = 5;
