//! SQLite-backed entry storage with FTS5 full-text search.

mod bulk;
mod entries;
mod fts;
mod provenance;
mod vec;

pub use entries::{subject_key, RuleMergePlan, RulesApplied};
pub use provenance::{ConflictLogRow, EntrySource, Relation, RelationKind, Resolution};

use std::path::PathBuf;
use std::sync::RwLock;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::error::MnemonError;

/// Set busy_timeout on every connection handed out by the pool.
/// Prevents SQLITE_BUSY under concurrent write pressure (consolidation + ingest).
#[derive(Debug)]
struct BusyTimeoutCustomizer;
impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for BusyTimeoutCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }
}

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

const MAX_CONTENT_LEN: usize = 8192;
const MAX_SUBJECT_LEN: usize = 256;
const MAX_TAGS: usize = 20;
const MAX_TAG_LEN: usize = 48;

/// Expiry tier: how an entry ages. Core never decays, permanent decays slowly
/// but never expires, temporary decays fast and gets expired by the rules
/// runner once its recency score falls below the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Core,
    Permanent,
    Temporary,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Core => "core",
            Tier::Permanent => "permanent",
            Tier::Temporary => "temporary",
        }
    }
}

impl TryFrom<&str> for Tier {
    type Error = MnemonError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "core" => Ok(Tier::Core),
            "permanent" => Ok(Tier::Permanent),
            "temporary" => Ok(Tier::Temporary),
            other => Err(MnemonError::InvalidTier(other.to_string())),
        }
    }
}

/// Entry lifecycle. Entries are never hard-deleted: they stay Active, get
/// pointed at a successor, or expire. Supersession edges only ever point
/// old→new, so the graph is acyclic by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum EntryStatus {
    Active,
    Superseded { by: String },
    Expired,
}

impl EntryStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, EntryStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Active => "active",
            EntryStatus::Superseded { .. } => "superseded",
            EntryStatus::Expired => "expired",
        }
    }

    fn from_columns(status: &str, superseded_by: Option<String>) -> Self {
        match status {
            "superseded" => EntryStatus::Superseded {
                by: superseded_by.unwrap_or_default(),
            },
            "expired" => EntryStatus::Expired,
            _ => EntryStatus::Active,
        }
    }
}

/// One knowledge row with embedding and lifecycle metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    /// fact | preference | decision | todo | event
    pub kind: String,
    pub subject: String,
    pub content: String,
    /// 1–10
    pub importance: i64,
    pub tier: Tier,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub content_hash: String,
    pub norm_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minhash: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_entity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_attribute: Option<String>,
    /// Normalized `entity/attribute`, the contradiction-candidate key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_predicate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_object: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_confidence: Option<f64>,
    pub confirmations: i64,
    pub recall_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub status: EntryStatus,
    /// How many sources were absorbed into this entry, 0 for originals.
    pub merged_from: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consolidated_at: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EntryInput {
    #[serde(default)]
    pub content: String,
    pub kind: Option<String>,
    pub subject: Option<String>,
    pub importance: Option<i64>,
    pub tier: Option<Tier>,
    pub tags: Option<Vec<String>>,
}

impl EntryInput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn kind(mut self, k: impl Into<String>) -> Self {
        self.kind = Some(k.into());
        self
    }

    pub fn subject(mut self, s: impl Into<String>) -> Self {
        self.subject = Some(s.into());
        self
    }

    pub fn importance(mut self, i: i64) -> Self {
        self.importance = Some(i);
        self
    }

    pub fn tier(mut self, t: Tier) -> Self {
        self.tier = Some(t);
        self
    }

    pub fn tags(mut self, t: Vec<String>) -> Self {
        self.tags = Some(t);
        self
    }
}

pub(crate) fn validate_input(input: &EntryInput) -> Result<(), MnemonError> {
    let content = input.content.trim();
    if content.is_empty() {
        return Err(MnemonError::EmptyContent);
    }
    if content.chars().count() > MAX_CONTENT_LEN {
        return Err(MnemonError::ContentTooLong);
    }
    if let Some(ref subject) = input.subject {
        if subject.chars().count() > MAX_SUBJECT_LEN {
            return Err(MnemonError::Validation("subject too long".into()));
        }
    }
    if let Some(imp) = input.importance {
        if !(1..=10).contains(&imp) {
            return Err(MnemonError::Validation(format!(
                "importance {imp} out of range (1-10)"
            )));
        }
    }
    if let Some(ref tags) = input.tags {
        if tags.len() > MAX_TAGS {
            return Err(MnemonError::Validation(format!(
                "too many tags (max {MAX_TAGS})"
            )));
        }
        if let Some(t) = tags.iter().find(|t| t.chars().count() > MAX_TAG_LEN) {
            return Err(MnemonError::Validation(format!(
                "tag '{t}' too long (max {MAX_TAG_LEN})"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Default, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub active: usize,
    pub superseded: usize,
    pub expired: usize,
    pub with_embedding: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct IntegrityReport {
    pub entries: usize,
    pub fts_rows: usize,
    pub missing_embedding: usize,
    pub ok: bool,
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL DEFAULT 'fact',
    subject TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL,
    importance INTEGER NOT NULL DEFAULT 5,
    tier TEXT NOT NULL DEFAULT 'permanent',
    tags TEXT NOT NULL DEFAULT '[]',
    embedding BLOB,
    content_hash TEXT NOT NULL,
    norm_hash TEXT NOT NULL,
    minhash BLOB,
    subject_entity TEXT,
    subject_attribute TEXT,
    subject_key TEXT,
    claim_predicate TEXT,
    claim_object TEXT,
    claim_confidence REAL,
    confirmations INTEGER NOT NULL DEFAULT 0,
    recall_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    superseded_by TEXT,
    merged_from INTEGER NOT NULL DEFAULT 0,
    consolidated_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_entries_status ON entries(status);
CREATE INDEX IF NOT EXISTS idx_entries_kind ON entries(kind, status);
CREATE INDEX IF NOT EXISTS idx_entries_subject_key ON entries(subject_key);
CREATE INDEX IF NOT EXISTS idx_entries_content_hash ON entries(content_hash);
CREATE INDEX IF NOT EXISTS idx_entries_norm_hash ON entries(norm_hash);

CREATE TABLE IF NOT EXISTS entry_sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entry_id TEXT NOT NULL REFERENCES entries(id),
    source_id TEXT NOT NULL,
    confirmations INTEGER NOT NULL DEFAULT 0,
    recall_count INTEGER NOT NULL DEFAULT 0,
    source_created_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sources_entry ON entry_sources(entry_id);

CREATE TABLE IF NOT EXISTS relations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_relations_from ON relations(from_id);
CREATE INDEX IF NOT EXISTS idx_relations_to ON relations(to_id);

CREATE TABLE IF NOT EXISTS conflict_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entry_a TEXT NOT NULL,
    entry_b TEXT NOT NULL,
    relation TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0,
    resolution TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS mnemon_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS llm_usage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    component TEXT NOT NULL,
    duration_ms INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_llm_usage_component ON llm_usage(component);
"#;

/// SQLite-backed entry store. Single process, single active writer (WAL).
pub struct EntryStore {
    pool: Pool<SqliteConnectionManager>,
    /// On-disk path, None for in-memory stores (no backup possible).
    path: Option<PathBuf>,
    /// In-memory vector index over active embedded entries.
    vec_index: RwLock<vec::VecIndex>,
}

impl EntryStore {
    pub(crate) fn conn(&self) -> Result<PooledConn, MnemonError> {
        self.pool
            .get()
            .map_err(|e| MnemonError::Internal(format!("pool: {e}")))
    }

    /// Open (or create) a store at the given path.
    /// Pool size defaults to 8 (1 writer + 7 readers in WAL mode).
    pub fn open(path: &str) -> Result<Self, MnemonError> {
        let pool_size = if path == ":memory:" { 2 } else { 8 };
        let manager = if path == ":memory:" {
            // Shared cache so all pool connections see the same in-memory DB.
            // Each test gets a unique name to avoid cross-test pollution.
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(BusyTimeoutCustomizer))
            .build(manager)
            .map_err(|e| MnemonError::Internal(format!("pool: {e}")))?;

        let conn = pool
            .get()
            .map_err(|e| MnemonError::Internal(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA auto_vacuum=INCREMENTAL;",
        )?;
        conn.execute_batch(SCHEMA)?;
        fts::init_fts(&conn)?;
        drop(conn);

        let store_path = if path == ":memory:" {
            None
        } else {
            Some(PathBuf::from(path))
        };
        let store = Self {
            pool,
            path: store_path,
            vec_index: RwLock::new(vec::VecIndex::new()),
        };
        store.load_vec_index();
        Ok(store)
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    pub fn get_meta(&self, key: &str) -> Option<String> {
        self.conn().ok().and_then(|c| {
            c.query_row(
                "SELECT value FROM mnemon_meta WHERE key = ?1",
                [key],
                |r| r.get(0),
            )
            .ok()
        })
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), MnemonError> {
        let c = self.conn()?;
        c.execute(
            "INSERT OR REPLACE INTO mnemon_meta (key, value) VALUES (?1, ?2)",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_meta(&self, key: &str) -> Result<(), MnemonError> {
        self.conn()?
            .execute("DELETE FROM mnemon_meta WHERE key = ?1", [key])?;
        Ok(())
    }

    /// One row per LLM call, labeled by component (dedup/claim/conflict/
    /// cluster/merge). Cheap enough to always keep on.
    pub fn log_llm_call(&self, component: &str, duration_ms: u64) -> Result<(), MnemonError> {
        let c = self.conn()?;
        c.execute(
            "INSERT INTO llm_usage (ts, component, duration_ms) VALUES (?1, ?2, ?3)",
            rusqlite::params![now_ms(), component, duration_ms as i64],
        )?;
        Ok(())
    }

    pub fn llm_call_count(&self, component: Option<&str>) -> i64 {
        let Ok(c) = self.conn() else { return 0 };
        match component {
            Some(comp) => c
                .query_row(
                    "SELECT COUNT(*) FROM llm_usage WHERE component = ?1",
                    [comp],
                    |r| r.get(0),
                )
                .unwrap_or(0),
            None => c
                .query_row("SELECT COUNT(*) FROM llm_usage", [], |r| r.get(0))
                .unwrap_or(0),
        }
    }

    pub fn llm_usage_by_component(&self) -> std::collections::HashMap<String, i64> {
        let mut out = std::collections::HashMap::new();
        let Ok(c) = self.conn() else { return out };
        let Ok(mut stmt) =
            c.prepare("SELECT component, COUNT(*) FROM llm_usage GROUP BY component")
        else {
            return out;
        };
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
            .map(|iter| iter.filter_map(|r| r.ok()).collect::<Vec<_>>())
            .unwrap_or_default();
        for (k, v) in rows {
            out.insert(k, v);
        }
        out
    }

    pub fn stats(&self) -> Result<StoreStats, MnemonError> {
        let c = self.conn()?;
        let count = |sql: &str| -> usize {
            c.query_row(sql, [], |r| r.get::<_, i64>(0)).unwrap_or(0) as usize
        };
        Ok(StoreStats {
            total: count("SELECT COUNT(*) FROM entries"),
            active: count("SELECT COUNT(*) FROM entries WHERE status = 'active'"),
            superseded: count("SELECT COUNT(*) FROM entries WHERE status = 'superseded'"),
            expired: count("SELECT COUNT(*) FROM entries WHERE status = 'expired'"),
            with_embedding: count("SELECT COUNT(*) FROM entries WHERE embedding IS NOT NULL"),
        })
    }

    /// Checkpoint the WAL into the main DB file and truncate it.
    /// The rules runner calls this before the pre-mutation backup.
    pub fn wal_checkpoint_truncate(&self) -> Result<(), MnemonError> {
        let c = self.conn()?;
        let (busy, _log, _ckpt): (i64, i64, i64) = c.query_row(
            "PRAGMA wal_checkpoint(TRUNCATE)",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        if busy != 0 {
            return Err(MnemonError::Integrity(
                "WAL checkpoint blocked by a concurrent reader".into(),
            ));
        }
        Ok(())
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<Entry> {
    row_to_entry_impl(row, false)
}

fn row_to_entry_with_embedding(row: &rusqlite::Row) -> rusqlite::Result<Entry> {
    row_to_entry_impl(row, true)
}

fn row_to_entry_impl(row: &rusqlite::Row, include_embedding: bool) -> rusqlite::Result<Entry> {
    let tags_str: String = row.get("tags")?;
    let tier_str: String = row.get("tier")?;
    let status_str: String = row.get("status")?;
    let superseded_by: Option<String> = row.get("superseded_by")?;
    let embedding = if include_embedding {
        let blob: Option<Vec<u8>> = row.get("embedding").ok().flatten();
        blob.map(|b| crate::ai::bytes_to_embedding(&b))
    } else {
        None
    };
    let minhash = {
        let blob: Option<Vec<u8>> = row.get("minhash").ok().flatten();
        blob.map(|b| crate::fingerprint::bytes_to_signature(&b))
    };
    Ok(Entry {
        id: row.get("id")?,
        kind: row.get("kind")?,
        subject: row.get("subject")?,
        content: row.get("content")?,
        importance: row.get("importance")?,
        tier: Tier::try_from(tier_str.as_str()).unwrap_or(Tier::Permanent),
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
        embedding,
        content_hash: row.get("content_hash")?,
        norm_hash: row.get("norm_hash")?,
        minhash,
        subject_entity: row.get("subject_entity")?,
        subject_attribute: row.get("subject_attribute")?,
        subject_key: row.get("subject_key")?,
        claim_predicate: row.get("claim_predicate")?,
        claim_object: row.get("claim_object")?,
        claim_confidence: row.get("claim_confidence")?,
        confirmations: row.get("confirmations")?,
        recall_count: row.get("recall_count")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        status: EntryStatus::from_columns(&status_str, superseded_by),
        merged_from: row.get("merged_from")?,
        consolidated_at: row.get("consolidated_at")?,
    })
}
