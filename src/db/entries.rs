//! Entry CRUD, supersession, and the transactional write paths used by the
//! merge engine and the rules runner.

use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::fingerprint;

use super::*;

/// Column list excluding the embedding blob. Used in "meta" queries to avoid
/// deserializing large vectors when only scalar fields are needed.
const META_COLS: &str = "id, kind, subject, content, importance, tier, tags, \
    content_hash, norm_hash, minhash, subject_entity, subject_attribute, subject_key, \
    claim_predicate, claim_object, claim_confidence, confirmations, recall_count, \
    created_at, updated_at, status, superseded_by, merged_from, consolidated_at";

/// A planned rule-based merge: the keeper absorbs the losers. Computed by the
/// rules runner, applied here in one transaction.
pub struct RuleMergePlan {
    pub keeper_id: String,
    pub keeper_tags: Vec<String>,
    pub absorbed: Vec<Entry>,
    pub confirmations_add: i64,
    pub recall_add: i64,
}

/// Counts out of a single rules transaction.
#[derive(Debug, Default)]
pub struct RulesApplied {
    pub expired: usize,
    pub merged: usize,
    pub relations_pruned: usize,
}

impl EntryStore {
    /// Insert a fresh entry. Fingerprints are computed here; the embedding is
    /// whatever the caller already obtained (online dedup embeds lazily).
    /// Commits immediately — the online path's per-entry commit discipline.
    pub fn insert(
        &self,
        input: EntryInput,
        embedding: Option<&[f32]>,
    ) -> Result<Entry, MnemonError> {
        validate_input(&input)?;

        let now = now_ms();
        let entry = Entry {
            id: Uuid::new_v4().to_string(),
            kind: input.kind.unwrap_or_else(|| "fact".into()),
            subject: input.subject.unwrap_or_default(),
            content: input.content.clone(),
            importance: input.importance.unwrap_or(5).clamp(1, 10),
            tier: input.tier.unwrap_or(Tier::Permanent),
            tags: input.tags.unwrap_or_default(),
            embedding: embedding.map(|e| e.to_vec()),
            content_hash: fingerprint::content_hash(&input.content),
            norm_hash: fingerprint::norm_hash(&input.content),
            minhash: Some(fingerprint::shared().signature(&input.content)),
            subject_entity: None,
            subject_attribute: None,
            subject_key: None,
            claim_predicate: None,
            claim_object: None,
            claim_confidence: None,
            confirmations: 0,
            recall_count: 0,
            created_at: now,
            updated_at: now,
            status: EntryStatus::Active,
            merged_from: 0,
            consolidated_at: None,
        };

        insert_entry_row(&*self.conn()?, &entry)?;
        if let Some(emb) = &entry.embedding {
            self.vec_index_put(&entry.id, emb.clone());
        }
        Ok(entry)
    }

    /// Raw import of fully-formed entries (timestamps, status, counters kept
    /// as given). Migration/test hook — no validation, no dedup.
    pub fn import(&self, entries: &[Entry]) -> Result<usize, MnemonError> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN")?;
        let result = (|| -> Result<(), MnemonError> {
            for e in entries {
                insert_entry_row(&conn, e)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        }
        for e in entries {
            if let (true, Some(emb)) = (e.status.is_active(), &e.embedding) {
                self.vec_index_put(&e.id, emb.clone());
            }
        }
        Ok(entries.len())
    }

    pub fn get(&self, id: &str) -> Result<Option<Entry>, MnemonError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM entries WHERE id = ?1")?;
        let mut rows = stmt.query_map([id], row_to_entry_with_embedding)?;
        Ok(rows.next().transpose()?)
    }

    pub fn get_active(&self, id: &str) -> Result<Option<Entry>, MnemonError> {
        Ok(self.get(id)?.filter(|e| e.status.is_active()))
    }

    pub fn active_count(&self) -> usize {
        self.conn()
            .ok()
            .and_then(|c| {
                c.query_row(
                    "SELECT COUNT(*) FROM entries WHERE status = 'active'",
                    [],
                    |r| r.get::<_, i64>(0),
                )
                .ok()
            })
            .unwrap_or(0) as usize
    }

    /// Active entries without embeddings loaded, oldest first.
    pub fn list_active(&self, limit: usize) -> Result<Vec<Entry>, MnemonError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {META_COLS} FROM entries WHERE status = 'active' \
             ORDER BY created_at LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map([limit as i64], row_to_entry)?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        Ok(rows)
    }

    /// Distinct kinds among active entries, sorted. Phase 1 iterates these.
    pub fn active_kinds(&self) -> Vec<String> {
        let Ok(conn) = self.conn() else { return vec![] };
        let Ok(mut stmt) = conn.prepare(
            "SELECT DISTINCT kind FROM entries WHERE status = 'active' ORDER BY kind",
        ) else {
            return vec![];
        };
        stmt.query_map([], |r| r.get::<_, String>(0))
            .map(|iter| iter.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    /// The clustering pool: active embedded entries, optionally kind-filtered,
    /// excluding anything consolidated after `consolidated_cutoff` (pass
    /// `now_ms()` to disable idempotency skipping).
    pub fn active_embedded(
        &self,
        kind: Option<&str>,
        consolidated_cutoff: i64,
    ) -> Result<Vec<(Entry, Vec<f32>)>, MnemonError> {
        let conn = self.conn()?;
        let base = "SELECT * FROM entries WHERE status = 'active' \
             AND embedding IS NOT NULL \
             AND (consolidated_at IS NULL OR consolidated_at <= ?1)";
        let collect = |stmt: &mut rusqlite::Statement,
                       params: &[&dyn rusqlite::ToSql]|
         -> Result<Vec<Entry>, MnemonError> {
            Ok(stmt
                .query_map(params, row_to_entry_with_embedding)?
                .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
                .collect())
        };
        let entries = match kind {
            Some(k) => {
                let mut stmt = conn.prepare(&format!("{base} AND kind = ?2"))?;
                collect(&mut stmt, &[&consolidated_cutoff, &k])?
            }
            None => {
                let mut stmt = conn.prepare(base)?;
                collect(&mut stmt, &[&consolidated_cutoff])?
            }
        };
        Ok(entries
            .into_iter()
            .filter_map(|e| {
                let emb = e.embedding.clone()?;
                Some((e, emb))
            })
            .collect())
    }

    /// Active entry id with this exact ingest-content hash, if any.
    pub fn find_active_by_hash(&self, content_hash: &str) -> Option<String> {
        self.conn().ok().and_then(|c| {
            c.query_row(
                "SELECT id FROM entries WHERE content_hash = ?1 AND status = 'active' LIMIT 1",
                [content_hash],
                |r| r.get(0),
            )
            .ok()
        })
    }

    /// Active entries sharing a subject key, excluding one id.
    pub fn find_by_subject_key(
        &self,
        key: &str,
        exclude: &str,
    ) -> Result<Vec<Entry>, MnemonError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {META_COLS} FROM entries \
             WHERE subject_key = ?1 AND status = 'active' AND id != ?2"
        ))?;
        let rows = stmt
            .query_map(params![key, exclude], row_to_entry)?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        Ok(rows)
    }

    /// SKIP path: repetition reinforces the surviving entry.
    pub fn bump_confirmations(&self, id: &str, by: i64) -> Result<(), MnemonError> {
        let changed = self.conn()?.execute(
            "UPDATE entries SET confirmations = confirmations + ?1, updated_at = ?2 \
             WHERE id = ?3",
            params![by, now_ms(), id],
        )?;
        if changed == 0 {
            return Err(MnemonError::NotFound);
        }
        Ok(())
    }

    /// UPDATE path: overwrite content and embedding in place, refresh all
    /// fingerprints, bump confirmations.
    pub fn update_content(
        &self,
        id: &str,
        content: &str,
        embedding: &[f32],
    ) -> Result<(), MnemonError> {
        let sig = fingerprint::shared().signature(content);
        let changed = self.conn()?.execute(
            "UPDATE entries SET content = ?1, embedding = ?2, content_hash = ?3, \
             norm_hash = ?4, minhash = ?5, confirmations = confirmations + 1, \
             updated_at = ?6 WHERE id = ?7",
            params![
                content,
                crate::ai::embedding_to_bytes(embedding),
                fingerprint::content_hash(content),
                fingerprint::norm_hash(content),
                fingerprint::signature_to_bytes(&sig),
                now_ms(),
                id
            ],
        )?;
        if changed == 0 {
            return Err(MnemonError::NotFound);
        }
        self.vec_index_put(id, embedding.to_vec());
        Ok(())
    }

    /// Attach an extracted claim to an entry.
    pub fn update_claim(
        &self,
        id: &str,
        entity: &str,
        attribute: &str,
        predicate: &str,
        object: &str,
        confidence: f64,
    ) -> Result<(), MnemonError> {
        let key = subject_key(entity, attribute);
        self.conn()?.execute(
            "UPDATE entries SET subject_entity = ?1, subject_attribute = ?2, \
             subject_key = ?3, claim_predicate = ?4, claim_object = ?5, \
             claim_confidence = ?6, updated_at = ?7 WHERE id = ?8",
            params![entity, attribute, key, predicate, object, confidence, now_ms(), id],
        )?;
        Ok(())
    }

    /// SUPERSEDE path: mark `old_id` inactive in favor of `new_id` and record
    /// the traceable edge, atomically.
    pub fn supersede(&self, old_id: &str, new_id: &str) -> Result<(), MnemonError> {
        let conn = self.conn()?;
        let now = now_ms();
        conn.execute_batch("BEGIN")?;
        let result = (|| -> Result<(), MnemonError> {
            supersede_row(&conn, old_id, new_id, now)?;
            insert_relation_row(&conn, new_id, old_id, "supersedes", now)?;
            Ok(())
        })();
        match result {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        }
        self.vec_index_remove(old_id);
        Ok(())
    }

    /// Commit a validated cluster merge in one transaction: insert the merged
    /// entry, then per source an entry_sources row, the supersession, and a
    /// `supersedes` relation. Any failure rolls the whole thing back.
    pub fn commit_merge(&self, merged: &Entry, sources: &[Entry]) -> Result<(), MnemonError> {
        let conn = self.conn()?;
        let now = now_ms();
        conn.execute_batch("BEGIN")?;
        let result = (|| -> Result<(), MnemonError> {
            insert_entry_row(&conn, merged)?;
            for src in sources {
                insert_source_row(&conn, &merged.id, src, now)?;
                supersede_row(&conn, &src.id, &merged.id, now)?;
                insert_relation_row(&conn, &merged.id, &src.id, "supersedes", now)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        }
        for src in sources {
            self.vec_index_remove(&src.id);
        }
        if let Some(emb) = &merged.embedding {
            self.vec_index_put(&merged.id, emb.clone());
        }
        Ok(())
    }

    /// Apply one rules-runner pass in a single transaction: expirations,
    /// near-exact merges, and orphaned-relation cleanup.
    pub fn apply_rules(
        &self,
        expire_ids: &[String],
        merges: &[RuleMergePlan],
    ) -> Result<RulesApplied, MnemonError> {
        let conn = self.conn()?;
        let now = now_ms();
        let mut applied = RulesApplied::default();
        conn.execute_batch("BEGIN")?;
        let result = (|| -> Result<(), MnemonError> {
            for id in expire_ids {
                let changed = conn.execute(
                    "UPDATE entries SET status = 'expired', superseded_by = NULL, \
                     updated_at = ?1 WHERE id = ?2 AND status = 'active'",
                    params![now, id],
                )?;
                applied.expired += changed;
            }
            for plan in merges {
                let tags_json =
                    serde_json::to_string(&plan.keeper_tags).unwrap_or_else(|_| "[]".into());
                conn.execute(
                    "UPDATE entries SET confirmations = confirmations + ?1, \
                     recall_count = recall_count + ?2, merged_from = merged_from + ?3, \
                     tags = ?4, consolidated_at = ?5, updated_at = ?5 WHERE id = ?6",
                    params![
                        plan.confirmations_add,
                        plan.recall_add,
                        plan.absorbed.len() as i64,
                        tags_json,
                        now,
                        plan.keeper_id
                    ],
                )?;
                for src in &plan.absorbed {
                    insert_source_row(&conn, &plan.keeper_id, src, now)?;
                    supersede_row(&conn, &src.id, &plan.keeper_id, now)?;
                    insert_relation_row(&conn, &plan.keeper_id, &src.id, "supersedes", now)?;
                    applied.merged += 1;
                }
            }
            // Orphans: non-supersedes relations touching anything inactive.
            // Supersedes edges are the audit trail and never get pruned.
            applied.relations_pruned = conn.execute(
                "DELETE FROM relations WHERE kind != 'supersedes' AND ( \
                   from_id IN (SELECT id FROM entries WHERE status != 'active') \
                   OR to_id IN (SELECT id FROM entries WHERE status != 'active'))",
                [],
            )?;
            Ok(())
        })();
        match result {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        }
        for id in expire_ids {
            self.vec_index_remove(id);
        }
        for plan in merges {
            for src in &plan.absorbed {
                self.vec_index_remove(&src.id);
            }
        }
        Ok(applied)
    }
}

/// Normalized `entity/attribute` key used to find same-topic entries.
pub fn subject_key(entity: &str, attribute: &str) -> String {
    format!(
        "{}/{}",
        fingerprint::normalize(entity),
        fingerprint::normalize(attribute)
    )
}

fn tags_json(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".into())
}

pub(super) fn insert_entry_row(conn: &Connection, e: &Entry) -> Result<(), MnemonError> {
    let superseded_by = match &e.status {
        EntryStatus::Superseded { by } => Some(by.as_str()),
        _ => None,
    };
    conn.execute(
        "INSERT INTO entries (id, kind, subject, content, importance, tier, tags, \
         embedding, content_hash, norm_hash, minhash, subject_entity, subject_attribute, \
         subject_key, claim_predicate, claim_object, claim_confidence, confirmations, \
         recall_count, created_at, updated_at, status, superseded_by, merged_from, \
         consolidated_at) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,\
         ?20,?21,?22,?23,?24,?25)",
        params![
            e.id,
            e.kind,
            e.subject,
            e.content,
            e.importance,
            e.tier.as_str(),
            tags_json(&e.tags),
            e.embedding.as_ref().map(|v| crate::ai::embedding_to_bytes(v)),
            e.content_hash,
            e.norm_hash,
            e.minhash.as_ref().map(|s| crate::fingerprint::signature_to_bytes(s)),
            e.subject_entity,
            e.subject_attribute,
            e.subject_key,
            e.claim_predicate,
            e.claim_object,
            e.claim_confidence,
            e.confirmations,
            e.recall_count,
            e.created_at,
            e.updated_at,
            e.status.as_str(),
            superseded_by,
            e.merged_from,
            e.consolidated_at,
        ],
    )?;
    Ok(())
}

pub(super) fn supersede_row(
    conn: &Connection,
    old_id: &str,
    new_id: &str,
    now: i64,
) -> Result<(), MnemonError> {
    let changed = conn.execute(
        "UPDATE entries SET status = 'superseded', superseded_by = ?1, updated_at = ?2 \
         WHERE id = ?3 AND status = 'active'",
        params![new_id, now, old_id],
    )?;
    if changed == 0 {
        return Err(MnemonError::Validation(format!(
            "supersede target {old_id} is not an active entry"
        )));
    }
    Ok(())
}

pub(super) fn insert_relation_row(
    conn: &Connection,
    from_id: &str,
    to_id: &str,
    kind: &str,
    now: i64,
) -> Result<(), MnemonError> {
    conn.execute(
        "INSERT INTO relations (from_id, to_id, kind, created_at) VALUES (?1,?2,?3,?4)",
        params![from_id, to_id, kind, now],
    )?;
    Ok(())
}

pub(super) fn insert_source_row(
    conn: &Connection,
    entry_id: &str,
    source: &Entry,
    now: i64,
) -> Result<(), MnemonError> {
    conn.execute(
        "INSERT INTO entry_sources (entry_id, source_id, confirmations, recall_count, \
         source_created_at, created_at) VALUES (?1,?2,?3,?4,?5,?6)",
        params![
            entry_id,
            source.id,
            source.confirmations,
            source.recall_count,
            source.created_at,
            now
        ],
    )?;
    Ok(())
}
