//! Provenance rows: typed relations, absorbed-source records, and the
//! append-only conflict audit trail.

use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Supersedes,
    Related,
    Contradicts,
}

impl RelationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RelationKind::Supersedes => "supersedes",
            RelationKind::Related => "related",
            RelationKind::Contradicts => "contradicts",
        }
    }
}

/// Typed edge between two entries.
#[derive(Debug, Clone, Serialize)]
pub struct Relation {
    pub id: i64,
    pub from_id: String,
    pub to_id: String,
    pub kind: String,
    pub created_at: i64,
}

/// Append-only provenance row: one absorbed source of a keeper entry,
/// preserving the source's original counters.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySource {
    pub id: i64,
    pub entry_id: String,
    pub source_id: String,
    pub confirmations: i64,
    pub recall_count: i64,
    pub source_created_at: i64,
    pub created_at: i64,
}

/// Conflict-log resolution states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    AutoSuperseded,
    Pending,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::AutoSuperseded => "auto-superseded",
            Resolution::Pending => "pending",
        }
    }
}

/// Append-only conflict audit row.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictLogRow {
    pub id: i64,
    pub entry_a: String,
    pub entry_b: String,
    pub relation: String,
    pub confidence: f64,
    pub resolution: String,
    pub created_at: i64,
}

impl EntryStore {
    pub fn insert_relation(
        &self,
        from_id: &str,
        to_id: &str,
        kind: RelationKind,
    ) -> Result<(), MnemonError> {
        super::entries::insert_relation_row(&*self.conn()?, from_id, to_id, kind.as_str(), now_ms())
    }

    /// Every relation touching an entry, either direction.
    pub fn relations_for(&self, id: &str) -> Result<Vec<Relation>, MnemonError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, from_id, to_id, kind, created_at FROM relations \
             WHERE from_id = ?1 OR to_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([id], |r| {
                Ok(Relation {
                    id: r.get(0)?,
                    from_id: r.get(1)?,
                    to_id: r.get(2)?,
                    kind: r.get(3)?,
                    created_at: r.get(4)?,
                })
            })?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        Ok(rows)
    }

    /// Non-supersedes relations touching inactive entries — what a rules run
    /// would prune. Used by dry runs.
    pub fn count_orphan_relations(&self) -> usize {
        let Ok(c) = self.conn() else { return 0 };
        c.query_row(
            "SELECT COUNT(*) FROM relations WHERE kind != 'supersedes' AND ( \
               from_id IN (SELECT id FROM entries WHERE status != 'active') \
               OR to_id IN (SELECT id FROM entries WHERE status != 'active'))",
            [],
            |r| r.get::<_, i64>(0),
        )
        .unwrap_or(0) as usize
    }

    pub fn relation_count(&self, kind: Option<RelationKind>) -> i64 {
        let Ok(c) = self.conn() else { return 0 };
        match kind {
            Some(k) => c
                .query_row(
                    "SELECT COUNT(*) FROM relations WHERE kind = ?1",
                    [k.as_str()],
                    |r| r.get(0),
                )
                .unwrap_or(0),
            None => c
                .query_row("SELECT COUNT(*) FROM relations", [], |r| r.get(0))
                .unwrap_or(0),
        }
    }

    /// Absorbed sources of a keeper/merged entry, oldest first.
    pub fn sources_for(&self, entry_id: &str) -> Result<Vec<EntrySource>, MnemonError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, entry_id, source_id, confirmations, recall_count, \
             source_created_at, created_at FROM entry_sources WHERE entry_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([entry_id], |r| {
                Ok(EntrySource {
                    id: r.get(0)?,
                    entry_id: r.get(1)?,
                    source_id: r.get(2)?,
                    confirmations: r.get(3)?,
                    recall_count: r.get(4)?,
                    source_created_at: r.get(5)?,
                    created_at: r.get(6)?,
                })
            })?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        Ok(rows)
    }

    /// Apply every auto-resolution a new entry earned, in one transaction:
    /// per loser a supersession, a `supersedes` relation, and an
    /// "auto-superseded" audit row. One new entry may settle several
    /// conflicts in a single write.
    pub fn resolve_conflicts(
        &self,
        winner_id: &str,
        losers: &[(String, f64)],
    ) -> Result<(), MnemonError> {
        if losers.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let now = now_ms();
        conn.execute_batch("BEGIN")?;
        let result = (|| -> Result<(), MnemonError> {
            for (loser, confidence) in losers {
                super::entries::supersede_row(&conn, loser, winner_id, now)?;
                super::entries::insert_relation_row(&conn, winner_id, loser, "supersedes", now)?;
                conn.execute(
                    "INSERT INTO conflict_log (entry_a, entry_b, relation, confidence, \
                     resolution, created_at) VALUES (?1,?2,?3,?4,?5,?6)",
                    params![
                        winner_id,
                        loser,
                        "supersedes",
                        confidence,
                        Resolution::AutoSuperseded.as_str(),
                        now
                    ],
                )?;
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
        for (loser, _) in losers {
            self.vec_index_remove(loser);
        }
        Ok(())
    }

    pub fn log_conflict(
        &self,
        entry_a: &str,
        entry_b: &str,
        relation: &str,
        confidence: f64,
        resolution: Resolution,
    ) -> Result<(), MnemonError> {
        self.conn()?.execute(
            "INSERT INTO conflict_log (entry_a, entry_b, relation, confidence, \
             resolution, created_at) VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                entry_a,
                entry_b,
                relation,
                confidence,
                resolution.as_str(),
                now_ms()
            ],
        )?;
        Ok(())
    }

    /// Conflict audit rows, optionally filtered by resolution, newest first.
    pub fn conflicts(
        &self,
        resolution: Option<Resolution>,
    ) -> Result<Vec<ConflictLogRow>, MnemonError> {
        let conn = self.conn()?;
        let map = |r: &rusqlite::Row| -> rusqlite::Result<ConflictLogRow> {
            Ok(ConflictLogRow {
                id: r.get(0)?,
                entry_a: r.get(1)?,
                entry_b: r.get(2)?,
                relation: r.get(3)?,
                confidence: r.get(4)?,
                resolution: r.get(5)?,
                created_at: r.get(6)?,
            })
        };
        let sql_base = "SELECT id, entry_a, entry_b, relation, confidence, resolution, \
             created_at FROM conflict_log";
        let rows = match resolution {
            Some(res) => {
                let mut stmt =
                    conn.prepare(&format!("{sql_base} WHERE resolution = ?1 ORDER BY id DESC"))?;
                let rows: Vec<ConflictLogRow> = stmt
                    .query_map([res.as_str()], map)?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!("{sql_base} ORDER BY id DESC"))?;
                let rows: Vec<ConflictLogRow> =
                    stmt.query_map([], map)?.filter_map(|r| r.ok()).collect();
                rows
            }
        };
        Ok(rows)
    }
}
