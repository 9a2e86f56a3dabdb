//! FTS5 full-text index, kept in sync by triggers.
//!
//! Trigger-based sync means bulk ingest can drop the triggers up front,
//! write without index amplification, and rebuild once at the end.

use rusqlite::Connection;

use super::*;

// External-content FTS over the entries table.
const FTS_SCHEMA: &str = "CREATE VIRTUAL TABLE IF NOT EXISTS entries_fts USING fts5(\
     content, subject, content='entries', content_rowid='rowid')";

const CREATE_TRIGGERS: [&str; 3] = [
    "CREATE TRIGGER IF NOT EXISTS entries_ai AFTER INSERT ON entries BEGIN \
       INSERT INTO entries_fts(rowid, content, subject) \
       VALUES (new.rowid, new.content, new.subject); \
     END",
    "CREATE TRIGGER IF NOT EXISTS entries_ad AFTER DELETE ON entries BEGIN \
       INSERT INTO entries_fts(entries_fts, rowid, content, subject) \
       VALUES ('delete', old.rowid, old.content, old.subject); \
     END",
    "CREATE TRIGGER IF NOT EXISTS entries_au AFTER UPDATE OF content, subject ON entries BEGIN \
       INSERT INTO entries_fts(entries_fts, rowid, content, subject) \
       VALUES ('delete', old.rowid, old.content, old.subject); \
       INSERT INTO entries_fts(rowid, content, subject) \
       VALUES (new.rowid, new.content, new.subject); \
     END",
];

const DROP_TRIGGERS: [&str; 3] = [
    "DROP TRIGGER IF EXISTS entries_ai",
    "DROP TRIGGER IF EXISTS entries_ad",
    "DROP TRIGGER IF EXISTS entries_au",
];

pub(super) fn init_fts(conn: &Connection) -> Result<(), MnemonError> {
    conn.execute(FTS_SCHEMA, [])?;
    create_triggers(conn)?;
    Ok(())
}

pub(super) fn create_triggers(conn: &Connection) -> Result<(), MnemonError> {
    for t in &CREATE_TRIGGERS {
        conn.execute(t, [])?;
    }
    Ok(())
}

pub(super) fn drop_triggers(conn: &Connection) -> Result<(), MnemonError> {
    for t in &DROP_TRIGGERS {
        conn.execute(t, [])?;
    }
    Ok(())
}

impl EntryStore {
    /// Full-text search over active entries. Returns `(id, bm25_score)` pairs,
    /// best first.
    pub fn search_fts(&self, query: &str, limit: usize) -> Result<Vec<(String, f64)>, MnemonError> {
        // Sanitize: FTS5 query syntax is easy to break with stray operators.
        let terms: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        if terms.is_empty() {
            return Ok(vec![]);
        }
        let fts_query = terms.join(" OR ");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT e.id, f.rank FROM entries_fts f \
             JOIN entries e ON e.rowid = f.rowid \
             WHERE f.entries_fts MATCH ?1 AND e.status = 'active' \
             ORDER BY f.rank LIMIT ?2",
        )?;
        Ok(stmt
            .query_map(rusqlite::params![fts_query, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })
            .map(|iter| {
                iter.filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
                    .map(|(id, rank)| (id, -rank))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Regenerate the whole FTS index from the entries table.
    pub fn rebuild_fts(&self) -> Result<(), MnemonError> {
        self.conn()?
            .execute("INSERT INTO entries_fts(entries_fts) VALUES('rebuild')", [])?;
        Ok(())
    }

    pub fn integrity_check(&self) -> Result<IntegrityReport, MnemonError> {
        let conn = self.conn()?;
        let entries: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |r| r.get(0))?;
        let fts_rows: i64 = conn.query_row("SELECT COUNT(*) FROM entries_fts", [], |r| r.get(0))?;
        let missing_embedding: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE embedding IS NULL AND status = 'active'",
            [],
            |r| r.get(0),
        )?;
        Ok(IntegrityReport {
            entries: entries as usize,
            fts_rows: fts_rows as usize,
            missing_embedding: missing_embedding as usize,
            ok: entries == fts_rows,
        })
    }
}
