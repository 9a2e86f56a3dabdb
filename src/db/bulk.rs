//! Bulk-ingest support: drop indexes around large imports, rebuild after,
//! recover from a crash in between.
//!
//! The meta flag walks `writing` → `rebuilding_vector` → cleared. Recovery
//! replays whichever rebuild step the flag says is missing. Only bulk-aware
//! entry points call `recover_bulk` — plain `open` stays cheap.

use uuid::Uuid;

use crate::fingerprint;

use super::*;

const BULK_PHASE_KEY: &str = "bulk_phase";

impl EntryStore {
    /// Prepare for a large import: drop the FTS triggers (the rows go stale
    /// and get regenerated later), clear the vector index, stamp the flag.
    pub fn begin_bulk(&self) -> Result<(), MnemonError> {
        fts::drop_triggers(&*self.conn()?)?;
        self.clear_vec_index();
        self.set_meta(BULK_PHASE_KEY, "writing")?;
        tracing::info!("bulk ingest: triggers dropped, vector index cleared");
        Ok(())
    }

    /// Rebuild everything the bulk write skipped, then clear the flag.
    pub fn finish_bulk(&self) -> Result<(), MnemonError> {
        self.rebuild_fts()?;
        fts::create_triggers(&*self.conn()?)?;
        self.set_meta(BULK_PHASE_KEY, "rebuilding_vector")?;
        self.load_vec_index();
        self.delete_meta(BULK_PHASE_KEY)?;
        tracing::info!(indexed = self.vec_index_len(), "bulk ingest: indexes rebuilt");
        Ok(())
    }

    /// Crash recovery for an interrupted bulk import. Idempotent; a no-op
    /// when the flag is clear.
    pub fn recover_bulk(&self) -> Result<bool, MnemonError> {
        match self.get_meta(BULK_PHASE_KEY).as_deref() {
            Some("writing") => {
                tracing::warn!("bulk ingest interrupted while writing — rebuilding FTS and vector index");
                self.rebuild_fts()?;
                fts::create_triggers(&*self.conn()?)?;
                self.set_meta(BULK_PHASE_KEY, "rebuilding_vector")?;
                self.load_vec_index();
                self.delete_meta(BULK_PHASE_KEY)?;
                Ok(true)
            }
            Some("rebuilding_vector") => {
                tracing::warn!("bulk ingest interrupted during vector rebuild — rebuilding vector index");
                self.load_vec_index();
                self.delete_meta(BULK_PHASE_KEY)?;
                Ok(true)
            }
            Some(other) => {
                tracing::warn!(flag = other, "unknown bulk phase flag, clearing");
                self.delete_meta(BULK_PHASE_KEY)?;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Batch insert within a single all-or-nothing transaction. Skips dedup
    /// for throughput; invalid inputs are skipped with a warning rather than
    /// poisoning the batch. Returns the inserted entries.
    pub fn bulk_insert(
        &self,
        inputs: Vec<(EntryInput, Option<Vec<f32>>)>,
    ) -> Result<Vec<Entry>, MnemonError> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN")?;
        let mut results = Vec::with_capacity(inputs.len());
        let result = (|| -> Result<(), MnemonError> {
            for (input, embedding) in inputs {
                if let Err(e) = validate_input(&input) {
                    tracing::warn!(error = %e, "bulk: skipping invalid input");
                    continue;
                }
                let now = now_ms();
                let entry = Entry {
                    id: Uuid::new_v4().to_string(),
                    kind: input.kind.unwrap_or_else(|| "fact".into()),
                    subject: input.subject.unwrap_or_default(),
                    content: input.content.clone(),
                    importance: input.importance.unwrap_or(5).clamp(1, 10),
                    tier: input.tier.unwrap_or(Tier::Permanent),
                    tags: input.tags.unwrap_or_default(),
                    embedding,
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
                super::entries::insert_entry_row(&conn, &entry)?;
                results.push(entry);
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
        Ok(results)
    }
}
