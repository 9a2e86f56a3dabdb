//! In-memory vector index and similarity lookup.
//!
//! Brute-force cosine over active embedded entries. Fine for the pool sizes
//! this store sees (tens of thousands); the ANN implementation is somebody
//! else's problem per the external-interface contract — this module only
//! owns load/rebuild and the `find_similar` shape.

use std::collections::HashMap;

use super::*;

pub(super) struct VecIndex {
    map: HashMap<String, Vec<f32>>,
}

impl VecIndex {
    pub(super) fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub(super) fn clear(&mut self) {
        self.map.clear();
    }

    pub(super) fn insert(&mut self, id: String, emb: Vec<f32>) {
        self.map.insert(id, emb);
    }

    pub(super) fn remove(&mut self, id: &str) {
        self.map.remove(id);
    }

    pub(super) fn len(&self) -> usize {
        self.map.len()
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = (&String, &Vec<f32>)> {
        self.map.iter()
    }
}

impl EntryStore {
    /// Load all active embeddings from the DB into the in-memory index.
    pub(super) fn load_vec_index(&self) {
        let Ok(conn) = self.conn() else { return };
        let Ok(mut stmt) = conn.prepare(
            "SELECT id, embedding FROM entries \
             WHERE embedding IS NOT NULL AND status = 'active'",
        ) else {
            return;
        };

        let pairs: Vec<(String, Vec<f32>)> = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, crate::ai::bytes_to_embedding(&blob)))
            })
            .map(|iter| iter.filter_map(|r| r.ok()).collect())
            .unwrap_or_default();

        if let Ok(mut idx) = self.vec_index.write() {
            idx.clear();
            let count = pairs.len();
            for (id, emb) in pairs {
                idx.insert(id, emb);
            }
            tracing::debug!(count, "loaded vector index");
        }
    }

    /// Drop and reload the index from the DB. Best-effort callers ignore the
    /// result; the index self-heals on next open either way.
    pub fn rebuild_vec_index(&self) {
        self.load_vec_index();
    }

    /// Drop the in-memory index without touching the DB. Bulk ingest uses
    /// this before a big write; recovery tests use it to simulate loss.
    pub fn clear_vec_index(&self) {
        if let Ok(mut idx) = self.vec_index.write() {
            idx.clear();
        }
    }

    pub fn vec_index_len(&self) -> usize {
        self.vec_index.read().map(|idx| idx.len()).unwrap_or(0)
    }

    pub(super) fn vec_index_put(&self, id: &str, emb: Vec<f32>) {
        if let Ok(mut idx) = self.vec_index.write() {
            idx.insert(id.to_string(), emb);
        }
    }

    pub(super) fn vec_index_remove(&self, id: &str) {
        if let Ok(mut idx) = self.vec_index.write() {
            idx.remove(id);
        }
    }

    /// Nearest active neighbors by cosine similarity, best first.
    pub fn find_similar(
        &self,
        embedding: &[f32],
        limit: usize,
        exclude: Option<&str>,
    ) -> Vec<(String, f64)> {
        let Ok(idx) = self.vec_index.read() else {
            return vec![];
        };
        let mut scored: Vec<(String, f64)> = idx
            .iter()
            .filter(|(id, _)| exclude != Some(id.as_str()))
            .map(|(id, emb)| (id.clone(), crate::ai::cosine_similarity(embedding, emb)))
            .filter(|(_, sim)| *sim > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        scored
    }

    /// `find_similar`, hydrated: the external `findSimilar` contract shape.
    pub fn find_similar_entries(
        &self,
        embedding: &[f32],
        limit: usize,
        exclude: Option<&str>,
    ) -> Result<Vec<(Entry, f64)>, MnemonError> {
        let mut out = Vec::new();
        for (id, sim) in self.find_similar(embedding, limit, exclude) {
            if let Some(entry) = self.get(&id)? {
                out.push((entry, sim));
            }
        }
        Ok(out)
    }
}
