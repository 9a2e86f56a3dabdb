//! Durable review queue for merges that failed fidelity verification.
//!
//! JSON-lines file, append-only. A flagged merge must never be silently
//! applied or dropped — it lands here for a human (or a later tool) to judge.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::MnemonError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub cluster_ids: Vec<String>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worst_source_sim: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub centroid_sim: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_content: Option<String>,
    pub created_at: i64,
}

pub struct ReviewQueue {
    path: PathBuf,
}

impl ReviewQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, item: &ReviewItem) -> Result<(), MnemonError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(item)
            .map_err(|e| MnemonError::Internal(format!("review serialize: {e}")))?;
        writeln!(file, "{line}")?;
        file.sync_all()?;
        Ok(())
    }

    /// All queued items, oldest first. A missing file is an empty queue.
    pub fn load(&self) -> Result<Vec<ReviewItem>, MnemonError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| {
                serde_json::from_str(l)
                    .map_err(|e| tracing::warn!("review queue line parse: {e}"))
                    .ok()
            })
            .collect())
    }
}
