//! Resumable consolidation checkpoints.
//!
//! Written with temp-file-plus-rename so a crash mid-write can never leave a
//! truncated checkpoint behind.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::MnemonError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub phase: u8,
    pub kind_index: usize,
    pub cluster_index: usize,
    pub started_at: i64,
    /// Scope ("phase1:fact", "phase2:*", ...) → processed cluster fingerprints.
    pub processed: HashMap<String, HashSet<String>>,
}

impl Checkpoint {
    pub fn new(started_at: i64) -> Self {
        Self {
            started_at,
            ..Default::default()
        }
    }

    pub fn scope(phase: u8, kind: Option<&str>) -> String {
        format!("phase{}:{}", phase, kind.unwrap_or("*"))
    }

    pub fn is_processed(&self, scope: &str, fingerprint: &str) -> bool {
        self.processed
            .get(scope)
            .is_some_and(|set| set.contains(fingerprint))
    }

    pub fn mark(&mut self, scope: &str, fingerprint: String) {
        self.processed
            .entry(scope.to_string())
            .or_default()
            .insert(fingerprint);
    }

    pub fn processed_count(&self) -> usize {
        self.processed.values().map(|s| s.len()).sum()
    }

    pub fn load(path: &Path) -> Result<Option<Checkpoint>, MnemonError> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| MnemonError::Internal(format!("checkpoint parse: {e}")))
    }

    /// Atomic save: write a sibling temp file, fsync, rename into place.
    pub fn save(&self, path: &Path) -> Result<(), MnemonError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MnemonError::Internal(format!("checkpoint serialize: {e}")))?;
        std::fs::write(&tmp, json)?;
        let file = std::fs::File::open(&tmp)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Delete on clean completion. Missing file is fine.
    pub fn delete(path: &Path) -> Result<(), MnemonError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_delete() {
        let dir = std::env::temp_dir().join(format!("mnemon-ckpt-{}", std::process::id()));
        let path = dir.join("checkpoint.json");
        let mut cp = Checkpoint::new(123);
        cp.phase = 2;
        cp.mark("phase1:fact", "abcd".into());
        cp.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap().unwrap();
        assert_eq!(loaded.phase, 2);
        assert_eq!(loaded.started_at, 123);
        assert!(loaded.is_processed("phase1:fact", "abcd"));
        assert!(!loaded.is_processed("phase1:fact", "other"));

        Checkpoint::delete(&path).unwrap();
        assert!(Checkpoint::load(&path).unwrap().is_none());
        Checkpoint::delete(&path).unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }
}
