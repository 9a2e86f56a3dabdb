//! Shared fixtures: in-memory store, scripted judge, deterministic embedder.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use mnemon::ai::{EmbedError, EmbeddingProvider, ToolCallClient};
use mnemon::db::{now_ms, Entry, EntryStatus, EntryStore, Tier};
use mnemon::error::MnemonError;
use mnemon::fingerprint;
use mnemon::SharedStore;

pub fn test_store() -> SharedStore {
    Arc::new(EntryStore::open(":memory:").expect("in-memory store"))
}

/// A fully-formed entry for `import`. Tests tweak fields before importing.
pub fn mk_entry(id: &str, kind: &str, subject: &str, content: &str) -> Entry {
    let now = now_ms();
    Entry {
        id: id.into(),
        kind: kind.into(),
        subject: subject.into(),
        content: content.into(),
        importance: 5,
        tier: Tier::Permanent,
        tags: vec![],
        embedding: None,
        content_hash: fingerprint::content_hash(content),
        norm_hash: fingerprint::norm_hash(content),
        minhash: Some(fingerprint::shared().signature(content)),
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
    }
}

/// Deterministic embedder: explicit registrations, hash-derived one-hot
/// fallback (dimension 256 so distinct unregistered texts are orthogonal).
/// Counts provider calls so tests can assert "zero embedding calls".
pub struct MockEmbedder {
    registry: Mutex<HashMap<String, Vec<f32>>>,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn register(self: &Arc<Self>, text: &str, emb: Vec<f32>) -> Arc<Self> {
        self.registry.lock().insert(text.to_string(), emb);
        self.clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lookup(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.registry.lock().get(text) {
            return v.clone();
        }
        let mut v = vec![0.0f32; 256];
        let mut h = 0usize;
        for b in text.bytes() {
            h = h.wrapping_mul(31).wrapping_add(b as usize);
        }
        v[h % 256] = 1.0;
        v
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.lookup(t)).collect())
    }
}

/// A provider that rate-limits the first `failures` calls, then succeeds.
pub struct FlakyEmbedder {
    inner: Arc<MockEmbedder>,
    failures: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: MockEmbedder::new(),
            failures: AtomicUsize::new(failures),
        })
    }

    pub fn calls(&self) -> usize {
        self.inner.calls()
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| f.checked_sub(1))
            .is_ok()
        {
            return Err(EmbedError::RateLimited);
        }
        self.inner.embed(texts).await
    }
}

/// Scripted judge: per-component FIFO of canned responses; the last response
/// of a component is reused once the queue drains. Unscripted components
/// error, which exercises the degrade paths.
pub struct MockJudge {
    scripts: Mutex<HashMap<String, Vec<serde_json::Value>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockJudge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        })
    }

    pub fn on(self: &Arc<Self>, component: &str, response: serde_json::Value) -> Arc<Self> {
        self.scripts
            .lock()
            .entry(component.to_string())
            .or_default()
            .push(response);
        self.clone()
    }

    pub fn calls(&self, component: &str) -> usize {
        self.calls.lock().get(component).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Upcast helper — trait-object parameters want `Arc<dyn ToolCallClient>`.
    pub fn as_client(self: &Arc<Self>) -> Arc<dyn ToolCallClient> {
        self.clone()
    }
}

#[async_trait]
impl ToolCallClient for MockJudge {
    async fn tool_call(
        &self,
        component: &str,
        _system: &str,
        _user: &str,
        _fn_name: &str,
        _fn_desc: &str,
        _parameters: serde_json::Value,
    ) -> Result<serde_json::Value, MnemonError> {
        *self.calls.lock().entry(component.to_string()).or_default() += 1;
        let scripts = self.scripts.lock();
        let Some(queue) = scripts.get(component) else {
            return Err(MnemonError::Judge(format!(
                "no scripted response for component '{component}'"
            )));
        };
        let idx = (self.calls.lock().get(component).copied().unwrap_or(1) - 1).min(queue.len() - 1);
        Ok(queue[idx].clone())
    }
}
