//! Content fingerprints: exact hash, normalized hash, MinHash signatures.
//!
//! The dedup ladder consults these cheapest-first: an exact hash match
//! short-circuits before any embedding or LLM work, the normalized hash
//! catches cosmetic duplicates, and MinHash approximates Jaccard similarity
//! in O(signature length) for bulk near-duplicate flagging.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::hash::{Hash, Hasher};

/// Signature length. 128 slots keeps the Jaccard estimate's standard error
/// under ~0.05 across the similarity range.
pub const MINHASH_LEN: usize = 128;

/// Mersenne prime 2^61 − 1, the modulus for the hash permutations.
const MINHASH_PRIME: u64 = (1 << 61) - 1;

/// Shingle width in tokens.
const SHINGLE_LEN: usize = 3;

/// Hex sha256 of the raw content.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lowercase, strip punctuation, collapse whitespace runs to single spaces.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            for lc in c.to_lowercase() {
                out.push(lc);
            }
        } else {
            pending_space = true;
        }
    }
    out
}

/// Hex sha256 of the normalized content. Catches cosmetic duplicates.
pub fn norm_hash(text: &str) -> String {
    content_hash(&normalize(text))
}

fn shingle_hashes(text: &str) -> Vec<u64> {
    let norm = normalize(text);
    let tokens: Vec<&str> = norm.split(' ').filter(|t| !t.is_empty()).collect();
    if tokens.is_empty() {
        return vec![];
    }
    // Short texts fall back to single-token shingles so they still compare.
    let width = SHINGLE_LEN.min(tokens.len());
    tokens
        .windows(width)
        .map(|w| {
            let mut h = std::collections::hash_map::DefaultHasher::new();
            w.hash(&mut h);
            h.finish()
        })
        .collect()
}

/// MinHash signatures over shingled tokens.
///
/// Permutation parameters come from a fixed-seed StdRng so signatures are
/// stable across runs and safe to persist.
pub struct MinHasher {
    a: Vec<u64>,
    b: Vec<u64>,
}

impl Default for MinHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl MinHasher {
    pub fn new() -> Self {
        let mut rng = StdRng::seed_from_u64(0x6d6e_656d_6f6e); // "mnemon"
        let a = (0..MINHASH_LEN)
            .map(|_| rng.gen_range(1..MINHASH_PRIME))
            .collect();
        let b = (0..MINHASH_LEN)
            .map(|_| rng.gen_range(0..MINHASH_PRIME))
            .collect();
        Self { a, b }
    }

    /// Fixed-length signature of the text. Empty text gives an all-max
    /// signature, which still estimates 1.0 against another empty text.
    pub fn signature(&self, text: &str) -> Vec<u32> {
        let shingles = shingle_hashes(text);
        let mut sig = vec![u32::MAX; MINHASH_LEN];
        if shingles.is_empty() {
            return sig;
        }
        for (i, slot) in sig.iter_mut().enumerate() {
            let mut min = u64::MAX;
            for &x in &shingles {
                // (a*x + b) mod p, in u128 to avoid overflow
                let v = ((self.a[i] as u128 * x as u128 + self.b[i] as u128)
                    % MINHASH_PRIME as u128) as u64;
                if v < min {
                    min = v;
                }
            }
            *slot = (min & 0xFFFF_FFFF) as u32;
        }
        sig
    }
}

/// Process-wide MinHasher. Permutation parameters are deterministic, so a
/// shared instance keeps signatures comparable everywhere.
pub fn shared() -> &'static MinHasher {
    static INSTANCE: std::sync::OnceLock<MinHasher> = std::sync::OnceLock::new();
    INSTANCE.get_or_init(MinHasher::new)
}

/// Jaccard estimate: fraction of matching signature slots.
/// Returns 0.0 for mismatched signature lengths.
pub fn minhash_jaccard(a: &[u32], b: &[u32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let matches = a.iter().zip(b).filter(|(x, y)| x == y).count();
    matches as f64 / a.len() as f64
}

/// Serialize a signature for SQLite BLOB storage (u32 little-endian).
pub fn signature_to_bytes(sig: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(sig.len() * 4);
    for &v in sig {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

pub fn bytes_to_signature(b: &[u8]) -> Vec<u32> {
    b.chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().expect("4 bytes");
            u32::from_le_bytes(arr)
        })
        .collect()
}
