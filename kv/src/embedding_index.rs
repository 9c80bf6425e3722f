//! Semantic (embedding) index: key -> dense vector, cosine top-k search.
//! Grounded on `original_source/server/indexes/embedding_index.py`.
//!
//! `embed()` is the opaque collaborator spec.md §1 names
//! (`embed(string) -> vector(float, d)`, deterministic per input). No ML
//! runtime is available in this workspace, so it is implemented as a small
//! deterministic hashed bag-of-words vectorizer behind the same boundary a
//! real sentence-transformer binding would occupy — callers never depend on
//! its internals, only on "deterministic, fixed dimension, similar text
//! scores higher".

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::CResult;

/// Fixed output dimension of `embed()`.
pub const DIM: usize = 64;

/// Deterministic text -> vector function. Tokenizes on whitespace/word
/// boundaries, hashes each token into one of `DIM` buckets, and accumulates
/// a signed count per bucket — close in spirit to the hashing trick used by
/// bag-of-words vectorizers, giving texts sharing vocabulary a high cosine
/// similarity without needing a model file on disk.
pub fn embed(text: &str) -> [f32; DIM] {
    let mut v = [0f32; DIM];
    for token in text.to_lowercase().split_whitespace() {
        let hash = fnv1a(token.as_bytes());
        let bucket = (hash % DIM as u64) as usize;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign;
    }
    v
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn cosine(a: &[f32; DIM], b: &[f32; DIM]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

struct Inner {
    vectors: HashMap<String, [f32; DIM]>,
}

pub struct EmbeddingIndex {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl EmbeddingIndex {
    pub fn open(dir: impl AsRef<Path>) -> CResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let vectors = Self::load(&dir).unwrap_or_default();
        Ok(Self {
            dir,
            inner: Mutex::new(Inner { vectors }),
        })
    }

    fn vectors_path(dir: &Path) -> PathBuf {
        dir.join("vectors.bin")
    }

    fn keys_path(dir: &Path) -> PathBuf {
        dir.join("keys.json")
    }

    fn load(dir: &Path) -> Option<HashMap<String, [f32; DIM]>> {
        let bytes = std::fs::read(Self::vectors_path(dir)).ok()?;
        let keys_json = std::fs::read_to_string(Self::keys_path(dir)).ok()?;
        let keys: Vec<String> = serde_json::from_str(&keys_json).ok()?;
        let flat: Vec<f32> = bincode::deserialize(&bytes).ok()?;
        if flat.len() != keys.len() * DIM {
            return None;
        }
        Some(
            keys.into_iter()
                .zip(flat.chunks_exact(DIM).map(|c| {
                    let mut v = [0f32; DIM];
                    v.copy_from_slice(c);
                    v
                }))
                .collect(),
        )
    }

    /// Embeds and stores `value` under `key`. Empty/whitespace-only values
    /// are skipped entirely, matching the invariant that only non-empty
    /// values get an embedding.
    pub fn add(&self, key: &str, value: &str) {
        if value.trim().is_empty() {
            return;
        }
        let vector = embed(value);
        self.inner.lock().unwrap().vectors.insert(key.to_string(), vector);
    }

    pub fn remove(&self, key: &str) {
        self.inner.lock().unwrap().vectors.remove(key);
    }

    pub fn update(&self, key: &str, value: &str) {
        self.add(key, value);
    }

    /// Top-`top_k` keys by cosine similarity to `query`, descending. Ties
    /// are broken by key order (arbitrary but deterministic), the index
    /// itself enforces nothing stronger per spec.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(String, f32)> {
        if query.trim().is_empty() {
            return Vec::new();
        }
        let query_vec = embed(query);
        let inner = self.inner.lock().unwrap();
        let mut scored: Vec<(String, f32)> = inner
            .vectors
            .iter()
            .map(|(k, v)| (k.clone(), cosine(&query_vec, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(top_k);
        scored
    }

    /// Persists the vectors as a parallel keys/vectors pair (`bincode` for
    /// the vectors, matching the teacher's binary-serialization idiom
    /// elsewhere in the crate).
    pub fn save(&self) -> CResult<()> {
        let inner = self.inner.lock().unwrap();
        let keys: Vec<String> = inner.vectors.keys().cloned().collect();
        let flat: Vec<f32> = keys.iter().flat_map(|k| inner.vectors[k]).collect();

        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(Self::vectors_path(&self.dir), bincode::serialize(&flat)?)?;
        std::fs::write(Self::keys_path(&self.dir), serde_json::to_string(&keys)?)?;
        Ok(())
    }
}
