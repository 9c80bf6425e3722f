//! `KVStore`: the durable single-node engine. Wires the WAL, the in-memory
//! table, and the two secondary indexes together under the write-ordering
//! discipline spec.md §4.2 mandates, plus snapshot/recovery and a background
//! snapshot worker. Grounded on `kv/src/storage/mod.rs` (`Engine` trait) and
//! `original_source/server/store.py`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::embedding_index::EmbeddingIndex;
use crate::error::CResult;
use crate::inverted_index::{InvertedIndex, SearchMode};
use crate::wal::{Wal, WalEntry, WalOp};

/// Snapshot cadence for the background worker.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

/// Default probability of skipping the snapshot step when `debug=true` is
/// passed on a write. A test affordance only; the WAL step never skips.
pub const DEFAULT_DEBUG_FAILURE_RATE: f64 = 0.01;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetResult {
    pub success: bool,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResult {
    pub success: bool,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResult {
    pub success: bool,
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSetResult {
    pub success: bool,
    pub seq: u64,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub keys: usize,
    pub wal_size: u64,
}

struct Table {
    data: HashMap<String, String>,
}

/// All mutable state protected by a single writer-exclusive, reader-admitting
/// lock (spec.md §5's "single reentrant per-store lock", implemented here as
/// a plain `Mutex` since reads and writes both go through the same short
/// critical sections).
struct Inner {
    table: Table,
}

pub struct KVStore {
    dir: PathBuf,
    wal: Wal,
    inverted: InvertedIndex,
    embedding: EmbeddingIndex,
    inner: Mutex<Inner>,
    debug_failure_rate: f64,
    snapshot_worker: Mutex<Option<(Arc<std::sync::atomic::AtomicBool>, JoinHandle<()>)>>,
}

fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join("snapshot.json")
}

fn wal_path(dir: &Path) -> PathBuf {
    dir.join("wal.log")
}

fn inverted_path(dir: &Path) -> PathBuf {
    dir.join("inverted_index.json")
}

fn embedding_dir(dir: &Path) -> PathBuf {
    dir.join("embedding_index")
}

impl KVStore {
    /// Opens (or creates) a store rooted at `dir`: loads the snapshot,
    /// replays the WAL on top of it, then writes a fresh snapshot per
    /// spec.md §4.2's recovery pipeline. Does not start the background
    /// snapshot worker; call `start_snapshot_worker` for that.
    pub fn open(dir: impl AsRef<Path>) -> CResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let wal = Wal::open(wal_path(&dir))?;
        let inverted = InvertedIndex::open(inverted_path(&dir))?;
        let embedding = EmbeddingIndex::open(embedding_dir(&dir))?;

        let data = Self::load_snapshot(&dir).unwrap_or_default();
        let mut table = Table { data };

        for entry in wal.replay()? {
            Self::apply_entry(&mut table, &inverted, &entry);
        }

        let store = Self {
            dir,
            wal,
            inverted,
            embedding,
            inner: Mutex::new(Inner { table }),
            debug_failure_rate: DEFAULT_DEBUG_FAILURE_RATE,
            snapshot_worker: Mutex::new(None),
        };

        store.write_snapshot()?;
        Ok(store)
    }

    fn load_snapshot(dir: &Path) -> Option<HashMap<String, String>> {
        let data = std::fs::read_to_string(snapshot_path(dir)).ok()?;
        serde_json::from_str(&data).ok()
    }

    /// Applies one replayed entry to `table` and `inverted`, idempotently:
    /// a SET equal to the current value, or a DELETE of an absent key, is a
    /// harmless no-op, matching spec.md §4.2's requirement that operations
    /// tolerate being re-applied on top of their own effect.
    fn apply_entry(table: &mut Table, inverted: &InvertedIndex, entry: &WalEntry) {
        match entry.op.as_str() {
            "SET" => {
                if let (Some(key), Some(value)) = (&entry.key, &entry.value) {
                    if table.data.get(key) != Some(value) {
                        table.data.insert(key.clone(), value.clone());
                        inverted.update(key, value);
                    }
                }
            }
            "DELETE" => {
                if let Some(key) = &entry.key {
                    if table.data.remove(key).is_some() {
                        inverted.remove(key);
                    }
                }
            }
            "BULK_SET" => {
                if let Some(items) = &entry.items {
                    for (key, value) in items {
                        if table.data.get(key) != Some(value) {
                            table.data.insert(key.clone(), value.clone());
                            inverted.update(key, value);
                        }
                    }
                }
            }
            other => log::warn!("unknown WAL op during replay: {other}"),
        }
    }

    fn write_snapshot(&self) -> CResult<()> {
        let inner = self.inner.lock().unwrap();
        self.write_snapshot_locked(&inner)
    }

    /// Writes the snapshot and both indexes using table data already under
    /// the caller's `inner` guard, so it can be called as the last step of a
    /// write without releasing and re-acquiring the lock.
    fn write_snapshot_locked(&self, inner: &Inner) -> CResult<()> {
        let data = serde_json::to_string(&inner.table.data)?;

        let tmp = self.dir.join("snapshot.json.tmp");
        std::fs::write(&tmp, data)?;
        let f = std::fs::File::open(&tmp)?;
        f.sync_all()?;
        std::fs::rename(&tmp, snapshot_path(&self.dir))?;
        self.inverted.save()?;
        self.embedding.save()?;
        Ok(())
    }

    /// `set(k, v, debug)`: WAL append+fsync, table mutation, inverted-index
    /// update, embedding-index update, snapshot rewrite, return — in that
    /// order, all under one held `inner` guard so a concurrent writer to the
    /// same key can't interleave between steps. Never fails outside of I/O
    /// errors even when `debug` is set; `debug` only randomly skips step 5.
    /// `get` takes the same guard, so a read blocks behind a concurrent
    /// write's full pipeline including the embedding encode and the
    /// snapshot fsync — matching `server/store.py`'s single `RLock`, which
    /// `get` also acquires.
    pub fn set(&self, key: String, value: String, debug: bool) -> CResult<SetResult> {
        if key.is_empty() {
            return Err(crate::error::Error::Value("key must not be empty".into()));
        }

        let mut inner = self.inner.lock().unwrap();

        let seq = self.wal.append(WalOp::Set {
            key: key.clone(),
            value: value.clone(),
        })?;

        inner.table.data.insert(key.clone(), value.clone());
        self.inverted.update(&key, &value);
        self.embedding.update(&key, &value);

        if !(debug && rand::random::<f64>() < self.debug_failure_rate) {
            self.write_snapshot_locked(&inner)?;
        }

        Ok(SetResult { success: true, seq })
    }

    pub fn get(&self, key: &str) -> GetResult {
        let inner = self.inner.lock().unwrap();
        match inner.table.data.get(key) {
            Some(value) => GetResult {
                success: true,
                value: Some(value.clone()),
            },
            None => GetResult {
                success: false,
                value: None,
            },
        }
    }

    pub fn delete(&self, key: &str) -> CResult<DeleteResult> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.table.data.contains_key(key) {
            return Ok(DeleteResult {
                success: false,
                seq: None,
            });
        }

        let seq = self.wal.append(WalOp::Delete { key: key.to_string() })?;

        inner.table.data.remove(key);
        self.inverted.remove(key);
        self.embedding.remove(key);
        self.write_snapshot_locked(&inner)?;

        Ok(DeleteResult {
            success: true,
            seq: Some(seq),
        })
    }

    /// `bulk_set(items)`: one WAL entry for the whole batch (atomic by
    /// virtue of the WAL's single write+fsync), then applies each item in
    /// order to the table and both indexes before the single snapshot
    /// rewrite.
    pub fn bulk_set(&self, items: Vec<(String, String)>, debug: bool) -> CResult<BulkSetResult> {
        let count = items.len();
        let mut inner = self.inner.lock().unwrap();

        let seq = self.wal.append_bulk(items.clone())?;

        for (key, value) in &items {
            inner.table.data.insert(key.clone(), value.clone());
            self.inverted.update(key, value);
            self.embedding.update(key, value);
        }

        if !(debug && rand::random::<f64>() < self.debug_failure_rate) {
            self.write_snapshot_locked(&inner)?;
        }

        Ok(BulkSetResult {
            success: true,
            seq,
            count,
        })
    }

    pub fn search_text(&self, query: &str, mode: SearchMode) -> Vec<String> {
        self.inverted.search(query, mode)
    }

    pub fn search_similar(&self, query: &str, top_k: usize) -> Vec<(String, f32)> {
        self.embedding.search(query, top_k)
    }

    pub fn get_stats(&self) -> CResult<Stats> {
        let inner = self.inner.lock().unwrap();
        Ok(Stats {
            keys: inner.table.data.len(),
            wal_size: self.wal.size()?,
        })
    }

    /// Applies a raw op blindly to the local store without going through
    /// the WAL, for cluster followers applying a `replicate` message. The
    /// op is still durable-first at the origin node; a follower re-derives
    /// the same table/index state without re-journaling it locally.
    pub fn apply_replicated(&self, op: WalOp) -> CResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match op {
            WalOp::Set { key, value } => {
                inner.table.data.insert(key.clone(), value.clone());
                self.inverted.update(&key, &value);
                self.embedding.update(&key, &value);
            }
            WalOp::Delete { key } => {
                inner.table.data.remove(&key);
                self.inverted.remove(&key);
                self.embedding.remove(&key);
            }
            WalOp::BulkSet { items } => {
                for (key, value) in &items {
                    inner.table.data.insert(key.clone(), value.clone());
                    self.inverted.update(key, value);
                    self.embedding.update(key, value);
                }
            }
        }
        self.write_snapshot_locked(&inner)
    }

    /// Starts the background snapshot worker: every `SNAPSHOT_INTERVAL`,
    /// rewrites the snapshot and both indexes, then truncates the WAL.
    /// Idempotent under crash: replay after a truncation failure just
    /// re-applies entries already reflected in the snapshot.
    pub fn start_snapshot_worker(self: &Arc<Self>) {
        let mut guard = self.snapshot_worker.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_clone = stop.clone();
        let store = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            while !stop_clone.load(std::sync::atomic::Ordering::Relaxed) {
                std::thread::sleep(SNAPSHOT_INTERVAL);
                if stop_clone.load(std::sync::atomic::Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = store.snapshot_tick() {
                    log::error!("snapshot tick failed: {e}");
                }
            }
        });
        *guard = Some((stop, handle));
    }

    fn snapshot_tick(&self) -> CResult<()> {
        self.write_snapshot()?;
        self.wal.clear()?;
        Ok(())
    }

    /// Signals the snapshot worker to stop, forces one final snapshot tick,
    /// then joins the worker thread. Best-effort: a crash mid-shutdown
    /// still leaves the WAL as the durable source of truth.
    pub fn shutdown(&self) -> CResult<()> {
        if let Some((stop, handle)) = self.snapshot_worker.lock().unwrap().take() {
            stop.store(true, std::sync::atomic::Ordering::Relaxed);
            let _ = handle.join();
        }
        self.write_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn set_get_delete_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = KVStore::open(dir.path()).unwrap();

        let set = store.set("a".into(), "hello world".into(), false).unwrap();
        assert!(set.success);

        let got = store.get("a");
        assert_eq!(got.value.as_deref(), Some("hello world"));

        let del = store.delete("a").unwrap();
        assert!(del.success);
        assert!(!store.get("a").success);

        let missing = store.delete("a").unwrap();
        assert!(!missing.success);
    }

    #[test]
    fn bulk_set_is_atomic_in_one_wal_entry() {
        let dir = TempDir::new().unwrap();
        let store = KVStore::open(dir.path()).unwrap();

        let res = store
            .bulk_set(vec![("a".into(), "1".into()), ("b".into(), "2".into())], false)
            .unwrap();
        assert_eq!(res.count, 2);
        assert_eq!(store.get("a").value.as_deref(), Some("1"));
        assert_eq!(store.get("b").value.as_deref(), Some("2"));
    }

    #[test]
    fn recovers_from_wal_after_reopen_without_clean_snapshot() {
        let dir = TempDir::new().unwrap();
        {
            let store = KVStore::open(dir.path()).unwrap();
            store.set("a".into(), "1".into(), false).unwrap();
            store.set("b".into(), "2".into(), false).unwrap();
            // simulate a crash: don't call shutdown, the worker never ran.
        }

        let store = KVStore::open(dir.path()).unwrap();
        assert_eq!(store.get("a").value.as_deref(), Some("1"));
        assert_eq!(store.get("b").value.as_deref(), Some("2"));
    }

    #[test]
    fn search_text_reflects_sets() {
        let dir = TempDir::new().unwrap();
        let store = KVStore::open(dir.path()).unwrap();
        store.set("doc1".into(), "hello world".into(), false).unwrap();
        store.set("doc2".into(), "hello rust".into(), false).unwrap();

        let mut results = store.search_text("hello", SearchMode::Or);
        results.sort();
        assert_eq!(results, vec!["doc1".to_string(), "doc2".to_string()]);
    }

    #[test]
    fn search_similar_returns_ranked_keys() {
        let dir = TempDir::new().unwrap();
        let store = KVStore::open(dir.path()).unwrap();
        store.set("a".into(), "the quick brown fox".into(), false).unwrap();
        store.set("b".into(), "totally unrelated banana".into(), false).unwrap();

        let results = store.search_similar("quick fox", 1);
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn snapshot_tick_truncates_wal() {
        let dir = TempDir::new().unwrap();
        let store = KVStore::open(dir.path()).unwrap();
        store.set("a".into(), "1".into(), false).unwrap();
        assert!(store.wal.size().unwrap() > 0);

        store.snapshot_tick().unwrap();
        assert_eq!(store.wal.size().unwrap(), 0);

        // state survives even though the WAL is now empty, since the
        // snapshot already reflects it.
        drop(store);
        let store = KVStore::open(dir.path()).unwrap();
        assert_eq!(store.get("a").value.as_deref(), Some("1"));
    }

    #[test]
    fn empty_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = KVStore::open(dir.path()).unwrap();
        assert!(store.set("".into(), "v".into(), false).is_err());
    }

    /// Concurrent writers to the same key must not interleave the
    /// WAL-append/table/index steps: whichever value the table ends up
    /// with must be the same value the WAL's last entry for that key
    /// names, and the inverted index must agree with the table.
    #[test]
    fn concurrent_writes_to_same_key_stay_coherent() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KVStore::open(dir.path()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        store.set("k".into(), format!("value-{i}"), false).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let final_value = store.get("k").value.unwrap();

        let last_in_wal = store
            .wal
            .replay()
            .unwrap()
            .into_iter()
            .rfind(|e| e.key.as_deref() == Some("k"))
            .and_then(|e| e.value)
            .unwrap();
        assert_eq!(final_value, last_in_wal);

        let hits = store.search_text(&final_value, SearchMode::Or);
        assert_eq!(hits, vec!["k".to_string()]);
    }
}
