//! Masterless (multi-master) replication with vector-clock last-write-wins.
//! Grounded on `original_source/cluster/masterless.py`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::extract::{Json, State};
use axum::routing::post;
use axum::Router;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use kv::inverted_index::SearchMode;
use kv::store::KVStore;

use crate::error::CResult;
use crate::http::{self, Backend, BulkSetResponse, DeleteResponse, GetResponse, SetResponse};

const REPLICATE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

type VectorClock = HashMap<u64, f64>;

fn now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn clock_max(clock: &VectorClock) -> f64 {
    clock.values().cloned().fold(0.0, f64::max)
}

pub struct MasterlessNode {
    pub node_id: u64,
    pub store: Arc<KVStore>,
    peers: Vec<(u64, String)>,
    client: Client,
    clocks: Mutex<HashMap<String, VectorClock>>,
}

impl MasterlessNode {
    pub fn new(node_id: u64, store: Arc<KVStore>, peers: Vec<(u64, String)>) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            store,
            peers,
            client: Client::new(),
            clocks: Mutex::new(HashMap::new()),
        })
    }

    /// Bumps this node's entry in `key`'s vector clock to now and returns a
    /// snapshot of the full clock to ship with the replicate message.
    fn update_clock(&self, key: &str) -> VectorClock {
        let mut clocks = self.clocks.lock().unwrap();
        let clock = clocks.entry(key.to_string()).or_default();
        clock.insert(self.node_id, now());
        clock.clone()
    }

    /// Compares `remote_clock`'s max timestamp against the local clock for
    /// `key`; if remote wins, merges clocks by per-node max and returns
    /// `true` (apply the op), else returns `false` (local wins, drop).
    fn merge_clock(&self, key: &str, remote_clock: &VectorClock) -> bool {
        let mut clocks = self.clocks.lock().unwrap();
        let Some(local) = clocks.get_mut(key) else {
            clocks.insert(key.to_string(), remote_clock.clone());
            return true;
        };

        let local_max = clock_max(local);
        let remote_max = clock_max(remote_clock);
        if remote_max > local_max {
            for (nid, ts) in remote_clock {
                let entry = local.entry(*nid).or_insert(0.0);
                if ts > entry {
                    *entry = *ts;
                }
            }
            true
        } else {
            false
        }
    }

    /// Fire-and-forget fan-out: each peer POST runs on its own spawned task
    /// so the caller's write response never waits on replication.
    fn replicate(&self, op: &str, key: Option<&str>, value: Option<&str>, clock: &VectorClock, items: Option<&[(String, String)]>) {
        let mut payload = json!({ "op": op, "key": key, "value": value, "clock": clock });
        if let Some(items) = items {
            payload["items"] = json!(items);
        }
        for (_, url) in &self.peers {
            let client = self.client.clone();
            let url = url.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                let _ = client
                    .post(format!("{url}/replicate"))
                    .json(&payload)
                    .timeout(REPLICATE_TIMEOUT)
                    .send()
                    .await;
            });
        }
    }
}

#[async_trait]
impl Backend for MasterlessNode {
    async fn set(&self, key: String, value: String, debug: bool) -> CResult<SetResponse> {
        let r = self.store.set(key.clone(), value.clone(), debug)?;
        let clock = self.update_clock(&key);
        if r.success {
            self.replicate("SET", Some(&key), Some(&value), &clock, None);
        }
        Ok(SetResponse { success: r.success, seq: r.seq })
    }

    async fn get(&self, key: String) -> CResult<GetResponse> {
        let r = self.store.get(&key);
        Ok(GetResponse { success: r.success, value: r.value })
    }

    async fn delete(&self, key: String) -> CResult<DeleteResponse> {
        let r = self.store.delete(&key)?;
        let clock = self.update_clock(&key);
        if r.success {
            self.replicate("DELETE", Some(&key), None, &clock, None);
        }
        Ok(DeleteResponse { success: r.success, seq: r.seq })
    }

    async fn bulk_set(&self, items: Vec<(String, String)>, debug: bool) -> CResult<BulkSetResponse> {
        let r = self.store.bulk_set(items.clone(), debug)?;
        if r.success {
            // Each key gets its own clock bump; the merged "clocks" payload
            // carries the last-updated key's clock, matching the original's
            // (somewhat loose) per-batch clock field.
            let mut last_clock = VectorClock::new();
            for (key, _) in &items {
                last_clock = self.update_clock(key);
            }
            self.replicate("BULK_SET", None, None, &last_clock, Some(&items));
        }
        Ok(BulkSetResponse { success: r.success, seq: r.seq, count: r.count })
    }

    async fn search_text(&self, query: String, mode: SearchMode) -> Vec<String> {
        self.store.search_text(&query, mode)
    }

    async fn search_similar(&self, query: String, top_k: usize) -> Vec<(String, f32)> {
        self.store.search_similar(&query, top_k)
    }

    async fn health(&self) -> Value {
        json!({ "status": "ok", "node_id": self.node_id })
    }

    async fn stats(&self) -> CResult<Value> {
        let s = self.store.get_stats()?;
        Ok(json!({ "keys": s.keys, "wal_size": s.wal_size, "node_id": self.node_id }))
    }
}

#[derive(Debug, Deserialize)]
struct ReplicateRequest {
    op: String,
    key: Option<String>,
    value: Option<String>,
    #[serde(default)]
    clock: VectorClock,
    #[serde(default)]
    items: Option<Vec<(String, String)>>,
}

async fn handle_replicate(State(node): State<Arc<MasterlessNode>>, Json(req): Json<ReplicateRequest>) -> Json<Value> {
    match req.op.as_str() {
        "SET" => {
            if let Some(key) = req.key {
                if node.merge_clock(&key, &req.clock) {
                    if let Some(value) = req.value {
                        let _ = node.store.set(key, value, false);
                    }
                }
            }
        }
        "DELETE" => {
            if let Some(key) = req.key {
                if node.merge_clock(&key, &req.clock) {
                    let _ = node.store.delete(&key);
                }
            }
        }
        "BULK_SET" => {
            if let Some(items) = req.items {
                for (key, value) in items {
                    if node.merge_clock(&key, &req.clock) {
                        let _ = node.store.set(key, value, false);
                    }
                }
            }
        }
        _ => {}
    }
    Json(json!({ "success": true }))
}

/// Full router for a masterless node: CRUD/search/health/stats plus the
/// masterless-flavored `/replicate` endpoint.
pub fn router(node: Arc<MasterlessNode>) -> Router {
    let crud = http::crud_router(node.clone());
    let cluster = Router::new().route("/replicate", post(handle_replicate)).with_state(node);
    crud.merge(cluster)
}
