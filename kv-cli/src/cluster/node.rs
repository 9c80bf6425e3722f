//! Primary-replicated cluster node: wraps a `KVStore` and a
//! `LeaderElection`. Grounded on `original_source/cluster/node.py`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Json, State};
use axum::routing::post;
use axum::Router;
use log::warn;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use kv::inverted_index::SearchMode;
use kv::store::KVStore;
use kv::wal::WalOp;

use crate::cluster::election::LeaderElection;
use crate::error::{CResult, Error};
use crate::http::{self, Backend, BulkSetResponse, DeleteResponse, GetResponse, SetResponse};

const FORWARD_WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const FORWARD_BULK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
const REPLICATE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

pub struct ClusterNode {
    pub node_id: u64,
    pub store: Arc<KVStore>,
    pub election: Arc<LeaderElection>,
    peers: Vec<(u64, String)>,
    client: Client,
}

impl ClusterNode {
    pub fn new(node_id: u64, store: Arc<KVStore>, peers: Vec<(u64, String)>) -> Arc<Self> {
        let election = Arc::new(LeaderElection::new(node_id, peers.clone()));
        Arc::new(Self {
            node_id,
            store,
            election,
            peers,
            client: Client::new(),
        })
    }

    /// Spawns the election monitor loop and kicks off the initial election.
    pub fn start_election(self: &Arc<Self>) {
        let election = self.election.clone();
        tokio::spawn(async move { election.run_monitor().await });
        let election = self.election.clone();
        tokio::spawn(async move { election.start_election().await });
    }

    /// Fire-and-forget fan-out: each peer POST runs on its own spawned task
    /// so the caller's write response never waits on replication.
    fn replicate(&self, op: &str, key: Option<&str>, value: Option<&str>, items: Option<&[(String, String)]>) {
        let mut payload = json!({ "op": op, "key": key, "value": value });
        if let Some(items) = items {
            payload["items"] = json!(items);
        }
        for (_, url) in &self.peers {
            let client = self.client.clone();
            let url = url.clone();
            let payload = payload.clone();
            let node_id = self.node_id;
            tokio::spawn(async move {
                let resp = client
                    .post(format!("{url}/replicate"))
                    .json(&payload)
                    .timeout(REPLICATE_TIMEOUT)
                    .send()
                    .await;
                if resp.is_err() {
                    warn!("[node {node_id}] failed to replicate to {url}");
                }
            });
        }
    }
}

#[async_trait]
impl Backend for ClusterNode {
    async fn set(&self, key: String, value: String, debug: bool) -> CResult<SetResponse> {
        if !self.election.is_leader() {
            let Some(leader_url) = self.election.leader_url() else {
                return Err(Error::NoLeaderAvailable);
            };
            let resp = self
                .client
                .post(format!("{leader_url}/set"))
                .json(&json!({ "key": key, "value": value, "debug": debug }))
                .timeout(FORWARD_WRITE_TIMEOUT)
                .send()
                .await?;
            return Ok(resp.json().await?);
        }

        let r = self.store.set(key.clone(), value.clone(), debug)?;
        self.replicate("SET", Some(&key), Some(&value), None);
        Ok(SetResponse { success: r.success, seq: r.seq })
    }

    async fn get(&self, key: String) -> CResult<GetResponse> {
        if !self.election.is_leader() {
            let Some(leader_url) = self.election.leader_url() else {
                return Err(Error::NoLeaderAvailable);
            };
            let resp = self
                .client
                .get(format!("{leader_url}/get/{key}"))
                .timeout(FORWARD_WRITE_TIMEOUT)
                .send()
                .await?;
            return Ok(resp.json().await?);
        }

        let r = self.store.get(&key);
        Ok(GetResponse { success: r.success, value: r.value })
    }

    async fn delete(&self, key: String) -> CResult<DeleteResponse> {
        if !self.election.is_leader() {
            let Some(leader_url) = self.election.leader_url() else {
                return Err(Error::NoLeaderAvailable);
            };
            let resp = self
                .client
                .delete(format!("{leader_url}/delete/{key}"))
                .timeout(FORWARD_WRITE_TIMEOUT)
                .send()
                .await?;
            return Ok(resp.json().await?);
        }

        let r = self.store.delete(&key)?;
        if r.success {
            self.replicate("DELETE", Some(&key), None, None);
        }
        Ok(DeleteResponse { success: r.success, seq: r.seq })
    }

    async fn bulk_set(&self, items: Vec<(String, String)>, debug: bool) -> CResult<BulkSetResponse> {
        if !self.election.is_leader() {
            let Some(leader_url) = self.election.leader_url() else {
                return Err(Error::NoLeaderAvailable);
            };
            let resp = self
                .client
                .post(format!("{leader_url}/bulkset"))
                .json(&json!({ "items": items, "debug": debug }))
                .timeout(FORWARD_BULK_TIMEOUT)
                .send()
                .await?;
            return Ok(resp.json().await?);
        }

        let r = self.store.bulk_set(items.clone(), debug)?;
        self.replicate("BULK_SET", None, None, Some(&items));
        Ok(BulkSetResponse { success: r.success, seq: r.seq, count: r.count })
    }

    async fn search_text(&self, query: String, mode: SearchMode) -> Vec<String> {
        self.store.search_text(&query, mode)
    }

    async fn search_similar(&self, query: String, top_k: usize) -> Vec<(String, f32)> {
        self.store.search_similar(&query, top_k)
    }

    async fn health(&self) -> Value {
        json!({
            "status": "ok",
            "node_id": self.node_id,
            "is_leader": self.election.is_leader(),
            "leader_id": self.election.leader_id(),
        })
    }

    async fn stats(&self) -> CResult<Value> {
        let s = self.store.get_stats()?;
        Ok(json!({
            "keys": s.keys,
            "wal_size": s.wal_size,
            "node_id": self.node_id,
            "is_leader": self.election.is_leader(),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct ReplicateRequest {
    op: String,
    key: Option<String>,
    value: Option<String>,
    #[serde(default)]
    items: Option<Vec<(String, String)>>,
}

#[derive(Debug, Deserialize)]
struct ElectionMessage {
    from: u64,
}

#[derive(Debug, Deserialize)]
struct CoordinatorMessage {
    leader_id: u64,
}

#[derive(Debug, Deserialize)]
struct HeartbeatMessage {
    leader_id: u64,
}

async fn handle_replicate(State(node): State<Arc<ClusterNode>>, Json(req): Json<ReplicateRequest>) -> CResult<Json<Value>> {
    let op = match req.op.as_str() {
        "SET" => WalOp::Set {
            key: req.key.ok_or_else(|| Error::Store(kv::Error::Value("missing key".into())))?,
            value: req.value.ok_or_else(|| Error::Store(kv::Error::Value("missing value".into())))?,
        },
        "DELETE" => WalOp::Delete {
            key: req.key.ok_or_else(|| Error::Store(kv::Error::Value("missing key".into())))?,
        },
        "BULK_SET" => WalOp::BulkSet {
            items: req.items.ok_or_else(|| Error::Store(kv::Error::Value("missing items".into())))?,
        },
        other => return Err(Error::Store(kv::Error::Value(format!("unknown op {other}")))),
    };
    node.store.apply_replicated(op)?;
    Ok(Json(json!({ "success": true })))
}

async fn handle_election(State(node): State<Arc<ClusterNode>>, Json(req): Json<ElectionMessage>) -> Json<Value> {
    node.election.receive_election(req.from);
    Json(json!({ "success": true }))
}

async fn handle_coordinator(State(node): State<Arc<ClusterNode>>, Json(req): Json<CoordinatorMessage>) -> Json<Value> {
    node.election.receive_coordinator(req.leader_id);
    Json(json!({ "success": true }))
}

async fn handle_heartbeat(State(node): State<Arc<ClusterNode>>, Json(req): Json<HeartbeatMessage>) -> Json<Value> {
    node.election.receive_heartbeat(req.leader_id);
    Json(json!({ "success": true }))
}

/// Full router for a primary-replicated node: CRUD/search/health/stats
/// (via `Backend`) plus the cluster-only election/replication endpoints.
pub fn router(node: Arc<ClusterNode>) -> Router {
    let crud = http::crud_router(node.clone());
    let cluster = Router::new()
        .route("/replicate", post(handle_replicate))
        .route("/election", post(handle_election))
        .route("/coordinator", post(handle_coordinator))
        .route("/heartbeat", post(handle_heartbeat))
        .with_state(node);
    crud.merge(cluster)
}
