//! HTTP/JSON surface shared by all three binaries. Endpoint shapes are
//! grounded on `original_source/server/app.py` + `cluster/node.py` +
//! `cluster/masterless.py`; the single-node behavior (no forwarding, no
//! replication) is the `Backend` impl in `kv_server.rs`, while
//! `cluster::node`/`cluster::masterless` layer forwarding and replication
//! on top of the same trait.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use kv::inverted_index::SearchMode;

use crate::error::{CResult, Error};

#[derive(Debug, Deserialize)]
pub struct SetRequest {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetResponse {
    pub success: bool,
    pub seq: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetResponse {
    pub success: bool,
    pub value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub seq: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct BulkSetRequest {
    pub items: Vec<(String, String)>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkSetResponse {
    pub success: bool,
    pub seq: u64,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct SearchTextRequest {
    pub query: String,
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_mode() -> String {
    "AND".to_string()
}

#[derive(Debug, Serialize)]
pub struct SearchTextResponse {
    pub success: bool,
    pub keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchSimilarRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Serialize)]
pub struct SearchSimilarResponse {
    pub success: bool,
    pub results: Vec<(String, f32)>,
}

/// Every HTTP-facing node shape (single node, primary-replicated cluster
/// node, masterless node) implements this; the routing table below is
/// generic over it so the forwarding/replication policy lives entirely in
/// the impl, not in the router.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn set(&self, key: String, value: String, debug: bool) -> CResult<SetResponse>;
    async fn get(&self, key: String) -> CResult<GetResponse>;
    async fn delete(&self, key: String) -> CResult<DeleteResponse>;
    async fn bulk_set(&self, items: Vec<(String, String)>, debug: bool) -> CResult<BulkSetResponse>;
    async fn search_text(&self, query: String, mode: SearchMode) -> Vec<String>;
    async fn search_similar(&self, query: String, top_k: usize) -> Vec<(String, f32)>;
    async fn health(&self) -> Value;
    async fn stats(&self) -> CResult<Value>;
}

async fn handle_set<B: Backend>(State(state): State<Arc<B>>, Json(req): Json<SetRequest>) -> CResult<Json<SetResponse>> {
    Ok(Json(state.set(req.key, req.value, req.debug).await?))
}

async fn handle_get<B: Backend>(State(state): State<Arc<B>>, Path(key): Path<String>) -> CResult<Json<GetResponse>> {
    let result = state.get(key).await?;
    if result.success {
        Ok(Json(result))
    } else {
        Err(Error::NotFound)
    }
}

async fn handle_delete<B: Backend>(State(state): State<Arc<B>>, Path(key): Path<String>) -> CResult<Json<DeleteResponse>> {
    let result = state.delete(key).await?;
    if result.success {
        Ok(Json(result))
    } else {
        Err(Error::NotFound)
    }
}

async fn handle_bulk_set<B: Backend>(
    State(state): State<Arc<B>>,
    Json(req): Json<BulkSetRequest>,
) -> CResult<Json<BulkSetResponse>> {
    Ok(Json(state.bulk_set(req.items, req.debug).await?))
}

async fn handle_search_text<B: Backend>(
    State(state): State<Arc<B>>,
    Json(req): Json<SearchTextRequest>,
) -> Json<SearchTextResponse> {
    let mode = SearchMode::parse(&req.mode);
    let keys = state.search_text(req.query, mode).await;
    Json(SearchTextResponse { success: true, keys })
}

async fn handle_search_similar<B: Backend>(
    State(state): State<Arc<B>>,
    Json(req): Json<SearchSimilarRequest>,
) -> Json<SearchSimilarResponse> {
    let results = state.search_similar(req.query, req.top_k).await;
    Json(SearchSimilarResponse { success: true, results })
}

async fn handle_health<B: Backend>(State(state): State<Arc<B>>) -> Json<Value> {
    Json(state.health().await)
}

async fn handle_stats<B: Backend>(State(state): State<Arc<B>>) -> CResult<Json<Value>> {
    Ok(Json(state.stats().await?))
}

/// The CRUD + search + health/stats surface every node exposes, per
/// spec.md §6. Cluster binaries `.merge()` their own election/replication
/// routes onto this with the same `Arc<B>` state.
pub fn crud_router<B: Backend>(state: Arc<B>) -> Router {
    Router::new()
        .route("/set", post(handle_set::<B>))
        .route("/get/:key", get(handle_get::<B>))
        .route("/delete/:key", delete(handle_delete::<B>))
        .route("/bulkset", post(handle_bulk_set::<B>))
        .route("/search/text", post(handle_search_text::<B>))
        .route("/search/similar", post(handle_search_similar::<B>))
        .route("/health", get(handle_health::<B>))
        .route("/stats", get(handle_stats::<B>))
        .with_state(state)
}

pub fn not_found_body(msg: &str) -> Json<Value> {
    Json(json!({ "success": false, "error": msg }))
}
