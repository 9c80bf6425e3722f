//! Single-node HTTP server: no election, no replication. Grounded on
//! `original_source/server/run_server.py` + `server/app.py`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use log::info;
use serde_json::{json, Value};

use kv::inverted_index::SearchMode;
use kv::store::KVStore;

use kv_cli::error::CResult;
use kv_cli::http::{self, Backend, BulkSetResponse, DeleteResponse, GetResponse, SetResponse};
use kv_cli::trace;

#[derive(Debug, Parser)]
#[command(author, version, about = "Single-node kv HTTP server")]
struct Args {
    #[clap(long, default_value = "0.0.0.0")]
    host: String,

    #[clap(long, default_value_t = 5000)]
    port: u16,

    #[clap(long = "data-dir", default_value = "data")]
    data_dir: String,

    /// Run with verbose (debug-level) logging, mirroring Flask's debug mode
    /// in the original server driver.
    #[clap(long)]
    debug: bool,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,
}

struct SingleNode {
    store: Arc<KVStore>,
}

#[async_trait]
impl Backend for SingleNode {
    async fn set(&self, key: String, value: String, debug: bool) -> CResult<SetResponse> {
        let r = self.store.set(key, value, debug)?;
        Ok(SetResponse { success: r.success, seq: r.seq })
    }

    async fn get(&self, key: String) -> CResult<GetResponse> {
        let r = self.store.get(&key);
        Ok(GetResponse { success: r.success, value: r.value })
    }

    async fn delete(&self, key: String) -> CResult<DeleteResponse> {
        let r = self.store.delete(&key)?;
        Ok(DeleteResponse { success: r.success, seq: r.seq })
    }

    async fn bulk_set(&self, items: Vec<(String, String)>, debug: bool) -> CResult<BulkSetResponse> {
        let r = self.store.bulk_set(items, debug)?;
        Ok(BulkSetResponse { success: r.success, seq: r.seq, count: r.count })
    }

    async fn search_text(&self, query: String, mode: SearchMode) -> Vec<String> {
        self.store.search_text(&query, mode)
    }

    async fn search_similar(&self, query: String, top_k: usize) -> Vec<(String, f32)> {
        self.store.search_similar(&query, top_k)
    }

    async fn health(&self) -> Value {
        json!({ "status": "ok" })
    }

    async fn stats(&self) -> CResult<Value> {
        let s = self.store.get_stats()?;
        Ok(json!({ "keys": s.keys, "wal_size": s.wal_size }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_dir = format!("{}/.kvcli", std::env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let log_level = if args.debug { "debug" } else { args.log_level.as_str() };
    let _guards = trace::init_logging(&log_dir, log_level).await?;

    let store = Arc::new(KVStore::open(&args.data_dir)?);
    store.start_snapshot_worker();
    let state = Arc::new(SingleNode { store: store.clone() });

    let app = http::crud_router(state);
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    info!("kv-server listening on {addr}, data dir {}", args.data_dir);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.shutdown()?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
