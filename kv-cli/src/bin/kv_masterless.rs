//! Masterless (multi-master) node binary. Grounded on
//! `original_source/cluster/run_masterless.py`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;

use kv::store::KVStore;
use kv_cli::cluster::masterless::{router, MasterlessNode};
use kv_cli::trace;

/// Fixed 3-node topology, matching `run_masterless.py`'s hardcoded
/// `all_nodes` list. Peers are derived by excluding this node's own id.
const ALL_NODES: [(u64, &str); 3] = [
    (1, "http://localhost:6001"),
    (2, "http://localhost:6002"),
    (3, "http://localhost:6003"),
];

#[derive(Debug, Parser)]
#[command(author, version, about = "Masterless cluster node")]
struct Args {
    /// Node ID (1, 2, or 3).
    #[clap(long = "node-id")]
    node_id: u64,

    /// Port to listen on (default: 6000 + node-id).
    #[clap(long)]
    port: Option<u16>,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_dir = format!("{}/.kvcli", std::env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = trace::init_logging(&log_dir, &args.log_level).await?;

    let port = args.port.unwrap_or(6000 + args.node_id as u16);
    let peers: Vec<(u64, String)> = ALL_NODES
        .iter()
        .filter(|(id, _)| *id != args.node_id)
        .map(|(id, url)| (*id, url.to_string()))
        .collect();
    let data_dir = format!("data_masterless_{}", args.node_id);

    let store = Arc::new(KVStore::open(&data_dir)?);
    store.start_snapshot_worker();

    let node = MasterlessNode::new(args.node_id, store.clone(), peers);

    let app = router(node);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    info!("kv-masterless node {} listening on {addr}", args.node_id);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    store.shutdown()?;
    Ok(())
}
