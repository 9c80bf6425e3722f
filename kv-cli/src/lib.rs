//! HTTP surface and cluster replication for the kv store. [Author fengyang]
//!
//! Three binaries share this crate: `kv-server` (single node), `kv-cluster`
//! (primary election + replication), `kv-masterless` (vector-clock LWW
//! replication). Each wraps a `kv::store::KVStore` behind an axum router.

pub mod error;
pub mod http;
pub mod trace;
pub mod cluster;
