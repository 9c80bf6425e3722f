//! `kv` is the durable single-node storage core of a replicated key-value
//! store: a write-ahead log, an in-memory table, a periodic snapshot, and
//! the two secondary indexes (inverted text, semantic embedding) kept
//! coherent with it. [Author fengyang]
//!
//! ## Getting started
//!
//! ```rust
//! use tempfile::TempDir;
//! use kv::store::KVStore;
//!
//! let dir = TempDir::new().unwrap();
//! let mut store = KVStore::open(dir.path()).unwrap();
//!
//! let set = store.set("a".into(), "hello world".into(), false).unwrap();
//! assert!(set.success);
//!
//! let got = store.get("a");
//! assert_eq!(got.value.as_deref(), Some("hello world"));
//! ```

pub mod error;
pub mod wal;
pub mod inverted_index;
pub mod embedding_index;
pub mod store;

pub use error::{CResult, Error};
