//! S6 — masterless convergence: two nodes, writes to the same key 100ms
//! apart, both nodes converge to the later (higher-timestamp) value.

mod common;

use std::time::Duration;

use serde_json::json;
use serial_test::serial;
use tempfile::TempDir;

use common::{sigkill, spawn_in_dir_and_wait};

/// Fixed topology ports (matches the binary's hardcoded `ALL_NODES` table),
/// so this test is serialized against any other test binding them.
#[test]
#[serial]
fn s6_masterless_convergence() {
    let dir1 = TempDir::new().unwrap();
    let dir2 = TempDir::new().unwrap();
    let port1 = 6001u16;
    let port2 = 6002u16;
    let bin = env!("CARGO_BIN_EXE_kv-masterless");

    let mut child1 = spawn_in_dir_and_wait(bin, &["--node-id", "1"], dir1.path(), port1);
    let mut child2 = spawn_in_dir_and_wait(bin, &["--node-id", "2"], dir2.path(), port2);

    let c = reqwest::blocking::Client::builder().timeout(Duration::from_secs(5)).build().unwrap();
    let base1 = format!("http://127.0.0.1:{port1}");
    let base2 = format!("http://127.0.0.1:{port2}");

    c.post(format!("{base1}/set")).json(&json!({"key": "k", "value": "A"})).send().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    c.post(format!("{base2}/set")).json(&json!({"key": "k", "value": "B"})).send().unwrap();

    // let replication quiesce.
    std::thread::sleep(Duration::from_millis(500));

    let v1: serde_json::Value = c.get(format!("{base1}/get/k")).send().unwrap().json().unwrap();
    let v2: serde_json::Value = c.get(format!("{base2}/get/k")).send().unwrap().json().unwrap();
    assert_eq!(v1["value"], "B");
    assert_eq!(v2["value"], "B");

    sigkill(&mut child1);
    sigkill(&mut child2);
}
