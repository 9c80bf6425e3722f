//! S1 (set/get/delete), S2 (persistence across graceful restart), S3
//! (durability across SIGKILL), S4 (bulk atomicity under SIGKILL), against
//! a real `kv-server` process.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use common::{free_port, sigkill, sigterm_and_wait, spawn_and_wait};

fn client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder().timeout(Duration::from_secs(5)).build().unwrap()
}

#[test]
fn s1_set_get_delete() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let bin = env!("CARGO_BIN_EXE_kv-server");
    let mut child = spawn_and_wait(
        bin,
        &["--port", &port.to_string(), "--data-dir", dir.path().to_str().unwrap()],
        port,
    );

    let c = client();
    let base = format!("http://127.0.0.1:{port}");

    let set: serde_json::Value = c.post(format!("{base}/set")).json(&json!({"key": "k", "value": "v"})).send().unwrap().json().unwrap();
    assert_eq!(set["success"], true);

    let get: serde_json::Value = c.get(format!("{base}/get/k")).send().unwrap().json().unwrap();
    assert_eq!(get["value"], "v");

    let del = c.delete(format!("{base}/delete/k")).send().unwrap();
    assert_eq!(del.status(), 200);

    let missing = c.get(format!("{base}/get/k")).send().unwrap();
    assert_eq!(missing.status(), 404);

    sigkill(&mut child);
}

#[test]
fn s2_persists_across_graceful_restart() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().to_str().unwrap().to_string();
    let port = free_port();
    let bin = env!("CARGO_BIN_EXE_kv-server");

    let mut child = spawn_and_wait(bin, &["--port", &port.to_string(), "--data-dir", &data_dir], port);
    let c = client();
    let base = format!("http://127.0.0.1:{port}");
    c.post(format!("{base}/set"))
        .json(&json!({"key": "persist_key", "value": "persist_value"}))
        .send()
        .unwrap();

    sigterm_and_wait(&mut child);

    let port2 = free_port();
    let mut child2 = spawn_and_wait(bin, &["--port", &port2.to_string(), "--data-dir", &data_dir], port2);
    let base2 = format!("http://127.0.0.1:{port2}");
    let get: serde_json::Value = c.get(format!("{base2}/get/persist_key")).send().unwrap().json().unwrap();
    assert_eq!(get["value"], "persist_value");

    sigkill(&mut child2);
}

#[test]
fn s3_durable_across_sigkill() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().to_str().unwrap().to_string();
    let port = free_port();
    let bin = env!("CARGO_BIN_EXE_kv-server");

    let mut child = spawn_and_wait(bin, &["--port", &port.to_string(), "--data-dir", &data_dir], port);
    let c = client();
    let base = format!("http://127.0.0.1:{port}");

    let mut expected = HashMap::new();
    for i in 0..20 {
        let key = format!("durability_key_{i}");
        let value = format!("durability_value_{i}");
        let resp: serde_json::Value = c.post(format!("{base}/set")).json(&json!({"key": key, "value": value})).send().unwrap().json().unwrap();
        assert_eq!(resp["success"], true);
        expected.insert(key, value);
    }

    sigkill(&mut child);

    let port2 = free_port();
    let mut child2 = spawn_and_wait(bin, &["--port", &port2.to_string(), "--data-dir", &data_dir], port2);
    let base2 = format!("http://127.0.0.1:{port2}");
    for (key, value) in expected {
        let resp: serde_json::Value = c.get(format!("{base2}/get/{key}")).send().unwrap().json().unwrap();
        assert_eq!(resp["value"], value);
    }

    sigkill(&mut child2);
}

#[test]
fn s4_bulk_atomic_under_sigkill() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().to_str().unwrap().to_string();
    let port = free_port();
    let bin = env!("CARGO_BIN_EXE_kv-server");

    let mut child = spawn_and_wait(bin, &["--port", &port.to_string(), "--data-dir", &data_dir], port);
    let c = client();
    let base = format!("http://127.0.0.1:{port}");

    let items: Vec<(String, String)> = (0..10).map(|i| (format!("atomic_key_{i}"), format!("atomic_value_{i}"))).collect();
    let resp: serde_json::Value = c.post(format!("{base}/bulkset")).json(&json!({"items": items})).send().unwrap().json().unwrap();
    assert_eq!(resp["success"], true);

    sigkill(&mut child);

    let port2 = free_port();
    let mut child2 = spawn_and_wait(bin, &["--port", &port2.to_string(), "--data-dir", &data_dir], port2);
    let base2 = format!("http://127.0.0.1:{port2}");
    for (key, value) in items {
        let resp: serde_json::Value = c.get(format!("{base2}/get/{key}")).send().unwrap().json().unwrap();
        assert_eq!(resp["value"], value);
    }

    sigkill(&mut child2);
}
