#![allow(dead_code)]

use std::path::Path;
use std::process::{Child, Command};
use std::time::Duration;

/// Spawns `bin` with `args`, waiting (via polling `/health`) until it
/// answers or panicking after a few seconds.
pub fn spawn_and_wait(bin: &str, args: &[&str], port: u16) -> Child {
    let child = Command::new(bin).args(args).spawn().expect("spawn server binary");
    wait_ready(port);
    child
}

/// Like `spawn_and_wait`, but runs `bin` with its working directory set to
/// `dir` — used for the cluster/masterless binaries, which derive their
/// data directory from `--node-id` rather than taking a `--data-dir` flag.
pub fn spawn_in_dir_and_wait(bin: &str, args: &[&str], dir: &Path, port: u16) -> Child {
    let child = Command::new(bin).args(args).current_dir(dir).spawn().expect("spawn server binary");
    wait_ready(port);
    child
}

pub fn wait_ready(port: u16) {
    let client = reqwest::blocking::Client::new();
    for _ in 0..100 {
        if client
            .get(format!("http://127.0.0.1:{port}/health"))
            .timeout(Duration::from_millis(200))
            .send()
            .is_ok()
        {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("server on port {port} never became ready");
}

pub fn sigkill(child: &mut Child) {
    let _ = Command::new("kill").arg("-9").arg(child.id().to_string()).status();
    let _ = child.wait();
}

pub fn sigterm_and_wait(child: &mut Child) {
    let _ = Command::new("kill").arg("-TERM").arg(child.id().to_string()).status();
    let _ = child.wait();
}

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
