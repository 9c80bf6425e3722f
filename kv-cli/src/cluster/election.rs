//! Leader election via the Bully algorithm. Grounded on
//! `original_source/cluster/election.py`: deliberately preserves its
//! sequential short-circuit send to higher peers (stop at the first OK)
//! rather than a parallel broadcast-and-collect, since that's a documented
//! behavior of the system being modeled, not an oversight.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::info;
use reqwest::Client;
use serde_json::json;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
pub const LEADER_TIMEOUT: Duration = Duration::from_secs(5);
const ELECTION_ROUND_TIMEOUT: Duration = Duration::from_secs(2);
const HEARTBEAT_SEND_TIMEOUT: Duration = Duration::from_secs(1);
const MONITOR_TICK: Duration = Duration::from_secs(1);

struct State {
    leader_id: Option<u64>,
    is_leader: bool,
    election_in_progress: bool,
    last_heartbeat: Instant,
}

/// One node's view of the cluster's leadership state. `peers` is this
/// node's id plus every other node's `(id, base_url)`, base_url without a
/// trailing slash.
pub struct LeaderElection {
    node_id: u64,
    peers: Vec<(u64, String)>,
    client: Client,
    state: Mutex<State>,
}

impl LeaderElection {
    pub fn new(node_id: u64, peers: Vec<(u64, String)>) -> Self {
        Self {
            node_id,
            peers,
            client: Client::new(),
            state: Mutex::new(State {
                leader_id: None,
                is_leader: false,
                election_in_progress: false,
                last_heartbeat: Instant::now(),
            }),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().unwrap().is_leader
    }

    pub fn leader_id(&self) -> Option<u64> {
        self.state.lock().unwrap().leader_id
    }

    /// The current leader's base URL, or `None` if we are the leader or no
    /// leader is known yet.
    pub fn leader_url(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        if state.is_leader {
            return None;
        }
        let leader_id = state.leader_id?;
        self.peers.iter().find(|(id, _)| *id == leader_id).map(|(_, url)| url.clone())
    }

    /// Runs the once-a-second monitor loop forever: leaders broadcast
    /// heartbeats, followers watch for leader timeout. Meant to be spawned
    /// as its own task.
    pub async fn run_monitor(&self) {
        loop {
            tokio::time::sleep(MONITOR_TICK).await;
            let (is_leader, timed_out) = {
                let state = self.state.lock().unwrap();
                (state.is_leader, state.last_heartbeat.elapsed() > LEADER_TIMEOUT)
            };
            if is_leader {
                self.send_heartbeats().await;
            } else if timed_out {
                info!("[node {}] leader timeout, starting election", self.node_id);
                self.start_election().await;
            }
        }
    }

    /// Starts an election: sends `election` to every higher-id peer,
    /// stopping at the first OK response. If none respond, declares self
    /// leader and broadcasts `coordinator`.
    pub async fn start_election(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.election_in_progress {
                return;
            }
            state.election_in_progress = true;
        }

        info!("[node {}] starting election", self.node_id);

        let higher: Vec<&(u64, String)> = self.peers.iter().filter(|(id, _)| *id > self.node_id).collect();
        if higher.is_empty() {
            self.become_leader().await;
            return;
        }

        let mut got_response = false;
        for (_, url) in higher {
            let resp = self
                .client
                .post(format!("{url}/election"))
                .json(&json!({ "from": self.node_id }))
                .timeout(ELECTION_ROUND_TIMEOUT)
                .send()
                .await;
            if matches!(resp, Ok(r) if r.status().is_success()) {
                got_response = true;
                break;
            }
        }

        if got_response {
            self.state.lock().unwrap().election_in_progress = false;
        } else {
            self.become_leader().await;
        }
    }

    async fn become_leader(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.is_leader = true;
            state.leader_id = Some(self.node_id);
            state.election_in_progress = false;
        }
        info!("[node {}] became leader", self.node_id);

        for (_, url) in &self.peers {
            let _ = self
                .client
                .post(format!("{url}/coordinator"))
                .json(&json!({ "leader_id": self.node_id }))
                .timeout(ELECTION_ROUND_TIMEOUT)
                .send()
                .await;
        }
    }

    async fn send_heartbeats(&self) {
        for (_, url) in &self.peers {
            let _ = self
                .client
                .post(format!("{url}/heartbeat"))
                .json(&json!({ "leader_id": self.node_id }))
                .timeout(HEARTBEAT_SEND_TIMEOUT)
                .send()
                .await;
        }
    }

    /// Handles an inbound `election` message: acknowledges, and
    /// asynchronously starts our own election if one isn't already running
    /// (pushes the contest back toward higher ids).
    pub fn receive_election(self: &std::sync::Arc<Self>, from: u64) {
        info!("[node {}] received election from {from}", self.node_id);
        let already_running = self.state.lock().unwrap().election_in_progress;
        if !already_running {
            let this = self.clone();
            tokio::spawn(async move { this.start_election().await });
        }
    }

    pub fn receive_coordinator(&self, leader_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.leader_id = Some(leader_id);
        state.is_leader = leader_id == self.node_id;
        state.election_in_progress = false;
        state.last_heartbeat = Instant::now();
        info!("[node {}] new leader is {leader_id}", self.node_id);
    }

    pub fn receive_heartbeat(&self, from_leader: u64) {
        let mut state = self.state.lock().unwrap();
        if state.leader_id == Some(from_leader) {
            state.last_heartbeat = Instant::now();
        }
    }
}
