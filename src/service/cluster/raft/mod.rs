// Copyright 2025 Datapunk Contributors.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Raft consensus over the cluster state machine. Log entries are cluster
//! state mutations; followers become candidates on a randomized election
//! timeout in [150, 300] ms, candidates win on a majority vote, and any
//! higher term observed demotes to follower. The log is persisted through
//! the wal crate unless durability is disabled, in which case a restarted
//! cluster must bootstrap from a quorum again.

mod storage;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use config::{
    cluster::{LOCAL_NODE_UUID, cluster_seeds, local_http_addr},
    get_config,
    meta::{
        cluster::{ClusterState, NodeStatus, RaftRole},
        raft::{
            AppendEntries, AppendEntriesResponse, InstallSnapshot, InstallSnapshotResponse,
            LogCommand, LogEntry, RequestVote, RequestVoteResponse,
        },
    },
    metrics,
    utils::{json, rand::get_rand_num_within},
};
use infra::errors::*;
use parking_lot::RwLock;
use tokio::{sync::OnceCell, time::Instant};

use super::transport::{Envelope, Transport};

pub const MSG_REQUEST_VOTE: &str = "raft.request_vote";
pub const MSG_APPEND_ENTRIES: &str = "raft.append_entries";
pub const MSG_INSTALL_SNAPSHOT: &str = "raft.install_snapshot";

static RAFT: OnceCell<Arc<Raft>> = OnceCell::const_new();

pub async fn init(transport: Arc<dyn Transport>) -> Result<()> {
    let raft = Arc::new(Raft::new(transport)?);
    if RAFT.set(raft).is_err() {
        log::warn!("[RAFT] already initialized");
    }
    Ok(())
}

pub fn get() -> Result<Arc<Raft>> {
    RAFT.get()
        .cloned()
        .ok_or_else(|| Error::Message("raft not initialized".to_string()))
}

struct RaftCore {
    role: RaftRole,
    current_term: u64,
    voted_for: Option<String>,
    leader_id: Option<String>,
    leader_addr: Option<String>,
    /// entries after the snapshot boundary
    log: Vec<LogEntry>,
    snapshot_last_index: u64,
    snapshot_last_term: u64,
    commit_index: u64,
    last_applied: u64,
    /// peer http addresses
    peers: Vec<String>,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    votes: HashSet<String>,
    election_deadline: Instant,
    state: ClusterState,
}

impl RaftCore {
    fn last_log_index(&self) -> u64 {
        self.snapshot_last_index + self.log.len() as u64
    }

    fn last_log_term(&self) -> u64 {
        self.log
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_last_term)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_last_index {
            return Some(self.snapshot_last_term);
        }
        if index < self.snapshot_last_index {
            return None; // compacted away
        }
        self.log
            .get((index - self.snapshot_last_index - 1) as usize)
            .map(|e| e.term)
    }

    fn entries_from(&self, index: u64, limit: usize) -> Vec<LogEntry> {
        if index <= self.snapshot_last_index {
            return Vec::new();
        }
        let offset = (index - self.snapshot_last_index - 1) as usize;
        self.log
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn reset_election_deadline(&mut self) {
        let cfg = get_config();
        let timeout = get_rand_num_within(
            cfg.raft.election_timeout_min,
            cfg.raft.election_timeout_max,
        );
        self.election_deadline = Instant::now() + Duration::from_millis(timeout);
    }
}

pub struct Raft {
    id: String,
    durable: bool,
    core: RwLock<RaftCore>,
    transport: Arc<dyn Transport>,
}

impl Raft {
    fn new(transport: Arc<dyn Transport>) -> Result<Self> {
        let cfg = get_config();
        let durable = cfg.raft.durable;
        if !durable {
            log::warn!(
                "[RAFT] durability disabled, cluster state is memory only and a \
                 restart requires bootstrapping from a quorum"
            );
        }

        let mut core = RaftCore {
            role: RaftRole::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            leader_addr: None,
            log: Vec::new(),
            snapshot_last_index: 0,
            snapshot_last_term: 0,
            commit_index: 0,
            last_applied: 0,
            peers: cluster_seeds()
                .into_iter()
                .filter(|addr| *addr != local_http_addr())
                .collect(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: HashSet::new(),
            election_deadline: Instant::now(),
        state: ClusterState::default(),
        };
        core.reset_election_deadline();

        if durable {
            storage::recover(&mut core)?;
        }

        Ok(Raft {
            id: LOCAL_NODE_UUID.clone(),
            durable,
            core: RwLock::new(core),
            transport,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> RaftRole {
        self.core.read().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == RaftRole::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.core.read().current_term
    }

    pub fn commit_index(&self) -> u64 {
        self.core.read().commit_index
    }

    pub fn leader(&self) -> Option<(String, String)> {
        let core = self.core.read();
        match (&core.leader_id, &core.leader_addr) {
            (Some(id), Some(addr)) => Some((id.clone(), addr.clone())),
            _ => None,
        }
    }

    /// read-only snapshot of the applied cluster state
    pub fn cluster_state(&self) -> ClusterState {
        self.core.read().state.clone()
    }

    pub fn set_peers(&self, peers: Vec<String>) {
        let mut core = self.core.write();
        core.peers = peers.into_iter().filter(|a| *a != local_http_addr()).collect();
    }

    /// Propose a cluster state mutation. Single-node clusters commit
    /// immediately; otherwise the entry commits once a majority has
    /// replicated it.
    pub async fn propose(&self, command: LogCommand) -> Result<u64> {
        let (index, single_node) = {
            let mut core = self.core.write();
            if core.role != RaftRole::Leader && !core.peers.is_empty() {
                let hint = core.leader_addr.clone().unwrap_or_default();
                return Err(Error::ErrorCode(ErrorCodes::VersionConflict(format!(
                    "not the leader, try {hint}"
                ))));
            }
            if core.peers.is_empty() && core.role != RaftRole::Leader {
                // a lone node is trivially its own leader
                core.role = RaftRole::Leader;
                core.leader_id = Some(self.id.clone());
                core.leader_addr = Some(local_http_addr());
            }
            let index = core.last_log_index() + 1;
            let entry = LogEntry {
                term: core.current_term,
                index,
                command,
            };
            core.log.push(entry.clone());
            if self.durable {
                storage::append(&entry)?;
            }
            (index, core.peers.is_empty())
        };

        if single_node {
            let mut core = self.core.write();
            core.commit_index = index;
            self.apply_committed(&mut core);
        }
        Ok(index)
    }

    /// wait until `index` is committed or the deadline passes
    pub async fn wait_for_commit(&self, index: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.commit_index() >= index {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::ErrorCode(ErrorCodes::Timeout(format!(
                    "waiting for raft commit of index {index}"
                ))));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// follower/candidate election timer, called from the raft job
    pub async fn tick_election(&self) {
        let start = {
            let core = self.core.read();
            core.role != RaftRole::Leader
                && !core.peers.is_empty()
                && Instant::now() >= core.election_deadline
        };
        if start {
            self.start_election().await;
        }
    }

    async fn start_election(&self) {
        let (request, peers, term) = {
            let mut core = self.core.write();
            core.role = RaftRole::Candidate;
            core.current_term += 1;
            core.voted_for = Some(self.id.clone());
            core.votes = HashSet::from([self.id.clone()]);
            core.leader_id = None;
            core.leader_addr = None;
            core.reset_election_deadline();
            if self.durable {
                storage::save_hard_state(core.current_term, core.voted_for.clone());
            }
            let request = RequestVote {
                term: core.current_term,
                candidate_id: self.id.clone(),
                last_log_index: core.last_log_index(),
                last_log_term: core.last_log_term(),
            };
            (request, core.peers.clone(), core.current_term)
        };
        metrics::RAFT_ELECTIONS.with_label_values(&[&self.id]).inc();
        log::info!("[RAFT] starting election for term {term}");

        let payload = json::to_value(&request).unwrap_or_default();
        let mut handles = Vec::with_capacity(peers.len());
        for peer in peers {
            let transport = self.transport.clone();
            let envelope = Envelope::new(&peer, MSG_REQUEST_VOTE, payload.clone());
            handles.push(tokio::spawn(async move {
                let send = transport.send(&peer, envelope);
                tokio::time::timeout(Duration::from_millis(200), send)
                    .await
                    .ok()?
                    .ok()
            }));
        }
        for handle in handles {
            let Ok(Some(reply)) = handle.await else {
                continue;
            };
            let Ok(response) = json::from_value::<RequestVoteResponse>(reply.payload.clone())
            else {
                continue;
            };
            if self.observe_term(response.term) {
                return;
            }
            if response.vote_granted {
                let won = {
                    let mut core = self.core.write();
                    if core.role != RaftRole::Candidate || core.current_term != term {
                        return;
                    }
                    core.votes.insert(reply.source.clone());
                    core.votes.len() >= core.majority()
                };
                if won {
                    self.become_leader(term).await;
                    return;
                }
            }
        }
    }

    async fn become_leader(&self, term: u64) {
        {
            let mut core = self.core.write();
            if core.role != RaftRole::Candidate || core.current_term != term {
                return;
            }
            core.role = RaftRole::Leader;
            core.leader_id = Some(self.id.clone());
            core.leader_addr = Some(local_http_addr());
            let next = core.last_log_index() + 1;
            core.next_index = core.peers.iter().map(|p| (p.clone(), next)).collect();
            core.match_index = core.peers.iter().map(|p| (p.clone(), 0)).collect();
        }
        log::info!("[RAFT] became leader for term {term}");
        // committing a noop commits everything from earlier terms
        let _ = self.propose(LogCommand::Noop).await;
        self.tick_heartbeat().await;
    }

    /// leader heartbeat/replication pulse, called from the raft job
    pub async fn tick_heartbeat(&self) {
        if !self.is_leader() {
            return;
        }
        let cfg = get_config();
        let (batches, term) = {
            let core = self.core.read();
            let mut batches = Vec::with_capacity(core.peers.len());
            for peer in &core.peers {
                let next = *core.next_index.get(peer).unwrap_or(&1);
                let prev_log_index = next - 1;
                let Some(prev_log_term) = core.term_at(prev_log_index) else {
                    // peer is behind the snapshot boundary
                    batches.push((peer.clone(), None));
                    continue;
                };
                let request = AppendEntries {
                    term: core.current_term,
                    leader_id: self.id.clone(),
                    prev_log_index,
                    prev_log_term,
                    entries: core.entries_from(next, cfg.raft.max_entries_per_append),
                    leader_commit: core.commit_index,
                };
                batches.push((peer.clone(), Some(request)));
            }
            (batches, core.current_term)
        };

        let mut handles = Vec::with_capacity(batches.len());
        for (peer, request) in batches {
            let transport = self.transport.clone();
            let snapshot = match request {
                Some(_) => None,
                None => Some(self.build_snapshot_message(term)),
            };
            handles.push(tokio::spawn(async move {
                let (msg_type, payload) = match (&request, &snapshot) {
                    (Some(req), _) => (MSG_APPEND_ENTRIES, json::to_value(req).ok()?),
                    (None, Some(snap)) => (MSG_INSTALL_SNAPSHOT, json::to_value(snap).ok()?),
                    _ => return None,
                };
                let sent = request.as_ref().map(|r| r.entries.len()).unwrap_or(0);
                let envelope = Envelope::new(&peer, msg_type, payload);
                let reply = tokio::time::timeout(
                    Duration::from_millis(500),
                    transport.send(&peer, envelope),
                )
                .await
                .ok()?
                .ok()?;
                Some((peer, sent, reply))
            }));
        }
        for handle in handles {
            let Ok(Some((peer, _sent, reply))) = handle.await else {
                continue;
            };
            if reply.msg_type == format!("{MSG_APPEND_ENTRIES}.response") {
                let Ok(response) =
                    json::from_value::<AppendEntriesResponse>(reply.payload.clone())
                else {
                    continue;
                };
                if self.observe_term(response.term) {
                    return;
                }
                let mut core = self.core.write();
                if core.role != RaftRole::Leader || core.current_term != term {
                    return;
                }
                if response.success {
                    core.match_index.insert(peer.clone(), response.match_index);
                    core.next_index.insert(peer, response.match_index + 1);
                    self.advance_commit(&mut core);
                } else {
                    // walk back one entry at a time until logs agree
                    let next = core.next_index.entry(peer).or_insert(1);
                    *next = (*next - 1).max(response.match_index + 1).max(1);
                }
            } else if reply.msg_type == format!("{MSG_INSTALL_SNAPSHOT}.response") {
                let Ok(response) =
                    json::from_value::<InstallSnapshotResponse>(reply.payload.clone())
                else {
                    continue;
                };
                if self.observe_term(response.term) {
                    return;
                }
                let mut core = self.core.write();
                let boundary = core.snapshot_last_index;
                core.next_index.insert(peer.clone(), boundary + 1);
                core.match_index.insert(peer, boundary);
            }
        }
    }

    fn build_snapshot_message(&self, term: u64) -> InstallSnapshot {
        let core = self.core.read();
        InstallSnapshot {
            term,
            leader_id: self.id.clone(),
            last_included_index: core.snapshot_last_index,
            last_included_term: core.snapshot_last_term,
            state: json::to_vec(&core.state).unwrap_or_default(),
        }
    }

    /// returns true when a higher term demoted this node
    fn observe_term(&self, term: u64) -> bool {
        let mut core = self.core.write();
        if term <= core.current_term {
            return false;
        }
        core.current_term = term;
        core.role = RaftRole::Follower;
        core.voted_for = None;
        core.votes.clear();
        core.reset_election_deadline();
        if self.durable {
            storage::save_hard_state(core.current_term, None);
        }
        true
    }

    fn advance_commit(&self, core: &mut RaftCore) {
        let last = core.last_log_index();
        for index in ((core.commit_index + 1)..=last).rev() {
            // only entries of the current term commit by counting
            if core.term_at(index) != Some(core.current_term) {
                continue;
            }
            let replicated = 1 + core
                .match_index
                .values()
                .filter(|m| **m >= index)
                .count();
            if replicated >= core.majority() {
                core.commit_index = index;
                break;
            }
        }
        self.apply_committed(core);
    }

    fn apply_committed(&self, core: &mut RaftCore) {
        while core.last_applied < core.commit_index {
            let next = core.last_applied + 1;
            let Some(offset) = next.checked_sub(core.snapshot_last_index + 1) else {
                core.last_applied = next;
                continue;
            };
            let Some(entry) = core.log.get(offset as usize).cloned() else {
                break;
            };
            apply_command(&mut core.state, &entry.command);
            core.state.version += 1;
            core.state.raft_term = core.current_term;
            core.state.commit_index = core.commit_index;
            core.last_applied = next;
        }
        metrics::RAFT_TERM
            .with_label_values(&[&self.id])
            .set(core.current_term as i64);
        metrics::RAFT_COMMIT_INDEX
            .with_label_values(&[&self.id])
            .set(core.commit_index as i64);

        if core.log.len() as u64 > get_config().raft.snapshot_threshold && self.durable {
            if let Err(e) = storage::compact(core) {
                log::error!("[RAFT] snapshot compaction failed: {e}");
            }
        }
    }

    pub fn handle_request_vote(&self, request: RequestVote) -> RequestVoteResponse {
        self.observe_term(request.term);
        let mut core = self.core.write();
        if request.term < core.current_term {
            return RequestVoteResponse {
                term: core.current_term,
                vote_granted: false,
            };
        }
        let log_ok = request.last_log_term > core.last_log_term()
            || (request.last_log_term == core.last_log_term()
                && request.last_log_index >= core.last_log_index());
        let can_vote = match &core.voted_for {
            None => true,
            Some(candidate) => *candidate == request.candidate_id,
        };
        let vote_granted = log_ok && can_vote;
        if vote_granted {
            core.voted_for = Some(request.candidate_id.clone());
            core.reset_election_deadline();
            if self.durable {
                storage::save_hard_state(core.current_term, core.voted_for.clone());
            }
        }
        RequestVoteResponse {
            term: core.current_term,
            vote_granted,
        }
    }

    pub fn handle_append_entries(
        &self,
        request: AppendEntries,
        leader_addr: Option<String>,
    ) -> AppendEntriesResponse {
        self.observe_term(request.term);
        let mut core = self.core.write();
        if request.term < core.current_term {
            return AppendEntriesResponse {
                term: core.current_term,
                success: false,
                match_index: core.last_log_index(),
            };
        }
        core.role = RaftRole::Follower;
        core.leader_id = Some(request.leader_id.clone());
        if let Some(addr) = leader_addr {
            core.leader_addr = Some(addr);
        }
        core.reset_election_deadline();

        // consistency check at prev
        if core.term_at(request.prev_log_index) != Some(request.prev_log_term) {
            return AppendEntriesResponse {
                term: core.current_term,
                success: false,
                match_index: core.snapshot_last_index,
            };
        }

        for entry in &request.entries {
            match core.term_at(entry.index) {
                Some(term) if term == entry.term => continue, // already have it
                Some(_) => {
                    // conflict: drop this entry and everything after it
                    let keep = (entry.index - core.snapshot_last_index - 1) as usize;
                    core.log.truncate(keep);
                    if self.durable {
                        storage::truncate(entry.index);
                    }
                }
                None => {}
            }
            core.log.push(entry.clone());
            if self.durable {
                if let Err(e) = storage::append(entry) {
                    log::error!("[RAFT] log append failed: {e}");
                }
            }
        }

        if request.leader_commit > core.commit_index {
            core.commit_index = request.leader_commit.min(core.last_log_index());
            self.apply_committed(&mut core);
        }

        AppendEntriesResponse {
            term: core.current_term,
            success: true,
            match_index: core.last_log_index(),
        }
    }

    pub fn handle_install_snapshot(&self, request: InstallSnapshot) -> InstallSnapshotResponse {
        self.observe_term(request.term);
        let mut core = self.core.write();
        if request.term < core.current_term {
            return InstallSnapshotResponse {
                term: core.current_term,
            };
        }
        if request.last_included_index <= core.snapshot_last_index {
            return InstallSnapshotResponse {
                term: core.current_term,
            };
        }
        match json::from_slice::<ClusterState>(&request.state) {
            Ok(state) => {
                core.state = state;
                core.snapshot_last_index = request.last_included_index;
                core.snapshot_last_term = request.last_included_term;
                core.log.clear();
                core.commit_index = request.last_included_index;
                core.last_applied = request.last_included_index;
                if self.durable {
                    if let Err(e) = storage::install_snapshot(&core) {
                        log::error!("[RAFT] snapshot install persist failed: {e}");
                    }
                }
                log::info!(
                    "[RAFT] installed snapshot at index {}",
                    request.last_included_index
                );
            }
            Err(e) => log::error!("[RAFT] snapshot decode failed: {e}"),
        }
        InstallSnapshotResponse {
            term: core.current_term,
        }
    }
}

fn apply_command(state: &mut ClusterState, command: &LogCommand) {
    match command {
        LogCommand::Noop => {}
        LogCommand::NodeAdd { node } => {
            state.nodes.insert(node.uuid.clone(), node.clone());
        }
        LogCommand::NodeRemove { node_id } => {
            state.nodes.remove(node_id);
            for location in state.partition_locations.values_mut() {
                location.replicas.retain(|n| n != node_id);
                location.sync_status.remove(node_id);
            }
        }
        LogCommand::PartitionAssign {
            partition,
            primary,
            replicas,
        } => {
            let location = state
                .partition_locations
                .entry(partition.clone())
                .or_insert_with(|| config::meta::partition::ReplicationState {
                    partition: partition.clone(),
                    primary: primary.clone(),
                    replicas: Vec::new(),
                    sync_status: HashMap::new(),
                    version: 0,
                    checksum: String::new(),
                });
            location.primary = primary.clone();
            location.replicas = replicas.clone();
            for replica in replicas {
                location
                    .sync_status
                    .entry(replica.clone())
                    .or_insert(config::meta::partition::SyncStatus::InSync);
            }
            if let Some(node) = state.nodes.get_mut(primary) {
                node.partitions.insert(partition.clone());
            }
        }
        LogCommand::PartitionRevoke { partition } => {
            state.partition_locations.remove(partition);
            for node in state.nodes.values_mut() {
                node.partitions.remove(partition);
            }
        }
        LogCommand::PartitionVersion { partition, version } => {
            if let Some(location) = state.partition_locations.get_mut(partition) {
                // versions are monotonic, replicas never regress
                location.version = location.version.max(*version);
            }
        }
        LogCommand::PolicyChange { .. } => {}
    }
    let alive = state
        .nodes
        .values()
        .filter(|n| n.status == NodeStatus::Alive)
        .count();
    metrics::CLUSTER_NODES
        .with_label_values(&["alive"])
        .set(alive as i64);
}

#[cfg(test)]
mod tests {
    use config::meta::cluster::Node;

    use super::*;
    use crate::service::cluster::transport::LoopbackTransport;

    async fn single_node_raft() -> Arc<Raft> {
        let _ = init(Arc::new(LoopbackTransport)).await;
        get().unwrap()
    }

    #[tokio::test]
    async fn test_single_node_commits_immediately() {
        let raft = single_node_raft().await;
        let node = Node::new("test-node-1", "http://127.0.0.1:1");
        let index = raft
            .propose(LogCommand::NodeAdd { node: node.clone() })
            .await
            .unwrap();
        assert!(raft.commit_index() >= index);
        let state = raft.cluster_state();
        assert!(state.nodes.contains_key("test-node-1"));
        assert!(state.version > 0);
    }

    #[tokio::test]
    async fn test_state_versions_strictly_increase() {
        let raft = single_node_raft().await;
        let v1 = raft.cluster_state().version;
        raft.propose(LogCommand::PartitionAssign {
            partition: "p-ver".to_string(),
            primary: "test-node-1".to_string(),
            replicas: vec![],
        })
        .await
        .unwrap();
        let v2 = raft.cluster_state().version;
        assert!(v2 > v1);
        raft.propose(LogCommand::PartitionVersion {
            partition: "p-ver".to_string(),
            version: 7,
        })
        .await
        .unwrap();
        let state = raft.cluster_state();
        assert!(state.version > v2);
        assert_eq!(state.partition_locations["p-ver"].version, 7);
        // versions never regress
        raft.propose(LogCommand::PartitionVersion {
            partition: "p-ver".to_string(),
            version: 3,
        })
        .await
        .unwrap();
        assert_eq!(raft.cluster_state().partition_locations["p-ver"].version, 7);
    }

    #[tokio::test]
    async fn test_vote_rejects_stale_candidate_log() {
        let raft = single_node_raft().await;
        // make sure the local log is non-empty
        raft.propose(LogCommand::Noop).await.unwrap();
        let term = raft.current_term() + 1;
        let response = raft.handle_request_vote(RequestVote {
            term,
            candidate_id: "stale-candidate".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!response.vote_granted);
    }
}
