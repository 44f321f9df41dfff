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

use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use super::partition::ReplicationState;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub uuid: String,
    pub name: String,
    pub http_addr: String,
    pub raft_role: RaftRole,
    pub status: NodeStatus,
    #[serde(default)]
    pub metrics: NodeMetrics,
    /// UTC microseconds of the last heartbeat seen from this node
    pub last_heartbeat: i64,
    #[serde(default)]
    pub partitions: HashSet<String>,
}

impl Node {
    pub fn new(uuid: &str, http_addr: &str) -> Self {
        Node {
            uuid: uuid.to_string(),
            name: uuid.to_string(),
            http_addr: http_addr.to_string(),
            raft_role: RaftRole::Follower,
            status: NodeStatus::Alive,
            metrics: NodeMetrics::default(),
            last_heartbeat: crate::utils::time::now_micros(),
            partitions: HashSet::new(),
        }
    }

    pub fn is_same(&self, other: &Node) -> bool {
        self.uuid == other.uuid
            && self.http_addr == other.http_addr
            && self.status == other.status
            && self.raft_role == other.raft_role
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Alive,
    Suspect,
    Dead,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Alive => write!(f, "alive"),
            NodeStatus::Suspect => write!(f, "suspect"),
            NodeStatus::Dead => write!(f, "dead"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl FromStr for RaftRole {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "follower" => Ok(RaftRole::Follower),
            "candidate" => Ok(RaftRole::Candidate),
            "leader" => Ok(RaftRole::Leader),
            _ => Err(format!("Invalid raft role: {s}")),
        }
    }
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// resource metrics sampled by the health monitor, all utilizations in [0, 1]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub iops: f64,
    pub net_in: f64,
    pub net_out: f64,
    pub error_rate: f64,
    pub latency_ms: f64,
}

/// Cluster state machine replicated through the raft log. Other components
/// only ever observe read-only snapshots of this; cross references are by id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterState {
    pub version: u64,
    pub nodes: HashMap<String, Node>,
    pub partition_locations: HashMap<String, ReplicationState>,
    pub raft_term: u64,
    pub commit_index: u64,
}

impl ClusterState {
    pub fn alive_nodes(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Alive)
            .collect()
    }

    pub fn leader(&self) -> Option<&Node> {
        self.nodes.values().find(|n| n.raft_role == RaftRole::Leader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_is_same_ignores_metrics() {
        let mut a = Node::new("n1", "http://127.0.0.1:5080");
        let mut b = a.clone();
        b.metrics.cpu = 0.9;
        b.last_heartbeat += 1000;
        assert!(a.is_same(&b));
        a.status = NodeStatus::Suspect;
        assert!(!a.is_same(&b));
    }

    #[test]
    fn test_cluster_state_leader() {
        let mut state = ClusterState::default();
        let mut n = Node::new("n1", "addr");
        n.raft_role = RaftRole::Leader;
        state.nodes.insert("n1".to_string(), n);
        state.nodes.insert("n2".to_string(), Node::new("n2", "addr"));
        assert_eq!(state.leader().unwrap().uuid, "n1");
        assert_eq!(state.alive_nodes().len(), 2);
    }
}
