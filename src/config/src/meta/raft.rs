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

use serde::{Deserialize, Serialize};

use super::cluster::Node;

/// a cluster state mutation carried in the raft log
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogCommand {
    NodeAdd { node: Node },
    NodeRemove { node_id: String },
    PartitionAssign {
        partition: String,
        primary: String,
        replicas: Vec<String>,
    },
    PartitionRevoke { partition: String },
    PartitionVersion { partition: String, version: u64 },
    PolicyChange { key: String, value: String },
    Noop,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: LogCommand,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// highest log index known to be replicated on the follower
    pub match_index: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshot {
    pub term: u64,
    pub leader_id: String,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub state: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_command_roundtrip() {
        let cmd = LogCommand::PartitionAssign {
            partition: "time/day/2024-01-01T00:00:00+00:00".to_string(),
            primary: "n1".to_string(),
            replicas: vec!["n2".to_string(), "n3".to_string()],
        };
        let s = crate::utils::json::to_string(&cmd).unwrap();
        let cmd2: LogCommand = crate::utils::json::from_str(&s).unwrap();
        assert_eq!(cmd, cmd2);
    }
}
