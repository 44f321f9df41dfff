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

//! Partition replication. Writes fan out from the primary to its replicas
//! and acknowledge once W replicas (the primary included) confirmed.
//! Laggards are marked and catch up by streaming entries from the version
//! they stopped at; failover promotes the most up-to-date in-sync replica,
//! ties broken on node id.

use config::{
    RwHashMap, get_config,
    cluster::LOCAL_NODE_UUID,
    meta::{
        partition::{ReplicationState, SyncStatus},
        raft::LogCommand,
        record::Record,
    },
    metrics,
    utils::json,
};
use infra::errors::*;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use super::{get_node, get_transport, raft, transport::Envelope};

pub const MSG_REPLICATE_WRITE: &str = "replication.write";
pub const MSG_SYNC_PARTITION: &str = "replication.sync";

/// ordered (version, record) log per partition, the catch-up stream source
static REPL_LOG: Lazy<RwHashMap<String, Vec<(u64, Record)>>> = Lazy::new(Default::default);
/// highest version each (partition, node) has acknowledged
static REPLICA_VERSIONS: Lazy<RwHashMap<(String, String), u64>> = Lazy::new(Default::default);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaWrite {
    pub partition: String,
    pub version: u64,
    pub records: Vec<Record>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaWriteAck {
    pub partition: String,
    pub version: u64,
    pub ok: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRequest {
    pub partition: String,
    pub from_version: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncResponse {
    pub partition: String,
    /// entries with version > from_version, ordered
    pub entries: Vec<(u64, Record)>,
    pub to_version: u64,
    pub checksum: String,
}

pub fn record_local_write(partition: &str, version: u64, records: &[Record]) {
    let mut log = REPL_LOG.entry(partition.to_string()).or_default();
    for record in records {
        log.push((version, record.clone()));
    }
    REPLICA_VERSIONS.insert(
        (partition.to_string(), LOCAL_NODE_UUID.clone()),
        version,
    );
}

/// primary write path: fan out to replicas, ack after W confirmations
/// (the primary's local write counts as one)
pub async fn replicate_write(partition: &str, version: u64, records: Vec<Record>) -> Result<()> {
    record_local_write(partition, version, &records);

    let raft = raft::get()?;
    let state = raft.cluster_state();
    let Some(location) = state.partition_locations.get(partition) else {
        return Ok(()); // unassigned partitions replicate nowhere
    };
    let replicas: Vec<String> = location
        .replicas
        .iter()
        .filter(|n| **n != *LOCAL_NODE_UUID)
        .cloned()
        .collect();
    if replicas.is_empty() {
        return Ok(());
    }

    let write_quorum = get_config().cluster.write_quorum;
    let payload = json::to_value(&ReplicaWrite {
        partition: partition.to_string(),
        version,
        records,
    })?;

    let mut handles = Vec::with_capacity(replicas.len());
    for replica in replicas {
        let payload = payload.clone();
        handles.push(tokio::spawn(async move {
            let ack = async {
                let addr = get_node(&replica).await.map(|n| n.http_addr)?;
                let envelope = Envelope::new(&replica, MSG_REPLICATE_WRITE, payload);
                let reply = get_transport().send(&addr, envelope).await.ok()?;
                json::from_value::<ReplicaWriteAck>(reply.payload).ok()
            }
            .await;
            (replica, ack)
        }));
    }

    let mut acked = 1usize; // self
    let mut lagging = Vec::new();
    for handle in handles {
        let Ok((replica, ack)) = handle.await else {
            continue;
        };
        match ack {
            Some(ack) if ack.ok => {
                acked += 1;
                REPLICA_VERSIONS.insert((partition.to_string(), replica.clone()), ack.version);
                set_sync_status(partition, &replica, SyncStatus::InSync);
            }
            _ => lagging.push(replica),
        }
    }

    for replica in &lagging {
        set_sync_status(partition, replica, SyncStatus::Lagging);
        let lag = version.saturating_sub(
            REPLICA_VERSIONS
                .get(&(partition.to_string(), replica.clone()))
                .map(|v| *v)
                .unwrap_or(0),
        );
        metrics::REPLICATION_LAG
            .with_label_values(&[partition, replica])
            .set(lag as i64);
    }

    if acked < write_quorum {
        return Err(Error::ErrorCode(ErrorCodes::Timeout(format!(
            "write quorum not reached for {partition}: {acked}/{write_quorum}"
        ))));
    }

    raft.propose(LogCommand::PartitionVersion {
        partition: partition.to_string(),
        version,
    })
    .await
    .ok();
    Ok(())
}

/// local sync status bookkeeping, folded into the next assignment proposal
static SYNC_STATUS: Lazy<RwHashMap<(String, String), SyncStatus>> = Lazy::new(Default::default);

fn set_sync_status(partition: &str, node: &str, status: SyncStatus) {
    SYNC_STATUS.insert((partition.to_string(), node.to_string()), status);
}

/// a checksum-failed replica must never be promoted
pub fn mark_failed(partition: &str, node: &str) {
    set_sync_status(partition, node, SyncStatus::Failed);
}

pub fn get_sync_status(partition: &str, node: &str) -> SyncStatus {
    SYNC_STATUS
        .get(&(partition.to_string(), node.to_string()))
        .map(|s| *s)
        .unwrap_or(SyncStatus::InSync)
}

/// replica side of the write fan-out
pub async fn handle_replica_write(request: ReplicaWrite) -> Result<ReplicaWriteAck> {
    for record in &request.records {
        match crate::service::db::write_record(record.clone()) {
            Ok(_) => {}
            Err(Error::ErrorCode(ErrorCodes::DuplicateId(_))) => {} // retransmit
            Err(e) => {
                log::error!(
                    "[REPLICATION] replica write for {} failed: {e}",
                    request.partition
                );
                return Ok(ReplicaWriteAck {
                    partition: request.partition.clone(),
                    version: request.version,
                    ok: false,
                });
            }
        }
    }
    record_local_write(&request.partition, request.version, &[]);
    Ok(ReplicaWriteAck {
        partition: request.partition,
        version: request.version,
        ok: true,
    })
}

/// primary side of catch-up: stream entries above the requested version
pub async fn handle_sync_request(request: SyncRequest) -> Result<SyncResponse> {
    let entries: Vec<(u64, Record)> = REPL_LOG
        .get(&request.partition)
        .map(|log| {
            log.iter()
                .filter(|(v, _)| *v > request.from_version)
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    let to_version = entries
        .last()
        .map(|(v, _)| *v)
        .unwrap_or(request.from_version);
    let checksum = sha256::digest(json::to_vec(&entries)?.as_slice());
    Ok(SyncResponse {
        partition: request.partition,
        entries,
        to_version,
        checksum,
    })
}

/// lagging replica pulls the entries it missed from the primary
pub async fn catch_up(partition: &str) -> Result<u64> {
    let raft = raft::get()?;
    let state = raft.cluster_state();
    let Some(location) = state.partition_locations.get(partition) else {
        return Err(Error::ErrorCode(ErrorCodes::PartitionNotFound(
            partition.to_string(),
        )));
    };
    let from_version = REPLICA_VERSIONS
        .get(&(partition.to_string(), LOCAL_NODE_UUID.clone()))
        .map(|v| *v)
        .unwrap_or(0);
    let primary_addr = get_node(&location.primary)
        .await
        .map(|n| n.http_addr)
        .ok_or_else(|| Error::ErrorCode(ErrorCodes::NodeNotFound(location.primary.clone())))?;

    let payload = json::to_value(&SyncRequest {
        partition: partition.to_string(),
        from_version,
    })?;
    let envelope = Envelope::new(&location.primary, MSG_SYNC_PARTITION, payload);
    let reply = get_transport().send(&primary_addr, envelope).await?;
    let response: SyncResponse = json::from_value(reply.payload)?;

    let checksum = sha256::digest(json::to_vec(&response.entries)?.as_slice());
    if checksum != response.checksum {
        return Err(Error::ErrorCode(ErrorCodes::ChecksumMismatch(format!(
            "sync stream for {partition}"
        ))));
    }

    for (version, record) in response.entries {
        match crate::service::db::write_record(record) {
            Ok(_) | Err(Error::ErrorCode(ErrorCodes::DuplicateId(_))) => {
                REPLICA_VERSIONS.insert(
                    (partition.to_string(), LOCAL_NODE_UUID.clone()),
                    version,
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(response.to_version)
}

/// the failover rule: highest acknowledged version wins, ties break on the
/// smaller node id
pub fn pick_new_primary(location: &ReplicationState, exclude: &str) -> Option<String> {
    let mut candidates: Vec<(u64, String)> = location
        .replicas
        .iter()
        .filter(|n| n.as_str() != exclude)
        .filter(|n| get_sync_status(&location.partition, n) != SyncStatus::Failed)
        .map(|n| {
            let version = REPLICA_VERSIONS
                .get(&(location.partition.clone(), n.clone()))
                .map(|v| *v)
                .unwrap_or(0);
            (version, n.clone())
        })
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    candidates.first().map(|(_, n)| n.clone())
}

/// re-home every partition that the dead node carried
pub async fn handle_dead_node(node_id: &str) -> Result<()> {
    let raft = raft::get()?;
    if !raft.is_leader() && !config::cluster::is_single_node() {
        return Ok(()); // the leader drives re-replication
    }
    let state = raft.cluster_state();
    let alive: Vec<String> = super::list_alive_nodes()
        .await
        .into_iter()
        .map(|n| n.uuid)
        .filter(|n| n != node_id)
        .collect();

    for (partition, location) in state.partition_locations.iter() {
        let involved = location.primary == node_id
            || location.replicas.iter().any(|n| n == node_id);
        if !involved {
            continue;
        }

        let primary = if location.primary == node_id {
            match pick_new_primary(location, node_id) {
                Some(primary) => primary,
                None => {
                    log::error!(
                        "[REPLICATION] no in-sync replica left for {partition}, keeping \
                         assignment until one recovers"
                    );
                    continue;
                }
            }
        } else {
            location.primary.clone()
        };

        let replication_factor = get_config().cluster.replication_factor;
        let mut replicas: Vec<String> = location
            .replicas
            .iter()
            .filter(|n| **n != *node_id && **n != primary)
            .cloned()
            .collect();
        // top up from alive nodes not already hosting this partition
        for candidate in &alive {
            if replicas.len() + 1 >= replication_factor {
                break;
            }
            if *candidate != primary && !replicas.contains(candidate) {
                replicas.push(candidate.clone());
            }
        }

        log::info!(
            "[REPLICATION] re-homing {partition}: primary {primary}, replicas {replicas:?}"
        );
        raft.propose(LogCommand::PartitionAssign {
            partition: partition.clone(),
            primary,
            replicas,
        })
        .await?;
    }
    Ok(())
}

/// leader-side assignment for a new partition
pub async fn assign_partition(partition: &str) -> Result<()> {
    let raft = raft::get()?;
    let alive = super::list_alive_nodes().await;
    if alive.is_empty() {
        return Err(Error::Message("no alive nodes to assign to".to_string()));
    }
    let replication_factor = get_config().cluster.replication_factor.min(alive.len());
    let mut nodes: Vec<String> = alive.into_iter().map(|n| n.uuid).collect();
    nodes.sort();
    // spread by partition key hash so assignments stay stable
    let start = (config::utils::hash::sum64(&partition) % nodes.len() as u64) as usize;
    let primary = nodes[start].clone();
    let replicas: Vec<String> = (1..replication_factor)
        .map(|i| nodes[(start + i) % nodes.len()].clone())
        .collect();
    raft.propose(LogCommand::PartitionAssign {
        partition: partition.to_string(),
        primary,
        replicas,
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn location(primary: &str, replicas: &[&str]) -> ReplicationState {
        ReplicationState {
            partition: "repl-p1".to_string(),
            primary: primary.to_string(),
            replicas: replicas.iter().map(|s| s.to_string()).collect(),
            sync_status: HashMap::new(),
            version: 0,
            checksum: String::new(),
        }
    }

    #[test]
    fn test_pick_new_primary_highest_version() {
        let loc = location("n1", &["n2", "n3"]);
        REPLICA_VERSIONS.insert(("repl-p1".to_string(), "n2".to_string()), 5);
        REPLICA_VERSIONS.insert(("repl-p1".to_string(), "n3".to_string()), 9);
        assert_eq!(pick_new_primary(&loc, "n1"), Some("n3".to_string()));
    }

    #[test]
    fn test_pick_new_primary_tie_breaks_on_node_id() {
        let loc = ReplicationState {
            partition: "repl-p2".to_string(),
            ..location("n1", &["n9", "n2"])
        };
        REPLICA_VERSIONS.insert(("repl-p2".to_string(), "n9".to_string()), 4);
        REPLICA_VERSIONS.insert(("repl-p2".to_string(), "n2".to_string()), 4);
        assert_eq!(pick_new_primary(&loc, "n1"), Some("n2".to_string()));
    }

    #[test]
    fn test_pick_new_primary_skips_failed() {
        let loc = ReplicationState {
            partition: "repl-p3".to_string(),
            ..location("n1", &["n2", "n3"])
        };
        REPLICA_VERSIONS.insert(("repl-p3".to_string(), "n2".to_string()), 9);
        REPLICA_VERSIONS.insert(("repl-p3".to_string(), "n3".to_string()), 2);
        set_sync_status("repl-p3", "n2", SyncStatus::Failed);
        assert_eq!(pick_new_primary(&loc, "n1"), Some("n3".to_string()));
    }

    #[tokio::test]
    async fn test_sync_request_streams_from_version() {
        let records: Vec<Record> = Vec::new();
        record_local_write("repl-sync", 1, &records);
        {
            let mut log = REPL_LOG.entry("repl-sync".to_string()).or_default();
            log.clear();
            for v in 1..=5u64 {
                log.push((
                    v,
                    Record {
                        id: format!("sync-r{v}"),
                        tenant: "default".to_string(),
                        timestamp: v as i64,
                        geo: None,
                        payload: b"{}".to_vec(),
                        payload_type: config::meta::record::PayloadType::Json,
                        tags: HashMap::new(),
                    },
                ));
            }
        }
        let response = handle_sync_request(SyncRequest {
            partition: "repl-sync".to_string(),
            from_version: 3,
        })
        .await
        .unwrap();
        assert_eq!(response.entries.len(), 2);
        assert_eq!(response.to_version, 5);
        let checksum = sha256::digest(json::to_vec(&response.entries).unwrap().as_slice());
        assert_eq!(checksum, response.checksum);
    }
}
