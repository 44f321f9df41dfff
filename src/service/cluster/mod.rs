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

//! Cluster membership. The node registry is a copy-on-write cache of every
//! known node; heartbeats keep it fresh, the sweep marks nodes suspect after
//! three missed intervals and dead after the configured deadline, and dead
//! nodes hand their partitions to re-replication.

pub mod balancer;
pub mod breaker;
pub mod health;
pub mod raft;
pub mod recovery;
pub mod replication;
pub mod rpc;
pub mod transport;

use std::sync::Arc;

use config::{
    RwAHashMap, get_config,
    cluster::{LOCAL_NODE_NAME, LOCAL_NODE_UUID, cluster_seeds, is_single_node, local_http_addr},
    meta::cluster::{Node, NodeStatus, RaftRole},
    metrics,
    utils::{json, time::now_micros},
};
use infra::errors::*;
use once_cell::sync::Lazy;

use self::transport::{Envelope, HttpTransport, LoopbackTransport, Transport};

pub const MSG_HEARTBEAT: &str = "cluster.heartbeat";

static NODES: Lazy<RwAHashMap<String, Node>> = Lazy::new(Default::default);

static TRANSPORT: Lazy<Arc<dyn Transport>> = Lazy::new(|| {
    if is_single_node() {
        Arc::new(LoopbackTransport) as Arc<dyn Transport>
    } else {
        Arc::new(HttpTransport::new()) as Arc<dyn Transport>
    }
});

pub fn get_transport() -> Arc<dyn Transport> {
    TRANSPORT.clone()
}

pub async fn init() -> Result<()> {
    transport::set_handler(Arc::new(rpc::Dispatcher));
    raft::init(get_transport()).await?;
    register_local_node().await?;
    Ok(())
}

async fn register_local_node() -> Result<()> {
    let mut node = Node::new(&LOCAL_NODE_UUID, &local_http_addr());
    node.name = LOCAL_NODE_NAME.clone();
    node.metrics = health::sample_local();
    add_node_to_cache(node.clone()).await;

    let raft = raft::get()?;
    if is_single_node() || raft.is_leader() {
        raft.propose(config::meta::raft::LogCommand::NodeAdd { node })
            .await?;
    }
    log::info!("[CLUSTER] local node {} registered", *LOCAL_NODE_UUID);
    Ok(())
}

pub async fn add_node_to_cache(node: Node) {
    NODES.write().await.insert(node.uuid.clone(), node);
    refresh_node_metrics().await;
}

pub async fn remove_node_from_cache(node_id: &str) {
    NODES.write().await.remove(node_id);
    refresh_node_metrics().await;
}

pub async fn get_node(node_id: &str) -> Option<Node> {
    NODES.read().await.get(node_id).cloned()
}

pub async fn get_node_by_addr(addr: &str) -> Option<Node> {
    NODES
        .read()
        .await
        .values()
        .find(|n| n.http_addr == addr)
        .cloned()
}

/// copy-on-write snapshot of every known node
pub async fn list_nodes() -> Vec<Node> {
    NODES.read().await.values().cloned().collect()
}

pub async fn list_alive_nodes() -> Vec<Node> {
    NODES
        .read()
        .await
        .values()
        .filter(|n| n.status == NodeStatus::Alive)
        .cloned()
        .collect()
}

async fn refresh_node_metrics() {
    let nodes = NODES.read().await;
    let mut alive = 0;
    let mut suspect = 0;
    let mut dead = 0;
    for node in nodes.values() {
        match node.status {
            NodeStatus::Alive => alive += 1,
            NodeStatus::Suspect => suspect += 1,
            NodeStatus::Dead => dead += 1,
        }
    }
    drop(nodes);
    metrics::CLUSTER_NODES.with_label_values(&["alive"]).set(alive);
    metrics::CLUSTER_NODES
        .with_label_values(&["suspect"])
        .set(suspect);
    metrics::CLUSTER_NODES.with_label_values(&["dead"]).set(dead);
}

/// a heartbeat arrived from a peer
pub async fn process_heartbeat(mut node: Node) {
    node.last_heartbeat = now_micros();
    node.status = NodeStatus::Alive;
    NODES.write().await.insert(node.uuid.clone(), node);
}

/// push our heartbeat to every known peer and the seed list
pub async fn send_heartbeats() -> Result<()> {
    let mut local = Node::new(&LOCAL_NODE_UUID, &local_http_addr());
    local.name = LOCAL_NODE_NAME.clone();
    local.metrics = health::sample_local();
    if let Ok(raft) = raft::get() {
        local.raft_role = raft.role();
    }
    NODES
        .write()
        .await
        .insert(local.uuid.clone(), local.clone());

    let mut targets: Vec<String> = cluster_seeds();
    for node in list_nodes().await {
        if node.uuid != *LOCAL_NODE_UUID {
            targets.push(node.http_addr.clone());
        }
    }
    targets.sort();
    targets.dedup();
    targets.retain(|addr| *addr != local_http_addr());

    let payload = json::to_value(&local)?;
    let transport = get_transport();
    for addr in targets {
        let envelope = Envelope::new(&addr, MSG_HEARTBEAT, payload.clone());
        let transport = transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.send(&addr, envelope).await {
                log::debug!("[CLUSTER] heartbeat to {addr} failed: {e}");
            }
        });
    }
    Ok(())
}

/// mark nodes suspect/dead from heartbeat age; dead nodes trigger
/// re-replication of their partitions
pub async fn heartbeat_sweep() -> Result<()> {
    let cfg = get_config();
    let now = now_micros();
    let suspect_after = (cfg.cluster.suspect_after as i64) * 1_000_000;
    let dead_after = (cfg.cluster.dead_after as i64) * 1_000_000;

    let mut newly_dead = Vec::new();
    {
        let mut nodes = NODES.write().await;
        for node in nodes.values_mut() {
            if node.uuid == *LOCAL_NODE_UUID {
                continue;
            }
            let age = now - node.last_heartbeat;
            let next = if age >= dead_after {
                NodeStatus::Dead
            } else if age >= suspect_after {
                NodeStatus::Suspect
            } else {
                NodeStatus::Alive
            };
            if node.status != next {
                log::warn!("[CLUSTER] node {} is now {next}", node.uuid);
                if next == NodeStatus::Dead {
                    newly_dead.push(node.uuid.clone());
                }
                node.status = next;
            }
        }
    }
    refresh_node_metrics().await;

    for node_id in newly_dead {
        if let Err(e) = replication::handle_dead_node(&node_id).await {
            log::error!("[CLUSTER] re-replication for dead node {node_id} failed: {e}");
        }
    }
    Ok(())
}

/// admin: join a node by address
pub async fn add_node(addr: &str) -> Result<Node> {
    let node = Node::new(&config::ider::uuid(), addr);
    let raft = raft::get()?;
    raft.propose(config::meta::raft::LogCommand::NodeAdd { node: node.clone() })
        .await?;
    add_node_to_cache(node.clone()).await;
    Ok(node)
}

/// admin: remove a node and re-home its partitions
pub async fn remove_node(node_id: &str) -> Result<()> {
    if get_node(node_id).await.is_none() {
        return Err(Error::ErrorCode(ErrorCodes::NodeNotFound(
            node_id.to_string(),
        )));
    }
    let raft = raft::get()?;
    raft.propose(config::meta::raft::LogCommand::NodeRemove {
        node_id: node_id.to_string(),
    })
    .await?;
    remove_node_from_cache(node_id).await;
    replication::handle_dead_node(node_id).await?;
    Ok(())
}

/// local raft role, follower when raft is not up yet
pub fn local_role() -> RaftRole {
    raft::get().map(|r| r.role()).unwrap_or(RaftRole::Follower)
}

/// Whether this node runs the side-effecting background jobs (retention,
/// rollups, alert dispatch, view refresh). Exactly one node qualifies in a
/// cluster: the raft leader. Checked per tick because leadership moves.
pub fn is_coordinator() -> bool {
    if is_single_node() {
        return true;
    }
    raft::get().map(|r| r.is_leader()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_add_remove() {
        let node = Node::new("reg-n1", "http://10.0.0.1:5080");
        add_node_to_cache(node.clone()).await;
        assert_eq!(get_node("reg-n1").await.unwrap().http_addr, node.http_addr);
        assert!(get_node_by_addr("http://10.0.0.1:5080").await.is_some());
        remove_node_from_cache("reg-n1").await;
        assert!(get_node("reg-n1").await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_sweep_marks_suspect_and_dead() {
        let cfg = get_config();
        let mut stale = Node::new("reg-stale", "http://10.0.0.2:5080");
        stale.last_heartbeat =
            now_micros() - (cfg.cluster.suspect_after as i64 + 1) * 1_000_000;
        add_node_to_cache(stale).await;

        let mut gone = Node::new("reg-gone", "http://10.0.0.3:5080");
        gone.last_heartbeat = now_micros() - (cfg.cluster.dead_after as i64 + 1) * 1_000_000;
        add_node_to_cache(gone).await;

        heartbeat_sweep().await.unwrap();
        assert_eq!(
            get_node("reg-stale").await.unwrap().status,
            NodeStatus::Suspect
        );
        assert_eq!(get_node("reg-gone").await.unwrap().status, NodeStatus::Dead);
        remove_node_from_cache("reg-stale").await;
        remove_node_from_cache("reg-gone").await;
    }
}
