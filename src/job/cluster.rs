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

use tokio::time;

use crate::service::{
    cluster::{self, health, raft},
    monitor::collector::{self, MetricKind},
};

pub async fn run() -> Result<(), anyhow::Error> {
    tokio::task::spawn(async move { run_raft_ticks().await });
    tokio::task::spawn(async move { run_heartbeats().await });
    tokio::task::spawn(async move { run_health().await });
    Ok(())
}

async fn run_raft_ticks() -> Result<(), anyhow::Error> {
    let cfg = config::get_config();
    let mut interval = time::interval(time::Duration::from_millis(cfg.raft.heartbeat_interval));
    loop {
        interval.tick().await;
        let Ok(raft) = raft::get() else {
            continue;
        };
        raft.tick_election().await;
        raft.tick_heartbeat().await;
    }
}

async fn run_heartbeats() -> Result<(), anyhow::Error> {
    let cfg = config::get_config();
    let mut interval = time::interval(time::Duration::from_secs(cfg.cluster.heartbeat_interval));
    interval.tick().await; // trigger the first run
    loop {
        interval.tick().await;
        if let Err(e) = cluster::send_heartbeats().await {
            log::error!("[CLUSTER] heartbeat send error: {e}");
        }
        if let Err(e) = cluster::heartbeat_sweep().await {
            log::error!("[CLUSTER] heartbeat sweep error: {e}");
        }
    }
}

async fn run_health() -> Result<(), anyhow::Error> {
    let cfg = config::get_config();
    let mut interval = time::interval(time::Duration::from_secs(cfg.health.check_interval));
    interval.tick().await; // trigger the first run
    loop {
        interval.tick().await;
        for node in cluster::list_nodes().await {
            let score = health::observe(&node.uuid, &node.metrics);
            // heartbeats carry every node's resource metrics here; feeding
            // them into the collector gives alert rules the cluster view
            collector::record("node_cpu", &node.uuid, MetricKind::Gauge, node.metrics.cpu);
            collector::record(
                "node_memory",
                &node.uuid,
                MetricKind::Gauge,
                node.metrics.memory,
            );
            collector::record(
                "node_error_rate",
                &node.uuid,
                MetricKind::Gauge,
                node.metrics.error_rate,
            );
            collector::record("node_health_score", &node.uuid, MetricKind::Gauge, score);
        }
    }
}
