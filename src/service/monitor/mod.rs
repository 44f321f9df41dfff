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

//! Observability over every stage: the internal collector, alert rules and
//! materialized views, plus the node-level health snapshot the /v1/health
//! endpoint serves.

pub mod alerts;
pub mod collector;
pub mod views;

use config::{
    meta::search::{HealthResponse, HealthStatus},
    utils::{json, time::now_micros},
};

use super::cluster::{self, health};

pub fn init() {
    alerts::init();
}

/// the health contract: healthy, degraded (excluded from balancing or
/// raft has no leader), unhealthy (no alive peers at all)
pub async fn health_snapshot() -> HealthResponse {
    let mut checks = json::Map::new();

    let local_metrics = health::sample_local();
    let score = health::health_score(&local_metrics);
    checks.insert("health_score".to_string(), json::json!(score));
    checks.insert(
        "cpu".to_string(),
        json::json!(local_metrics.cpu),
    );
    checks.insert(
        "memory".to_string(),
        json::json!(local_metrics.memory),
    );

    let alive = cluster::list_alive_nodes().await.len();
    checks.insert("alive_nodes".to_string(), json::json!(alive));

    let (leader, term) = match cluster::raft::get() {
        Ok(raft) => (raft.leader().is_some() || raft.is_leader(), raft.current_term()),
        Err(_) => (false, 0),
    };
    checks.insert("raft_leader".to_string(), json::json!(leader));
    checks.insert("raft_term".to_string(), json::json!(term));

    let (cache_entries, cache_bytes) = infra::cache::memory::stats().await;
    checks.insert("cache_entries".to_string(), json::json!(cache_entries));
    checks.insert("cache_bytes".to_string(), json::json!(cache_bytes));

    let cfg = config::get_config();
    let status = if alive == 0 {
        HealthStatus::Unhealthy
    } else if score < cfg.health.unhealthy_threshold || !leader {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    HealthResponse {
        status,
        checks,
        timestamp: now_micros(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_snapshot_shape() {
        let snapshot = health_snapshot().await;
        assert!(snapshot.checks.contains_key("health_score"));
        assert!(snapshot.checks.contains_key("alive_nodes"));
        assert!(snapshot.timestamp > 0);
    }
}
