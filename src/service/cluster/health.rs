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

//! Node health. The score is a weighted sum over resource and service
//! metrics in [0, 1]; nodes below the unhealthy threshold leave the load
//! balancer rotation and return once they clear the recovery threshold.

use std::collections::VecDeque;

use config::{RwHashMap, get_config, meta::cluster::NodeMetrics, metrics};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sysinfo::System;

const WEIGHT_CPU: f64 = 0.2;
const WEIGHT_MEMORY: f64 = 0.2;
const WEIGHT_DISK: f64 = 0.2;
const WEIGHT_ERROR_RATE: f64 = 0.3;
const WEIGHT_LATENCY: f64 = 0.1;
/// latency at or above this counts as fully degraded
const LATENCY_CEILING_MS: f64 = 1000.0;

static SYSTEM: Lazy<Mutex<System>> = Lazy::new(|| Mutex::new(System::new()));

/// recent scores per node, newest last
static HISTORY: Lazy<RwHashMap<String, VecDeque<f64>>> = Lazy::new(Default::default);
/// nodes currently excluded from load balancing
static EXCLUDED: Lazy<config::RwHashSet<String>> = Lazy::new(Default::default);

/// weighted health score in [0, 1], 1 is healthy
pub fn health_score(m: &NodeMetrics) -> f64 {
    let latency_penalty = (m.latency_ms / LATENCY_CEILING_MS).clamp(0.0, 1.0);
    let score = 1.0
        - (WEIGHT_CPU * m.cpu.clamp(0.0, 1.0)
            + WEIGHT_MEMORY * m.memory.clamp(0.0, 1.0)
            + WEIGHT_DISK * m.disk.clamp(0.0, 1.0)
            + WEIGHT_ERROR_RATE * m.error_rate.clamp(0.0, 1.0)
            + WEIGHT_LATENCY * latency_penalty);
    score.clamp(0.0, 1.0)
}

/// sample this node's resource usage
pub fn sample_local() -> NodeMetrics {
    let mut system = SYSTEM.lock();
    system.refresh_memory();
    system.refresh_cpu_usage();
    let cpus = system.cpus();
    let cpu = if cpus.is_empty() {
        0.0
    } else {
        cpus.iter().map(|c| c.cpu_usage() as f64).sum::<f64>() / cpus.len() as f64 / 100.0
    };
    let memory = if system.total_memory() == 0 {
        0.0
    } else {
        system.used_memory() as f64 / system.total_memory() as f64
    };
    NodeMetrics {
        cpu,
        memory,
        disk: 0.0,
        iops: 0.0,
        net_in: 0.0,
        net_out: 0.0,
        error_rate: 0.0,
        latency_ms: 0.0,
    }
}

/// record a fresh score and update the exclusion set with hysteresis
pub fn observe(node_id: &str, m: &NodeMetrics) -> f64 {
    let cfg = get_config();
    let score = health_score(m);

    let mut history = HISTORY.entry(node_id.to_string()).or_default();
    history.push_back(score);
    while history.len() > cfg.health.history_size {
        history.pop_front();
    }
    drop(history);

    if score < cfg.health.unhealthy_threshold {
        if EXCLUDED.insert(node_id.to_string()) {
            log::warn!("[HEALTH] node {node_id} excluded, score {score:.2}");
        }
    } else if score >= cfg.health.recovery_threshold && EXCLUDED.remove(node_id).is_some() {
        log::info!("[HEALTH] node {node_id} reintroduced, score {score:.2}");
    }

    metrics::NODE_HEALTH_SCORE
        .with_label_values(&[node_id])
        .set((score * 100.0) as i64);
    score
}

pub fn is_excluded(node_id: &str) -> bool {
    EXCLUDED.contains(node_id)
}

pub fn latest_score(node_id: &str) -> Option<f64> {
    HISTORY.get(node_id).and_then(|h| h.back().copied())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Trend {
    Improving,
    Declining,
    Flat,
}

/// direction of the recent score history
pub fn trend(node_id: &str) -> Trend {
    let Some(history) = HISTORY.get(node_id) else {
        return Trend::Flat;
    };
    if history.len() < 2 {
        return Trend::Flat;
    }
    let half = history.len() / 2;
    let older: f64 = history.iter().take(half).sum::<f64>() / half as f64;
    let newer: f64 =
        history.iter().skip(half).sum::<f64>() / (history.len() - half) as f64;
    let delta = newer - older;
    if delta > 0.01 {
        Trend::Improving
    } else if delta < -0.01 {
        Trend::Declining
    } else {
        Trend::Flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics_with(cpu: f64, error_rate: f64) -> NodeMetrics {
        NodeMetrics {
            cpu,
            error_rate,
            ..Default::default()
        }
    }

    #[test]
    fn test_score_weights() {
        let m = NodeMetrics::default();
        assert_eq!(health_score(&m), 1.0);
        // full cpu costs exactly its weight
        assert!((health_score(&metrics_with(1.0, 0.0)) - 0.8).abs() < 1e-9);
        // error rate dominates cpu
        assert!(
            health_score(&metrics_with(1.0, 0.0)) > health_score(&metrics_with(0.0, 1.0))
        );
    }

    #[test]
    fn test_exclusion_hysteresis() {
        let node = "health-n1";
        // unhealthy at < 0.5
        observe(node, &metrics_with(1.0, 1.0));
        assert!(is_excluded(node));
        // 0.5..0.8 stays excluded
        observe(node, &metrics_with(1.0, 0.2));
        assert!(is_excluded(node));
        // >= 0.8 reintroduces
        observe(node, &metrics_with(0.2, 0.0));
        assert!(!is_excluded(node));
    }

    #[test]
    fn test_trend_detection() {
        let node = "health-trend";
        HISTORY.insert(
            node.to_string(),
            VecDeque::from(vec![0.9, 0.8, 0.5, 0.4]),
        );
        assert_eq!(trend(node), Trend::Declining);
        HISTORY.insert(
            node.to_string(),
            VecDeque::from(vec![0.3, 0.4, 0.7, 0.8]),
        );
        assert_eq!(trend(node), Trend::Improving);
    }
}
