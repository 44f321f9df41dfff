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

//! Node selection for query routing. Strategies behind one trait; the
//! adaptive one reads the health trend: improving clusters spread load onto
//! recovering nodes, declining ones retreat to the healthiest.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use config::{RwHashMap, get_config, meta::cluster::Node};
use infra::errors::*;
use once_cell::sync::Lazy;

use super::health::{self, Trend};

pub trait LoadBalancingStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn select(&self, nodes: &[Node]) -> Option<Node>;
}

/// in-flight request counts per node, fed by the federation dispatcher
static CONNECTIONS: Lazy<RwHashMap<String, AtomicUsize>> = Lazy::new(Default::default);

pub fn connection_started(node_id: &str) {
    CONNECTIONS
        .entry(node_id.to_string())
        .or_default()
        .fetch_add(1, Ordering::Relaxed);
}

pub fn connection_finished(node_id: &str) {
    if let Some(counter) = CONNECTIONS.get(node_id) {
        let mut current = counter.load(Ordering::Relaxed);
        while current > 0 {
            match counter.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}

fn connections(node_id: &str) -> usize {
    CONNECTIONS
        .get(node_id)
        .map(|c| c.load(Ordering::Relaxed))
        .unwrap_or(0)
}

pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        RoundRobin {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, nodes: &[Node]) -> Option<Node> {
        if nodes.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
        Some(nodes[idx].clone())
    }
}

pub struct LeastConnections;

impl LoadBalancingStrategy for LeastConnections {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn select(&self, nodes: &[Node]) -> Option<Node> {
        nodes
            .iter()
            .min_by_key(|n| (connections(&n.uuid), n.uuid.clone()))
            .cloned()
    }
}

/// round robin weighted by the latest health score
pub struct HealthWeighted {
    cursor: AtomicUsize,
}

impl HealthWeighted {
    pub fn new() -> Self {
        HealthWeighted {
            cursor: AtomicUsize::new(0),
        }
    }

    fn weight(node: &Node) -> usize {
        let score = health::latest_score(&node.uuid)
            .unwrap_or_else(|| health::health_score(&node.metrics));
        // 1..=10 slots proportional to the score
        ((score * 10.0).round() as usize).max(1)
    }
}

impl Default for HealthWeighted {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingStrategy for HealthWeighted {
    fn name(&self) -> &'static str {
        "health_weighted"
    }

    fn select(&self, nodes: &[Node]) -> Option<Node> {
        if nodes.is_empty() {
            return None;
        }
        let total: usize = nodes.iter().map(Self::weight).sum();
        let mut slot = self.cursor.fetch_add(1, Ordering::Relaxed) % total.max(1);
        for node in nodes {
            let weight = Self::weight(node);
            if slot < weight {
                return Some(node.clone());
            }
            slot -= weight;
        }
        nodes.last().cloned()
    }
}

/// trend-aware: improving fleets favor recovering nodes to rebalance,
/// declining fleets favor the healthiest
pub struct Adaptive {
    fallback: HealthWeighted,
}

impl Adaptive {
    pub fn new() -> Self {
        Adaptive {
            fallback: HealthWeighted::new(),
        }
    }

    fn fleet_trend(nodes: &[Node]) -> Trend {
        let mut improving = 0;
        let mut declining = 0;
        for node in nodes {
            match health::trend(&node.uuid) {
                Trend::Improving => improving += 1,
                Trend::Declining => declining += 1,
                Trend::Flat => {}
            }
        }
        if improving > declining {
            Trend::Improving
        } else if declining > improving {
            Trend::Declining
        } else {
            Trend::Flat
        }
    }
}

impl Default for Adaptive {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingStrategy for Adaptive {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn select(&self, nodes: &[Node]) -> Option<Node> {
        if nodes.is_empty() {
            return None;
        }
        let score = |n: &Node| {
            health::latest_score(&n.uuid).unwrap_or_else(|| health::health_score(&n.metrics))
        };
        match Self::fleet_trend(nodes) {
            Trend::Improving => nodes
                .iter()
                .filter(|n| health::trend(&n.uuid) == Trend::Improving)
                .min_by(|a, b| score(a).partial_cmp(&score(b)).unwrap())
                .or_else(|| nodes.first())
                .cloned(),
            Trend::Declining => nodes
                .iter()
                .max_by(|a, b| score(a).partial_cmp(&score(b)).unwrap())
                .cloned(),
            Trend::Flat => self.fallback.select(nodes),
        }
    }
}

static STRATEGY: Lazy<Arc<dyn LoadBalancingStrategy>> = Lazy::new(|| {
    let name = get_config().cluster.lb_strategy.clone();
    create(&name).unwrap_or_else(|_| {
        log::warn!("[BALANCER] unknown strategy {name}, using health_weighted");
        Arc::new(HealthWeighted::new())
    })
});

pub fn create(name: &str) -> Result<Arc<dyn LoadBalancingStrategy>> {
    Ok(match name {
        "round_robin" => Arc::new(RoundRobin::new()) as Arc<dyn LoadBalancingStrategy>,
        "least_connections" => Arc::new(LeastConnections),
        "health_weighted" => Arc::new(HealthWeighted::new()),
        "adaptive" => Arc::new(Adaptive::new()),
        _ => {
            return Err(Error::Message(format!(
                "unknown load balancing strategy: {name}"
            )));
        }
    })
}

/// pick a node for work, excluding unhealthy ones
pub fn select_node(nodes: &[Node]) -> Option<Node> {
    let eligible: Vec<Node> = nodes
        .iter()
        .filter(|n| !health::is_excluded(&n.uuid))
        .cloned()
        .collect();
    if eligible.is_empty() {
        // every node excluded: degraded service beats none
        return STRATEGY.select(nodes);
    }
    STRATEGY.select(&eligible)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<Node> {
        ids.iter()
            .map(|id| Node::new(id, &format!("http://{id}:5080")))
            .collect()
    }

    #[test]
    fn test_round_robin_cycles() {
        let strategy = RoundRobin::new();
        let nodes = nodes(&["a", "b", "c"]);
        let picks: Vec<String> = (0..6)
            .map(|_| strategy.select(&nodes).unwrap().uuid)
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_least_connections() {
        let strategy = LeastConnections;
        let nodes = nodes(&["lc-a", "lc-b"]);
        connection_started("lc-a");
        connection_started("lc-a");
        connection_started("lc-b");
        assert_eq!(strategy.select(&nodes).unwrap().uuid, "lc-b");
        connection_finished("lc-a");
        connection_finished("lc-a");
        assert_eq!(strategy.select(&nodes).unwrap().uuid, "lc-a");
    }

    #[test]
    fn test_health_weighted_prefers_healthy() {
        let strategy = HealthWeighted::new();
        let mut ns = nodes(&["hw-a", "hw-b"]);
        ns[1].metrics.error_rate = 1.0;
        ns[1].metrics.cpu = 1.0;
        let mut counts = std::collections::HashMap::new();
        for _ in 0..100 {
            *counts
                .entry(strategy.select(&ns).unwrap().uuid)
                .or_insert(0usize) += 1;
        }
        assert!(counts["hw-a"] > counts.get("hw-b").copied().unwrap_or(0));
    }

    #[test]
    fn test_create_unknown() {
        assert!(create("random").is_err());
    }
}
