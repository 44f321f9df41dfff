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

use std::collections::HashMap;

use once_cell::sync::Lazy;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

pub const NAMESPACE: &str = "dp";

// http
pub static HTTP_INCOMING_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("http_incoming_requests", "HTTP incoming requests")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["endpoint", "status", "tenant"],
    )
    .expect("Metric created")
});
pub static HTTP_RESPONSE_TIME: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("http_response_time", "HTTP response time")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["endpoint", "status", "tenant"],
    )
    .expect("Metric created")
});

// query
pub static QUERY_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("query_total", "Queries executed")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["tenant", "dialect", "status"],
    )
    .expect("Metric created")
});
pub static QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("query_duration_seconds", "Query end to end duration")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["tenant", "dialect"],
    )
    .expect("Metric created")
});
pub static QUERY_PARTITIONS_SCANNED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("query_partitions_scanned", "Partitions scanned by queries")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["tenant"],
    )
    .expect("Metric created")
});
pub static QUERY_PARTITIONS_PRUNED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("query_partitions_pruned", "Partitions pruned by the optimizer")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["tenant"],
    )
    .expect("Metric created")
});

// cache
pub static CACHE_HITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cache_hits", "Cache hits")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["tier"],
    )
    .expect("Metric created")
});
pub static CACHE_MISSES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cache_misses", "Cache misses")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["tier"],
    )
    .expect("Metric created")
});
pub static CACHE_EVICTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cache_evictions", "Cache evictions")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["tier", "reason"],
    )
    .expect("Metric created")
});
pub static CACHE_ENTRIES: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("cache_entries", "Resident cache entries")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["tier"],
    )
    .expect("Metric created")
});
pub static CACHE_BYTES: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("cache_bytes", "Resident cache bytes")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["tier"],
    )
    .expect("Metric created")
});
pub static CACHE_SINGLE_FLIGHT_WAITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "cache_single_flight_waits",
            "Requests that waited on an in-flight computation",
        )
        .namespace(NAMESPACE)
        .const_labels(create_const_labels()),
        &["tenant"],
    )
    .expect("Metric created")
});

// rate limiter
pub static RATELIMIT_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ratelimit_requests", "Rate limiter decisions")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["tenant", "resource", "decision"],
    )
    .expect("Metric created")
});
pub static RATELIMIT_VIOLATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ratelimit_violations", "Sliding window violations")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["tenant", "resource"],
    )
    .expect("Metric created")
});

// cluster
pub static CLUSTER_NODES: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("cluster_nodes", "Known cluster nodes")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["status"],
    )
    .expect("Metric created")
});
pub static RAFT_TERM: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("raft_term", "Current raft term")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["node"],
    )
    .expect("Metric created")
});
pub static RAFT_COMMIT_INDEX: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("raft_commit_index", "Raft commit index")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["node"],
    )
    .expect("Metric created")
});
pub static RAFT_ELECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("raft_elections", "Raft elections started")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["node"],
    )
    .expect("Metric created")
});
pub static REPLICATION_LAG: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("replication_lag", "Replica version lag per partition")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["partition", "node"],
    )
    .expect("Metric created")
});
pub static NODE_HEALTH_SCORE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("node_health_score_percent", "Node health score 0-100")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["node"],
    )
    .expect("Metric created")
});
pub static CIRCUIT_BREAKER_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "circuit_breaker_state",
            "Circuit breaker state, 0 closed 1 open 2 half open",
        )
        .namespace(NAMESPACE)
        .const_labels(create_const_labels()),
        &["node", "service"],
    )
    .expect("Metric created")
});

// federation
pub static FEDERATION_SUBPLANS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("federation_subplans", "Sub plans dispatched")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["source", "status"],
    )
    .expect("Metric created")
});
pub static FEDERATION_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("federation_retries", "Sub plan retries")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["source"],
    )
    .expect("Metric created")
});

// alerts
pub static ALERTS_TRIGGERED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("alerts_triggered", "Alerts fired")
            .namespace(NAMESPACE)
            .const_labels(create_const_labels()),
        &["rule", "severity"],
    )
    .expect("Metric created")
});

fn create_const_labels() -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert("cluster".to_string(), crate::get_config().common.cluster_name.clone());
    labels
}

fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(HTTP_INCOMING_REQUESTS.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(HTTP_RESPONSE_TIME.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(QUERY_TOTAL.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(QUERY_DURATION.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(QUERY_PARTITIONS_SCANNED.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(QUERY_PARTITIONS_PRUNED.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(CACHE_HITS.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(CACHE_MISSES.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(CACHE_EVICTIONS.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(CACHE_ENTRIES.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(CACHE_BYTES.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(CACHE_SINGLE_FLIGHT_WAITS.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(RATELIMIT_REQUESTS.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(RATELIMIT_VIOLATIONS.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(CLUSTER_NODES.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(RAFT_TERM.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(RAFT_COMMIT_INDEX.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(RAFT_ELECTIONS.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(REPLICATION_LAG.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(NODE_HEALTH_SCORE.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(CIRCUIT_BREAKER_STATE.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(FEDERATION_SUBPLANS.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(FEDERATION_RETRIES.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(ALERTS_TRIGGERED.clone()))
        .expect("Metric registered");
}

static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

pub fn get_registry() -> &'static Registry {
    &REGISTRY
}

/// prometheus text exposition of everything registered
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_exposition() {
        QUERY_TOTAL.with_label_values(&["default", "sql", "ok"]).inc();
        let body = gather();
        assert!(body.contains("dp_query_total"));
    }
}
