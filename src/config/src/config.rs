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

use std::{cmp::max, collections::BTreeMap, sync::Arc};

use arc_swap::ArcSwap;
use dotenv_config::EnvConfig;
use dotenvy::dotenv_override;
use hashbrown::{HashMap, HashSet};
use once_cell::sync::Lazy;

pub type RwHashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type RwHashSet<K> = dashmap::DashSet<K, ahash::RandomState>;
pub type RwAHashMap<K, V> = tokio::sync::RwLock<HashMap<K, V>>;
pub type RwAHashSet<K> = tokio::sync::RwLock<HashSet<K>>;
pub type RwBTreeMap<K, V> = tokio::sync::RwLock<BTreeMap<K, V>>;

pub const SIZE_IN_MB: f64 = 1024.0 * 1024.0;
pub const SIZE_IN_GB: f64 = 1024.0 * 1024.0 * 1024.0;

pub const FILE_EXT_JSON: &str = ".json";
pub const FILE_EXT_BACKUP: &str = ".bak";
pub const FILE_EXT_CHECKSUM: &str = ".sha256";
pub const FILE_EXT_RAFT_LOG: &str = ".raft";
pub const FILE_EXT_SNAPSHOT: &str = ".snap";

pub const COLUMN_TIMESTAMP: &str = "_timestamp";
pub const COLUMN_RECORD_ID: &str = "_record_id";

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from(Arc::new(init())));
static INSTANCE_ID: Lazy<RwHashMap<String, String>> = Lazy::new(Default::default);

pub fn get_config() -> Arc<Config> {
    CONFIG.load().clone()
}

pub fn refresh_config() -> Result<(), anyhow::Error> {
    CONFIG.store(Arc::new(init()));
    Ok(())
}

pub fn cache_instance_id(instance_id: &str) {
    INSTANCE_ID.insert("instance_id".to_owned(), instance_id.to_owned());
}

pub fn get_instance_id() -> String {
    match INSTANCE_ID.get("instance_id") {
        Some(id) => id.clone(),
        None => "".to_string(),
    }
}

#[derive(EnvConfig)]
pub struct Config {
    pub common: Common,
    pub http: Http,
    pub auth: Auth,
    pub limit: Limit,
    pub partition: Partition,
    pub cluster: Cluster,
    pub raft: Raft,
    pub memory_cache: MemoryCache,
    pub kv_cache: KvCache,
    pub ratelimit: RateLimit,
    pub query: Query,
    pub retention: Retention,
    pub alert: Alert,
    pub health: Health,
    pub log: Log,
    pub tls: Tls,
}

#[derive(EnvConfig)]
pub struct Common {
    #[env_config(name = "DP_NODE_ID", default = "")]
    pub node_id: String,
    #[env_config(name = "DP_NODE_NAME", default = "")]
    pub node_name: String,
    #[env_config(name = "DP_CLUSTER_NAME", default = "dp-cluster")]
    pub cluster_name: String,
    #[env_config(name = "DP_CLUSTER_SEEDS", default = "")]
    pub cluster_seeds: String,
    #[env_config(name = "DP_DATA_DIR", default = "./data/datapunk/")]
    pub data_dir: String,
    #[env_config(name = "DP_DATA_RAFT_DIR", default = "")] // ${DP_DATA_DIR}raft/
    pub data_raft_dir: String,
    #[env_config(name = "DP_DATA_BACKUP_DIR", default = "")] // ${DP_DATA_DIR}backup/
    pub data_backup_dir: String,
    #[env_config(name = "DP_DATA_PARTITION_DIR", default = "")] // ${DP_DATA_DIR}partitions/
    pub data_partition_dir: String,
    #[env_config(name = "DP_COLD_STORAGE_DIR", default = "")] // ${DP_DATA_DIR}cold/
    pub cold_storage_dir: String,
    #[env_config(name = "DP_LOCAL_MODE", default = true)]
    pub local_mode: bool,
    #[env_config(name = "DP_CONFIG_PATH", default = "")]
    pub config_path: String,
}

#[derive(EnvConfig)]
pub struct Http {
    #[env_config(name = "DP_HTTP_PORT", default = 5080)]
    pub port: u16,
    #[env_config(name = "DP_HTTP_ADDR", default = "")]
    pub addr: String,
    #[env_config(name = "DP_HTTP_IPV6_ENABLED", default = false)]
    pub ipv6_enabled: bool,
    #[env_config(name = "DP_HTTP_WORKER_NUM", default = 0)]
    pub worker_num: usize,
}

#[derive(EnvConfig)]
pub struct Auth {
    #[env_config(name = "DP_JWT_SECRET", default = "")]
    pub jwt_secret: String,
    #[env_config(name = "DP_ROOT_API_KEY", default = "")]
    pub root_api_key: String,
    #[env_config(name = "DP_AUDIT_ENABLED", default = true)]
    pub audit_enabled: bool,
}

#[derive(EnvConfig)]
pub struct Limit {
    #[env_config(name = "DP_CPU_NUM", default = 0)]
    pub cpu_num: usize,
    #[env_config(name = "DP_MEM_TOTAL", default = 0)] // bytes
    pub mem_total: usize,
    #[env_config(name = "DP_QUERY_THREAD_NUM", default = 0)]
    pub query_thread_num: usize,
    #[env_config(name = "DP_QUERY_TIMEOUT", default = 30)] // seconds
    pub query_timeout: u64,
    #[env_config(name = "DP_QUERY_PARTITION_SCAN_MAX", default = 1000)]
    pub query_partition_scan_max: usize,
    #[env_config(name = "DP_SQL_MAX_LIMIT", default = 100000)]
    pub sql_max_limit: i64,
    #[env_config(name = "DP_SQL_MAX_OFFSET", default = 100000)]
    pub sql_max_offset: i64,
}

#[derive(EnvConfig)]
pub struct Partition {
    #[env_config(name = "DP_PARTITION_TIME_GRANULARITY", default = "day")]
    pub time_granularity: String,
    #[env_config(name = "DP_PARTITION_GRID_SYSTEM", default = "h3")]
    pub grid_system: String,
    #[env_config(
        name = "DP_PARTITION_GRID_LEVEL",
        default = 0,
        help = "0 derives the level from the target distance",
        parse
    )]
    pub grid_level: u8,
    #[env_config(name = "DP_PARTITION_GRID_TARGET_DISTANCE", default = 1000.0)] // meters
    pub grid_target_distance: f64,
    #[env_config(name = "DP_PARTITION_HOT_RANGES", default = 64)]
    pub hot_ranges: usize,
    #[env_config(name = "DP_PARTITION_RTREE_CELL_DEGREES", default = 0.01)]
    pub rtree_cell_degrees: f64,
}

#[derive(EnvConfig)]
pub struct Cluster {
    #[env_config(name = "DP_HEARTBEAT_INTERVAL", default = 5)] // seconds
    pub heartbeat_interval: u64,
    #[env_config(
        name = "DP_SUSPECT_AFTER",
        default = 0,
        help = "Seconds without heartbeat before a node is suspect, 0 means 3x heartbeat interval"
    )]
    pub suspect_after: u64,
    #[env_config(name = "DP_DEAD_AFTER", default = 60)] // seconds
    pub dead_after: u64,
    #[env_config(name = "DP_REPLICATION_FACTOR", default = 3)]
    pub replication_factor: usize,
    #[env_config(name = "DP_REPLICATION_WRITE_QUORUM", default = 2)]
    pub write_quorum: usize,
    #[env_config(name = "DP_REPLICA_STALENESS_BOUND", default = 1000)] // milliseconds
    pub replica_staleness_bound: u64,
    #[env_config(name = "DP_LB_STRATEGY", default = "health_weighted")]
    pub lb_strategy: String,
    #[env_config(name = "DP_BREAKER_FAILURE_THRESHOLD", default = 5)]
    pub breaker_failure_threshold: usize,
    #[env_config(name = "DP_BREAKER_COOLDOWN", default = 60)] // seconds
    pub breaker_cooldown: u64,
    #[env_config(name = "DP_BREAKER_COOLDOWN_MAX", default = 600)] // seconds
    pub breaker_cooldown_max: u64,
    #[env_config(name = "DP_BREAKER_PROBE_LIMIT", default = 3)]
    pub breaker_probe_limit: usize,
    #[env_config(name = "DP_TRANSPORT_SEEN_CACHE_SIZE", default = 8192)]
    pub transport_seen_cache_size: usize,
}

#[derive(EnvConfig)]
pub struct Raft {
    #[env_config(name = "DP_RAFT_ELECTION_TIMEOUT_MIN", default = 150)] // milliseconds
    pub election_timeout_min: u64,
    #[env_config(name = "DP_RAFT_ELECTION_TIMEOUT_MAX", default = 300)] // milliseconds
    pub election_timeout_max: u64,
    #[env_config(name = "DP_RAFT_HEARTBEAT_INTERVAL", default = 50)] // milliseconds
    pub heartbeat_interval: u64,
    #[env_config(
        name = "DP_RAFT_DURABLE",
        default = true,
        help = "When false the raft log is memory only and the cluster must bootstrap from a quorum after restart"
    )]
    pub durable: bool,
    #[env_config(name = "DP_RAFT_SNAPSHOT_THRESHOLD", default = 10000)] // log entries
    pub snapshot_threshold: u64,
    #[env_config(name = "DP_RAFT_MAX_ENTRIES_PER_APPEND", default = 64)]
    pub max_entries_per_append: usize,
}

#[derive(EnvConfig)]
pub struct MemoryCache {
    #[env_config(name = "DP_MEMORY_CACHE_ENABLED", default = true)]
    pub enabled: bool,
    #[env_config(name = "DP_MEMORY_CACHE_STRATEGY", default = "lru")]
    pub cache_strategy: String,
    #[env_config(name = "DP_MEMORY_CACHE_BUCKET_NUM", default = 16)]
    pub bucket_num: usize,
    #[env_config(name = "DP_MEMORY_CACHE_MAX_SIZE", default = 0)] // bytes, 0 = 512MB
    pub max_size: usize,
    #[env_config(name = "DP_MEMORY_CACHE_MAX_ENTRIES", default = 100000)]
    pub max_entries: usize,
    #[env_config(name = "DP_MEMORY_CACHE_HIGH_WATERMARK", default = 90)] // percent
    pub high_watermark: usize,
    #[env_config(name = "DP_MEMORY_CACHE_LOW_WATERMARK", default = 75)] // percent
    pub low_watermark: usize,
}

#[derive(EnvConfig)]
pub struct KvCache {
    #[env_config(name = "DP_KV_CACHE_ENABLED", default = false)]
    pub enabled: bool,
    #[env_config(name = "DP_KV_CACHE_URL", default = "redis://127.0.0.1:6379/")]
    pub url: String,
    #[env_config(name = "DP_KV_CACHE_KEY_PREFIX", default = "dp:cache:")]
    pub key_prefix: String,
    #[env_config(name = "DP_CACHE_CONSISTENCY", default = "eventual")] // strict|eventual|relaxed
    pub consistency: String,
    #[env_config(name = "DP_CACHE_TTL_JITTER", default = 0.1)]
    pub ttl_jitter: f64,
    #[env_config(name = "DP_CACHE_COMPUTE_TIMEOUT", default = 30)] // seconds
    pub compute_timeout: u64,
}

#[derive(EnvConfig)]
pub struct RateLimit {
    #[env_config(name = "DP_RATELIMIT_ENABLED", default = true)]
    pub enabled: bool,
    #[env_config(name = "DP_RATELIMIT_RPS", default = 10.0)]
    pub requests_per_second: f64,
    #[env_config(name = "DP_RATELIMIT_BURST", default = 20.0)]
    pub burst_size: f64,
    #[env_config(name = "DP_RATELIMIT_WINDOW", default = 60)] // seconds
    pub window_size: u64,
    #[env_config(
        name = "DP_RATELIMIT_FAIL_OPEN",
        default = true,
        help = "Allow requests with a logged warning when the limiter backend errors"
    )]
    pub fail_open: bool,
}

#[derive(EnvConfig)]
pub struct Query {
    #[env_config(name = "DP_CACHE_QUERY_TTL", default = 60)] // seconds
    pub result_cache_ttl: u64,
    #[env_config(name = "DP_CACHE_PLAN_TTL", default = 3600)] // seconds
    pub plan_cache_ttl: u64,
    #[env_config(name = "DP_OPTIMIZER_EPSILON", default = 0.001)]
    pub optimizer_epsilon: f64,
    #[env_config(name = "DP_OPTIMIZER_MAX_ITERATIONS", default = 10)]
    pub optimizer_max_iterations: usize,
    #[env_config(name = "DP_OPTIMIZER_IMPROVEMENT_THRESHOLD", default = 0.05)]
    pub improvement_threshold: f64,
    #[env_config(name = "DP_FEDERATION_WORKER_NUM", default = 0)]
    pub federation_worker_num: usize,
    #[env_config(name = "DP_FEDERATION_SUBPLAN_TIMEOUT", default = 30)] // seconds
    pub subplan_timeout: u64,
    #[env_config(name = "DP_FEDERATION_RETRY_ATTEMPTS", default = 2)]
    pub retry_attempts: usize,
    #[env_config(name = "DP_FEDERATION_RETRY_BASE_DELAY", default = 1)] // seconds
    pub retry_base_delay: u64,
    #[env_config(name = "DP_FEDERATION_RETRY_MAX_DELAY", default = 30)] // seconds
    pub retry_max_delay: u64,
    #[env_config(name = "DP_FEDERATION_CANCEL_TIMEOUT", default = 5)] // seconds
    pub cancel_timeout: u64,
    #[env_config(name = "DP_FEDERATION_FLATTEN_DEPTH", default = 3)]
    pub flatten_depth: u32,
    #[env_config(name = "DP_PATTERN_HISTORY_SIZE", default = 1000)]
    pub pattern_history_size: usize,
    #[env_config(name = "DP_STATS_DRIFT_THRESHOLD", default = 0.1)]
    pub stats_drift_threshold: f64,
}

#[derive(EnvConfig)]
pub struct Retention {
    #[env_config(name = "DP_RETENTION_ENABLED", default = true)]
    pub enabled: bool,
    #[env_config(name = "DP_RETENTION_INTERVAL", default = 600)] // seconds
    pub interval: u64,
    #[env_config(name = "DP_RETENTION_DEFAULT_DAYS", default = 0)] // 0 means keep forever
    pub default_days: u64,
    #[env_config(name = "DP_RETENTION_ARCHIVE_COMPRESS", default = true)]
    pub archive_compress: bool,
    #[env_config(name = "DP_ROLLUP_ENABLED", default = true)]
    pub rollup_enabled: bool,
    #[env_config(name = "DP_ROLLUP_INTERVAL", default = 3600)] // seconds
    pub rollup_interval: u64,
}

#[derive(EnvConfig)]
pub struct Alert {
    #[env_config(name = "DP_ALERT_ENABLED", default = true)]
    pub enabled: bool,
    #[env_config(name = "DP_ALERT_EVAL_INTERVAL", default = 60)] // seconds
    pub eval_interval: u64,
    #[env_config(name = "DP_VIEW_REFRESH_INTERVAL", default = 300)] // seconds
    pub view_refresh_interval: u64,
}

#[derive(EnvConfig)]
pub struct Health {
    #[env_config(name = "DP_HEALTH_UNHEALTHY_THRESHOLD", default = 0.5)]
    pub unhealthy_threshold: f64,
    #[env_config(name = "DP_HEALTH_RECOVERY_THRESHOLD", default = 0.8)]
    pub recovery_threshold: f64,
    #[env_config(name = "DP_HEALTH_CHECK_INTERVAL", default = 10)] // seconds
    pub check_interval: u64,
    #[env_config(name = "DP_HEALTH_HISTORY_SIZE", default = 10)]
    pub history_size: usize,
}

#[derive(EnvConfig)]
pub struct Log {
    #[env_config(name = "DP_LOG_LEVEL", default = "info")]
    pub level: String,
    #[env_config(name = "DP_LOG_JSON_FORMAT", default = false)]
    pub json_format: bool,
}

#[derive(EnvConfig)]
pub struct Tls {
    #[env_config(name = "DP_TLS_ENABLED", default = false)]
    pub enabled: bool,
    #[env_config(name = "DP_TLS_CERT", default = "")]
    pub cert_path: String,
    #[env_config(name = "DP_TLS_KEY", default = "")]
    pub key_path: String,
    #[env_config(name = "DP_TLS_CA", default = "")]
    pub ca_path: String,
}

pub fn init() -> Config {
    // an explicit config document wins over the ambient .env
    if let Ok(path) = std::env::var("DP_CONFIG_PATH") {
        if !path.is_empty() {
            dotenvy::from_path_override(&path).ok();
        }
    }
    dotenv_override().ok();
    let mut cfg = Config::init().expect("config init error");
    // set cpu num
    if cfg.limit.cpu_num == 0 {
        cfg.limit.cpu_num = max(1, std::thread::available_parallelism().map_or(1, |v| v.get()));
    }
    if cfg.limit.query_thread_num == 0 {
        cfg.limit.query_thread_num = cfg.limit.cpu_num * 4;
    }
    if cfg.query.federation_worker_num == 0 {
        cfg.query.federation_worker_num = cfg.limit.cpu_num * 2;
    }
    if cfg.limit.mem_total == 0 {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        cfg.limit.mem_total = system.total_memory() as usize;
    }
    if let Err(e) = check_common_config(&mut cfg) {
        panic!("common config error: {e}");
    }
    if let Err(e) = check_cluster_config(&mut cfg) {
        panic!("cluster config error: {e}");
    }
    if let Err(e) = check_cache_config(&mut cfg) {
        panic!("cache config error: {e}");
    }
    cfg
}

fn check_common_config(cfg: &mut Config) -> Result<(), anyhow::Error> {
    if !cfg.common.data_dir.ends_with('/') {
        cfg.common.data_dir = format!("{}/", cfg.common.data_dir);
    }
    if cfg.common.data_raft_dir.is_empty() {
        cfg.common.data_raft_dir = format!("{}raft/", cfg.common.data_dir);
    }
    if !cfg.common.data_raft_dir.ends_with('/') {
        cfg.common.data_raft_dir = format!("{}/", cfg.common.data_raft_dir);
    }
    if cfg.common.data_backup_dir.is_empty() {
        cfg.common.data_backup_dir = format!("{}backup/", cfg.common.data_dir);
    }
    if !cfg.common.data_backup_dir.ends_with('/') {
        cfg.common.data_backup_dir = format!("{}/", cfg.common.data_backup_dir);
    }
    if cfg.common.data_partition_dir.is_empty() {
        cfg.common.data_partition_dir = format!("{}partitions/", cfg.common.data_dir);
    }
    if !cfg.common.data_partition_dir.ends_with('/') {
        cfg.common.data_partition_dir = format!("{}/", cfg.common.data_partition_dir);
    }
    if cfg.common.cold_storage_dir.is_empty() {
        cfg.common.cold_storage_dir = format!("{}cold/", cfg.common.data_dir);
    }
    if !cfg.common.cold_storage_dir.ends_with('/') {
        cfg.common.cold_storage_dir = format!("{}/", cfg.common.cold_storage_dir);
    }
    Ok(())
}

fn check_cluster_config(cfg: &mut Config) -> Result<(), anyhow::Error> {
    if cfg.cluster.heartbeat_interval == 0 {
        cfg.cluster.heartbeat_interval = 5;
    }
    if cfg.cluster.suspect_after == 0 {
        cfg.cluster.suspect_after = cfg.cluster.heartbeat_interval * 3;
    }
    if cfg.cluster.dead_after <= cfg.cluster.suspect_after {
        return Err(anyhow::anyhow!(
            "DP_DEAD_AFTER must be greater than DP_SUSPECT_AFTER"
        ));
    }
    if cfg.cluster.replication_factor == 0 {
        cfg.cluster.replication_factor = 1;
    }
    if cfg.cluster.write_quorum == 0 || cfg.cluster.write_quorum > cfg.cluster.replication_factor {
        return Err(anyhow::anyhow!(
            "DP_REPLICATION_WRITE_QUORUM must be in 1..=DP_REPLICATION_FACTOR"
        ));
    }
    if cfg.raft.election_timeout_min >= cfg.raft.election_timeout_max {
        return Err(anyhow::anyhow!(
            "DP_RAFT_ELECTION_TIMEOUT_MIN must be less than DP_RAFT_ELECTION_TIMEOUT_MAX"
        ));
    }
    Ok(())
}

fn check_cache_config(cfg: &mut Config) -> Result<(), anyhow::Error> {
    if cfg.memory_cache.max_size == 0 {
        cfg.memory_cache.max_size = 512 * 1024 * 1024; // 512MB
    }
    if cfg.memory_cache.bucket_num == 0 {
        cfg.memory_cache.bucket_num = 1;
    }
    if cfg.memory_cache.high_watermark == 0 || cfg.memory_cache.high_watermark > 100 {
        cfg.memory_cache.high_watermark = 90;
    }
    if cfg.memory_cache.low_watermark >= cfg.memory_cache.high_watermark {
        cfg.memory_cache.low_watermark = 75;
    }
    if !["strict", "eventual", "relaxed"].contains(&cfg.kv_cache.consistency.as_str()) {
        return Err(anyhow::anyhow!(
            "DP_CACHE_CONSISTENCY must be one of strict, eventual, relaxed"
        ));
    }
    if cfg.kv_cache.ttl_jitter < 0.0 || cfg.kv_cache.ttl_jitter >= 1.0 {
        return Err(anyhow::anyhow!("DP_CACHE_TTL_JITTER must be in [0, 1)"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = get_config();
        assert!(cfg.limit.cpu_num >= 1);
        assert!(cfg.common.data_dir.ends_with('/'));
        assert!(cfg.common.data_raft_dir.starts_with(&cfg.common.data_dir));
        assert_eq!(cfg.cluster.suspect_after, cfg.cluster.heartbeat_interval * 3);
        assert!(cfg.raft.election_timeout_min < cfg.raft.election_timeout_max);
    }

    #[test]
    fn test_watermark_ordering() {
        let cfg = get_config();
        assert!(cfg.memory_cache.low_watermark < cfg.memory_cache.high_watermark);
    }
}
