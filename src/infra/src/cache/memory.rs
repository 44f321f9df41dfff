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

//! Tier 1: the in-process cache. Buckets striped by key hash, each bucket
//! guarded by its own lock, bounded by bytes and entries. Eviction runs when
//! the byte high watermark is crossed and stops below the low watermark.

use std::collections::VecDeque;

use bytes::Bytes;
use config::{
    get_config, metrics,
    utils::hash::Sum64,
    utils::time::now_micros,
};
use hashbrown::HashMap;
use hashlink::LruCache;
use once_cell::sync::Lazy;
use tokio::sync::RwLock;

use crate::errors::*;

static BUCKETS: Lazy<Vec<RwLock<CacheBucket>>> = Lazy::new(|| {
    let cfg = get_config();
    let mut buckets = Vec::with_capacity(cfg.memory_cache.bucket_num);
    for _ in 0..cfg.memory_cache.bucket_num {
        buckets.push(RwLock::new(CacheBucket::new(
            cfg.memory_cache.max_size / cfg.memory_cache.bucket_num,
            cfg.memory_cache.max_entries / cfg.memory_cache.bucket_num,
            &cfg.memory_cache.cache_strategy,
        )));
    }
    buckets
});

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub value: Bytes,
    /// 0 means no expiry
    pub ttl_secs: u64,
    pub version: u64,
    pub inserted_at: i64,
    pub last_accessed: i64,
    pub access_count: u64,
    pub size: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: i64) -> bool {
        self.ttl_secs > 0 && now - self.inserted_at > (self.ttl_secs as i64) * 1_000_000
    }
}

enum CacheStrategy {
    Lru(LruCache<String, ()>),
    Lfu,
    /// entries with a ttl are evicted before persistent ones
    VolatileLru {
        volatile: LruCache<String, ()>,
        persistent: LruCache<String, ()>,
    },
    Fifo(VecDeque<String>),
}

impl CacheStrategy {
    fn new(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "lru" => CacheStrategy::Lru(LruCache::new_unbounded()),
            "lfu" => CacheStrategy::Lfu,
            "volatile-lru" | "volatile_lru" => CacheStrategy::VolatileLru {
                volatile: LruCache::new_unbounded(),
                persistent: LruCache::new_unbounded(),
            },
            "fifo" => CacheStrategy::Fifo(VecDeque::new()),
            _ => CacheStrategy::Lru(LruCache::new_unbounded()),
        }
    }

    fn insert(&mut self, key: String, has_ttl: bool) {
        match self {
            CacheStrategy::Lru(cache) => {
                cache.insert(key, ());
            }
            CacheStrategy::Lfu => {}
            CacheStrategy::VolatileLru {
                volatile,
                persistent,
            } => {
                if has_ttl {
                    volatile.insert(key, ());
                } else {
                    persistent.insert(key, ());
                }
            }
            CacheStrategy::Fifo(queue) => queue.push_back(key),
        }
    }

    fn touch(&mut self, key: &str) {
        match self {
            CacheStrategy::Lru(cache) => {
                cache.get(key);
            }
            CacheStrategy::VolatileLru {
                volatile,
                persistent,
            } => {
                if volatile.get(key).is_none() {
                    persistent.get(key);
                }
            }
            CacheStrategy::Lfu | CacheStrategy::Fifo(_) => {}
        }
    }

    fn remove(&mut self, key: &str) {
        match self {
            CacheStrategy::Lru(cache) => {
                cache.remove(key);
            }
            CacheStrategy::VolatileLru {
                volatile,
                persistent,
            } => {
                if volatile.remove(key).is_none() {
                    persistent.remove(key);
                }
            }
            CacheStrategy::Lfu => {}
            CacheStrategy::Fifo(queue) => {
                if let Some(pos) = queue.iter().position(|k| k == key) {
                    queue.remove(pos);
                }
            }
        }
    }

    /// pick the next victim, entries gives access to lfu counters
    fn victim(&mut self, entries: &HashMap<String, CacheEntry>) -> Option<String> {
        match self {
            CacheStrategy::Lru(cache) => cache.remove_lru().map(|(k, _)| k),
            CacheStrategy::Lfu => entries
                .iter()
                .min_by_key(|(_, e)| (e.access_count, e.last_accessed))
                .map(|(k, _)| k.clone()),
            CacheStrategy::VolatileLru {
                volatile,
                persistent,
            } => volatile
                .remove_lru()
                .map(|(k, _)| k)
                .or_else(|| persistent.remove_lru().map(|(k, _)| k)),
            CacheStrategy::Fifo(queue) => queue.pop_front(),
        }
    }
}

struct CacheBucket {
    max_size: usize,
    max_entries: usize,
    cur_size: usize,
    strategy: CacheStrategy,
    data: HashMap<String, CacheEntry>,
}

impl CacheBucket {
    fn new(max_size: usize, max_entries: usize, strategy: &str) -> Self {
        CacheBucket {
            max_size,
            max_entries: max_entries.max(1),
            cur_size: 0,
            strategy: CacheStrategy::new(strategy),
            data: HashMap::new(),
        }
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        let has_ttl = entry.ttl_secs > 0;
        if let Some(old) = self.data.remove(&key) {
            self.cur_size -= old.size;
            self.strategy.remove(&key);
        }
        self.cur_size += entry.size;
        self.data.insert(key.clone(), entry);
        self.strategy.insert(key, has_ttl);
        self.evict_if_needed();
    }

    fn evict_if_needed(&mut self) {
        let cfg = get_config();
        let high = self.max_size * cfg.memory_cache.high_watermark / 100;
        let low = self.max_size * cfg.memory_cache.low_watermark / 100;
        if self.cur_size <= high && self.data.len() <= self.max_entries {
            return;
        }
        while (self.cur_size > low || self.data.len() > self.max_entries)
            && !self.data.is_empty()
        {
            let victim = match self.strategy.victim(&self.data) {
                Some(victim) => victim,
                None => break,
            };
            if let Some(entry) = self.data.remove(&victim) {
                self.cur_size -= entry.size;
                if matches!(self.strategy, CacheStrategy::Lfu) {
                    // lfu victims are not tracked in a side structure
                } else {
                    self.strategy.remove(&victim);
                }
                metrics::CACHE_EVICTIONS
                    .with_label_values(&["memory", "capacity"])
                    .inc();
            }
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.data.remove(key)?;
        self.cur_size -= entry.size;
        self.strategy.remove(key);
        Some(entry)
    }
}

fn bucket_idx(key: &str) -> usize {
    let hash = config::utils::hash::new().sum64(key);
    hash as usize % BUCKETS.len()
}

pub async fn init() -> Result<()> {
    _ = BUCKETS.len();
    Ok(())
}

pub async fn get(key: &str) -> Option<Bytes> {
    if !get_config().memory_cache.enabled {
        return None;
    }
    let idx = bucket_idx(key);
    let mut bucket = BUCKETS[idx].write().await;
    let bucket = &mut *bucket;
    let now = now_micros();
    let expired = match bucket.data.get_mut(key) {
        Some(entry) => {
            if entry.is_expired(now) {
                true
            } else {
                entry.last_accessed = now;
                entry.access_count += 1;
                let value = entry.value.clone();
                bucket.strategy.touch(key);
                metrics::CACHE_HITS.with_label_values(&["memory"]).inc();
                return Some(value);
            }
        }
        None => false,
    };
    if expired {
        bucket.remove(key);
        metrics::CACHE_EVICTIONS
            .with_label_values(&["memory", "ttl"])
            .inc();
    }
    metrics::CACHE_MISSES.with_label_values(&["memory"]).inc();
    None
}

/// read the stored version without touching access metadata
pub async fn get_version(key: &str) -> Option<u64> {
    let idx = bucket_idx(key);
    let bucket = BUCKETS[idx].read().await;
    bucket.data.get(key).map(|e| e.version)
}

pub async fn set(key: &str, value: Bytes, ttl_secs: u64, version: u64) -> Result<()> {
    if !get_config().memory_cache.enabled {
        return Ok(());
    }
    let idx = bucket_idx(key);
    let now = now_micros();
    let entry = CacheEntry {
        size: key.len() + value.len(),
        value,
        ttl_secs,
        version,
        inserted_at: now,
        last_accessed: now,
        access_count: 0,
    };
    let mut bucket = BUCKETS[idx].write().await;
    bucket.insert(key.to_string(), entry);
    Ok(())
}

pub async fn del(key: &str) -> Result<()> {
    let idx = bucket_idx(key);
    let mut bucket = BUCKETS[idx].write().await;
    bucket.remove(key);
    Ok(())
}

pub async fn exist(key: &str) -> bool {
    let idx = bucket_idx(key);
    let bucket = BUCKETS[idx].read().await;
    match bucket.data.get(key) {
        Some(entry) => !entry.is_expired(now_micros()),
        None => false,
    }
}

/// drop expired entries, refresh gauges; called by the background gc job
pub async fn gc() -> Result<()> {
    let now = now_micros();
    let mut total_entries = 0usize;
    let mut total_bytes = 0usize;
    for bucket in BUCKETS.iter() {
        let mut bucket = bucket.write().await;
        let expired: Vec<String> = bucket
            .data
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            bucket.remove(&key);
            metrics::CACHE_EVICTIONS
                .with_label_values(&["memory", "ttl"])
                .inc();
        }
        total_entries += bucket.data.len();
        total_bytes += bucket.cur_size;
    }
    metrics::CACHE_ENTRIES
        .with_label_values(&["memory"])
        .set(total_entries as i64);
    metrics::CACHE_BYTES
        .with_label_values(&["memory"])
        .set(total_bytes as i64);
    Ok(())
}

pub async fn stats() -> (usize, usize) {
    let mut entries = 0;
    let mut bytes = 0;
    for bucket in BUCKETS.iter() {
        let bucket = bucket.read().await;
        entries += bucket.data.len();
        bytes += bucket.cur_size;
    }
    (entries, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_del() {
        set("k1", Bytes::from_static(b"v1"), 0, 1).await.unwrap();
        assert_eq!(get("k1").await, Some(Bytes::from_static(b"v1")));
        assert!(exist("k1").await);
        del("k1").await.unwrap();
        assert_eq!(get("k1").await, None);
    }

    #[tokio::test]
    async fn test_overwrite_updates_size() {
        set("k2", Bytes::from_static(b"aa"), 0, 1).await.unwrap();
        set("k2", Bytes::from_static(b"bbbb"), 0, 2).await.unwrap();
        assert_eq!(get("k2").await, Some(Bytes::from_static(b"bbbb")));
        assert_eq!(get_version("k2").await, Some(2));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        set("k3", Bytes::from_static(b"v"), 1, 1).await.unwrap();
        // fake the clock by backdating the entry
        {
            let idx = bucket_idx("k3");
            let mut bucket = BUCKETS[idx].write().await;
            bucket.data.get_mut("k3").unwrap().inserted_at -= 2_000_000;
        }
        assert_eq!(get("k3").await, None);
    }

    #[test]
    fn test_bucket_eviction_below_low_watermark() {
        let mut bucket = CacheBucket::new(100, 1000, "lru");
        for i in 0..30 {
            let key = format!("key{i}");
            let entry = CacheEntry {
                value: Bytes::from(vec![0u8; 5]),
                ttl_secs: 0,
                version: 1,
                inserted_at: 0,
                last_accessed: 0,
                access_count: 0,
                size: 10,
            };
            bucket.insert(key, entry);
        }
        // 30 inserts of size 10 into a 100 byte bucket, eviction kicked in
        let cfg = get_config();
        let low = 100 * cfg.memory_cache.low_watermark / 100;
        assert!(bucket.cur_size <= low + 10);
        assert!(!bucket.data.is_empty());
    }

    #[test]
    fn test_volatile_lru_prefers_ttl_keys() {
        let mut strategy = CacheStrategy::new("volatile-lru");
        strategy.insert("persistent".to_string(), false);
        strategy.insert("volatile".to_string(), true);
        let entries = HashMap::new();
        assert_eq!(strategy.victim(&entries), Some("volatile".to_string()));
        assert_eq!(strategy.victim(&entries), Some("persistent".to_string()));
    }
}
