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

//! Tier 2: the shared KV cache. Redis when configured, otherwise an
//! in-process map so single node deployments and tests run without a server.

use std::sync::Arc;

use bytes::Bytes;
use config::{RwHashMap, get_config, utils::time::now_micros};
use tokio::sync::OnceCell;

use crate::errors::*;

#[async_trait::async_trait]
pub trait KvBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn set(&self, key: &str, value: Bytes, ttl_secs: u64) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn del_prefix(&self, prefix: &str) -> Result<()>;
}

static BACKEND: OnceCell<Arc<dyn KvBackend>> = OnceCell::const_new();

pub async fn get_backend() -> &'static Arc<dyn KvBackend> {
    BACKEND
        .get_or_init(|| async {
            let cfg = get_config();
            if cfg.kv_cache.enabled {
                match RedisKv::connect(&cfg.kv_cache.url).await {
                    Ok(backend) => return Arc::new(backend) as Arc<dyn KvBackend>,
                    Err(e) => {
                        log::warn!(
                            "[CACHE] kv backend unreachable, falling back to local map: {e}"
                        );
                    }
                }
            }
            Arc::new(LocalKv::default()) as Arc<dyn KvBackend>
        })
        .await
}

fn full_key(key: &str) -> String {
    format!("{}{}", get_config().kv_cache.key_prefix, key)
}

pub async fn get(key: &str) -> Result<Option<Bytes>> {
    let ret = get_backend().await.get(&full_key(key)).await?;
    if ret.is_some() {
        config::metrics::CACHE_HITS.with_label_values(&["kv"]).inc();
    } else {
        config::metrics::CACHE_MISSES.with_label_values(&["kv"]).inc();
    }
    Ok(ret)
}

pub async fn set(key: &str, value: Bytes, ttl_secs: u64) -> Result<()> {
    get_backend().await.set(&full_key(key), value, ttl_secs).await
}

pub async fn del(key: &str) -> Result<()> {
    get_backend().await.del(&full_key(key)).await
}

pub async fn del_prefix(prefix: &str) -> Result<()> {
    get_backend().await.del_prefix(&full_key(prefix)).await
}

pub struct RedisKv {
    conn: redis::aio::ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(RedisKv { conn })
    }
}

#[async_trait::async_trait]
impl KvBackend for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let ret: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(ret.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.as_ref());
        if ttl_secs > 0 {
            cmd.arg("EX").arg(ttl_secs);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn del_prefix(&self, prefix: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{prefix}*"))
            .query_async(&mut conn)
            .await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct LocalKv {
    // value plus absolute expiry in micros, 0 for no expiry
    data: RwHashMap<String, (Bytes, i64)>,
}

#[async_trait::async_trait]
impl KvBackend for LocalKv {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.data.get(key) {
            Some(item) => {
                let (value, expires_at) = item.value();
                if *expires_at > 0 && *expires_at < now_micros() {
                    drop(item);
                    self.data.remove(key);
                    Ok(None)
                } else {
                    Ok(Some(value.clone()))
                }
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl_secs: u64) -> Result<()> {
        let expires_at = if ttl_secs == 0 {
            0
        } else {
            now_micros() + (ttl_secs as i64) * 1_000_000
        };
        self.data.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn del_prefix(&self, prefix: &str) -> Result<()> {
        self.data.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_kv_roundtrip() {
        let kv = LocalKv::default();
        kv.set("a", Bytes::from_static(b"1"), 0).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(Bytes::from_static(b"1")));
        kv.del("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_local_kv_prefix_delete() {
        let kv = LocalKv::default();
        kv.set("q:1", Bytes::from_static(b"1"), 0).await.unwrap();
        kv.set("q:2", Bytes::from_static(b"2"), 0).await.unwrap();
        kv.set("p:1", Bytes::from_static(b"3"), 0).await.unwrap();
        kv.del_prefix("q:").await.unwrap();
        assert_eq!(kv.get("q:1").await.unwrap(), None);
        assert_eq!(kv.get("q:2").await.unwrap(), None);
        assert!(kv.get("p:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_local_kv_ttl() {
        let kv = LocalKv::default();
        kv.set("t", Bytes::from_static(b"x"), 1).await.unwrap();
        // backdate the expiry
        kv.data.insert(
            "t".to_string(),
            (Bytes::from_static(b"x"), now_micros() - 1),
        );
        assert_eq!(kv.get("t").await.unwrap(), None);
    }
}
