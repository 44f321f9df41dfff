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

//! The two-tier cache. Tier 1 is the in-process memory cache, tier 2 the
//! shared KV store. Reads go T1 then T2 then recompute; the recompute path is
//! single-flight per key.

pub mod codec;
pub mod kv;
pub mod memory;

use std::str::FromStr;

use bytes::Bytes;
use config::{get_config, utils::rand::get_rand_jitter};

use crate::{errors::*, local_lock};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Consistency {
    /// write-through with post-write verification
    Strict,
    /// T2 immediately, T1 invalidated and lazily repopulated
    Eventual,
    /// best effort, T2 failures are swallowed
    Relaxed,
}

impl FromStr for Consistency {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Consistency::Strict),
            "eventual" => Ok(Consistency::Eventual),
            "relaxed" => Ok(Consistency::Relaxed),
            _ => Err(format!("Invalid cache consistency mode: {s}")),
        }
    }
}

fn consistency() -> Consistency {
    get_config()
        .kv_cache
        .consistency
        .parse()
        .unwrap_or(Consistency::Eventual)
}

/// ttl spread against synchronized expiry of hot keys
fn jittered_ttl(base_ttl_secs: u64) -> u64 {
    if base_ttl_secs == 0 {
        return 0;
    }
    let jitter = get_rand_jitter(get_config().kv_cache.ttl_jitter);
    ((base_ttl_secs as f64) * (1.0 + jitter)).max(1.0) as u64
}

pub async fn init() -> Result<()> {
    memory::init().await?;
    Ok(())
}

pub async fn get(key: &str) -> Result<Option<Bytes>> {
    if let Some(value) = memory::get(key).await {
        return Ok(Some(value));
    }
    let ret = match kv::get(key).await {
        Ok(ret) => ret,
        Err(e) => {
            if consistency() == Consistency::Strict {
                return Err(e);
            }
            log::warn!("[CACHE] kv read failed, treating as miss: {e}");
            None
        }
    };
    if let Some(value) = &ret {
        // backfill tier 1 so the next read stays local
        memory::set(key, value.clone(), get_config().query.result_cache_ttl, 0).await?;
    }
    Ok(ret)
}

pub async fn set(key: &str, value: Bytes, base_ttl_secs: u64, version: u64) -> Result<()> {
    let ttl = jittered_ttl(base_ttl_secs);
    match consistency() {
        Consistency::Strict => {
            let (t1, t2) = tokio::join!(
                memory::set(key, value.clone(), ttl, version),
                kv::set(key, value.clone(), ttl)
            );
            t1?;
            t2?;
            // post-write verification, reads must see this write
            let read_back = kv::get(key).await?;
            if read_back.as_ref() != Some(&value) {
                return Err(Error::Message(format!(
                    "strict cache write verification failed for key {key}"
                )));
            }
            Ok(())
        }
        Consistency::Eventual => {
            kv::set(key, value, ttl).await?;
            memory::del(key).await?;
            Ok(())
        }
        Consistency::Relaxed => {
            let (t1, t2) = tokio::join!(
                memory::set(key, value.clone(), ttl, version),
                kv::set(key, value, ttl)
            );
            t1?;
            if let Err(e) = t2 {
                log::warn!("[CACHE] kv write failed in relaxed mode: {e}");
            }
            Ok(())
        }
    }
}

pub async fn del(key: &str) -> Result<()> {
    let (t1, t2) = tokio::join!(memory::del(key), kv::del(key));
    t1?;
    t2?;
    Ok(())
}

/// invalidate every key under a prefix, used on source version bumps
pub async fn del_prefix(prefix: &str) -> Result<()> {
    kv::del_prefix(prefix).await
}

/// Single-flight lookup: on a miss the first caller computes while
/// concurrent callers wait on the key lock; when the computation times out
/// the lock is released and waiters retry themselves.
pub async fn get_or_compute<F, Fut>(
    key: &str,
    base_ttl_secs: u64,
    version: u64,
    compute: F,
) -> Result<(Bytes, bool)>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<Bytes>>,
{
    if let Some(value) = get(key).await? {
        return Ok((value, true));
    }

    let timeout = std::time::Duration::from_secs(get_config().kv_cache.compute_timeout);
    let _guard = match local_lock::lock_with_timeout(&format!("cache/{key}"), timeout).await {
        Some(guard) => guard,
        None => {
            return Err(Error::ErrorCode(ErrorCodes::Timeout(format!(
                "cache single-flight wait for {key}"
            ))));
        }
    };

    // double check, another flight may have landed while we waited
    if let Some(value) = get(key).await? {
        return Ok((value, true));
    }

    let value = match tokio::time::timeout(timeout, compute()).await {
        Ok(value) => value?,
        Err(_) => {
            return Err(Error::ErrorCode(ErrorCodes::Timeout(format!(
                "cache computation for {key}"
            ))));
        }
    };
    set(key, value.clone(), base_ttl_secs, version).await?;
    Ok((value, false))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn test_jittered_ttl_bounds() {
        for _ in 0..100 {
            let ttl = jittered_ttl(60);
            assert!((54..=66).contains(&ttl), "ttl {ttl} out of jitter range");
        }
        assert_eq!(jittered_ttl(0), 0);
    }

    #[tokio::test]
    async fn test_single_flight_computes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let (value, _) = get_or_compute("sf_key", 60, 1, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(Bytes::from_static(b"computed"))
                })
                .await
                .unwrap();
                value
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Bytes::from_static(b"computed"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
