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

//! Key level async locks. The single-flight path of the cache takes the key
//! lock before recomputing, so concurrent misses on the same key collapse to
//! one computation.

use std::sync::Arc;

use config::RwHashMap;
use once_cell::sync::Lazy;
use tokio::sync::{Mutex, OwnedMutexGuard};

static LOCAL_LOCKER: Lazy<RwHashMap<String, Arc<Mutex<()>>>> = Lazy::new(Default::default);

pub async fn lock(key: &str) -> OwnedMutexGuard<()> {
    let mutex = LOCAL_LOCKER
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone();
    mutex.lock_owned().await
}

/// like [`lock`] but gives up after `timeout`; the caller retries or fails
pub async fn lock_with_timeout(
    key: &str,
    timeout: std::time::Duration,
) -> Option<OwnedMutexGuard<()>> {
    let mutex = LOCAL_LOCKER
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone();
    tokio::time::timeout(timeout, mutex.lock_owned()).await.ok()
}

/// drop idle lock entries, called from the cache gc job
pub fn gc() {
    LOCAL_LOCKER.retain(|_, v| Arc::strong_count(v) > 1);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::{
        sync::RwLock,
        time::{Duration, sleep},
    };

    use super::*;

    #[tokio::test]
    async fn test_concurrent_lock_access() {
        let shared_data = Arc::new(RwLock::new(0));
        let num_tasks = 5;
        let mut handles = Vec::new();

        for _ in 0..num_tasks {
            let shared_data = shared_data.clone();
            handles.push(tokio::spawn(async move {
                // all tasks contend on the same key
                let _guard = lock("test_key").await;
                let current = *shared_data.read().await;
                sleep(Duration::from_millis(20)).await;
                if current == 0 {
                    let mut data = shared_data.write().await;
                    *data += 1;
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        // only the first task saw 0 and incremented
        assert_eq!(*shared_data.read().await, 1);
    }

    #[tokio::test]
    async fn test_lock_with_timeout_expires() {
        let _held = lock("held_key").await;
        let got = lock_with_timeout("held_key", Duration::from_millis(50)).await;
        assert!(got.is_none());
    }
}
