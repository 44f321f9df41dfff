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

//! Cold storage for archives and backups. Local disk by default; the
//! `:memory:` sentinel keeps everything in process for tests.

use bytes::Bytes;
use config::get_config;
use futures::TryStreamExt;
use object_store::{ObjectStore, local::LocalFileSystem, memory::InMemory, path::Path};
use once_cell::sync::Lazy;

use crate::errors::*;

static DEFAULT: Lazy<Box<dyn ObjectStore>> = Lazy::new(default);

fn default() -> Box<dyn ObjectStore> {
    let cfg = get_config();
    if cfg.common.cold_storage_dir == ":memory:" {
        return Box::new(InMemory::new());
    }
    std::fs::create_dir_all(&cfg.common.cold_storage_dir)
        .expect("create cold storage dir success");
    Box::new(
        LocalFileSystem::new_with_prefix(&cfg.common.cold_storage_dir)
            .expect("open cold storage dir success"),
    )
}

pub async fn put(file: &str, data: Bytes) -> Result<()> {
    DEFAULT.put(&Path::from(file), data.into()).await?;
    Ok(())
}

pub async fn get(file: &str) -> Result<Bytes> {
    let data = DEFAULT.get(&Path::from(file)).await?;
    let data = data.bytes().await?;
    Ok(data)
}

pub async fn exist(file: &str) -> bool {
    DEFAULT.head(&Path::from(file)).await.is_ok()
}

pub async fn del(files: &[&str]) -> Result<()> {
    if files.is_empty() {
        return Ok(());
    }
    for file in files {
        if let Err(e) = DEFAULT.delete(&Path::from(*file)).await {
            log::error!("[STORAGE] delete {file} error: {e}");
        }
    }
    Ok(())
}

pub async fn list(prefix: &str) -> Result<Vec<String>> {
    let prefix = Path::from(prefix);
    let files = DEFAULT
        .list(Some(&prefix))
        .map_ok(|meta| meta.location.to_string())
        .try_collect::<Vec<String>>()
        .await?;
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list_del() {
        let store = InMemory::new();
        store
            .put(&Path::from("backup/p1.1.bak"), Bytes::from_static(b"data").into())
            .await
            .unwrap();
        store
            .put(
                &Path::from("backup/p1.1.bak.sha256"),
                Bytes::from_static(b"digest").into(),
            )
            .await
            .unwrap();

        let got = store.get(&Path::from("backup/p1.1.bak")).await.unwrap();
        assert_eq!(got.bytes().await.unwrap(), Bytes::from_static(b"data"));

        let listed: Vec<String> = store
            .list(Some(&Path::from("backup")))
            .map_ok(|m| m.location.to_string())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);

        store.delete(&Path::from("backup/p1.1.bak")).await.unwrap();
        assert!(store.get(&Path::from("backup/p1.1.bak")).await.is_err());
    }
}
