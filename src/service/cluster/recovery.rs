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

//! Backup and restore. A backup is the partition's records plus a SHA-256
//! sidecar (`{partition}.{version}.bak` / `.sha256`); restore verifies the
//! checksum before replaying anything, and a checksum mismatch quarantines
//! the partition instead of feeding it corrupt data.

use bytes::Bytes;
use config::meta::partition::PartitionState;
use infra::{errors::*, storage};

use crate::service::db::{self, segment};

fn backup_name(partition_key: &str, version: u64) -> String {
    let safe = partition_key.replace(['/', ':', '+'], "_");
    format!("backup/{safe}.{version}.bak")
}

fn sidecar_name(backup: &str) -> String {
    format!("{backup}.sha256")
}

/// snapshot one partition to cold storage; returns the backup object name
pub async fn backup(partition_key: &str) -> Result<String> {
    let partition = db::get_partition(partition_key).ok_or_else(|| {
        Error::ErrorCode(ErrorCodes::PartitionNotFound(partition_key.to_string()))
    })?;
    let records = db::partition_records(partition_key)?;
    let data = segment::encode_records(&records)?;
    let digest = sha256::digest(data.as_slice());

    let name = backup_name(partition_key, partition.version);
    storage::put(&name, Bytes::from(data)).await?;
    storage::put(&sidecar_name(&name), Bytes::from(digest.clone())).await?;
    log::info!(
        "[RECOVERY] backup {name} written, {} records, sha256 {digest}",
        records.len()
    );
    Ok(name)
}

/// latest backup version available for a partition
pub async fn latest_backup_version(partition_key: &str) -> Result<Option<u64>> {
    let safe = partition_key.replace(['/', ':', '+'], "_");
    let files = storage::list("backup/").await?;
    let mut versions: Vec<u64> = files
        .iter()
        .filter_map(|f| {
            let name = f.strip_prefix("backup/")?;
            let rest = name.strip_prefix(&format!("{safe}."))?;
            let version = rest.strip_suffix(".bak")?;
            version.parse().ok()
        })
        .collect();
    versions.sort_unstable();
    Ok(versions.pop())
}

/// Restore a partition from its backup: verify the checksum, replay into a
/// fresh primary copy, then re-seed the replicas. A bad checksum quarantines
/// the partition and surfaces as corrupt.
pub async fn restore(partition_key: &str, version: Option<u64>) -> Result<usize> {
    let version = match version {
        Some(v) => v,
        None => latest_backup_version(partition_key).await?.ok_or_else(|| {
            Error::ErrorCode(ErrorCodes::PartitionNotFound(format!(
                "no backup for {partition_key}"
            )))
        })?,
    };
    let name = backup_name(partition_key, version);
    let data = storage::get(&name).await?;
    let expected = String::from_utf8_lossy(&storage::get(&sidecar_name(&name)).await?)
        .trim()
        .to_string();
    let actual = sha256::digest(data.as_ref());
    if actual != expected {
        let _ = db::set_partition_state(partition_key, PartitionState::Quarantined);
        return Err(Error::ErrorCode(ErrorCodes::ChecksumMismatch(name)));
    }

    let records = segment::decode_records(&data)?;
    // replay into a fresh primary: drop whatever half-state is local
    if db::get_partition(partition_key).is_some() {
        db::remove_partition(partition_key)?;
    }
    let mut restored = 0;
    for record in &records {
        match db::write_record(record.clone()) {
            Ok(_) => restored += 1,
            Err(Error::ErrorCode(ErrorCodes::DuplicateId(_))) => {}
            Err(e) => return Err(e),
        }
    }
    db::set_partition_state(partition_key, PartitionState::Active)?;

    // re-seed replicas from the restored copy
    if let Some(partition) = db::get_partition(partition_key) {
        if let Err(e) =
            super::replication::replicate_write(partition_key, partition.version, records)
                .await
        {
            log::warn!("[RECOVERY] replica re-seed for {partition_key} deferred: {e}");
        }
    }
    log::info!("[RECOVERY] restored {restored} records into {partition_key}");
    Ok(restored)
}

/// Verify local segment data; a corrupt replica is quarantined and refilled
/// from an in-sync peer.
pub async fn verify_and_heal(partition_key: &str) -> Result<bool> {
    match segment::load_records(partition_key) {
        Ok(_) => Ok(true),
        Err(Error::ErrorCode(ErrorCodes::ChecksumMismatch(what))) => {
            log::error!("[RECOVERY] corrupt replica detected: {what}");
            db::set_partition_state(partition_key, PartitionState::Quarantined)?;
            segment::remove(partition_key)?;
            match super::replication::catch_up(partition_key).await {
                Ok(version) => {
                    db::set_partition_state(partition_key, PartitionState::Active)?;
                    log::info!(
                        "[RECOVERY] re-replicated {partition_key} up to version {version}"
                    );
                    Ok(false)
                }
                Err(e) => {
                    log::error!("[RECOVERY] re-replication of {partition_key} failed: {e}");
                    Err(Error::ErrorCode(ErrorCodes::ChecksumMismatch(what)))
                }
            }
        }
        Err(e) => Err(e),
    }
}

/// mark a replica failed so failover never promotes it
pub fn mark_replica_failed(partition_key: &str, node_id: &str) {
    log::warn!("[RECOVERY] replica {node_id} of {partition_key} marked failed");
    super::replication::mark_failed(partition_key, node_id);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use config::meta::record::{PayloadType, Record};

    use super::*;
    use crate::service::db::STREAM_TAG;

    fn record(id: &str, ts: i64) -> Record {
        Record {
            id: id.to_string(),
            tenant: "default".to_string(),
            timestamp: ts,
            geo: None,
            payload: br#"{"n":1}"#.to_vec(),
            payload_type: PayloadType::Json,
            tags: HashMap::from([(STREAM_TAG.to_string(), "backup_stream".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_backup_restore_roundtrip() {
        crate::service::partition::init().unwrap();
        let keys = db::write_record(record("bk-r1", 1704067200000000)).unwrap();
        let partition_key = keys[0].to_string();
        let before = db::partition_records(&partition_key).unwrap();

        let name = backup(&partition_key).await.unwrap();
        assert!(name.ends_with(".bak"));

        // backup then restore reproduces byte-equal partition data
        let restored = restore(&partition_key, None).await.unwrap();
        assert!(restored >= 1);
        let after = db::partition_records(&partition_key).unwrap();
        let before_ids: Vec<&String> = before.iter().map(|r| &r.id).collect();
        assert!(after.iter().all(|r| before_ids.contains(&&r.id)));
        assert_eq!(
            segment::encode_records(&before).unwrap(),
            segment::encode_records(&after).unwrap()
        );
    }

    #[tokio::test]
    async fn test_restore_rejects_corrupt_backup() {
        crate::service::partition::init().unwrap();
        let keys = db::write_record(record("bk-r2", 1704070800000000)).unwrap();
        let partition_key = keys
            .iter()
            .map(|k| k.to_string())
            .find(|k| k.starts_with("time/"))
            .unwrap();
        let name = backup(&partition_key).await.unwrap();

        // corrupt the sidecar so verification must fail
        storage::put(
            &format!("{name}.sha256"),
            bytes::Bytes::from_static(b"deadbeef"),
        )
        .await
        .unwrap();
        let version: u64 = name
            .rsplit('.')
            .nth(1)
            .and_then(|v| v.parse().ok())
            .unwrap();
        assert!(matches!(
            restore(&partition_key, Some(version)).await,
            Err(Error::ErrorCode(ErrorCodes::ChecksumMismatch(_)))
        ));
    }
}
