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

//! Retention enforcement. Policies are per event type; expired partitions
//! are archived to cold storage (optionally gzipped) and their metadata is
//! deleted only after the archive is confirmed readable.

use std::io::Write as IoWrite;

use bytes::Bytes;
use config::{RwHashMap, get_config, utils::time::now_micros};
use flate2::{Compression, write::GzEncoder};
use infra::{errors::*, storage};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::service::db::{self, STREAM_TAG, segment};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub event_type: String,
    pub retain_secs: u64,
    #[serde(default)]
    pub archive: bool,
    #[serde(default)]
    pub compress: bool,
}

static POLICIES: Lazy<RwHashMap<String, RetentionPolicy>> = Lazy::new(Default::default);

pub fn set_policy(policy: RetentionPolicy) {
    POLICIES.insert(policy.event_type.clone(), policy);
}

pub fn get_policy(event_type: &str) -> Option<RetentionPolicy> {
    POLICIES.get(event_type).map(|p| p.clone())
}

pub fn list_policies() -> Vec<RetentionPolicy> {
    POLICIES.iter().map(|p| p.clone()).collect()
}

/// the policy covering a partition is the most generous one among the event
/// types present in it; absent any policy the config default applies
fn effective_policy(streams: &[String]) -> Option<RetentionPolicy> {
    let mut best: Option<RetentionPolicy> = None;
    for stream in streams {
        if let Some(policy) = get_policy(stream) {
            best = Some(match best {
                Some(current) if current.retain_secs >= policy.retain_secs => current,
                _ => policy,
            });
        }
    }
    if best.is_some() {
        return best;
    }
    let default_days = get_config().retention.default_days;
    if default_days == 0 {
        return None;
    }
    Some(RetentionPolicy {
        event_type: "*".to_string(),
        retain_secs: default_days * 86400,
        archive: true,
        compress: get_config().retention.archive_compress,
    })
}

/// one enforcement sweep; returns the number of partitions expired
pub async fn enforce() -> Result<usize> {
    let now = now_micros();
    let mut expired = 0;
    for partition in db::list_partitions() {
        let records = match db::partition_records(&partition.key) {
            Ok(records) => records,
            Err(_) => continue,
        };
        if records.is_empty() {
            continue;
        }
        let streams: Vec<String> = records
            .iter()
            .filter_map(|r| r.tags.get(STREAM_TAG).cloned())
            .collect();
        let Some(policy) = effective_policy(&streams) else {
            continue;
        };
        let cutoff = now - (policy.retain_secs as i64) * 1_000_000;
        if partition.max_ts >= cutoff {
            continue;
        }

        if policy.archive {
            let name = archive_name(&partition.key, policy.compress);
            let data = segment::encode_records(&records)?;
            let data = if policy.compress { gzip(&data)? } else { data };
            storage::put(&name, Bytes::from(data)).await?;
            // delete metadata only after the archive is confirmed
            if !storage::exist(&name).await {
                return Err(Error::Message(format!(
                    "archive confirmation failed for {name}"
                )));
            }
            log::info!("[RETENTION] archived {} to {name}", partition.key);
        }
        segment::remove(&partition.key)?;
        db::remove_partition(&partition.key)?;
        expired += 1;
        log::info!("[RETENTION] expired partition {}", partition.key);
    }
    Ok(expired)
}

fn archive_name(partition_key: &str, compress: bool) -> String {
    let safe = partition_key.replace(['/', ':', '+'], "_");
    if compress {
        format!("archive/{safe}.jsonl.gz")
    } else {
        format!("archive/{safe}.jsonl")
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_policy_picks_longest() {
        set_policy(RetentionPolicy {
            event_type: "ret_short".to_string(),
            retain_secs: 60,
            archive: false,
            compress: false,
        });
        set_policy(RetentionPolicy {
            event_type: "ret_long".to_string(),
            retain_secs: 3600,
            archive: true,
            compress: true,
        });
        let policy =
            effective_policy(&["ret_short".to_string(), "ret_long".to_string()]).unwrap();
        assert_eq!(policy.retain_secs, 3600);
    }

    #[test]
    fn test_no_policy_no_default_keeps_forever() {
        // default_days defaults to 0
        assert!(effective_policy(&["ret_unknown".to_string()]).is_none());
    }

    #[test]
    fn test_gzip_roundtrip() {
        use std::io::Read;
        let data = b"some archived records".repeat(50);
        let packed = gzip(&data).unwrap();
        assert!(packed.len() < data.len());
        let mut decoder = flate2::read::GzDecoder::new(packed.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }
}
