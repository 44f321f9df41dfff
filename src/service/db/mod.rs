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

//! The partition-local record store. Records are written once and never
//! updated; partitions carry the statistics the optimizer reads. Segments
//! are persisted under a directory per partition with a manifest listing
//! `(segment_id, record_count, min_ts, max_ts, checksum)`.

pub mod segment;

use config::{
    COLUMN_RECORD_ID, COLUMN_TIMESTAMP, RwHashMap,
    meta::{
        partition::{ColumnStats, Partition, PartitionKey, PartitionState},
        record::Record,
    },
    utils::{flatten, json},
};
use infra::errors::*;
use once_cell::sync::Lazy;

use super::partition::{encode_all, temporal::TemporalIndex};

static RECORDS: Lazy<RwHashMap<String, Record>> = Lazy::new(Default::default);
static PARTITIONS: Lazy<RwHashMap<String, Partition>> = Lazy::new(Default::default);
pub static TEMPORAL_INDEX: Lazy<TemporalIndex> = Lazy::new(TemporalIndex::new);

pub const STREAM_TAG: &str = "stream";
pub const SOURCE_GRANULARITY_TAG: &str = "source_granularity";

/// Write one record: assign it to every active strategy, bump partition
/// versions, refresh statistics. Returns the assigned keys, primary (time)
/// key first.
pub fn write_record(record: Record) -> Result<Vec<PartitionKey>> {
    if RECORDS.contains_key(&record.id) {
        return Err(Error::ErrorCode(ErrorCodes::DuplicateId(record.id)));
    }
    let keys = encode_all(&record);
    if keys.is_empty() {
        return Err(Error::ErrorCode(ErrorCodes::InvalidRequest(
            "record matched no partitioning strategy".to_string(),
        )));
    }
    for key in &keys {
        let key_str = key.to_string();
        let mut partition = PARTITIONS
            .entry(key_str.clone())
            .or_insert_with(|| new_partition(&key_str, &record));
        apply_record(&mut partition, &record);
        drop(partition);
        if let PartitionKey::Time { granularity, start } = key {
            let end = super::partition::time::bucket_end(*granularity, *start);
            TEMPORAL_INDEX.insert(*start, end, &key_str);
        }
    }
    RECORDS.insert(record.id.clone(), record);
    Ok(keys)
}

fn new_partition(key: &str, record: &Record) -> Partition {
    Partition {
        key: key.to_string(),
        record_ids: Vec::new(),
        size_bytes: 0,
        record_count: 0,
        min_ts: record.timestamp,
        max_ts: record.timestamp,
        bounds: None,
        stats: Default::default(),
        state: PartitionState::Active,
        version: 0,
    }
}

fn apply_record(partition: &mut Partition, record: &Record) {
    partition.record_ids.push(record.id.clone());
    partition.record_count += 1;
    partition.size_bytes += record.size() as u64;
    partition.min_ts = partition.min_ts.min(record.timestamp);
    partition.max_ts = partition.max_ts.max(record.timestamp);
    partition.version += 1;
    if let Ok(row) = record_to_row(record) {
        if let Some(obj) = row.as_object() {
            for (field, value) in obj {
                update_column_stats(partition.stats.entry(field.clone()).or_default(), value);
            }
        }
    }
}

fn update_column_stats(stats: &mut ColumnStats, value: &json::Value) {
    stats.row_count += 1;
    let replace_min = match &stats.min {
        Some(min) => json_lt(value, min),
        None => true,
    };
    if replace_min {
        stats.min = Some(value.clone());
    }
    let replace_max = match &stats.max {
        Some(max) => json_lt(max, value),
        None => true,
    };
    if replace_max {
        stats.max = Some(value.clone());
    }
    // cheap distinct estimate: grow until the histogram saturates
    if stats.histogram.len() < 16 {
        stats.histogram.push(1);
        stats.distinct_count = stats.histogram.len() as u64;
    } else {
        let idx = (config::utils::hash::sum64(&value.to_string()) % 16) as usize;
        stats.histogram[idx] += 1;
        stats.distinct_count = stats.distinct_count.max(16);
    }
}

fn json_lt(a: &json::Value, b: &json::Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a < b,
        _ => a.to_string() < b.to_string(),
    }
}

/// a record as the flat row shape query execution sees
pub fn record_to_row(record: &Record) -> Result<json::Value> {
    let mut row = match record.json_payload() {
        Ok(payload @ json::Value::Object(_)) => flatten::flatten(payload)
            .map_err(|e| Error::Message(e.to_string()))?,
        Ok(other) => json::json!({ "payload": other }),
        Err(_) => json::json!({}),
    };
    let obj = row.as_object_mut().expect("row is always an object");
    obj.insert(COLUMN_TIMESTAMP.to_string(), json::json!(record.timestamp));
    obj.insert(COLUMN_RECORD_ID.to_string(), json::json!(record.id));
    for (k, v) in &record.tags {
        obj.entry(format!("tag_{k}")).or_insert(json::json!(v));
    }
    if let Some(geo) = &record.geo {
        obj.insert("geo_lat".to_string(), json::json!(geo.lat));
        obj.insert("geo_lon".to_string(), json::json!(geo.lon));
    }
    Ok(row)
}

pub fn get_partition(key: &str) -> Option<Partition> {
    PARTITIONS.get(key).map(|p| p.clone())
}

pub fn list_partitions() -> Vec<Partition> {
    PARTITIONS.iter().map(|p| p.clone()).collect()
}

pub fn partition_records(key: &str) -> Result<Vec<Record>> {
    let partition = PARTITIONS
        .get(key)
        .ok_or_else(|| Error::ErrorCode(ErrorCodes::PartitionNotFound(key.to_string())))?;
    Ok(partition
        .record_ids
        .iter()
        .filter_map(|id| RECORDS.get(id).map(|r| r.clone()))
        .collect())
}

pub fn set_partition_state(key: &str, state: PartitionState) -> Result<()> {
    match PARTITIONS.get_mut(key) {
        Some(mut partition) => {
            partition.state = state;
            Ok(())
        }
        None => Err(Error::ErrorCode(ErrorCodes::PartitionNotFound(
            key.to_string(),
        ))),
    }
}

/// drop a partition and any record that no longer belongs to one
pub fn remove_partition(key: &str) -> Result<()> {
    let Some((_, partition)) = PARTITIONS.remove(key) else {
        return Err(Error::ErrorCode(ErrorCodes::PartitionNotFound(
            key.to_string(),
        )));
    };
    TEMPORAL_INDEX.remove_partition(key);
    for id in &partition.record_ids {
        let still_referenced = PARTITIONS
            .iter()
            .any(|p| p.record_ids.iter().any(|r| r == id));
        if !still_referenced {
            RECORDS.remove(id);
        }
    }
    Ok(())
}

/// rows of a stream, optionally limited to a set of partitions
pub fn scan(
    tenant: &str,
    stream: &str,
    partitions: Option<&[String]>,
) -> Result<Vec<json::Value>> {
    let mut rows = Vec::new();
    match partitions {
        Some(keys) => {
            let mut seen = hashbrown::HashSet::new();
            for key in keys {
                let Some(partition) = PARTITIONS.get(key) else {
                    continue;
                };
                for id in &partition.record_ids {
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    if let Some(record) = RECORDS.get(id) {
                        if record_matches(&record, tenant, stream) {
                            rows.push(record_to_row(&record)?);
                        }
                    }
                }
            }
        }
        None => {
            for record in RECORDS.iter() {
                if record_matches(&record, tenant, stream) {
                    rows.push(record_to_row(&record)?);
                }
            }
        }
    }
    Ok(rows)
}

fn record_matches(record: &Record, tenant: &str, stream: &str) -> bool {
    record.tenant == tenant
        && record
            .tags
            .get(STREAM_TAG)
            .map(|s| s == stream)
            .unwrap_or(stream == "default")
}

pub fn reset_for_tests() {
    RECORDS.clear();
    PARTITIONS.clear();
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use config::meta::record::PayloadType;

    use super::*;

    fn record(id: &str, ts: i64, stream: &str) -> Record {
        Record {
            id: id.to_string(),
            tenant: "default".to_string(),
            timestamp: ts,
            geo: None,
            payload: br#"{"user_id":"u1","amount":5}"#.to_vec(),
            payload_type: PayloadType::Json,
            tags: HashMap::from([(STREAM_TAG.to_string(), stream.to_string())]),
        }
    }

    #[test]
    fn test_write_and_scan() {
        crate::service::partition::init().unwrap();
        let keys = write_record(record("db_r1", 1704067200000000, "events")).unwrap();
        assert!(!keys.is_empty());
        // duplicate ids conflict
        assert!(matches!(
            write_record(record("db_r1", 1704067200000000, "events")),
            Err(Error::ErrorCode(ErrorCodes::DuplicateId(_)))
        ));
        let rows = scan("default", "events", None).unwrap();
        assert!(rows.iter().any(|r| r[COLUMN_RECORD_ID] == "db_r1"));
        let row = rows.iter().find(|r| r[COLUMN_RECORD_ID] == "db_r1").unwrap();
        assert_eq!(row["user_id"], "u1");
        assert_eq!(row["amount"], 5);
    }

    #[test]
    fn test_partition_stats_accumulate() {
        crate::service::partition::init().unwrap();
        write_record(record("db_s1", 1704067200000000, "stats_stream")).unwrap();
        write_record(record("db_s2", 1704067201000000, "stats_stream")).unwrap();
        let partition = list_partitions()
            .into_iter()
            .find(|p| p.record_ids.contains(&"db_s1".to_string()))
            .unwrap();
        assert!(partition.record_count >= 2);
        assert!(partition.version >= 2);
        let stats = partition.stats.get("amount").unwrap();
        assert_eq!(stats.min, Some(json::json!(5)));
    }
}
