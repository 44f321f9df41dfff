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

//! Partition segments on disk: a directory per partition, one json-lines
//! file per segment, and a manifest listing every segment with its checksum.

use std::{
    fs,
    path::{Path, PathBuf},
};

use config::{get_config, meta::record::Record, utils::json};
use infra::errors::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub segment_id: u64,
    pub record_count: u64,
    pub min_ts: i64,
    pub max_ts: i64,
    pub checksum: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub partition: String,
    pub segments: Vec<SegmentMeta>,
}

pub fn partition_dir(partition_key: &str) -> PathBuf {
    let cfg = get_config();
    Path::new(&cfg.common.data_partition_dir).join(sanitize(partition_key))
}

fn sanitize(key: &str) -> String {
    key.replace(['/', ':', '+'], "_")
}

fn segment_file(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("{segment_id:06}.jsonl"))
}

fn manifest_file(dir: &Path) -> PathBuf {
    dir.join("manifest.json")
}

pub fn encode_records(records: &[Record]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for record in records {
        buf.extend_from_slice(json::to_vec(record)?.as_slice());
        buf.push(b'\n');
    }
    Ok(buf)
}

pub fn decode_records(data: &[u8]) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for line in data.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        records.push(json::from_slice(line)?);
    }
    Ok(records)
}

/// append the records as a new segment and extend the manifest
pub fn flush(partition_key: &str, records: &[Record]) -> Result<SegmentMeta> {
    if records.is_empty() {
        return Err(Error::Message("nothing to flush".to_string()));
    }
    let dir = partition_dir(partition_key);
    fs::create_dir_all(&dir)?;

    let mut manifest = load_manifest(partition_key)?.unwrap_or_else(|| Manifest {
        partition: partition_key.to_string(),
        segments: Vec::new(),
    });
    let segment_id = manifest.segments.last().map(|s| s.segment_id + 1).unwrap_or(1);

    let data = encode_records(records)?;
    let meta = SegmentMeta {
        segment_id,
        record_count: records.len() as u64,
        min_ts: records.iter().map(|r| r.timestamp).min().unwrap_or(0),
        max_ts: records.iter().map(|r| r.timestamp).max().unwrap_or(0),
        checksum: sha256::digest(data.as_slice()),
    };
    fs::write(segment_file(&dir, segment_id), &data)?;
    manifest.segments.push(meta.clone());
    fs::write(manifest_file(&dir), json::to_vec(&manifest)?)?;
    Ok(meta)
}

pub fn load_manifest(partition_key: &str) -> Result<Option<Manifest>> {
    let path = manifest_file(&partition_dir(partition_key));
    match fs::read(&path) {
        Ok(data) => Ok(Some(json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// read every segment back, verifying checksums
pub fn load_records(partition_key: &str) -> Result<Vec<Record>> {
    let dir = partition_dir(partition_key);
    let manifest = load_manifest(partition_key)?.ok_or_else(|| {
        Error::ErrorCode(ErrorCodes::PartitionNotFound(partition_key.to_string()))
    })?;
    let mut records = Vec::new();
    for meta in &manifest.segments {
        let data = fs::read(segment_file(&dir, meta.segment_id))?;
        let checksum = sha256::digest(data.as_slice());
        if checksum != meta.checksum {
            return Err(Error::ErrorCode(ErrorCodes::ChecksumMismatch(format!(
                "{partition_key} segment {}",
                meta.segment_id
            ))));
        }
        records.append(&mut decode_records(&data)?);
    }
    Ok(records)
}

pub fn remove(partition_key: &str) -> Result<()> {
    let dir = partition_dir(partition_key);
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use config::meta::record::PayloadType;

    use super::*;

    fn record(id: &str, ts: i64) -> Record {
        Record {
            id: id.to_string(),
            tenant: "default".to_string(),
            timestamp: ts,
            geo: None,
            payload: br#"{"n":1}"#.to_vec(),
            payload_type: PayloadType::Json,
            tags: HashMap::new(),
        }
    }

    #[test]
    fn test_flush_and_load() {
        let records = vec![record("a", 10), record("b", 20)];
        let key = "time/day/seg-test-1";
        let _ = remove(key);
        let meta = flush(key, &records).unwrap();
        assert_eq!(meta.segment_id, 1);
        assert_eq!(meta.record_count, 2);
        assert_eq!(meta.min_ts, 10);
        assert_eq!(meta.max_ts, 20);

        let loaded = load_records(key).unwrap();
        assert_eq!(loaded, records);
        remove(key).unwrap();
    }

    #[test]
    fn test_corrupt_segment_detected() {
        let key = "time/day/seg-test-2";
        let _ = remove(key);
        flush(key, &[record("a", 10)]).unwrap();
        let path = segment_file(&partition_dir(key), 1);
        let mut data = fs::read(&path).unwrap();
        data[0] ^= 0xff;
        fs::write(&path, data).unwrap();
        assert!(matches!(
            load_records(key),
            Err(Error::ErrorCode(ErrorCodes::ChecksumMismatch(_)))
        ));
        remove(key).unwrap();
    }

    #[test]
    fn test_segments_accumulate() {
        let key = "time/day/seg-test-3";
        let _ = remove(key);
        flush(key, &[record("a", 10)]).unwrap();
        let meta = flush(key, &[record("b", 20)]).unwrap();
        assert_eq!(meta.segment_id, 2);
        let manifest = load_manifest(key).unwrap().unwrap();
        assert_eq!(manifest.segments.len(), 2);
        assert_eq!(load_records(key).unwrap().len(), 2);
        remove(key).unwrap();
    }
}
