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

//! Rollups: periodic aggregation of fine-granularity records into coarser
//! buckets. Output is written back as ordinary records tagged with the
//! granularity they were derived from.

use std::collections::HashMap;

use config::{
    ider,
    meta::{
        partition::TimeGranularity,
        query::AggFunc,
        record::{PayloadType, Record},
    },
    utils::json,
};
use infra::errors::*;

use super::time::bucket_start;
use crate::service::db::{self, SOURCE_GRANULARITY_TAG, STREAM_TAG};

/// nearest-rank percentile over unsorted samples
pub fn percentile(samples: &mut [f64], p: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((p.clamp(0.0, 1.0) * samples.len() as f64).ceil() as usize).max(1);
    Some(samples[rank - 1])
}

pub fn apply_agg(func: &AggFunc, samples: &mut [f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    match func {
        AggFunc::Count => Some(samples.len() as f64),
        AggFunc::Sum => Some(samples.iter().sum()),
        AggFunc::Avg => Some(samples.iter().sum::<f64>() / samples.len() as f64),
        AggFunc::Min => samples.iter().copied().reduce(f64::min),
        AggFunc::Max => samples.iter().copied().reduce(f64::max),
        AggFunc::Percentile(p) => percentile(samples, *p),
    }
}

/// Aggregate `records` into coarse buckets. Every numeric payload field gets
/// the declared aggregates; the output payload carries `<field>_<agg>`
/// columns plus the sample count.
pub fn rollup_records(
    records: &[Record],
    coarse: TimeGranularity,
    aggs: &[AggFunc],
) -> Result<Vec<Record>> {
    // (tenant, stream, bucket) -> field -> samples
    let mut groups: HashMap<(String, String, i64), HashMap<String, Vec<f64>>> = HashMap::new();

    for record in records {
        // rollup output never feeds the next rollup sweep
        if record.tags.contains_key(SOURCE_GRANULARITY_TAG) {
            continue;
        }
        let stream = record
            .tags
            .get(STREAM_TAG)
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let bucket = bucket_start(coarse, record.timestamp);
        let group_key = (record.tenant.clone(), stream, bucket);
        let fields = groups.entry(group_key).or_default();
        if let Ok(json::Value::Object(payload)) = record.json_payload() {
            for (field, value) in payload {
                if let Some(n) = value.as_f64() {
                    fields.entry(field).or_default().push(n);
                }
            }
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for ((tenant, stream, bucket), fields) in groups {
        let mut payload = json::Map::new();
        let mut samples_total = 0usize;
        for (field, mut samples) in fields {
            samples_total = samples_total.max(samples.len());
            for agg in aggs {
                if let Some(value) = apply_agg(agg, &mut samples) {
                    let suffix = agg_suffix(agg);
                    payload.insert(format!("{field}_{suffix}"), json::json!(value));
                }
            }
        }
        payload.insert("samples".to_string(), json::json!(samples_total));

        out.push(Record {
            id: format!("rollup_{}", ider::generate()),
            tenant,
            timestamp: bucket,
            geo: None,
            payload: json::to_vec(&json::Value::Object(payload))?,
            payload_type: PayloadType::Json,
            tags: HashMap::from([
                (STREAM_TAG.to_string(), stream),
                (
                    SOURCE_GRANULARITY_TAG.to_string(),
                    fine_granularity_label(records),
                ),
            ]),
        });
    }
    out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    Ok(out)
}

fn fine_granularity_label(records: &[Record]) -> String {
    records
        .iter()
        .find_map(|r| r.tags.get(SOURCE_GRANULARITY_TAG).cloned())
        .unwrap_or_else(|| "raw".to_string())
}

fn agg_suffix(func: &AggFunc) -> String {
    match func {
        AggFunc::Count => "count".to_string(),
        AggFunc::Sum => "sum".to_string(),
        AggFunc::Avg => "avg".to_string(),
        AggFunc::Min => "min".to_string(),
        AggFunc::Max => "max".to_string(),
        AggFunc::Percentile(p) => format!("p{}", (p * 100.0) as u32),
    }
}

/// one rollup sweep over everything stored at the configured granularity
pub async fn run() -> Result<usize> {
    let cfg = config::get_config();
    let fine: TimeGranularity = cfg
        .partition
        .time_granularity
        .parse()
        .map_err(Error::Message)?;
    let Some(coarse) = fine.coarser() else {
        return Ok(0);
    };

    let mut records = Vec::new();
    for partition in db::list_partitions() {
        if let Ok(mut batch) = db::partition_records(&partition.key) {
            records.append(&mut batch);
        }
    }
    records.dedup_by(|a, b| a.id == b.id);

    let aggs = [
        AggFunc::Count,
        AggFunc::Sum,
        AggFunc::Avg,
        AggFunc::Min,
        AggFunc::Max,
        AggFunc::Percentile(0.95),
    ];
    let rolled = rollup_records(&records, coarse, &aggs)?;
    let count = rolled.len();
    for record in rolled {
        match db::write_record(record) {
            Ok(_) => {}
            Err(Error::ErrorCode(ErrorCodes::DuplicateId(_))) => {}
            Err(e) => return Err(e),
        }
    }
    if count > 0 {
        log::info!("[ROLLUP] wrote {count} {coarse} records");
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, ts: i64, amount: f64) -> Record {
        Record {
            id: id.to_string(),
            tenant: "default".to_string(),
            timestamp: ts,
            geo: None,
            payload: json::to_vec(&json::json!({"amount": amount})).unwrap(),
            payload_type: PayloadType::Json,
            tags: HashMap::from([(STREAM_TAG.to_string(), "metrics".to_string())]),
        }
    }

    fn micros(s: &str) -> i64 {
        config::utils::time::parse_str_to_time(s)
            .unwrap()
            .timestamp_micros()
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let mut samples = vec![15.0, 20.0, 35.0, 40.0, 50.0];
        assert_eq!(percentile(&mut samples, 0.3), Some(20.0));
        assert_eq!(percentile(&mut samples, 1.0), Some(50.0));
        assert_eq!(percentile(&mut [], 0.5), None);
    }

    #[test]
    fn test_rollup_buckets_and_aggregates() {
        let records = vec![
            record("a", micros("2024-01-01T10:05:00Z"), 10.0),
            record("b", micros("2024-01-01T10:45:00Z"), 30.0),
            record("c", micros("2024-01-01T11:05:00Z"), 5.0),
        ];
        let rolled = rollup_records(
            &records,
            TimeGranularity::Hour,
            &[AggFunc::Sum, AggFunc::Avg, AggFunc::Count],
        )
        .unwrap();
        assert_eq!(rolled.len(), 2);
        let first = &rolled[0];
        assert_eq!(first.timestamp, micros("2024-01-01T10:00:00Z"));
        let payload: json::Value = json::from_slice(&first.payload).unwrap();
        assert_eq!(payload["amount_sum"], json::json!(40.0));
        assert_eq!(payload["amount_avg"], json::json!(20.0));
        assert_eq!(payload["amount_count"], json::json!(2.0));
        assert_eq!(first.tags.get(SOURCE_GRANULARITY_TAG).unwrap(), "raw");
    }

    #[test]
    fn test_rollup_skips_rollup_output() {
        let mut r = record("r", micros("2024-01-01T10:00:00Z"), 1.0);
        r.tags
            .insert(SOURCE_GRANULARITY_TAG.to_string(), "hour".to_string());
        let rolled =
            rollup_records(&[r], TimeGranularity::Day, &[AggFunc::Count]).unwrap();
        assert!(rolled.is_empty());
    }
}
