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

//! Calendar bucketing. Timestamps are normalized to UTC before bucketing;
//! boundaries are inclusive below and exclusive above. Changing the
//! granularity builds a new index over existing records, it never rewrites
//! them.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use config::meta::{
    partition::{PartitionKey, TimeGranularity},
    record::Record,
};
use geo_types::Polygon;
use infra::errors::*;

use super::{KeyBounds, PartitionStrategy};

pub struct TimeStrategy {
    granularity: TimeGranularity,
}

impl TimeStrategy {
    pub fn new(granularity: TimeGranularity) -> Self {
        TimeStrategy { granularity }
    }
}

impl PartitionStrategy for TimeStrategy {
    fn name(&self) -> &str {
        "time"
    }

    fn encode(&self, record: &Record) -> Result<PartitionKey> {
        Ok(PartitionKey::Time {
            granularity: self.granularity,
            start: bucket_start(self.granularity, record.timestamp),
        })
    }

    fn decode(&self, key: &PartitionKey) -> Result<KeyBounds> {
        let (granularity, start) = expect_time_key(key)?;
        Ok(KeyBounds::Time {
            start,
            end: bucket_end(granularity, start),
        })
    }

    fn neighbors(&self, key: &PartitionKey) -> Result<Vec<PartitionKey>> {
        let (granularity, start) = expect_time_key(key)?;
        let prev = bucket_start(granularity, start - 1);
        let next = bucket_end(granularity, start);
        Ok(vec![
            PartitionKey::Time {
                granularity,
                start: prev,
            },
            PartitionKey::Time {
                granularity,
                start: next,
            },
        ])
    }

    fn geometry(&self, _key: &PartitionKey) -> Result<Polygon<f64>> {
        Err(Error::ErrorCode(ErrorCodes::InvalidRequest(
            "time partitions have no geometry".to_string(),
        )))
    }

    fn children(&self, key: &PartitionKey, _level: u8) -> Result<Vec<PartitionKey>> {
        let (granularity, start) = expect_time_key(key)?;
        let finer = match granularity {
            TimeGranularity::Minute => {
                return Err(Error::ErrorCode(ErrorCodes::InvalidRequest(
                    "minute is the finest granularity".to_string(),
                )));
            }
            TimeGranularity::Hour => TimeGranularity::Minute,
            TimeGranularity::Day => TimeGranularity::Hour,
            TimeGranularity::Week => TimeGranularity::Day,
            TimeGranularity::Month => TimeGranularity::Day,
            TimeGranularity::Quarter => TimeGranularity::Month,
            TimeGranularity::Year => TimeGranularity::Quarter,
        };
        let end = bucket_end(granularity, start);
        Ok(partition_boundaries(finer, start, end).collect())
    }

    fn parent(&self, key: &PartitionKey) -> Result<Option<PartitionKey>> {
        let (granularity, start) = expect_time_key(key)?;
        Ok(granularity.coarser().map(|coarser| PartitionKey::Time {
            granularity: coarser,
            start: bucket_start(coarser, start),
        }))
    }
}

fn expect_time_key(key: &PartitionKey) -> Result<(TimeGranularity, i64)> {
    match key {
        PartitionKey::Time { granularity, start } => Ok((*granularity, *start)),
        PartitionKey::Grid { .. } => Err(Error::ErrorCode(ErrorCodes::InvalidRequest(
            "expected a time partition key".to_string(),
        ))),
    }
}

/// inclusive lower boundary of the bucket containing `micros`
pub fn bucket_start(granularity: TimeGranularity, micros: i64) -> i64 {
    let dt: DateTime<Utc> = Utc.timestamp_nanos(micros * 1000);
    let date = dt.date_naive();
    let start = match granularity {
        TimeGranularity::Minute => date
            .and_hms_opt(dt.hour(), dt.minute(), 0)
            .expect("valid time"),
        TimeGranularity::Hour => date.and_hms_opt(dt.hour(), 0, 0).expect("valid time"),
        TimeGranularity::Day => date.and_hms_opt(0, 0, 0).expect("valid time"),
        TimeGranularity::Week => {
            // ISO week, Monday start
            let days_from_monday = date.weekday().num_days_from_monday() as i64;
            (date - Duration::days(days_from_monday))
                .and_hms_opt(0, 0, 0)
                .expect("valid time")
        }
        TimeGranularity::Month => first_of_month(date.year(), date.month()),
        TimeGranularity::Quarter => {
            let month = (date.month0() / 3) * 3 + 1;
            first_of_month(date.year(), month)
        }
        TimeGranularity::Year => first_of_month(date.year(), 1),
    };
    start.and_utc().timestamp_micros()
}

/// exclusive upper boundary, equal to the start of the next bucket
pub fn bucket_end(granularity: TimeGranularity, start_micros: i64) -> i64 {
    let dt: DateTime<Utc> = Utc.timestamp_nanos(start_micros * 1000);
    let date = dt.date_naive();
    let end = match granularity {
        TimeGranularity::Minute => return start_micros + 60 * 1_000_000,
        TimeGranularity::Hour => return start_micros + 3600 * 1_000_000,
        TimeGranularity::Day => return start_micros + 86400 * 1_000_000,
        TimeGranularity::Week => return start_micros + 7 * 86400 * 1_000_000,
        TimeGranularity::Month => next_month(date.year(), date.month(), 1),
        TimeGranularity::Quarter => next_month(date.year(), date.month(), 3),
        TimeGranularity::Year => first_of_month(date.year() + 1, 1),
    };
    end.and_utc().timestamp_micros()
}

fn first_of_month(year: i32, month: u32) -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, 1)
        .expect("valid date")
        .and_hms_opt(0, 0, 0)
        .expect("valid time")
}

fn next_month(year: i32, month: u32, step: u32) -> chrono::NaiveDateTime {
    let total = (year as i64) * 12 + (month as i64 - 1) + step as i64;
    first_of_month((total / 12) as i32, (total % 12) as u32 + 1)
}

/// The finite, ordered sequence of keys covering [start, end). Restartable:
/// it is a plain iterator recomputed from its inputs.
pub fn partition_boundaries(
    granularity: TimeGranularity,
    start_micros: i64,
    end_micros: i64,
) -> impl Iterator<Item = PartitionKey> {
    let mut current = if start_micros < end_micros {
        bucket_start(granularity, start_micros)
    } else {
        end_micros
    };
    std::iter::from_fn(move || {
        if current >= end_micros {
            return None;
        }
        let key = PartitionKey::Time {
            granularity,
            start: current,
        };
        current = bucket_end(granularity, current);
        Some(key)
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use config::meta::record::PayloadType;

    use super::*;

    fn record_at(micros: i64) -> Record {
        Record {
            id: "r1".to_string(),
            tenant: "default".to_string(),
            timestamp: micros,
            geo: None,
            payload: vec![],
            payload_type: PayloadType::Json,
            tags: HashMap::new(),
        }
    }

    fn micros(s: &str) -> i64 {
        config::utils::time::parse_str_to_time(s)
            .unwrap()
            .timestamp_micros()
    }

    #[test]
    fn test_day_bucketing() {
        let strategy = TimeStrategy::new(TimeGranularity::Day);
        let key = strategy
            .encode(&record_at(micros("2024-01-15T13:45:12Z")))
            .unwrap();
        assert_eq!(
            key,
            PartitionKey::Time {
                granularity: TimeGranularity::Day,
                start: micros("2024-01-15T00:00:00Z"),
            }
        );
        // boundaries are inclusive-lower, exclusive-upper
        let start_of_day = strategy
            .encode(&record_at(micros("2024-01-15T00:00:00Z")))
            .unwrap();
        assert_eq!(start_of_day, key);
        let end_of_day = strategy
            .encode(&record_at(micros("2024-01-16T00:00:00Z")))
            .unwrap();
        assert_ne!(end_of_day, key);
    }

    #[test]
    fn test_dst_offset_lands_in_utc_bucket() {
        // 2024-03-10T02:30 local EST-5 is 07:30 UTC, same UTC day
        let strategy = TimeStrategy::new(TimeGranularity::Day);
        let key = strategy
            .encode(&record_at(micros("2024-03-10T02:30:00-05:00")))
            .unwrap();
        assert_eq!(
            key,
            PartitionKey::Time {
                granularity: TimeGranularity::Day,
                start: micros("2024-03-10T00:00:00Z"),
            }
        );
    }

    #[test]
    fn test_month_quarter_year_starts() {
        let ts = micros("2024-08-17T10:00:00Z");
        assert_eq!(
            bucket_start(TimeGranularity::Month, ts),
            micros("2024-08-01T00:00:00Z")
        );
        assert_eq!(
            bucket_start(TimeGranularity::Quarter, ts),
            micros("2024-07-01T00:00:00Z")
        );
        assert_eq!(
            bucket_start(TimeGranularity::Year, ts),
            micros("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_week_starts_monday() {
        // 2024-01-15 is a Monday
        let ts = micros("2024-01-17T09:00:00Z");
        assert_eq!(
            bucket_start(TimeGranularity::Week, ts),
            micros("2024-01-15T00:00:00Z")
        );
    }

    #[test]
    fn test_month_end_rollover() {
        assert_eq!(
            bucket_end(TimeGranularity::Month, micros("2024-12-01T00:00:00Z")),
            micros("2025-01-01T00:00:00Z")
        );
        assert_eq!(
            bucket_end(TimeGranularity::Quarter, micros("2024-10-01T00:00:00Z")),
            micros("2025-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_partition_boundaries_january() {
        let keys: Vec<PartitionKey> = partition_boundaries(
            TimeGranularity::Day,
            micros("2024-01-01T00:00:00Z"),
            micros("2024-02-01T00:00:00Z"),
        )
        .collect();
        assert_eq!(keys.len(), 31);
        assert_eq!(
            keys[0],
            PartitionKey::Time {
                granularity: TimeGranularity::Day,
                start: micros("2024-01-01T00:00:00Z"),
            }
        );
        assert_eq!(
            keys[30],
            PartitionKey::Time {
                granularity: TimeGranularity::Day,
                start: micros("2024-01-31T00:00:00Z"),
            }
        );
    }

    #[test]
    fn test_partition_boundaries_empty_range() {
        let keys: Vec<PartitionKey> =
            partition_boundaries(TimeGranularity::Hour, 100, 100).collect();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_parent_child_hierarchy() {
        let strategy = TimeStrategy::new(TimeGranularity::Day);
        let key = PartitionKey::Time {
            granularity: TimeGranularity::Day,
            start: micros("2024-01-15T00:00:00Z"),
        };
        let parent = strategy.parent(&key).unwrap().unwrap();
        assert_eq!(
            parent,
            PartitionKey::Time {
                granularity: TimeGranularity::Week,
                start: micros("2024-01-15T00:00:00Z"),
            }
        );
        let children = strategy.children(&key, 0).unwrap();
        assert_eq!(children.len(), 24);
    }
}
