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

//! Table statistics the cost model reads: row counts, per-column min/max and
//! distinct estimates. Refreshed from partition metadata; sources may also
//! push their own numbers.

use std::collections::HashMap;

use config::{RwHashMap, utils::json, utils::time::now_micros};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// selectivity prior for equality predicates without statistics
pub const EQUALITY_PRIOR: f64 = 0.1;
/// selectivity prior for everything else
pub const RANGE_PRIOR: f64 = 0.3;
/// assumed table size when nothing is known
pub const DEFAULT_ROW_COUNT: u64 = 1000;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub min: Option<json::Value>,
    pub max: Option<json::Value>,
    pub distinct_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    pub row_count: u64,
    pub columns: HashMap<String, ColumnStats>,
    pub updated_at: i64,
}

static STATS: Lazy<RwHashMap<String, TableStats>> = Lazy::new(Default::default);

pub fn set_stats(table: &str, stats: TableStats) {
    STATS.insert(table.to_string(), stats);
}

pub fn get_stats(table: &str) -> Option<TableStats> {
    STATS.get(table).map(|s| s.clone())
}

pub fn row_count(table: &str) -> u64 {
    get_stats(table)
        .map(|s| s.row_count)
        .filter(|c| *c > 0)
        .unwrap_or(DEFAULT_ROW_COUNT)
}

pub fn has_column(table: &str, column: &str) -> bool {
    get_stats(table)
        .map(|s| s.columns.contains_key(column))
        .unwrap_or(false)
}

/// relative change in row count, drives pattern-history invalidation
pub fn drift(old: &TableStats, new: &TableStats) -> f64 {
    if old.row_count == 0 {
        return if new.row_count == 0 { 0.0 } else { 1.0 };
    }
    (new.row_count as f64 - old.row_count as f64).abs() / old.row_count as f64
}

/// fold the local partition metadata into table statistics
pub fn refresh_from_partitions() {
    use crate::service::db;
    let mut per_table: HashMap<String, TableStats> = HashMap::new();
    for partition in db::list_partitions() {
        for record in db::partition_records(&partition.key).unwrap_or_default() {
            let table = record
                .tags
                .get(db::STREAM_TAG)
                .cloned()
                .unwrap_or_else(|| "default".to_string());
            let entry = per_table.entry(table).or_default();
            entry.row_count += 1;
        }
    }
    // merge the per-column stats the partitions already maintain
    for partition in db::list_partitions() {
        let Some(sample) = db::partition_records(&partition.key)
            .ok()
            .and_then(|records| records.first().cloned())
        else {
            continue;
        };
        let table = sample
            .tags
            .get(db::STREAM_TAG)
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let entry = per_table.entry(table).or_default();
        for (column, stats) in &partition.stats {
            let column_entry = entry.columns.entry(column.clone()).or_default();
            column_entry.distinct_count = column_entry.distinct_count.max(stats.distinct_count);
            if column_entry.min.is_none() {
                column_entry.min = stats.min.clone();
            }
            if column_entry.max.is_none() {
                column_entry.max = stats.max.clone();
            }
        }
    }
    let now = now_micros();
    for (table, mut stats) in per_table {
        stats.updated_at = now;
        set_stats(&table, stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_stats() {
        assert_eq!(row_count("stats_unknown"), DEFAULT_ROW_COUNT);
        assert!(!has_column("stats_unknown", "x"));
    }

    #[test]
    fn test_drift() {
        let old = TableStats {
            row_count: 100,
            ..Default::default()
        };
        let new = TableStats {
            row_count: 115,
            ..Default::default()
        };
        assert!((drift(&old, &new) - 0.15).abs() < 1e-9);
        assert_eq!(drift(&old, &old), 0.0);
    }

    #[test]
    fn test_set_get() {
        set_stats(
            "stats_events",
            TableStats {
                row_count: 5000,
                columns: HashMap::from([(
                    "user_id".to_string(),
                    ColumnStats {
                        distinct_count: 100,
                        ..Default::default()
                    },
                )]),
                updated_at: 0,
            },
        );
        assert_eq!(row_count("stats_events"), 5000);
        assert!(has_column("stats_events", "user_id"));
    }
}
