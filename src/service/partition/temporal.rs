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

//! Temporal index over partitions: a sorted sequence of
//! `(start, end, partition set)` ranges, looked up by binary search over the
//! start points. Recently touched ranges sit in a hot set that answers
//! repeat queries without the search.

use std::collections::BTreeSet;

use config::get_config;
use hashlink::LruCache;
use parking_lot::RwLock;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeRange {
    /// inclusive, UTC microseconds
    pub start: i64,
    /// exclusive
    pub end: i64,
    pub partitions: BTreeSet<String>,
}

pub struct TemporalIndex {
    /// sorted by start, non-overlapping
    ranges: RwLock<Vec<TimeRange>>,
    hot: RwLock<LruCache<(i64, i64), Vec<String>>>,
}

impl TemporalIndex {
    pub fn new() -> Self {
        TemporalIndex {
            ranges: RwLock::new(Vec::new()),
            hot: RwLock::new(LruCache::new(get_config().partition.hot_ranges)),
        }
    }

    pub fn insert(&self, start: i64, end: i64, partition: &str) {
        debug_assert!(start < end);
        let mut ranges = self.ranges.write();
        let idx = ranges.partition_point(|r| r.start < start);
        if idx < ranges.len() && ranges[idx].start == start && ranges[idx].end == end {
            ranges[idx].partitions.insert(partition.to_string());
        } else {
            ranges.insert(
                idx,
                TimeRange {
                    start,
                    end,
                    partitions: BTreeSet::from([partition.to_string()]),
                },
            );
        }
        drop(ranges);
        // any cached answer may now be stale
        self.hot.write().clear();
    }

    pub fn remove_partition(&self, partition: &str) {
        let mut ranges = self.ranges.write();
        for range in ranges.iter_mut() {
            range.partitions.remove(partition);
        }
        ranges.retain(|r| !r.partitions.is_empty());
        drop(ranges);
        self.hot.write().clear();
    }

    /// partitions overlapping [start, end), ordered and deduplicated
    pub fn query(&self, start: i64, end: i64) -> Vec<String> {
        if let Some(hit) = self.hot.write().get(&(start, end)) {
            return hit.clone();
        }
        let ranges = self.ranges.read();
        // first range whose end might reach past `start`; starts are sorted
        // so everything before the partition point ending earlier is skipped
        let from = ranges.partition_point(|r| r.end <= start);
        let mut out = BTreeSet::new();
        for range in ranges[from..].iter() {
            if range.start >= end {
                break;
            }
            if range.end > start {
                out.extend(range.partitions.iter().cloned());
            }
        }
        drop(ranges);
        let out: Vec<String> = out.into_iter().collect();
        self.hot.write().insert((start, end), out.clone());
        out
    }

    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.read().is_empty()
    }
}

impl Default for TemporalIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3600 * 1_000_000;

    fn build_index() -> TemporalIndex {
        let index = TemporalIndex::new();
        for h in 0..24 {
            index.insert(h * HOUR, (h + 1) * HOUR, &format!("p{h}"));
        }
        index
    }

    #[test]
    fn test_query_overlap() {
        let index = build_index();
        let hits = index.query(2 * HOUR, 5 * HOUR);
        assert_eq!(hits, vec!["p2", "p3", "p4"]);
        // boundary: end is exclusive
        let hits = index.query(2 * HOUR, 2 * HOUR + 1);
        assert_eq!(hits, vec!["p2"]);
        let hits = index.query(30 * HOUR, 40 * HOUR);
        assert!(hits.is_empty());
    }

    #[test]
    fn test_hot_cache_invalidation() {
        let index = build_index();
        assert_eq!(index.query(0, HOUR), vec!["p0"]);
        index.insert(0, HOUR, "p0b");
        assert_eq!(index.query(0, HOUR), vec!["p0", "p0b"]);
    }

    #[test]
    fn test_remove_partition() {
        let index = build_index();
        index.remove_partition("p3");
        let hits = index.query(2 * HOUR, 5 * HOUR);
        assert_eq!(hits, vec!["p2", "p4"]);
        assert_eq!(index.len(), 23);
    }

    #[test]
    fn test_same_range_merges() {
        let index = TemporalIndex::new();
        index.insert(0, HOUR, "a");
        index.insert(0, HOUR, "b");
        assert_eq!(index.len(), 1);
        assert_eq!(index.query(0, HOUR), vec!["a", "b"]);
    }
}
