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

//! Pattern history: canonical plan shapes by frequency. Hot shapes keep
//! their optimized form and skip the rule engine until the statistics they
//! were computed against drift too far.

use std::collections::HashMap;

use config::{get_config, meta::plan::PlanNode};
use hashlink::LruCache;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::stats;

struct ShapeEntry {
    count: u64,
    optimized: Option<CachedPlan>,
}

struct CachedPlan {
    plan: PlanNode,
    /// row counts per table at optimization time
    stats_snapshot: HashMap<String, u64>,
}

static HISTORY: Lazy<Mutex<LruCache<String, ShapeEntry>>> =
    Lazy::new(|| Mutex::new(LruCache::new(get_config().query.pattern_history_size)));

/// shapes seen at least this often get their optimized plan cached
const HOT_THRESHOLD: u64 = 3;

pub fn observe(shape: &str) -> u64 {
    let mut history = HISTORY.lock();
    match history.get_mut(shape) {
        Some(entry) => {
            entry.count += 1;
            entry.count
        }
        None => {
            history.insert(
                shape.to_string(),
                ShapeEntry {
                    count: 1,
                    optimized: None,
                },
            );
            1
        }
    }
}

fn tables_of(plan: &PlanNode) -> Vec<String> {
    plan.scans()
        .iter()
        .filter_map(|s| match s {
            PlanNode::Scan { table, .. } => Some(table.clone()),
            _ => None,
        })
        .collect()
}

pub fn store(shape: &str, optimized: &PlanNode) {
    let snapshot = tables_of(optimized)
        .into_iter()
        .map(|t| {
            let rows = stats::row_count(&t);
            (t, rows)
        })
        .collect();
    let mut history = HISTORY.lock();
    if let Some(entry) = history.get_mut(shape) {
        if entry.count >= HOT_THRESHOLD {
            entry.optimized = Some(CachedPlan {
                plan: optimized.clone(),
                stats_snapshot: snapshot,
            });
        }
    }
}

/// a cached plan is valid while every table's stats drifted less than the
/// configured threshold
pub fn lookup(shape: &str) -> Option<PlanNode> {
    let threshold = get_config().query.stats_drift_threshold;
    let mut history = HISTORY.lock();
    let entry = history.get_mut(shape)?;
    let cached = entry.optimized.as_ref()?;
    for (table, old_rows) in &cached.stats_snapshot {
        let current = stats::row_count(table);
        let old = stats::TableStats {
            row_count: *old_rows,
            ..Default::default()
        };
        let new = stats::TableStats {
            row_count: current,
            ..Default::default()
        };
        if stats::drift(&old, &new) > threshold {
            entry.optimized = None;
            return None;
        }
    }
    Some(cached.plan.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(table: &str) -> PlanNode {
        PlanNode::Scan {
            source: "local".to_string(),
            table: table.to_string(),
            projection: vec![],
            predicate: None,
            partition_filter: None,
        }
    }

    #[test]
    fn test_cold_shape_not_cached() {
        let p = plan("hist_cold");
        observe("hist_cold_shape");
        store("hist_cold_shape", &p);
        assert!(lookup("hist_cold_shape").is_none());
    }

    #[test]
    fn test_hot_shape_cached_and_invalidated() {
        stats::set_stats(
            "hist_hot",
            stats::TableStats {
                row_count: 1000,
                ..Default::default()
            },
        );
        let p = plan("hist_hot");
        for _ in 0..HOT_THRESHOLD {
            observe("hist_hot_shape");
        }
        store("hist_hot_shape", &p);
        assert_eq!(lookup("hist_hot_shape"), Some(p.clone()));

        // >10% drift invalidates
        stats::set_stats(
            "hist_hot",
            stats::TableStats {
                row_count: 1200,
                ..Default::default()
            },
        );
        assert!(lookup("hist_hot_shape").is_none());
    }
}
