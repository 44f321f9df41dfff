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

//! Partition-pruning rewrites. Time-range predicates on a scan turn into a
//! partition filter so non-overlapping partitions never get read; geo
//! lookups prune to the target cell plus its neighbor ring. The row-level
//! predicate stays; partition pruning is an index, not a filter.

use config::{
    get_config,
    meta::{
        partition::{GridSystem, PartitionKey, TimeGranularity},
        plan::{PartitionFilter, PlanNode},
        query::{CmpOp, GeoPredicate, Predicate, Scalar},
    },
    utils::time::parse_str_to_timestamp_micros,
};
use infra::errors::*;

use super::{OptimizationRule, rewrite_bottom_up};
use crate::service::partition::{grid::cover_point, time::partition_boundaries};

/// columns understood as the record timestamp
const TIME_FIELDS: [&str; 4] = ["_timestamp", "ts", "timestamp", "time"];

pub struct TemporalRewrite;

impl OptimizationRule for TemporalRewrite {
    fn name(&self) -> &'static str {
        "temporal_rewrite"
    }

    fn apply(&self, plan: &PlanNode) -> Result<PlanNode> {
        Ok(rewrite_bottom_up(plan, &|node| match node {
            PlanNode::Scan {
                source,
                table,
                projection,
                predicate: Some(predicate),
                partition_filter: None,
            } => {
                let partition_filter = time_range_of(&predicate).map(|(start, end)| {
                    let granularity = configured_granularity();
                    PartitionFilter {
                        strategy: "time".to_string(),
                        keys: partition_boundaries(granularity, start, end)
                            .map(|k| k.to_string())
                            .collect(),
                    }
                });
                PlanNode::Scan {
                    source,
                    table,
                    projection,
                    predicate: Some(predicate),
                    partition_filter,
                }
            }
            other => other,
        }))
    }
}

/// geo predicates prune to the target cell and its immediate neighbors
pub struct GridRewrite;

impl OptimizationRule for GridRewrite {
    fn name(&self) -> &'static str {
        "grid_rewrite"
    }

    fn apply(&self, plan: &PlanNode) -> Result<PlanNode> {
        Ok(rewrite_bottom_up(plan, &|node| match node {
            PlanNode::Scan {
                source,
                table,
                projection,
                predicate: Some(predicate),
                partition_filter: None,
            } => {
                let partition_filter = near_point_of(&predicate).and_then(|point| {
                    grid_cover(point).map(|(system, level, cells)| PartitionFilter {
                        strategy: system.to_string(),
                        keys: cells
                            .into_iter()
                            .map(|cell| {
                                PartitionKey::Grid {
                                    system,
                                    cell,
                                    level,
                                }
                                .to_string()
                            })
                            .collect(),
                    })
                });
                PlanNode::Scan {
                    source,
                    table,
                    projection,
                    predicate: Some(predicate),
                    partition_filter,
                }
            }
            other => other,
        }))
    }
}

fn near_point_of(predicate: &Predicate) -> Option<(f64, f64)> {
    match predicate {
        Predicate::Geo(GeoPredicate::Near { point, .. }) => Some(*point),
        Predicate::And(parts) => parts.iter().find_map(near_point_of),
        _ => None,
    }
}

fn grid_cover(point: (f64, f64)) -> Option<(GridSystem, u8, Vec<String>)> {
    let (grid, level) = crate::service::partition::configured_grid().ok()?;
    // dynamic rtree cells are not derivable without the registered state
    if grid.system() == GridSystem::Rtree {
        return None;
    }
    let cells = cover_point(grid.as_ref(), point.0, point.1, level).ok()?;
    Some((grid.system(), level, cells))
}

fn configured_granularity() -> TimeGranularity {
    get_config()
        .partition
        .time_granularity
        .parse()
        .unwrap_or(TimeGranularity::Day)
}

/// the closed time range a predicate pins down, if any
pub fn time_range_of(predicate: &Predicate) -> Option<(i64, i64)> {
    let mut start: Option<i64> = None;
    let mut end: Option<i64> = None;
    collect_bounds(predicate, &mut start, &mut end);
    match (start, end) {
        (Some(s), Some(e)) if s < e => Some((s, e)),
        _ => None,
    }
}

fn collect_bounds(predicate: &Predicate, start: &mut Option<i64>, end: &mut Option<i64>) {
    match predicate {
        Predicate::And(parts) => {
            for part in parts {
                collect_bounds(part, start, end);
            }
        }
        Predicate::Cmp { field, op, value } if is_time_field(field) => {
            let Some(micros) = scalar_to_micros(value) else {
                return;
            };
            match op {
                CmpOp::Gte => merge_start(start, micros),
                CmpOp::Gt => merge_start(start, micros + 1),
                CmpOp::Lt => merge_end(end, micros),
                CmpOp::Lte => merge_end(end, micros + 1),
                CmpOp::Eq => {
                    merge_start(start, micros);
                    merge_end(end, micros + 1);
                }
                CmpOp::Ne => {}
            }
        }
        _ => {}
    }
}

fn merge_start(start: &mut Option<i64>, candidate: i64) {
    *start = Some(match *start {
        Some(current) => current.max(candidate),
        None => candidate,
    });
}

fn merge_end(end: &mut Option<i64>, candidate: i64) {
    *end = Some(match *end {
        Some(current) => current.min(candidate),
        None => candidate,
    });
}

fn is_time_field(field: &str) -> bool {
    TIME_FIELDS.contains(&field)
}

fn scalar_to_micros(value: &Scalar) -> Option<i64> {
    match value {
        Scalar::Int(i) => Some(config::utils::time::parse_i64_to_timestamp_micros(*i)),
        Scalar::Float(f) => Some(config::utils::time::parse_i64_to_timestamp_micros(
            *f as i64,
        )),
        Scalar::String(s) => parse_str_to_timestamp_micros(s).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn micros(s: &str) -> i64 {
        config::utils::time::parse_str_to_time(s)
            .unwrap()
            .timestamp_micros()
    }

    fn ts_range_scan() -> PlanNode {
        PlanNode::Scan {
            source: String::new(),
            table: "events".to_string(),
            projection: vec![],
            predicate: Some(Predicate::And(vec![
                Predicate::Cmp {
                    field: "ts".to_string(),
                    op: CmpOp::Gte,
                    value: Scalar::String("2024-01-01T00:00:00Z".to_string()),
                },
                Predicate::Cmp {
                    field: "ts".to_string(),
                    op: CmpOp::Lt,
                    value: Scalar::String("2024-02-01".to_string()),
                },
            ])),
            partition_filter: None,
        }
    }

    #[test]
    fn test_january_prunes_to_31_days() {
        let optimized = TemporalRewrite.apply(&ts_range_scan()).unwrap();
        let PlanNode::Scan {
            partition_filter: Some(filter),
            predicate,
            ..
        } = optimized
        else {
            panic!("expected partition filter");
        };
        assert_eq!(filter.strategy, "time");
        assert_eq!(filter.keys.len(), 31);
        // the row predicate stays in place
        assert!(predicate.is_some());
    }

    #[test]
    fn test_no_range_no_filter() {
        let plan = PlanNode::Scan {
            source: String::new(),
            table: "events".to_string(),
            projection: vec![],
            predicate: Some(Predicate::Cmp {
                field: "user_id".to_string(),
                op: CmpOp::Eq,
                value: Scalar::String("u1".to_string()),
            }),
            partition_filter: None,
        };
        let optimized = TemporalRewrite.apply(&plan).unwrap();
        let PlanNode::Scan {
            partition_filter, ..
        } = optimized
        else {
            panic!()
        };
        assert!(partition_filter.is_none());
    }

    #[test]
    fn test_time_range_of_bounds() {
        let predicate = Predicate::And(vec![
            Predicate::Cmp {
                field: "_timestamp".to_string(),
                op: CmpOp::Gte,
                value: Scalar::Int(micros("2024-01-01T00:00:00Z")),
            },
            Predicate::Cmp {
                field: "_timestamp".to_string(),
                op: CmpOp::Lt,
                value: Scalar::Int(micros("2024-01-02T00:00:00Z")),
            },
        ]);
        let (start, end) = time_range_of(&predicate).unwrap();
        assert_eq!(start, micros("2024-01-01T00:00:00Z"));
        assert_eq!(end, micros("2024-01-02T00:00:00Z"));
    }
}
