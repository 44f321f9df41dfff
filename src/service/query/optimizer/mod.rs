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

//! The cost-based optimizer. Rules run to a fixed point under a hard
//! iteration cap; a rewrite is only kept when it beats the current plan by
//! the improvement threshold. Hot plan shapes short-circuit through the
//! pattern history.

pub mod history;
pub mod rules;
pub mod stats;

use config::{get_config, meta::plan::PlanNode};
use infra::errors::*;

use self::rules::selectivity;

pub fn optimize(plan: &PlanNode) -> Result<PlanNode> {
    let shape = plan.shape();
    history::observe(&shape);
    if let Some(cached) = history::lookup(&shape) {
        return Ok(cached);
    }

    let cfg = get_config();
    let rules = rules::default_rules();
    let mut current = plan.clone();
    let mut current_cost = estimated_cost(&current);

    for _ in 0..cfg.query.optimizer_max_iterations {
        let mut improved = false;
        for rule in &rules {
            let candidate = rule.apply(&current)?;
            if candidate == current {
                continue;
            }
            let candidate_cost = estimated_cost(&candidate);
            // only accept rewrites that clear the improvement threshold
            if candidate_cost < current_cost * (1.0 - cfg.query.improvement_threshold) {
                log::debug!(
                    "[OPTIMIZER] {} accepted: {current_cost:.1} -> {candidate_cost:.1}",
                    rule.name()
                );
                let gain = (current_cost - candidate_cost) / current_cost.max(1.0);
                current = candidate;
                current_cost = candidate_cost;
                if gain >= cfg.query.optimizer_epsilon {
                    improved = true;
                }
            }
        }
        if !improved {
            break;
        }
    }

    history::store(&shape, &current);
    Ok(current)
}

/// plan cost in abstract row-touch units
pub fn estimated_cost(plan: &PlanNode) -> f64 {
    estimate(plan).1
}

/// (output rows, total cost)
fn estimate(plan: &PlanNode) -> (f64, f64) {
    match plan {
        PlanNode::Scan {
            table,
            predicate,
            partition_filter,
            projection,
            ..
        } => {
            let mut rows = stats::row_count(table) as f64;
            // pruned scans touch only the surviving partitions; without a
            // populated index assume pruning halves the scan
            if let Some(filter) = partition_filter {
                let total = crate::service::db::TEMPORAL_INDEX.len() as f64;
                let fraction = if total > filter.keys.len() as f64 {
                    (filter.keys.len() as f64 / total).max(0.001)
                } else {
                    0.5
                };
                rows *= fraction;
            }
            let mut cost = rows;
            if !projection.is_empty() {
                // narrower reads are cheaper per row
                cost *= 0.8;
            }
            if let Some(p) = predicate {
                rows *= selectivity(p);
            }
            (rows.max(1.0), cost)
        }
        PlanNode::Filter { predicate, input } => {
            let (rows, cost) = estimate(input);
            ((rows * selectivity(predicate)).max(1.0), cost + rows)
        }
        PlanNode::Project { input, .. } => {
            let (rows, cost) = estimate(input);
            (rows, cost + rows * 0.1)
        }
        PlanNode::Join {
            join_type, on, left, right,
        } => {
            let (left_rows, left_cost) = estimate(left);
            let (right_rows, right_cost) = estimate(right);
            let join_selectivity = if on.is_empty() {
                match join_type {
                    config::meta::query::JoinType::Cross => 1.0,
                    _ => stats::RANGE_PRIOR,
                }
            } else {
                stats::EQUALITY_PRIOR
            };
            let rows = (left_rows * right_rows * join_selectivity).max(1.0);
            (rows, left_cost + right_cost + left_rows + right_rows + rows)
        }
        PlanNode::Aggregate { keys, input, .. } => {
            let (rows, cost) = estimate(input);
            let out = if keys.is_empty() {
                1.0
            } else {
                (rows / 10.0).max(1.0)
            };
            (out, cost + rows)
        }
        PlanNode::Sort { input, .. } => {
            let (rows, cost) = estimate(input);
            (rows, cost + rows * rows.max(2.0).log2())
        }
        PlanNode::Limit { n, input, .. } => {
            let (rows, cost) = estimate(input);
            ((*n as f64).min(rows).max(1.0), cost)
        }
        PlanNode::Union { inputs } => {
            let mut rows = 0.0;
            let mut cost = 0.0;
            for input in inputs {
                let (r, c) = estimate(input);
                rows += r;
                cost += c;
            }
            (rows.max(1.0), cost)
        }
        PlanNode::Pivot { input, .. } | PlanNode::TimeSeries { input, .. } => {
            let (rows, cost) = estimate(input);
            (rows, cost + rows)
        }
        PlanNode::MapReduce { .. } | PlanNode::Graph { .. } => {
            let rows = stats::DEFAULT_ROW_COUNT as f64;
            (rows, rows * 2.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use config::meta::query::{CmpOp, Dialect, Predicate, Scalar};

    use super::*;
    use crate::service::query::{parser, planner};

    #[test]
    fn test_pushdown_lowers_cost() {
        stats::set_stats(
            "opt_events",
            stats::TableStats {
                row_count: 100000,
                columns: [("amount".to_string(), Default::default())]
                    .into_iter()
                    .collect(),
                updated_at: 0,
            },
        );
        let plan = PlanNode::Filter {
            predicate: Predicate::Cmp {
                field: "amount".to_string(),
                op: CmpOp::Gt,
                value: Scalar::Int(5),
            },
            input: Box::new(PlanNode::Sort {
                keys: vec![config::meta::query::OrderBy {
                    field: "amount".to_string(),
                    descending: false,
                }],
                input: Box::new(PlanNode::Scan {
                    source: String::new(),
                    table: "opt_events".to_string(),
                    projection: vec![],
                    predicate: None,
                    partition_filter: None,
                }),
            }),
        };
        let optimized = optimize(&plan).unwrap();
        assert!(estimated_cost(&optimized) < estimated_cost(&plan));
    }

    #[test]
    fn test_sql_time_filter_end_to_end() {
        let ast = parser::parse(
            Dialect::Sql,
            "SELECT user_id, COUNT(*) FROM events \
             WHERE ts >= '2024-01-01T00:00:00Z' AND ts < '2024-02-01' \
             GROUP BY user_id LIMIT 10",
        )
        .unwrap();
        let plan = planner::build_plan(&ast).unwrap();
        let optimized = optimize(&plan).unwrap();
        // the optimizer prunes january to its 31 day partitions
        let mut keys = 0;
        optimized.walk(&mut |node| {
            if let PlanNode::Scan {
                partition_filter: Some(filter),
                ..
            } = node
            {
                keys = filter.keys.len();
            }
        });
        assert_eq!(keys, 31);
    }

    #[test]
    fn test_optimizer_is_deterministic() {
        let ast = parser::parse(
            Dialect::Sql,
            "SELECT a FROM opt_det WHERE a = 1 ORDER BY a LIMIT 5",
        )
        .unwrap();
        let plan = planner::build_plan(&ast).unwrap();
        let first = optimize(&plan).unwrap();
        let second = optimize(&plan).unwrap();
        assert_eq!(first.canonical_form(), second.canonical_form());
    }
}
