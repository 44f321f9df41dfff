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

//! Greedy join reordering. Chains of inner joins flatten into relations and
//! conditions, then rebuild left-deep in ascending order of estimated
//! output size (size × selectivity). Outer joins are left alone, their
//! order is semantic.

use config::meta::{plan::PlanNode, query::JoinType};
use infra::errors::*;

use super::{OptimizationRule, selectivity, stats};

pub struct JoinReorder;

impl OptimizationRule for JoinReorder {
    fn name(&self) -> &'static str {
        "join_reorder"
    }

    fn apply(&self, plan: &PlanNode) -> Result<PlanNode> {
        Ok(reorder(plan.clone()))
    }
}

fn reorder(plan: PlanNode) -> PlanNode {
    match &plan {
        PlanNode::Join {
            join_type: JoinType::Inner,
            ..
        } => {
            let mut relations = Vec::new();
            let mut conditions = Vec::new();
            flatten(plan.clone(), &mut relations, &mut conditions);
            if relations.len() <= 2 {
                return rebuild_children(plan);
            }
            rebuild_greedy(relations, conditions)
        }
        _ => rebuild_children(plan),
    }
}

fn rebuild_children(plan: PlanNode) -> PlanNode {
    let inputs: Vec<PlanNode> = plan.inputs().into_iter().cloned().map(reorder).collect();
    if inputs.is_empty() {
        plan
    } else {
        plan.with_inputs(inputs)
    }
}

fn flatten(
    plan: PlanNode,
    relations: &mut Vec<PlanNode>,
    conditions: &mut Vec<(String, String)>,
) {
    match plan {
        PlanNode::Join {
            join_type: JoinType::Inner,
            on,
            left,
            right,
        } => {
            conditions.extend(on);
            flatten(*left, relations, conditions);
            flatten(*right, relations, conditions);
        }
        other => relations.push(reorder(other)),
    }
}

/// estimated output rows of one relation subtree
fn estimated_size(plan: &PlanNode) -> f64 {
    match plan {
        PlanNode::Scan {
            table, predicate, ..
        } => {
            let rows = stats::row_count(table) as f64;
            match predicate {
                Some(p) => rows * selectivity(p),
                None => rows,
            }
        }
        PlanNode::Filter { predicate, input } => estimated_size(input) * selectivity(predicate),
        other => other
            .inputs()
            .first()
            .map(|p| estimated_size(p))
            .unwrap_or(stats::DEFAULT_ROW_COUNT as f64),
    }
}

fn rebuild_greedy(
    mut relations: Vec<PlanNode>,
    conditions: Vec<(String, String)>,
) -> PlanNode {
    relations.sort_by(|a, b| {
        estimated_size(a)
            .partial_cmp(&estimated_size(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut iter = relations.into_iter();
    let mut plan = iter.next().expect("at least one relation");
    for relation in iter {
        // conditions that connect the joined-so-far set with the newcomer
        let fields: Vec<String> = relation
            .scans()
            .iter()
            .filter_map(|s| match s {
                PlanNode::Scan { table, .. } => Some(table.clone()),
                _ => None,
            })
            .collect();
        let on: Vec<(String, String)> = conditions
            .iter()
            .filter(|(l, r)| {
                fields
                    .iter()
                    .any(|t| stats::has_column(t, l) || stats::has_column(t, r))
            })
            .cloned()
            .collect();
        plan = PlanNode::Join {
            join_type: JoinType::Inner,
            on: if on.is_empty() {
                conditions.clone()
            } else {
                on
            },
            left: Box::new(plan),
            right: Box::new(relation),
        };
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(table: &str) -> PlanNode {
        PlanNode::Scan {
            source: String::new(),
            table: table.to_string(),
            projection: vec![],
            predicate: None,
            partition_filter: None,
        }
    }

    fn join(left: PlanNode, right: PlanNode) -> PlanNode {
        PlanNode::Join {
            join_type: JoinType::Inner,
            on: vec![("id".to_string(), "id".to_string())],
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[test]
    fn test_smallest_relation_first() {
        for (table, rows) in [("jr_big", 100000u64), ("jr_mid", 1000), ("jr_small", 10)] {
            stats::set_stats(
                table,
                stats::TableStats {
                    row_count: rows,
                    ..Default::default()
                },
            );
        }
        let plan = join(join(scan("jr_big"), scan("jr_mid")), scan("jr_small"));
        let optimized = JoinReorder.apply(&plan).unwrap();
        assert_eq!(
            optimized.shape(),
            "join(join(scan[.jr_small],scan[.jr_mid]),scan[.jr_big])"
        );
    }

    #[test]
    fn test_two_way_join_untouched() {
        let plan = join(scan("jr_a"), scan("jr_b"));
        let optimized = JoinReorder.apply(&plan).unwrap();
        assert_eq!(optimized.shape(), plan.shape());
    }

    #[test]
    fn test_outer_join_not_reordered() {
        let plan = PlanNode::Join {
            join_type: JoinType::Left,
            on: vec![],
            left: Box::new(join(scan("jr_x"), scan("jr_y"))),
            right: Box::new(scan("jr_z")),
        };
        let optimized = JoinReorder.apply(&plan).unwrap();
        // the outer join stays on top
        assert!(matches!(
            optimized,
            PlanNode::Join {
                join_type: JoinType::Left,
                ..
            }
        ));
    }
}
