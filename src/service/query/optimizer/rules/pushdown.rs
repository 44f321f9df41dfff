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

//! Predicate push-down: filters slide toward the scans feeding them. A
//! filter commutes with projects and sorts, splits across inner joins when
//! column ownership is known, and folds into the scan itself. It never
//! crosses a limit or an aggregate.

use config::meta::{plan::PlanNode, query::Predicate};
use infra::errors::*;

use super::OptimizationRule;
use crate::service::query::optimizer::stats;

pub struct PredicatePushdown;

impl OptimizationRule for PredicatePushdown {
    fn name(&self) -> &'static str {
        "predicate_pushdown"
    }

    fn apply(&self, plan: &PlanNode) -> Result<PlanNode> {
        Ok(push(plan.clone()))
    }
}

fn push(plan: PlanNode) -> PlanNode {
    match plan {
        PlanNode::Filter { predicate, input } => push_into(predicate, push(*input)),
        other => {
            let inputs: Vec<PlanNode> = other.inputs().into_iter().cloned().map(push).collect();
            if inputs.is_empty() {
                other
            } else {
                other.with_inputs(inputs)
            }
        }
    }
}

fn push_into(predicate: Predicate, input: PlanNode) -> PlanNode {
    match input {
        // fold directly into the scan
        PlanNode::Scan {
            source,
            table,
            projection,
            predicate: existing,
            partition_filter,
        } => PlanNode::Scan {
            source,
            table,
            projection,
            predicate: Some(merge_and(existing, predicate)),
            partition_filter,
        },
        // commutes with projection when it only reads projected columns
        PlanNode::Project { columns, input } => {
            if predicate.fields().iter().all(|f| columns.contains(f)) {
                PlanNode::Project {
                    columns,
                    input: Box::new(push_into(predicate, *input)),
                }
            } else {
                PlanNode::Filter {
                    predicate,
                    input: Box::new(PlanNode::Project { columns, input }),
                }
            }
        }
        // sorting does not change row membership
        PlanNode::Sort { keys, input } => PlanNode::Sort {
            keys,
            input: Box::new(push_into(predicate, *input)),
        },
        // inner joins take the conjuncts whose columns they own
        PlanNode::Join {
            join_type: config::meta::query::JoinType::Inner,
            on,
            left,
            right,
        } => split_join(predicate, on, *left, *right),
        // stacked filters merge and keep pushing
        PlanNode::Filter {
            predicate: inner,
            input,
        } => push_into(merge_and(Some(inner), predicate), *input),
        // aggregates, limits and everything else act as a barrier
        other => PlanNode::Filter {
            predicate,
            input: Box::new(push(other)),
        },
    }
}

fn split_join(
    predicate: Predicate,
    on: Vec<(String, String)>,
    left: PlanNode,
    right: PlanNode,
) -> PlanNode {
    let conjuncts = match predicate {
        Predicate::And(parts) => parts,
        single => vec![single],
    };
    let mut left_parts = Vec::new();
    let mut right_parts = Vec::new();
    let mut keep = Vec::new();
    for conjunct in conjuncts {
        let fields = conjunct.fields();
        if !fields.is_empty() && fields.iter().all(|f| side_owns(&left, f)) {
            left_parts.push(conjunct);
        } else if !fields.is_empty() && fields.iter().all(|f| side_owns(&right, f)) {
            right_parts.push(conjunct);
        } else {
            keep.push(conjunct);
        }
    }

    let mut left = left;
    if !left_parts.is_empty() {
        left = push_into(unwrap_and(left_parts), left);
    }
    let mut right = right;
    if !right_parts.is_empty() {
        right = push_into(unwrap_and(right_parts), right);
    }
    let join = PlanNode::Join {
        join_type: config::meta::query::JoinType::Inner,
        on,
        left: Box::new(left),
        right: Box::new(right),
    };
    if keep.is_empty() {
        join
    } else {
        PlanNode::Filter {
            predicate: unwrap_and(keep),
            input: Box::new(join),
        }
    }
}

/// column ownership: every scan under this subtree whose table statistics
/// list the column
fn side_owns(plan: &PlanNode, field: &str) -> bool {
    let scans = plan.scans();
    !scans.is_empty()
        && scans.iter().any(|scan| match scan {
            PlanNode::Scan { table, .. } => stats::has_column(table, field),
            _ => false,
        })
}

fn merge_and(existing: Option<Predicate>, new: Predicate) -> Predicate {
    match existing {
        None => new,
        Some(Predicate::And(mut parts)) => {
            parts.push(new);
            Predicate::And(parts)
        }
        Some(single) => Predicate::And(vec![single, new]),
    }
}

fn unwrap_and(mut parts: Vec<Predicate>) -> Predicate {
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        Predicate::And(parts)
    }
}

#[cfg(test)]
mod tests {
    use config::meta::query::{CmpOp, OrderBy, Scalar};

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

    fn cmp(field: &str) -> Predicate {
        Predicate::Cmp {
            field: field.to_string(),
            op: CmpOp::Eq,
            value: Scalar::Int(1),
        }
    }

    #[test]
    fn test_filter_folds_into_scan() {
        let plan = PlanNode::Filter {
            predicate: cmp("a"),
            input: Box::new(PlanNode::Sort {
                keys: vec![OrderBy {
                    field: "a".to_string(),
                    descending: false,
                }],
                input: Box::new(scan("push_t1")),
            }),
        };
        let optimized = PredicatePushdown.apply(&plan).unwrap();
        assert_eq!(optimized.shape(), "sort(scan[.push_t1])");
        let PlanNode::Sort { input, .. } = optimized else {
            panic!()
        };
        let PlanNode::Scan { predicate, .. } = *input else {
            panic!()
        };
        assert_eq!(predicate, Some(cmp("a")));
    }

    #[test]
    fn test_filter_does_not_cross_limit() {
        let plan = PlanNode::Filter {
            predicate: cmp("a"),
            input: Box::new(PlanNode::Limit {
                n: 10,
                offset: 0,
                input: Box::new(scan("push_t2")),
            }),
        };
        let optimized = PredicatePushdown.apply(&plan).unwrap();
        assert_eq!(optimized.shape(), "filter(limit(scan[.push_t2]))");
    }

    #[test]
    fn test_join_conjuncts_split_by_ownership() {
        stats::set_stats(
            "push_users",
            stats::TableStats {
                row_count: 100,
                columns: [("age".to_string(), Default::default())].into_iter().collect(),
                updated_at: 0,
            },
        );
        stats::set_stats(
            "push_orders",
            stats::TableStats {
                row_count: 100,
                columns: [("total".to_string(), Default::default())]
                    .into_iter()
                    .collect(),
                updated_at: 0,
            },
        );
        let plan = PlanNode::Filter {
            predicate: Predicate::And(vec![cmp("age"), cmp("total")]),
            input: Box::new(PlanNode::Join {
                join_type: config::meta::query::JoinType::Inner,
                on: vec![("id".to_string(), "user_id".to_string())],
                left: Box::new(scan("push_users")),
                right: Box::new(scan("push_orders")),
            }),
        };
        let optimized = PredicatePushdown.apply(&plan).unwrap();
        assert_eq!(
            optimized.shape(),
            "join(scan[.push_users],scan[.push_orders])"
        );
        let PlanNode::Join { left, right, .. } = optimized else {
            panic!()
        };
        assert!(matches!(
            *left,
            PlanNode::Scan {
                predicate: Some(_),
                ..
            }
        ));
        assert!(matches!(
            *right,
            PlanNode::Scan {
                predicate: Some(_),
                ..
            }
        ));
    }
}
