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

//! Column pruning: the required-column set flows from the root toward the
//! scans; every scan fetches only what something above it reads. An empty
//! requirement (wildcard somewhere) leaves the scan untouched.

use std::collections::BTreeSet;

use config::meta::plan::PlanNode;
use infra::errors::*;

use super::OptimizationRule;

pub struct ColumnPrune;

impl OptimizationRule for ColumnPrune {
    fn name(&self) -> &'static str {
        "column_prune"
    }

    fn apply(&self, plan: &PlanNode) -> Result<PlanNode> {
        Ok(prune(plan, &Requirement::All))
    }
}

#[derive(Clone, Debug)]
enum Requirement {
    All,
    Columns(BTreeSet<String>),
}

impl Requirement {
    fn add(&self, extra: impl IntoIterator<Item = String>) -> Requirement {
        match self {
            Requirement::All => Requirement::All,
            Requirement::Columns(cols) => {
                let mut cols = cols.clone();
                cols.extend(extra);
                Requirement::Columns(cols)
            }
        }
    }
}

fn prune(plan: &PlanNode, required: &Requirement) -> PlanNode {
    match plan {
        PlanNode::Scan {
            source,
            table,
            predicate,
            partition_filter,
            ..
        } => {
            let projection = match required {
                Requirement::All => vec![],
                Requirement::Columns(cols) => {
                    // predicate columns must survive the fetch too
                    let mut cols = cols.clone();
                    if let Some(p) = predicate {
                        cols.extend(p.fields());
                    }
                    cols.into_iter().collect()
                }
            };
            PlanNode::Scan {
                source: source.clone(),
                table: table.clone(),
                projection,
                predicate: predicate.clone(),
                partition_filter: partition_filter.clone(),
            }
        }
        PlanNode::Project { columns, input } => PlanNode::Project {
            columns: columns.clone(),
            input: Box::new(prune(
                input,
                &Requirement::Columns(columns.iter().cloned().collect()),
            )),
        },
        PlanNode::Filter { predicate, input } => PlanNode::Filter {
            predicate: predicate.clone(),
            input: Box::new(prune(input, &required.add(predicate.fields()))),
        },
        PlanNode::Aggregate { keys, aggs, input } => {
            let mut needed: BTreeSet<String> = keys.iter().cloned().collect();
            needed.extend(
                aggs.iter()
                    .map(|a| a.field.clone())
                    .filter(|f| f != "*"),
            );
            PlanNode::Aggregate {
                keys: keys.clone(),
                aggs: aggs.clone(),
                input: Box::new(prune(input, &Requirement::Columns(needed))),
            }
        }
        PlanNode::Sort { keys, input } => PlanNode::Sort {
            keys: keys.clone(),
            input: Box::new(prune(
                input,
                &required.add(keys.iter().map(|k| k.field.clone())),
            )),
        },
        PlanNode::Join {
            join_type,
            on,
            left,
            right,
        } => {
            let join_fields: Vec<String> = on
                .iter()
                .flat_map(|(l, r)| [l.clone(), r.clone()])
                .collect();
            let child_req = required.add(join_fields);
            PlanNode::Join {
                join_type: *join_type,
                on: on.clone(),
                left: Box::new(prune(left, &child_req)),
                right: Box::new(prune(right, &child_req)),
            }
        }
        PlanNode::TimeSeries { window, input } => PlanNode::TimeSeries {
            window: window.clone(),
            input: Box::new(prune(input, &required.add([window.field.clone()]))),
        },
        other => {
            let inputs: Vec<PlanNode> = other
                .inputs()
                .into_iter()
                .map(|i| prune(i, required))
                .collect();
            if inputs.is_empty() {
                other.clone()
            } else {
                other.with_inputs(inputs)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use config::meta::query::{AggFunc, AggregateExpr, CmpOp, Predicate, Scalar};

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

    #[test]
    fn test_project_drives_scan_projection() {
        let plan = PlanNode::Project {
            columns: vec!["a".to_string(), "b".to_string()],
            input: Box::new(scan("prune_t1")),
        };
        let optimized = ColumnPrune.apply(&plan).unwrap();
        let PlanNode::Project { input, .. } = optimized else {
            panic!()
        };
        let PlanNode::Scan { projection, .. } = *input else {
            panic!()
        };
        assert_eq!(projection, vec!["a", "b"]);
    }

    #[test]
    fn test_aggregate_requires_keys_and_fields() {
        let plan = PlanNode::Aggregate {
            keys: vec!["user_id".to_string()],
            aggs: vec![AggregateExpr {
                func: AggFunc::Sum,
                field: "amount".to_string(),
                alias: "total".to_string(),
            }],
            input: Box::new(PlanNode::Filter {
                predicate: Predicate::Cmp {
                    field: "status".to_string(),
                    op: CmpOp::Eq,
                    value: Scalar::String("paid".to_string()),
                },
                input: Box::new(scan("prune_t2")),
            }),
        };
        let optimized = ColumnPrune.apply(&plan).unwrap();
        let mut projection = Vec::new();
        optimized.walk(&mut |node| {
            if let PlanNode::Scan { projection: p, .. } = node {
                projection = p.clone();
            }
        });
        assert_eq!(projection, vec!["amount", "status", "user_id"]);
    }

    #[test]
    fn test_wildcard_keeps_everything() {
        let plan = scan("prune_t3");
        let optimized = ColumnPrune.apply(&plan).unwrap();
        let PlanNode::Scan { projection, .. } = optimized else {
            panic!()
        };
        assert!(projection.is_empty());
    }
}
