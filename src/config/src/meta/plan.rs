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

//! Query plans. Plans are immutable trees; every optimizer pass builds a new
//! plan rather than mutating in place.

use serde::{Deserialize, Serialize};

use super::query::{
    AggregateExpr, GraphTraversal, JoinType, MapReduce, OrderBy, Pivot, Predicate, TimeWindow,
};

/// partition pruning decision attached to a scan
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionFilter {
    pub strategy: String,
    /// partition keys to scan, ordered
    pub keys: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum PlanNode {
    Scan {
        source: String,
        table: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        projection: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        predicate: Option<Predicate>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partition_filter: Option<PartitionFilter>,
    },
    Filter {
        predicate: Predicate,
        input: Box<PlanNode>,
    },
    Project {
        columns: Vec<String>,
        input: Box<PlanNode>,
    },
    Join {
        join_type: JoinType,
        on: Vec<(String, String)>,
        left: Box<PlanNode>,
        right: Box<PlanNode>,
    },
    Aggregate {
        keys: Vec<String>,
        aggs: Vec<AggregateExpr>,
        input: Box<PlanNode>,
    },
    Sort {
        keys: Vec<OrderBy>,
        input: Box<PlanNode>,
    },
    Limit {
        n: i64,
        #[serde(default)]
        offset: i64,
        input: Box<PlanNode>,
    },
    Union {
        inputs: Vec<PlanNode>,
    },
    Pivot {
        spec: Pivot,
        input: Box<PlanNode>,
    },
    MapReduce {
        spec: MapReduce,
    },
    TimeSeries {
        window: TimeWindow,
        input: Box<PlanNode>,
    },
    Graph {
        spec: GraphTraversal,
    },
}

impl PlanNode {
    pub fn kind(&self) -> &'static str {
        match self {
            PlanNode::Scan { .. } => "scan",
            PlanNode::Filter { .. } => "filter",
            PlanNode::Project { .. } => "project",
            PlanNode::Join { .. } => "join",
            PlanNode::Aggregate { .. } => "aggregate",
            PlanNode::Sort { .. } => "sort",
            PlanNode::Limit { .. } => "limit",
            PlanNode::Union { .. } => "union",
            PlanNode::Pivot { .. } => "pivot",
            PlanNode::MapReduce { .. } => "map_reduce",
            PlanNode::TimeSeries { .. } => "time_series",
            PlanNode::Graph { .. } => "graph",
        }
    }

    pub fn inputs(&self) -> Vec<&PlanNode> {
        match self {
            PlanNode::Scan { .. } | PlanNode::MapReduce { .. } | PlanNode::Graph { .. } => vec![],
            PlanNode::Filter { input, .. }
            | PlanNode::Project { input, .. }
            | PlanNode::Aggregate { input, .. }
            | PlanNode::Sort { input, .. }
            | PlanNode::Limit { input, .. }
            | PlanNode::Pivot { input, .. }
            | PlanNode::TimeSeries { input, .. } => vec![input],
            PlanNode::Join { left, right, .. } => vec![left, right],
            PlanNode::Union { inputs } => inputs.iter().collect(),
        }
    }

    /// rebuild this node with new inputs, same arity expected
    pub fn with_inputs(&self, new_inputs: Vec<PlanNode>) -> PlanNode {
        if matches!(self, PlanNode::Union { .. }) {
            return PlanNode::Union { inputs: new_inputs };
        }
        let mut it = new_inputs.into_iter();
        let mut next = || Box::new(it.next().expect("plan input arity"));
        match self {
            PlanNode::Scan { .. } | PlanNode::MapReduce { .. } | PlanNode::Graph { .. } => {
                self.clone()
            }
            PlanNode::Filter { predicate, .. } => PlanNode::Filter {
                predicate: predicate.clone(),
                input: next(),
            },
            PlanNode::Project { columns, .. } => PlanNode::Project {
                columns: columns.clone(),
                input: next(),
            },
            PlanNode::Join { join_type, on, .. } => PlanNode::Join {
                join_type: *join_type,
                on: on.clone(),
                left: next(),
                right: next(),
            },
            PlanNode::Aggregate { keys, aggs, .. } => PlanNode::Aggregate {
                keys: keys.clone(),
                aggs: aggs.clone(),
                input: next(),
            },
            PlanNode::Sort { keys, .. } => PlanNode::Sort {
                keys: keys.clone(),
                input: next(),
            },
            PlanNode::Limit { n, offset, .. } => PlanNode::Limit {
                n: *n,
                offset: *offset,
                input: next(),
            },
            PlanNode::Union { .. } => unreachable!("handled above"),
            PlanNode::Pivot { spec, .. } => PlanNode::Pivot {
                spec: spec.clone(),
                input: next(),
            },
            PlanNode::TimeSeries { window, .. } => PlanNode::TimeSeries {
                window: window.clone(),
                input: next(),
            },
        }
    }

    /// every scan in the tree, left to right
    pub fn scans(&self) -> Vec<&PlanNode> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if matches!(node, PlanNode::Scan { .. }) {
                out.push(node);
            }
        });
        out
    }

    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a PlanNode)) {
        f(self);
        for input in self.inputs() {
            input.walk(f);
        }
    }

    pub fn node_count(&self) -> usize {
        1 + self.inputs().iter().map(|n| n.node_count()).sum::<usize>()
    }

    /// Normalized serialization used for plan equality and cache keying.
    /// Two plans with equal canonical form must produce the same cache key.
    pub fn canonical_form(&self) -> String {
        // serde_json object keys are sorted, struct fields serialize in
        // declaration order; the output is deterministic across processes
        crate::utils::json::to_string(self).unwrap_or_default()
    }

    /// canonical form with literal values erased, used by the pattern history
    pub fn shape(&self) -> String {
        let mut out = String::new();
        self.shape_into(&mut out);
        out
    }

    fn shape_into(&self, out: &mut String) {
        out.push_str(self.kind());
        if let PlanNode::Scan { source, table, .. } = self {
            out.push_str(&format!("[{source}.{table}]"));
        }
        let inputs = self.inputs();
        if !inputs.is_empty() {
            out.push('(');
            for (i, input) in inputs.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                input.shape_into(out);
            }
            out.push(')');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::query::{CmpOp, Scalar};

    fn sample_plan() -> PlanNode {
        PlanNode::Limit {
            n: 10,
            offset: 0,
            input: Box::new(PlanNode::Filter {
                predicate: Predicate::Cmp {
                    field: "user_id".to_string(),
                    op: CmpOp::Eq,
                    value: Scalar::String("u1".to_string()),
                },
                input: Box::new(PlanNode::Scan {
                    source: "pg".to_string(),
                    table: "events".to_string(),
                    projection: vec![],
                    predicate: None,
                    partition_filter: None,
                }),
            }),
        }
    }

    #[test]
    fn test_canonical_form_stable() {
        let plan = sample_plan();
        assert_eq!(plan.canonical_form(), sample_plan().canonical_form());
        let parsed: PlanNode =
            crate::utils::json::from_str(&plan.canonical_form()).unwrap();
        assert_eq!(parsed, plan);
        assert_eq!(parsed.canonical_form(), plan.canonical_form());
    }

    #[test]
    fn test_shape_erases_literals() {
        let plan = sample_plan();
        let mut other = sample_plan();
        if let PlanNode::Limit { n, .. } = &mut other {
            *n = 99;
        }
        assert_eq!(plan.shape(), other.shape());
        assert_eq!(plan.shape(), "limit(filter(scan[pg.events]))");
    }

    #[test]
    fn test_with_inputs_swaps_child() {
        let plan = sample_plan();
        let scan = PlanNode::Scan {
            source: "doc".to_string(),
            table: "profiles".to_string(),
            projection: vec![],
            predicate: None,
            partition_filter: None,
        };
        let swapped = plan.with_inputs(vec![scan.clone()]);
        assert_eq!(swapped.inputs()[0], &scan);
        // original untouched, plans are immutable values
        assert_eq!(plan.node_count(), 3);
        assert_eq!(swapped.node_count(), 2);
    }
}
