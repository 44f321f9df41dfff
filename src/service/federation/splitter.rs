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

//! Plan splitting. A maximal subtree whose scans all live in one source
//! becomes a sub-plan; cross-source joins and unions stay with the
//! coordinator, their inputs replaced by sub-plan markers.

use config::meta::plan::PlanNode;
use infra::errors::*;

use super::sources;

/// the marker source naming a sub-plan output in the coordinator plan
pub const SUBPLAN_SOURCE: &str = "__subplan__";

#[derive(Clone, Debug, PartialEq)]
pub struct SubPlan {
    pub id: usize,
    pub source: String,
    pub plan: PlanNode,
    /// dispatch wave; waves run in order, members of a wave in parallel
    pub level: usize,
}

#[derive(Clone, Debug)]
pub struct SplitPlan {
    pub sub_plans: Vec<SubPlan>,
    /// coordinator-level operators over the sub-plan outputs
    pub coordinator: PlanNode,
}

pub fn split(plan: &PlanNode) -> Result<SplitPlan> {
    // resolve every scan to its owning source first
    let resolved = resolve_sources(plan.clone());
    let mut sub_plans = Vec::new();
    let coordinator = extract(resolved, &mut sub_plans);
    Ok(SplitPlan {
        sub_plans,
        coordinator,
    })
}

fn resolve_sources(plan: PlanNode) -> PlanNode {
    match plan {
        PlanNode::Scan {
            source,
            table,
            projection,
            predicate,
            partition_filter,
        } => {
            let source = if source.is_empty() {
                sources::resolve_table(&table)
            } else {
                source
            };
            PlanNode::Scan {
                source,
                table,
                projection,
                predicate,
                partition_filter,
            }
        }
        other => {
            let inputs: Vec<PlanNode> = other
                .inputs()
                .into_iter()
                .cloned()
                .map(resolve_sources)
                .collect();
            if inputs.is_empty() {
                other
            } else {
                other.with_inputs(inputs)
            }
        }
    }
}

/// the single source this whole subtree can run on, if any
fn sole_source(plan: &PlanNode) -> Option<String> {
    let mut source: Option<String> = None;
    let mut mixed = false;
    plan.walk(&mut |node| {
        if let PlanNode::Scan { source: s, .. } = node {
            match &source {
                None => source = Some(s.clone()),
                Some(current) if current != s => mixed = true,
                _ => {}
            }
        }
        // graph and map-reduce leaves execute locally
        if matches!(node, PlanNode::Graph { .. } | PlanNode::MapReduce { .. }) {
            match &source {
                None => source = Some(sources::LOCAL_SOURCE.to_string()),
                Some(current) if current != sources::LOCAL_SOURCE => mixed = true,
                _ => {}
            }
        }
    });
    if mixed { None } else { source }
}

fn extract(plan: PlanNode, sub_plans: &mut Vec<SubPlan>) -> PlanNode {
    if let Some(source) = sole_source(&plan) {
        let id = sub_plans.len();
        sub_plans.push(SubPlan {
            id,
            source,
            plan,
            level: 0,
        });
        return marker(id);
    }
    let inputs: Vec<PlanNode> = plan
        .inputs()
        .into_iter()
        .cloned()
        .map(|input| extract(input, sub_plans))
        .collect();
    plan.with_inputs(inputs)
}

pub fn marker(id: usize) -> PlanNode {
    PlanNode::Scan {
        source: SUBPLAN_SOURCE.to_string(),
        table: id.to_string(),
        projection: vec![],
        predicate: None,
        partition_filter: None,
    }
}

pub fn marker_id(plan: &PlanNode) -> Option<usize> {
    match plan {
        PlanNode::Scan { source, table, .. } if source == SUBPLAN_SOURCE => table.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use config::meta::{
        query::JoinType,
        source::{Capabilities, DataSource, SourceAuth, SourceKind},
    };

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

    fn setup_sources() {
        sources::init();
        sources::register(DataSource {
            name: "split_docs".to_string(),
            kind: SourceKind::Document,
            endpoint: String::new(),
            auth: SourceAuth::None,
            capabilities: Capabilities::default(),
            tables: vec!["split_profiles".to_string()],
            version: 0,
        });
    }

    #[test]
    fn test_single_source_is_one_subplan() {
        setup_sources();
        let plan = PlanNode::Limit {
            n: 10,
            offset: 0,
            input: Box::new(scan("split_events")),
        };
        let split_plan = split(&plan).unwrap();
        assert_eq!(split_plan.sub_plans.len(), 1);
        assert_eq!(split_plan.sub_plans[0].source, "local");
        // the whole plan went to the source, the coordinator just reads it
        assert_eq!(marker_id(&split_plan.coordinator), Some(0));
    }

    #[test]
    fn test_cross_source_join_splits() {
        setup_sources();
        let plan = PlanNode::Join {
            join_type: JoinType::Inner,
            on: vec![("user_id".to_string(), "user_id".to_string())],
            left: Box::new(scan("split_users")),
            right: Box::new(scan("split_profiles")),
        };
        let split_plan = split(&plan).unwrap();
        assert_eq!(split_plan.sub_plans.len(), 2);
        assert_eq!(split_plan.sub_plans[0].source, "local");
        assert_eq!(split_plan.sub_plans[1].source, "split_docs");
        // the join stayed at the coordinator
        let PlanNode::Join { left, right, .. } = &split_plan.coordinator else {
            panic!("expected a coordinator join");
        };
        assert_eq!(marker_id(left), Some(0));
        assert_eq!(marker_id(right), Some(1));
    }

    #[test]
    fn test_aggregation_above_cross_source_join_stays() {
        setup_sources();
        let plan = PlanNode::Aggregate {
            keys: vec!["user_id".to_string()],
            aggs: vec![],
            input: Box::new(PlanNode::Join {
                join_type: JoinType::Inner,
                on: vec![],
                left: Box::new(scan("split_users")),
                right: Box::new(scan("split_profiles")),
            }),
        };
        let split_plan = split(&plan).unwrap();
        assert_eq!(split_plan.sub_plans.len(), 2);
        assert!(matches!(
            split_plan.coordinator,
            PlanNode::Aggregate { .. }
        ));
    }
}
