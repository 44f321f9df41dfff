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

//! Lowering from the dialect-independent AST to an initial query plan. The
//! planner produces a straightforward tree; every improvement is the
//! optimizer's job.

use config::{
    COLUMN_TIMESTAMP,
    meta::{
        plan::PlanNode,
        query::{AstBody, Pipeline, PipelineStage, Predicate, QueryAst, Select, SelectItem},
    },
};
use infra::errors::*;

/// tables resolve to sources later, at federation split time
pub const UNRESOLVED_SOURCE: &str = "";

/// aliases queries use for the record timestamp column
const TIME_ALIASES: [&str; 3] = ["ts", "timestamp", "time"];

pub fn build_plan(ast: &QueryAst) -> Result<PlanNode> {
    let plan = match &ast.body {
        AstBody::Select(select) => build_select(select)?,
        AstBody::Find(find) => build_find(find),
        AstBody::Pipeline(pipeline) => build_pipeline(pipeline)?,
        AstBody::Graph(spec) => PlanNode::Graph { spec: spec.clone() },
        AstBody::MapReduce(spec) => PlanNode::MapReduce { spec: spec.clone() },
    };
    Ok(normalize_time_fields(plan))
}

/// rewrite `ts`/`timestamp`/`time` references to the stored `_timestamp`
fn normalize_time_fields(plan: PlanNode) -> PlanNode {
    fn fix_predicate(predicate: Predicate) -> Predicate {
        use config::meta::query::Scalar;
        match predicate {
            Predicate::Cmp { field, op, value } => {
                let field = fix_field(field);
                // time literals normalize to utc microseconds
                let value = if field == COLUMN_TIMESTAMP {
                    match &value {
                        Scalar::String(s) => {
                            match config::utils::time::parse_str_to_timestamp_micros(s) {
                                Ok(micros) => Scalar::Int(micros),
                                Err(_) => value,
                            }
                        }
                        Scalar::Int(i) => Scalar::Int(
                            config::utils::time::parse_i64_to_timestamp_micros(*i),
                        ),
                        other => other.clone(),
                    }
                } else {
                    value
                };
                Predicate::Cmp { field, op, value }
            }
            Predicate::And(parts) => {
                Predicate::And(parts.into_iter().map(fix_predicate).collect())
            }
            Predicate::Or(parts) => Predicate::Or(parts.into_iter().map(fix_predicate).collect()),
            Predicate::Not(inner) => Predicate::Not(Box::new(fix_predicate(*inner))),
            other => other,
        }
    }
    fn fix_field(field: String) -> String {
        if TIME_ALIASES.contains(&field.as_str()) {
            COLUMN_TIMESTAMP.to_string()
        } else {
            field
        }
    }
    match plan {
        PlanNode::Filter { predicate, input } => PlanNode::Filter {
            predicate: fix_predicate(predicate),
            input: Box::new(normalize_time_fields(*input)),
        },
        PlanNode::Scan {
            source,
            table,
            projection,
            predicate,
            partition_filter,
        } => PlanNode::Scan {
            source,
            table,
            projection,
            predicate: predicate.map(fix_predicate),
            partition_filter,
        },
        PlanNode::Sort { keys, input } => PlanNode::Sort {
            keys: keys
                .into_iter()
                .map(|mut k| {
                    k.field = fix_field(k.field);
                    k
                })
                .collect(),
            input: Box::new(normalize_time_fields(*input)),
        },
        other => {
            let inputs: Vec<PlanNode> = other
                .inputs()
                .into_iter()
                .cloned()
                .map(normalize_time_fields)
                .collect();
            if inputs.is_empty() {
                other
            } else {
                other.with_inputs(inputs)
            }
        }
    }
}

fn scan(table: &str) -> PlanNode {
    PlanNode::Scan {
        source: UNRESOLVED_SOURCE.to_string(),
        table: table.to_string(),
        projection: vec![],
        predicate: None,
        partition_filter: None,
    }
}

fn build_select(select: &Select) -> Result<PlanNode> {
    let mut plan = scan(&select.from.name);

    // joins fold into a left-deep tree
    for join in &select.joins {
        plan = PlanNode::Join {
            join_type: join.join_type,
            on: join.on.clone(),
            left: Box::new(plan),
            right: Box::new(scan(&join.table.name)),
        };
    }

    if let Some(predicate) = &select.selection {
        plan = PlanNode::Filter {
            predicate: predicate.clone(),
            input: Box::new(plan),
        };
    }

    let aggs: Vec<_> = select
        .projection
        .iter()
        .filter_map(|item| match item {
            SelectItem::Aggregate { func, field, alias } => {
                Some(config::meta::query::AggregateExpr {
                    func: func.clone(),
                    field: field.clone(),
                    alias: alias.clone().unwrap_or_else(|| {
                        format!("{}_{field}", agg_name(func)).replace('*', "all")
                    }),
                })
            }
            _ => None,
        })
        .collect();

    if !aggs.is_empty() || !select.group_by.is_empty() {
        plan = PlanNode::Aggregate {
            keys: select.group_by.clone(),
            aggs,
            input: Box::new(plan),
        };
    }

    if let Some(having) = &select.having {
        plan = PlanNode::Filter {
            predicate: having.clone(),
            input: Box::new(plan),
        };
    }

    if let Some(pivot) = &select.pivot {
        plan = PlanNode::Pivot {
            spec: pivot.clone(),
            input: Box::new(plan),
        };
    }

    if !select.order_by.is_empty() {
        plan = PlanNode::Sort {
            keys: select.order_by.clone(),
            input: Box::new(plan),
        };
    }

    if select.limit.is_some() || select.offset.is_some() {
        plan = PlanNode::Limit {
            n: select.limit.unwrap_or(i64::MAX),
            offset: select.offset.unwrap_or(0),
            input: Box::new(plan),
        };
    }

    // plain column projections; aggregates already shaped the rows
    let columns: Vec<String> = select
        .projection
        .iter()
        .filter_map(|item| match item {
            SelectItem::Column { name, alias } => {
                Some(alias.clone().unwrap_or_else(|| name.clone()))
            }
            _ => None,
        })
        .collect();
    let has_wildcard = select
        .projection
        .iter()
        .any(|item| matches!(item, SelectItem::Wildcard));
    if !columns.is_empty() && !has_wildcard && select.group_by.is_empty() && aggs_empty(select) {
        plan = PlanNode::Project {
            columns,
            input: Box::new(plan),
        };
    }

    Ok(plan)
}

fn aggs_empty(select: &Select) -> bool {
    !select
        .projection
        .iter()
        .any(|item| matches!(item, SelectItem::Aggregate { .. }))
}

fn agg_name(func: &config::meta::query::AggFunc) -> &'static str {
    use config::meta::query::AggFunc;
    match func {
        AggFunc::Count => "count",
        AggFunc::Sum => "sum",
        AggFunc::Avg => "avg",
        AggFunc::Min => "min",
        AggFunc::Max => "max",
        AggFunc::Percentile(_) => "percentile",
    }
}

fn build_find(find: &config::meta::query::Find) -> PlanNode {
    let mut plan = scan(&find.collection);
    if let Some(filter) = &find.filter {
        plan = PlanNode::Filter {
            predicate: filter.clone(),
            input: Box::new(plan),
        };
    }
    if let Some(window) = &find.window {
        plan = PlanNode::TimeSeries {
            window: window.clone(),
            input: Box::new(plan),
        };
    }
    if !find.sort.is_empty() {
        plan = PlanNode::Sort {
            keys: find.sort.clone(),
            input: Box::new(plan),
        };
    }
    if find.limit.is_some() || find.skip.is_some() {
        plan = PlanNode::Limit {
            n: find.limit.unwrap_or(i64::MAX),
            offset: find.skip.unwrap_or(0),
            input: Box::new(plan),
        };
    }
    if !find.projection.is_empty() {
        plan = PlanNode::Project {
            columns: find.projection.clone(),
            input: Box::new(plan),
        };
    }
    plan
}

fn build_pipeline(pipeline: &Pipeline) -> Result<PlanNode> {
    let mut plan = scan(&pipeline.collection);
    for stage in &pipeline.stages {
        plan = match stage {
            PipelineStage::Match(predicate) => PlanNode::Filter {
                predicate: predicate.clone(),
                input: Box::new(plan),
            },
            PipelineStage::Group { keys, aggs } => PlanNode::Aggregate {
                keys: keys.clone(),
                aggs: aggs.clone(),
                input: Box::new(plan),
            },
            PipelineStage::Sort(keys) => PlanNode::Sort {
                keys: keys.clone(),
                input: Box::new(plan),
            },
            PipelineStage::Project(columns) => PlanNode::Project {
                columns: columns.clone(),
                input: Box::new(plan),
            },
            PipelineStage::Lookup {
                from,
                local_field,
                foreign_field,
                as_field: _,
            } => PlanNode::Join {
                join_type: config::meta::query::JoinType::Left,
                on: vec![(local_field.clone(), foreign_field.clone())],
                left: Box::new(plan),
                right: Box::new(scan(from)),
            },
            // document rows are flattened at normalization, the unwound
            // array elements surface as indexed columns
            PipelineStage::Unwind { .. } => plan,
            PipelineStage::Limit(n) => PlanNode::Limit {
                n: *n,
                offset: 0,
                input: Box::new(plan),
            },
            PipelineStage::Skip(n) => PlanNode::Limit {
                n: i64::MAX,
                offset: *n,
                input: Box::new(plan),
            },
            // the $out target is handled after execution by the caller
            PipelineStage::Out { .. } => plan,
            PipelineStage::Window(window) => PlanNode::TimeSeries {
                window: window.clone(),
                input: Box::new(plan),
            },
        };
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use config::meta::query::Dialect;

    use super::*;
    use crate::service::query::parser;

    fn plan_sql(sql: &str) -> PlanNode {
        let ast = parser::parse(Dialect::Sql, sql).unwrap();
        build_plan(&ast).unwrap()
    }

    #[test]
    fn test_select_plan_shape() {
        let plan = plan_sql(
            "SELECT user_id, COUNT(*) FROM events WHERE amount > 5 \
             GROUP BY user_id LIMIT 10",
        );
        assert_eq!(plan.shape(), "limit(aggregate(filter(scan[.events])))");
    }

    #[test]
    fn test_join_plan_left_deep() {
        let plan = plan_sql(
            "SELECT * FROM users u \
             JOIN profiles p ON u.user_id = p.user_id \
             JOIN orders o ON o.user_id = u.user_id",
        );
        assert_eq!(
            plan.shape(),
            "join(join(scan[.users],scan[.profiles]),scan[.orders])"
        );
    }

    #[test]
    fn test_find_plan_shape() {
        let ast = parser::parse(
            Dialect::Nosql,
            r#"db.events.find({a: 1}, {a: 1}).sort({a: 1}).limit(3)"#,
        )
        .unwrap();
        let plan = build_plan(&ast).unwrap();
        assert_eq!(
            plan.shape(),
            "project(limit(sort(filter(scan[.events]))))"
        );
    }

    #[test]
    fn test_pipeline_lookup_becomes_join() {
        let ast = parser::parse(
            Dialect::Nosql,
            r#"db.orders.aggregate([
                {$lookup: {from: "users", localField: "user_id", foreignField: "id", as: "user"}},
                {$limit: 10}
            ])"#,
        )
        .unwrap();
        let plan = build_plan(&ast).unwrap();
        assert_eq!(plan.shape(), "limit(join(scan[.orders],scan[.users]))");
    }
}
