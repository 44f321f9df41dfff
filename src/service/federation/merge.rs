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

//! Result merging. Sub-plan outputs are normalized per source kind, then
//! the coordinator plan folds them through joins, unions and aggregates;
//! post-processing deduplicates rows and columns.

use std::collections::HashMap;

use config::{
    get_config,
    meta::{plan::PlanNode, source::SourceKind},
    utils::{flatten, json},
};
use infra::errors::*;

use super::{
    exec::{self, Row},
    sources, splitter,
};

/// sub-plan rows keyed by id, already normalized
pub struct MergeInputs {
    rows: HashMap<usize, Vec<Row>>,
}

impl MergeInputs {
    pub fn new() -> Self {
        MergeInputs {
            rows: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: usize, source_kind: SourceKind, rows: Vec<Row>) -> Result<()> {
        self.rows.insert(id, normalize(source_kind, rows)?);
        Ok(())
    }

    pub fn get(&self, id: usize) -> Option<&Vec<Row>> {
        self.rows.get(&id)
    }
}

impl Default for MergeInputs {
    fn default() -> Self {
        Self::new()
    }
}

/// type-specific pre-merge normalization
pub fn normalize(kind: SourceKind, rows: Vec<Row>) -> Result<Vec<Row>> {
    match kind {
        // documents flatten to tabular with a depth limit
        SourceKind::Document => {
            let depth = get_config().query.flatten_depth;
            rows.into_iter()
                .map(|row| match row {
                    json::Value::Object(_) => flatten::flatten_with_level(row, depth)
                        .map_err(|e| Error::Message(e.to_string())),
                    other => Ok(json::json!({ "value": other })),
                })
                .collect()
        }
        // graphs emit edges as (src, dst, properties) rows
        SourceKind::Graph => Ok(rows
            .into_iter()
            .map(|row| {
                let obj = row.as_object().cloned().unwrap_or_default();
                let mut out = json::Map::new();
                out.insert(
                    "src".to_string(),
                    obj.get("src").cloned().unwrap_or(json::Value::Null),
                );
                out.insert(
                    "dst".to_string(),
                    obj.get("dst").cloned().unwrap_or(json::Value::Null),
                );
                for (k, v) in obj {
                    if k != "src" && k != "dst" {
                        out.insert(k, v);
                    }
                }
                json::Value::Object(out)
            })
            .collect()),
        // objects join on metadata only; blobs stay behind a handle
        SourceKind::Object => Ok(rows
            .into_iter()
            .map(|row| {
                let mut obj = row.as_object().cloned().unwrap_or_default();
                if obj.contains_key("data") {
                    let handle = obj
                        .get("key")
                        .or_else(|| obj.get("id"))
                        .map(|v| v.to_string())
                        .unwrap_or_default();
                    obj.remove("data");
                    obj.insert("blob_handle".to_string(), json::json!(handle));
                }
                json::Value::Object(obj)
            })
            .collect()),
        // relational and time-series rows are already tabular
        _ => Ok(rows),
    }
}

/// run the coordinator plan over the collected sub-plan outputs
pub fn execute_coordinator(plan: &PlanNode, inputs: &MergeInputs) -> Result<Vec<Row>> {
    if let Some(id) = splitter::marker_id(plan) {
        return inputs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Message(format!("missing sub-plan output {id}")));
    }
    match plan {
        PlanNode::Filter { predicate, input } => {
            exec::apply_filter(execute_coordinator(input, inputs)?, predicate)
        }
        PlanNode::Project { columns, input } => Ok(exec::apply_project(
            execute_coordinator(input, inputs)?,
            columns,
        )),
        PlanNode::Join {
            join_type,
            on,
            left,
            right,
        } => Ok(exec::hash_join(
            execute_coordinator(left, inputs)?,
            execute_coordinator(right, inputs)?,
            *join_type,
            on,
        )),
        PlanNode::Aggregate { keys, aggs, input } => {
            exec::apply_aggregate(execute_coordinator(input, inputs)?, keys, aggs)
        }
        PlanNode::Sort { keys, input } => Ok(exec::apply_sort(
            execute_coordinator(input, inputs)?,
            keys,
        )),
        PlanNode::Limit { n, offset, input } => Ok(exec::apply_limit(
            execute_coordinator(input, inputs)?,
            *n,
            *offset,
        )),
        PlanNode::Union { inputs: branches } => {
            let mut rows = Vec::new();
            for branch in branches {
                rows.append(&mut execute_coordinator(branch, inputs)?);
            }
            Ok(rows)
        }
        PlanNode::Pivot { spec, input } => {
            exec::apply_pivot(execute_coordinator(input, inputs)?, spec)
        }
        PlanNode::TimeSeries { window, input } => {
            exec::apply_resample(execute_coordinator(input, inputs)?, window)
        }
        PlanNode::Scan { .. } | PlanNode::Graph { .. } | PlanNode::MapReduce { .. } => {
            Err(Error::Message(format!(
                "{} cannot execute at the coordinator",
                plan.kind()
            )))
        }
    }
}

/// merge post-processing: row dedup on key columns when requested
pub fn post_process(rows: Vec<Row>, dedup_columns: &[String]) -> Vec<Row> {
    if dedup_columns.is_empty() {
        return rows;
    }
    exec::deduplicate(rows, dedup_columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_normalization_flattens() {
        let rows = vec![json::json!({"user": {"id": "u1", "tags": ["a", "b"]}})];
        let out = normalize(SourceKind::Document, rows).unwrap();
        assert_eq!(out[0]["user_id"], "u1");
        assert_eq!(out[0]["user_tags_0"], "a");
    }

    #[test]
    fn test_graph_normalization_orders_edges() {
        let rows = vec![json::json!({"weight": 2, "dst": "b", "src": "a"})];
        let out = normalize(SourceKind::Graph, rows).unwrap();
        let obj = out[0].as_object().unwrap();
        let keys: Vec<&String> = obj.keys().collect();
        assert_eq!(keys[..2], [&"src".to_string(), &"dst".to_string()]);
    }

    #[test]
    fn test_object_normalization_strips_blobs() {
        let rows = vec![json::json!({"key": "photos/1.jpg", "size": 100, "data": "xxxx"})];
        let out = normalize(SourceKind::Object, rows).unwrap();
        assert!(out[0].get("data").is_none());
        assert!(out[0]["blob_handle"].as_str().unwrap().contains("photos"));
        assert_eq!(out[0]["size"], 100);
    }

    #[test]
    fn test_coordinator_join_over_subplans() {
        let mut inputs = MergeInputs::new();
        inputs
            .insert(
                0,
                SourceKind::Relational,
                vec![json::json!({"user_id": "u1", "name": "ada"})],
            )
            .unwrap();
        inputs
            .insert(
                1,
                SourceKind::Document,
                vec![json::json!({"user_id": "u1", "profile": {"bio": "hi"}})],
            )
            .unwrap();
        let plan = PlanNode::Join {
            join_type: config::meta::query::JoinType::Inner,
            on: vec![("user_id".to_string(), "user_id".to_string())],
            left: Box::new(splitter::marker(0)),
            right: Box::new(splitter::marker(1)),
        };
        let rows = execute_coordinator(&plan, &inputs).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "ada");
        // the document side arrived flattened
        assert_eq!(rows[0]["profile_bio"], "hi");
    }
}
