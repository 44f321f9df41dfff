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

//! Data source registry and executors. The local store is the default
//! source; declared sources claim tables and execute over their endpoint.
//! The embedding executor is a stub behind the same interface.

use std::sync::Arc;

use config::{
    RwHashMap,
    meta::{
        plan::PlanNode,
        query::{CmpOp, Predicate},
        source::{Capabilities, DataSource, SourceAuth, SourceKind},
    },
    utils::json,
};
use infra::errors::*;
use once_cell::sync::Lazy;

use super::exec::{self, Row};
use crate::service::db;

pub const LOCAL_SOURCE: &str = "local";

static SOURCES: Lazy<RwHashMap<String, DataSource>> = Lazy::new(Default::default);

pub fn init() {
    register(DataSource {
        name: LOCAL_SOURCE.to_string(),
        kind: SourceKind::Relational,
        endpoint: String::new(),
        auth: SourceAuth::None,
        capabilities: Capabilities {
            operators: vec!["filter".into(), "project".into(), "limit".into()],
            join_types: vec![],
            aggregates: vec!["count".into(), "sum".into(), "avg".into()],
            supports_sort: true,
            supports_limit: true,
        },
        tables: vec![],
        version: 0,
    });
}

pub fn register(source: DataSource) {
    log::info!("[FEDERATION] registered source {} ({})", source.name, source.kind);
    SOURCES.insert(source.name.clone(), source);
}

pub fn get(name: &str) -> Result<DataSource> {
    SOURCES
        .get(name)
        .map(|s| s.clone())
        .ok_or_else(|| Error::ErrorCode(ErrorCodes::SourceNotFound(name.to_string())))
}

pub fn list() -> Vec<DataSource> {
    SOURCES.iter().map(|s| s.clone()).collect()
}

/// bump the version on writes; the result cache invalidates on it
pub fn bump_version(name: &str) {
    if let Some(mut source) = SOURCES.get_mut(name) {
        source.version += 1;
    }
}

pub fn version_of(name: &str) -> u64 {
    SOURCES.get(name).map(|s| s.version).unwrap_or(0)
}

/// the source owning a table; unclaimed tables belong to the local store
pub fn resolve_table(table: &str) -> String {
    for source in SOURCES.iter() {
        if source.owns_table(table) {
            return source.name.clone();
        }
    }
    LOCAL_SOURCE.to_string()
}

#[async_trait::async_trait]
pub trait SourceExecutor: Send + Sync {
    async fn execute(&self, plan: &PlanNode, tenant: &str) -> Result<Vec<Row>>;
}

pub fn executor_for(source: &DataSource) -> Arc<dyn SourceExecutor> {
    if source.kind == SourceKind::Embedding {
        return Arc::new(EmbeddingExecutor);
    }
    if source.name == LOCAL_SOURCE || source.endpoint.is_empty() {
        Arc::new(LocalExecutor)
    } else {
        Arc::new(RemoteExecutor {
            source: source.clone(),
        })
    }
}

/// executes sub-plans against the partition-local record store
pub struct LocalExecutor;

#[async_trait::async_trait]
impl SourceExecutor for LocalExecutor {
    async fn execute(&self, plan: &PlanNode, tenant: &str) -> Result<Vec<Row>> {
        execute_local(plan, tenant)
    }
}

pub fn execute_local(plan: &PlanNode, tenant: &str) -> Result<Vec<Row>> {
    match plan {
        PlanNode::Scan {
            table,
            projection,
            predicate,
            partition_filter,
            ..
        } => {
            let keys = partition_filter.as_ref().map(|f| f.keys.as_slice());
            if let Some(keys) = keys {
                config::metrics::QUERY_PARTITIONS_SCANNED
                    .with_label_values(&[tenant])
                    .inc_by(keys.len() as u64);
            }
            let mut rows = db::scan(tenant, table, keys)?;
            if let Some(predicate) = predicate {
                rows = exec::apply_filter(rows, predicate)?;
            }
            if !projection.is_empty() {
                rows = exec::apply_project(rows, projection);
            }
            Ok(rows)
        }
        PlanNode::Filter { predicate, input } => {
            exec::apply_filter(execute_local(input, tenant)?, predicate)
        }
        PlanNode::Project { columns, input } => {
            Ok(exec::apply_project(execute_local(input, tenant)?, columns))
        }
        PlanNode::Join {
            join_type,
            on,
            left,
            right,
        } => Ok(exec::hash_join(
            execute_local(left, tenant)?,
            execute_local(right, tenant)?,
            *join_type,
            on,
        )),
        PlanNode::Aggregate { keys, aggs, input } => {
            exec::apply_aggregate(execute_local(input, tenant)?, keys, aggs)
        }
        PlanNode::Sort { keys, input } => {
            Ok(exec::apply_sort(execute_local(input, tenant)?, keys))
        }
        PlanNode::Limit { n, offset, input } => {
            Ok(exec::apply_limit(execute_local(input, tenant)?, *n, *offset))
        }
        PlanNode::Union { inputs } => {
            let mut rows = Vec::new();
            for input in inputs {
                rows.append(&mut execute_local(input, tenant)?);
            }
            Ok(rows)
        }
        PlanNode::Pivot { spec, input } => {
            exec::apply_pivot(execute_local(input, tenant)?, spec)
        }
        PlanNode::TimeSeries { window, input } => {
            exec::apply_resample(execute_local(input, tenant)?, window)
        }
        PlanNode::Graph { spec } => execute_graph(spec, tenant),
        PlanNode::MapReduce { spec } => execute_map_reduce(spec, tenant),
    }
}

/// breadth-first traversal over edge records (src/dst columns)
fn execute_graph(
    spec: &config::meta::query::GraphTraversal,
    tenant: &str,
) -> Result<Vec<Row>> {
    use config::meta::query::Direction;
    let edges = db::scan(tenant, &spec.edge_collection, None)?;
    let mut frontier: Vec<String> = vec![spec.start_node.clone()];
    let mut visited: hashbrown::HashSet<String> = frontier.iter().cloned().collect();
    let mut out = Vec::new();
    for depth in 1..=spec.max_depth {
        let mut next = Vec::new();
        for edge in &edges {
            let src = exec::get_field(edge, "src").and_then(|v| v.as_str());
            let dst = exec::get_field(edge, "dst").and_then(|v| v.as_str());
            let (Some(src), Some(dst)) = (src, dst) else {
                continue;
            };
            let follow = match spec.direction {
                Direction::Outbound => frontier.iter().any(|n| n == src).then_some(dst),
                Direction::Inbound => frontier.iter().any(|n| n == dst).then_some(src),
                Direction::Any => {
                    if frontier.iter().any(|n| n == src) {
                        Some(dst)
                    } else if frontier.iter().any(|n| n == dst) {
                        Some(src)
                    } else {
                        None
                    }
                }
            };
            if let Some(node) = follow {
                let mut row = edge.as_object().cloned().unwrap_or_default();
                row.insert("depth".to_string(), json::json!(depth));
                out.push(json::Value::Object(row));
                if visited.insert(node.to_string()) {
                    next.push(node.to_string());
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }
    Ok(out)
}

/// The map function is a recognized `emit(doc.<key>, <value>)` form and the
/// reduce one of sum/count/length; anything else is rejected up front.
fn execute_map_reduce(
    spec: &config::meta::query::MapReduce,
    tenant: &str,
) -> Result<Vec<Row>> {
    static EMIT: Lazy<regex::Regex> = Lazy::new(|| {
        regex::Regex::new(r"emit\s*\(\s*\w+\.(\w+)\s*,\s*(?:\w+\.(\w+)|(\d+))\s*\)")
            .expect("valid regex")
    });
    let caps = EMIT.captures(&spec.map_fn).ok_or_else(|| {
        Error::ErrorCode(ErrorCodes::QueryValidationError(
            "map function must be of the form emit(doc.key, value)".to_string(),
        ))
    })?;
    let key_field = caps[1].to_string();
    let value_field = caps.get(2).map(|m| m.as_str().to_string());
    let reduce = spec.reduce_fn.to_lowercase();
    let is_sum = reduce.contains("sum") || reduce.contains('+');

    let rows = db::scan(tenant, &spec.collection, None)?;
    let mut groups: std::collections::HashMap<String, (usize, f64)> = Default::default();
    for row in &rows {
        let Some(key) = exec::get_field(row, &key_field).map(|v| match v {
            json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }) else {
            continue;
        };
        let value = match &value_field {
            Some(field) => exec::get_field(row, field).and_then(|v| v.as_f64()).unwrap_or(0.0),
            None => caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(1.0),
        };
        let entry = groups.entry(key).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += value;
    }

    let mut out: Vec<Row> = groups
        .into_iter()
        .map(|(key, (count, sum))| {
            let value = if is_sum { sum } else { count as f64 };
            json::json!({"_id": key, "value": value})
        })
        .collect();
    out = exec::apply_sort(
        out,
        &[config::meta::query::OrderBy {
            field: "_id".to_string(),
            descending: false,
        }],
    );
    Ok(out)
}

/// remote sources speak the query API over HTTP
pub struct RemoteExecutor {
    source: DataSource,
}

#[async_trait::async_trait]
impl SourceExecutor for RemoteExecutor {
    async fn execute(&self, plan: &PlanNode, tenant: &str) -> Result<Vec<Row>> {
        let client = reqwest::Client::new();
        let url = format!(
            "{}/v1/federation/execute",
            self.source.endpoint.trim_end_matches('/')
        );
        let mut request = client.post(&url).json(&json::json!({
            "tenant": tenant,
            "plan": plan,
        }));
        request = match &self.source.auth {
            SourceAuth::None => request,
            SourceAuth::ApiKey { key } => request.header("x-api-key", key),
            SourceAuth::Token { token } => request.bearer_auth(token),
            SourceAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        };
        let response = request.send().await.map_err(|e| {
            Error::ErrorCode(ErrorCodes::PeerUnreachable(format!(
                "{}: {e}",
                self.source.name
            )))
        })?;
        if !response.status().is_success() {
            return Err(Error::ErrorCode(ErrorCodes::PeerUnreachable(format!(
                "{}: status {}",
                self.source.name,
                response.status()
            ))));
        }
        let rows: Vec<Row> = response
            .json()
            .await
            .map_err(|e| Error::Message(format!("invalid rows from {}: {e}", self.source.name)))?;
        Ok(rows)
    }
}

/// fixed-dimension embedding stub; a model container plugs in behind the
/// same executor interface
pub struct EmbeddingExecutor;

pub const EMBEDDING_DIM: usize = 16;

pub fn embed(text: &str) -> Vec<f32> {
    let mut out = vec![0f32; EMBEDDING_DIM];
    for (i, b) in text.bytes().enumerate() {
        out[i % EMBEDDING_DIM] += (b as f32) / 255.0;
    }
    let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut out {
            *v /= norm;
        }
    }
    out
}

#[async_trait::async_trait]
impl SourceExecutor for EmbeddingExecutor {
    async fn execute(&self, plan: &PlanNode, _tenant: &str) -> Result<Vec<Row>> {
        // embed the text literals of the plan's predicates
        let mut texts = Vec::new();
        plan.walk(&mut |node| {
            if let PlanNode::Scan {
                predicate: Some(predicate),
                ..
            } = node
            {
                collect_text(predicate, &mut texts);
            }
            if let PlanNode::Filter { predicate, .. } = node {
                collect_text(predicate, &mut texts);
            }
        });
        Ok(texts
            .into_iter()
            .map(|text| {
                json::json!({
                    "text": text.clone(),
                    "vector": embed(&text),
                })
            })
            .collect())
    }
}

fn collect_text(predicate: &Predicate, out: &mut Vec<String>) {
    match predicate {
        Predicate::Text { query } => out.push(query.clone()),
        Predicate::Cmp {
            op: CmpOp::Eq,
            value: config::meta::query::Scalar::String(s),
            ..
        } => out.push(s.clone()),
        Predicate::And(parts) | Predicate::Or(parts) => {
            for part in parts {
                collect_text(part, out);
            }
        }
        Predicate::Not(inner) => collect_text(inner, out),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_table_defaults_to_local() {
        init();
        assert_eq!(resolve_table("anything"), LOCAL_SOURCE);
        register(DataSource {
            name: "docs".to_string(),
            kind: SourceKind::Document,
            endpoint: String::new(),
            auth: SourceAuth::None,
            capabilities: Capabilities::default(),
            tables: vec!["profiles".to_string()],
            version: 0,
        });
        assert_eq!(resolve_table("profiles"), "docs");
    }

    #[test]
    fn test_version_bump() {
        init();
        let before = version_of(LOCAL_SOURCE);
        bump_version(LOCAL_SOURCE);
        assert_eq!(version_of(LOCAL_SOURCE), before + 1);
    }

    #[test]
    fn test_embedding_is_normalized_and_fixed_dim() {
        let v = embed("hello world");
        assert_eq!(v.len(), EMBEDDING_DIM);
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(embed("hello world"), v);
    }
}
