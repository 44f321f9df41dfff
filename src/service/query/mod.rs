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

//! The query pipeline: parse, plan, optimize, federate, post-process. Every
//! request carries a deadline; cancellation propagates into the dispatcher.

pub mod optimizer;
pub mod parser;
pub mod planner;

use std::time::{Duration, Instant};

use config::{
    get_config,
    meta::{
        query::{AstBody, Dialect, MatchRecognize, QueryAst},
        search::{ErrorDetail, QueryRequest, QueryResponse, ResponseMetrics, ResponseStatus},
    },
    metrics,
    utils::json,
};
use infra::errors::*;
use tokio_util::sync::CancellationToken;

use super::federation::{self, exec};

pub async fn search(request: &QueryRequest) -> Result<QueryResponse> {
    let started = Instant::now();
    let cfg = get_config();
    let dialect: Dialect = request
        .dialect
        .parse()
        .map_err(|e: String| Error::ErrorCode(ErrorCodes::InvalidRequest(e)))?;

    let ast = parser::parse(dialect, &request.query)?;
    let plan = planner::build_plan(&ast)?;
    let optimized = optimizer::optimize(&plan)?;

    let timeout_ms = if request.options.timeout_ms > 0 {
        request.options.timeout_ms
    } else {
        cfg.limit.query_timeout * 1000
    };
    let cancel = CancellationToken::new();
    let execute = federation::execute(&optimized, &request.tenant, &request.options, cancel.clone());
    let mut result = match tokio::time::timeout(Duration::from_millis(timeout_ms), execute).await
    {
        Ok(result) => result?,
        Err(_) => {
            // deadline passed: cancel the in-flight sub-plans cooperatively
            cancel.cancel();
            return Err(Error::ErrorCode(ErrorCodes::Timeout(format!(
                "query exceeded {timeout_ms}ms"
            ))));
        }
    };

    // coordinator-side extensions that work on the final relation
    if let AstBody::Select(select) = &ast.body {
        if let Some(mr) = &select.match_recognize {
            result.rows = match_recognize(result.rows, mr)?;
        }
    }
    if let Some(center) = near_center(&ast) {
        result.rows = rank_by_distance(result.rows, center);
    }
    if let Some(out_collection) = out_target(&ast) {
        write_out(&request.tenant, &out_collection, &result.rows)?;
    }

    let took_ms = started.elapsed().as_millis() as u64;
    let status_label = match result.status {
        ResponseStatus::Ok => "ok",
        ResponseStatus::Partial => "partial",
        ResponseStatus::Failed => "failed",
    };
    metrics::QUERY_TOTAL
        .with_label_values(&[&request.tenant, &request.dialect, status_label])
        .inc();
    metrics::QUERY_DURATION
        .with_label_values(&[&request.tenant, &request.dialect])
        .observe(took_ms as f64 / 1000.0);

    let partitions_scanned = count_partitions(&optimized);
    let partitions_pruned = super::db::TEMPORAL_INDEX
        .len()
        .saturating_sub(partitions_scanned);
    if partitions_scanned > 0 {
        metrics::QUERY_PARTITIONS_PRUNED
            .with_label_values(&[&request.tenant])
            .inc_by(partitions_pruned as u64);
    }
    Ok(QueryResponse {
        status: result.status,
        metrics: ResponseMetrics {
            took_ms,
            sub_plans: result.sub_plans,
            partitions_scanned,
            partitions_pruned,
            rows_returned: result.rows.len(),
            cache_hit: result.cache_hit,
        },
        data: result.rows,
        errors: result.errors,
    })
}

fn count_partitions(plan: &config::meta::plan::PlanNode) -> usize {
    let mut count = 0;
    plan.walk(&mut |node| {
        if let config::meta::plan::PlanNode::Scan {
            partition_filter: Some(filter),
            ..
        } = node
        {
            count += filter.keys.len();
        }
    });
    count
}

/// the `$near` reference point, when the query is a geo lookup
fn near_center(ast: &QueryAst) -> Option<(f64, f64)> {
    use config::meta::query::{GeoPredicate, Predicate};
    let filter = match &ast.body {
        AstBody::Find(find) => find.filter.as_ref()?,
        _ => return None,
    };
    let mut center = None;
    fn scan(predicate: &Predicate, center: &mut Option<(f64, f64)>) {
        match predicate {
            Predicate::Geo(GeoPredicate::Near { point, .. }) => *center = Some(*point),
            Predicate::And(parts) | Predicate::Or(parts) => {
                for part in parts {
                    scan(part, center);
                }
            }
            Predicate::Not(inner) => scan(inner, center),
            _ => {}
        }
    }
    scan(filter, &mut center);
    center
}

/// geo lookups come back ordered by distance from the reference point
fn rank_by_distance(mut rows: Vec<json::Value>, center: (f64, f64)) -> Vec<json::Value> {
    let distance = |row: &json::Value| -> f64 {
        let lat = exec::get_field(row, "geo_lat").and_then(|v| v.as_f64());
        let lon = exec::get_field(row, "geo_lon").and_then(|v| v.as_f64());
        match (lat, lon) {
            (Some(lat), Some(lon)) => exec::haversine_m(center.0, center.1, lat, lon),
            _ => f64::MAX,
        }
    };
    rows.sort_by(|a, b| {
        distance(a)
            .partial_cmp(&distance(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    rows
}

fn out_target(ast: &QueryAst) -> Option<String> {
    if let AstBody::Pipeline(pipeline) = &ast.body {
        for stage in &pipeline.stages {
            if let config::meta::query::PipelineStage::Out { collection } = stage {
                return Some(collection.clone());
            }
        }
    }
    None
}

/// `$out`: materialize the result rows as records of the target stream
fn write_out(tenant: &str, collection: &str, rows: &[json::Value]) -> Result<()> {
    use config::meta::record::{PayloadType, Record};
    for row in rows {
        let timestamp = row
            .get(config::COLUMN_TIMESTAMP)
            .and_then(|v| v.as_i64())
            .unwrap_or_else(config::utils::time::now_micros);
        let record = Record {
            id: config::ider::generate(),
            tenant: tenant.to_string(),
            timestamp,
            geo: None,
            payload: json::to_vec(row)?,
            payload_type: PayloadType::Json,
            tags: std::collections::HashMap::from([(
                super::db::STREAM_TAG.to_string(),
                collection.to_string(),
            )]),
        };
        super::db::write_record(record)?;
    }
    federation::sources::bump_version(federation::sources::LOCAL_SOURCE);
    Ok(())
}

/// Row-pattern matching over the ordered result. The pattern is a sequence
/// of variables, each optionally `+` suffixed; a row belongs to a variable
/// when its DEFINE predicate holds. Matched sequences survive.
fn match_recognize(
    rows: Vec<json::Value>,
    spec: &MatchRecognize,
) -> Result<Vec<json::Value>> {
    let ordered = if spec.order_by.is_empty() {
        rows
    } else {
        exec::apply_sort(rows, &spec.order_by)
    };

    // partition rows, keeping encounter order of partitions
    let mut partitions: Vec<(String, Vec<json::Value>)> = Vec::new();
    for row in ordered {
        let key = spec
            .partition_by
            .iter()
            .map(|f| {
                exec::get_field(&row, f)
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join("\u{1}");
        match partitions.iter_mut().find(|(k, _)| *k == key) {
            Some((_, rows)) => rows.push(row),
            None => partitions.push((key, vec![row])),
        }
    }

    let steps: Vec<(&str, bool)> = spec
        .pattern
        .split_whitespace()
        .map(|tok| match tok.strip_suffix('+') {
            Some(name) => (name, true),
            None => (tok, false),
        })
        .collect();

    let matches_var = |name: &str, row: &json::Value| -> Result<bool> {
        match spec.defines.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some((_, predicate)) => exec::eval_predicate(predicate, row),
            None => Ok(true), // undefined variables match anything
        }
    };

    let mut out = Vec::new();
    for (_, rows) in partitions {
        let mut i = 0;
        while i < rows.len() {
            // try to match the full pattern starting at i
            let mut j = i;
            let mut matched: Vec<usize> = Vec::new();
            let mut ok = true;
            for (name, repeated) in &steps {
                if j >= rows.len() || !matches_var(name, &rows[j])? {
                    ok = false;
                    break;
                }
                matched.push(j);
                j += 1;
                if *repeated {
                    while j < rows.len() && matches_var(name, &rows[j])? {
                        matched.push(j);
                        j += 1;
                    }
                }
            }
            if ok {
                out.extend(matched.iter().map(|idx| rows[*idx].clone()));
                i = j.max(i + 1);
            } else {
                i += 1;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use config::meta::query::{CmpOp, OrderBy, Predicate, Scalar};

    use super::*;

    #[test]
    fn test_match_recognize_down_up() {
        let rows = vec![
            json::json!({"ts": 1, "price": 50}),
            json::json!({"ts": 2, "price": 5}),
            json::json!({"ts": 3, "price": 40}),
            json::json!({"ts": 4, "price": 45}),
        ];
        let spec = MatchRecognize {
            partition_by: vec![],
            order_by: vec![OrderBy {
                field: "ts".to_string(),
                descending: false,
            }],
            pattern: "DOWN UP".to_string(),
            defines: vec![
                (
                    "DOWN".to_string(),
                    Predicate::Cmp {
                        field: "price".to_string(),
                        op: CmpOp::Lt,
                        value: Scalar::Int(10),
                    },
                ),
                (
                    "UP".to_string(),
                    Predicate::Cmp {
                        field: "price".to_string(),
                        op: CmpOp::Gt,
                        value: Scalar::Int(20),
                    },
                ),
            ],
            measures: vec![],
        };
        let matched = match_recognize(rows, &spec).unwrap();
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0]["ts"], 2);
        assert_eq!(matched[1]["ts"], 3);
    }
}
