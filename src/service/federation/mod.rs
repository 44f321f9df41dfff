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

//! The federation executor: split an optimized plan per source, dispatch
//! sub-plans in parallel, merge the outputs at the coordinator. Results are
//! cached under a fingerprint of (plan canonical form, source versions,
//! tenant), so any source version bump invalidates naturally.

pub mod dispatcher;
pub mod exec;
pub mod merge;
pub mod sources;
pub mod splitter;

use bytes::Bytes;
use config::{
    get_config,
    meta::{plan::PlanNode, search::ErrorDetail, search::QueryOptions, search::ResponseStatus},
};
use infra::errors::*;
use tokio_util::sync::CancellationToken;

use self::{exec::Row, merge::MergeInputs};

#[derive(Debug)]
pub struct FederatedResult {
    pub status: ResponseStatus,
    pub rows: Vec<Row>,
    pub errors: Vec<ErrorDetail>,
    pub sub_plans: usize,
    pub cache_hit: bool,
}

/// Deterministic cache key: equal canonical plans over equal source
/// versions for the same tenant always collide. Only the sources the plan
/// actually reads participate, so unrelated writes do not invalidate.
pub fn cache_fingerprint(plan: &PlanNode, tenant: &str) -> String {
    let mut names: Vec<String> = plan
        .scans()
        .iter()
        .filter_map(|scan| match scan {
            PlanNode::Scan { source, table, .. } => Some(if source.is_empty() {
                sources::resolve_table(table)
            } else {
                source.clone()
            }),
            _ => None,
        })
        .collect();
    names.sort();
    names.dedup();
    let mut versions: Vec<String> = names
        .into_iter()
        .map(|name| format!("{}={}", name, sources::version_of(&name)))
        .collect();
    versions.sort();
    let material = format!(
        "{}|{}|{}",
        plan.canonical_form(),
        versions.join(","),
        tenant
    );
    format!("query/{}", sha256::digest(material))
}

pub async fn execute(
    plan: &PlanNode,
    tenant: &str,
    options: &QueryOptions,
    cancel: CancellationToken,
) -> Result<FederatedResult> {
    let cfg = get_config();
    if !options.cache {
        return run(plan, tenant, options, cancel).await;
    }

    let key = cache_fingerprint(plan, tenant);
    let ttl = if options.cache_ttl_secs > 0 {
        options.cache_ttl_secs
    } else {
        cfg.query.result_cache_ttl
    };

    if let Some(encoded) = infra::cache::get(&key).await? {
        return Ok(cached_result(&encoded, tenant)?);
    }

    // single-flight: the first miss computes, concurrent misses wait on the
    // key lock and find the entry on the double check
    let timeout = std::time::Duration::from_secs(cfg.kv_cache.compute_timeout);
    let guard = infra::local_lock::lock_with_timeout(&key, timeout).await;
    if guard.is_some() {
        if let Some(encoded) = infra::cache::get(&key).await? {
            config::metrics::CACHE_SINGLE_FLIGHT_WAITS
                .with_label_values(&[tenant])
                .inc();
            return Ok(cached_result(&encoded, tenant)?);
        }
    }

    let result = run(plan, tenant, options, cancel).await?;
    // partial results never enter the cache
    if result.status == ResponseStatus::Ok && guard.is_some() {
        let encoded = infra::cache::codec::encode(&result.rows)?;
        infra::cache::set(&key, encoded, ttl, 0).await?;
    }
    Ok(result)
}

fn cached_result(encoded: &Bytes, _tenant: &str) -> Result<FederatedResult> {
    let rows: Vec<Row> = infra::cache::codec::decode(encoded)?;
    Ok(FederatedResult {
        status: ResponseStatus::Ok,
        rows,
        errors: vec![],
        sub_plans: 0,
        cache_hit: true,
    })
}

async fn run(
    plan: &PlanNode,
    tenant: &str,
    options: &QueryOptions,
    cancel: CancellationToken,
) -> Result<FederatedResult> {
    let split = splitter::split(plan)?;
    let sub_plan_count = split.sub_plans.len();
    let results = dispatcher::dispatch(&split, tenant, cancel).await;

    let mut inputs = MergeInputs::new();
    let mut errors = Vec::new();
    let mut failed = 0usize;
    for result in results {
        match result.result {
            Ok(rows) => {
                let kind = sources::get(&result.source)
                    .map(|s| s.kind)
                    .unwrap_or(config::meta::source::SourceKind::Relational);
                inputs.insert(result.id, kind, rows)?;
            }
            Err(e) => {
                failed += 1;
                errors.push(ErrorDetail {
                    code: format!("subplan_{}", result.id),
                    message: match &e {
                        Error::ErrorCode(code) => code.get_message(),
                        other => other.to_string(),
                    },
                    field: Some(result.source.clone()),
                    details: None,
                });
                // an empty input lets the coordinator still produce the rest
                inputs.insert(
                    result.id,
                    config::meta::source::SourceKind::Relational,
                    vec![],
                )?;
            }
        }
    }

    if failed > 0 && !options.partial_results {
        return Ok(FederatedResult {
            status: ResponseStatus::Failed,
            rows: vec![],
            errors,
            sub_plans: sub_plan_count,
            cache_hit: false,
        });
    }

    let rows = merge::execute_coordinator(&split.coordinator, &inputs)?;
    let status = if failed == 0 {
        ResponseStatus::Ok
    } else if failed < sub_plan_count {
        ResponseStatus::Partial
    } else {
        ResponseStatus::Failed
    };
    Ok(FederatedResult {
        status,
        rows,
        errors,
        sub_plans: sub_plan_count,
        cache_hit: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_stability() {
        sources::init();
        let plan = PlanNode::Scan {
            source: String::new(),
            table: "fp_events".to_string(),
            projection: vec![],
            predicate: None,
            partition_filter: None,
        };
        let a = cache_fingerprint(&plan, "t1");
        let b = cache_fingerprint(&plan, "t1");
        assert_eq!(a, b);
        assert_ne!(a, cache_fingerprint(&plan, "t2"));

        // fp_events resolves to the local source; bumping it moves the key
        sources::bump_version(sources::LOCAL_SOURCE);
        assert_ne!(a, cache_fingerprint(&plan, "t1"));
    }
}
