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

//! Sub-plan dispatch: a bounded worker pool runs each wave in parallel with
//! a barrier between waves. Every sub-plan gets a timeout and retries with
//! exponential backoff and jitter; cancellation propagates cooperatively,
//! and a source that ignores it is abandoned and marked degraded.

use std::{sync::Arc, time::Duration};

use config::{get_config, metrics, utils::rand::get_rand_num_within};
use infra::errors::*;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{
    exec::Row,
    sources,
    splitter::{SplitPlan, SubPlan},
};
use crate::service::cluster::breaker;

const BREAKER_SERVICE: &str = "federation";

#[derive(Debug)]
pub struct SubPlanResult {
    pub id: usize,
    pub source: String,
    pub result: Result<Vec<Row>>,
}

pub async fn dispatch(
    split: &SplitPlan,
    tenant: &str,
    cancel: CancellationToken,
) -> Vec<SubPlanResult> {
    let cfg = get_config();
    let pool = Arc::new(Semaphore::new(cfg.query.federation_worker_num.max(1)));

    let mut levels: Vec<usize> = split.sub_plans.iter().map(|s| s.level).collect();
    levels.sort_unstable();
    levels.dedup();

    let mut results = Vec::with_capacity(split.sub_plans.len());
    for level in levels {
        // every sub-plan of a wave starts together; the next wave waits
        let wave: Vec<SubPlan> = split
            .sub_plans
            .iter()
            .filter(|s| s.level == level)
            .cloned()
            .collect();
        let mut handles = Vec::with_capacity(wave.len());
        for sub_plan in wave {
            let pool = pool.clone();
            let cancel = cancel.clone();
            let tenant = tenant.to_string();
            handles.push((
                sub_plan.id,
                sub_plan.source.clone(),
                tokio::spawn(async move {
                    let _permit = pool.acquire_owned().await.expect("pool open");
                    run_sub_plan(&sub_plan, &tenant, cancel).await
                }),
            ));
        }

        let cancel_timeout = Duration::from_secs(cfg.query.cancel_timeout);
        for (id, source, handle) in handles {
            let result = if cancel.is_cancelled() {
                // give the in-flight task its cooperative window, then
                // abandon it and degrade the source for the breaker
                match tokio::time::timeout(cancel_timeout, handle).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => Err(Error::Message(format!("sub-plan task failed: {e}"))),
                    Err(_) => {
                        breaker::force_open(&source, BREAKER_SERVICE);
                        Err(Error::ErrorCode(ErrorCodes::QueryCancelled(format!(
                            "sub-plan {id} abandoned after cancel timeout"
                        ))))
                    }
                }
            } else {
                match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(Error::Message(format!("sub-plan task failed: {e}"))),
                }
            };
            let status = if result.is_ok() { "ok" } else { "error" };
            metrics::FEDERATION_SUBPLANS
                .with_label_values(&[&source, status])
                .inc();
            results.push(SubPlanResult { id, source, result });
        }
    }
    results
}

async fn run_sub_plan(
    sub_plan: &SubPlan,
    tenant: &str,
    cancel: CancellationToken,
) -> Result<Vec<Row>> {
    let cfg = get_config();
    breaker::acquire(&sub_plan.source, BREAKER_SERVICE)?;

    let source = sources::get(&sub_plan.source)?;
    let executor = sources::executor_for(&source);
    let timeout = Duration::from_secs(cfg.query.subplan_timeout);

    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::ErrorCode(ErrorCodes::QueryCancelled(format!(
                "sub-plan {}",
                sub_plan.id
            ))));
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::ErrorCode(ErrorCodes::QueryCancelled(format!(
                    "sub-plan {}", sub_plan.id
                ))));
            }
            outcome = tokio::time::timeout(timeout, executor.execute(&sub_plan.plan, tenant)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(Error::ErrorCode(ErrorCodes::Timeout(format!(
                        "sub-plan {} on {}", sub_plan.id, sub_plan.source
                    )))),
                }
            }
        };

        match outcome {
            Ok(rows) => {
                breaker::record_success(&sub_plan.source, BREAKER_SERVICE);
                return Ok(rows);
            }
            Err(e) if e.is_retryable() && attempt < cfg.query.retry_attempts => {
                attempt += 1;
                metrics::FEDERATION_RETRIES
                    .with_label_values(&[&sub_plan.source])
                    .inc();
                let backoff = backoff_delay(attempt);
                log::warn!(
                    "[FEDERATION] sub-plan {} attempt {attempt} failed, retrying in {:?}: {e}",
                    sub_plan.id,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                breaker::record_failure(&sub_plan.source, BREAKER_SERVICE);
                return Err(e);
            }
        }
    }
}

/// exponential backoff with jitter: base × 2^(attempt-1), capped, ±half
fn backoff_delay(attempt: usize) -> Duration {
    let cfg = get_config();
    let base_ms = cfg.query.retry_base_delay * 1000;
    let cap_ms = cfg.query.retry_max_delay * 1000;
    let exp_ms = base_ms
        .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16))
        .min(cap_ms);
    let jittered = get_rand_num_within(exp_ms / 2, exp_ms + 1);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_and_cap() {
        let cfg = get_config();
        let base = cfg.query.retry_base_delay * 1000;
        let cap = cfg.query.retry_max_delay * 1000;
        for attempt in 1..10 {
            let delay = backoff_delay(attempt).as_millis() as u64;
            let expected = base.saturating_mul(1 << (attempt - 1)).min(cap);
            assert!(delay >= expected / 2);
            assert!(delay <= expected);
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        sources::init();
        let sub_plan = SubPlan {
            id: 0,
            source: sources::LOCAL_SOURCE.to_string(),
            plan: super::super::splitter::marker(0),
            level: 0,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_sub_plan(&sub_plan, "default", cancel).await;
        assert!(matches!(
            result,
            Err(Error::ErrorCode(ErrorCodes::QueryCancelled(_)))
        ));
    }
}
