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

//! Rate limiting per (tenant, resource): a continuously refilling token
//! bucket smoothed by a sliding request window. Backend failures fail open
//! by default with a logged warning; the trade-off is configurable.

use std::collections::VecDeque;

use config::{
    RwHashMap, get_config,
    meta::ratelimit::{RateLimitDecision, RateLimitRule},
    metrics,
    utils::time::now_micros,
};
use once_cell::sync::Lazy;

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    /// micros of the last refill
    last_refill: i64,
    /// request timestamps inside the sliding window
    window: VecDeque<i64>,
}

static BUCKETS: Lazy<RwHashMap<(String, String), Bucket>> = Lazy::new(Default::default);
static RULES: Lazy<RwHashMap<(String, String), RateLimitRule>> = Lazy::new(Default::default);

pub fn set_rule(rule: RateLimitRule) {
    let key = (rule.tenant.clone(), rule.resource.clone());
    // a changed rule rebuilds the bucket on next use
    BUCKETS.remove(&key);
    RULES.insert(key, rule);
}

fn limits_for(tenant: &str, resource: &str) -> (f64, f64) {
    let cfg = get_config();
    RULES
        .get(&(tenant.to_string(), resource.to_string()))
        .map(|r| (r.requests_per_second, r.burst_size))
        .unwrap_or((cfg.ratelimit.requests_per_second, cfg.ratelimit.burst_size))
}

/// Atomically take `n` tokens. Denials return how long until a token frees
/// up; the answer is clamped to at least 100ms so callers do not spin.
pub fn try_consume(tenant: &str, resource: &str, n: f64) -> RateLimitDecision {
    let cfg = get_config();
    if !cfg.ratelimit.enabled {
        return RateLimitDecision::allow();
    }

    let decision = consume_inner(tenant, resource, n);
    match decision {
        Ok(decision) => {
            let label = if decision.allowed { "allowed" } else { "limited" };
            metrics::RATELIMIT_REQUESTS
                .with_label_values(&[tenant, resource, label])
                .inc();
            decision
        }
        Err(e) => {
            // backend trouble: fail open unless configured otherwise
            if cfg.ratelimit.fail_open {
                log::warn!("[RATELIMIT] backend error, failing open: {e}");
                metrics::RATELIMIT_REQUESTS
                    .with_label_values(&[tenant, resource, "fail_open"])
                    .inc();
                RateLimitDecision::allow()
            } else {
                metrics::RATELIMIT_REQUESTS
                    .with_label_values(&[tenant, resource, "fail_closed"])
                    .inc();
                RateLimitDecision::deny(1.0)
            }
        }
    }
}

fn consume_inner(
    tenant: &str,
    resource: &str,
    n: f64,
) -> Result<RateLimitDecision, infra::errors::Error> {
    let cfg = get_config();
    let now = now_micros();
    let key = (tenant.to_string(), resource.to_string());
    let (rate, capacity) = limits_for(tenant, resource);

    let mut bucket = BUCKETS.entry(key).or_insert_with(|| Bucket {
        tokens: capacity,
        capacity,
        refill_per_sec: rate,
        last_refill: now,
        window: VecDeque::new(),
    });

    // continuous refill, tokens never exceed the burst capacity
    let elapsed_secs = ((now - bucket.last_refill).max(0) as f64) / 1_000_000.0;
    bucket.tokens = (bucket.tokens + elapsed_secs * bucket.refill_per_sec).min(bucket.capacity);
    bucket.last_refill = now;

    // sliding window bookkeeping
    let window_micros = (cfg.ratelimit.window_size as i64) * 1_000_000;
    while let Some(first) = bucket.window.front() {
        if now - first > window_micros {
            bucket.window.pop_front();
        } else {
            break;
        }
    }
    let window_cap = bucket.refill_per_sec * cfg.ratelimit.window_size as f64
        + bucket.capacity;
    if bucket.window.len() as f64 + n > window_cap {
        metrics::RATELIMIT_VIOLATIONS
            .with_label_values(&[tenant, resource])
            .inc();
        let retry = retry_after(&bucket, n);
        return Ok(RateLimitDecision::deny(retry));
    }

    if bucket.tokens >= n && n <= bucket.capacity {
        bucket.tokens -= n;
        for _ in 0..n.max(1.0) as usize {
            bucket.window.push_back(now);
        }
        Ok(RateLimitDecision::allow())
    } else {
        metrics::RATELIMIT_VIOLATIONS
            .with_label_values(&[tenant, resource])
            .inc();
        let retry = retry_after(&bucket, n);
        Ok(RateLimitDecision::deny(retry))
    }
}

fn retry_after(bucket: &Bucket, n: f64) -> f64 {
    if bucket.refill_per_sec <= 0.0 {
        return f64::INFINITY;
    }
    let missing = (n.min(bucket.capacity) - bucket.tokens).max(0.0);
    (missing / bucket.refill_per_sec).max(0.1)
}

#[cfg(test)]
pub fn reset(tenant: &str, resource: &str) {
    BUCKETS.remove(&(tenant.to_string(), resource.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(tenant: &str, rps: f64, burst: f64) -> RateLimitRule {
        RateLimitRule {
            tenant: tenant.to_string(),
            resource: "query".to_string(),
            requests_per_second: rps,
            burst_size: burst,
        }
    }

    #[test]
    fn test_burst_then_limited() {
        set_rule(rule("rl_t1", 10.0, 20.0));
        reset("rl_t1", "query");
        let mut allowed = 0;
        let mut denied = 0;
        for _ in 0..25 {
            let decision = try_consume("rl_t1", "query", 1.0);
            if decision.allowed {
                allowed += 1;
            } else {
                denied += 1;
                assert!(decision.retry_after_secs >= 0.1);
                assert!(decision.retry_after_secs <= 1.0);
            }
        }
        // burst of 20 admitted, the rest rejected with a retry hint
        assert_eq!(allowed, 20);
        assert_eq!(denied, 5);
    }

    #[test]
    fn test_capacity_zero_admits_nothing() {
        set_rule(rule("rl_t2", 10.0, 0.0));
        reset("rl_t2", "query");
        let decision = try_consume("rl_t2", "query", 1.0);
        assert!(!decision.allowed);
    }

    #[test]
    fn test_rate_zero_admits_only_capacity() {
        set_rule(rule("rl_t3", 0.0, 3.0));
        reset("rl_t3", "query");
        for _ in 0..3 {
            assert!(try_consume("rl_t3", "query", 1.0).allowed);
        }
        let decision = try_consume("rl_t3", "query", 1.0);
        assert!(!decision.allowed);
        assert!(decision.retry_after_secs.is_infinite());
    }

    #[test]
    fn test_tokens_bounded_by_capacity() {
        set_rule(rule("rl_t4", 1000.0, 5.0));
        reset("rl_t4", "query");
        // drain, then refill cannot exceed burst
        for _ in 0..5 {
            assert!(try_consume("rl_t4", "query", 1.0).allowed);
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut allowed = 0;
        for _ in 0..100 {
            if try_consume("rl_t4", "query", 1.0).allowed {
                allowed += 1;
            }
        }
        assert!(allowed <= 5 + 10); // capacity plus a little continuous refill
    }
}
