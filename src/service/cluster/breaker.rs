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

//! Circuit breakers per (node, service). Closed trips to Open after a run of
//! consecutive failures; Open rejects until the cooldown lapses, then
//! HalfOpen admits a few probes. A failed probe re-opens with the cooldown
//! doubled, up to the cap.

use std::time::Duration;

use config::{RwHashMap, get_config, metrics, utils::time::now_micros};
use infra::errors::*;
use once_cell::sync::Lazy;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
struct Breaker {
    state: BreakerState,
    consecutive_failures: usize,
    /// micros when the open state lapses
    open_until: i64,
    cooldown: Duration,
    probes_in_flight: usize,
}

impl Breaker {
    fn new() -> Self {
        Breaker {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            open_until: 0,
            cooldown: Duration::from_secs(get_config().cluster.breaker_cooldown),
            probes_in_flight: 0,
        }
    }
}

static BREAKERS: Lazy<RwHashMap<(String, String), Breaker>> = Lazy::new(Default::default);

fn key(node: &str, service: &str) -> (String, String) {
    (node.to_string(), service.to_string())
}

fn state_gauge(node: &str, service: &str, state: BreakerState) {
    let value = match state {
        BreakerState::Closed => 0,
        BreakerState::Open => 1,
        BreakerState::HalfOpen => 2,
    };
    metrics::CIRCUIT_BREAKER_STATE
        .with_label_values(&[node, service])
        .set(value);
}

/// gate a call; Err(CircuitOpen) means do not even try
pub fn acquire(node: &str, service: &str) -> Result<()> {
    let cfg = get_config();
    let mut breaker = BREAKERS.entry(key(node, service)).or_insert_with(Breaker::new);
    match breaker.state {
        BreakerState::Closed => Ok(()),
        BreakerState::Open => {
            if now_micros() >= breaker.open_until {
                breaker.state = BreakerState::HalfOpen;
                breaker.probes_in_flight = 1;
                state_gauge(node, service, BreakerState::HalfOpen);
                log::info!("[BREAKER] {node}/{service} half-open, probing");
                Ok(())
            } else {
                Err(Error::ErrorCode(ErrorCodes::CircuitOpen(format!(
                    "{node}/{service}"
                ))))
            }
        }
        BreakerState::HalfOpen => {
            if breaker.probes_in_flight < cfg.cluster.breaker_probe_limit {
                breaker.probes_in_flight += 1;
                Ok(())
            } else {
                Err(Error::ErrorCode(ErrorCodes::CircuitOpen(format!(
                    "{node}/{service} probe limit"
                ))))
            }
        }
    }
}

pub fn record_success(node: &str, service: &str) {
    let mut breaker = BREAKERS.entry(key(node, service)).or_insert_with(Breaker::new);
    let was = breaker.state;
    breaker.state = BreakerState::Closed;
    breaker.consecutive_failures = 0;
    breaker.probes_in_flight = 0;
    breaker.cooldown = Duration::from_secs(get_config().cluster.breaker_cooldown);
    if was != BreakerState::Closed {
        log::info!("[BREAKER] {node}/{service} closed");
    }
    state_gauge(node, service, BreakerState::Closed);
}

pub fn record_failure(node: &str, service: &str) {
    let cfg = get_config();
    let mut breaker = BREAKERS.entry(key(node, service)).or_insert_with(Breaker::new);
    match breaker.state {
        BreakerState::Closed => {
            breaker.consecutive_failures += 1;
            if breaker.consecutive_failures >= cfg.cluster.breaker_failure_threshold {
                open(&mut breaker, node, service, false);
            }
        }
        BreakerState::HalfOpen => {
            // a failed probe re-opens and doubles the cooldown
            open(&mut breaker, node, service, true);
        }
        BreakerState::Open => {}
    }
}

fn open(breaker: &mut Breaker, node: &str, service: &str, double: bool) {
    let cap = Duration::from_secs(get_config().cluster.breaker_cooldown_max);
    if double {
        breaker.cooldown = (breaker.cooldown * 2).min(cap);
    }
    breaker.state = BreakerState::Open;
    breaker.open_until = now_micros() + breaker.cooldown.as_micros() as i64;
    breaker.probes_in_flight = 0;
    state_gauge(node, service, BreakerState::Open);
    log::warn!(
        "[BREAKER] {node}/{service} open for {}s",
        breaker.cooldown.as_secs()
    );
}

pub fn state(node: &str, service: &str) -> BreakerState {
    BREAKERS
        .get(&key(node, service))
        .map(|b| b.state)
        .unwrap_or(BreakerState::Closed)
}

/// a source that ignored cancellation gets its breaker forced open
pub fn force_open(node: &str, service: &str) {
    let mut breaker = BREAKERS.entry(key(node, service)).or_insert_with(Breaker::new);
    open(&mut breaker, node, service, false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_after_threshold() {
        let (node, service) = ("bk-n1", "query");
        record_success(node, service);
        let threshold = get_config().cluster.breaker_failure_threshold;
        for _ in 0..threshold - 1 {
            record_failure(node, service);
            assert_eq!(state(node, service), BreakerState::Closed);
        }
        record_failure(node, service);
        assert_eq!(state(node, service), BreakerState::Open);
        assert!(acquire(node, service).is_err());
    }

    #[test]
    fn test_half_open_probe_and_close() {
        let (node, service) = ("bk-n2", "query");
        force_open(node, service);
        // fast-forward past the cooldown
        BREAKERS.get_mut(&key(node, service)).unwrap().open_until = now_micros() - 1;
        assert!(acquire(node, service).is_ok());
        assert_eq!(state(node, service), BreakerState::HalfOpen);
        record_success(node, service);
        assert_eq!(state(node, service), BreakerState::Closed);
    }

    #[test]
    fn test_failed_probe_doubles_cooldown() {
        let (node, service) = ("bk-n3", "query");
        force_open(node, service);
        let first = BREAKERS.get(&key(node, service)).unwrap().cooldown;
        BREAKERS.get_mut(&key(node, service)).unwrap().open_until = now_micros() - 1;
        assert!(acquire(node, service).is_ok());
        record_failure(node, service);
        let breaker = BREAKERS.get(&key(node, service)).unwrap();
        assert_eq!(breaker.state, BreakerState::Open);
        assert_eq!(breaker.cooldown, first * 2);
    }

    #[test]
    fn test_probe_limit() {
        let (node, service) = ("bk-n4", "query");
        force_open(node, service);
        BREAKERS.get_mut(&key(node, service)).unwrap().open_until = now_micros() - 1;
        let limit = get_config().cluster.breaker_probe_limit;
        for _ in 0..limit {
            assert!(acquire(node, service).is_ok());
        }
        assert!(acquire(node, service).is_err());
    }
}
