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

//! The internal metric collector: counters, gauges, histograms and
//! summaries with bounded label cardinality, aggregated over fixed windows.
//! Prometheus exposition is handled by the shared registry; this collector
//! feeds alert evaluation and retention.

use std::collections::HashMap;

use config::{RwHashMap, utils::time::now_micros};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// max distinct label values per metric; beyond it samples fold into "_other"
pub const MAX_LABEL_VALUES: usize = 10;

pub const WINDOWS: [(&str, i64); 5] = [
    ("1m", 60),
    ("5m", 300),
    ("15m", 900),
    ("1h", 3600),
    ("1d", 86400),
];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sample {
    pub value: f64,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Series {
    pub kind: MetricKind,
    pub label: String,
    pub samples: Vec<Sample>,
}

static SERIES: Lazy<RwHashMap<(String, String), Series>> = Lazy::new(Default::default);
static LABEL_COUNTS: Lazy<RwHashMap<String, usize>> = Lazy::new(Default::default);

fn bounded_label(metric: &str, label: &str) -> String {
    if SERIES.contains_key(&(metric.to_string(), label.to_string())) {
        return label.to_string();
    }
    let mut count = LABEL_COUNTS.entry(metric.to_string()).or_insert(0);
    if *count >= MAX_LABEL_VALUES {
        return "_other".to_string();
    }
    *count += 1;
    label.to_string()
}

pub fn record(metric: &str, label: &str, kind: MetricKind, value: f64) {
    let label = bounded_label(metric, label);
    let now = now_micros();
    let mut series = SERIES
        .entry((metric.to_string(), label.clone()))
        .or_insert_with(|| Series {
            kind,
            label,
            samples: Vec::new(),
        });
    match kind {
        MetricKind::Counter => {
            // counters accumulate, everything else records raw samples
            let last = series.samples.last().map(|s| s.value).unwrap_or(0.0);
            series.samples.push(Sample {
                value: last + value,
                timestamp: now,
            });
        }
        _ => series.samples.push(Sample {
            value,
            timestamp: now,
        }),
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WindowAggregate {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub last: f64,
}

/// aggregate one metric/label over a named window
pub fn aggregate(metric: &str, label: &str, window: &str) -> Option<WindowAggregate> {
    let seconds = WINDOWS.iter().find(|(name, _)| *name == window)?.1;
    let cutoff = now_micros() - seconds * 1_000_000;
    let series = SERIES.get(&(metric.to_string(), label.to_string()))?;
    let samples: Vec<&Sample> = series
        .samples
        .iter()
        .filter(|s| s.timestamp >= cutoff)
        .collect();
    if samples.is_empty() {
        return None;
    }
    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    let sum: f64 = values.iter().sum();
    Some(WindowAggregate {
        count: values.len() as u64,
        sum,
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        avg: sum / values.len() as f64,
        last: *values.last().expect("non-empty"),
    })
}

/// latest value regardless of window, the alert evaluator's default read
pub fn latest(metric: &str, label: &str) -> Option<f64> {
    SERIES
        .get(&(metric.to_string(), label.to_string()))
        .and_then(|s| s.samples.last().map(|sample| sample.value))
}

pub fn list_metrics() -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for entry in SERIES.iter() {
        let (metric, label) = entry.key();
        out.entry(metric.clone()).or_default().push(label.clone());
    }
    out
}

/// drop samples older than the longest window; called by the retention job
pub fn enforce_retention() -> usize {
    let cutoff = now_micros() - WINDOWS[WINDOWS.len() - 1].1 * 1_000_000;
    let mut dropped = 0;
    for mut entry in SERIES.iter_mut() {
        let before = entry.samples.len();
        entry.samples.retain(|s| s.timestamp >= cutoff);
        dropped += before - entry.samples.len();
    }
    SERIES.retain(|_, series| !series.samples.is_empty());
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        record("col_requests", "t1", MetricKind::Counter, 1.0);
        record("col_requests", "t1", MetricKind::Counter, 2.0);
        assert_eq!(latest("col_requests", "t1"), Some(3.0));
    }

    #[test]
    fn test_gauge_window_aggregate() {
        for v in [1.0, 5.0, 3.0] {
            record("col_cpu", "n1", MetricKind::Gauge, v);
        }
        let agg = aggregate("col_cpu", "n1", "1m").unwrap();
        assert_eq!(agg.count, 3);
        assert_eq!(agg.min, 1.0);
        assert_eq!(agg.max, 5.0);
        assert_eq!(agg.last, 3.0);
        assert!((agg.avg - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_label_cardinality_cap() {
        for i in 0..20 {
            record("col_wide", &format!("label{i}"), MetricKind::Gauge, 1.0);
        }
        let metrics = list_metrics();
        let labels = metrics.get("col_wide").unwrap();
        assert!(labels.len() <= MAX_LABEL_VALUES + 1);
        assert!(labels.iter().any(|l| l == "_other"));
    }

    #[test]
    fn test_unknown_window() {
        assert!(aggregate("col_cpu", "n1", "2h").is_none());
    }
}
