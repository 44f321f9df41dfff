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

//! Alert rules over collected metrics. Rules are evaluated on an interval;
//! a trigger fans out to the registered handlers and the rule stays quiet
//! until its cooldown lapses.
//!
//! Evaluation reads this process's collector only. The job layer restricts
//! it to the raft leader, so rules see the leader's series: node resource
//! metrics arrive there through heartbeats, but counters other nodes record
//! locally are not fanned in.

use std::sync::Arc;

use config::{
    RwHashMap, ider,
    meta::alerts::{Alert, AlertRule},
    metrics,
    utils::{json, time::now_micros},
};
use infra::errors::*;
use once_cell::sync::Lazy;

use super::collector;

static RULES: Lazy<RwHashMap<String, AlertRule>> = Lazy::new(Default::default);
/// last fire time per rule, micros
static LAST_FIRED: Lazy<RwHashMap<String, i64>> = Lazy::new(Default::default);
static HANDLERS: Lazy<RwHashMap<String, Arc<dyn AlertHandler>>> = Lazy::new(Default::default);

#[async_trait::async_trait]
pub trait AlertHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, alert: &Alert) -> Result<()>;
}

pub fn init() {
    register_handler(Arc::new(LogHandler));
    register_handler(Arc::new(WebhookHandler::default()));
}

pub fn register_handler(handler: Arc<dyn AlertHandler>) {
    HANDLERS.insert(handler.name().to_string(), handler);
}

pub fn set_rule(rule: AlertRule) {
    RULES.insert(rule.name.clone(), rule);
}

pub fn delete_rule(name: &str) {
    RULES.remove(name);
    LAST_FIRED.remove(name);
}

pub fn list_rules() -> Vec<AlertRule> {
    RULES.iter().map(|r| r.clone()).collect()
}

/// one evaluation sweep; returns the alerts fired
pub async fn evaluate() -> Result<Vec<Alert>> {
    let now = now_micros();
    let mut fired = Vec::new();
    for rule in list_rules() {
        if !rule.enabled {
            continue;
        }
        // metric name may carry a label: "metric/label"
        let (metric, label) = match rule.metric.split_once('/') {
            Some((m, l)) => (m.to_string(), l.to_string()),
            None => (rule.metric.clone(), String::new()),
        };
        let Some(value) = collector::latest(&metric, &label) else {
            continue;
        };
        if !rule.comparator.evaluate(value, rule.threshold) {
            continue;
        }
        // cooldown suppresses re-fire until elapsed
        if let Some(last) = LAST_FIRED.get(&rule.name) {
            if now - *last < (rule.cooldown_secs as i64) * 1_000_000 {
                continue;
            }
        }
        LAST_FIRED.insert(rule.name.clone(), now);

        let mut context = json::Map::new();
        context.insert("metric".to_string(), json::json!(rule.metric));
        context.insert("value".to_string(), json::json!(value));
        context.insert("threshold".to_string(), json::json!(rule.threshold));
        let alert = Alert {
            id: ider::generate(),
            severity: rule.severity,
            rule: rule.name.clone(),
            context,
            timestamp: now,
        };
        metrics::ALERTS_TRIGGERED
            .with_label_values(&[&rule.name, &rule.severity.to_string()])
            .inc();

        dispatch(&rule, &alert).await;
        fired.push(alert);
    }
    Ok(fired)
}

async fn dispatch(rule: &AlertRule, alert: &Alert) {
    let targets: Vec<String> = if rule.handlers.is_empty() {
        vec!["log".to_string()]
    } else {
        rule.handlers.clone()
    };
    for target in targets {
        let Some(handler) = HANDLERS.get(&target).map(|h| h.clone()) else {
            log::warn!("[ALERTS] rule {} names unknown handler {target}", rule.name);
            continue;
        };
        if let Err(e) = handler.handle(alert).await {
            log::error!("[ALERTS] handler {target} failed for {}: {e}", rule.name);
        }
    }
}

pub struct LogHandler;

#[async_trait::async_trait]
impl AlertHandler for LogHandler {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn handle(&self, alert: &Alert) -> Result<()> {
        log::warn!(
            "[ALERTS] {} severity={} context={}",
            alert.rule,
            alert.severity,
            json::Value::Object(alert.context.clone())
        );
        Ok(())
    }
}

/// POSTs alerts as json; the url comes from the rule-independent env
#[derive(Default)]
pub struct WebhookHandler {
    url: Option<String>,
}

impl WebhookHandler {
    pub fn new(url: &str) -> Self {
        WebhookHandler {
            url: Some(url.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl AlertHandler for WebhookHandler {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn handle(&self, alert: &Alert) -> Result<()> {
        let url = self
            .url
            .clone()
            .or_else(|| std::env::var("DP_ALERT_WEBHOOK_URL").ok())
            .filter(|u| !u.is_empty());
        let Some(url) = url else {
            log::debug!("[ALERTS] webhook handler configured without a url");
            return Ok(());
        };
        reqwest::Client::new()
            .post(&url)
            .json(alert)
            .send()
            .await
            .map_err(|e| Error::Message(format!("webhook delivery failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use config::meta::alerts::{Comparator, Severity};

    use super::*;
    use crate::service::monitor::collector::MetricKind;

    fn rule(name: &str, metric: &str, cooldown: u64) -> AlertRule {
        AlertRule {
            name: name.to_string(),
            metric: metric.to_string(),
            threshold: 0.9,
            comparator: Comparator::Gt,
            severity: Severity::Critical,
            cooldown_secs: cooldown,
            handlers: vec!["log".to_string()],
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_trigger_and_cooldown() {
        init();
        collector::record("alert_cpu", "", MetricKind::Gauge, 0.95);
        set_rule(rule("alert-high-cpu", "alert_cpu", 3600));

        let fired = evaluate().await.unwrap();
        assert!(fired.iter().any(|a| a.rule == "alert-high-cpu"));

        // cooldown suppresses the immediate re-fire
        let fired = evaluate().await.unwrap();
        assert!(!fired.iter().any(|a| a.rule == "alert-high-cpu"));
        delete_rule("alert-high-cpu");
    }

    #[tokio::test]
    async fn test_below_threshold_is_quiet() {
        init();
        collector::record("alert_mem", "", MetricKind::Gauge, 0.2);
        set_rule(rule("alert-mem", "alert_mem", 0));
        let fired = evaluate().await.unwrap();
        assert!(!fired.iter().any(|a| a.rule == "alert-mem"));
        delete_rule("alert-mem");
    }
}
