//! Monitoring & Alerts (§4.9): a bounded in-memory metric store and alert-rule evaluator.
//!
//! Metrics are plain counters/gauges plus a bounded ring buffer per named series for histogram-
//! style latency tracking; nothing here ships to an external TSDB, but the shape is built so a
//! `tracing`-based exporter can be layered on top without changing call sites.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// One recorded observation for a metric series.
#[derive(Debug, Clone, Copy)]
pub struct MetricPoint {
    pub value: f64,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// A bounded ring buffer of recent observations for one metric name + label set.
#[derive(Debug)]
struct MetricSeries {
    points: std::collections::VecDeque<MetricPoint>,
    capacity: usize,
}

impl MetricSeries {
    fn new(capacity: usize) -> Self {
        Self { points: std::collections::VecDeque::with_capacity(capacity.min(1024)), capacity }
    }

    fn push(&mut self, value: f64) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(MetricPoint { value, at: chrono::Utc::now() });
    }

    fn latest(&self) -> Option<f64> {
        self.points.back().map(|p| p.value)
    }

    fn percentile(&self, p: f64) -> Option<f64> {
        if self.points.is_empty() {
            return None;
        }
        let mut values: Vec<f64> = self.points.iter().map(|pt| pt.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let index = ((values.len() - 1) as f64 * p).round() as usize;
        values.get(index).copied()
    }

    fn sum(&self) -> f64 {
        self.points.iter().map(|p| p.value).sum()
    }
}

/// Identifies a metric series by name plus an ordered label set (e.g. `queue=audio_processing`).
/// A `BTreeMap`-backed key would also work; a sorted `Vec` avoids an extra dependency and label
/// sets here are always small (0-2 entries).
fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    let mut labels = labels.to_vec();
    labels.sort();
    let label_str = labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",");
    if label_str.is_empty() {
        name.to_string()
    } else {
        format!("{name}{{{label_str}}}")
    }
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub ring_size: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { ring_size: 10_000 }
    }
}

/// Core metrics required by §4.9: `jobs.created.total`, `jobs.processed.total`,
/// `jobs.failed.total`, `jobs.queue.size{queue}`, `jobs.retry.count`, `jobs.dlq.size{queue}`,
/// `worker.active.count`, `worker.heartbeat.age.p95`, `circuit.state{service}`,
/// `degradation.level`, plus per-service error-category counters and per-operation latency
/// histograms, all recorded through the same two entry points.
#[derive(Debug)]
pub struct MetricsRegistry {
    series: Mutex<HashMap<String, MetricSeries>>,
    config: MetricsConfig,
}

impl MetricsRegistry {
    pub fn new(config: MetricsConfig) -> Self {
        Self { series: Mutex::new(HashMap::new()), config }
    }

    /// Record a raw observation (gauge or histogram point).
    pub fn record(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = series_key(name, labels);
        let mut guard = self.series.lock().unwrap_or_else(|p| p.into_inner());
        guard.entry(key).or_insert_with(|| MetricSeries::new(self.config.ring_size)).push(value);
    }

    /// Record a latency observation in milliseconds for `operation`.
    pub fn record_latency(&self, operation: &str, duration: Duration) {
        self.record("operation.latency.ms", &[("operation", operation)], duration.as_millis() as f64);
    }

    /// Increment a counter by 1 (modeled as pushing `1.0`; consumers sum the series).
    pub fn increment(&self, name: &str, labels: &[(&str, &str)]) {
        self.record(name, labels, 1.0);
    }

    pub fn latest(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let key = series_key(name, labels);
        self.series.lock().unwrap_or_else(|p| p.into_inner()).get(&key).and_then(|s| s.latest())
    }

    pub fn total(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = series_key(name, labels);
        self.series.lock().unwrap_or_else(|p| p.into_inner()).get(&key).map(|s| s.sum()).unwrap_or(0.0)
    }

    pub fn percentile(&self, name: &str, labels: &[(&str, &str)], p: f64) -> Option<f64> {
        let key = series_key(name, labels);
        self.series.lock().unwrap_or_else(|p| p.into_inner()).get(&key).and_then(|s| s.percentile(p))
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

/// Evaluation outcome for a single rule check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlertState {
    Ok,
    Firing,
}

/// A threshold rule over a metric series (spec §3 `AlertRule`). `idempotency key` is
/// `(rule_name, metric_name)`: a rule firing twice in a row while still breaching threshold does
/// not re-fire until it has resolved and breached again, and re-firing respects `cooldown`.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub name: String,
    pub metric_name: String,
    pub labels: Vec<(String, String)>,
    pub threshold: f64,
    pub comparison: AlertComparison,
    pub cooldown: Duration,
    pub severity: AlertSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlertComparison {
    GreaterThan,
    LessThan,
}

/// Alert severity (spec §3 `Alert.severity`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertRule {
    fn breaches(&self, value: f64) -> bool {
        match self.comparison {
            AlertComparison::GreaterThan => value > self.threshold,
            AlertComparison::LessThan => value < self.threshold,
        }
    }
}

/// A persistent alert record (spec §3 `Alert`): survives across evaluations so `triggerCount`
/// and acknowledgment state carry forward while the rule keeps firing.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub rule_name: String,
    pub severity: AlertSeverity,
    pub metric_name: String,
    pub threshold: f64,
    pub actual_value: f64,
    pub triggered_at: chrono::DateTime<chrono::Utc>,
    pub trigger_count: u32,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone)]
struct AlertTracking {
    state: AlertState,
    last_fired: Option<chrono::DateTime<chrono::Utc>>,
    alert: Option<Alert>,
}

/// A firing or resolved alert, returned from [`AlertEvaluator::evaluate`] for the caller to act
/// on (log, page, publish).
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvent {
    pub rule_name: String,
    pub state: AlertState,
    pub value: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("no alert tracked for rule {0:?}")]
    UnknownRule(String),
}

#[derive(Debug)]
pub struct AlertEvaluator {
    rules: Vec<AlertRule>,
    tracking: Mutex<HashMap<String, AlertTracking>>,
}

impl AlertEvaluator {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self { rules, tracking: Mutex::new(HashMap::new()) }
    }

    /// Evaluate every rule against the current value in `metrics`. Returns an event only for
    /// rules that transitioned state (newly firing, or newly resolved), honoring cooldown. A
    /// rule that keeps breaching past its first firing increments `Alert.trigger_count` and
    /// clears any prior acknowledgment — re-breaching is a fresh incident.
    pub fn evaluate(&self, metrics: &MetricsRegistry) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        let mut tracking = self.tracking.lock().unwrap_or_else(|p| p.into_inner());

        for rule in &self.rules {
            let labels: Vec<(&str, &str)> =
                rule.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            let Some(value) = metrics.latest(&rule.metric_name, &labels) else { continue };
            let breaching = rule.breaches(value);

            let entry = tracking
                .entry(rule.name.clone())
                .or_insert(AlertTracking { state: AlertState::Ok, last_fired: None, alert: None });

            if breaching {
                let cooled_down = entry
                    .last_fired
                    .map(|last| chrono::Utc::now() - last >= chrono::Duration::from_std(rule.cooldown).unwrap())
                    .unwrap_or(true);
                if entry.state == AlertState::Ok || cooled_down {
                    let now = chrono::Utc::now();
                    entry.state = AlertState::Firing;
                    entry.last_fired = Some(now);
                    let trigger_count = entry.alert.as_ref().map(|a| a.trigger_count + 1).unwrap_or(1);
                    entry.alert = Some(Alert {
                        rule_name: rule.name.clone(),
                        severity: rule.severity,
                        metric_name: rule.metric_name.clone(),
                        threshold: rule.threshold,
                        actual_value: value,
                        triggered_at: now,
                        trigger_count,
                        acknowledged: false,
                        acknowledged_by: None,
                        acknowledged_at: None,
                    });
                    events.push(AlertEvent { rule_name: rule.name.clone(), state: AlertState::Firing, value });
                }
            } else if entry.state == AlertState::Firing {
                entry.state = AlertState::Ok;
                entry.alert = None;
                events.push(AlertEvent { rule_name: rule.name.clone(), state: AlertState::Ok, value });
            }
        }

        events
    }

    /// Record that `actor` acknowledged the currently-firing alert for `rule_name` (spec §6
    /// "acknowledge alert"). Errors if no alert is currently tracked for that rule.
    pub fn acknowledge(&self, rule_name: &str, actor: &str) -> Result<(), AlertError> {
        let mut tracking = self.tracking.lock().unwrap_or_else(|p| p.into_inner());
        let entry = tracking.get_mut(rule_name).ok_or_else(|| AlertError::UnknownRule(rule_name.to_string()))?;
        let alert = entry.alert.as_mut().ok_or_else(|| AlertError::UnknownRule(rule_name.to_string()))?;
        alert.acknowledged = true;
        alert.acknowledged_by = Some(actor.to_string());
        alert.acknowledged_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// Snapshot of every currently-tracked alert record, firing or not.
    pub fn alerts(&self) -> Vec<Alert> {
        let tracking = self.tracking.lock().unwrap_or_else(|p| p.into_inner());
        tracking.values().filter_map(|t| t.alert.clone()).collect()
    }
}

/// Core metric series names referenced throughout, kept as constants so producers and the
/// default alert rule set stay in sync.
pub mod metric_names {
    pub const JOBS_CREATED_TOTAL: &str = "jobs.created.total";
    pub const JOBS_PROCESSED_TOTAL: &str = "jobs.processed.total";
    pub const JOBS_FAILED_TOTAL: &str = "jobs.failed.total";
    pub const JOBS_QUEUE_SIZE: &str = "jobs.queue.size";
    pub const JOBS_RETRY_COUNT: &str = "jobs.retry.count";
    pub const JOBS_DLQ_SIZE: &str = "jobs.dlq.size";
    pub const WORKER_ACTIVE_COUNT: &str = "worker.active.count";
    pub const WORKER_HEARTBEAT_AGE_P95: &str = "worker.heartbeat.age.p95";
    pub const CIRCUIT_STATE: &str = "circuit.state";
    pub const DEGRADATION_LEVEL: &str = "degradation.level";
    pub const ERROR_CATEGORY_COUNT: &str = "error.category.count";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_latest_roundtrip() {
        let metrics = MetricsRegistry::default();
        metrics.record("jobs.queue.size", &[("queue", "audio_processing")], 5.0);
        metrics.record("jobs.queue.size", &[("queue", "audio_processing")], 8.0);
        assert_eq!(metrics.latest("jobs.queue.size", &[("queue", "audio_processing")]), Some(8.0));
    }

    #[test]
    fn labels_partition_series_independently() {
        let metrics = MetricsRegistry::default();
        metrics.record("jobs.queue.size", &[("queue", "audio_processing")], 5.0);
        metrics.record("jobs.queue.size", &[("queue", "text_processing")], 1.0);
        assert_eq!(metrics.latest("jobs.queue.size", &[("queue", "audio_processing")]), Some(5.0));
        assert_eq!(metrics.latest("jobs.queue.size", &[("queue", "text_processing")]), Some(1.0));
    }

    #[test]
    fn increment_sums_to_count() {
        let metrics = MetricsRegistry::default();
        for _ in 0..5 {
            metrics.increment("jobs.created.total", &[]);
        }
        assert_eq!(metrics.total("jobs.created.total", &[]), 5.0);
    }

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let metrics = MetricsRegistry::new(MetricsConfig { ring_size: 3 });
        for v in 0..5 {
            metrics.record("latency", &[], v as f64);
        }
        // Only the last 3 values (2, 3, 4) should remain; sum = 9.
        assert_eq!(metrics.total("latency", &[]), 9.0);
    }

    #[test]
    fn percentile_is_order_independent_of_insertion() {
        let metrics = MetricsRegistry::default();
        for v in [30.0, 10.0, 50.0, 20.0, 40.0] {
            metrics.record("latency", &[], v);
        }
        assert_eq!(metrics.percentile("latency", &[], 0.0), Some(10.0));
        assert_eq!(metrics.percentile("latency", &[], 1.0), Some(50.0));
    }

    #[test]
    fn alert_fires_once_until_resolved() {
        let metrics = MetricsRegistry::default();
        let rule = AlertRule {
            name: "queue_backlog".into(),
            metric_name: "jobs.queue.size".into(),
            labels: vec![("queue".into(), "audio_processing".into())],
            threshold: 100.0,
            comparison: AlertComparison::GreaterThan,
            cooldown: Duration::from_secs(300),
            severity: AlertSeverity::Warning,
        };
        let evaluator = AlertEvaluator::new(vec![rule]);

        metrics.record("jobs.queue.size", &[("queue", "audio_processing")], 150.0);
        let first = evaluator.evaluate(&metrics);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].state, AlertState::Firing);

        metrics.record("jobs.queue.size", &[("queue", "audio_processing")], 160.0);
        let second = evaluator.evaluate(&metrics);
        assert!(second.is_empty(), "already firing, should not re-fire within cooldown");
    }

    #[test]
    fn alert_resolves_when_no_longer_breaching() {
        let metrics = MetricsRegistry::default();
        let rule = AlertRule {
            name: "queue_backlog".into(),
            metric_name: "jobs.queue.size".into(),
            labels: vec![],
            threshold: 100.0,
            comparison: AlertComparison::GreaterThan,
            cooldown: Duration::from_secs(300),
            severity: AlertSeverity::Warning,
        };
        let evaluator = AlertEvaluator::new(vec![rule]);

        metrics.record("jobs.queue.size", &[], 150.0);
        evaluator.evaluate(&metrics);

        metrics.record("jobs.queue.size", &[], 10.0);
        let resolved = evaluator.evaluate(&metrics);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].state, AlertState::Ok);
    }

    #[test]
    fn repeated_breach_past_cooldown_increments_trigger_count() {
        let metrics = MetricsRegistry::default();
        let rule = AlertRule {
            name: "queue_backlog".into(),
            metric_name: "jobs.queue.size".into(),
            labels: vec![],
            threshold: 100.0,
            comparison: AlertComparison::GreaterThan,
            cooldown: Duration::from_secs(0),
            severity: AlertSeverity::Critical,
        };
        let evaluator = AlertEvaluator::new(vec![rule]);

        metrics.record("jobs.queue.size", &[], 150.0);
        evaluator.evaluate(&metrics);
        assert_eq!(evaluator.alerts()[0].trigger_count, 1);

        metrics.record("jobs.queue.size", &[], 10.0);
        evaluator.evaluate(&metrics);

        metrics.record("jobs.queue.size", &[], 200.0);
        evaluator.evaluate(&metrics);
        assert_eq!(evaluator.alerts()[0].trigger_count, 2);
    }

    #[test]
    fn acknowledge_records_actor_and_timestamp() {
        let metrics = MetricsRegistry::default();
        let rule = AlertRule {
            name: "queue_backlog".into(),
            metric_name: "jobs.queue.size".into(),
            labels: vec![],
            threshold: 100.0,
            comparison: AlertComparison::GreaterThan,
            cooldown: Duration::from_secs(300),
            severity: AlertSeverity::Warning,
        };
        let evaluator = AlertEvaluator::new(vec![rule]);
        metrics.record("jobs.queue.size", &[], 150.0);
        evaluator.evaluate(&metrics);

        evaluator.acknowledge("queue_backlog", "ops-oncall").unwrap();

        let alert = evaluator.alerts().into_iter().find(|a| a.rule_name == "queue_backlog").unwrap();
        assert!(alert.acknowledged);
        assert_eq!(alert.acknowledged_by.as_deref(), Some("ops-oncall"));
        assert!(alert.acknowledged_at.is_some());
    }

    #[test]
    fn acknowledge_unknown_rule_errors() {
        let evaluator = AlertEvaluator::new(vec![]);
        assert!(evaluator.acknowledge("nonexistent", "ops-oncall").is_err());
    }
}
