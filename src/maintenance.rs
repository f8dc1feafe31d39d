//! Scheduled Maintenance (§4.10): the periodic background tasks that keep queues, worker
//! bookkeeping, and the DLQ from silently drifting — staleness sweeps, delayed-retry promotion,
//! metric/alert evaluation, and retention pruning.

use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::CircuitState;
use crate::classifier::ErrorClassifier;
use crate::dead_letter::DeadLetterStore;
use crate::degradation::DegradationController;
use crate::eventbus::{EventBus, JobStatusChanged, QueueStats, StaticQueueStats};
use crate::job::JobStatus;
use crate::job_store::JobStore;
use crate::monitoring::{metric_names, AlertEvaluator, MetricsRegistry};
use crate::worker_health::WorkerHealthRegistry;

/// Maps circuit breaker state to the §4.9 `circuit.state` encoding (0=closed, 1=half-open,
/// 2=open), which does not match the type's own discriminant order.
fn circuit_state_value(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub worker_staleness_interval: Duration,
    pub health_metrics_interval: Duration,
    pub delayed_retry_interval: Duration,
    pub job_retention_purge_interval: Duration,
    pub dlq_prune_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            worker_staleness_interval: Duration::from_secs(15),
            health_metrics_interval: Duration::from_secs(60),
            delayed_retry_interval: Duration::from_secs(5 * 60),
            job_retention_purge_interval: Duration::from_secs(3600),
            dlq_prune_interval: Duration::from_secs(24 * 3600),
        }
    }
}

/// Bundles every component the maintenance tasks touch. Held behind `Arc`s so the scheduler can
/// be cloned into each `tokio::spawn`'d task independently.
pub struct MaintenanceScheduler {
    job_store: Arc<JobStore>,
    dead_letter: Arc<DeadLetterStore>,
    worker_health: Arc<WorkerHealthRegistry>,
    queue_stats_cache: Arc<StaticQueueStats>,
    degradation: Arc<DegradationController>,
    metrics: Arc<MetricsRegistry>,
    alerts: Arc<AlertEvaluator>,
    classifier: Arc<ErrorClassifier>,
    events: Arc<EventBus>,
    config: MaintenanceConfig,
}

impl MaintenanceScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_store: Arc<JobStore>,
        dead_letter: Arc<DeadLetterStore>,
        worker_health: Arc<WorkerHealthRegistry>,
        queue_stats_cache: Arc<StaticQueueStats>,
        degradation: Arc<DegradationController>,
        metrics: Arc<MetricsRegistry>,
        alerts: Arc<AlertEvaluator>,
        classifier: Arc<ErrorClassifier>,
        events: Arc<EventBus>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            job_store,
            dead_letter,
            worker_health,
            queue_stats_cache,
            degradation,
            metrics,
            alerts,
            classifier,
            events,
            config,
        }
    }

    /// Spawn all six periodic/event-driven tasks, returning their join handles so the caller can
    /// await or abort them (e.g. on shutdown).
    pub fn spawn_all(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.spawn_worker_staleness_task(),
            self.spawn_health_metrics_task(),
            self.spawn_delayed_retry_task(),
            self.spawn_job_retention_task(),
            self.spawn_dlq_prune_task(),
            self.spawn_event_metrics_task(),
        ]
    }

    /// Consumes `JobStatusChanged` events as they're published and folds them into the §4.9
    /// creation/processed/failed/retry counters. A lagged receiver just drops the skipped
    /// events — the counters are best-effort, not an audit log.
    fn spawn_event_metrics_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let mut rx = this.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => this.record_job_event(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event metrics consumer lagged, dropped events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn record_job_event(&self, event: &JobStatusChanged) {
        match (event.from, event.to) {
            (JobStatus::Queued, JobStatus::Queued) => {
                self.metrics.increment(metric_names::JOBS_CREATED_TOTAL, &[])
            }
            (JobStatus::Failed, JobStatus::Queued) => {
                self.metrics.increment(metric_names::JOBS_RETRY_COUNT, &[])
            }
            (_, JobStatus::Completed) => self.metrics.increment(metric_names::JOBS_PROCESSED_TOTAL, &[]),
            (_, JobStatus::Failed) => self.metrics.increment(metric_names::JOBS_FAILED_TOTAL, &[]),
            _ => {}
        }
    }

    fn spawn_worker_staleness_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.worker_staleness_interval);
            loop {
                ticker.tick().await;
                this.run_worker_staleness_sweep().await;
            }
        })
    }

    fn spawn_health_metrics_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.health_metrics_interval);
            loop {
                ticker.tick().await;
                this.run_health_metrics_and_alerts().await;
            }
        })
    }

    fn spawn_delayed_retry_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.delayed_retry_interval);
            loop {
                ticker.tick().await;
                this.run_delayed_retry_promotion().await;
            }
        })
    }

    fn spawn_job_retention_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.job_retention_purge_interval);
            loop {
                ticker.tick().await;
                this.run_job_retention_purge().await;
            }
        })
    }

    fn spawn_dlq_prune_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.dlq_prune_interval);
            loop {
                ticker.tick().await;
                this.run_dlq_prune().await;
            }
        })
    }

    /// Every 15s: demote stale workers, and requeue any job a now-unhealthy worker was holding
    /// past its processing lease.
    async fn run_worker_staleness_sweep(&self) {
        let newly_unhealthy = self.worker_health.refresh_staleness();
        for worker in newly_unhealthy {
            tracing::warn!(worker_id = %worker.worker_id, "worker went stale");
            if let Some(job_id) = worker.current_job_id {
                if let Err(err) = self.job_store.requeue_orphaned(&job_id).await {
                    tracing::error!(job_id, error = %err, "failed to requeue job held by stale worker");
                }
            }
        }
    }

    /// Every 60s: push queue stats into the shared cache, record worker/circuit/degradation
    /// metrics, and evaluate alert rules.
    async fn run_health_metrics_and_alerts(&self) {
        for queue_name in &self.job_store.config().queue_names.clone() {
            match self.job_store.queue_stats(queue_name).await {
                Ok(stats) => {
                    self.queue_stats_cache.set(queue_name.clone(), stats);
                    self.metrics.record(metric_names::JOBS_QUEUE_SIZE, &[("queue", queue_name)], stats.size as f64);
                    record_processing(&self.metrics, queue_name, &stats);
                }
                Err(err) => tracing::error!(queue_name, error = %err, "failed to compute queue stats"),
            }

            match self.dead_letter.dlq_size(queue_name).await {
                Ok(size) => self.metrics.record(metric_names::JOBS_DLQ_SIZE, &[("queue", queue_name)], size as f64),
                Err(err) => tracing::error!(queue_name, error = %err, "failed to compute dlq size"),
            }
        }

        self.degradation.refresh_from_circuits();
        let report = self.worker_health.system_health_report();
        self.metrics.record(metric_names::WORKER_ACTIVE_COUNT, &[], report.active_workers as f64);

        let level = self.degradation.overall_level();
        self.metrics.record(metric_names::DEGRADATION_LEVEL, &[], level as u8 as f64);

        for (service, state) in self.job_store.circuits().snapshot() {
            self.metrics.record(metric_names::CIRCUIT_STATE, &[("service", &service)], circuit_state_value(state) as f64);
        }

        record_heartbeat_age_p95(&self.metrics, &self.worker_health.all_workers());

        for ((service, category), count) in self.classifier.counters() {
            self.metrics.record(
                metric_names::ERROR_CATEGORY_COUNT,
                &[("service", &service), ("category", &format!("{category:?}"))],
                count as f64,
            );
        }

        for event in self.alerts.evaluate(&self.metrics) {
            tracing::warn!(rule = %event.rule_name, state = ?event.state, value = event.value, "alert state change");
        }
    }

    /// Every 5m: move ready delayed retries back onto their active queues.
    async fn run_delayed_retry_promotion(&self) {
        for queue_name in &self.job_store.config().queue_names.clone() {
            match self.job_store.promote_ready_delayed_retries(queue_name).await {
                Ok(count) if count > 0 => tracing::info!(queue_name, count, "promoted delayed retries"),
                Ok(_) => {}
                Err(err) => tracing::error!(queue_name, error = %err, "failed to promote delayed retries"),
            }
        }
    }

    /// Hourly: purge terminal jobs past their retention window. The Job Store already sets a KV
    /// TTL on creation (§6), so this is a best-effort sweep for entries whose TTL hasn't expired
    /// yet but are already terminal and past retention by status timestamp.
    async fn run_job_retention_purge(&self) {
        for queue_name in &self.job_store.config().queue_names.clone() {
            if let Err(err) = self.job_store.purge_expired_terminal_jobs(queue_name).await {
                tracing::error!(queue_name, error = %err, "failed to purge expired terminal jobs");
            }
        }
    }

    /// Daily: prune dead-letter entries past `dlqRetention`.
    async fn run_dlq_prune(&self) {
        for queue_name in &self.job_store.config().queue_names.clone() {
            match self.dead_letter.prune_expired(queue_name).await {
                Ok(count) if count > 0 => tracing::info!(queue_name, count, "pruned expired DLQ entries"),
                Ok(_) => {}
                Err(err) => tracing::error!(queue_name, error = %err, "failed to prune DLQ entries"),
            }
        }
    }
}

fn record_processing(metrics: &MetricsRegistry, queue_name: &str, stats: &QueueStats) {
    metrics.record("jobs.queue.processing", &[("queue", queue_name)], stats.processing as f64);
    metrics.record("jobs.queue.avg_age_ms", &[("queue", queue_name)], stats.avg_age_ms as f64);
}

/// Records the p95 of every worker's current heartbeat age as a single gauge observation.
fn record_heartbeat_age_p95(metrics: &MetricsRegistry, workers: &[crate::worker_health::WorkerHealth]) {
    if workers.is_empty() {
        return;
    }
    let now = chrono::Utc::now();
    let mut ages: Vec<f64> =
        workers.iter().map(|w| (now - w.last_heartbeat).num_milliseconds().max(0) as f64).collect();
    ages.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let index = ((ages.len() - 1) as f64 * 0.95).round() as usize;
    metrics.record(metric_names::WORKER_HEARTBEAT_AGE_P95, &[], ages[index]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::circuit_breaker_registry::CircuitBreakerRegistry;
    use crate::classifier::ErrorClassifier;
    use crate::dead_letter::DeadLetterConfig;
    use crate::degradation::DegradationConfig;
    use crate::eventbus::EventBus;
    use crate::job::{JobRequest, JobType};
    use crate::job_store::JobStoreConfig;
    use crate::store::{KvStore, MemoryStore};
    use crate::worker_health::WorkerHealthConfig;
    use std::collections::HashMap;

    fn scheduler() -> (Arc<MaintenanceScheduler>, Arc<JobStore>) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let classifier = Arc::new(ErrorClassifier::new());
        let circuits = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            success_threshold: 1,
        }));
        let events = Arc::new(EventBus::new(16));
        let queue_stats_cache = Arc::new(StaticQueueStats::new());
        let worker_health =
            Arc::new(WorkerHealthRegistry::new(WorkerHealthConfig::default(), queue_stats_cache.clone()));
        let degradation =
            Arc::new(DegradationController::new(circuits.clone(), worker_health.clone(), DegradationConfig::default()));
        let job_store = Arc::new(JobStore::new(
            kv.clone(),
            classifier.clone(),
            circuits,
            events.clone(),
            degradation.clone(),
            JobStoreConfig::default(),
        ));
        let dead_letter = Arc::new(DeadLetterStore::new(kv, job_store.clone(), DeadLetterConfig::default()));
        let metrics = Arc::new(MetricsRegistry::default());
        let alerts = Arc::new(AlertEvaluator::new(vec![]));

        let scheduler = Arc::new(MaintenanceScheduler::new(
            job_store.clone(),
            dead_letter,
            worker_health,
            queue_stats_cache,
            degradation,
            metrics,
            alerts,
            classifier,
            events,
            MaintenanceConfig::default(),
        ));
        (scheduler, job_store)
    }

    #[tokio::test]
    async fn health_metrics_sweep_populates_queue_stats_cache() {
        let (scheduler, job_store) = scheduler();
        job_store
            .create("user-1", JobRequest { job_type: JobType::AudioProcessing, input_data: HashMap::new(), session_id: None })
            .await
            .unwrap();

        scheduler.run_health_metrics_and_alerts().await;

        let size = scheduler.metrics.latest(metric_names::JOBS_QUEUE_SIZE, &[("queue", "audio_processing")]);
        assert_eq!(size, Some(1.0));
    }

    #[tokio::test]
    async fn delayed_retry_promotion_is_a_noop_when_nothing_is_delayed() {
        let (scheduler, _job_store) = scheduler();
        scheduler.run_delayed_retry_promotion().await;
    }

    #[tokio::test]
    async fn worker_staleness_sweep_handles_no_workers() {
        let (scheduler, _job_store) = scheduler();
        scheduler.run_worker_staleness_sweep().await;
    }

    #[tokio::test]
    async fn health_metrics_sweep_records_dlq_size_and_circuit_state() {
        let (scheduler, job_store) = scheduler();
        job_store.circuits().get_or_create("transcription").force_open();

        scheduler.run_health_metrics_and_alerts().await;

        assert_eq!(scheduler.metrics.latest(metric_names::JOBS_DLQ_SIZE, &[("queue", "audio_processing")]), Some(0.0));
        assert_eq!(
            scheduler.metrics.latest(metric_names::CIRCUIT_STATE, &[("service", "transcription")]),
            Some(circuit_state_value(crate::circuit_breaker::CircuitState::Open) as f64)
        );
    }

    #[test]
    fn record_job_event_counts_creation_processing_failure_and_retry() {
        let (scheduler, _job_store) = scheduler();

        let created = JobStatusChanged {
            job_id: "j1".into(),
            job_type: crate::job::JobType::AudioProcessing,
            from: JobStatus::Queued,
            to: JobStatus::Queued,
        };
        let processed = JobStatusChanged { to: JobStatus::Completed, from: JobStatus::Processing, ..created.clone() };
        let failed = JobStatusChanged { to: JobStatus::Failed, from: JobStatus::Processing, ..created.clone() };
        let retried = JobStatusChanged { to: JobStatus::Queued, from: JobStatus::Failed, ..created.clone() };

        scheduler.record_job_event(&created);
        scheduler.record_job_event(&processed);
        scheduler.record_job_event(&failed);
        scheduler.record_job_event(&retried);

        assert_eq!(scheduler.metrics.total(metric_names::JOBS_CREATED_TOTAL, &[]), 1.0);
        assert_eq!(scheduler.metrics.total(metric_names::JOBS_PROCESSED_TOTAL, &[]), 1.0);
        assert_eq!(scheduler.metrics.total(metric_names::JOBS_FAILED_TOTAL, &[]), 1.0);
        assert_eq!(scheduler.metrics.total(metric_names::JOBS_RETRY_COUNT, &[]), 1.0);
    }
}
