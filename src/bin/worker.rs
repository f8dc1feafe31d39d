//! Boots the full pipeline against either Redis (if `redis_url` is configured) or an in-process
//! `MemoryStore`, wires the worker pool and maintenance sweeps, and runs until Ctrl-C.

use std::sync::Arc;

use scribeq_core::{
    AgentClient, CircuitBreakerConfig, CircuitBreakerRegistry, Config, DeadLetterConfig,
    DeadLetterStore, DegradationConfig, DegradationController, ErrorClassifier, EventBus,
    HttpDownstreamClient, JobStore, JobStoreConfig, KvStore, MaintenanceConfig,
    MaintenanceScheduler, MemoryStore, MetricsConfig, MetricsRegistry, RedisStore,
    TranscriptionClient, WorkerHealthConfig, WorkerHealthRegistry, WorkerPool, WorkerPoolConfig,
};
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = Config::load().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "falling back to built-in defaults");
        Config::default()
    });

    let store: Arc<dyn KvStore> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisStore::connect(url)
                .await
                .expect("redis_url configured but connection failed"),
        ),
        None => {
            tracing::warn!("no redis_url configured, running against an in-process store");
            Arc::new(MemoryStore::default())
        }
    };

    let events = Arc::new(EventBus::new(256));
    let classifier = Arc::new(ErrorClassifier::default());
    let circuits = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: config.breaker_failure_threshold,
        recovery_timeout: config.breaker_open_timeout,
        half_open_max_calls: 1,
        success_threshold: config.breaker_success_threshold,
    }));

    let queue_stats_cache = Arc::new(scribeq_core::eventbus::StaticQueueStats::new());

    let worker_health = Arc::new(WorkerHealthRegistry::new(
        WorkerHealthConfig {
            stale_after: config.worker_stale_after,
            consecutive_failure_kill: config.consecutive_failure_kill,
        },
        queue_stats_cache.clone(),
    ));

    let degradation = Arc::new(DegradationController::new(
        circuits.clone(),
        worker_health.clone(),
        DegradationConfig::default(),
    ));

    let job_store = Arc::new(JobStore::new(
        store.clone(),
        classifier.clone(),
        circuits,
        events.clone(),
        degradation.clone(),
        JobStoreConfig {
            job_retention: config.job_retention,
            max_retries_default: config.max_retries_default,
            queue_names: config.queue_names.clone(),
        },
    ));

    let dead_letter = Arc::new(DeadLetterStore::new(
        store,
        job_store.clone(),
        DeadLetterConfig { retention: config.dlq_retention },
    ));

    let metrics = Arc::new(MetricsRegistry::new(MetricsConfig { ring_size: config.metric_ring_size }));
    let alerts = Arc::new(scribeq_core::AlertEvaluator::new(Vec::new()));

    let transcription: Arc<dyn TranscriptionClient> =
        Arc::new(HttpDownstreamClient::new(config.transcription_service_url.clone(), config.downstream_timeout));
    let agent: Arc<dyn AgentClient> =
        Arc::new(HttpDownstreamClient::new(config.agent_service_url.clone(), config.downstream_timeout));

    let pool = WorkerPool::new(
        job_store.clone(),
        dead_letter.clone(),
        worker_health.clone(),
        transcription,
        agent,
        Arc::new(scribeq_core::TokioSleeper),
        metrics.clone(),
        WorkerPoolConfig {
            workers_per_queue: config.workers_per_queue,
            poll_interval: config.poll_interval,
            shutdown_grace: config.worker_stale_after,
            downstream_timeout: config.downstream_timeout,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    for queue in &config.queue_names {
        handles.extend(pool.spawn(queue, shutdown_rx.clone()));
    }

    let scheduler = Arc::new(MaintenanceScheduler::new(
        job_store,
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
    handles.extend(scheduler.spawn_all());

    tracing::info!(queues = ?config.queue_names, "worker pool running, press ctrl-c to stop");
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
}
