//! Cross-module scenario tests exercising the Job Store, Worker Pool, Dead-Letter Store, and
//! Circuit Breaker Registry together, driven through the same public APIs a real process would
//! use. Pure-logic properties (classifier determinism, backoff monotonicity, jitter bounds,
//! transition legality) live as inline `#[cfg(test)]` modules next to the code they test; this
//! file is for scenarios that only show up when several components run together.

use async_trait::async_trait;
use scribeq_core::{
    AgentClient, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, DeadLetterConfig,
    DeadLetterStore, DegradationConfig, DegradationController, DownstreamError, ErrorClassifier,
    EventBus, InstantSleeper, Job, JobRequest, JobStatus, JobStore, JobStoreConfig, JobType,
    KvStore, MemoryStore, MetricsConfig, MetricsRegistry, ServiceKind, TranscriptionClient,
    WorkerHealthConfig, WorkerHealthRegistry, WorkerPool, WorkerPoolConfig,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Default)]
struct OkTranscription;

#[async_trait]
impl TranscriptionClient for OkTranscription {
    async fn transcribe(&self, _audio_base64: &str) -> Result<String, DownstreamError> {
        Ok("patient reports mild cough".into())
    }
    async fn health_check(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
struct OkAgent;

#[async_trait]
impl AgentClient for OkAgent {
    async fn generate_note(&self, _transcript: &str) -> Result<String, DownstreamError> {
        Ok("SOAP note: patient stable".into())
    }
    async fn health_check(&self) -> bool {
        true
    }
}

/// Fails connection `fail_times` times, then succeeds.
#[derive(Debug)]
struct FlakyTranscription {
    remaining_failures: AtomicUsize,
}

impl FlakyTranscription {
    fn new(fail_times: usize) -> Self {
        Self { remaining_failures: AtomicUsize::new(fail_times) }
    }
}

#[async_trait]
impl TranscriptionClient for FlakyTranscription {
    async fn transcribe(&self, _audio_base64: &str) -> Result<String, DownstreamError> {
        if self.remaining_failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            if n > 0 { Some(n - 1) } else { None }
        }).is_ok() {
            return Err(DownstreamError::Connection("connection reset".into()));
        }
        Ok("patient reports mild cough".into())
    }
    async fn health_check(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
struct AlwaysUnavailableAgent;

#[async_trait]
impl AgentClient for AlwaysUnavailableAgent {
    async fn generate_note(&self, _transcript: &str) -> Result<String, DownstreamError> {
        Err(DownstreamError::Http { status: 503, body: "service unavailable".into() })
    }
    async fn health_check(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct UnauthorizedAgent;

#[async_trait]
impl AgentClient for UnauthorizedAgent {
    async fn generate_note(&self, _transcript: &str) -> Result<String, DownstreamError> {
        Err(DownstreamError::Http { status: 401, body: "invalid api key".into() })
    }
    async fn health_check(&self) -> bool {
        true
    }
}

/// One slow-but-eventually-successful in-flight job per worker, used by the shutdown test.
#[derive(Debug)]
struct SlowThenOkAgent {
    delay: Duration,
}

#[async_trait]
impl AgentClient for SlowThenOkAgent {
    async fn generate_note(&self, _transcript: &str) -> Result<String, DownstreamError> {
        tokio::time::sleep(self.delay).await;
        Ok("SOAP note: patient stable".into())
    }
    async fn health_check(&self) -> bool {
        true
    }
}

struct Harness {
    job_store: Arc<JobStore>,
    dead_letter: Arc<DeadLetterStore>,
    worker_health: Arc<WorkerHealthRegistry>,
    metrics: Arc<MetricsRegistry>,
}

fn build_harness(breaker_failure_threshold: usize) -> Harness {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let classifier = Arc::new(ErrorClassifier::new());
    let circuits = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: breaker_failure_threshold,
        recovery_timeout: Duration::from_secs(30),
        half_open_max_calls: 1,
        success_threshold: 1,
    }));
    let events = Arc::new(EventBus::new(32));
    let worker_health = Arc::new(WorkerHealthRegistry::new(
        WorkerHealthConfig::default(),
        Arc::new(scribeq_core::eventbus::StaticQueueStats::new()),
    ));
    let degradation = Arc::new(DegradationController::new(
        circuits.clone(),
        worker_health.clone(),
        DegradationConfig::default(),
    ));
    let job_store = Arc::new(JobStore::new(
        kv.clone(),
        classifier,
        circuits,
        events,
        degradation,
        JobStoreConfig::default(),
    ));
    let dead_letter =
        Arc::new(DeadLetterStore::new(kv, job_store.clone(), DeadLetterConfig::default()));
    let metrics = Arc::new(MetricsRegistry::new(MetricsConfig::default()));
    Harness { job_store, dead_letter, worker_health, metrics }
}

fn audio_request() -> JobRequest {
    JobRequest {
        job_type: JobType::AudioProcessing,
        input_data: HashMap::from([(
            "audio_base64".to_string(),
            serde_json::Value::String("abc".into()),
        )]),
        session_id: None,
    }
}

async fn wait_for_status(job_store: &JobStore, job: &Job, target: JobStatus, attempts: usize) -> Job {
    for _ in 0..attempts {
        if let Some(reloaded) = job_store.get(&job.job_id, &job.user_id).await.unwrap() {
            if reloaded.status == target {
                return reloaded;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} did not reach {:?} in time", job.job_id, target);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_audio_processing_job_completes() {
    let harness = build_harness(5);
    let pool = WorkerPool::new(
        harness.job_store.clone(),
        harness.dead_letter.clone(),
        harness.worker_health.clone(),
        Arc::new(OkTranscription),
        Arc::new(OkAgent),
        Arc::new(InstantSleeper),
        harness.metrics.clone(),
        WorkerPoolConfig::default(),
    );

    let response = harness.job_store.create("user-1", audio_request()).await.unwrap();
    let (_tx, rx) = watch::channel(false);
    let handles = pool.spawn("audio_processing", rx);

    let job = Job::new(response.job_id.clone(), "user-1".into(), JobType::AudioProcessing, HashMap::new(), 3, None);
    let completed = wait_for_status(&harness.job_store, &job, JobStatus::Completed, 100).await;
    assert_eq!(completed.result.unwrap().get("note").and_then(|v| v.as_str()), Some("SOAP note: patient stable"));

    for handle in handles {
        handle.abort();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_network_failure_retries_then_completes() {
    let harness = build_harness(5);
    let pool = WorkerPool::new(
        harness.job_store.clone(),
        harness.dead_letter.clone(),
        harness.worker_health.clone(),
        Arc::new(FlakyTranscription::new(1)),
        Arc::new(OkAgent),
        Arc::new(InstantSleeper),
        harness.metrics.clone(),
        WorkerPoolConfig { poll_interval: Duration::from_millis(5), ..WorkerPoolConfig::default() },
    );

    let response = harness.job_store.create("user-1", audio_request()).await.unwrap();
    let (_tx, rx) = watch::channel(false);
    let handles = pool.spawn("audio_processing", rx);

    // The retry is scheduled one to a few seconds out (exponential backoff off a 1s base); poll
    // promote_ready_delayed_retries until it clears the delay queue rather than waiting it out
    // blindly.
    for _ in 0..300 {
        harness.job_store.promote_ready_delayed_retries("audio_processing").await.ok();
        if let Some(reloaded) = harness.job_store.get(&response.job_id, "user-1").await.unwrap() {
            if reloaded.status == JobStatus::Completed {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let completed = harness.job_store.get(&response.job_id, "user-1").await.unwrap().unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.retry_count, 1);

    for handle in handles {
        handle.abort();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_service_unavailable_opens_the_circuit() {
    let harness = build_harness(3);
    // One worker so the three submitted jobs are attempted strictly in sequence against the
    // agent service, tripping its breaker (call_agent is keyed on "agent") after 3 failures.
    let pool = WorkerPool::new(
        harness.job_store.clone(),
        harness.dead_letter.clone(),
        harness.worker_health.clone(),
        Arc::new(OkTranscription),
        Arc::new(AlwaysUnavailableAgent),
        Arc::new(InstantSleeper),
        harness.metrics.clone(),
        WorkerPoolConfig { workers_per_queue: 1, ..WorkerPoolConfig::default() },
    );

    let mut submitted = Vec::new();
    for _ in 0..3 {
        submitted.push(harness.job_store.create("user-1", audio_request()).await.unwrap());
    }

    let (_tx, rx) = watch::channel(false);
    let handles = pool.spawn("audio_processing", rx);

    let breaker = harness.job_store.circuits().get_or_create("agent");
    let mut opened = false;
    for _ in 0..200 {
        if breaker.state() == CircuitState::Open {
            opened = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(opened, "breaker did not open after repeated agent failures");

    for handle in handles {
        handle.abort();
    }
    let _ = submitted;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthorized_downstream_error_is_not_retried_and_reaches_dlq() {
    let harness = build_harness(5);
    let pool = WorkerPool::new(
        harness.job_store.clone(),
        harness.dead_letter.clone(),
        harness.worker_health.clone(),
        Arc::new(OkTranscription),
        Arc::new(UnauthorizedAgent),
        Arc::new(InstantSleeper),
        harness.metrics.clone(),
        WorkerPoolConfig::default(),
    );

    let response = harness.job_store.create("user-1", audio_request()).await.unwrap();
    let (_tx, rx) = watch::channel(false);
    let handles = pool.spawn("audio_processing", rx);

    let job = Job::new(response.job_id.clone(), "user-1".into(), JobType::AudioProcessing, HashMap::new(), 3, None);
    let dead_lettered = wait_for_status(&harness.job_store, &job, JobStatus::DeadLetter, 100).await;
    assert_eq!(dead_lettered.retry_count, 1, "authentication errors fail on the first attempt");

    let entries = harness.dead_letter.list_dlq("audio_processing", 10, 0).await.unwrap();
    assert_eq!(entries.len(), 1);

    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn rate_limited_error_schedules_a_delay_of_at_least_sixty_seconds() {
    let harness = build_harness(5);
    let response = harness.job_store.create("user-1", audio_request()).await.unwrap();
    let job = harness.job_store.dequeue("audio_processing").await.unwrap().unwrap();
    harness.job_store.mark_started(&job.job_id).await.unwrap();

    let error = scribeq_core::ClassifiableError::new(
        scribeq_core::ExceptionKind::Http { status: 429 },
        "rate limited",
    );
    let outcome = harness
        .job_store
        .increment_retry(&job.job_id, "agent", ServiceKind::Agent, Some(&error))
        .await
        .unwrap();

    assert!(!outcome.terminal);
    assert!(outcome.decision.delay >= Duration::from_secs(60));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_signal_lets_in_flight_jobs_drain_before_stopping() {
    let harness = build_harness(5);
    let pool = WorkerPool::new(
        harness.job_store.clone(),
        harness.dead_letter.clone(),
        harness.worker_health.clone(),
        Arc::new(OkTranscription),
        Arc::new(SlowThenOkAgent { delay: Duration::from_millis(100) }),
        Arc::new(InstantSleeper),
        harness.metrics.clone(),
        WorkerPoolConfig {
            workers_per_queue: 2,
            shutdown_grace: Duration::from_secs(5),
            ..WorkerPoolConfig::default()
        },
    );

    let first = harness.job_store.create("user-1", audio_request()).await.unwrap();
    let second = harness.job_store.create("user-1", audio_request()).await.unwrap();

    let (tx, rx) = watch::channel(false);
    let handles = pool.spawn("audio_processing", rx);

    // Give both workers a moment to claim their jobs, then signal shutdown while they're
    // mid-flight inside the 100ms downstream call.
    tokio::time::sleep(Duration::from_millis(20)).await;
    tx.send(true).unwrap();

    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    let first_job = harness.job_store.get(&first.job_id, "user-1").await.unwrap().unwrap();
    let second_job = harness.job_store.get(&second.job_id, "user-1").await.unwrap().unwrap();
    assert_eq!(first_job.status, JobStatus::Completed);
    assert_eq!(second_job.status, JobStatus::Completed);

    let stats = harness.job_store.queue_stats("audio_processing").await.unwrap();
    assert_eq!(stats.processing, 0, "no jobs should be left marked processing after a graceful shutdown");
}
