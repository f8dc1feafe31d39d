//! Worker Pool (§4.7): cooperative per-worker poll loops that dequeue jobs, execute them behind
//! a circuit breaker, and route outcomes to the Job Store / Dead-Letter Store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::classifier::{ClassifiableError, ExceptionKind, ServiceKind};
use crate::dead_letter::DeadLetterStore;
use crate::downstream::{AgentClient, DownstreamError, TranscriptionClient};
use crate::error::ResilienceError;
use crate::job::{Job, JobType, PayloadMap};
use crate::job_store::JobStore;
use crate::monitoring::MetricsRegistry;
use crate::sleeper::Sleeper;
use crate::timeout::TimeoutPolicy;
use crate::worker_health::WorkerHealthRegistry;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers_per_queue: usize,
    pub poll_interval: Duration,
    /// Grace window given to an in-flight job after shutdown is signaled (§4.7).
    pub shutdown_grace: Duration,
    /// Per-call deadline enforced around every downstream call, independent of the circuit
    /// breaker's own open/half-open timing (§6 `downstreamTimeout`).
    pub downstream_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers_per_queue: 4,
            poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(30),
            downstream_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of a single job execution, prior to being routed to the Job Store.
struct ProcessOutcome {
    service_name: &'static str,
    service_kind: ServiceKind,
    failure_reason: String,
    classifiable: ClassifiableError,
}

/// Shared handles every worker task needs; cheap to clone since every field is an `Arc`.
#[derive(Clone)]
pub struct WorkerPool {
    job_store: Arc<JobStore>,
    dead_letter: Arc<DeadLetterStore>,
    health: Arc<WorkerHealthRegistry>,
    transcription: Arc<dyn TranscriptionClient>,
    agent: Arc<dyn AgentClient>,
    sleeper: Arc<dyn Sleeper>,
    metrics: Arc<MetricsRegistry>,
    timeout: TimeoutPolicy,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        job_store: Arc<JobStore>,
        dead_letter: Arc<DeadLetterStore>,
        health: Arc<WorkerHealthRegistry>,
        transcription: Arc<dyn TranscriptionClient>,
        agent: Arc<dyn AgentClient>,
        sleeper: Arc<dyn Sleeper>,
        metrics: Arc<MetricsRegistry>,
        config: WorkerPoolConfig,
    ) -> Self {
        let timeout = TimeoutPolicy::new(config.downstream_timeout)
            .unwrap_or_else(|_| TimeoutPolicy::new(Duration::from_secs(30)).expect("30s is a valid timeout"));
        Self { job_store, dead_letter, health, transcription, agent, sleeper, metrics, timeout, config }
    }

    /// Spawn `workers_per_queue` tasks for `queue_name`, returning their join handles. Each task
    /// runs until `shutdown` is set to `true`.
    pub fn spawn(&self, queue_name: &str, shutdown: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.workers_per_queue)
            .map(|i| {
                let worker_id = format!("{queue_name}-{i}");
                let pool = self.clone();
                let queue_name = queue_name.to_string();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run(worker_id, queue_name, shutdown).await })
            })
            .collect()
    }

    async fn run(&self, worker_id: String, queue_name: String, mut shutdown: watch::Receiver<bool>) {
        self.health.register(worker_id.as_str(), queue_name.as_str());
        tracing::info!(worker_id, queue_name, "worker started");

        loop {
            self.health.heartbeat(&worker_id);

            if *shutdown.borrow() {
                break;
            }

            if let Some(worker) = self.health.get_worker(&worker_id) {
                if worker.consecutive_failures >= 5 {
                    tracing::warn!(worker_id, "worker exceeded consecutive failure threshold, stopping");
                    break;
                }
            }

            let job = match self.job_store.dequeue(&queue_name).await {
                Ok(job) => job,
                Err(err) => {
                    tracing::error!(worker_id, error = %err, "dequeue failed");
                    None
                }
            };

            let Some(job) = job else {
                tokio::select! {
                    _ = self.sleeper.sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            match self.job_store.mark_started(&job.job_id).await {
                Ok(true) => {}
                Ok(false) => continue, // lost the race to another worker
                Err(err) => {
                    tracing::error!(worker_id, job_id = %job.job_id, error = %err, "mark_started failed");
                    continue;
                }
            }

            self.health.set_current_job(&worker_id, Some(job.job_id.clone()));
            let start = Instant::now();
            let outcome = self.process(&job).await;
            let duration_ms = start.elapsed().as_millis() as u64;
            self.health.set_current_job(&worker_id, None);
            self.metrics.record_latency(&queue_name, Duration::from_millis(duration_ms));

            match outcome {
                Ok(result) => {
                    self.health.record_outcome(&worker_id, true, duration_ms);
                    if let Err(err) =
                        self.job_store.update_status(&job.job_id, crate::job::JobStatus::Completed, Some(result), None).await
                    {
                        tracing::error!(worker_id, job_id = %job.job_id, error = %err, "failed to mark job completed");
                    }
                }
                Err(failure) => {
                    self.health.record_outcome(&worker_id, false, duration_ms);
                    self.handle_failure(&worker_id, job, failure).await;
                }
            }
        }

        self.health.deactivate(&worker_id);
        tracing::info!(worker_id, "worker stopped");
    }

    async fn handle_failure(&self, worker_id: &str, job: Job, failure: ProcessOutcome) {
        let retry = self
            .job_store
            .increment_retry(&job.job_id, failure.service_name, failure.service_kind, Some(&failure.classifiable))
            .await;

        let retry = match retry {
            Ok(retry) => retry,
            Err(err) => {
                tracing::error!(worker_id, job_id = %job.job_id, error = %err, "increment_retry failed");
                return;
            }
        };

        if retry.terminal {
            if let Err(err) = self.dead_letter.move_to_dlq(job.clone(), failure.failure_reason.clone()).await {
                tracing::error!(worker_id, job_id = %job.job_id, error = %err, "failed to move job to dead-letter store");
            }
        }
    }

    /// Dispatch `job` to the downstream service(s) its `job_type` requires, behind a circuit
    /// breaker keyed by service name.
    async fn process(&self, job: &Job) -> Result<PayloadMap, ProcessOutcome> {
        match job.job_type {
            JobType::TranscriptionOnly => {
                let audio = read_str_field(&job.input_data, "audio_base64")?;
                let transcript = self.call_transcription(&audio).await?;
                Ok(result_map("transcript", transcript))
            }
            JobType::AudioProcessing => {
                let audio = read_str_field(&job.input_data, "audio_base64")?;
                let transcript = self.call_transcription(&audio).await?;
                let note = self.call_agent(&transcript).await?;
                Ok(result_map("note", note))
            }
            JobType::TextProcessing => {
                let transcript = read_str_field(&job.input_data, "transcript")?;
                let note = self.call_agent(&transcript).await?;
                Ok(result_map("note", note))
            }
        }
    }

    async fn call_transcription(&self, audio_base64: &str) -> Result<String, ProcessOutcome> {
        let circuit = self.job_store_circuit("transcription");
        circuit
            .execute(|| async {
                self.timeout
                    .execute(|| async { self.transcription.transcribe(audio_base64).await.map_err(ResilienceError::Inner) })
                    .await
            })
            .await
            .map_err(|err| to_outcome("transcription", ServiceKind::Transcription, err))
    }

    async fn call_agent(&self, transcript: &str) -> Result<String, ProcessOutcome> {
        let circuit = self.job_store_circuit("agent");
        circuit
            .execute(|| async {
                self.timeout
                    .execute(|| async { self.agent.generate_note(transcript).await.map_err(ResilienceError::Inner) })
                    .await
            })
            .await
            .map_err(|err| to_outcome("agent", ServiceKind::Agent, err))
    }

    fn job_store_circuit(&self, service_name: &str) -> crate::circuit_breaker::CircuitBreakerPolicy {
        self.job_store.circuits().get_or_create(service_name)
    }
}

fn to_outcome(
    service_name: &'static str,
    service_kind: ServiceKind,
    err: ResilienceError<DownstreamError>,
) -> ProcessOutcome {
    let (failure_reason, classifiable) = match &err {
        ResilienceError::Inner(inner) => (inner.to_string(), inner.as_classifiable()),
        ResilienceError::CircuitOpen { .. } => {
            (err.to_string(), ClassifiableError::new(ExceptionKind::Connection, err.to_string()))
        }
        ResilienceError::Timeout { .. } => {
            (err.to_string(), ClassifiableError::new(ExceptionKind::Timeout, err.to_string()))
        }
        ResilienceError::RetryExhausted { .. } => {
            (err.to_string(), ClassifiableError::new(ExceptionKind::Other, err.to_string()))
        }
    };
    ProcessOutcome { service_name, service_kind, failure_reason, classifiable }
}

fn read_str_field(input: &PayloadMap, field: &str) -> Result<String, ProcessOutcome> {
    input
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ProcessOutcome {
            service_name: "validation",
            service_kind: ServiceKind::Other,
            failure_reason: format!("missing or non-string input field: {field}"),
            classifiable: ClassifiableError::new(ExceptionKind::Other, format!("invalid input format: missing {field}")),
        })
}

fn result_map(key: &str, value: String) -> PayloadMap {
    let mut map = PayloadMap::new();
    map.insert(key.to_string(), serde_json::Value::String(value));
    map
}
