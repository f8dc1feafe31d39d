//! Job Store (§4.5): CRUD and lifecycle of job records, queue enqueue/dequeue, user indexing,
//! and the adaptive retry algorithm that integrates the Error Classifier and Circuit Breaker
//! Registry.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::circuit_breaker::CircuitState;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::classifier::{ClassifiableError, ErrorClassifier, ServiceKind};
use crate::degradation::{DegradationController, DegradationLevel};
use crate::error::{JobStoreError, SubmissionError};
use crate::eventbus::{EventBus, JobStatusChanged, QueueStats};
use crate::job::{ErrorCategory, Job, JobRequest, JobResponse, JobStatus, JobType, PayloadMap};
use crate::retry_engine::{self, RetryDecision};
use crate::store::{self, KvStore};

/// Renders a [`DegradationLevel`] as the uppercase label carried in `SubmissionError::Degraded`.
fn degradation_level_label(level: DegradationLevel) -> &'static str {
    match level {
        DegradationLevel::Normal => "NORMAL",
        DegradationLevel::Minor => "MINOR",
        DegradationLevel::Moderate => "MODERATE",
        DegradationLevel::Major => "MAJOR",
        DegradationLevel::Critical => "CRITICAL",
        DegradationLevel::Maintenance => "MAINTENANCE",
    }
}

fn job_key(job_id: &str) -> String {
    format!("jobs:{job_id}")
}

fn user_jobs_key(user_id: &str) -> String {
    format!("user_jobs:{user_id}")
}

fn queue_key(queue_name: &str) -> String {
    format!("queue:{queue_name}")
}

fn queue_delayed_key(queue_name: &str) -> String {
    format!("queue_delayed:{queue_name}")
}

fn processing_key(queue_name: &str) -> String {
    format!("processing:{queue_name}")
}

/// Jobs that have reached a terminal status, indexed per-queue so Scheduled Maintenance can sweep
/// `jobRetention` without a global job index (not present in the key schema otherwise).
fn terminal_key(queue_name: &str) -> String {
    format!("terminal:{queue_name}")
}

const TERMINAL_SCAN_LIMIT: usize = 100_000;

#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    pub job_retention: Duration,
    pub max_retries_default: u32,
    pub queue_names: Vec<String>,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            job_retention: Duration::from_secs(24 * 3600),
            max_retries_default: 3,
            queue_names: vec![
                "audio_processing".to_string(),
                "text_processing".to_string(),
                "transcription_only".to_string(),
            ],
        }
    }
}

/// Outcome of [`JobStore::increment_retry`], consumed by the Worker Pool to decide whether to
/// move the job into the Dead-Letter Store.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    pub terminal: bool,
    pub requeued: bool,
    pub decision: RetryDecision,
}

#[derive(Debug)]
pub struct JobStore {
    store: Arc<dyn KvStore>,
    classifier: Arc<ErrorClassifier>,
    circuits: Arc<CircuitBreakerRegistry>,
    events: Arc<EventBus>,
    degradation: Arc<DegradationController>,
    config: JobStoreConfig,
}

impl JobStore {
    pub fn new(
        store: Arc<dyn KvStore>,
        classifier: Arc<ErrorClassifier>,
        circuits: Arc<CircuitBreakerRegistry>,
        events: Arc<EventBus>,
        degradation: Arc<DegradationController>,
        config: JobStoreConfig,
    ) -> Self {
        Self { store, classifier, circuits, events, degradation, config }
    }

    pub fn config(&self) -> &JobStoreConfig {
        &self.config
    }

    pub fn circuits(&self) -> Arc<CircuitBreakerRegistry> {
        self.circuits.clone()
    }

    /// Gates admission on the current degradation level (§4.8/§7) before enqueuing a fresh job:
    /// MAINTENANCE refuses outright, MAJOR or above rejects with a retryable advisory.
    pub async fn create(&self, user_id: &str, request: JobRequest) -> Result<JobResponse, SubmissionError> {
        let level = self.degradation.overall_level();
        if level == DegradationLevel::Maintenance {
            return Err(SubmissionError::MaintenanceMode);
        }
        if level >= DegradationLevel::Major {
            return Err(SubmissionError::Degraded { level: degradation_level_label(level).to_string(), advisory: true });
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let job = Job::new(
            job_id.clone(),
            user_id.to_string(),
            request.job_type,
            request.input_data,
            self.config.max_retries_default,
            request.session_id,
        );

        let encoded = store::encode(&job).map_err(JobStoreError::from)?;
        self.store
            .set(&job_key(&job_id), &encoded, Some(self.config.job_retention))
            .await
            .map_err(JobStoreError::from)?;
        self.store.set_add(&user_jobs_key(user_id), &job_id).await.map_err(JobStoreError::from)?;
        self.store
            .list_push_right(&queue_key(&job.queue_name), &job_id)
            .await
            .map_err(JobStoreError::from)?;
        self.publish_transition(&job, JobStatus::Queued, JobStatus::Queued);

        Ok(JobResponse {
            job_id: job_id.clone(),
            status: JobStatus::Queued,
            status_url: format!("/jobs/{job_id}"),
        })
    }

    /// Returns the job only if `user_id` owns it — foreign and non-existent jobs both yield
    /// `None` so submitters can't distinguish "not found" from "not yours".
    pub async fn get(&self, job_id: &str, user_id: &str) -> Result<Option<Job>, JobStoreError> {
        match self.load_job(job_id).await? {
            Some(job) if job.user_id == user_id => Ok(Some(job)),
            _ => Ok(None),
        }
    }

    pub async fn list(&self, user_id: &str, limit: usize, offset: usize) -> Result<Vec<Job>, JobStoreError> {
        let ids = self.store.set_members(&user_jobs_key(user_id)).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load_job(&id).await? {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn cancel(&self, job_id: &str, user_id: &str) -> Result<bool, JobStoreError> {
        let Some(mut job) = self.load_job(job_id).await? else { return Ok(false) };
        if job.user_id != user_id || job.status != JobStatus::Queued {
            return Ok(false);
        }

        let before = store::encode(&job)?;
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(chrono::Utc::now());
        let after = store::encode(&job)?;

        if !self.store.compare_and_set(&job_key(job_id), Some(&before), &after).await? {
            return Ok(false);
        }
        self.store.list_remove(&queue_key(&job.queue_name), job_id).await?;
        self.store.list_push_right(&terminal_key(&job.queue_name), job_id).await?;
        self.publish_transition(&job, JobStatus::Queued, JobStatus::Cancelled);
        Ok(true)
    }

    pub async fn update_status(
        &self,
        job_id: &str,
        new_status: JobStatus,
        result: Option<PayloadMap>,
        error_message: Option<String>,
    ) -> Result<bool, JobStoreError> {
        const MAX_ATTEMPTS: u32 = 3;
        for attempt in 0..MAX_ATTEMPTS {
            let Some(mut job) = self.load_job(job_id).await? else { return Ok(false) };
            if !job.status.can_transition_to(new_status) {
                return Err(JobStoreError::IllegalTransition {
                    job_id: job_id.to_string(),
                    from: format!("{:?}", job.status),
                    to: format!("{:?}", new_status),
                });
            }

            let before = store::encode(&job)?;
            let from = job.status;
            job.status = new_status;
            if let Some(result) = result.clone() {
                job.result = Some(result);
            }
            if let Some(ref msg) = error_message {
                job.error_message = Some(msg.clone());
            }
            if new_status.is_terminal() {
                job.completed_at = Some(chrono::Utc::now());
            }
            let after = store::encode(&job)?;

            if self.store.compare_and_set(&job_key(job_id), Some(&before), &after).await? {
                if new_status.is_terminal() {
                    self.store.list_remove(&queue_key(&job.queue_name), job_id).await?;
                    self.store.set_remove(&processing_key(&job.queue_name), job_id).await?;
                    self.store.list_push_right(&terminal_key(&job.queue_name), job_id).await?;
                }
                self.publish_transition(&job, from, new_status);
                return Ok(true);
            }
            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(10 * (attempt as u64 + 1))).await;
            }
        }
        Ok(false)
    }

    /// Atomic QUEUED -> PROCESSING transition via compare-and-set; retries the optimistic
    /// update up to 3 times with micro-backoff before giving up (§5 "lock on KV optimistic
    /// updates"). Returns `false` if another worker already claimed the job.
    pub async fn mark_started(&self, job_id: &str) -> Result<bool, JobStoreError> {
        const MAX_ATTEMPTS: u32 = 3;
        for attempt in 0..MAX_ATTEMPTS {
            let Some(mut job) = self.load_job(job_id).await? else { return Ok(false) };
            if job.status != JobStatus::Queued {
                return Ok(false);
            }

            let before = store::encode(&job)?;
            job.status = JobStatus::Processing;
            job.started_at = Some(chrono::Utc::now());
            let after = store::encode(&job)?;

            if self.store.compare_and_set(&job_key(job_id), Some(&before), &after).await? {
                self.store.set_add(&processing_key(&job.queue_name), job_id).await?;
                self.publish_transition(&job, JobStatus::Queued, JobStatus::Processing);
                return Ok(true);
            }
            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(10 * (attempt as u64 + 1))).await;
            }
        }
        Ok(false)
    }

    /// Requeue a job still marked PROCESSING whose worker went stale past its lease (§4.10
    /// 15s sweep). A no-op returning `false` if the job is no longer PROCESSING (it may have
    /// completed or failed concurrently).
    pub async fn requeue_orphaned(&self, job_id: &str) -> Result<bool, JobStoreError> {
        const MAX_ATTEMPTS: u32 = 3;
        for attempt in 0..MAX_ATTEMPTS {
            let Some(mut job) = self.load_job(job_id).await? else { return Ok(false) };
            if job.status != JobStatus::Processing {
                return Ok(false);
            }

            let before = store::encode(&job)?;
            job.status = JobStatus::Queued;
            job.started_at = None;
            let after = store::encode(&job)?;

            if self.store.compare_and_set(&job_key(job_id), Some(&before), &after).await? {
                self.store.set_remove(&processing_key(&job.queue_name), job_id).await?;
                self.store.list_push_right(&queue_key(&job.queue_name), job_id).await?;
                self.publish_transition(&job, JobStatus::Processing, JobStatus::Queued);
                return Ok(true);
            }
            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(10 * (attempt as u64 + 1))).await;
            }
        }
        Ok(false)
    }

    /// Delete terminal job records past `jobRetention`, and drop their entry from the per-user
    /// index so it doesn't accumulate dangling ids forever (§4.10 hourly sweep). The KV TTL set
    /// at creation time already expires the underlying record; this additionally prunes the
    /// per-queue terminal index and per-user index, which have no TTL of their own.
    pub async fn purge_expired_terminal_jobs(&self, queue_name: &str) -> Result<usize, JobStoreError> {
        let ids = self.store.list_range(&terminal_key(queue_name), 0, TERMINAL_SCAN_LIMIT).await?;
        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(self.config.job_retention).unwrap();
        let mut purged = 0;

        for job_id in ids {
            match self.load_job(&job_id).await? {
                None => {
                    // Already TTL-expired in the store; just drop the dangling index entry.
                    self.store.list_remove(&terminal_key(queue_name), &job_id).await?;
                }
                Some(job) => {
                    let expired_at = job.completed_at.unwrap_or(job.created_at);
                    if expired_at < cutoff {
                        self.store.del(&job_key(&job_id)).await?;
                        self.store.set_remove(&user_jobs_key(&job.user_id), &job_id).await?;
                        self.store.list_remove(&terminal_key(queue_name), &job_id).await?;
                        purged += 1;
                    }
                }
            }
        }

        Ok(purged)
    }

    pub async fn dequeue(&self, queue_name: &str) -> Result<Option<Job>, JobStoreError> {
        let Some(job_id) = self.store.list_pop_left(&queue_key(queue_name)).await? else {
            return Ok(None);
        };
        self.load_job(&job_id).await
    }

    /// The §4.5 adaptive retry algorithm. `service_name` identifies the downstream the failure
    /// came from (for classification and circuit lookup); `error` is the observed failure.
    pub async fn increment_retry(
        &self,
        job_id: &str,
        service_name: &str,
        service_kind: ServiceKind,
        error: Option<&ClassifiableError>,
    ) -> Result<RetryOutcome, JobStoreError> {
        let Some(mut job) = self.load_job(job_id).await? else {
            return Err(JobStoreError::NotFound(job_id.to_string()));
        };

        let category = self.classifier.classify(service_name, service_kind, error);
        let circuit_state = self.circuits.get_or_create(service_name).state();
        let mut rng = rand::thread_rng();
        let decision =
            adaptive_retry_decision(category, circuit_state, job.retry_count, job.max_retries, &mut rng);

        let before = store::encode(&job)?;
        job.retry_count += 1;
        job.error_category = Some(category);

        if decision.should_retry && job.retry_count <= job.max_retries {
            job.status = JobStatus::Retrying;
            self.store.compare_and_set(&job_key(job_id), Some(&before), &store::encode(&job)?).await?;
            let mid = store::encode(&job)?;
            job.status = JobStatus::Queued;
            let after = store::encode(&job)?;
            self.store.compare_and_set(&job_key(job_id), Some(&mid), &after).await?;
            self.store
                .zset_add(&queue_delayed_key(&job.queue_name), job_id, decision.next_at.timestamp_millis() as f64)
                .await?;
            self.store.set_remove(&processing_key(&job.queue_name), job_id).await?;
            self.publish_transition(&job, JobStatus::Failed, JobStatus::Queued);
            Ok(RetryOutcome { terminal: false, requeued: true, decision })
        } else {
            job.status = JobStatus::Failed;
            let after = store::encode(&job)?;
            self.store.compare_and_set(&job_key(job_id), Some(&before), &after).await?;
            self.store.set_remove(&processing_key(&job.queue_name), job_id).await?;
            self.publish_transition(&job, JobStatus::Processing, JobStatus::Failed);
            Ok(RetryOutcome { terminal: true, requeued: false, decision })
        }
    }

    /// Move ready delayed retries (`nextRetryAt <= now`) from `queue_delayed:{queue}` back onto
    /// the active queue. Intended for Scheduled Maintenance's 5-minute scan (§4.10).
    pub async fn promote_ready_delayed_retries(&self, queue_name: &str) -> Result<usize, JobStoreError> {
        let now_ms = chrono::Utc::now().timestamp_millis() as f64;
        let ready = self.store.zset_range_by_score(&queue_delayed_key(queue_name), now_ms).await?;
        for job_id in &ready {
            self.store.zset_remove(&queue_delayed_key(queue_name), job_id).await?;
            self.store.list_push_right(&queue_key(queue_name), job_id).await?;
        }
        Ok(ready.len())
    }

    pub async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, JobStoreError> {
        let size = self.store.list_len(&queue_key(queue_name)).await?;
        let processing_ids = self.store.set_members(&processing_key(queue_name)).await?;

        let mut total_age_ms: i64 = 0;
        let mut counted: i64 = 0;
        for id in &processing_ids {
            if let Some(job) = self.load_job(id).await? {
                if let Some(started) = job.started_at {
                    total_age_ms += (chrono::Utc::now() - started).num_milliseconds().max(0);
                    counted += 1;
                }
            }
        }
        let avg_age_ms = if counted > 0 { (total_age_ms / counted) as u64 } else { 0 };

        Ok(QueueStats { size, processing: processing_ids.len(), avg_age_ms })
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<Job>, JobStoreError> {
        match self.store.get(&job_key(job_id)).await? {
            Some(raw) => Ok(Some(store::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn publish_transition(&self, job: &Job, from: JobStatus, to: JobStatus) {
        self.events.publish(JobStatusChanged {
            job_id: job.job_id.clone(),
            job_type: job.job_type,
            from,
            to,
        });
    }
}

/// §4.5 adaptive retry steps 1-6, minus classification (already performed by the caller).
/// `attempt` is the job's current (pre-increment) retry count.
fn adaptive_retry_decision(
    category: ErrorCategory,
    circuit_state: CircuitState,
    attempt: u32,
    job_max_retries: u32,
    rng: &mut impl Rng,
) -> RetryDecision {
    let now = chrono::Utc::now();

    if category.is_non_retryable() {
        return RetryDecision { should_retry: false, delay: Duration::ZERO, next_at: now };
    }
    if circuit_state == CircuitState::Open && category != ErrorCategory::ValidationError {
        return RetryDecision { should_retry: false, delay: Duration::ZERO, next_at: now };
    }

    let (policy, mut config) = retry_engine::config_for_category(category);
    config.max_retries = config.max_retries.min(job_max_retries);

    let mut decision = retry_engine::calculate_next(policy, &config, attempt, now, rng);

    if circuit_state == CircuitState::HalfOpen {
        let scaled = decision.delay.mul_f64(1.5);
        decision.next_at = now + chrono::Duration::from_std(scaled).unwrap_or_else(|_| chrono::Duration::zero());
        decision.delay = scaled;
    }

    decision
}
