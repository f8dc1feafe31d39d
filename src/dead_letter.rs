//! Dead-Letter Store (§4.6): parks jobs that exhausted retries, and supports inspection and
//! controlled reprocessing.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::JobStoreError;
use crate::job::{Job, JobStatus};
use crate::job_store::JobStore;
use crate::store::{self, KvStore};

const DLQ_SCAN_LIMIT: usize = 100_000;

fn dlq_key(queue_name: &str) -> String {
    format!("dlq:{queue_name}")
}

/// A job that exhausted retries, wrapped with failure context (spec §3 `DLQEntry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub entry_id: String,
    pub job: Job,
    pub failure_reason: String,
    pub original_queue: String,
    pub moved_at: chrono::DateTime<chrono::Utc>,
    pub reprocess_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    pub retention: Duration,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self { retention: Duration::from_secs(7 * 24 * 3600) }
    }
}

#[derive(Debug)]
pub struct DeadLetterStore {
    store: Arc<dyn KvStore>,
    job_store: Arc<JobStore>,
    config: DeadLetterConfig,
}

impl DeadLetterStore {
    pub fn new(store: Arc<dyn KvStore>, job_store: Arc<JobStore>, config: DeadLetterConfig) -> Self {
        Self { store, job_store, config }
    }

    /// Wraps `job` as a `DlqEntry`, appends it to the DLQ list for its original queue, and
    /// transitions the job's status to DEAD_LETTER.
    pub async fn move_to_dlq(&self, job: Job, failure_reason: String) -> Result<DlqEntry, JobStoreError> {
        let entry = DlqEntry {
            entry_id: uuid::Uuid::new_v4().to_string(),
            original_queue: job.queue_name.clone(),
            job,
            failure_reason: failure_reason.clone(),
            moved_at: chrono::Utc::now(),
            reprocess_attempts: 0,
        };

        let encoded = store::encode(&entry)?;
        self.store.list_push_right(&dlq_key(&entry.original_queue), &encoded).await?;
        self.job_store
            .update_status(&entry.job.job_id, JobStatus::DeadLetter, None, Some(failure_reason))
            .await?;

        Ok(entry)
    }

    /// Current depth of the DLQ for `queue_name`, for the §4.9 `jobs.dlq.size{queue}` metric.
    pub async fn dlq_size(&self, queue_name: &str) -> Result<usize, JobStoreError> {
        self.store.list_len(&dlq_key(queue_name)).await.map_err(JobStoreError::from)
    }

    pub async fn list_dlq(
        &self,
        queue_name: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DlqEntry>, JobStoreError> {
        let raw = self.store.list_range(&dlq_key(queue_name), offset, limit).await?;
        raw.iter().map(|r| store::decode(r).map_err(JobStoreError::from)).collect()
    }

    pub async fn get_entry(&self, queue_name: &str, entry_id: &str) -> Result<Option<DlqEntry>, JobStoreError> {
        let raw = self.store.list_range(&dlq_key(queue_name), 0, DLQ_SCAN_LIMIT).await?;
        for encoded in raw {
            let entry: DlqEntry = store::decode(&encoded)?;
            if entry.entry_id == entry_id {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Clone the original job into a fresh job id on the original queue with `retryCount = 0`
    /// and status QUEUED, preserving status monotonicity for the DLQ'd record itself (§9 open
    /// question: cloning, never resurrecting the terminal job).
    pub async fn reprocess(&self, queue_name: &str, entry_id: &str) -> Result<Job, JobStoreError> {
        let entry = self
            .get_entry(queue_name, entry_id)
            .await?
            .ok_or_else(|| JobStoreError::NotFound(entry_id.to_string()))?;

        let mut clone = entry.job.clone();
        clone.job_id = uuid::Uuid::new_v4().to_string();
        clone.status = JobStatus::Queued;
        clone.retry_count = 0;
        clone.result = None;
        clone.error_message = None;
        clone.error_category = None;
        clone.started_at = None;
        clone.completed_at = None;
        clone.created_at = chrono::Utc::now();

        let encoded = store::encode(&clone)?;
        self.store
            .set(&format!("jobs:{}", clone.job_id), &encoded, None)
            .await
            .map_err(JobStoreError::from)?;
        self.store.set_add(&format!("user_jobs:{}", clone.user_id), &clone.job_id).await?;
        self.store.list_push_right(&format!("queue:{}", clone.queue_name), &clone.job_id).await?;

        self.mark_reprocessed(queue_name, entry_id).await?;

        Ok(clone)
    }

    async fn mark_reprocessed(&self, queue_name: &str, entry_id: &str) -> Result<(), JobStoreError> {
        let raw = self.store.list_range(&dlq_key(queue_name), 0, DLQ_SCAN_LIMIT).await?;
        for encoded in raw {
            let mut entry: DlqEntry = store::decode(&encoded)?;
            if entry.entry_id == entry_id {
                entry.reprocess_attempts += 1;
                let updated = store::encode(&entry)?;
                self.store.list_remove(&dlq_key(queue_name), &encoded).await?;
                self.store.list_push_right(&dlq_key(queue_name), &updated).await?;
                break;
            }
        }
        Ok(())
    }

    /// Entries older than `retention` are eligible for pruning. Returns how many were removed;
    /// intended for Scheduled Maintenance's daily task (§4.10).
    pub async fn prune_expired(&self, queue_name: &str) -> Result<usize, JobStoreError> {
        let raw = self.store.list_range(&dlq_key(queue_name), 0, DLQ_SCAN_LIMIT).await?;
        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(self.config.retention).unwrap();
        let mut pruned = 0;
        for encoded in raw {
            let entry: DlqEntry = store::decode(&encoded)?;
            if entry.moved_at < cutoff {
                self.store.list_remove(&dlq_key(queue_name), &encoded).await?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::circuit_breaker_registry::CircuitBreakerRegistry;
    use crate::classifier::ErrorClassifier;
    use crate::degradation::{DegradationConfig, DegradationController};
    use crate::eventbus::{EventBus, StaticQueueStats};
    use crate::job::{JobRequest, JobType};
    use crate::job_store::JobStoreConfig;
    use crate::store::MemoryStore;
    use crate::worker_health::{WorkerHealthConfig, WorkerHealthRegistry};
    use std::collections::HashMap;

    async fn setup() -> (Arc<JobStore>, DeadLetterStore, Job) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let circuits = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let degradation = Arc::new(DegradationController::new(
            circuits.clone(),
            Arc::new(WorkerHealthRegistry::new(WorkerHealthConfig::default(), Arc::new(StaticQueueStats::new()))),
            DegradationConfig::default(),
        ));
        let job_store = Arc::new(JobStore::new(
            kv.clone(),
            Arc::new(ErrorClassifier::new()),
            circuits,
            Arc::new(EventBus::new(16)),
            degradation,
            JobStoreConfig::default(),
        ));
        let dlq = DeadLetterStore::new(kv, job_store.clone(), DeadLetterConfig::default());

        let request =
            JobRequest { job_type: JobType::AudioProcessing, input_data: HashMap::new(), session_id: None };
        let response = job_store.create("user-1", request).await.unwrap();
        let job = job_store.dequeue("audio_processing").await.unwrap().unwrap();
        job_store.mark_started(&job.job_id).await.unwrap();
        job_store
            .update_status(&job.job_id, JobStatus::Failed, None, Some("boom".into()))
            .await
            .unwrap();
        let job = job_store.get(&response.job_id, "user-1").await.unwrap().unwrap();

        (job_store, dlq, job)
    }

    #[tokio::test]
    async fn move_to_dlq_transitions_job_and_lists_entry() {
        let (job_store, dlq, job) = setup().await;
        let entry = dlq.move_to_dlq(job.clone(), "exhausted retries".into()).await.unwrap();

        let reloaded = job_store.get(&job.job_id, "user-1").await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::DeadLetter);

        let listed = dlq.list_dlq("audio_processing", 10, 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].entry_id, entry.entry_id);
        assert_eq!(dlq.dlq_size("audio_processing").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reprocess_clones_job_with_fresh_id_and_zero_retries() {
        let (job_store, dlq, job) = setup().await;
        let entry = dlq.move_to_dlq(job.clone(), "exhausted retries".into()).await.unwrap();

        let cloned = dlq.reprocess("audio_processing", &entry.entry_id).await.unwrap();
        assert_ne!(cloned.job_id, job.job_id);
        assert_eq!(cloned.status, JobStatus::Queued);
        assert_eq!(cloned.retry_count, 0);

        let requeued = job_store.dequeue("audio_processing").await.unwrap().unwrap();
        assert_eq!(requeued.job_id, cloned.job_id);

        let original = job_store.get(&job.job_id, "user-1").await.unwrap().unwrap();
        assert_eq!(original.status, JobStatus::DeadLetter, "original entry stays terminal");
    }

    #[tokio::test]
    async fn get_entry_returns_none_for_unknown_id() {
        let (_job_store, dlq, _job) = setup().await;
        assert!(dlq.get_entry("audio_processing", "missing").await.unwrap().is_none());
    }
}
