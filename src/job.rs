//! Core job/queue data model shared by the Job Store, Worker Pool, and Dead-Letter Store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The kind of work a job represents; determines queue placement and retry defaults (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    AudioProcessing,
    TextProcessing,
    TranscriptionOnly,
}

impl JobType {
    /// The queue a freshly-submitted job of this type lands on.
    pub fn default_queue(&self) -> &'static str {
        match self {
            JobType::AudioProcessing => "audio_processing",
            JobType::TextProcessing => "text_processing",
            JobType::TranscriptionOnly => "transcription_only",
        }
    }
}

/// Lifecycle status. See spec §3 for the allowed transition graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Retrying,
    DeadLetter,
}

impl JobStatus {
    /// Terminal statuses never transition further, except a DLQ reprocess which allocates a
    /// brand new job id rather than resurrecting this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled | JobStatus::DeadLetter)
    }

    /// Whether `self -> next` is a legal transition per the lifecycle graph in spec §3.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Queued)
                | (Failed, Retrying)
                | (Failed, DeadLetter)
                | (Retrying, Queued)
                | (Retrying, DeadLetter)
        )
    }
}

/// One of the ten error categories the Error Classifier assigns (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    TransientNetwork,
    RateLimited,
    ServiceUnavailable,
    AuthenticationError,
    ValidationError,
    ResourceExhaustion,
    TranscriptionError,
    AgentServiceError,
    DataError,
    UnknownError,
}

impl ErrorCategory {
    /// Categories the adaptive retry algorithm (§4.5 step 2) never retries.
    pub fn is_non_retryable(&self) -> bool {
        matches!(self, ErrorCategory::ValidationError | ErrorCategory::AuthenticationError)
    }
}

/// Opaque job payload. The core never inspects domain fields (§9); downstream clients decode it.
pub type PayloadMap = HashMap<String, serde_json::Value>;

/// A unit of asynchronous work (spec §3 "Job").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub user_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub input_data: PayloadMap,
    pub result: Option<PayloadMap>,
    pub error_message: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub queue_name: String,
    pub session_id: Option<String>,
}

impl Job {
    /// Construct a fresh QUEUED job for submission. `job_id` is caller-supplied (normally a
    /// freshly generated UUID) so the Job Store can keep id generation in one place.
    pub fn new(
        job_id: String,
        user_id: String,
        job_type: JobType,
        input_data: PayloadMap,
        max_retries: u32,
        session_id: Option<String>,
    ) -> Self {
        let queue_name = job_type.default_queue().to_string();
        Self {
            job_id,
            user_id,
            job_type,
            status: JobStatus::Queued,
            input_data,
            result: None,
            error_message: None,
            error_category: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            queue_name,
            session_id,
        }
    }
}

/// Response returned from job submission (§6 producer-facing contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub status_url: String,
}

/// A request to submit new work (§6 producer-facing contract).
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub job_type: JobType,
    pub input_data: PayloadMap,
    pub session_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_recognized() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn legal_transition_graph() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Retrying.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Queued), "orphaned jobs can be requeued");
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn non_retryable_categories() {
        assert!(ErrorCategory::ValidationError.is_non_retryable());
        assert!(ErrorCategory::AuthenticationError.is_non_retryable());
        assert!(!ErrorCategory::TransientNetwork.is_non_retryable());
    }

    #[test]
    fn default_queue_matches_job_type() {
        assert_eq!(JobType::AudioProcessing.default_queue(), "audio_processing");
        assert_eq!(JobType::TextProcessing.default_queue(), "text_processing");
        assert_eq!(JobType::TranscriptionOnly.default_queue(), "transcription_only");
    }
}
