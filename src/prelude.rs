//! Convenience re-exports for the common path of wiring a job-processing pipeline: submit jobs
//! through a [`JobStore`], run them through a [`WorkerPool`], and keep the system healthy with a
//! [`MaintenanceScheduler`].
//!
//! ```rust
//! use scribeq_core::prelude::*;
//! ```

pub use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
pub use crate::circuit_breaker_registry::CircuitBreakerRegistry;
pub use crate::classifier::ErrorClassifier;
pub use crate::config::Config;
pub use crate::dead_letter::{DeadLetterConfig, DeadLetterStore};
pub use crate::degradation::{DegradationConfig, DegradationController, DegradationLevel};
pub use crate::downstream::{AgentClient, HttpDownstreamClient, TranscriptionClient};
pub use crate::error::{JobStoreError, ResilienceError, SubmissionError};
pub use crate::eventbus::{EventBus, StaticQueueStats};
pub use crate::job::{Job, JobRequest, JobResponse, JobStatus, JobType};
pub use crate::job_store::{JobStore, JobStoreConfig};
pub use crate::maintenance::MaintenanceScheduler;
pub use crate::monitoring::{Alert, AlertEvaluator, AlertRule, AlertSeverity, MetricsRegistry};
pub use crate::store::{KvStore, MemoryStore, RedisStore};
pub use crate::worker_health::{WorkerHealthConfig, WorkerHealthRegistry};
pub use crate::worker_pool::{WorkerPool, WorkerPoolConfig};
