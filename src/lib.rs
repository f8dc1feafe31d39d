#![forbid(unsafe_code)]

//! # ScribeQ Core
//!
//! Asynchronous job-processing core for audio-to-SOAP-note transcription: Redis-backed queueing,
//! a worker pool that drives transcription and note-generation through circuit breakers, an
//! adaptive retry engine, a dead-letter store, and the health/degradation/monitoring layers that
//! keep the system observable and self-protecting under partial downstream failure.
//!
//! ## Quick start
//!
//! ```rust
//! use scribeq_core::{
//!     CircuitBreakerConfig, CircuitBreakerRegistry, Config, DegradationConfig,
//!     DegradationController, ErrorClassifier, EventBus, JobStore, JobStoreConfig, MemoryStore,
//!     StaticQueueStats, WorkerHealthConfig, WorkerHealthRegistry,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let store = Arc::new(MemoryStore::default());
//!     let circuits = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
//!     let worker_health = Arc::new(WorkerHealthRegistry::new(
//!         WorkerHealthConfig::default(),
//!         Arc::new(StaticQueueStats::new()),
//!     ));
//!     let degradation = Arc::new(DegradationController::new(
//!         circuits.clone(),
//!         worker_health,
//!         DegradationConfig::default(),
//!     ));
//!     let job_store = JobStore::new(
//!         store,
//!         Arc::new(ErrorClassifier::default()),
//!         circuits,
//!         Arc::new(EventBus::new(16)),
//!         degradation,
//!         JobStoreConfig::default(),
//!     );
//!     let _ = (config, job_store);
//! }
//! ```
//!
//! ## Module map
//!
//! - [`job`] — the job/queue data model and lifecycle rules.
//! - [`store`] — the KV/queue abstraction (`MemoryStore` for tests, `RedisStore` in production).
//! - [`classifier`] — maps downstream failures to error categories.
//! - [`retry_engine`] — pure backoff/jitter calculation for the adaptive retry algorithm.
//! - [`job_store`] — job CRUD, queue enqueue/dequeue, and the adaptive retry algorithm.
//! - [`dead_letter`] — parks jobs that exhaust retries, and supports reprocessing.
//! - [`worker_health`] — tracks worker heartbeats and aggregates a system health score.
//! - [`downstream`] — transcription/agent service client traits.
//! - [`worker_pool`] — the per-worker poll loop that actually executes jobs.
//! - [`degradation`] — computes a system-wide degradation level with manual override.
//! - [`monitoring`] — bounded metric series and alert-rule evaluation.
//! - [`maintenance`] — the periodic background sweeps tying everything together.
//! - [`config`] — layered runtime configuration.
//!
//! Beneath those sit the general-purpose resilience primitives the rest of the crate is built
//! from: [`circuit_breaker`], [`circuit_breaker_registry`], [`retry`], [`backoff`], [`jitter`],
//! [`timeout`], [`clock`], and [`sleeper`].

mod backoff;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod classifier;
mod clock;
pub mod config;
pub mod dead_letter;
pub mod degradation;
pub mod downstream;
mod error;
pub mod eventbus;
mod jitter;
pub mod job;
pub mod job_store;
pub mod maintenance;
pub mod monitoring;
mod retry;
pub mod retry_engine;
mod sleeper;
pub mod store;
mod timeout;
pub mod worker_health;
pub mod worker_pool;

pub use backoff::Backoff;
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
pub use circuit_breaker_registry::{CircuitBreakerRegistry, CircuitStateMirror};
pub use classifier::{ClassifiableError, ErrorClassifier, ExceptionKind, ServiceKind};
pub use clock::{Clock, MonotonicClock};
pub use config::Config;
pub use dead_letter::{DeadLetterConfig, DeadLetterStore, DlqEntry};
pub use degradation::{
    DegradationConfig, DegradationController, DegradationLevel, DegradationOverride,
};
pub use downstream::{AgentClient, DownstreamError, HttpDownstreamClient, TranscriptionClient};
pub use error::{JobStoreError, ResilienceError, StoreError, SubmissionError};
pub use eventbus::{EventBus, QueueStats, QueueStatsProvider, SharedEventBus, StaticQueueStats, WorkerMetricsProvider};
pub use jitter::Jitter;
pub use job::{ErrorCategory, Job, JobRequest, JobResponse, JobStatus, JobType};
pub use job_store::{JobStore, JobStoreConfig, RetryOutcome};
pub use maintenance::{MaintenanceConfig, MaintenanceScheduler};
pub use monitoring::{Alert, AlertError, AlertEvaluator, AlertRule, AlertSeverity, MetricsConfig, MetricsRegistry};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use retry_engine::{RetryConfig, RetryDecision, RetryPolicyKind};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{KvStore, MemoryStore, RedisStore};
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};
pub use worker_health::{SystemHealthReport, WorkerHealth, WorkerHealthConfig, WorkerHealthRegistry};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};

pub mod prelude;
