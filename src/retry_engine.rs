//! Retry Policy Engine (§4.2): a pure calculator from `(policy, attempt, lastFailure, error?)`
//! to `{shouldRetry, delay, nextAt}`. Distinct from [`crate::retry::RetryPolicy`], which wraps
//! and executes an arbitrary async operation — this module only computes a decision; the Job
//! Store (§4.5) is the caller that acts on it.

use crate::backoff::Backoff;
use crate::jitter::Jitter;
use crate::job::{ErrorCategory, JobType};
use std::time::Duration;

/// One of the six retry strategies named in the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicyKind {
    Immediate,
    FixedDelay,
    LinearBackoff,
    ExponentialBackoff,
    Fibonacci,
    /// Delegates to the §4.5 adaptive algorithm; callers use
    /// [`crate::job_store::calculate_adaptive_retry`] instead of this module directly.
    Adaptive,
}

/// Per-policy tuning knobs (§4.2 data model `RetryPolicy` config).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
    pub jitter_factor: f64,
    pub jitter_enabled: bool,
}

impl RetryConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64, max_retries: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            max_retries,
            jitter_factor: 0.1,
            jitter_enabled: true,
        }
    }

    pub fn with_jitter(mut self, factor: f64, enabled: bool) -> Self {
        self.jitter_factor = factor;
        self.jitter_enabled = enabled;
        self
    }
}

/// The outcome of [`calculate_next`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
    pub next_at: chrono::DateTime<chrono::Utc>,
}

/// Compute the retry decision for `attempt` (zero-indexed) under `policy`/`config`.
///
/// `rng` supplies jitter randomness; pass a fixed seed in tests for determinism. `policy` must
/// not be [`RetryPolicyKind::Adaptive`] — that variant is handled by the Job Store, which has
/// access to circuit and classifier state this pure calculator does not.
pub fn calculate_next(
    policy: RetryPolicyKind,
    config: &RetryConfig,
    attempt: u32,
    now: chrono::DateTime<chrono::Utc>,
    rng: &mut impl rand::Rng,
) -> RetryDecision {
    let should_retry = attempt < config.max_retries;
    let raw_delay = raw_delay_for(policy, config, attempt);
    let delay = if config.jitter_enabled {
        Jitter::proportional(config.jitter_factor).apply_with_rng(raw_delay, rng)
    } else {
        raw_delay
    };
    let next_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

    RetryDecision { should_retry, delay, next_at }
}

fn raw_delay_for(policy: RetryPolicyKind, config: &RetryConfig, attempt: u32) -> Duration {
    match policy {
        RetryPolicyKind::Immediate => Duration::ZERO,
        RetryPolicyKind::FixedDelay => config.initial_delay,
        RetryPolicyKind::LinearBackoff => Backoff::Linear {
            base: config.initial_delay,
            cap: Some(config.max_delay),
        }
        .delay(attempt as usize + 1),
        RetryPolicyKind::ExponentialBackoff => Backoff::Exponential {
            base: config.initial_delay,
            multiplier: config.multiplier,
            cap: Some(config.max_delay),
        }
        .delay(attempt as usize + 1),
        RetryPolicyKind::Fibonacci => Backoff::Fibonacci {
            base: config.initial_delay,
            cap: Some(config.max_delay),
        }
        .delay(attempt as usize + 1),
        RetryPolicyKind::Adaptive => {
            // Never reached via calculate_next in practice; fall back to exponential so this
            // function stays total rather than panicking on a caller mistake.
            Backoff::Exponential {
                base: config.initial_delay,
                multiplier: config.multiplier,
                cap: Some(config.max_delay),
            }
            .delay(attempt as usize + 1)
        }
    }
}

/// Per-job-type default `(policy, config)` pairs (§4.2 defaults table).
pub fn default_for_job_type(job_type: JobType) -> (RetryPolicyKind, RetryConfig) {
    match job_type {
        JobType::AudioProcessing => (
            RetryPolicyKind::ExponentialBackoff,
            RetryConfig::new(Duration::from_secs(2), Duration::from_secs(300), 2.0, 5),
        ),
        JobType::TextProcessing => (
            RetryPolicyKind::ExponentialBackoff,
            RetryConfig::new(Duration::from_secs(10), Duration::from_secs(600), 2.0, 3),
        ),
        JobType::TranscriptionOnly => (
            RetryPolicyKind::ExponentialBackoff,
            RetryConfig::new(Duration::from_secs(2), Duration::from_secs(300), 2.0, 5),
        ),
    }
}

/// Default config for network-classified errors, overriding the job-type default (§4.2 table).
pub fn network_error_config() -> RetryConfig {
    RetryConfig::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, 4)
}

/// Default config for memory/resource-exhaustion errors (§4.2 table).
pub fn memory_error_config() -> RetryConfig {
    RetryConfig::new(Duration::from_secs(30), Duration::from_secs(1800), 2.0, 3)
}

/// The fallback config when no job-type or error-specific default applies (§4.2 table).
pub fn standard_fallback_config() -> RetryConfig {
    RetryConfig::new(Duration::from_secs(5), Duration::from_secs(120), 2.0, 3)
}

/// Config per error category, used by the §4.5 adaptive algorithm's step 4.
pub fn config_for_category(category: ErrorCategory) -> (RetryPolicyKind, RetryConfig) {
    match category {
        ErrorCategory::TransientNetwork => (RetryPolicyKind::ExponentialBackoff, network_error_config()),
        ErrorCategory::RateLimited => (
            RetryPolicyKind::LinearBackoff,
            RetryConfig::new(Duration::from_secs(60), Duration::from_secs(600), 1.0, 5),
        ),
        ErrorCategory::ServiceUnavailable => (
            RetryPolicyKind::Fibonacci,
            RetryConfig::new(Duration::from_secs(5), Duration::from_secs(300), 2.0, 5),
        ),
        ErrorCategory::ResourceExhaustion => (RetryPolicyKind::ExponentialBackoff, memory_error_config()),
        _ => (RetryPolicyKind::ExponentialBackoff, standard_fallback_config()),
    }
}
