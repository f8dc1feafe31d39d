//! Error Classifier (§4.1): maps a `(service, exception)` pair to an `ErrorCategory`, with a
//! bounded LRU memoization cache and per-service classification counters for monitoring.

use crate::job::ErrorCategory;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

const DEFAULT_CACHE_SIZE: usize = 10_000;
const CACHE_KEY_PREFIX_LEN: usize = 80;

/// The kind of exception raised at the call site, prior to message inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    Connection,
    Timeout,
    Http { status: u16 },
    Other,
}

/// An error observed from a downstream call, as handed to the classifier.
#[derive(Debug, Clone)]
pub struct ClassifiableError {
    pub kind: ExceptionKind,
    pub message: String,
}

impl ClassifiableError {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// Tags a downstream service as transcription- or agent-flavored so service-specific keyword
/// rules (whisper/transcription, openai/gpt/model) only fire where they make sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Transcription,
    Agent,
    Other,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    service: String,
    kind: ExceptionKind,
    message_prefix: String,
}

/// Maps `(serviceName, exception)` to an `ErrorCategory` per the ordered rule table, memoizing
/// results and tracking per-service counters for `§4.9` monitoring.
#[derive(Debug)]
pub struct ErrorClassifier {
    cache: Mutex<LruCache<CacheKey, ErrorCategory>>,
    counters: Mutex<HashMap<(String, ErrorCategory), u64>>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::with_cache_size(DEFAULT_CACHE_SIZE)
    }

    pub fn with_cache_size(size: usize) -> Self {
        let size = NonZeroUsize::new(size).unwrap_or(NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap());
        Self {
            cache: Mutex::new(LruCache::new(size)),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Classify `error` from `service_name`, tagged with `service_kind` to gate the
    /// transcription/agent keyword rules. A missing error yields `UnknownError`.
    pub fn classify(
        &self,
        service_name: &str,
        service_kind: ServiceKind,
        error: Option<&ClassifiableError>,
    ) -> ErrorCategory {
        let Some(error) = error else {
            return ErrorCategory::UnknownError;
        };

        let prefix: String = error.message.chars().take(CACHE_KEY_PREFIX_LEN).collect();
        let key = CacheKey {
            service: service_name.to_string(),
            kind: error.kind,
            message_prefix: prefix,
        };

        if let Some(hit) = self.cache.lock().unwrap_or_else(|p| p.into_inner()).get(&key) {
            return *hit;
        }

        let category = classify_uncached(error, service_kind);

        self.cache.lock().unwrap_or_else(|p| p.into_inner()).put(key, category);
        *self
            .counters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry((service_name.to_string(), category))
            .or_insert(0) += 1;

        category
    }

    /// Per-service, per-category classification counts observed so far.
    pub fn counters(&self) -> HashMap<(String, ErrorCategory), u64> {
        self.counters.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_uncached(error: &ClassifiableError, service_kind: ServiceKind) -> ErrorCategory {
    if matches!(error.kind, ExceptionKind::Connection | ExceptionKind::Timeout) {
        return ErrorCategory::TransientNetwork;
    }

    let message = error.message.to_lowercase();
    let has_any = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

    if let ExceptionKind::Http { status } = error.kind {
        if status == 429 {
            return ErrorCategory::RateLimited;
        }
        if matches!(status, 502 | 503 | 504) {
            return ErrorCategory::ServiceUnavailable;
        }
        if matches!(status, 401 | 403) {
            return ErrorCategory::AuthenticationError;
        }
    }

    if has_any(&["rate limit", "429"]) {
        return ErrorCategory::RateLimited;
    }
    if has_any(&["503", "502", "504", "unavailable"]) {
        return ErrorCategory::ServiceUnavailable;
    }
    if has_any(&["401", "403", "unauthorized", "forbidden"]) {
        return ErrorCategory::AuthenticationError;
    }
    if has_any(&["invalid", "parse", "format"]) {
        return ErrorCategory::ValidationError;
    }
    if has_any(&["out of memory", "disk full", "no space"]) {
        return ErrorCategory::ResourceExhaustion;
    }
    if service_kind == ServiceKind::Transcription && has_any(&["whisper", "transcription"]) {
        return ErrorCategory::TranscriptionError;
    }
    if service_kind == ServiceKind::Agent && has_any(&["openai", "gpt", "model"]) {
        return ErrorCategory::AgentServiceError;
    }
    if has_any(&["not found", "corrupt"]) {
        return ErrorCategory::DataError;
    }

    ErrorCategory::UnknownError
}
