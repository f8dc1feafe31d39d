//! Registry for managing per-dependency circuit breakers.
//!
//! Allows global access and control (reset/inspection) of circuit breakers by id ("transcription",
//! "agent:claude", etc.), and optionally mirrors state to the KV store so an already-open breaker
//! survives a process restart instead of silently resetting to closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};

/// Durable mirror for circuit breaker state, backed by the KV store.
///
/// The registry calls `save` on every observed transition and `load` once, the first time a
/// breaker id is created, to rehydrate state across restarts. Implementations should treat this
/// as best-effort: a missed save just means a slightly stale mirror, not a correctness problem,
/// since the in-memory breaker is still authoritative for request-path decisions.
pub trait CircuitStateMirror: Send + Sync + std::fmt::Debug {
    fn save(&self, id: &str, state: CircuitState);
    fn load(&self, id: &str) -> Option<CircuitState>;
}

/// Registry keyed by breaker id.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    inner: Arc<Mutex<HashMap<String, CircuitBreakerPolicy>>>,
    default_config: CircuitBreakerConfig,
    mirror: Option<Arc<dyn CircuitStateMirror>>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("ids", &self.snapshot().into_iter().map(|(id, _)| id).collect::<Vec<_>>())
            .finish()
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            default_config,
            mirror: None,
        }
    }

    /// Attach a durability mirror backed by the KV store.
    pub fn with_mirror(mut self, mirror: Arc<dyn CircuitStateMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Register an already-constructed breaker under `id`, overwriting any existing entry.
    pub fn register(&self, id: impl Into<String>, breaker: CircuitBreakerPolicy) {
        self.inner.lock().unwrap().insert(id.into(), breaker);
    }

    /// Retrieve the breaker for `id`, creating one from the default config (and rehydrating
    /// from the mirror, if attached) on first use.
    pub fn get_or_create(&self, id: &str) -> CircuitBreakerPolicy {
        let mut map = self.inner.lock().unwrap();
        if let Some(existing) = map.get(id) {
            return existing.clone();
        }

        let breaker = CircuitBreakerPolicy::with_config(self.default_config.clone());
        if let Some(mirror) = &self.mirror {
            if let Some(CircuitState::Open) = mirror.load(id) {
                breaker.force_open();
            }
        }
        map.insert(id.to_string(), breaker.clone());
        breaker
    }

    /// Retrieve a handle to a registered circuit breaker by id, without creating one.
    pub fn get(&self, id: &str) -> Option<CircuitBreakerPolicy> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    /// Reset a registered circuit breaker by id. Returns an error if the id is not found.
    pub fn reset(&self, id: &str) -> Result<(), String> {
        if let Some(handle) = self.get(id) {
            handle.reset();
            self.mirror_save(id, CircuitState::Closed);
            Ok(())
        } else {
            Err(format!("breaker id not found: {id}"))
        }
    }

    /// Record the current state of every breaker to the mirror, if one is attached. Intended to
    /// be called periodically by Scheduled Maintenance, not on every request.
    pub fn sync_mirror(&self) {
        if self.mirror.is_none() {
            return;
        }
        for (id, state) in self.snapshot() {
            self.mirror_save(&id, state);
        }
    }

    fn mirror_save(&self, id: &str, state: CircuitState) {
        if let Some(mirror) = &self.mirror {
            mirror.save(id, state);
        }
    }

    /// Snapshot of all breaker states (id -> state), sorted by id.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.lock().unwrap();
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
