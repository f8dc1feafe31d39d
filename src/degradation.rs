//! Degradation Controller (§4.8): periodically recomputes a per-service and overall degradation
//! level from circuit breaker state and worker health, with a manual override escape hatch.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitState;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::eventbus::WorkerMetricsProvider;

/// Degradation severity, ordered so `max()` picks the worse of two levels. CRITICAL and
/// MAINTENANCE are never computed from circuit/worker signals — they're only reachable through
/// a manual override, the former for an operator-declared severe incident, the latter to refuse
/// all new submissions outright during planned maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DegradationLevel {
    Normal,
    Minor,
    Moderate,
    Major,
    Critical,
    Maintenance,
}

/// An operator-applied override that bypasses computed levels until cleared (spec §3
/// `DegradationOverride`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationOverride {
    pub level: DegradationLevel,
    pub reason: String,
    pub actor: String,
    pub set_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct DegradationConfig {
    pub recompute_interval: Duration,
    /// A breaker must have been continuously OPEN at least this long before it alone can push
    /// the level to MAJOR (combined with worker unhealthiness).
    pub major_breaker_open_for: Duration,
    pub minor_failure_rate: f64,
    pub moderate_failure_rate: f64,
    pub major_unhealthy_worker_ratio: f64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            recompute_interval: Duration::from_secs(30),
            major_breaker_open_for: Duration::from_secs(60),
            minor_failure_rate: 0.05,
            moderate_failure_rate: 0.2,
            major_unhealthy_worker_ratio: 0.5,
        }
    }
}

/// Per-service degradation input: how long has its breaker been open and what's the recent
/// failure rate observed for it. Supplied by the caller (normally sourced from monitoring's
/// per-service counters) since the controller itself tracks no per-call outcomes.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSignal {
    pub breaker_state: CircuitState,
    pub breaker_open_duration: Duration,
    pub recent_failure_rate: f64,
}

/// Computes and holds the current degradation level, with an operator override that takes
/// precedence over computation until explicitly cleared.
pub struct DegradationController {
    circuits: Arc<CircuitBreakerRegistry>,
    worker_health: Arc<dyn WorkerMetricsProvider>,
    config: DegradationConfig,
    override_slot: ArcSwapOption<DegradationOverride>,
    per_service: std::sync::Mutex<std::collections::HashMap<String, ServiceSignal>>,
}

impl std::fmt::Debug for DegradationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradationController").field("config", &self.config).finish()
    }
}

impl DegradationController {
    pub fn new(
        circuits: Arc<CircuitBreakerRegistry>,
        worker_health: Arc<dyn WorkerMetricsProvider>,
        config: DegradationConfig,
    ) -> Self {
        Self {
            circuits,
            worker_health,
            config,
            override_slot: ArcSwapOption::empty(),
            per_service: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Record the latest observed signal for `service_name`; consulted on the next recompute.
    pub fn record_signal(&self, service_name: &str, signal: ServiceSignal) {
        self.per_service.lock().unwrap_or_else(|p| p.into_inner()).insert(service_name.to_string(), signal);
    }

    pub fn set_override(&self, level: DegradationLevel, reason: impl Into<String>, actor: impl Into<String>) {
        self.override_slot.store(Some(Arc::new(DegradationOverride {
            level,
            reason: reason.into(),
            actor: actor.into(),
            set_at: chrono::Utc::now(),
        })));
    }

    pub fn clear_override(&self) {
        self.override_slot.store(None);
    }

    pub fn active_override(&self) -> Option<DegradationOverride> {
        self.override_slot.load_full().map(|arc| (*arc).clone())
    }

    /// The per-service level for `service_name`, from its most recently recorded signal.
    pub fn service_level(&self, service_name: &str) -> DegradationLevel {
        let guard = self.per_service.lock().unwrap_or_else(|p| p.into_inner());
        match guard.get(service_name) {
            Some(signal) => level_for_signal(signal, &self.config),
            None => DegradationLevel::Normal,
        }
    }

    /// Overall level: the operator override if set, else the max of every tracked service's
    /// level and the system-wide worker-health signal.
    pub fn overall_level(&self) -> DegradationLevel {
        if let Some(over) = self.active_override() {
            return over.level;
        }

        let guard = self.per_service.lock().unwrap_or_else(|p| p.into_inner());
        let service_max = guard.values().map(|signal| level_for_signal(signal, &self.config)).max().unwrap_or(DegradationLevel::Normal);

        let snapshot = self.worker_health.snapshot();
        let unhealthy_ratio = if snapshot.total_workers == 0 {
            0.0
        } else {
            snapshot.unhealthy_workers as f64 / snapshot.total_workers as f64
        };
        let worker_level = if unhealthy_ratio >= self.config.major_unhealthy_worker_ratio {
            DegradationLevel::Major
        } else if unhealthy_ratio > 0.0 {
            DegradationLevel::Minor
        } else {
            DegradationLevel::Normal
        };

        service_max.max(worker_level)
    }

    /// Refresh `per_service` signals directly from the circuit breaker registry for every
    /// tracked breaker id, clearing the need for callers to push signals themselves when no
    /// richer failure-rate telemetry is available.
    pub fn refresh_from_circuits(&self) {
        for (id, state) in self.circuits.snapshot() {
            let mut guard = self.per_service.lock().unwrap_or_else(|p| p.into_inner());
            let entry = guard.entry(id).or_insert(ServiceSignal {
                breaker_state: state,
                breaker_open_duration: Duration::ZERO,
                recent_failure_rate: 0.0,
            });
            entry.breaker_state = state;
        }
    }
}

fn level_for_signal(signal: &ServiceSignal, config: &DegradationConfig) -> DegradationLevel {
    let breaker_major =
        signal.breaker_state == CircuitState::Open && signal.breaker_open_duration >= config.major_breaker_open_for;

    if breaker_major {
        return DegradationLevel::Major;
    }
    if signal.breaker_state == CircuitState::Open || signal.recent_failure_rate >= config.moderate_failure_rate {
        return DegradationLevel::Moderate;
    }
    if signal.recent_failure_rate >= config.minor_failure_rate {
        return DegradationLevel::Minor;
    }
    DegradationLevel::Normal
}
