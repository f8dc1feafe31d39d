//! Worker Health Registry (§4.4): tracks registered workers, heartbeats, outcome counters, and
//! aggregates a system-wide health score. Depends on [`crate::eventbus::QueueStatsProvider`]
//! rather than holding a direct reference to the Job Store (§9).

use crate::eventbus::{QueueStatsProvider, WorkerHealthSnapshot, WorkerMetricsProvider};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Lifecycle status of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Active,
    Inactive,
    Failed,
    Unhealthy,
}

/// A single worker's tracked state (spec §3 `WorkerHealth`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub worker_id: String,
    pub worker_type: String,
    pub status: WorkerStatus,
    pub registered_at: chrono::DateTime<chrono::Utc>,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub processed_jobs: u64,
    pub failed_jobs: u64,
    pub avg_processing_time_ms: f64,
    pub consecutive_failures: u32,
    /// Job currently claimed by this worker, if any — used by Scheduled Maintenance (§4.10) to
    /// re-queue jobs held by workers that go UNHEALTHY past their processing lease.
    pub current_job_id: Option<String>,
}

/// Weighted system health summary (spec §3 `systemHealthReport`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemHealthReport {
    pub active_workers: usize,
    pub total_workers: usize,
    pub unhealthy_workers: usize,
    pub failed_workers: usize,
    pub health_score: f64,
}

#[derive(Debug, Clone)]
pub struct WorkerHealthConfig {
    pub stale_after: Duration,
    pub consecutive_failure_kill: u32,
}

impl Default for WorkerHealthConfig {
    fn default() -> Self {
        Self { stale_after: Duration::from_secs(60), consecutive_failure_kill: 5 }
    }
}

/// Registry of worker health records, guarded by a single mutex — heartbeats are frequent but
/// cheap, and the map is small (workers, not jobs), so lock contention is not a concern here.
#[derive(Debug)]
pub struct WorkerHealthRegistry {
    workers: Mutex<HashMap<String, WorkerHealth>>,
    config: WorkerHealthConfig,
    queue_stats: Arc<dyn QueueStatsProvider>,
}

impl WorkerHealthRegistry {
    pub fn new(config: WorkerHealthConfig, queue_stats: Arc<dyn QueueStatsProvider>) -> Self {
        Self { workers: Mutex::new(HashMap::new()), config, queue_stats }
    }

    pub fn register(&self, worker_id: impl Into<String>, worker_type: impl Into<String>) {
        let now = chrono::Utc::now();
        let worker_id = worker_id.into();
        self.workers.lock().unwrap_or_else(|p| p.into_inner()).insert(
            worker_id.clone(),
            WorkerHealth {
                worker_id,
                worker_type: worker_type.into(),
                status: WorkerStatus::Active,
                registered_at: now,
                last_heartbeat: now,
                end_time: None,
                processed_jobs: 0,
                failed_jobs: 0,
                avg_processing_time_ms: 0.0,
                consecutive_failures: 0,
                current_job_id: None,
            },
        );
    }

    /// O(1) heartbeat update; must stay cheap since it is called on every poll iteration.
    pub fn heartbeat(&self, worker_id: &str) {
        if let Some(worker) = self.workers.lock().unwrap_or_else(|p| p.into_inner()).get_mut(worker_id) {
            worker.last_heartbeat = chrono::Utc::now();
            self.apply_staleness(worker);
        }
    }

    /// Records the worker's claim of `job_id`, or clears it when `None` (job finished).
    pub fn set_current_job(&self, worker_id: &str, job_id: Option<String>) {
        if let Some(worker) = self.workers.lock().unwrap_or_else(|p| p.into_inner()).get_mut(worker_id) {
            worker.current_job_id = job_id;
        }
    }

    pub fn record_outcome(&self, worker_id: &str, success: bool, processing_time_ms: u64) {
        let mut guard = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        let Some(worker) = guard.get_mut(worker_id) else { return };

        if success {
            worker.processed_jobs += 1;
            worker.consecutive_failures = 0;
        } else {
            worker.failed_jobs += 1;
            worker.consecutive_failures += 1;
        }

        let total = worker.processed_jobs + worker.failed_jobs;
        if total > 0 {
            worker.avg_processing_time_ms +=
                (processing_time_ms as f64 - worker.avg_processing_time_ms) / total as f64;
        }

        if worker.consecutive_failures >= self.config.consecutive_failure_kill {
            worker.status = WorkerStatus::Failed;
            worker.end_time.get_or_insert(chrono::Utc::now());
        }
    }

    pub fn deactivate(&self, worker_id: &str) {
        if let Some(worker) = self.workers.lock().unwrap_or_else(|p| p.into_inner()).get_mut(worker_id) {
            worker.status = WorkerStatus::Inactive;
            worker.end_time = Some(chrono::Utc::now());
        }
    }

    pub fn get_worker(&self, worker_id: &str) -> Option<WorkerHealth> {
        self.workers.lock().unwrap_or_else(|p| p.into_inner()).get(worker_id).cloned()
    }

    /// Active workers, excluding FAILED/INACTIVE/UNHEALTHY, after refreshing staleness.
    pub fn active_workers(&self) -> Vec<WorkerHealth> {
        let mut guard = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        for worker in guard.values_mut() {
            Self::apply_staleness_with_config(worker, self.config.stale_after);
        }
        guard.values().filter(|w| w.status == WorkerStatus::Active).cloned().collect()
    }

    /// Every registered worker regardless of status, after refreshing staleness. Used by the
    /// `worker.heartbeat.age.p95` metric, which needs every worker's age, not just active ones.
    pub fn all_workers(&self) -> Vec<WorkerHealth> {
        let mut guard = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        for worker in guard.values_mut() {
            Self::apply_staleness_with_config(worker, self.config.stale_after);
        }
        guard.values().cloned().collect()
    }

    /// Every worker whose `lastHeartbeat` has gone stale past `stale_after`, refreshed and
    /// demoted in place. Intended to be called by Scheduled Maintenance's 15s task.
    pub fn refresh_staleness(&self) -> Vec<WorkerHealth> {
        let mut guard = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        let mut newly_unhealthy = Vec::new();
        for worker in guard.values_mut() {
            let was_active = worker.status == WorkerStatus::Active;
            Self::apply_staleness_with_config(worker, self.config.stale_after);
            if was_active && worker.status == WorkerStatus::Unhealthy {
                newly_unhealthy.push(worker.clone());
            }
        }
        newly_unhealthy
    }

    fn apply_staleness(&self, worker: &mut WorkerHealth) {
        Self::apply_staleness_with_config(worker, self.config.stale_after);
    }

    fn apply_staleness_with_config(worker: &mut WorkerHealth, stale_after: Duration) {
        if worker.status != WorkerStatus::Active {
            return;
        }
        let age = chrono::Utc::now() - worker.last_heartbeat;
        if age.to_std().map(|a| a > stale_after).unwrap_or(false) {
            worker.status = WorkerStatus::Unhealthy;
        }
    }

    pub fn system_health_report(&self) -> SystemHealthReport {
        let guard = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        let total = guard.len();
        let active = guard.values().filter(|w| w.status == WorkerStatus::Active).count();
        let unhealthy = guard.values().filter(|w| w.status == WorkerStatus::Unhealthy).count();
        let failed = guard.values().filter(|w| w.status == WorkerStatus::Failed).count();

        let active_ratio = if total == 0 { 1.0 } else { active as f64 / total as f64 };

        let processed: u64 = guard.values().map(|w| w.processed_jobs).sum();
        let failed_jobs: u64 = guard.values().map(|w| w.failed_jobs).sum();
        let total_outcomes = processed + failed_jobs;
        let success_ratio = if total_outcomes == 0 { 1.0 } else { processed as f64 / total_outcomes as f64 };

        let saturation_inverse = self.queue_saturation_inverse();

        let health_score =
            (0.4 * active_ratio + 0.3 * success_ratio + 0.3 * saturation_inverse).clamp(0.0, 1.0) * 100.0;

        SystemHealthReport {
            active_workers: active,
            total_workers: total,
            unhealthy_workers: unhealthy,
            failed_workers: failed,
            health_score,
        }
    }

    fn queue_saturation_inverse(&self) -> f64 {
        let names = self.queue_stats.queue_names();
        if names.is_empty() {
            return 1.0;
        }
        const ASSUMED_CAPACITY: f64 = 1000.0;
        let ratios: Vec<f64> = names
            .iter()
            .map(|name| {
                let stats = self.queue_stats.queue_stats(name);
                (stats.size as f64 / ASSUMED_CAPACITY).min(1.0)
            })
            .collect();
        let avg_saturation = ratios.iter().sum::<f64>() / ratios.len() as f64;
        1.0 - avg_saturation
    }
}

impl WorkerMetricsProvider for WorkerHealthRegistry {
    fn snapshot(&self) -> WorkerHealthSnapshot {
        let report = self.system_health_report();
        WorkerHealthSnapshot {
            active_workers: report.active_workers,
            total_workers: report.total_workers,
            unhealthy_workers: report.unhealthy_workers,
            health_score: report.health_score,
        }
    }
}
