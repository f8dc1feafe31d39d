//! Decoupling seams between the Job Store, Worker Health Registry, and Worker Pool (§9).
//!
//! The source material couples these three components bidirectionally: workers need queue
//! stats, the Job Store reacts to worker outcomes, and the pool drives both. Rather than let
//! any of them hold a concrete reference to another, each depends only on a narrow read-only
//! trait, plus an in-process event bus for status-change notifications nobody needs to poll for.

use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::job::{JobStatus, JobType};

/// Read-only queue statistics the Worker Health Registry needs without holding a `JobStore`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueStats {
    pub size: usize,
    pub processing: usize,
    pub avg_age_ms: u64,
}

/// Implemented by the Job Store; consumed by the Worker Health Registry and Degradation
/// Controller to compute queue-saturation without a direct dependency on job storage internals.
pub trait QueueStatsProvider: Send + Sync + std::fmt::Debug {
    fn queue_stats(&self, queue_name: &str) -> QueueStats;
    fn queue_names(&self) -> Vec<String>;
}

/// Read-only worker/system health the Job Store and Degradation Controller need without
/// holding a `WorkerHealthRegistry`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerHealthSnapshot {
    pub active_workers: usize,
    pub total_workers: usize,
    pub unhealthy_workers: usize,
    pub health_score: f64,
}

/// Implemented by the Worker Health Registry; consumed by the Degradation Controller.
pub trait WorkerMetricsProvider: Send + Sync + std::fmt::Debug {
    fn snapshot(&self) -> WorkerHealthSnapshot;
}

/// A job status transition, broadcast for monitoring and degradation consumers rather than
/// delivered via a direct method call.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusChanged {
    pub job_id: String,
    pub job_type: JobType,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// In-process broadcast bus for status-change notifications. Cloning is cheap; every clone
/// shares the same underlying channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobStatusChanged>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a transition. Silently drops the event if there are no subscribers, matching
    /// `tokio::sync::broadcast`'s semantics — no consumer, no guaranteed delivery.
    pub fn publish(&self, event: JobStatusChanged) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobStatusChanged> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Test double: an in-memory `QueueStatsProvider` for components under test that don't need a
/// real Job Store.
#[derive(Debug, Default)]
pub struct StaticQueueStats {
    stats: Mutex<std::collections::HashMap<String, QueueStats>>,
}

impl StaticQueueStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, queue_name: impl Into<String>, stats: QueueStats) {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).insert(queue_name.into(), stats);
    }
}

impl QueueStatsProvider for StaticQueueStats {
    fn queue_stats(&self, queue_name: &str) -> QueueStats {
        self.stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(queue_name)
            .copied()
            .unwrap_or(QueueStats { size: 0, processing: 0, avg_age_ms: 0 })
    }

    fn queue_names(&self) -> Vec<String> {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).keys().cloned().collect()
    }
}

pub type SharedEventBus = Arc<EventBus>;
