//! Worker pool registry.
//!
//! Tracks every live worker, its state, and its heartbeat. State transitions
//! are driven exclusively by the dispatcher task; the pool itself only guards
//! the map.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::worker::WorkerJob;

/// State of a worker in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Ready for a batch.
    Idle,
    /// Running a dispatched batch.
    Busy,
    /// Surplus worker finishing up before termination; receives no new work.
    Draining,
    /// Declared dead; set on entries as they leave the pool.
    Dead,
}

/// A worker known to the pool.
#[derive(Debug, Clone)]
pub struct WorkerEntry {
    /// Unique worker identifier.
    pub id: String,
    /// Model this worker has loaded.
    pub model_id: String,
    /// Current state.
    pub state: WorkerState,
    /// When the worker was spawned.
    pub spawned_at: DateTime<Utc>,
    /// Last heartbeat or completion received.
    pub last_heartbeat: DateTime<Utc>,
    /// Batch currently running, if busy.
    pub current_batch: Option<Uuid>,
    /// Channel to send jobs to this worker's task.
    pub jobs: mpsc::Sender<WorkerJob>,
}

/// Registry of live workers.
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: RwLock<HashMap<String, WorkerEntry>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Add a freshly spawned worker.
    pub async fn register(&self, entry: WorkerEntry) {
        self.workers.write().await.insert(entry.id.clone(), entry);
    }

    /// Get a worker by id.
    pub async fn get(&self, id: &str) -> Option<WorkerEntry> {
        self.workers.read().await.get(id).cloned()
    }

    /// All workers currently in the pool.
    pub async fn all(&self) -> Vec<WorkerEntry> {
        self.workers.read().await.values().cloned().collect()
    }

    /// Record a heartbeat from a worker.
    pub async fn heartbeat(&self, id: &str) {
        if let Some(worker) = self.workers.write().await.get_mut(id) {
            worker.last_heartbeat = Utc::now();
        }
    }

    /// An idle worker loaded with the given model, if any.
    pub async fn idle_for_model(&self, model_id: &str) -> Option<WorkerEntry> {
        self.workers
            .read()
            .await
            .values()
            .find(|w| w.state == WorkerState::Idle && w.model_id == model_id)
            .cloned()
    }

    /// Models that currently have at least one idle worker.
    pub async fn idle_models(&self) -> HashSet<String> {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.state == WorkerState::Idle)
            .map(|w| w.model_id.clone())
            .collect()
    }

    pub async fn mark_busy(&self, id: &str, batch_id: Uuid) {
        if let Some(worker) = self.workers.write().await.get_mut(id) {
            worker.state = WorkerState::Busy;
            worker.current_batch = Some(batch_id);
        }
    }

    pub async fn mark_idle(&self, id: &str) {
        if let Some(worker) = self.workers.write().await.get_mut(id) {
            worker.state = WorkerState::Idle;
            worker.current_batch = None;
            worker.last_heartbeat = Utc::now();
        }
    }

    /// Flag a surplus idle worker for termination.
    pub async fn mark_draining(&self, id: &str) -> bool {
        if let Some(worker) = self.workers.write().await.get_mut(id) {
            worker.state = WorkerState::Draining;
            true
        } else {
            false
        }
    }

    /// Declare a worker dead and remove it from the pool. The returned entry
    /// carries the `Dead` state for event reporting.
    pub async fn mark_dead(&self, id: &str) -> Option<WorkerEntry> {
        let mut entry = self.workers.write().await.remove(id)?;
        entry.state = WorkerState::Dead;
        Some(entry)
    }

    /// Remove a worker without declaring it dead (drain completion).
    pub async fn remove(&self, id: &str) -> Option<WorkerEntry> {
        self.workers.write().await.remove(id)
    }

    /// Workers flagged as draining.
    pub async fn draining(&self) -> Vec<WorkerEntry> {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.state == WorkerState::Draining)
            .cloned()
            .collect()
    }

    /// Number of workers serving a model (any non-dead state).
    pub async fn count_for_model(&self, model_id: &str) -> usize {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.model_id == model_id)
            .count()
    }

    /// Workers serving a model that are not on their way out.
    pub async fn active_for_model(&self, model_id: &str) -> usize {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| {
                w.model_id == model_id
                    && matches!(w.state, WorkerState::Idle | WorkerState::Busy)
            })
            .count()
    }

    /// Total worker count.
    pub async fn count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Remove idle workers whose last heartbeat is older than `timeout`.
    ///
    /// Busy workers are not reaped here: a worker stuck mid-batch is caught
    /// by the batch deadline instead, which also fails its requests. The same
    /// goes for a draining worker still finishing its last batch.
    pub async fn remove_stale(&self, timeout: Duration) -> Vec<WorkerEntry> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(timeout.as_millis() as i64);
        let mut removed = vec![];
        let mut workers = self.workers.write().await;

        workers.retain(|id, worker| {
            let reapable = worker.state == WorkerState::Idle
                || (worker.state == WorkerState::Draining && worker.current_batch.is_none());
            if reapable && worker.last_heartbeat < cutoff {
                tracing::warn!(worker_id = %id, model_id = %worker.model_id, "Removing stale worker");
                let mut entry = worker.clone();
                entry.state = WorkerState::Dead;
                removed.push(entry);
                false
            } else {
                true
            }
        });

        removed
    }
}
