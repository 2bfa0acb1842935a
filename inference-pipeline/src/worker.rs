//! Worker tasks and the worker lifecycle collaborator.
//!
//! Each worker task wraps exactly one loaded model and processes one batch at
//! a time; between batches it emits heartbeats so the dispatcher can tell an
//! idle worker from a dead one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::engine::{EngineError, InferenceInput, ItemOutcome, ModelEngine, ModelLoader};
use crate::pool::{WorkerEntry, WorkerState};

/// A unit of work sent to a worker task.
#[derive(Debug)]
pub enum WorkerJob {
    /// Run inference over a dispatched batch's inputs.
    Run {
        batch_id: Uuid,
        inputs: Vec<InferenceInput>,
    },
}

/// Messages from worker tasks back to the dispatcher.
#[derive(Debug)]
pub enum WorkerReport {
    /// Periodic liveness signal while idle.
    Heartbeat { worker_id: String },
    /// A batch finished, successfully or not.
    Completed {
        worker_id: String,
        batch_id: Uuid,
        results: Result<Vec<ItemOutcome>, EngineError>,
        duration: Duration,
    },
}

/// Worker task loop: one job at a time, heartbeats in between.
///
/// The job channel has capacity one and the dispatcher only offers work to
/// idle workers, so a second batch can never queue up behind a running one.
pub async fn run_worker(
    worker_id: String,
    engine: Arc<dyn ModelEngine>,
    mut jobs: mpsc::Receiver<WorkerJob>,
    reports: mpsc::Sender<WorkerReport>,
    heartbeat_interval: Duration,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            job = jobs.recv() => match job {
                Some(WorkerJob::Run { batch_id, inputs }) => {
                    let started = Instant::now();
                    let results = engine.predict(&inputs).await;
                    let report = WorkerReport::Completed {
                        worker_id: worker_id.clone(),
                        batch_id,
                        results,
                        duration: started.elapsed(),
                    };
                    if reports.send(report).await.is_err() {
                        return;
                    }
                }
                None => {
                    tracing::debug!(worker_id = %worker_id, "Job channel closed, worker exiting");
                    return;
                }
            },
            _ = heartbeat.tick() => {
                let report = WorkerReport::Heartbeat {
                    worker_id: worker_id.clone(),
                };
                if reports.send(report).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Collaborator that provisions and tears down workers.
///
/// The pipeline decides when a worker is spawned or terminated; how the
/// underlying execution unit is provisioned (in-process task, subprocess,
/// container) is up to the implementation.
#[async_trait]
pub trait WorkerLifecycle: Send + Sync {
    /// Provision a worker for `model_id` that sends its reports to `reports`.
    async fn spawn_worker(
        &self,
        model_id: &str,
        reports: mpsc::Sender<WorkerReport>,
    ) -> Result<WorkerEntry, EngineError>;

    /// Tear down a worker. Must stop a worker stuck mid-batch.
    async fn terminate_worker(&self, worker_id: &str);
}

/// In-process lifecycle: loads the model and runs the worker as a tokio task.
pub struct LocalLifecycle {
    loader: Arc<dyn ModelLoader>,
    heartbeat_interval: Duration,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl LocalLifecycle {
    pub fn new(loader: Arc<dyn ModelLoader>, heartbeat_interval: Duration) -> Self {
        Self {
            loader,
            heartbeat_interval,
            tasks: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl WorkerLifecycle for LocalLifecycle {
    async fn spawn_worker(
        &self,
        model_id: &str,
        reports: mpsc::Sender<WorkerReport>,
    ) -> Result<WorkerEntry, EngineError> {
        let engine = self.loader.load(model_id).await?;
        let worker_id = format!("{}-{}", model_id, &Uuid::new_v4().simple().to_string()[..8]);

        let (jobs_tx, jobs_rx) = mpsc::channel(1);
        let task = tokio::spawn(run_worker(
            worker_id.clone(),
            engine,
            jobs_rx,
            reports,
            self.heartbeat_interval,
        ));
        self.tasks.lock().await.insert(worker_id.clone(), task);

        let now = Utc::now();
        Ok(WorkerEntry {
            id: worker_id,
            model_id: model_id.to_string(),
            state: WorkerState::Idle,
            spawned_at: now,
            last_heartbeat: now,
            current_batch: None,
            jobs: jobs_tx,
        })
    }

    async fn terminate_worker(&self, worker_id: &str) {
        if let Some(task) = self.tasks.lock().await.remove(worker_id) {
            task.abort();
        }
    }
}
