//! Batch dispatcher: the single task that pairs ready batches with idle
//! workers and supervises everything in flight.
//!
//! The dispatcher owns all worker state transitions and the in-flight table,
//! so batch/worker bookkeeping never races. Workers talk back over one
//! report channel; payloads go out, result sinks stay here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use uuid::Uuid;

use vision_serve_common::{FailureKind, PipelineEvent};

use crate::batch::{Batch, BatchAssembler, PendingRequest, ReadyQueue};
use crate::config::DispatchConfig;
use crate::policy::DispatchPolicy;
use crate::pool::{WorkerEntry, WorkerPool, WorkerState};
use crate::router::ResultRouter;
use crate::worker::{WorkerJob, WorkerLifecycle, WorkerReport};

/// A batch handed to a worker, with its result sinks and completion deadline.
struct DispatchedBatch {
    worker_id: String,
    model_id: String,
    requests: Vec<PendingRequest>,
    dispatched_at: Instant,
    deadline: Instant,
}

/// Pairs sealed batches with idle workers and supervises in-flight work.
pub struct Dispatcher {
    config: DispatchConfig,
    assembler: Arc<BatchAssembler>,
    ready: Arc<ReadyQueue>,
    pool: Arc<WorkerPool>,
    router: Arc<ResultRouter>,
    lifecycle: Arc<dyn WorkerLifecycle>,
    policy: Arc<dyn DispatchPolicy>,
    events: broadcast::Sender<PipelineEvent>,
    /// Cloned into every spawned worker.
    reports_tx: mpsc::Sender<WorkerReport>,
    /// Target worker count per model; reconciled every tick.
    desired: RwLock<HashMap<String, usize>>,
    in_flight: Mutex<HashMap<Uuid, DispatchedBatch>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatchConfig,
        assembler: Arc<BatchAssembler>,
        ready: Arc<ReadyQueue>,
        pool: Arc<WorkerPool>,
        router: Arc<ResultRouter>,
        lifecycle: Arc<dyn WorkerLifecycle>,
        policy: Arc<dyn DispatchPolicy>,
        events: broadcast::Sender<PipelineEvent>,
        reports_tx: mpsc::Sender<WorkerReport>,
        desired: HashMap<String, usize>,
    ) -> Self {
        Self {
            config,
            assembler,
            ready,
            pool,
            router,
            lifecycle,
            policy,
            events,
            reports_tx,
            desired: RwLock::new(desired),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run the dispatch loop until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut reports: mpsc::Receiver<WorkerReport>,
        shutdown: Arc<Notify>,
    ) {
        let ready_notify = self.ready.notifier();
        let mut tick = tokio::time::interval(self.config.tick());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                report = reports.recv() => match report {
                    Some(report) => self.handle_report(report).await,
                    None => break,
                },
                _ = ready_notify.notified() => {}
                _ = tick.tick() => self.housekeeping().await,
            }

            self.dispatch_ready().await;
        }

        tracing::debug!("Dispatch loop stopped");
    }

    /// Change the target worker count for a model.
    pub async fn set_desired(&self, model_id: &str, replicas: usize) {
        self.desired
            .write()
            .await
            .insert(model_id.to_string(), replicas);
    }

    /// Number of batches currently running on workers.
    pub async fn in_flight_batches(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Resolve every dispatched batch with the given kind (shutdown path).
    pub(crate) async fn fail_in_flight(&self, kind: FailureKind) {
        let drained: Vec<DispatchedBatch> = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.drain().map(|(_, d)| d).collect()
        };
        for dispatched in drained {
            self.router
                .fail_pending(dispatched.requests, kind.clone())
                .await;
        }
    }

    async fn handle_report(&self, report: WorkerReport) {
        match report {
            WorkerReport::Heartbeat { worker_id } => {
                self.pool.heartbeat(&worker_id).await;
            }
            WorkerReport::Completed {
                worker_id,
                batch_id,
                results,
                duration,
            } => {
                let dispatched = self.in_flight.lock().await.remove(&batch_id);
                let Some(dispatched) = dispatched else {
                    // The worker was already declared dead and its batch
                    // failed; a late result must not be delivered twice.
                    tracing::warn!(
                        worker_id = %worker_id,
                        batch_id = %batch_id,
                        "Dropping completion for unknown batch"
                    );
                    return;
                };

                tracing::debug!(
                    batch_id = %batch_id,
                    worker_id = %worker_id,
                    total_ms = dispatched.dispatched_at.elapsed().as_millis() as u64,
                    "Batch finished"
                );

                match results {
                    Ok(items) => {
                        self.router
                            .deliver(&dispatched.model_id, dispatched.requests, items, duration)
                            .await;
                        let _ = self.events.send(PipelineEvent::BatchCompleted {
                            batch_id,
                            worker_id: worker_id.clone(),
                            duration_ms: duration.as_millis() as u64,
                            at: Utc::now(),
                        });
                    }
                    Err(err) => {
                        tracing::warn!(
                            batch_id = %batch_id,
                            worker_id = %worker_id,
                            error = %err,
                            "Model failed the whole batch"
                        );
                        self.router
                            .fail_pending(
                                dispatched.requests,
                                FailureKind::Model {
                                    message: err.to_string(),
                                },
                            )
                            .await;
                        let _ = self.events.send(PipelineEvent::BatchFailed {
                            batch_id,
                            worker_id: worker_id.clone(),
                            reason: err.to_string(),
                            at: Utc::now(),
                        });
                    }
                }

                // Idle is reported only after results are delivered.
                match self.pool.get(&worker_id).await {
                    Some(worker) if worker.state == WorkerState::Draining => {
                        self.pool.remove(&worker_id).await;
                        self.lifecycle.terminate_worker(&worker_id).await;
                    }
                    Some(_) => self.pool.mark_idle(&worker_id).await,
                    None => {}
                }
            }
        }
    }

    /// Periodic supervision: age-based sealing, deadline sweeps, worker
    /// timeouts, stale-heartbeat reaping, and pool reconciliation.
    async fn housekeeping(&self) {
        let now = Instant::now();

        self.assembler.seal_expired().await;

        let mut expired = self.assembler.sweep_deadlines(now).await;
        expired.extend(self.ready.sweep_deadlines(now).await);
        if !expired.is_empty() {
            for request in &expired {
                let _ = self.events.send(PipelineEvent::RequestTimedOut {
                    request_id: request.id,
                    model_id: request.model_id.clone(),
                    at: Utc::now(),
                });
            }
            self.router
                .fail_queued(expired, FailureKind::DeadlineExceeded)
                .await;
        }

        self.fail_timed_out_batches(now).await;

        for dead in self
            .pool
            .remove_stale(self.config.heartbeat_timeout())
            .await
        {
            tracing::warn!(worker_id = %dead.id, model_id = %dead.model_id, "Idle worker missed heartbeats");
            let _ = self.events.send(PipelineEvent::WorkerDead {
                worker_id: dead.id.clone(),
                model_id: dead.model_id.clone(),
                while_busy: false,
                at: Utc::now(),
            });
            self.lifecycle.terminate_worker(&dead.id).await;
        }

        // Draining workers with nothing left to finish can go now.
        for worker in self.pool.draining().await {
            if worker.current_batch.is_none() {
                self.pool.remove(&worker.id).await;
                self.lifecycle.terminate_worker(&worker.id).await;
            }
        }

        self.reconcile().await;
    }

    /// Fail every dispatched batch past its latency budget and declare its
    /// worker dead. The batch is never retried; resubmission is up to the
    /// caller.
    async fn fail_timed_out_batches(&self, now: Instant) {
        let timed_out: Vec<(Uuid, DispatchedBatch)> = {
            let mut in_flight = self.in_flight.lock().await;
            let ids: Vec<Uuid> = in_flight
                .iter()
                .filter(|(_, d)| d.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| in_flight.remove(&id).map(|d| (id, d)))
                .collect()
        };

        for (batch_id, dispatched) in timed_out {
            tracing::error!(
                batch_id = %batch_id,
                worker_id = %dispatched.worker_id,
                model_id = %dispatched.model_id,
                "Worker missed batch deadline, declaring it dead"
            );

            if let Some(dead) = self.pool.mark_dead(&dispatched.worker_id).await {
                let _ = self.events.send(PipelineEvent::WorkerDead {
                    worker_id: dead.id,
                    model_id: dead.model_id,
                    while_busy: true,
                    at: Utc::now(),
                });
            }
            self.lifecycle.terminate_worker(&dispatched.worker_id).await;

            let _ = self.events.send(PipelineEvent::BatchFailed {
                batch_id,
                worker_id: dispatched.worker_id.clone(),
                reason: "worker timeout".to_string(),
                at: Utc::now(),
            });
            self.router
                .fail_pending(dispatched.requests, FailureKind::WorkerTimeout)
                .await;
        }
    }

    /// Spawn replacements up to each model's target and drain any surplus.
    pub(crate) async fn reconcile(&self) {
        let desired = self.desired.read().await.clone();

        for (model_id, target) in desired {
            let active = self.pool.active_for_model(&model_id).await;

            if active < target {
                for _ in active..target {
                    match self
                        .lifecycle
                        .spawn_worker(&model_id, self.reports_tx.clone())
                        .await
                    {
                        Ok(entry) => {
                            tracing::info!(worker_id = %entry.id, model_id = %model_id, "Spawned worker");
                            let _ = self.events.send(PipelineEvent::WorkerSpawned {
                                worker_id: entry.id.clone(),
                                model_id: model_id.clone(),
                                at: Utc::now(),
                            });
                            self.pool.register(entry).await;
                        }
                        Err(err) => {
                            tracing::error!(model_id = %model_id, error = %err, "Failed to spawn worker");
                            break;
                        }
                    }
                }
            } else if active > target {
                let mut surplus = active - target;
                let workers = self.pool.all().await;
                // Prefer draining idle workers; busy ones finish their batch
                // first.
                for state in [WorkerState::Idle, WorkerState::Busy] {
                    for worker in workers
                        .iter()
                        .filter(|w| w.model_id == model_id && w.state == state)
                    {
                        if surplus == 0 {
                            break;
                        }
                        self.pool.mark_draining(&worker.id).await;
                        surplus -= 1;
                    }
                }
            }
        }
    }

    /// Assign ready batches to idle workers until no pairing is possible.
    async fn dispatch_ready(&self) {
        loop {
            let idle_models = self.pool.idle_models().await;
            if idle_models.is_empty() {
                return;
            }

            let now = Instant::now();
            let Some(batch) = self
                .ready
                .take_next(self.policy.as_ref(), now, &idle_models)
                .await
            else {
                return;
            };

            let Some(worker) = self.pool.idle_for_model(&batch.model_id).await else {
                self.ready.requeue(batch).await;
                return;
            };

            self.dispatch_batch(batch, worker).await;
        }
    }

    async fn dispatch_batch(&self, batch: Batch, worker: WorkerEntry) {
        let batch_id = batch.id;
        let model_id = batch.model_id.clone();
        let deadline = batch.opened_at + self.config.batch_latency_budget();

        let mut inputs = Vec::with_capacity(batch.requests.len());
        let mut pending = Vec::with_capacity(batch.requests.len());
        for request in batch.requests {
            let (input, rest) = request.into_parts();
            inputs.push(input);
            pending.push(rest);
        }
        let size = inputs.len();

        let job = WorkerJob::Run { batch_id, inputs };
        if worker.jobs.send(job).await.is_err() {
            tracing::error!(
                worker_id = %worker.id,
                batch_id = %batch_id,
                "Worker task is gone, failing batch"
            );
            if let Some(dead) = self.pool.mark_dead(&worker.id).await {
                let _ = self.events.send(PipelineEvent::WorkerDead {
                    worker_id: dead.id,
                    model_id: dead.model_id,
                    while_busy: false,
                    at: Utc::now(),
                });
            }
            self.lifecycle.terminate_worker(&worker.id).await;
            self.router
                .fail_pending(pending, FailureKind::WorkerTimeout)
                .await;
            return;
        }

        self.pool.mark_busy(&worker.id, batch_id).await;
        self.in_flight.lock().await.insert(
            batch_id,
            DispatchedBatch {
                worker_id: worker.id.clone(),
                model_id: model_id.clone(),
                requests: pending,
                dispatched_at: Instant::now(),
                deadline,
            },
        );

        tracing::info!(
            batch_id = %batch_id,
            worker_id = %worker.id,
            model_id = %model_id,
            size = size,
            "Dispatched batch"
        );
        let _ = self.events.send(PipelineEvent::BatchDispatched {
            batch_id,
            worker_id: worker.id,
            model_id,
            size,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::batch::{BucketKey, QueuedRequest};
    use crate::config::{AdmissionConfig, BatchingConfig};
    use crate::policy::EscalatingPriority;
    use crate::test_util::{MockEngine, StaticLoader};
    use crate::worker::LocalLifecycle;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use vision_serve_common::{Outcome, Priority};

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        assembler: Arc<BatchAssembler>,
        ready: Arc<ReadyQueue>,
        pool: Arc<WorkerPool>,
        admission: Arc<AdmissionController>,
        reports_tx: mpsc::Sender<WorkerReport>,
    }

    fn create_harness() -> Harness {
        let (events, _) = broadcast::channel(64);
        let ready = Arc::new(ReadyQueue::new());
        let batching = BatchingConfig::default();
        let assembler = Arc::new(BatchAssembler::new(
            batching.max_wait(),
            batching.max_batch_size,
            HashMap::new(),
            ready.clone(),
            events.clone(),
        ));
        let pool = Arc::new(WorkerPool::new());
        let admission = Arc::new(AdmissionController::new(AdmissionConfig::default()));
        let router = Arc::new(ResultRouter::new(admission.clone()));
        let engine = Arc::new(MockEngine::new("resnet50"));
        let lifecycle = Arc::new(LocalLifecycle::new(
            Arc::new(StaticLoader::single(engine)),
            Duration::from_millis(100),
        ));
        let policy = Arc::new(EscalatingPriority::new(batching.max_wait()));
        let (reports_tx, _reports_rx) = mpsc::channel(64);

        let dispatcher = Arc::new(Dispatcher::new(
            DispatchConfig::default(),
            assembler.clone(),
            ready.clone(),
            pool.clone(),
            router,
            lifecycle,
            policy,
            events,
            reports_tx.clone(),
            HashMap::new(),
        ));

        Harness {
            dispatcher,
            assembler,
            ready,
            pool,
            admission,
            reports_tx,
        }
    }

    async fn queued_request(
        harness: &Harness,
        model_id: &str,
    ) -> (QueuedRequest, oneshot::Receiver<Outcome>) {
        harness.admission.admit("client-1", 16).await.unwrap();
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let request = QueuedRequest {
            id: Uuid::new_v4(),
            client_id: "client-1".to_string(),
            model_id: model_id.to_string(),
            payload: vec![1u8; 16],
            content_type: "image/jpeg".to_string(),
            submitted_at: now,
            deadline: now + Duration::from_secs(5),
            response_tx: tx,
        };
        (request, rx)
    }

    fn idle_worker(id: &str, model_id: &str) -> (WorkerEntry, mpsc::Receiver<WorkerJob>) {
        let (tx, rx) = mpsc::channel(1);
        let now = Utc::now();
        let entry = WorkerEntry {
            id: id.to_string(),
            model_id: model_id.to_string(),
            state: WorkerState::Idle,
            spawned_at: now,
            last_heartbeat: now,
            current_batch: None,
            jobs: tx,
        };
        (entry, rx)
    }

    #[tokio::test]
    async fn test_dispatch_pairs_batch_with_idle_worker() {
        let harness = create_harness();
        let (worker, mut jobs_rx) = idle_worker("worker-1", "resnet50");
        harness.pool.register(worker).await;

        let (request, _rx) = queued_request(&harness, "resnet50").await;
        let key = BucketKey {
            model_id: "resnet50".to_string(),
            priority: Priority::Normal,
        };
        harness.assembler.add(key, request).await;
        harness.assembler.seal_expired().await; // not old enough yet
        assert_eq!(harness.ready.len().await, 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        harness.assembler.seal_expired().await;
        assert_eq!(harness.ready.len().await, 1);

        harness.dispatcher.dispatch_ready().await;

        let job = jobs_rx.recv().await.unwrap();
        assert!(matches!(job, WorkerJob::Run { .. }));
        assert_eq!(
            harness.pool.get("worker-1").await.unwrap().state,
            WorkerState::Busy
        );
        assert_eq!(harness.dispatcher.in_flight_batches().await, 1);
    }

    #[tokio::test]
    async fn test_no_dispatch_without_matching_model() {
        let harness = create_harness();
        let (worker, mut jobs_rx) = idle_worker("worker-1", "mobilenet");
        harness.pool.register(worker).await;

        let (request, _rx) = queued_request(&harness, "resnet50").await;
        let key = BucketKey {
            model_id: "resnet50".to_string(),
            priority: Priority::High,
        };
        harness.assembler.add(key, request).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        harness.assembler.seal_expired().await;

        harness.dispatcher.dispatch_ready().await;

        assert!(jobs_rx.try_recv().is_err());
        assert_eq!(harness.ready.len().await, 1);
    }

    #[tokio::test]
    async fn test_worker_timeout_fails_batch_and_removes_worker() {
        let harness = create_harness();
        let (worker, _jobs_rx) = idle_worker("worker-1", "resnet50");
        harness.pool.register(worker).await;
        harness.pool.mark_busy("worker-1", Uuid::new_v4()).await;

        let (request, rx) = queued_request(&harness, "resnet50").await;
        let batch_id = Uuid::new_v4();
        harness.dispatcher.in_flight.lock().await.insert(
            batch_id,
            DispatchedBatch {
                worker_id: "worker-1".to_string(),
                model_id: "resnet50".to_string(),
                requests: vec![request.into_pending()],
                dispatched_at: Instant::now(),
                deadline: Instant::now() - Duration::from_millis(1),
            },
        );

        harness
            .dispatcher
            .fail_timed_out_batches(Instant::now())
            .await;

        assert_eq!(rx.await.unwrap(), Err(FailureKind::WorkerTimeout));
        assert!(harness.pool.get("worker-1").await.is_none());
        assert_eq!(harness.dispatcher.in_flight_batches().await, 0);
        assert_eq!(harness.admission.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_late_completion_is_dropped() {
        let harness = create_harness();

        harness
            .dispatcher
            .handle_report(WorkerReport::Completed {
                worker_id: "worker-1".to_string(),
                batch_id: Uuid::new_v4(),
                results: Ok(vec![]),
                duration: Duration::ZERO,
            })
            .await;

        // Nothing to assert beyond "did not panic": the batch is unknown and
        // its results are discarded.
        drop(harness.reports_tx);
    }

    #[tokio::test]
    async fn test_reconcile_spawns_to_target() {
        let harness = create_harness();
        harness.dispatcher.set_desired("resnet50", 2).await;

        harness.dispatcher.reconcile().await;

        assert_eq!(harness.pool.count_for_model("resnet50").await, 2);
        assert!(harness.pool.idle_for_model("resnet50").await.is_some());
    }

    #[tokio::test]
    async fn test_reconcile_drains_surplus() {
        let harness = create_harness();
        harness.dispatcher.set_desired("resnet50", 2).await;
        harness.dispatcher.reconcile().await;
        assert_eq!(harness.pool.active_for_model("resnet50").await, 2);

        harness.dispatcher.set_desired("resnet50", 1).await;
        harness.dispatcher.reconcile().await;

        assert_eq!(harness.pool.active_for_model("resnet50").await, 1);
        assert_eq!(harness.pool.draining().await.len(), 1);
    }
}
