//! vision-serve scheduling core.
//!
//! Sits between an API layer and a fixed pool of inference workers: admits or
//! rejects incoming classification requests, groups admitted requests into
//! model-efficient batches per (model, priority) bucket, dispatches sealed
//! batches to idle workers, and routes batch results back to per-request
//! callers — bounding latency per request and degrading gracefully under
//! overload and worker failure.
//!
//! The HTTP surface, model internals, and worker provisioning live behind the
//! [`ModelLoader`] / [`ModelEngine`] / [`WorkerLifecycle`] seams.

pub mod admission;
pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod policy;
pub mod pool;
pub mod router;
pub mod test_util;
pub mod worker;

pub use config::{AdmissionConfig, BatchingConfig, Config, DispatchConfig, ModelPoolConfig};
pub use engine::{EngineError, InferenceInput, ItemOutcome, ModelEngine, ModelLoader};
pub use error::{PipelineError, Result};
pub use policy::{DispatchPolicy, EscalatingPriority};
pub use worker::{LocalLifecycle, WorkerLifecycle};

pub use vision_serve_common::{
    Category, ClassifyRequest, FailureKind, Outcome, PipelineEvent, Prediction, Priority,
    RejectReason,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::batch::{BatchAssembler, BucketKey, QueuedRequest, ReadyQueue};
use crate::dispatcher::Dispatcher;
use crate::pool::WorkerPool;
use crate::router::ResultRouter;

/// Handle for one submitted request.
///
/// Awaiting the handle yields the request's terminal [`Outcome`]; exactly one
/// is produced per admitted request.
#[derive(Debug)]
pub struct RequestHandle {
    id: Uuid,
    model_id: String,
    deadline: Instant,
    rx: oneshot::Receiver<Outcome>,
}

impl RequestHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Wait for the terminal outcome, bounded by the request's end-to-end
    /// deadline.
    pub async fn outcome(self) -> Outcome {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        Self::wait(self.rx, remaining).await
    }

    /// Wait for the terminal outcome with a caller-supplied timeout.
    pub async fn outcome_within(self, timeout: Duration) -> Outcome {
        Self::wait(self.rx, timeout).await
    }

    async fn wait(rx: oneshot::Receiver<Outcome>, timeout: Duration) -> Outcome {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sink dropped without a result: the pipeline shut down.
            Ok(Err(_)) => Err(FailureKind::Canceled),
            Err(_) => Err(FailureKind::DeadlineExceeded),
        }
    }
}

/// A point-in-time view of pipeline load.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineStats {
    pub in_flight_requests: usize,
    pub open_requests: usize,
    pub ready_batches: usize,
    pub in_flight_batches: usize,
    pub workers: usize,
}

/// The assembled scheduling core.
pub struct Pipeline {
    config: Config,
    admission: Arc<AdmissionController>,
    assembler: Arc<BatchAssembler>,
    ready: Arc<ReadyQueue>,
    pool: Arc<WorkerPool>,
    router: Arc<ResultRouter>,
    dispatcher: Arc<Dispatcher>,
    lifecycle: Arc<dyn WorkerLifecycle>,
    events: broadcast::Sender<PipelineEvent>,
    shutdown: Arc<Notify>,
    accepting: AtomicBool,
}

impl Pipeline {
    /// Start the pipeline with in-process workers built from `loader`.
    pub async fn start(config: Config, loader: Arc<dyn ModelLoader>) -> Result<Self> {
        let lifecycle = Arc::new(LocalLifecycle::new(
            loader,
            config.dispatch.heartbeat_interval(),
        ));
        Self::with_lifecycle(config, lifecycle).await
    }

    /// Start with a custom worker lifecycle collaborator.
    pub async fn with_lifecycle(
        config: Config,
        lifecycle: Arc<dyn WorkerLifecycle>,
    ) -> Result<Self> {
        let policy = Arc::new(EscalatingPriority::new(config.batching.max_wait()));
        Self::with_policy(config, lifecycle, policy).await
    }

    /// Start with a custom dispatch ordering policy.
    pub async fn with_policy(
        config: Config,
        lifecycle: Arc<dyn WorkerLifecycle>,
        policy: Arc<dyn DispatchPolicy>,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(256);
        let ready = Arc::new(ReadyQueue::new());

        let batch_size_overrides: HashMap<String, u32> = config
            .models
            .iter()
            .filter_map(|m| m.max_batch_size.map(|size| (m.id.clone(), size)))
            .collect();
        let assembler = Arc::new(BatchAssembler::new(
            config.batching.max_wait(),
            config.batching.max_batch_size,
            batch_size_overrides,
            ready.clone(),
            events.clone(),
        ));

        let admission = Arc::new(AdmissionController::new(config.admission.clone()));
        let router = Arc::new(ResultRouter::new(admission.clone()));
        let pool = Arc::new(WorkerPool::new());

        let (reports_tx, reports_rx) = mpsc::channel(1024);
        let desired: HashMap<String, usize> = config
            .models
            .iter()
            .map(|m| (m.id.clone(), m.replicas))
            .collect();

        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatch.clone(),
            assembler.clone(),
            ready.clone(),
            pool.clone(),
            router.clone(),
            lifecycle.clone(),
            policy,
            events.clone(),
            reports_tx,
            desired,
        ));

        // Bring the pool to its configured size before accepting work.
        dispatcher.reconcile().await;
        let workers = pool.count().await;
        tracing::info!(workers, "Pipeline started");

        let shutdown = Arc::new(Notify::new());
        tokio::spawn(dispatcher.clone().run(reports_rx, shutdown.clone()));

        Ok(Self {
            config,
            admission,
            assembler,
            ready,
            pool,
            router,
            dispatcher,
            lifecycle,
            events,
            shutdown,
            accepting: AtomicBool::new(true),
        })
    }

    /// Submit a classification request.
    ///
    /// Returns a handle immediately on admission; the terminal outcome
    /// arrives through the handle. Rejections are synchronous and never
    /// enter the batching pipeline.
    pub async fn submit(&self, request: ClassifyRequest) -> Result<RequestHandle> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(PipelineError::ShuttingDown);
        }
        if !self.config.models.iter().any(|m| m.id == request.model_id) {
            return Err(PipelineError::UnknownModel(request.model_id));
        }

        if let Err(reason) = self
            .admission
            .admit(&request.client_id, request.payload.len())
            .await
        {
            tracing::debug!(
                client_id = %request.client_id,
                model_id = %request.model_id,
                reason = %reason,
                "Request rejected"
            );
            let _ = self.events.send(PipelineEvent::RequestRejected {
                request_id: Uuid::new_v4(),
                client_id: request.client_id,
                reason,
                at: Utc::now(),
            });
            return Err(PipelineError::Rejected(reason));
        }

        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let deadline = now + self.config.dispatch.request_deadline();

        let queued = QueuedRequest {
            id,
            client_id: request.client_id,
            model_id: request.model_id.clone(),
            payload: request.payload,
            content_type: request.content_type,
            submitted_at: now,
            deadline,
            response_tx: tx,
        };
        let key = BucketKey {
            model_id: request.model_id.clone(),
            priority: request.priority,
        };
        self.assembler.add(key, queued).await;

        Ok(RequestHandle {
            id,
            model_id: request.model_id,
            deadline,
            rx,
        })
    }

    /// Cancel a request that has not been dispatched yet.
    ///
    /// Returns `true` if the request was still open or sealed and is now
    /// resolved with [`FailureKind::Canceled`]; `false` once it is committed
    /// to a worker (the handle still receives a terminal outcome).
    pub async fn cancel(&self, handle: &RequestHandle) -> bool {
        let removed = match self.assembler.remove(handle.id).await {
            Some(request) => Some(request),
            None => self.ready.remove_request(handle.id).await,
        };

        match removed {
            Some(request) => {
                let _ = self.events.send(PipelineEvent::RequestCanceled {
                    request_id: request.id,
                    model_id: request.model_id.clone(),
                    at: Utc::now(),
                });
                self.router
                    .fail_queued(vec![request], FailureKind::Canceled)
                    .await;
                true
            }
            None => false,
        }
    }

    /// Subscribe to structured pipeline events.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Change the worker target for a configured model; reconciliation
    /// spawns or drains workers to match.
    pub async fn scale_to(&self, model_id: &str, replicas: usize) -> Result<()> {
        if !self.config.models.iter().any(|m| m.id == model_id) {
            return Err(PipelineError::UnknownModel(model_id.to_string()));
        }
        self.dispatcher.set_desired(model_id, replicas).await;
        Ok(())
    }

    /// Current load snapshot.
    pub async fn stats(&self) -> PipelineStats {
        PipelineStats {
            in_flight_requests: self.admission.in_flight().await,
            open_requests: self.assembler.pending_count().await,
            ready_batches: self.ready.len().await,
            in_flight_batches: self.dispatcher.in_flight_batches().await,
            workers: self.pool.count().await,
        }
    }

    /// Stop accepting work, resolve everything outstanding with
    /// [`FailureKind::Canceled`], and tear down the workers.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();

        let mut outstanding = self.assembler.drain_all().await;
        outstanding.extend(self.ready.drain_all().await);
        self.router
            .fail_queued(outstanding, FailureKind::Canceled)
            .await;
        self.dispatcher.fail_in_flight(FailureKind::Canceled).await;

        for worker in self.pool.all().await {
            self.pool.remove(&worker.id).await;
            self.lifecycle.terminate_worker(&worker.id).await;
        }

        tracing::info!("Pipeline shut down");
    }
}
