//! Request batching for the pipeline.
//!
//! The assembler collects admitted requests into one open batch per
//! (model, priority) bucket and seals batches by size or age. Sealed batches
//! move to the ready queue, where they wait for an idle worker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{broadcast, oneshot, Mutex, Notify, RwLock};
use uuid::Uuid;

use vision_serve_common::{Outcome, PipelineEvent, Priority};

use crate::engine::InferenceInput;
use crate::policy::DispatchPolicy;

/// A request that passed admission and is waiting to be dispatched.
pub struct QueuedRequest {
    pub id: Uuid,
    pub client_id: String,
    pub model_id: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    /// When the request was admitted.
    pub submitted_at: Instant,
    /// End-to-end deadline; past this the request fails without dispatch.
    pub deadline: Instant,
    /// Channel to deliver the terminal outcome back to the caller.
    pub response_tx: oneshot::Sender<Outcome>,
}

/// The caller-facing remainder of a request once its payload has been handed
/// to a worker. Held in the dispatcher's in-flight table so a hung worker can
/// never strand a result sink.
pub struct PendingRequest {
    pub id: Uuid,
    pub client_id: String,
    pub submitted_at: Instant,
    pub deadline: Instant,
    pub response_tx: oneshot::Sender<Outcome>,
}

impl QueuedRequest {
    /// Split into the payload sent to the worker and the caller-facing rest.
    pub fn into_parts(self) -> (InferenceInput, PendingRequest) {
        let input = InferenceInput {
            request_id: self.id,
            payload: self.payload,
            content_type: self.content_type,
        };
        let pending = PendingRequest {
            id: self.id,
            client_id: self.client_id,
            submitted_at: self.submitted_at,
            deadline: self.deadline,
            response_tx: self.response_tx,
        };
        (input, pending)
    }

    /// Discard the payload, keeping only the caller-facing part.
    pub fn into_pending(self) -> PendingRequest {
        self.into_parts().1
    }
}

/// The (model, priority) partition that owns one open batch at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub model_id: String,
    pub priority: Priority,
}

/// A sealed batch waiting for, or assigned to, a worker.
pub struct Batch {
    pub id: Uuid,
    pub model_id: String,
    pub priority: Priority,
    /// Insertion order is fairness order; workers process it positionally.
    pub requests: Vec<QueuedRequest>,
    /// When the first request entered the batch.
    pub opened_at: Instant,
    pub sealed_at: Instant,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.duration_since(self.opened_at)
    }
}

/// Per-bucket open batch holding pending requests.
struct OpenBucket {
    requests: Vec<QueuedRequest>,
    opened_at: Option<Instant>,
}

impl OpenBucket {
    fn new() -> Self {
        Self {
            requests: Vec::new(),
            opened_at: None,
        }
    }

    fn push(&mut self, request: QueuedRequest) {
        if self.requests.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.requests.push(request);
    }

    fn age(&self, now: Instant) -> Option<std::time::Duration> {
        self.opened_at.map(|t| now.duration_since(t))
    }

    /// Take everything, leaving the bucket empty and re-openable.
    fn drain(&mut self) -> (Vec<QueuedRequest>, Instant) {
        let opened_at = self.opened_at.take().unwrap_or_else(Instant::now);
        (std::mem::take(&mut self.requests), opened_at)
    }
}

/// Collects admitted requests into bounded-size, bounded-wait batches.
pub struct BatchAssembler {
    max_wait: std::time::Duration,
    default_batch_size: u32,
    batch_size_overrides: HashMap<String, u32>,
    buckets: RwLock<HashMap<BucketKey, OpenBucket>>,
    ready: Arc<ReadyQueue>,
    events: broadcast::Sender<PipelineEvent>,
}

impl BatchAssembler {
    pub fn new(
        max_wait: std::time::Duration,
        default_batch_size: u32,
        batch_size_overrides: HashMap<String, u32>,
        ready: Arc<ReadyQueue>,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            max_wait,
            default_batch_size,
            batch_size_overrides,
            buckets: RwLock::new(HashMap::new()),
            ready,
            events,
        }
    }

    fn batch_size_for(&self, model_id: &str) -> usize {
        self.batch_size_overrides
            .get(model_id)
            .copied()
            .unwrap_or(self.default_batch_size)
            .max(1) as usize
    }

    /// Append a request to its bucket's open batch, sealing immediately if
    /// the batch reached the configured size.
    pub async fn add(&self, key: BucketKey, request: QueuedRequest) {
        let max_size = self.batch_size_for(&key.model_id);
        let sealed = {
            let mut buckets = self.buckets.write().await;
            let bucket = buckets.entry(key.clone()).or_insert_with(OpenBucket::new);
            bucket.push(request);

            if bucket.requests.len() >= max_size {
                Some(self.seal_bucket(&key, bucket))
            } else {
                None
            }
        };

        if let Some(batch) = sealed {
            self.ready.push(batch).await;
        }
    }

    /// Seal every non-empty bucket whose open batch aged past max-wait, so
    /// low-traffic buckets do not starve.
    pub async fn seal_expired(&self) {
        let now = Instant::now();
        let mut sealed = Vec::new();
        {
            let mut buckets = self.buckets.write().await;
            for (key, bucket) in buckets.iter_mut() {
                if bucket.requests.is_empty() {
                    continue;
                }
                if bucket.age(now).is_some_and(|age| age >= self.max_wait) {
                    sealed.push(self.seal_bucket(key, bucket));
                }
            }
        }

        for batch in sealed {
            self.ready.push(batch).await;
        }
    }

    fn seal_bucket(&self, key: &BucketKey, bucket: &mut OpenBucket) -> Batch {
        let (requests, opened_at) = bucket.drain();
        let sealed_at = Instant::now();
        let batch = Batch {
            id: Uuid::new_v4(),
            model_id: key.model_id.clone(),
            priority: key.priority,
            requests,
            opened_at,
            sealed_at,
        };

        tracing::debug!(
            batch_id = %batch.id,
            model_id = %batch.model_id,
            priority = %batch.priority,
            size = batch.len(),
            "Sealed batch"
        );
        let _ = self.events.send(PipelineEvent::BatchSealed {
            batch_id: batch.id,
            model_id: batch.model_id.clone(),
            priority: batch.priority,
            size: batch.len(),
            waited_ms: sealed_at.duration_since(opened_at).as_millis() as u64,
            at: Utc::now(),
        });

        batch
    }

    /// Remove a request from its open batch (cancellation before sealing).
    pub async fn remove(&self, request_id: Uuid) -> Option<QueuedRequest> {
        let mut buckets = self.buckets.write().await;
        for bucket in buckets.values_mut() {
            if let Some(pos) = bucket.requests.iter().position(|r| r.id == request_id) {
                let request = bucket.requests.remove(pos);
                if bucket.requests.is_empty() {
                    bucket.opened_at = None;
                }
                return Some(request);
            }
        }
        None
    }

    /// Extract every open request whose end-to-end deadline has passed,
    /// leaving its batch siblings untouched.
    pub async fn sweep_deadlines(&self, now: Instant) -> Vec<QueuedRequest> {
        let mut expired = Vec::new();
        let mut buckets = self.buckets.write().await;
        for bucket in buckets.values_mut() {
            let mut i = 0;
            while i < bucket.requests.len() {
                if bucket.requests[i].deadline <= now {
                    expired.push(bucket.requests.remove(i));
                } else {
                    i += 1;
                }
            }
            if bucket.requests.is_empty() {
                bucket.opened_at = None;
            }
        }
        expired
    }

    /// Number of requests waiting in open batches.
    pub async fn pending_count(&self) -> usize {
        let buckets = self.buckets.read().await;
        buckets.values().map(|b| b.requests.len()).sum()
    }

    /// Remove every open request (shutdown path).
    pub async fn drain_all(&self) -> Vec<QueuedRequest> {
        let mut buckets = self.buckets.write().await;
        let mut all = Vec::new();
        for bucket in buckets.values_mut() {
            let (requests, _) = bucket.drain();
            all.extend(requests);
        }
        all
    }
}

/// Sealed batches ordered for dispatch by a pluggable policy.
pub struct ReadyQueue {
    batches: Mutex<Vec<Batch>>,
    notify: Arc<Notify>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Get a reference to the notifier for waiting on newly sealed batches.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub async fn push(&self, batch: Batch) {
        self.batches.lock().await.push(batch);
        self.notify.notify_one();
    }

    /// Put a batch back without waking the dispatcher (no worker freed up).
    pub async fn requeue(&self, batch: Batch) {
        self.batches.lock().await.push(batch);
    }

    /// Take the highest-precedence batch whose model has an idle worker.
    pub async fn take_next(
        &self,
        policy: &dyn DispatchPolicy,
        now: Instant,
        idle_models: &HashSet<String>,
    ) -> Option<Batch> {
        let mut batches = self.batches.lock().await;
        let best = batches
            .iter()
            .enumerate()
            .filter(|(_, b)| idle_models.contains(&b.model_id))
            .min_by(|(_, a), (_, b)| policy.compare(a, b, now))
            .map(|(i, _)| i)?;
        Some(batches.remove(best))
    }

    /// Remove a request from a sealed-but-undispatched batch.
    pub async fn remove_request(&self, request_id: Uuid) -> Option<QueuedRequest> {
        let mut batches = self.batches.lock().await;
        for i in 0..batches.len() {
            if let Some(pos) = batches[i].requests.iter().position(|r| r.id == request_id) {
                let request = batches[i].requests.remove(pos);
                if batches[i].is_empty() {
                    batches.remove(i);
                }
                return Some(request);
            }
        }
        None
    }

    /// Extract sealed requests whose deadline has passed; drained batches are
    /// dropped from the queue.
    pub async fn sweep_deadlines(&self, now: Instant) -> Vec<QueuedRequest> {
        let mut expired = Vec::new();
        let mut batches = self.batches.lock().await;
        for batch in batches.iter_mut() {
            let mut i = 0;
            while i < batch.requests.len() {
                if batch.requests[i].deadline <= now {
                    expired.push(batch.requests.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        batches.retain(|b| !b.is_empty());
        expired
    }

    pub async fn len(&self) -> usize {
        self.batches.lock().await.len()
    }

    /// Remove every sealed request (shutdown path).
    pub async fn drain_all(&self) -> Vec<QueuedRequest> {
        let mut batches = self.batches.lock().await;
        batches.drain(..).flat_map(|b| b.requests).collect()
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}
