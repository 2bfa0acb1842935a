//! Structured events emitted by the pipeline for observability.
//!
//! Events are broadcast to any number of subscribers (metrics, logging,
//! dashboards) and are never interpreted by the pipeline itself.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::prediction::RejectReason;
use crate::request::Priority;

/// An event emitted at a pipeline decision point.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A request was rejected at admission.
    RequestRejected {
        request_id: Uuid,
        client_id: String,
        reason: RejectReason,
        at: DateTime<Utc>,
    },
    /// A request's end-to-end deadline passed while it was still queued.
    RequestTimedOut {
        request_id: Uuid,
        model_id: String,
        at: DateTime<Utc>,
    },
    /// A request was canceled by its caller before dispatch.
    RequestCanceled {
        request_id: Uuid,
        model_id: String,
        at: DateTime<Utc>,
    },
    /// An open batch reached its size or wait threshold and was sealed.
    BatchSealed {
        batch_id: Uuid,
        model_id: String,
        priority: Priority,
        size: usize,
        waited_ms: u64,
        at: DateTime<Utc>,
    },
    /// A sealed batch was assigned to a worker.
    BatchDispatched {
        batch_id: Uuid,
        worker_id: String,
        model_id: String,
        size: usize,
        at: DateTime<Utc>,
    },
    /// A worker delivered results for a dispatched batch.
    BatchCompleted {
        batch_id: Uuid,
        worker_id: String,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
    /// A dispatched batch failed as a whole.
    BatchFailed {
        batch_id: Uuid,
        worker_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    /// A worker was spawned and joined the pool.
    WorkerSpawned {
        worker_id: String,
        model_id: String,
        at: DateTime<Utc>,
    },
    /// A worker was declared dead and removed from the pool.
    WorkerDead {
        worker_id: String,
        model_id: String,
        while_busy: bool,
        at: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tag() {
        let event = PipelineEvent::WorkerDead {
            worker_id: "worker-1".to_string(),
            model_id: "resnet50".to_string(),
            while_busy: true,
            at: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "worker_dead");
        assert_eq!(json["while_busy"], true);
    }

    #[test]
    fn test_batch_sealed_fields() {
        let event = PipelineEvent::BatchSealed {
            batch_id: Uuid::new_v4(),
            model_id: "resnet50".to_string(),
            priority: Priority::High,
            size: 8,
            waited_ms: 12,
            at: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "batch_sealed");
        assert_eq!(json["priority"], "high");
        assert_eq!(json["size"], 8);
    }
}
