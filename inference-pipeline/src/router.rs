//! Result routing: correlate batch completions back to per-request callers.

use std::sync::Arc;
use std::time::Duration;

use vision_serve_common::{FailureKind, Outcome, Prediction};

use crate::admission::AdmissionController;
use crate::batch::{PendingRequest, QueuedRequest};
use crate::engine::ItemOutcome;

/// Writes terminal outcomes into request sinks, exactly once each, and
/// releases admission capacity as requests leave the pipeline.
pub struct ResultRouter {
    admission: Arc<AdmissionController>,
}

impl ResultRouter {
    pub fn new(admission: Arc<AdmissionController>) -> Self {
        Self { admission }
    }

    /// Deliver a completed batch's results to the originating callers.
    ///
    /// The result list must be positionally aligned with the batch requests;
    /// on a length mismatch every request fails with a contract error rather
    /// than risking misaligned delivery.
    pub async fn deliver(
        &self,
        model_id: &str,
        requests: Vec<PendingRequest>,
        results: Vec<ItemOutcome>,
        duration: Duration,
    ) {
        if results.len() != requests.len() {
            tracing::error!(
                model_id = %model_id,
                expected = requests.len(),
                got = results.len(),
                "Worker returned misaligned results, failing batch"
            );
            self.fail_pending(requests, FailureKind::InternalContractError)
                .await;
            return;
        }

        let duration_ms = duration.as_millis() as u64;
        for (request, item) in requests.into_iter().zip(results) {
            let outcome = match item {
                Ok(mut categories) => {
                    categories.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
                    Ok(Prediction {
                        model_id: model_id.to_string(),
                        categories,
                        duration_ms,
                    })
                }
                Err(message) => Err(FailureKind::Model { message }),
            };
            self.finish(request, outcome).await;
        }
    }

    /// Fail every request with the same terminal kind.
    pub async fn fail_pending(&self, requests: Vec<PendingRequest>, kind: FailureKind) {
        for request in requests {
            self.finish(request, Err(kind.clone())).await;
        }
    }

    /// Fail requests that never left the assembler or ready queue.
    pub async fn fail_queued(&self, requests: Vec<QueuedRequest>, kind: FailureKind) {
        for request in requests {
            self.finish(request.into_pending(), Err(kind.clone())).await;
        }
    }

    /// Write one terminal outcome and release admission capacity.
    pub async fn finish(&self, request: PendingRequest, outcome: Outcome) {
        self.admission.release(&request.client_id).await;

        tracing::debug!(
            request_id = %request.id,
            client_id = %request.client_id,
            queued_ms = request.submitted_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Request finished"
        );

        // The caller may have given up waiting; a dropped receiver is fine.
        let _ = request.response_tx.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdmissionConfig;
    use std::time::Instant;
    use tokio::sync::oneshot;
    use uuid::Uuid;
    use vision_serve_common::Category;

    fn create_router() -> (ResultRouter, Arc<AdmissionController>) {
        let admission = Arc::new(AdmissionController::new(AdmissionConfig::default()));
        (ResultRouter::new(admission.clone()), admission)
    }

    async fn admitted_request(
        admission: &AdmissionController,
    ) -> (PendingRequest, oneshot::Receiver<Outcome>) {
        admission.admit("client-1", 16).await.unwrap();
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let request = PendingRequest {
            id: Uuid::new_v4(),
            client_id: "client-1".to_string(),
            submitted_at: now,
            deadline: now + Duration::from_secs(5),
            response_tx: tx,
        };
        (request, rx)
    }

    #[tokio::test]
    async fn test_deliver_aligned_results() {
        let (router, admission) = create_router();
        let (req_a, rx_a) = admitted_request(&admission).await;
        let (req_b, rx_b) = admitted_request(&admission).await;
        assert_eq!(admission.in_flight().await, 2);

        let results = vec![
            Ok(vec![Category::new("tabby", 0.2), Category::new("beagle", 0.8)]),
            Ok(vec![Category::new("goldfinch", 1.0)]),
        ];
        router
            .deliver("resnet50", vec![req_a, req_b], results, Duration::from_millis(7))
            .await;

        let prediction_a = rx_a.await.unwrap().unwrap();
        assert_eq!(prediction_a.top().unwrap().label, "beagle");
        assert_eq!(prediction_a.duration_ms, 7);

        let prediction_b = rx_b.await.unwrap().unwrap();
        assert_eq!(prediction_b.top().unwrap().label, "goldfinch");

        // Terminal outcomes released the admission counters.
        assert_eq!(admission.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_categories_sorted_descending() {
        let (router, admission) = create_router();
        let (request, rx) = admitted_request(&admission).await;

        let results = vec![Ok(vec![
            Category::new("a", 0.1),
            Category::new("b", 0.6),
            Category::new("c", 0.3),
        ])];
        router
            .deliver("resnet50", vec![request], results, Duration::ZERO)
            .await;

        let prediction = rx.await.unwrap().unwrap();
        let confidences: Vec<f32> = prediction.categories.iter().map(|c| c.confidence).collect();
        assert_eq!(confidences, vec![0.6, 0.3, 0.1]);
    }

    #[tokio::test]
    async fn test_length_mismatch_fails_whole_batch() {
        let (router, admission) = create_router();
        let (req_a, rx_a) = admitted_request(&admission).await;
        let (req_b, rx_b) = admitted_request(&admission).await;

        // Two requests, one result: integrity over availability.
        let results = vec![Ok(vec![Category::new("tabby", 0.9)])];
        router
            .deliver("resnet50", vec![req_a, req_b], results, Duration::ZERO)
            .await;

        assert_eq!(
            rx_a.await.unwrap(),
            Err(FailureKind::InternalContractError)
        );
        assert_eq!(
            rx_b.await.unwrap(),
            Err(FailureKind::InternalContractError)
        );
        assert_eq!(admission.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_per_item_error_passes_through() {
        let (router, admission) = create_router();
        let (req_a, rx_a) = admitted_request(&admission).await;
        let (req_b, rx_b) = admitted_request(&admission).await;

        let results = vec![
            Err("decode error".to_string()),
            Ok(vec![Category::new("tabby", 0.9)]),
        ];
        router
            .deliver("resnet50", vec![req_a, req_b], results, Duration::ZERO)
            .await;

        assert_eq!(
            rx_a.await.unwrap(),
            Err(FailureKind::Model {
                message: "decode error".to_string()
            })
        );
        assert!(rx_b.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_finish_with_dropped_receiver() {
        let (router, admission) = create_router();
        let (request, rx) = admitted_request(&admission).await;
        drop(rx);

        // Must not panic, and must still release capacity.
        router.finish(request, Err(FailureKind::Canceled)).await;
        assert_eq!(admission.in_flight().await, 0);
    }
}
