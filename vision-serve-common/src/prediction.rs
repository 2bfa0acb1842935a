//! Prediction results and the terminal error taxonomy.

use serde::{Deserialize, Serialize};

/// A single predicted category with its confidence score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub label: String,
    /// Confidence in [0.0, 1.0].
    pub confidence: f32,
}

impl Category {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// Successful classification result for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Model that produced the prediction.
    pub model_id: String,
    /// Ranked categories, sorted descending by confidence.
    pub categories: Vec<Category>,
    /// Wall-clock duration of the batch that produced this result.
    pub duration_ms: u64,
}

impl Prediction {
    /// The highest-confidence category, if any.
    pub fn top(&self) -> Option<&Category> {
        self.categories.first()
    }
}

/// Reasons a request is rejected at admission, before entering the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Global in-flight ceiling reached.
    #[error("rejected: pipeline overloaded")]
    Overloaded,
    /// Per-client in-flight or request-rate limit reached.
    #[error("rejected: client rate limited")]
    RateLimited,
    /// Payload exceeds the configured maximum size.
    #[error("rejected: payload too large")]
    PayloadTooLarge,
}

/// Terminal failure kinds delivered through a request's result sink.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The end-to-end deadline passed before a result was produced.
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    /// The worker running the batch did not complete within its budget.
    #[error("worker timed out")]
    WorkerTimeout,
    /// The worker violated the result contract (e.g., wrong result count).
    #[error("internal contract error")]
    InternalContractError,
    /// The model reported an error for this request.
    #[error("model error: {message}")]
    Model { message: String },
    /// The request was canceled before dispatch, or the pipeline shut down.
    #[error("request canceled")]
    Canceled,
}

/// Exactly one `Outcome` is produced per admitted request.
pub type Outcome = Result<Prediction, FailureKind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prediction_top() {
        let prediction = Prediction {
            model_id: "resnet50".to_string(),
            categories: vec![Category::new("cat", 0.9), Category::new("dog", 0.1)],
            duration_ms: 12,
        };
        assert_eq!(prediction.top().unwrap().label, "cat");
    }

    #[test]
    fn test_prediction_top_empty() {
        let prediction = Prediction {
            model_id: "resnet50".to_string(),
            categories: vec![],
            duration_ms: 0,
        };
        assert!(prediction.top().is_none());
    }

    #[test]
    fn test_reject_reason_serde() {
        let json = serde_json::to_string(&RejectReason::PayloadTooLarge).unwrap();
        assert_eq!(json, "\"payload_too_large\"");
    }

    #[test]
    fn test_failure_kind_serde_roundtrip() {
        let kinds = vec![
            FailureKind::DeadlineExceeded,
            FailureKind::WorkerTimeout,
            FailureKind::InternalContractError,
            FailureKind::Model {
                message: "corrupt tensor".to_string(),
            },
            FailureKind::Canceled,
        ];

        for kind in kinds {
            let json = serde_json::to_string(&kind).unwrap();
            let parsed: FailureKind = serde_json::from_str(&json).unwrap();
            assert_eq!(kind, parsed);
        }
    }

    #[test]
    fn test_failure_kind_display() {
        let kind = FailureKind::Model {
            message: "bad input".to_string(),
        };
        assert_eq!(kind.to_string(), "model error: bad input");
    }
}
