//! Model abstraction layer.
//!
//! This module defines the `ModelEngine` trait that abstracts loaded
//! inference models (ResNet, EfficientNet, remote endpoints, ...) behind a
//! narrow capability interface. The pipeline never branches on a concrete
//! model type.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use vision_serve_common::Category;

/// One image handed to a model, paired with the request it came from.
#[derive(Debug, Clone)]
pub struct InferenceInput {
    pub request_id: Uuid,
    pub payload: Vec<u8>,
    pub content_type: String,
}

/// Per-item result within a batch.
///
/// Engines that document partial-batch failure return `Err` for the affected
/// items; those errors pass through to the originating requests unchanged.
pub type ItemOutcome = Result<Vec<Category>, String>;

/// Errors from engines and model loading.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model execution failed: {0}")]
    Execution(String),

    #[error("failed to load model: {0}")]
    LoadFailed(String),
}

/// Capability interface for a loaded model.
///
/// `predict` is invoked with at most the configured batch size of inputs and
/// must return one `ItemOutcome` per input, positionally aligned. Returning
/// `Err` fails the whole batch (the model is assumed not to offer
/// partial-batch success unless it reports per-item errors).
#[async_trait]
pub trait ModelEngine: Send + Sync {
    /// Identifier of the loaded model.
    fn model_id(&self) -> &str;

    /// Run inference over a batch of inputs.
    async fn predict(&self, inputs: &[InferenceInput]) -> Result<Vec<ItemOutcome>, EngineError>;

    /// Whether the model is ready to serve (default: yes).
    async fn healthy(&self) -> bool {
        true
    }
}

/// Collaborator that constructs runnable model handles.
///
/// The pipeline treats loading as opaque; implementations may read weights
/// from disk, warm a GPU context, or connect to a remote runtime.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, model_id: &str) -> Result<Arc<dyn ModelEngine>, EngineError>;
}
