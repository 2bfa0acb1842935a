//! Error types for the inference pipeline.

use vision_serve_common::RejectReason;

/// Errors surfaced by pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("request rejected: {0}")]
    Rejected(#[from] RejectReason),

    #[error("pipeline is shutting down")]
    ShuttingDown,

    #[error("no model named '{0}' is configured")]
    UnknownModel(String),

    #[error("failed to spawn worker for model '{model_id}': {message}")]
    WorkerSpawn { model_id: String, message: String },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl PipelineError {
    /// The admission reject reason, if this error is a rejection.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            PipelineError::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
