//! Configuration for the inference pipeline.

use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the pipeline.
///
/// All sections have working defaults so tests and embedders can start from
/// `Config::default()` and override what they need.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Models served by this instance and their worker pools.
    #[serde(default)]
    pub models: Vec<ModelPoolConfig>,
}

/// Admission control limits.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Global ceiling on in-flight requests.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Per-client ceiling on in-flight requests.
    #[serde(default = "default_per_client_in_flight")]
    pub per_client_in_flight: usize,
    /// Maximum accepted payload size in bytes.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Per-client sustained request rate in requests/second. Unset disables
    /// rate limiting; in-flight ceilings still apply.
    #[serde(default)]
    pub per_client_rate: Option<u32>,
}

/// Batch assembly thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    /// Default maximum batch size, overridable per model.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,
    /// Maximum time a non-empty batch stays open before sealing.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

/// Dispatch loop and worker supervision timing.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// End-to-end deadline applied to every request.
    #[serde(default = "default_request_deadline_ms")]
    pub request_deadline_ms: u64,
    /// Total latency budget for a batch, measured from when it opened. A
    /// dispatched batch that has not completed by then fails with a worker
    /// timeout.
    #[serde(default = "default_batch_latency_budget_ms")]
    pub batch_latency_budget_ms: u64,
    /// Interval between worker heartbeats while idle.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// An idle worker silent for longer than this is declared dead.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Housekeeping tick of the dispatch loop.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

/// Worker pool configuration for one model.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelPoolConfig {
    /// Model identifier, passed to the model loader.
    pub id: String,
    /// Number of workers to keep alive for this model.
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    /// Per-model batch size override.
    #[serde(default)]
    pub max_batch_size: Option<u32>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            per_client_in_flight: default_per_client_in_flight(),
            max_payload_bytes: default_max_payload_bytes(),
            per_client_rate: None,
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_deadline_ms: default_request_deadline_ms(),
            batch_latency_budget_ms: default_batch_latency_budget_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl BatchingConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

impl DispatchConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    pub fn batch_latency_budget(&self) -> Duration {
        Duration::from_millis(self.batch_latency_budget_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

// Default values
fn default_max_in_flight() -> usize {
    256
}
fn default_per_client_in_flight() -> usize {
    32
}
fn default_max_payload_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_max_batch_size() -> u32 {
    8
}
fn default_max_wait_ms() -> u64 {
    25
}
fn default_request_deadline_ms() -> u64 {
    5_000
}
fn default_batch_latency_budget_ms() -> u64 {
    2_000
}
fn default_heartbeat_interval_ms() -> u64 {
    500
}
fn default_heartbeat_timeout_ms() -> u64 {
    2_000
}
fn default_tick_ms() -> u64 {
    10
}
fn default_replicas() -> usize {
    1
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (PIPELINE__SECTION__KEY format)
    /// 2. pipeline.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .add_source(File::with_name("pipeline").required(false))
            .add_source(
                Environment::with_prefix("PIPELINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Batch size for a model, falling back to the global default.
    pub fn batch_size_for(&self, model_id: &str) -> u32 {
        self.models
            .iter()
            .find(|m| m.id == model_id)
            .and_then(|m| m.max_batch_size)
            .unwrap_or(self.batching.max_batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_admission_config() {
        let admission = AdmissionConfig::default();
        assert_eq!(admission.max_in_flight, 256);
        assert_eq!(admission.per_client_in_flight, 32);
        assert!(admission.per_client_rate.is_none());
    }

    #[test]
    fn test_default_dispatch_timing() {
        let dispatch = DispatchConfig::default();
        assert_eq!(dispatch.tick(), Duration::from_millis(10));
        assert!(dispatch.heartbeat_timeout() > dispatch.heartbeat_interval());
    }

    #[test]
    fn test_batch_size_override() {
        let config = Config {
            models: vec![ModelPoolConfig {
                id: "resnet50".to_string(),
                replicas: 2,
                max_batch_size: Some(16),
            }],
            ..Config::default()
        };

        assert_eq!(config.batch_size_for("resnet50"), 16);
        assert_eq!(config.batch_size_for("mobilenet"), 8);
    }
}
